pub mod replay;
pub mod token;

pub use token::TokenAuthority;
