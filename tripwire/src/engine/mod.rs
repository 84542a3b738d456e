pub mod corroborate;
pub mod dispatcher;
pub mod processor;
pub mod resources;
pub mod severity;
