pub mod agent;
pub mod detector;
pub mod load;
pub mod scheduler;
