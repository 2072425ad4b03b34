pub mod config;
pub mod roles;
pub mod services;

pub use config::*;
pub use roles::*;
pub use services::*;
