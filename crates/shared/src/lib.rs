pub mod models;
pub mod error;
pub mod config;

pub use models::*;
pub use error::*;
pub use config::*;
