pub mod config;
pub mod error;
pub mod ids;

pub use config::Config;
pub use error::*;
pub use ids::*;
