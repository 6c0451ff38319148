pub mod config;
pub mod error;
pub mod text;
pub mod types;

pub use config::CrawlerConfig;
pub use error::ChekError;
pub use types::*;
