pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod postgres;
pub mod stream;

pub use config::Config;
pub use error::{Error, Result};
