pub mod config;
pub mod descriptor;
pub mod error;
pub mod sql;

pub use config::{PoolSettings, Settings};
pub use descriptor::*;
pub use error::*;
