pub mod config;
pub mod corpus;
pub mod error;
pub mod fsutil;
pub mod registry;
pub mod tokens;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
