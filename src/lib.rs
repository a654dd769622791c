pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod ratelimit;
pub mod reclaimer;
pub mod service;
pub mod shutdown;
pub mod store;

pub use error::{Error, Result};
