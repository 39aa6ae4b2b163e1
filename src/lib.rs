#![forbid(unsafe_code)]

pub mod acp;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod proxy;
pub mod runs;
pub mod sandbox;
pub mod sweep;
pub mod tunnel;
pub mod validate;

pub use config::ProxyConfig;
pub use errors::{AppError, Result};
