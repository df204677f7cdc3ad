pub mod common;
pub mod environment;
pub mod experiment;

pub type Error = crate::common::error::GridError;
pub type Result<T> = std::result::Result<T, Error>;

pub const GRIDSTEP_VERSION: &str = env!("CARGO_PKG_VERSION");
