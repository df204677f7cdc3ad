pub mod cli;
pub mod error;
pub mod fsutils;
pub mod prompt;
pub mod setup;
