pub mod buffer;
pub mod clock;
pub mod config;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod error;
pub mod output;
pub mod platform;
