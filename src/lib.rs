//! Benchmark orchestration: start a server under test, drive external (or
//! in-process) load generators against it, collect and compare results.

pub mod cancel;
pub mod commands;
pub mod compare;
pub mod config;
pub mod error;
pub mod load;
pub mod manifest;
pub mod requests;
pub mod runner;
pub mod utils;

pub use cancel::CancelSignal;
pub use error::{ExpfError, Result};
