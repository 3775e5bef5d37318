//! fileforge: an asynchronous file conversion service.
//!
//! Clients upload an input, submit a conversion and poll its job until the
//! outputs can be downloaded. Submission is rate limited per client, work
//! runs on a bounded set of supervised background tasks, and every artifact
//! is deleted on a timer whether or not its job succeeded.

pub mod admission;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod panic_hook;
pub mod services;
pub mod storage;
pub mod sweeper;
pub mod utils;

pub use error::{Error, Result};
