//! Core building blocks for the hearth application server runtime:
//! listener abstraction, worker-pool orchestration, deployment scanning,
//! host inspection and the tagged storage used for runtime caching.

mod error;
pub use error::{AnyError, AnyResult};

pub mod config;
pub mod listener;
pub mod orchestrator;
pub mod scanner;
pub mod storage;
pub mod system;
pub mod util;
