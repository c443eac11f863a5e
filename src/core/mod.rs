//! Core types shared by the engine.
//!
//! Leaf infrastructure with no knowledge of runbooks: configuration, errors,
//! identity, trails, retry/backoff, the concurrency limiter and the shared KV.

pub mod config;
pub mod duration;
mod error;
pub mod identity;
mod kv;
pub mod parallel;
pub mod retry;
mod trail;

pub use config::{Config, ProfileConfig, RunConfig, Scopes, SelectConfig, Shard};
pub use error::{Error, Errors, Result};
pub use identity::{generate_ids_using_path, hash_id};
pub use kv::Kv;
pub use parallel::GroupLimiter;
pub use retry::{Backoff, BackoffConfig, Clock, ManualClock, Strategy, TokioClock};
pub use trail::{Frame, Trail};
