#![allow(clippy::needless_collect)]
#![allow(clippy::format_push_string)]
#![allow(clippy::unused_self)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]

//! # Stepbook
//!
//! Runbook-driven automation and scenario testing.
//!
//! A runbook is a YAML file of ordered steps. Each step calls one runner
//! (a shell command, another runbook, or a runner you register) and may
//! assert on the result with `test`. Stepbook runs runbooks with retries,
//! deferred cleanup steps, cross-runbook `needs`, bounded concurrency and
//! deterministic IDs, and collects everything into a result tree.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run every runbook under a directory
//! stepbook run books/
//!
//! # Four at a time, stopping admission on the first failure
//! stepbook run books/ --concurrent 4 --fail-fast
//!
//! # Show IDs
//! stepbook list books/
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::future_not_send)]

pub mod core;
pub mod runbook;

// Re-export commonly used types
pub use core::{Config, Error, Errors, Result};
pub use runbook::{Engine, Operator, OperatorSet, RunNResult, RunResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "stepbook";
