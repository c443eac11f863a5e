//! Runbook execution engine.
//!
//! Runbooks are YAML files describing ordered steps. An [`Operator`] runs one
//! runbook; an [`OperatorSet`] selects and schedules many of them, resolving
//! `needs` between them and collecting their results.

mod capture;
mod dispatch;
mod engine;
mod eval;
mod exec;
mod looping;
mod needs;
mod operator;
mod parser;
mod profile;
mod result;
mod runner;
mod schema;
mod set;
mod step;
mod store;

pub use capture::{Capturer, Capturers, LogCapturer};
pub use engine::{Engine, EngineBuilder, Hook, Session};
pub use eval::{truthy, EvalResult, Evaluator, SimpleEvaluator, TraceNode};
pub use exec::ExecRunner;
pub use looping::{Count, Loop, LoopDef, LoopSpec};
pub use needs::{resolve_needs, WaitMap, MAX_NEEDS_DEPTH};
pub use operator::{Operator, OperatorHandle};
pub use parser::{
    discover_books, expand_paths, parse_book_str, resolve_relative, BookLoader, FsLoader,
    MemoryLoader, ParseOptions,
};
pub use profile::{Profile, Profiler, SpanKind, SpanNode};
pub use result::{Outcome, RunNResult, RunResult, StepResult};
pub use runner::{RunContext, Runner, RunnerFactory, RunnerKind, RunnerSpec, Runners};
pub use schema::{Book, RunbookDef};
pub use set::{Entry, OperatorSet};
pub use step::{DumpSpec, ExecRequest, IncludeSpec, RunnerBinding, Step, StepDef};
pub use store::{Record, Store, RESERVED_KEYS};
