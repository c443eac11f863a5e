//! Engine error types.
//!
//! Every failure the engine reports is an [`Error`]. Failures that must be
//! reported together (all failed steps of a run, all failed runbooks of a
//! set) are collected into [`Errors`] instead of keeping only the first.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading or running runbooks.
#[derive(Debug, Error)]
pub enum Error {
    /// Intentionally not executed. Never reported as a failure.
    #[error("skipped")]
    Skipped,

    /// Stop admitting new runbooks. Only user-visible when nothing else failed.
    #[error("fail fast")]
    FailFast,

    /// A step failed.
    #[error("{name} failed: {source}")]
    Step {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// A runner returned an error.
    #[error("{0:#}")]
    Runner(anyhow::Error),

    /// A before hook failed.
    #[error("before func {index} failed: {source:#}")]
    BeforeFunc { index: usize, source: anyhow::Error },

    /// An after hook failed.
    #[error("after func {index} failed: {source:#}")]
    AfterFunc { index: usize, source: anyhow::Error },

    /// The loop body failed, aborting the loop.
    #[error("loop failed: {0}")]
    LoopAborted(Box<Error>),

    /// The loop ran out of attempts before its condition held.
    #[error("loop failed after {attempts} attempts: until `{until}` not satisfied\n{trace}")]
    LoopExhausted { attempts: usize, until: String, trace: String },

    /// A `test` condition evaluated to false.
    #[error("test failed: `{cond}`\n{trace}")]
    TestFailed { cond: String, trace: String },

    /// A step has no runner configured.
    #[error("invalid runner: step {0} has no runner, dump, bind or test")]
    InvalidRunner(String),

    /// A step refers to a runner nobody defined.
    #[error("unknown runner '{0}'")]
    UnknownRunner(String),

    /// Needs nesting went deeper than allowed.
    #[error("max needs depth ({max}) exceeded at {path}")]
    NeedsDepth { max: usize, path: PathBuf },

    /// A needs alias points nowhere.
    #[error("unresolved needs '{alias}' -> {target}")]
    UnresolvedNeed { alias: String, target: String },

    /// An ID filter matched more than one runbook, or IDs could not be disambiguated.
    #[error("ambiguous runbook id '{0}'")]
    AmbiguousId(String),

    /// The caller cancelled while waiting.
    #[error("cancelled")]
    Cancelled,

    /// Detached work did not finish in time.
    #[error("timed out after {0:?} waiting for runners to close")]
    WaitTimeout(std::time::Duration),

    /// A step result was recorded twice for one attempt.
    #[error("result of step {0} already recorded")]
    DuplicateResult(String),

    /// Expression evaluation failed.
    #[error("eval `{expr}`: {message}")]
    Eval { expr: String, message: String },

    /// Runbook could not be parsed or validated.
    #[error("invalid runbook {path}: {message}")]
    Book { path: PathBuf, message: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Scope does not allow the operation.
    #[error("scope '{0}' is not allowed")]
    ScopeDenied(&'static str),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Several errors at once.
    #[error("{0}")]
    Multiple(Errors),
}

impl Error {
    /// Whether this is the skip sentinel.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// Whether this error is, or contains, the fail-fast sentinel.
    pub fn is_fail_fast(&self) -> bool {
        match self {
            Self::FailFast => true,
            Self::Multiple(errs) => errs.iter().any(Self::is_fail_fast),
            _ => false,
        }
    }

    /// Wrap a runner error with the step name.
    pub fn step(name: impl Into<String>, source: Error) -> Self {
        Self::Step { name: name.into(), source: Box::new(source) }
    }

    pub fn eval(expr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Eval { expr: expr.into(), message: message.into() }
    }

    pub fn book(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Book { path: path.into(), message: message.into() }
    }
}

/// An ordered collection of errors.
///
/// Iteration order is insertion order.
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error. Skips are dropped and nested aggregates are flattened.
    pub fn push(&mut self, err: Error) {
        match err {
            Error::Skipped => {}
            Error::Multiple(inner) => self.0.extend(inner.0),
            other => self.0.push(other),
        }
    }

    pub fn extend(&mut self, errs: impl IntoIterator<Item = Error>) {
        for err in errs {
            self.push(err);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }

    /// Whether any collected error is the fail-fast sentinel.
    pub fn has_fail_fast(&self) -> bool {
        self.0.iter().any(Error::is_fail_fast)
    }

    /// Drop the fail-fast sentinel unless it is the only thing left.
    pub fn without_fail_fast(self) -> Self {
        if self.0.iter().all(Error::is_fail_fast) {
            return self;
        }
        Self(self.0.into_iter().filter(|e| !matches!(e, Error::FailFast)).collect())
    }

    /// `Ok(())` when empty, the single error when there is one, otherwise
    /// [`Error::Multiple`].
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl IntoIterator for Errors {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Error> for Errors {
    fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
        let mut errs = Self::new();
        errs.extend(iter);
        errs
    }
}
