//! Runner contract.
//!
//! A runner performs a step's main action (an HTTP call, a query, a shell
//! command...) and returns the record the engine stores at the step's index.
//! Protocol runners are supplied by the embedding application, either
//! registered by name or built from runbook `runners:` definitions through a
//! [`RunnerFactory`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::store::Record;
use crate::core::Trail;

/// Known runner kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Http,
    Grpc,
    Db,
    Ssh,
    Cdp,
    Exec,
    Include,
    Definition,
}

impl RunnerKind {
    /// Guess the kind from a DSN scheme.
    pub fn from_scheme(dsn: &str) -> Option<Self> {
        let scheme = dsn.split_once("://").map(|(s, _)| s)?.to_ascii_lowercase();
        match scheme.as_str() {
            "http" | "https" => Some(Self::Http),
            "grpc" | "grpcs" => Some(Self::Grpc),
            "postgres" | "postgresql" | "pg" | "mysql" | "sqlite" | "sqlite3" | "sqlserver" | "spanner" => {
                Some(Self::Db)
            }
            "ssh" => Some(Self::Ssh),
            "cdp" | "chrome" => Some(Self::Cdp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
            Self::Db => "db",
            Self::Ssh => "ssh",
            Self::Cdp => "cdp",
            Self::Exec => "exec",
            Self::Include => "include",
            Self::Definition => "runners",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runner definition from a runbook's `runners:` section.
///
/// Either a DSN (`https://api.example.com`) whose scheme picks the kind, or a
/// map with an explicit `kind` and kind-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunnerSpec {
    Dsn(String),
    Config(Map<String, Value>),
}

impl RunnerSpec {
    pub fn kind(&self) -> Option<RunnerKind> {
        match self {
            Self::Dsn(dsn) => RunnerKind::from_scheme(dsn),
            Self::Config(map) => map
                .get("kind")
                .cloned()
                .and_then(|k| serde_json::from_value(k).ok())
                .or_else(|| map.get("dsn").and_then(Value::as_str).and_then(RunnerKind::from_scheme)),
        }
    }
}

/// What a runner can see while it runs.
#[derive(Debug)]
pub struct RunContext<'a> {
    /// Cancelled when the run is aborted; long calls should return promptly.
    pub cancel: &'a CancellationToken,
    /// Where the step sits in the run.
    pub trail: &'a Trail,
    /// Snapshot of the store, for runners that template their requests.
    pub store: &'a Value,
}

/// A step's main action.
#[async_trait]
pub trait Runner: Send + Sync + fmt::Debug {
    fn kind(&self) -> RunnerKind;

    /// Perform the request. The returned record is stored at the step's index.
    async fn run(&self, cx: &RunContext<'_>, request: &Value) -> anyhow::Result<Record>;

    /// Release long-lived resources (sessions, connections).
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds runners of one kind from runbook definitions.
pub trait RunnerFactory: Send + Sync + fmt::Debug {
    fn kind(&self) -> RunnerKind;

    fn build(&self, name: &str, spec: &RunnerSpec) -> anyhow::Result<Arc<dyn Runner>>;
}

/// Named runners visible to a runbook.
#[derive(Debug, Clone, Default)]
pub struct Runners {
    by_name: HashMap<String, Arc<dyn Runner>>,
}

impl Runners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, runner: Arc<dyn Runner>) {
        self.by_name.insert(name.into(), runner);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Runner>> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Runner>)> {
        self.by_name.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_from_scheme() {
        assert_eq!(RunnerKind::from_scheme("https://example.com"), Some(RunnerKind::Http));
        assert_eq!(RunnerKind::from_scheme("grpc://localhost:50051"), Some(RunnerKind::Grpc));
        assert_eq!(RunnerKind::from_scheme("postgres://u@h/db"), Some(RunnerKind::Db));
        assert_eq!(RunnerKind::from_scheme("ssh://host"), Some(RunnerKind::Ssh));
        assert_eq!(RunnerKind::from_scheme("not a dsn"), None);
    }

    #[test]
    fn test_spec_kind() {
        let spec: RunnerSpec = serde_json::from_value(json!("https://api.example.com")).unwrap();
        assert_eq!(spec.kind(), Some(RunnerKind::Http));

        let spec: RunnerSpec = serde_json::from_value(json!({"kind": "ssh", "host": "h"})).unwrap();
        assert_eq!(spec.kind(), Some(RunnerKind::Ssh));

        let spec: RunnerSpec = serde_json::from_value(json!({"dsn": "mysql://x"})).unwrap();
        assert_eq!(spec.kind(), Some(RunnerKind::Db));
    }
}
