//! Span profiling keyed by trails.
//!
//! Every runbook, step, hook and loop iteration records a span under its
//! trail. [`Profiler::tree`] folds the spans into a tree whose node IDs are
//! [`Trail::runbook_id`] values, which is how results get their elapsed time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::duration::serialize_millis;
use crate::core::{Frame, Result, Trail};

/// An open span. Hand it back to [`Profiler::stop`].
#[derive(Debug)]
pub struct Span {
    trail: Trail,
    started: Instant,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SpanRecord {
    trail: Trail,
    started_at: DateTime<Utc>,
    elapsed: Duration,
}

/// Collects spans from concurrently running operators.
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    records: Arc<Mutex<Vec<SpanRecord>>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, trail: &Trail) -> Span {
        Span { trail: trail.clone(), started: Instant::now(), started_at: Utc::now() }
    }

    pub fn stop(&self, span: Span) -> Duration {
        let elapsed = span.started.elapsed();
        self.records.lock().push(SpanRecord {
            trail: span.trail,
            started_at: span.started_at,
            elapsed,
        });
        elapsed
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn tree(&self) -> Profile {
        let mut records = self.records.lock().clone();
        records.sort_by_key(|r| r.trail.frames().len());

        let mut profile = Profile::default();
        for record in &records {
            insert(&mut profile.spans, record.trail.frames(), &Trail::new(), record);
        }
        profile
    }

    /// Write the span tree as pretty JSON.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.tree())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "Wrote profile");
        Ok(())
    }
}

fn insert(nodes: &mut Vec<SpanNode>, frames: &[Frame], prefix: &Trail, record: &SpanRecord) {
    let Some((first, rest)) = frames.split_first() else {
        return;
    };
    let prefix = prefix.with(first.clone());
    let pos = match nodes.iter().position(|n| &n.frame == first) {
        Some(pos) => pos,
        None => {
            nodes.push(SpanNode {
                id: prefix.runbook_id(),
                frame: first.clone(),
                started_at: None,
                elapsed: Duration::ZERO,
                children: Vec::new(),
            });
            nodes.len() - 1
        }
    };

    let node = &mut nodes[pos];
    if rest.is_empty() {
        node.started_at = Some(record.started_at);
        node.elapsed = record.elapsed;
    } else {
        insert(&mut node.children, rest, &prefix, record);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    Runbook,
    Step,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    pub id: String,
    pub frame: Frame,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SpanNode>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Profile {
    pub spans: Vec<SpanNode>,
}

impl Profile {
    /// Elapsed time of every runbook and step span, by kind and trail ID.
    pub fn elapsed_index(&self) -> HashMap<(SpanKind, String), Duration> {
        fn walk(nodes: &[SpanNode], out: &mut HashMap<(SpanKind, String), Duration>) {
            for node in nodes {
                let kind = match node.frame {
                    Frame::Runbook { .. } => Some(SpanKind::Runbook),
                    Frame::Step { .. } => Some(SpanKind::Step),
                    _ => None,
                };
                if let Some(kind) = kind {
                    out.insert((kind, node.id.clone()), node.elapsed);
                }
                walk(&node.children, out);
            }
        }

        let mut out = HashMap::new();
        walk(&self.spans, &mut out);
        out
    }
}
