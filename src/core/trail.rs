//! Call-path snapshots.
//!
//! A [`Trail`] records where execution is at the moment something happens:
//! which runbook, which step, which hook or loop iteration. Trails are never
//! mutated; each level derives its own from its parent's with [`Trail::with`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// One level of the call path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Runbook { id: String, path: String, desc: String },
    Step { index: usize, key: String, desc: String },
    BeforeFunc { index: usize },
    AfterFunc { index: usize },
    Loop { iteration: usize },
}

/// An ordered, append-only list of frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trail(Arc<[Frame]>);

impl Trail {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new trail with `frame` appended. `self` is left untouched.
    pub fn with(&self, frame: Frame) -> Self {
        let mut frames = self.0.to_vec();
        frames.push(frame);
        Self(frames.into())
    }

    pub fn frames(&self) -> &[Frame] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&Frame> {
        self.0.last()
    }

    /// Canonical key for profiling spans and result correlation.
    ///
    /// The root runbook's ID followed by `?step=N&step=M` for every step frame
    /// from the outermost inwards.
    pub fn runbook_id(&self) -> String {
        let mut root = None;
        let mut steps = Vec::new();
        for frame in self.0.iter() {
            match frame {
                Frame::Runbook { id, .. } if root.is_none() => root = Some(id.as_str()),
                Frame::Step { index, .. } => steps.push(format!("step={index}")),
                _ => {}
            }
        }

        let root = root.unwrap_or_default();
        if steps.is_empty() {
            root.to_string()
        } else {
            format!("{root}?{}", steps.join("&"))
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runbook { path, desc, .. } if desc.is_empty() => write!(f, "{path}"),
            Self::Runbook { path, desc, .. } => write!(f, "{path} ({desc})"),
            Self::Step { key, .. } => write!(f, "steps[{key}]"),
            Self::BeforeFunc { index } => write!(f, "before[{index}]"),
            Self::AfterFunc { index } => write!(f, "after[{index}]"),
            Self::Loop { iteration } => write!(f, "loop[{iteration}]"),
        }
    }
}

impl fmt::Display for Trail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" > ")?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}
