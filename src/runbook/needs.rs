//! Cross-runbook dependencies.
//!
//! [`resolve_needs`] orders a runbook after everything it needs.
//! [`WaitMap`] carries each needed runbook's exported variables to its
//! dependents: every slot is published once, and readers may arrive before or
//! after that.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::{Error, Result};

pub const MAX_NEEDS_DEPTH: usize = 10;

/// Dependencies of `root` first, then `root`, each path once.
///
/// `needs_of` returns the direct needs of a runbook.
pub fn resolve_needs<F>(root: &Path, mut needs_of: F) -> Result<Vec<PathBuf>>
where
    F: FnMut(&Path) -> Result<Vec<PathBuf>>,
{
    let mut order = Vec::new();
    visit(root, 0, &mut needs_of, &mut order)?;
    Ok(order)
}

fn visit<F>(path: &Path, depth: usize, needs_of: &mut F, order: &mut Vec<PathBuf>) -> Result<()>
where
    F: FnMut(&Path) -> Result<Vec<PathBuf>>,
{
    if depth > MAX_NEEDS_DEPTH {
        return Err(Error::NeedsDepth { max: MAX_NEEDS_DEPTH, path: path.to_path_buf() });
    }
    if order.iter().any(|p| p == path) {
        return Ok(());
    }
    for dep in needs_of(path)? {
        visit(&dep, depth + 1, needs_of, order)?;
    }
    if !order.iter().any(|p| p == path) {
        order.push(path.to_path_buf());
    }
    Ok(())
}

/// Publish-once slots keyed by runbook path.
#[derive(Debug, Default)]
pub struct WaitMap {
    slots: Mutex<HashMap<PathBuf, watch::Sender<Option<Value>>>>,
}

impl WaitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for a runbook that is scheduled to run.
    pub fn register(&self, path: &Path) {
        self.slots.lock().entry(path.to_path_buf()).or_insert_with(|| watch::channel(None).0);
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.slots.lock().contains_key(path)
    }

    /// Publish `value` for `path`. Returns `false` if the slot was already
    /// published or was never registered.
    pub fn publish(&self, path: &Path, value: Value) -> bool {
        let slots = self.slots.lock();
        let Some(tx) = slots.get(path) else {
            return false;
        };
        tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_published(&self, path: &Path) -> bool {
        self.slots.lock().get(path).is_some_and(|tx| tx.borrow().is_some())
    }

    /// Wait until `path` is published or `cancel` fires.
    pub async fn wait(&self, alias: &str, path: &Path, cancel: &CancellationToken) -> Result<Value> {
        let mut rx = {
            let slots = self.slots.lock();
            match slots.get(path) {
                Some(tx) => tx.subscribe(),
                None => {
                    return Err(Error::UnresolvedNeed {
                        alias: alias.to_string(),
                        target: path.display().to_string(),
                    })
                }
            }
        };

        tokio::select! {
            res = rx.wait_for(Option::is_some) => {
                res.map(|v| v.clone().unwrap_or(Value::Null)).map_err(|_| Error::Cancelled)
            }
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn graph(edges: &[(&str, &[&str])]) -> impl FnMut(&Path) -> Result<Vec<PathBuf>> {
        let map: HashMap<PathBuf, Vec<PathBuf>> = edges
            .iter()
            .map(|(k, v)| (PathBuf::from(k), v.iter().map(PathBuf::from).collect()))
            .collect();
        move |p: &Path| Ok(map.get(p).cloned().unwrap_or_default())
    }

    #[test]
    fn test_chain_resolves_dependencies_first() {
        let order = resolve_needs(Path::new("a"), graph(&[("a", &["b"]), ("b", &["c"])])).unwrap();
        assert_eq!(order, vec![PathBuf::from("c"), PathBuf::from("b"), PathBuf::from("a")]);
    }

    #[test]
    fn test_diamond_is_deduplicated() {
        let order = resolve_needs(
            Path::new("a"),
            graph(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"])]),
        )
        .unwrap();
        assert_eq!(
            order,
            ["d", "b", "c", "a"].iter().map(PathBuf::from).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_cycle_hits_depth_limit() {
        let err = resolve_needs(Path::new("a"), graph(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        assert!(matches!(err, Error::NeedsDepth { max: MAX_NEEDS_DEPTH, .. }));
    }

    #[tokio::test]
    async fn test_late_reader_sees_value() {
        let waits = WaitMap::new();
        let path = Path::new("/b.yml");
        waits.register(path);
        assert!(waits.publish(path, json!({"token": "t"})));
        assert!(!waits.publish(path, json!({"token": "other"})));

        let value = waits.wait("b", path, &CancellationToken::new()).await.unwrap();
        assert_eq!(value, json!({"token": "t"}));
    }

    #[tokio::test]
    async fn test_early_reader_blocks_until_publish() {
        let waits = Arc::new(WaitMap::new());
        let path = PathBuf::from("/b.yml");
        waits.register(&path);

        let reader = {
            let waits = waits.clone();
            let path = path.clone();
            tokio::spawn(async move { waits.wait("b", &path, &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        assert!(!waits.is_published(&path));
        waits.publish(&path, json!(1));
        assert_eq!(reader.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_wait_cancelled_and_unregistered() {
        let waits = WaitMap::new();
        let cancel = CancellationToken::new();
        assert!(matches!(
            waits.wait("x", Path::new("/x.yml"), &cancel).await,
            Err(Error::UnresolvedNeed { .. })
        ));

        waits.register(Path::new("/x.yml"));
        cancel.cancel();
        assert!(matches!(waits.wait("x", Path::new("/x.yml"), &cancel).await, Err(Error::Cancelled)));
    }
}
