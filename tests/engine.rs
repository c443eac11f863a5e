//! Engine scenarios run through the public API.
//!
//! Runbooks are served from memory and steps call a probe runner that logs
//! every call, so ordering and skip behaviour can be asserted exactly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use stepbook::core::{Error, ManualClock, Shard};
use stepbook::runbook::{
    Engine, EngineBuilder, Entry, Hook, MemoryLoader, OperatorSet, Outcome, ParseOptions, Record,
    RunContext, RunResult, Runner, RunnerKind,
};
use stepbook::Config;

/// Logs `name` from each request; fails when the request says `fail: true`.
#[derive(Debug, Default)]
struct Probe {
    log: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl Probe {
    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for Probe {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Exec
    }

    async fn run(&self, _cx: &RunContext<'_>, request: &Value) -> anyhow::Result<Record> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let name = request.get("name").and_then(Value::as_str).unwrap_or("").to_string();
        self.log.lock().push(name.clone());
        if request.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            anyhow::bail!("boom from {name}");
        }
        let mut record = Record::new();
        record.insert("name".into(), json!(name));
        record.insert("n".into(), json!(n));
        Ok(record)
    }
}

/// Tracks how many calls overlap.
#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Runner for Gauge {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Exec
    }

    async fn run(&self, _cx: &RunContext<'_>, _request: &Value) -> anyhow::Result<Record> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Record::new())
    }
}

/// Takes far too long to close.
#[derive(Debug)]
struct SlowClose;

#[async_trait]
impl Runner for SlowClose {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Exec
    }

    async fn run(&self, _cx: &RunContext<'_>, _request: &Value) -> anyhow::Result<Record> {
        Ok(Record::new())
    }

    async fn close(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    }
}

/// Fails its first `failures` calls, then succeeds.
#[derive(Debug)]
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Runner for Flaky {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Exec
    }

    async fn run(&self, _cx: &RunContext<'_>, _request: &Value) -> anyhow::Result<Record> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            anyhow::bail!("not ready (call {})", n + 1);
        }
        Ok(Record::new())
    }
}

struct Harness {
    loader: Arc<MemoryLoader>,
    probe: Arc<Probe>,
    clock: Arc<ManualClock>,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        Self {
            loader: Arc::new(MemoryLoader::new(ParseOptions::default())),
            probe: Arc::new(Probe::default()),
            clock: Arc::new(ManualClock::new()),
            config: Config::default(),
        }
    }

    fn book(self, path: &str, yaml: &str) -> Self {
        self.loader.insert(path, yaml);
        self
    }

    fn engine(&self) -> Arc<Engine> {
        self.engine_with(Vec::new())
    }

    fn builder(&self) -> EngineBuilder {
        Engine::builder(self.config.clone())
            .loader(self.loader.clone())
            .clock(self.clock.clone())
            .runner("probe", self.probe.clone())
    }

    fn engine_with(&self, extra: Vec<(&str, Arc<dyn Runner>)>) -> Arc<Engine> {
        let mut builder = self.builder();
        for (name, runner) in extra {
            builder = builder.runner(name, runner);
        }
        builder.build()
    }
}

fn paths(ps: &[&str]) -> Vec<PathBuf> {
    ps.iter().map(PathBuf::from).collect()
}

fn stems(entries: &[Entry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.book.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default())
        .collect()
}

/// Six books `a`..`f` under `/sel`, labelled for selection tests.
fn selection_harness() -> (Harness, Vec<PathBuf>) {
    let labels = [
        ("a", "[smoke]"),
        ("b", "[smoke, slow]"),
        ("c", "[]"),
        ("d", "[smoke]"),
        ("e", "[slow]"),
        ("f", "[]"),
    ];
    let mut h = Harness::new();
    let mut books = Vec::new();
    for (name, labels) in labels {
        let path = format!("/sel/{name}.yml");
        h = h.book(&path, &format!("labels: {labels}\nsteps:\n  - probe: {{ name: {name} }}\n"));
        books.push(PathBuf::from(path));
    }
    (h, books)
}

fn outcomes(result: &RunResult) -> Vec<Outcome> {
    result.steps.iter().map(|s| s.outcome).collect()
}

#[tokio::test]
async fn test_deferred_steps_run_last_in_reverse_order() {
    let h = Harness::new()
        .book(
            "/books/main.yml",
            r#"
steps:
  - probe: { name: s1 }
  - include: child.yml
  - probe: { name: s3 }
  - probe: { name: s4, fail: true }
  - probe: { name: s5 }
  - defer: true
    probe: { name: a }
  - defer: true
    probe: { name: b, fail: true }
  - defer: true
    probe: { name: c }
"#,
        )
        .book(
            "/books/child.yml",
            r#"
steps:
  - probe: { name: child }
  - defer: true
    probe: { name: child-deferred }
"#,
        );

    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/main.yml"])).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("boom from s4"));
    assert!(err.to_string().contains("boom from b"));

    assert_eq!(h.probe.log(), vec!["s1", "child", "s3", "s4", "c", "b", "a"]);

    let result = &set.results()[0].results[0];
    assert_eq!(
        outcomes(result),
        vec![
            Outcome::Success,
            Outcome::Success,
            Outcome::Success,
            Outcome::Failure,
            Outcome::Skipped,
            Outcome::Success,
            Outcome::Failure,
            Outcome::Success,
        ]
    );

    let included = &result.steps[1].included;
    assert_eq!(included.len(), 1);
    assert!(included[0].included);
    assert_eq!(included[0].id, format!("{}?step=1", result.id));
    assert_eq!(included[0].steps[0].id, format!("{}?step=1&step=0", result.id));
}

#[tokio::test]
async fn test_force_runs_step_after_failure() {
    let yaml = |force: bool| {
        format!(
            r#"
steps:
  - probe: {{ name: first, fail: true }}
  - probe: {{ name: second }}
    force: {force}
"#
        )
    };

    let h = Harness::new().book("/books/a.yml", &yaml(false));
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    assert!(set.run(&CancellationToken::new()).await.is_err());
    assert_eq!(h.probe.log(), vec!["first"]);
    assert_eq!(outcomes(&set.results()[0].results[0]), vec![Outcome::Failure, Outcome::Skipped]);

    let h = Harness::new().book("/books/a.yml", &yaml(true));
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    assert!(set.run(&CancellationToken::new()).await.is_err());
    assert_eq!(h.probe.log(), vec!["first", "second"]);
    assert_eq!(outcomes(&set.results()[0].results[0]), vec![Outcome::Failure, Outcome::Success]);
}

#[tokio::test]
async fn test_false_condition_skips_step() {
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
vars:
  enabled: false
steps:
  - probe: { name: gated }
    if: vars.enabled
  - probe: { name: always }
"#,
    );
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.probe.log(), vec!["always"]);
    assert_eq!(outcomes(&set.results()[0].results[0]), vec![Outcome::Skipped, Outcome::Success]);
}

#[tokio::test]
async fn test_needs_run_first_and_export_vars() {
    let h = Harness::new()
        .book(
            "/books/a.yml",
            r#"
needs:
  b: b.yml
steps:
  - test: needs.b.token == "abc" && needs.b.user == "alice"
"#,
        )
        .book(
            "/books/b.yml",
            r#"
vars:
  token: abc
steps:
  - probe: { name: b }
    bind:
      user: '"alice"'
"#,
        );

    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();

    let results = &set.results()[0].results;
    assert_eq!(results.len(), 2);
    assert!(results[0].path.ends_with("b.yml"));
    assert!(results[1].path.ends_with("a.yml"));
    assert!(results.iter().all(|r| r.outcome() == Outcome::Success));
}

#[tokio::test]
async fn test_fail_fast_stops_admission() {
    let mut h = Harness::new();
    let mut books = Vec::new();
    for i in 0..6 {
        let path = format!("/books/f{i}.yml");
        h = h.book(&path, &format!("steps:\n  - probe: {{ name: f{i}, fail: true }}\n"));
        books.push(path);
    }
    h.config.run.concurrency = 2;
    h.config.run.fail_fast = true;

    let refs: Vec<&str> = books.iter().map(String::as_str).collect();
    let mut set = OperatorSet::load(h.engine(), &paths(&refs)).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err();

    assert!(!matches!(err, Error::FailFast));
    assert!(err.to_string().contains("boom"));
    assert!(h.probe.calls() < 6, "started {} of 6", h.probe.calls());

    let run = &set.results()[0];
    assert_eq!(run.total(), 6);
    assert!(run.skipped() > 0);
    assert_eq!(run.failed(), h.probe.calls());
}

#[tokio::test]
async fn test_step_loop_aborts_on_first_error() {
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
steps:
  - probe: { name: once, fail: true }
    loop: 3
"#,
    );
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("loop failed"));
    assert_eq!(h.probe.calls(), 1);
}

#[tokio::test]
async fn test_step_loop_retries_until_condition() {
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
steps:
  - probe: { name: poll }
    loop:
      count: 5
      until: current.n >= 3
      interval: 2s
"#,
    );
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.probe.calls(), 3);
    assert_eq!(h.clock.sleeps(), vec![std::time::Duration::from_secs(2); 2]);
}

#[tokio::test]
async fn test_step_loop_exhaustion_reports_trace() {
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
steps:
  - probe: { name: poll }
    loop:
      count: 2
      until: current.n > 10
"#,
    );
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err().to_string();
    assert!(err.contains("after 2 attempts"), "{err}");
    assert!(err.contains("current.n"), "{err}");
    assert_eq!(h.probe.calls(), 2);
}

#[tokio::test]
async fn test_root_loop_polls_until_success() {
    let flaky = Arc::new(Flaky { failures: 2, calls: AtomicUsize::new(0) });
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
loop:
  count: 5
  until: outcome == "success"
steps:
  - flaky: {}
"#,
    );
    let engine = h.engine_with(vec![("flaky", flaky.clone() as Arc<dyn Runner>)]);
    let mut set = OperatorSet::load(engine, &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();

    let calls = flaky.calls.load(Ordering::SeqCst);
    assert_eq!(calls, 3);
    assert!(calls <= 5);
    assert_eq!(set.results()[0].results[0].outcome(), Outcome::Success);
}

#[tokio::test]
async fn test_root_loop_without_until_fails_if_any_iteration_failed() {
    let flaky = Arc::new(Flaky { failures: 1, calls: AtomicUsize::new(0) });
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
loop: 3
steps:
  - flaky: {}
"#,
    );
    let engine = h.engine_with(vec![("flaky", flaky.clone() as Arc<dyn Runner>)]);
    let mut set = OperatorSet::load(engine, &paths(&["/books/a.yml"])).unwrap();
    assert!(set.run(&CancellationToken::new()).await.is_err());
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unknown_runner_fails_step() {
    let h = Harness::new().book("/books/a.yml", "steps:\n  - nosuch: {}\n");
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("unknown runner 'nosuch'"));
}

#[tokio::test]
async fn test_cancelled_run_is_skipped_not_failed() {
    let h = Harness::new().book("/books/a.yml", "steps:\n  - probe: { name: x }\n");
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    set.run(&cancel).await.unwrap();
    assert_eq!(h.probe.calls(), 0);
    assert_eq!(set.results()[0].results[0].outcome(), Outcome::Skipped);
}

#[tokio::test]
async fn test_run_n_accumulates_results() {
    let h = Harness::new().book("/books/a.yml", "steps:\n  - probe: { name: x }\n");
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    set.run_n(3, &CancellationToken::new()).await.unwrap();
    assert_eq!(set.results().len(), 3);
    assert_eq!(h.probe.calls(), 3);
}

#[tokio::test]
async fn test_selection_by_id_prefix_keeps_order() {
    let h = Harness::new()
        .book("/books/x/a.yml", "steps:\n  - probe: { name: xa }\n")
        .book("/books/y/a.yml", "steps:\n  - probe: { name: ya }\n");
    let engine = h.engine();
    let set = OperatorSet::load(engine.clone(), &paths(&["/books/x/a.yml", "/books/y/a.yml"])).unwrap();
    let ids: Vec<String> = set.books().iter().map(|e| e.id.clone()).collect();
    assert_ne!(ids[0], ids[1]);

    let mut h = h;
    h.config.select.ids = vec![ids[1][..10].to_string(), ids[0][..10].to_string()];
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/x/a.yml", "/books/y/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.probe.log(), vec!["ya", "xa"]);
}

#[tokio::test]
async fn test_skip_included_drops_included_books() {
    let mut h = Harness::new()
        .book("/books/main.yml", "steps:\n  - include: part.yml\n")
        .book("/books/part.yml", "steps:\n  - probe: { name: part }\n");
    h.config.select.skip_included = true;

    let mut set =
        OperatorSet::load(h.engine(), &paths(&["/books/main.yml", "/books/part.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(set.results()[0].total(), 1);
    assert_eq!(h.probe.log(), vec!["part"]);
}

#[tokio::test]
async fn test_deferred_step_sees_last_completed_step_as_previous() {
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
steps:
  - probe: { name: a }
  - defer: true
    probe: { name: d }
    test: previous.name == "b" && current.name == "d"
  - probe: { name: b }
    test: previous.name == "a"
"#,
    );
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.probe.log(), vec!["a", "b", "d"]);
}

#[tokio::test]
async fn test_select_by_path_regex() {
    let (mut h, books) = selection_harness();
    h.config.select.path_match = Some("/(a|c)\\.yml$".into());
    let set = OperatorSet::load(h.engine(), &books).unwrap();
    assert_eq!(stems(&set.select().unwrap()), vec!["a", "c"]);
}

#[tokio::test]
async fn test_select_by_label_expressions() {
    let (mut h, books) = selection_harness();
    h.config.select.labels = vec!["smoke && !slow".into()];
    let set = OperatorSet::load(h.engine(), &books).unwrap();
    assert_eq!(stems(&set.select().unwrap()), vec!["a", "d"]);

    let (mut h, books) = selection_harness();
    h.config.select.labels = vec!["slow".into(), "smoke".into()];
    let set = OperatorSet::load(h.engine(), &books).unwrap();
    assert_eq!(stems(&set.select().unwrap()), vec!["a", "b", "d", "e"]);
}

#[tokio::test]
async fn test_select_shuffle_is_seeded() {
    let (mut h, books) = selection_harness();
    h.config.select.shuffle = Some(7);
    let set = OperatorSet::load(h.engine(), &books).unwrap();
    let first = stems(&set.select().unwrap());
    let second = stems(&set.select().unwrap());
    assert_eq!(first, second);

    let mut sorted = first.clone();
    sorted.sort();
    assert_eq!(sorted, vec!["a", "b", "c", "d", "e", "f"]);
}

#[tokio::test]
async fn test_select_shards_partition_the_selection() {
    let mut picked = Vec::new();
    for index in 0..3 {
        let (mut h, books) = selection_harness();
        h.config.select.shard = Some(Shard { index, total: 3 });
        let set = OperatorSet::load(h.engine(), &books).unwrap();
        picked.push(stems(&set.select().unwrap()));
    }
    assert_eq!(picked, vec![vec!["a", "d"], vec!["b", "e"], vec!["c", "f"]]);
}

#[tokio::test]
async fn test_select_shard_out_of_range() {
    let (mut h, books) = selection_harness();
    h.config.select.shard = Some(Shard { index: 3, total: 3 });
    let set = OperatorSet::load(h.engine(), &books).unwrap();
    assert!(matches!(set.select(), Err(Error::Config(_))));
}

#[tokio::test]
async fn test_select_sample_picks_distinct_books() {
    let (mut h, books) = selection_harness();
    h.config.select.sample = Some(3);
    h.config.select.seed = Some(42);
    let set = OperatorSet::load(h.engine(), &books).unwrap();
    let picked = stems(&set.select().unwrap());
    assert_eq!(picked, stems(&set.select().unwrap()));

    let mut distinct = picked.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(picked.len(), 3);
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn test_random_picks_allow_duplicates_and_all_run() {
    let mut h = Harness::new()
        .book("/books/x.yml", "steps:\n  - probe: { name: x }\n")
        .book("/books/y.yml", "steps:\n  - probe: { name: y }\n");
    h.config.select.random = Some(5);
    h.config.select.seed = Some(1);

    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/x.yml", "/books/y.yml"])).unwrap();
    let picked = stems(&set.select().unwrap());
    assert_eq!(picked.len(), 5);

    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(set.results()[0].total(), 5);
    assert_eq!(h.probe.calls(), 5);
}

#[tokio::test]
async fn test_ambiguous_id_prefix_is_rejected() {
    let (mut h, books) = selection_harness();
    h.config.select.ids = vec![String::new()];
    let set = OperatorSet::load(h.engine(), &books).unwrap();
    assert!(matches!(set.select(), Err(Error::AmbiguousId(_))));
}

#[tokio::test]
async fn test_before_hook_failure_stops_every_step() {
    let h = Harness::new().book("/books/a.yml", "steps:\n  - probe: { name: x }\n  - probe: { name: y }\n");
    let hook: Hook = Arc::new(|_: &RunResult| -> anyhow::Result<()> { anyhow::bail!("not today") });
    let engine = h.builder().before(hook).build();

    let mut set = OperatorSet::load(engine, &paths(&["/books/a.yml"])).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::BeforeFunc { index: 0, .. }), "{err}");
    assert_eq!(h.probe.calls(), 0);
    assert_eq!(set.results()[0].results[0].outcome(), Outcome::Failure);
}

#[tokio::test]
async fn test_after_hook_failure_is_reported_after_steps() {
    let h = Harness::new().book("/books/a.yml", "steps:\n  - probe: { name: x }\n");
    let ok: Hook = Arc::new(|_: &RunResult| -> anyhow::Result<()> { Ok(()) });
    let failing: Hook = Arc::new(|_: &RunResult| -> anyhow::Result<()> { anyhow::bail!("cleanup broke") });
    let engine = h.builder().after(ok).after(failing).build();

    let mut set = OperatorSet::load(engine, &paths(&["/books/a.yml"])).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::AfterFunc { index: 1, .. }), "{err}");
    assert!(err.to_string().contains("cleanup broke"));
    assert_eq!(h.probe.log(), vec!["x"]);
}

#[tokio::test]
async fn test_false_runbook_condition_skips_whole_run() {
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
if: "false"
steps:
  - probe: { name: x }
  - probe: { name: y }
"#,
    );
    let after_calls = Arc::new(AtomicUsize::new(0));
    let counter = after_calls.clone();
    let hook: Hook = Arc::new(move |_: &RunResult| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let engine = h.builder().after(hook).build();

    let mut set = OperatorSet::load(engine, &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();

    let result = &set.results()[0].results[0];
    assert_eq!(result.outcome(), Outcome::Skipped);
    assert_eq!(outcomes(result), vec![Outcome::Skipped, Outcome::Skipped]);
    assert_eq!(h.probe.calls(), 0);
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_interval_sleeps_between_steps_only() {
    let h = Harness::new().book(
        "/books/a.yml",
        r#"
interval: 2s
steps:
  - probe: { name: one }
  - probe: { name: two }
  - probe: { name: three }
"#,
    );
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.probe.calls(), 3);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(2); 2]);
}

#[tokio::test]
async fn test_wait_timeout_joins_error() {
    let mut h = Harness::new().book("/books/a.yml", "steps:\n  - probe: { name: x }\n");
    h.config.run.wait_timeout = Some(Duration::from_millis(50));
    let engine = h.engine_with(vec![("slow", Arc::new(SlowClose) as Arc<dyn Runner>)]);

    let mut set = OperatorSet::load(engine, &paths(&["/books/a.yml"])).unwrap();
    let err = set.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::WaitTimeout(d) if d == Duration::from_millis(50)), "{err}");
    assert_eq!(set.results()[0].results[0].outcome(), Outcome::Success);
}

#[tokio::test]
async fn test_concurrency_groups_limit_overlap() {
    for (group, expected) in [(None, 4), (Some("db"), 1), (Some("\"db:2\""), 2)] {
        let gauge = Arc::new(Gauge::default());
        let mut h = Harness::new();
        let mut books = Vec::new();
        for i in 0..4 {
            let path = format!("/books/g{i}.yml");
            let tag = group.map(|g| format!("concurrency: {g}\n")).unwrap_or_default();
            h = h.book(&path, &format!("{tag}steps:\n  - gauge: {{}}\n"));
            books.push(PathBuf::from(path));
        }
        h.config.run.concurrency = 4;

        let engine = h.engine_with(vec![("gauge", gauge.clone() as Arc<dyn Runner>)]);
        let mut set = OperatorSet::load(engine, &books).unwrap();
        set.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(gauge.peak.load(Ordering::SeqCst), expected, "group {group:?}");
    }
}

#[tokio::test]
async fn test_dump_writes_file_in_traced_runbook() {
    let dir = tempfile::TempDir::new().unwrap();
    let out = dir.path().join("dump.json");
    let h = Harness::new().book(
        "/books/a.yml",
        &format!(
            r#"
trace: true
steps:
  - probe: {{ name: x }}
    dump:
      expr: current.name
      out: {}
    test: current.dump == "x"
"#,
            out.display()
        ),
    );
    let mut set = OperatorSet::load(h.engine(), &paths(&["/books/a.yml"])).unwrap();
    set.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "\"x\"");
}
