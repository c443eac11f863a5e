//! Runbook parser and loaders.
//!
//! Parses YAML runbook files into validated [`Book`]s. Relative paths in
//! `needs` and `include` are resolved against the runbook's directory and
//! checked against the `read_parent` scope.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::looping::{LoopDef, LoopSpec};
use super::runner::RunnerSpec;
use super::schema::{Book, RunbookDef, StepsDef};
use super::step::{DumpSpec, ExecRequest, IncludeSpec, RunnerBinding, StepDef};
use crate::core::config::{Deprecations, Scopes};
use crate::core::identity::clean_path;
use crate::core::{Config, Error, Result};

/// Settings that affect how runbooks are read.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub scopes: Scopes,
    pub deprecations: Deprecations,
}

impl ParseOptions {
    pub fn from_config(config: &Config) -> Self {
        Self { scopes: config.scopes.clone(), deprecations: config.deprecations.clone() }
    }
}

/// Source of runbooks.
pub trait BookLoader: Send + Sync + fmt::Debug {
    fn load(&self, path: &Path) -> Result<Book>;
}

/// Reads runbooks from disk.
#[derive(Debug, Clone, Default)]
pub struct FsLoader {
    options: ParseOptions,
}

impl FsLoader {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }
}

impl BookLoader for FsLoader {
    fn load(&self, path: &Path) -> Result<Book> {
        let path = clean_path(path);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::book(&path, format!("cannot read: {e}")))?;
        parse_book_str(&content, &path, &self.options)
    }
}

/// Serves runbooks from memory, keyed by cleaned path.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    options: ParseOptions,
    books: RwLock<HashMap<PathBuf, String>>,
}

impl MemoryLoader {
    pub fn new(options: ParseOptions) -> Self {
        Self { options, books: RwLock::new(HashMap::new()) }
    }

    /// Add a runbook.
    #[must_use]
    pub fn with(self, path: impl AsRef<Path>, yaml: impl Into<String>) -> Self {
        self.insert(path, yaml);
        self
    }

    pub fn insert(&self, path: impl AsRef<Path>, yaml: impl Into<String>) {
        self.books.write().insert(clean_path(path.as_ref()), yaml.into());
    }
}

impl BookLoader for MemoryLoader {
    fn load(&self, path: &Path) -> Result<Book> {
        let path = clean_path(path);
        let content = self
            .books
            .read()
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::book(&path, "not found"))?;
        parse_book_str(&content, &path, &self.options)
    }
}

/// Parse a runbook from a string. `path` must already be absolute and clean.
pub fn parse_book_str(content: &str, path: &Path, options: &ParseOptions) -> Result<Book> {
    let def: RunbookDef =
        serde_yaml::from_str(content).map_err(|e| Error::book(path, e.to_string()))?;
    validate_book(def, path, options)
}

/// Resolve `target` against the directory of the runbook at `base`.
pub fn resolve_relative(base: &Path, target: &str, scopes: &Scopes) -> Result<PathBuf> {
    let dir = base.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let resolved = clean_path(&dir.join(target));
    if !scopes.read_parent && !resolved.starts_with(clean_path(&dir)) {
        return Err(Error::ScopeDenied("read:parent"));
    }
    Ok(resolved)
}

fn validate_book(def: RunbookDef, path: &Path, options: &ParseOptions) -> Result<Book> {
    let needs = def
        .needs
        .iter()
        .map(|(alias, target)| Ok((alias.clone(), resolve_relative(path, target, &options.scopes)?)))
        .collect::<Result<Vec<_>>>()?;

    for (name, spec) in &def.runners {
        if spec.kind().is_none() {
            return Err(Error::book(path, format!("cannot detect the kind of runner '{name}'")));
        }
    }

    let (raw_steps, keyed) = match def.steps {
        StepsDef::List(list) => {
            (list.into_iter().enumerate().map(|(i, s)| (i.to_string(), s)).collect::<Vec<_>>(), false)
        }
        StepsDef::Keyed(mapping) => {
            let mut steps = Vec::with_capacity(mapping.len());
            for (key, value) in mapping {
                let key = key
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::book(path, "step keys must be strings"))?;
                let value: Map<String, Value> = serde_yaml::from_value(value)
                    .map_err(|e| Error::book(path, format!("steps[{key}]: {e}")))?;
                steps.push((key, value));
            }
            (steps, true)
        }
    };

    if raw_steps.is_empty() {
        return Err(Error::book(path, "runbook must have at least one step"));
    }

    let steps = raw_steps
        .into_iter()
        .map(|(key, raw)| parse_step(key, raw, &def.runners, path, options))
        .collect::<Result<Vec<_>>>()?;

    Ok(Book {
        path: path.to_path_buf(),
        desc: def.desc,
        labels: def.labels,
        needs,
        concurrency: def.concurrency.into_vec(),
        condition: def.condition,
        force: def.force,
        fail_fast: def.fail_fast,
        trace: def.trace,
        interval: def.interval,
        loop_spec: def.loop_def.map(LoopSpec::from),
        vars: def.vars,
        runners: def.runners,
        steps,
        keyed,
    })
}

fn parse_step(
    key: String,
    raw: Map<String, Value>,
    runners: &BTreeMap<String, RunnerSpec>,
    path: &Path,
    options: &ParseOptions,
) -> Result<StepDef> {
    let bad = |msg: String| Error::book(path, format!("steps[{key}]: {msg}"));
    let mut step = StepDef { key: key.clone(), ..Default::default() };

    let set_main = |step: &mut StepDef, binding: RunnerBinding| {
        if step.binding.is_some() {
            return Err(bad("a step takes exactly one runner".into()));
        }
        step.binding = Some(binding);
        Ok(())
    };

    for (name, value) in raw {
        match name.as_str() {
            "desc" => step.desc = as_text(&value),
            "if" => step.condition = Some(as_text(&value)),
            "defer" => step.defer = value.as_bool().unwrap_or(false),
            "force" => step.force = value.as_bool().unwrap_or(false),
            "loop" | "retry" => {
                if name == "retry" {
                    options.deprecations.warn_once(
                        "step.retry",
                        "`retry:` is deprecated; use `loop:` instead",
                    );
                }
                let def: LoopDef =
                    serde_json::from_value(value).map_err(|e| bad(format!("loop: {e}")))?;
                step.loop_spec = Some(def.into());
            }
            "exec" => {
                let req = ExecRequest::from_value(&value).map_err(|e| bad(format!("exec: {e}")))?;
                set_main(&mut step, RunnerBinding::Exec(req))?;
            }
            "include" => {
                let include = parse_include(&value, path, &options.scopes)
                    .map_err(|e| match e {
                        Error::ScopeDenied(_) => e,
                        other => bad(other.to_string()),
                    })?;
                set_main(&mut step, RunnerBinding::Include(include))?;
            }
            "runners" => {
                let defs: BTreeMap<String, RunnerSpec> =
                    serde_json::from_value(value).map_err(|e| bad(format!("runners: {e}")))?;
                set_main(&mut step, RunnerBinding::Define(defs))?;
            }
            "dump" => {
                let dump: DumpSpec =
                    serde_json::from_value(value).map_err(|e| bad(format!("dump: {e}")))?;
                step.dump = Some(dump);
            }
            "bind" => match value {
                Value::Object(map) => step.bind = Some(map),
                _ => return Err(bad("bind expects a map".into())),
            },
            "test" => step.test = Some(as_text(&value)),
            _ => {
                let binding = match runners.get(&name).and_then(RunnerSpec::kind) {
                    Some(kind) => RunnerBinding::Named { name, kind, request: value },
                    None => RunnerBinding::Unresolved { name, request: value },
                };
                set_main(&mut step, binding)?;
            }
        }
    }

    if step.binding.is_none() && !step.has_auxiliary() {
        return Err(Error::InvalidRunner(key));
    }
    Ok(step)
}

fn parse_include(value: &Value, base: &Path, scopes: &Scopes) -> Result<IncludeSpec> {
    let (target, vars) = match value {
        Value::String(p) => (p.clone(), Map::new()),
        Value::Object(map) => {
            let target = map
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::eval("include", "missing `path`"))?
                .to_string();
            let vars = match map.get("vars") {
                Some(Value::Object(vars)) => vars.clone(),
                Some(_) => return Err(Error::eval("include", "`vars` must be a map")),
                None => Map::new(),
            };
            (target, vars)
        }
        _ => return Err(Error::eval("include", "expects a path or a map")),
    };
    Ok(IncludeSpec { path: resolve_relative(base, &target, scopes)?, vars })
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Find runbook files under `dir`.
pub fn discover_books(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut books = Vec::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path.extension().is_some_and(|e| e == "yml" || e == "yaml")
        {
            books.push(path.to_path_buf());
        }
    }
    books.sort();
    Ok(books)
}

/// Expand directories into the runbooks they contain. Files pass through.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let found = discover_books(path)?;
            if found.is_empty() {
                tracing::warn!(path = %path.display(), "No runbooks found");
            }
            out.extend(found);
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}
