//! Per-runbook variable store.
//!
//! Holds everything expressions can see: runbook vars, the step history,
//! bound variables, values inherited from a parent or from `needs`, the loop
//! index and the shared KV. [`Store::to_map`] renders it as one JSON object.

use serde_json::{Map, Value};

use crate::core::{Error, Kv, Result};

/// Top-level keys the engine owns. `bind` may not overwrite them.
pub const RESERVED_KEYS: &[&str] = &[
    "vars", "steps", "parent", "previous", "current", "included", "i", "needs", "kv", "outcome",
];

/// A step's recorded output.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct Store {
    vars: Map<String, Value>,
    steps: Vec<Option<Record>>,
    keys: Option<Vec<String>>,
    cursor: Option<usize>,
    /// Step completed most recently, in run order.
    last_completed: Option<usize>,
    /// `last_completed` as it stood when the current step was entered.
    before_cursor: Option<usize>,
    bind_vars: Map<String, Value>,
    parent: Option<Value>,
    needs: Map<String, Value>,
    loop_index: Option<usize>,
    included: bool,
    outcome: Option<String>,
    kv: Kv,
}

impl Store {
    /// Store for a runbook with `len` steps. `keys` is set when steps are
    /// declared as a map, so history is addressed by key instead of position.
    pub fn new(vars: Map<String, Value>, len: usize, keys: Option<Vec<String>>, kv: Kv) -> Self {
        Self { vars, steps: vec![None; len], keys, kv, ..Default::default() }
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn bind_vars(&self) -> &Map<String, Value> {
        &self.bind_vars
    }

    /// Bind a top-level variable.
    pub fn set_bind_var(&mut self, key: &str, value: Value) -> Result<()> {
        if RESERVED_KEYS.contains(&key) {
            return Err(Error::eval(key, "cannot bind to a reserved name"));
        }
        self.bind_vars.insert(key.to_string(), value);
        Ok(())
    }

    pub fn set_parent(&mut self, parent: Value) {
        self.parent = Some(parent);
    }

    pub fn set_needs(&mut self, alias: impl Into<String>, value: Value) {
        self.needs.insert(alias.into(), value);
    }

    pub fn set_included(&mut self, included: bool) {
        self.included = included;
    }

    pub fn set_outcome(&mut self, outcome: Option<&str>) {
        self.outcome = outcome.map(str::to_string);
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    /// Mark step `idx` as the one being evaluated.
    pub fn enter_step(&mut self, idx: usize) {
        self.cursor = Some(idx);
        self.before_cursor = self.last_completed;
    }

    /// Record the output of step `idx`, replacing an earlier record from a
    /// previous loop iteration.
    pub fn record(&mut self, idx: usize, record: Record) {
        if idx >= self.steps.len() {
            self.steps.resize(idx + 1, None);
        }
        self.steps[idx] = Some(record);
        self.last_completed = Some(idx);
    }

    pub fn recorded(&self, idx: usize) -> bool {
        self.steps.get(idx).is_some_and(Option::is_some)
    }

    /// Record of the step being evaluated.
    pub fn latest(&self) -> Option<&Record> {
        self.cursor.and_then(|i| self.steps.get(i)).and_then(Option::as_ref)
    }

    /// Record of the step that completed most recently before the one being
    /// evaluated. Deferred steps run out of declaration order, so this is not
    /// always the step at `cursor - 1`.
    pub fn previous(&self) -> Option<&Record> {
        self.before_cursor.and_then(|i| self.steps.get(i)).and_then(Option::as_ref)
    }

    pub fn loop_index(&self) -> Option<usize> {
        self.loop_index
    }

    pub fn set_loop_index(&mut self, i: usize) {
        self.loop_index = Some(i);
    }

    pub fn clear_loop_index(&mut self) {
        self.loop_index = None;
    }

    /// Forget the step history. Vars, bind vars, needs, the loop index and
    /// the KV survive.
    pub fn clear_steps(&mut self) {
        let len = self.steps.len();
        self.steps = vec![None; len];
        self.cursor = None;
        self.last_completed = None;
        self.before_cursor = None;
    }

    /// Mutable access to an already recorded step.
    pub fn record_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.steps.get_mut(idx).and_then(Option::as_mut)
    }

    fn steps_value(&self) -> Value {
        let as_value = |r: &Option<Record>| r.clone().map_or(Value::Null, Value::Object);
        match &self.keys {
            Some(keys) => Value::Object(
                keys.iter().zip(&self.steps).map(|(k, r)| (k.clone(), as_value(r))).collect(),
            ),
            None => Value::Array(self.steps.iter().map(as_value).collect()),
        }
    }

    /// Snapshot used for expression evaluation.
    pub fn to_map(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.bind_vars {
            map.insert(k.clone(), v.clone());
        }
        map.insert("vars".into(), Value::Object(self.vars.clone()));
        map.insert("steps".into(), self.steps_value());
        map.insert("needs".into(), Value::Object(self.needs.clone()));
        map.insert("kv".into(), self.kv.snapshot());
        map.insert("included".into(), Value::Bool(self.included));
        if let Some(ref parent) = self.parent {
            map.insert("parent".into(), parent.clone());
        }
        if let Some(r) = self.latest() {
            map.insert("current".into(), Value::Object(r.clone()));
        }
        if let Some(r) = self.previous() {
            map.insert("previous".into(), Value::Object(r.clone()));
        }
        if let Some(i) = self.loop_index {
            map.insert("i".into(), Value::from(i));
        }
        if let Some(ref outcome) = self.outcome {
            map.insert("outcome".into(), Value::String(outcome.clone()));
        }
        Value::Object(map)
    }

    /// What a runbook exports to its dependents when it finishes.
    pub fn export(&self) -> Value {
        let mut map = self.vars.clone();
        for (k, v) in &self.bind_vars {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    /// What an include step records about a finished child run.
    pub fn include_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("vars".into(), Value::Object(self.vars.clone()));
        record.insert("steps".into(), self.steps_value());
        for (k, v) in &self.bind_vars {
            record.insert(k.clone(), v.clone());
        }
        record
    }
}
