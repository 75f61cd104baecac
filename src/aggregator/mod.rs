//! Named aggregation rules evaluated once per closed cache window.
//!
//! Each rule has a condition selecting metrics from the window and a
//! function computing one derived value over the selection. The derived
//! metric is named after the rule, stamped with the window start and sent
//! to the output channel without waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::expr::{ExprError, Expression, Value, Vars};
use crate::metric::{unix_seconds, FieldValue, Metric};
use crate::stats::StatsHandle;
use crate::topology::Topology;

const COMPONENT: &str = "MetricAggregator";

/// Tag/meta value that copies the key from the matched metrics.
pub const COPY_SENTINEL: &str = "<copy>";

/// Variables bound by the engine itself, besides constants.
const WINDOW_VARS: [&str; 5] = ["starttime", "endtime", "metric", "metrics", "values"];

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("aggregation {name}: invalid {which} expression: {source}")]
    InvalidExpression {
        name: String,
        which: &'static str,
        #[source]
        source: ExprError,
    },

    #[error("no aggregation named {0}")]
    NotFound(String),

    #[error("aggregation name must not be empty")]
    EmptyName,
}

/// Template for one output tag or meta value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSpec {
    Literal(String),
    CopyFromMatched,
}

impl From<&str> for TagSpec {
    fn from(v: &str) -> Self {
        if v == COPY_SENTINEL {
            Self::CopyFromMatched
        } else {
            Self::Literal(v.to_string())
        }
    }
}

#[derive(Debug)]
struct Rule {
    name: String,
    condition: Expression,
    function: Expression,
    tags: HashMap<String, TagSpec>,
    meta: HashMap<String, TagSpec>,
}

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicI64,
    dropped: AtomicI64,
    eval_errors: AtomicI64,
}

pub struct MetricAggregator {
    output: mpsc::Sender<Metric>,
    topology: Arc<dyn Topology>,
    rules: RwLock<Vec<Rule>>,
    constants: RwLock<Vars>,
    stats: StatsHandle,
    counters: Counters,
}

impl std::fmt::Debug for MetricAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricAggregator")
            .field("rules", &self.rule_names())
            .finish()
    }
}

impl MetricAggregator {
    /// Builds an engine without rules. Host and topology constants are
    /// computed once here.
    pub fn new(
        output: mpsc::Sender<Metric>,
        topology: Arc<dyn Topology>,
        hostname: &str,
        stats: StatsHandle,
    ) -> Self {
        let info = topology.cpu_info();
        let short_host = hostname.split('.').next().unwrap_or(hostname);

        let mut constants = Vars::new();
        constants.insert("hostname".to_string(), Value::from(short_host));
        constants.insert("numHWThreads".to_string(), Value::Int(info.num_hw_threads));
        constants.insert("numSockets".to_string(), Value::Int(info.num_sockets));
        constants.insert("numNumaDomains".to_string(), Value::Int(info.num_numa_domains));
        constants.insert("numDies".to_string(), Value::Int(info.num_dies));
        constants.insert("smtWidth".to_string(), Value::Int(info.smt_width));

        Self {
            output,
            topology,
            rules: RwLock::new(Vec::new()),
            constants: RwLock::new(constants),
            stats,
            counters: Counters::default(),
        }
    }

    /// Adds a rule, or replaces the rule of the same name in place.
    pub fn add_aggregation(
        &self,
        name: &str,
        function: &str,
        condition: &str,
        tags: &HashMap<String, String>,
        meta: &HashMap<String, String>,
    ) -> Result<(), AggregatorError> {
        if name.is_empty() {
            return Err(AggregatorError::EmptyName);
        }

        let allowed: Vec<String> = {
            let constants = self.constants.read();
            constants
                .keys()
                .cloned()
                .chain(WINDOW_VARS.iter().map(|v| v.to_string()))
                .collect()
        };
        let allowed: Vec<&str> = allowed.iter().map(String::as_str).collect();

        let compile = |src: &str, which: &'static str| {
            Expression::compile_with(&src.replace('\'', "\""), &allowed).map_err(|source| {
                AggregatorError::InvalidExpression {
                    name: name.to_string(),
                    which,
                    source,
                }
            })
        };

        let rule = Rule {
            name: name.to_string(),
            condition: compile(condition, "condition")?,
            function: compile(function, "function")?,
            tags: templates(tags),
            meta: templates(meta),
        };

        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.name == name) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        debug!(rule = name, "aggregation added");
        Ok(())
    }

    pub fn delete_aggregation(&self, name: &str) -> Result<(), AggregatorError> {
        let mut rules = self.rules.write();
        let idx = rules
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| AggregatorError::NotFound(name.to_string()))?;
        rules.remove(idx);
        debug!(rule = name, "aggregation deleted");
        Ok(())
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().iter().map(|r| r.name.clone()).collect()
    }

    /// Binds an extra constant. Rules referencing it must be added after.
    pub fn add_constant(&self, name: &str, value: Value) {
        self.constants.write().insert(name.to_string(), value);
    }

    pub fn delete_constant(&self, name: &str) {
        self.constants.write().remove(name);
    }

    /// Evaluates every rule over one closed window.
    pub fn eval(&self, start: SystemTime, stop: SystemTime, metrics: &[Metric]) {
        let mut vars = self.constants.read().clone();
        vars.insert("starttime".to_string(), Value::Int(unix_seconds(start)));
        vars.insert("endtime".to_string(), Value::Int(unix_seconds(stop)));

        let rules = self.rules.read();
        for rule in rules.iter() {
            self.eval_rule(rule, &mut vars, start, metrics);
        }
        drop(rules);

        self.stats.component_stats(
            COMPONENT,
            &[
                ("emitted", self.counters.emitted.load(Ordering::Relaxed)),
                ("dropped", self.counters.dropped.load(Ordering::Relaxed)),
                ("eval_errors", self.counters.eval_errors.load(Ordering::Relaxed)),
            ],
        );
    }

    fn eval_rule(&self, rule: &Rule, vars: &mut Vars, start: SystemTime, metrics: &[Metric]) {
        let topo = self.topology.as_ref();
        let mut matched = Vec::new();
        let mut values = Vec::new();

        for m in metrics {
            vars.insert("metric".to_string(), Value::Metric(m.clone()));
            match rule.condition.eval_bool(vars, topo) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.counters.eval_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(rule = %rule.name, metric = m.name(), error = %e, "condition failed");
                    continue;
                }
            }

            match m.value().and_then(FieldValue::as_f64) {
                Some(v) => values.push(Value::Float(v)),
                None => warn!(
                    rule = %rule.name,
                    metric = m.name(),
                    kind = m.value().map_or("missing", FieldValue::type_name),
                    "skipping non-numeric value"
                ),
            }
            matched.push(m.clone());
        }
        vars.remove("metric");

        if matched.is_empty() {
            return;
        }

        debug!(rule = %rule.name, matched = matched.len(), values = values.len(), "evaluating");

        vars.insert("values".to_string(), Value::List(values));
        vars.insert(
            "metrics".to_string(),
            Value::List(matched.iter().cloned().map(Value::Metric).collect()),
        );
        let result = rule.function.eval(vars, topo);
        vars.remove("values");
        vars.remove("metrics");

        let value = match result {
            Ok(Value::Float(v)) => FieldValue::Float(v),
            Ok(Value::Int(v)) => FieldValue::Int(v),
            Ok(Value::Str(v)) => FieldValue::Str(v),
            Ok(other) => {
                warn!(rule = %rule.name, kind = other.type_name(), "unsupported result type, skipping");
                return;
            }
            Err(e) => {
                self.counters.eval_errors.fetch_add(1, Ordering::Relaxed);
                warn!(rule = %rule.name, error = %e, "aggregation function failed");
                return;
            }
        };

        let tags = resolve_templates(&rule.tags, &matched, Metric::tag);
        let meta = resolve_templates(&rule.meta, &matched, Metric::meta_value);

        let derived = match Metric::with_value(rule.name.clone(), tags, meta, value, start) {
            Ok(m) => m,
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "building derived metric");
                return;
            }
        };

        match self.output.try_send(derived) {
            Ok(()) => {
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(m)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(rule = %rule.name, metric = %m, "output full, dropping derived metric");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(rule = %rule.name, "aggregator output closed");
            }
        }
    }
}

fn templates(src: &HashMap<String, String>) -> HashMap<String, TagSpec> {
    src.iter()
        .map(|(k, v)| (k.clone(), TagSpec::from(v.as_str())))
        .collect()
}

/// Literal values are copied; `<copy>` takes the value from the first
/// matched metric carrying the key and is left out when none does.
fn resolve_templates(
    specs: &HashMap<String, TagSpec>,
    matched: &[Metric],
    lookup: for<'a> fn(&'a Metric, &str) -> Option<&'a str>,
) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(specs.len());
    for (key, spec) in specs {
        match spec {
            TagSpec::Literal(v) => {
                out.insert(key.clone(), v.clone());
            }
            TagSpec::CopyFromMatched => {
                if let Some(v) = matched.iter().find_map(|m| lookup(m, key)) {
                    out.insert(key.clone(), v.to_string());
                }
            }
        }
    }
    out
}
