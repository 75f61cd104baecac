use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::units::{Prefix, Unit};
use crate::config::{RouterConfig, TagRuleConfig, STAGE_NAMES};
use crate::expr::{ExprEvaluator, Value, Vars};
use crate::metric::{FieldValue, Metric};
use crate::topology::Topology;

/// Condition that is always true.
const ALWAYS: &str = "*";

#[derive(Debug)]
struct TagRule {
    key: String,
    value: String,
    /// `None` means unconditional.
    condition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Stage {
    DropByName,
    DropByType,
    DropIf,
    Rename,
    RenameIf,
    AddTag,
    DeleteTag,
    MoveTagToMeta,
    MoveTagToField,
    AddMeta,
    DeleteMeta,
    MoveMetaToTag,
    MoveMetaToField,
    AddField,
    DeleteField,
    MoveFieldToTag,
    MoveFieldToMeta,
    ChangeUnitPrefix,
    NormalizeUnit,
}

impl Stage {
    fn parse(name: &str) -> Option<Stage> {
        let stage = match name {
            "drop_by_name" => Stage::DropByName,
            "drop_by_type" => Stage::DropByType,
            "drop_if" => Stage::DropIf,
            "rename" => Stage::Rename,
            "rename_if" => Stage::RenameIf,
            "add_tag" => Stage::AddTag,
            "delete_tag" => Stage::DeleteTag,
            "move_tag_to_meta" => Stage::MoveTagToMeta,
            "move_tag_to_fields" => Stage::MoveTagToField,
            "add_meta" => Stage::AddMeta,
            "delete_meta" => Stage::DeleteMeta,
            "move_meta_to_tags" => Stage::MoveMetaToTag,
            "move_meta_to_fields" => Stage::MoveMetaToField,
            "add_field" => Stage::AddField,
            "delete_field" => Stage::DeleteField,
            "move_field_to_tags" => Stage::MoveFieldToTag,
            "move_field_to_meta" => Stage::MoveFieldToMeta,
            "change_unit_prefix" => Stage::ChangeUnitPrefix,
            "normalize_unit" => Stage::NormalizeUnit,
            _ => return None,
        };
        Some(stage)
    }

    fn key_action(self) -> Option<KeyAction> {
        use Location::{Fields, Meta, Tags};
        let action = match self {
            Stage::AddTag => KeyAction::Add(Tags),
            Stage::DeleteTag => KeyAction::Delete(Tags),
            Stage::AddMeta => KeyAction::Add(Meta),
            Stage::DeleteMeta => KeyAction::Delete(Meta),
            Stage::AddField => KeyAction::Add(Fields),
            Stage::DeleteField => KeyAction::Delete(Fields),
            Stage::MoveTagToMeta => KeyAction::Move(Tags, Meta),
            Stage::MoveTagToField => KeyAction::Move(Tags, Fields),
            Stage::MoveMetaToTag => KeyAction::Move(Meta, Tags),
            Stage::MoveMetaToField => KeyAction::Move(Meta, Fields),
            Stage::MoveFieldToTag => KeyAction::Move(Fields, Tags),
            Stage::MoveFieldToMeta => KeyAction::Move(Fields, Meta),
            _ => return None,
        };
        Some(action)
    }
}

#[derive(Debug, Clone, Copy)]
enum Location {
    Tags,
    Meta,
    Fields,
}

#[derive(Debug, Clone, Copy)]
enum KeyAction {
    Add(Location),
    Delete(Location),
    Move(Location, Location),
}

/// The router's per-metric rule pipeline. Stages run in the configured
/// order and the hostname tag is set last.
#[derive(Debug)]
pub struct MessageProcessor {
    evaluator: ExprEvaluator,
    stages: Vec<Stage>,
    drop_names: HashSet<String>,
    drop_types: HashSet<String>,
    drop_conditions: Vec<String>,
    renames: HashMap<String, String>,
    /// Sorted by condition so overlapping renames resolve the same way
    /// on every run.
    renames_if: Vec<(String, String)>,
    key_rules: HashMap<Stage, Vec<TagRule>>,
    unit_prefixes: Vec<(String, Prefix)>,
    normalize_units: bool,
    hostname_tag: String,
    hostname: String,
}

impl MessageProcessor {
    /// Compiles every condition up front; the first invalid one fails.
    pub fn new(config: &RouterConfig, hostname: &str, topology: Arc<dyn Topology>) -> Result<Self> {
        let evaluator = ExprEvaluator::new(topology);

        let names: Vec<&str> = if config.stage_order.is_empty() {
            STAGE_NAMES.to_vec()
        } else {
            config.stage_order.iter().map(String::as_str).collect()
        };
        let stages = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Stage::parse(name)
                    .with_context(|| format!("invalid stage {name} at index {i}"))
            })
            .collect::<Result<Vec<_>>>()?;

        for cond in &config.drop_metrics_if {
            evaluator
                .prepare(cond)
                .with_context(|| format!("drop_metrics_if condition {cond:?}"))?;
        }

        let mut renames_if: Vec<(String, String)> = config
            .rename_metrics_if
            .iter()
            .map(|(c, n)| (c.clone(), n.clone()))
            .collect();
        renames_if.sort();
        for (cond, _) in &renames_if {
            evaluator
                .prepare(cond)
                .with_context(|| format!("rename_metrics_if condition {cond:?}"))?;
        }

        let mut unit_prefixes = Vec::with_capacity(config.change_unit_prefix.len());
        for (cond, prefix) in &config.change_unit_prefix {
            evaluator
                .prepare(cond)
                .with_context(|| format!("change_unit_prefix condition {cond:?}"))?;
            let Some(p) = Prefix::parse(prefix) else {
                bail!("change_unit_prefix: invalid prefix {prefix:?}");
            };
            unit_prefixes.push((cond.clone(), p));
        }
        unit_prefixes.sort_by(|a, b| a.0.cmp(&b.0));

        let compile = |rules: &[TagRuleConfig], what: &str| -> Result<Vec<TagRule>> {
            rules
                .iter()
                .map(|r| {
                    let condition = if r.condition == ALWAYS {
                        None
                    } else {
                        evaluator.prepare(&r.condition).with_context(|| {
                            format!("{what} condition {:?} for key {}", r.condition, r.key)
                        })?;
                        Some(r.condition.clone())
                    };
                    Ok(TagRule {
                        key: r.key.clone(),
                        value: r.value.clone(),
                        condition,
                    })
                })
                .collect()
        };
        let lists = [
            (Stage::AddTag, "add_tags", &config.add_tags),
            (Stage::DeleteTag, "delete_tags", &config.delete_tags),
            (Stage::AddMeta, "add_meta", &config.add_meta),
            (Stage::DeleteMeta, "delete_meta", &config.delete_meta),
            (Stage::AddField, "add_fields", &config.add_fields),
            (Stage::DeleteField, "delete_fields", &config.delete_fields),
            (Stage::MoveTagToMeta, "move_tag_to_meta", &config.move_tag_to_meta),
            (Stage::MoveTagToField, "move_tag_to_field", &config.move_tag_to_field),
            (Stage::MoveMetaToTag, "move_meta_to_tag", &config.move_meta_to_tag),
            (Stage::MoveMetaToField, "move_meta_to_field", &config.move_meta_to_field),
            (Stage::MoveFieldToTag, "move_field_to_tag", &config.move_field_to_tag),
            (Stage::MoveFieldToMeta, "move_field_to_meta", &config.move_field_to_meta),
        ];
        let mut key_rules = HashMap::with_capacity(lists.len());
        for (stage, what, rules) in lists {
            if !rules.is_empty() {
                key_rules.insert(stage, compile(rules.as_slice(), what)?);
            }
        }

        Ok(Self {
            stages,
            drop_names: config.drop_metrics.iter().cloned().collect(),
            drop_types: config.drop_by_message_type.iter().cloned().collect(),
            drop_conditions: config.drop_metrics_if.clone(),
            renames: config.rename_metrics.clone(),
            renames_if,
            key_rules,
            unit_prefixes,
            normalize_units: config.normalize_units,
            hostname_tag: config.hostname_tag.clone(),
            hostname: hostname.to_string(),
            evaluator,
        })
    }

    /// Runs the pipeline. `None` means the metric was dropped.
    ///
    /// Conditions always see the incoming metric; stages only change what
    /// is forwarded.
    pub fn process(&self, metric: &Metric) -> Option<Metric> {
        let vars = condition_vars(metric);
        let is_metric = message_type(metric) == "metric";
        let mut out = metric.clone();

        for stage in &self.stages {
            match stage {
                Stage::DropByName => {
                    if self.drop_names.contains(out.name()) {
                        return None;
                    }
                }
                Stage::DropByType => {
                    if self.drop_types.contains(message_type(metric)) {
                        return None;
                    }
                }
                Stage::DropIf => {
                    if self.drop_conditions.iter().any(|c| self.check(c, &vars)) {
                        return None;
                    }
                }
                Stage::Rename => {
                    if let Some(new_name) = self.renames.get(out.name()) {
                        out = renamed(&out, new_name);
                    }
                }
                Stage::RenameIf => {
                    for (cond, new_name) in &self.renames_if {
                        if self.check(cond, &vars) {
                            out = renamed(&out, new_name);
                        }
                    }
                }
                Stage::ChangeUnitPrefix => {
                    if is_metric {
                        for (cond, prefix) in &self.unit_prefixes {
                            if self.check(cond, &vars) {
                                out = rescale_unit(&out, *prefix);
                            }
                        }
                    }
                }
                Stage::NormalizeUnit => {
                    if is_metric && self.normalize_units {
                        out = normalize_unit(&out);
                    }
                }
                key_stage => {
                    if let (Some(action), Some(rules)) =
                        (key_stage.key_action(), self.key_rules.get(key_stage))
                    {
                        out = self.apply_key_rules(action, rules, out, &vars);
                    }
                }
            }
        }

        if out.tag(&self.hostname_tag) != Some(self.hostname.as_str()) {
            out = out.with_tag(self.hostname_tag.as_str(), self.hostname.as_str());
        }

        Some(out)
    }

    fn apply_key_rules(
        &self,
        action: KeyAction,
        rules: &[TagRule],
        mut out: Metric,
        vars: &Vars,
    ) -> Metric {
        for rule in rules {
            match action {
                KeyAction::Add(loc) => {
                    if self.applies(rule, vars) {
                        out = set_key(&out, loc, &rule.key, rule.value.clone());
                    }
                }
                KeyAction::Delete(loc) => {
                    let value_matches = get_key(&out, loc, &rule.key)
                        .is_some_and(|v| rule.value == ALWAYS || rule.value == v);
                    if value_matches && self.applies(rule, vars) {
                        out = remove_key(&out, loc, &rule.key).unwrap_or(out);
                    }
                }
                KeyAction::Move(from, to) => {
                    let Some(v) = get_key(&out, from, &rule.key) else {
                        continue;
                    };
                    if self.applies(rule, vars) {
                        if let Some(moved) = remove_key(&out, from, &rule.key) {
                            out = set_key(&moved, to, &rule.value, v);
                        }
                    }
                }
            }
        }
        out
    }

    fn applies(&self, rule: &TagRule, vars: &Vars) -> bool {
        rule.condition
            .as_deref()
            .is_none_or(|c| self.check(c, vars))
    }

    /// Evaluation failures count as false.
    fn check(&self, cond: &str, vars: &Vars) -> bool {
        match self.evaluator.eval_bool(cond, vars) {
            Ok(b) => b,
            Err(e) => {
                debug!(condition = cond, error = %e, "condition failed, treating as false");
                false
            }
        }
    }
}

fn renamed(metric: &Metric, new_name: &str) -> Metric {
    let old = metric.name().to_string();
    metric.with_name(new_name).with_meta("oldname", old)
}

/// Classifies a metric by the field it carries.
fn message_type(metric: &Metric) -> &'static str {
    ["value", "event", "control", "log"]
        .into_iter()
        .find(|k| metric.field(k).is_some())
        .map_or("unknown", |k| if k == "value" { "metric" } else { k })
}

fn get_key(metric: &Metric, loc: Location, key: &str) -> Option<String> {
    match loc {
        Location::Tags => metric.tag(key).map(str::to_string),
        Location::Meta => metric.meta_value(key).map(str::to_string),
        Location::Fields => metric.field(key).map(FieldValue::to_text),
    }
}

fn set_key(metric: &Metric, loc: Location, key: &str, value: String) -> Metric {
    match loc {
        Location::Tags => metric.with_tag(key, value),
        Location::Meta => metric.with_meta(key, value),
        Location::Fields => metric.with_field(key, value),
    }
}

/// `None` when removing the key would leave the metric without fields.
fn remove_key(metric: &Metric, loc: Location, key: &str) -> Option<Metric> {
    match loc {
        Location::Tags => Some(metric.without_tag(key)),
        Location::Meta => Some(metric.without_meta(key)),
        Location::Fields => match metric.without_field(key) {
            Ok(m) => Some(m),
            Err(e) => {
                debug!(error = %e, field = key, "keeping last field");
                None
            }
        },
    }
}

/// The `unit` meta key, falling back to the `unit` tag.
fn unit_of(metric: &Metric) -> Option<(Location, &str)> {
    metric
        .meta_value("unit")
        .map(|u| (Location::Meta, u))
        .or_else(|| metric.tag("unit").map(|u| (Location::Tags, u)))
}

fn normalize_unit(metric: &Metric) -> Metric {
    match unit_of(metric).and_then(|(loc, raw)| Unit::parse(raw).map(|u| (loc, u))) {
        Some((loc, unit)) => set_key(metric, loc, "unit", unit.short()),
        None => metric.clone(),
    }
}

/// Rescales the `value` field into `prefix` and rewrites the unit. Metrics
/// with an unknown unit or a non-numeric value pass unchanged.
fn rescale_unit(metric: &Metric, prefix: Prefix) -> Metric {
    let Some((loc, unit)) =
        unit_of(metric).and_then(|(loc, raw)| Unit::parse(raw).map(|u| (loc, u)))
    else {
        return metric.clone();
    };
    let value = match metric.value() {
        Some(FieldValue::Float(v)) => *v,
        Some(FieldValue::Int(v)) => *v as f64,
        _ => return metric.clone(),
    };
    let (factor, scaled) = unit.rescale(prefix);
    let out = metric.with_field("value", value * factor);
    set_key(&out, loc, "unit", scaled.short())
}

/// Binds `name`, `metric`, `messagetype`, `timestamp`, the `tags`/`meta`/`fields` maps
/// and every tag, meta and field key directly. Reserved names win over
/// flattened keys.
fn condition_vars(metric: &Metric) -> Vars {
    let mut vars = Vars::with_capacity(
        8 + metric.tags().len() + metric.meta().len() + metric.fields().len(),
    );

    let flat = metric
        .tags()
        .iter()
        .chain(metric.meta())
        .map(|(k, v)| (sanitize(k), Value::Str(v.clone())))
        .chain(
            metric
                .fields()
                .iter()
                .map(|(k, v)| (sanitize(k), Value::from(v))),
        );
    vars.extend(flat);

    vars.insert("name".to_string(), Value::Str(metric.name().to_string()));
    let kind = Value::Str(message_type(metric).to_string());
    vars.insert("messagetype".to_string(), kind.clone());
    vars.insert("msgtype".to_string(), kind);
    vars.insert("metric".to_string(), Value::Metric(metric.clone()));
    vars.insert("timestamp".to_string(), Value::Int(metric.unix_seconds()));
    vars.insert(
        "tags".to_string(),
        Value::Map(
            metric
                .tags()
                .iter()
                .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
                .collect(),
        ),
    );
    vars.insert(
        "meta".to_string(),
        Value::Map(
            metric
                .meta()
                .iter()
                .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
                .collect(),
        ),
    );
    vars.insert(
        "fields".to_string(),
        Value::Map(
            metric
                .fields()
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v)))
                .collect(),
        ),
    );
    if let Some(v) = metric.value() {
        vars.insert("value".to_string(), Value::from(v));
    }

    vars
}

/// Makes a tag key usable as an identifier, e.g. `type-id` -> `type_id`.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::config::TagRuleConfig;
    use crate::topology::StaticTopology;

    fn metric(name: &str, tags: &[(&str, &str)]) -> Metric {
        let tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Metric::with_value(name, tags, HashMap::new(), 1.0, SystemTime::now())
            .expect("valid metric")
    }

    fn processor(config: RouterConfig) -> MessageProcessor {
        MessageProcessor::new(&config, "node01", Arc::new(StaticTopology::default()))
            .expect("valid config")
    }

    fn tag_rule(key: &str, value: &str, condition: &str) -> TagRuleConfig {
        TagRuleConfig {
            key: key.to_string(),
            value: value.to_string(),
            condition: condition.to_string(),
        }
    }

    #[test]
    fn test_adds_hostname_tag() {
        let p = processor(RouterConfig::default());
        let out = p.process(&metric("cpu_load", &[])).expect("kept");
        assert_eq!(out.tag("hostname"), Some("node01"));
    }

    #[test]
    fn test_drop_by_name_and_condition() {
        let p = processor(RouterConfig {
            drop_metrics: vec!["ipc".to_string()],
            drop_metrics_if: vec!["match('temp_%d+', name)".to_string()],
            ..Default::default()
        });
        assert!(p.process(&metric("ipc", &[])).is_none());
        assert!(p.process(&metric("temp_3", &[])).is_none());
        assert!(p.process(&metric("cpu_load", &[])).is_some());
    }

    #[test]
    fn test_rename_records_old_name() {
        let mut renames = HashMap::new();
        renames.insert("load_one".to_string(), "cpu_load".to_string());
        let p = processor(RouterConfig {
            rename_metrics: renames,
            ..Default::default()
        });
        let out = p.process(&metric("load_one", &[])).expect("kept");
        assert_eq!(out.name(), "cpu_load");
        assert_eq!(out.meta_value("oldname"), Some("load_one"));
    }

    #[test]
    fn test_conditional_tags() {
        let p = processor(RouterConfig {
            add_tags: vec![
                tag_rule("cluster", "fritz", "*"),
                tag_rule("scope", "socket", "type == 'socket'"),
            ],
            delete_tags: vec![
                tag_rule("unit", "*", "*"),
                tag_rule("type-id", "0", "name == 'cpu_load'"),
            ],
            ..Default::default()
        });

        let out = p
            .process(&metric(
                "cpu_load",
                &[("type", "socket"), ("type-id", "0"), ("unit", "load")],
            ))
            .expect("kept");
        assert_eq!(out.tag("cluster"), Some("fritz"));
        assert_eq!(out.tag("scope"), Some("socket"));
        assert_eq!(out.tag("unit"), None);
        assert_eq!(out.tag("type-id"), None);

        let out = p
            .process(&metric("mem_used", &[("type", "node"), ("type-id", "1")]))
            .expect("kept");
        assert_eq!(out.tag("scope"), None);
        assert_eq!(out.tag("type-id"), Some("1"));
    }

    #[test]
    fn test_failing_condition_is_false() {
        let p = processor(RouterConfig {
            drop_metrics_if: vec!["missing_tag == 'x'".to_string()],
            ..Default::default()
        });
        assert!(p.process(&metric("cpu_load", &[])).is_some());
    }

    #[test]
    fn test_flattened_keys_are_sanitized() {
        let p = processor(RouterConfig {
            drop_metrics_if: vec!["type_id == '7'".to_string()],
            ..Default::default()
        });
        assert!(p.process(&metric("cpu_load", &[("type-id", "7")])).is_none());
    }

    fn unit_metric(name: &str, unit: &str, value: impl Into<FieldValue>) -> Metric {
        let mut meta = HashMap::new();
        meta.insert("unit".to_string(), unit.to_string());
        Metric::with_value(name, HashMap::new(), meta, value, SystemTime::now())
            .expect("valid metric")
    }

    #[test]
    fn test_conditional_rename() {
        let mut renames = HashMap::new();
        renames.insert("match('temp_%d+', name)".to_string(), "temperature".to_string());
        let p = processor(RouterConfig {
            rename_metrics_if: renames,
            ..Default::default()
        });
        let out = p.process(&metric("temp_2", &[])).expect("kept");
        assert_eq!(out.name(), "temperature");
        assert_eq!(out.meta_value("oldname"), Some("temp_2"));
        assert_eq!(p.process(&metric("cpu_load", &[])).expect("kept").name(), "cpu_load");
    }

    #[test]
    fn test_meta_and_field_rules() {
        let p = processor(RouterConfig {
            add_meta: vec![tag_rule("source", "likwid", "name == 'flops_any'")],
            delete_meta: vec![tag_rule("scope", "*", "*")],
            add_fields: vec![tag_rule("note", "derived", "*")],
            delete_fields: vec![tag_rule("raw", "*", "*")],
            ..Default::default()
        });

        let mut meta = HashMap::new();
        meta.insert("scope".to_string(), "core".to_string());
        let m = Metric::with_value("flops_any", HashMap::new(), meta, 2.0, SystemTime::now())
            .expect("valid metric")
            .with_field("raw", 7i64);

        let out = p.process(&m).expect("kept");
        assert_eq!(out.meta_value("source"), Some("likwid"));
        assert_eq!(out.meta_value("scope"), None);
        assert_eq!(out.field("note"), Some(&FieldValue::Str("derived".to_string())));
        assert_eq!(out.field("raw"), None);
        assert_eq!(out.value(), Some(&FieldValue::Float(2.0)));
    }

    #[test]
    fn test_move_rules() {
        let p = processor(RouterConfig {
            move_tag_to_meta: vec![tag_rule("unit", "unit", "*")],
            move_field_to_tag: vec![tag_rule("socket", "type-id", "*")],
            move_meta_to_field: vec![tag_rule("missing", "x", "*")],
            ..Default::default()
        });

        let m = metric("mem_bw", &[("unit", "MB/s")]).with_field("socket", 1i64);
        let out = p.process(&m).expect("kept");
        assert_eq!(out.tag("unit"), None);
        assert_eq!(out.meta_value("unit"), Some("MB/s"));
        assert_eq!(out.field("socket"), None);
        assert_eq!(out.tag("type-id"), Some("1"));
        assert_eq!(out.field("x"), None);
    }

    #[test]
    fn test_move_never_removes_last_field() {
        let p = processor(RouterConfig {
            move_field_to_tag: vec![tag_rule("value", "value", "*")],
            ..Default::default()
        });
        let out = p.process(&metric("cpu_load", &[])).expect("kept");
        assert_eq!(out.value(), Some(&FieldValue::Float(1.0)));
        assert_eq!(out.tag("value"), None);
    }

    #[test]
    fn test_drop_by_message_type() {
        let p = processor(RouterConfig {
            drop_by_message_type: vec!["event".to_string()],
            drop_metrics_if: vec!["msgtype == 'log'".to_string()],
            ..Default::default()
        });

        let mut fields = HashMap::new();
        fields.insert("event".to_string(), FieldValue::from("job start"));
        let event = Metric::new("job", HashMap::new(), HashMap::new(), fields, SystemTime::now())
            .expect("valid event");
        assert!(p.process(&event).is_none());

        let mut fields = HashMap::new();
        fields.insert("log".to_string(), FieldValue::from("disk full"));
        let log = Metric::new("syslog", HashMap::new(), HashMap::new(), fields, SystemTime::now())
            .expect("valid log");
        assert!(p.process(&log).is_none());

        assert!(p.process(&metric("cpu_load", &[])).is_some());
    }

    #[test]
    fn test_normalize_units() {
        let p = processor(RouterConfig {
            normalize_units: true,
            ..Default::default()
        });
        let out = p.process(&unit_metric("mem_used", "kilobyte", 3.0)).expect("kept");
        assert_eq!(out.meta_value("unit"), Some("kB"));

        let out = p.process(&metric("mem_bw", &[("unit", "MBps")])).expect("kept");
        assert_eq!(out.tag("unit"), Some("MB/s"));

        let out = p.process(&unit_metric("cpu_load", "load", 3.0)).expect("kept");
        assert_eq!(out.meta_value("unit"), Some("load"));
    }

    #[test]
    fn test_change_unit_prefix() {
        let mut prefixes = HashMap::new();
        prefixes.insert("name == 'mem_used'".to_string(), "G".to_string());
        let p = processor(RouterConfig {
            change_unit_prefix: prefixes,
            ..Default::default()
        });

        let out = p.process(&unit_metric("mem_used", "MB", 2048i64)).expect("kept");
        assert_eq!(out.meta_value("unit"), Some("GB"));
        let v = out.value().and_then(FieldValue::as_f64).expect("numeric value");
        assert!((v - 2.048).abs() < 1e-9);

        let out = p.process(&unit_metric("mem_free", "MB", 2048i64)).expect("kept");
        assert_eq!(out.value(), Some(&FieldValue::Int(2048)));
    }

    #[test]
    fn test_invalid_unit_prefix_rejected() {
        let mut prefixes = HashMap::new();
        prefixes.insert("true".to_string(), "Q".to_string());
        let config = RouterConfig {
            change_unit_prefix: prefixes,
            ..Default::default()
        };
        assert!(MessageProcessor::new(&config, "h", Arc::new(StaticTopology::default())).is_err());
    }

    #[test]
    fn test_stage_order() {
        let mut renames = HashMap::new();
        renames.insert("ipc".to_string(), "instr_per_cycle".to_string());
        let base = RouterConfig {
            rename_metrics: renames,
            drop_metrics: vec!["instr_per_cycle".to_string()],
            ..Default::default()
        };

        // Default order drops by name before renaming.
        let p = processor(base.clone());
        assert_eq!(p.process(&metric("ipc", &[])).expect("kept").name(), "instr_per_cycle");

        let p = processor(RouterConfig {
            stage_order: vec!["rename".to_string(), "drop_by_name".to_string()],
            ..base.clone()
        });
        assert!(p.process(&metric("ipc", &[])).is_none());

        let p = processor(RouterConfig {
            stage_order: vec!["drop_by_name".to_string(), "rename".to_string()],
            ..base.clone()
        });
        assert!(p.process(&metric("ipc", &[])).is_some());

        let err = MessageProcessor::new(
            &RouterConfig {
                stage_order: vec!["shuffle".to_string()],
                ..base
            },
            "h",
            Arc::new(StaticTopology::default()),
        )
        .expect_err("unknown stage");
        assert!(err.to_string().contains("invalid stage shuffle at index 0"));
    }

    #[test]
    fn test_invalid_condition_rejected() {
        let config = RouterConfig {
            drop_metrics_if: vec!["name ==".to_string()],
            ..Default::default()
        };
        let err = MessageProcessor::new(&config, "h", Arc::new(StaticTopology::default()))
            .expect_err("does not parse");
        assert!(err.to_string().contains("drop_metrics_if"));
    }
}
