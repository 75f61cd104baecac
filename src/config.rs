use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ticker period shared by the router, cache and stats. Default: 10s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Overrides the local host name used for tagging and aggregation.
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub stats_api: StatsApiConfig,
}

/// Metric router and message processing rules.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Tag key carrying the host name. Default: "hostname".
    #[serde(default = "default_hostname_tag")]
    pub hostname_tag: String,

    /// Restamp producer metrics with the time of the last tick.
    #[serde(default)]
    pub interval_timestamp: bool,

    /// Windows kept by the cache; 0 disables cache and aggregation.
    #[serde(default = "default_num_cache_intervals")]
    pub num_cache_intervals: usize,

    /// Upper bound of metrics forwarded per wakeup. Default: 50.
    #[serde(default = "default_max_forward")]
    pub max_forward: usize,

    #[serde(default)]
    pub add_tags: Vec<TagRuleConfig>,

    #[serde(default)]
    pub delete_tags: Vec<TagRuleConfig>,

    /// Metric names dropped unconditionally.
    #[serde(default)]
    pub drop_metrics: Vec<String>,

    /// Conditions; a metric matching any of them is dropped.
    #[serde(default)]
    pub drop_metrics_if: Vec<String>,

    /// Old name to new name.
    #[serde(default)]
    pub rename_metrics: HashMap<String, String>,

    /// Condition to new name.
    #[serde(default)]
    pub rename_metrics_if: HashMap<String, String>,

    /// Message types (metric, event, control, log, unknown) dropped
    /// unconditionally.
    #[serde(default)]
    pub drop_by_message_type: Vec<String>,

    #[serde(default)]
    pub add_meta: Vec<TagRuleConfig>,

    #[serde(default)]
    pub delete_meta: Vec<TagRuleConfig>,

    /// Added fields carry string values.
    #[serde(default)]
    pub add_fields: Vec<TagRuleConfig>,

    #[serde(default)]
    pub delete_fields: Vec<TagRuleConfig>,

    /// Move rules: `key` is the source key, `value` the destination key.
    #[serde(default)]
    pub move_tag_to_meta: Vec<TagRuleConfig>,

    #[serde(default)]
    pub move_tag_to_field: Vec<TagRuleConfig>,

    #[serde(default)]
    pub move_meta_to_tag: Vec<TagRuleConfig>,

    #[serde(default)]
    pub move_meta_to_field: Vec<TagRuleConfig>,

    #[serde(default)]
    pub move_field_to_tag: Vec<TagRuleConfig>,

    #[serde(default)]
    pub move_field_to_meta: Vec<TagRuleConfig>,

    /// Rewrite the `unit` meta (or tag) of metrics into its short form.
    #[serde(default)]
    pub normalize_units: bool,

    /// Condition to target SI prefix; rescales the value of matching
    /// metrics and rewrites their unit.
    #[serde(default)]
    pub change_unit_prefix: HashMap<String, String>,

    /// Order in which the rule stages run; empty means the default order.
    #[serde(default)]
    pub stage_order: Vec<String>,

    #[serde(default)]
    pub interval_aggregates: Vec<AggregationRuleConfig>,
}

/// Conditional add, delete or move of a tag, meta or field key.
#[derive(Debug, Clone, Deserialize)]
pub struct TagRuleConfig {
    pub key: String,

    /// Tag value; `"*"` on delete matches any value.
    pub value: String,

    /// Condition; `"*"` means always.
    #[serde(rename = "if")]
    pub condition: String,
}

/// One interval aggregation rule.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationRuleConfig {
    pub name: String,

    pub function: String,

    #[serde(rename = "if")]
    pub condition: String,

    /// Output tags; `"<copy>"` copies the value from the matched metrics.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// Stats side-channel HTTP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsApiConfig {
    /// Serve the counter snapshot over HTTP.
    #[serde(default)]
    pub publish_collectorstate: bool,

    #[serde(default = "default_bindhost")]
    pub bindhost: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_hostname_tag() -> String {
    "hostname".to_string()
}

fn default_num_cache_intervals() -> usize {
    1
}

fn default_max_forward() -> usize {
    50
}

fn default_bindhost() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            hostname: None,
            router: RouterConfig::default(),
            stats_api: StatsApiConfig::default(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            hostname_tag: default_hostname_tag(),
            interval_timestamp: false,
            num_cache_intervals: default_num_cache_intervals(),
            max_forward: default_max_forward(),
            add_tags: Vec::new(),
            delete_tags: Vec::new(),
            drop_metrics: Vec::new(),
            drop_metrics_if: Vec::new(),
            rename_metrics: HashMap::new(),
            rename_metrics_if: HashMap::new(),
            drop_by_message_type: Vec::new(),
            add_meta: Vec::new(),
            delete_meta: Vec::new(),
            add_fields: Vec::new(),
            delete_fields: Vec::new(),
            move_tag_to_meta: Vec::new(),
            move_tag_to_field: Vec::new(),
            move_meta_to_tag: Vec::new(),
            move_meta_to_field: Vec::new(),
            move_field_to_tag: Vec::new(),
            move_field_to_meta: Vec::new(),
            normalize_units: false,
            change_unit_prefix: HashMap::new(),
            stage_order: Vec::new(),
            interval_aggregates: Vec::new(),
        }
    }
}

impl Default for StatsApiConfig {
    fn default() -> Self {
        Self {
            publish_collectorstate: false,
            bindhost: default_bindhost(),
            port: default_port(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML (or JSON) file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        self.router.validate()?;

        if self.stats_api.publish_collectorstate && self.stats_api.bindhost.is_empty() {
            bail!("stats_api.bindhost is required when publish_collectorstate is set");
        }

        Ok(())
    }
}

/// Rule stages in their default order.
pub const STAGE_NAMES: &[&str] = &[
    "drop_by_name",
    "drop_by_type",
    "drop_if",
    "rename",
    "rename_if",
    "add_tag",
    "delete_tag",
    "move_tag_to_meta",
    "move_tag_to_fields",
    "add_meta",
    "delete_meta",
    "move_meta_to_tags",
    "move_meta_to_fields",
    "add_field",
    "delete_field",
    "move_field_to_tags",
    "move_field_to_meta",
    "change_unit_prefix",
    "normalize_unit",
];

/// Message types derived from the field a metric carries.
pub const MESSAGE_TYPES: &[&str] = &["metric", "event", "control", "log", "unknown"];

/// Fields that identify the message type and cannot be deleted.
pub const PROTECTED_FIELDS: &[&str] = &["value", "event", "control", "log"];

impl RouterConfig {
    /// Every key-based rule list with its config name.
    pub fn key_rules(&self) -> [(&'static str, &[TagRuleConfig]); 12] {
        [
            ("add_tags", self.add_tags.as_slice()),
            ("delete_tags", self.delete_tags.as_slice()),
            ("add_meta", self.add_meta.as_slice()),
            ("delete_meta", self.delete_meta.as_slice()),
            ("add_fields", self.add_fields.as_slice()),
            ("delete_fields", self.delete_fields.as_slice()),
            ("move_tag_to_meta", self.move_tag_to_meta.as_slice()),
            ("move_tag_to_field", self.move_tag_to_field.as_slice()),
            ("move_meta_to_tag", self.move_meta_to_tag.as_slice()),
            ("move_meta_to_field", self.move_meta_to_field.as_slice()),
            ("move_field_to_tag", self.move_field_to_tag.as_slice()),
            ("move_field_to_meta", self.move_field_to_meta.as_slice()),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_forward == 0 {
            bail!("router.max_forward must be positive");
        }

        if self.hostname_tag.is_empty() {
            bail!("router.hostname_tag must not be empty");
        }

        for (what, rules) in self.key_rules() {
            for (i, rule) in rules.iter().enumerate() {
                if rule.key.is_empty() {
                    bail!("router.{what}[{i}]: key is required");
                }
                if rule.condition.is_empty() {
                    bail!("router.{}[{}] ({}): if is required", what, i, rule.key);
                }
            }
        }

        for rule in &self.delete_fields {
            if PROTECTED_FIELDS.contains(&rule.key.as_str()) {
                bail!("router.delete_fields: cannot delete protected field {}", rule.key);
            }
        }

        for ty in &self.drop_by_message_type {
            if !MESSAGE_TYPES.contains(&ty.as_str()) {
                bail!("router.drop_by_message_type: unknown message type {ty}");
            }
        }

        for (i, stage) in self.stage_order.iter().enumerate() {
            if !STAGE_NAMES.contains(&stage.as_str()) {
                bail!("router.stage_order: invalid stage {stage} at index {i}");
            }
        }

        let mut names = HashSet::new();
        for agg in &self.interval_aggregates {
            if agg.name.is_empty() {
                bail!("router.interval_aggregates: name is required");
            }
            if !names.insert(agg.name.as_str()) {
                bail!("router.interval_aggregates: duplicate rule {}", agg.name);
            }
            if agg.function.is_empty() || agg.condition.is_empty() {
                bail!(
                    "router.interval_aggregates {}: function and if are required",
                    agg.name
                );
            }
        }

        if !self.interval_aggregates.is_empty() && self.num_cache_intervals == 0 {
            bail!("router.interval_aggregates need num_cache_intervals > 0");
        }

        Ok(())
    }
}
