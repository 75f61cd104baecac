use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Metric name reserved for internal operational counters.
pub const STATS_METRIC_NAME: &str = "_stats";

/// Errors raised while constructing a metric.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetricError {
    #[error("metric {name}: at least one field is required")]
    NoFields { name: String },

    #[error("metric name must not be empty")]
    EmptyName,
}

/// A single scalar field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Coerces a numeric or boolean field into f64.
    ///
    /// Strings have no numeric interpretation and yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(true) => Some(1.0),
            Self::Bool(false) => Some(0.0),
            Self::Str(_) => None,
        }
    }

    /// Bare textual form used when a field becomes a tag or meta value.
    pub fn to_text(&self) -> String {
        match self {
            Self::Float(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Str(v) => v.clone(),
        }
    }

    /// Short type label used in log messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}i"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "\"{}\"", v.replace('"', "\\\"")),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

#[derive(Debug, PartialEq)]
struct MetricBody {
    name: String,
    tags: HashMap<String, String>,
    meta: HashMap<String, String>,
    fields: HashMap<String, FieldValue>,
    time: SystemTime,
}

/// Immutable timestamped measurement.
///
/// The body is shared, so cloning a metric for fan-out is a pointer copy.
/// Every `with_*` method builds a new metric and leaves `self` untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    body: Arc<MetricBody>,
}

impl Metric {
    /// Builds a metric from its parts.
    pub fn new(
        name: impl Into<String>,
        tags: HashMap<String, String>,
        meta: HashMap<String, String>,
        fields: HashMap<String, FieldValue>,
        time: SystemTime,
    ) -> Result<Self, MetricError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MetricError::EmptyName);
        }
        if fields.is_empty() {
            return Err(MetricError::NoFields { name });
        }

        Ok(Self {
            body: Arc::new(MetricBody {
                name,
                tags,
                meta,
                fields,
                time,
            }),
        })
    }

    /// Shorthand for a metric with a single `value` field.
    pub fn with_value(
        name: impl Into<String>,
        tags: HashMap<String, String>,
        meta: HashMap<String, String>,
        value: impl Into<FieldValue>,
        time: SystemTime,
    ) -> Result<Self, MetricError> {
        let mut fields = HashMap::with_capacity(1);
        fields.insert("value".to_string(), value.into());
        Self::new(name, tags, meta, fields, time)
    }

    pub fn name(&self) -> &str {
        &self.body.name
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.body.tags
    }

    pub fn meta(&self) -> &HashMap<String, String> {
        &self.body.meta
    }

    pub fn fields(&self) -> &HashMap<String, FieldValue> {
        &self.body.fields
    }

    pub fn time(&self) -> SystemTime {
        self.body.time
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.body.tags.get(key).map(String::as_str)
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.body.meta.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.body.fields.get(key)
    }

    /// The conventional `value` field carried by plain metrics.
    pub fn value(&self) -> Option<&FieldValue> {
        self.field("value")
    }

    /// Timestamp as whole seconds since the Unix epoch.
    pub fn unix_seconds(&self) -> i64 {
        unix_seconds(self.body.time)
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        self.derive(|body| body.name = name.into())
    }

    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.derive(|body| {
            body.tags.insert(key.into(), value.into());
        })
    }

    pub fn without_tag(&self, key: &str) -> Self {
        self.derive(|body| {
            body.tags.remove(key);
        })
    }

    pub fn with_meta(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.derive(|body| {
            body.meta.insert(key.into(), value.into());
        })
    }

    pub fn without_meta(&self, key: &str) -> Self {
        self.derive(|body| {
            body.meta.remove(key);
        })
    }

    pub fn with_field(&self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.derive(|body| {
            body.fields.insert(key.into(), value.into());
        })
    }

    /// Fails rather than leave the metric without fields.
    pub fn without_field(&self, key: &str) -> Result<Self, MetricError> {
        if self.body.fields.len() == 1 && self.body.fields.contains_key(key) {
            return Err(MetricError::NoFields {
                name: self.body.name.clone(),
            });
        }
        Ok(self.derive(|body| {
            body.fields.remove(key);
        }))
    }

    pub fn with_time(&self, time: SystemTime) -> Self {
        self.derive(|body| body.time = time)
    }

    fn derive(&self, f: impl FnOnce(&mut MetricBody)) -> Self {
        let mut body = MetricBody {
            name: self.body.name.clone(),
            tags: self.body.tags.clone(),
            meta: self.body.meta.clone(),
            fields: self.body.fields.clone(),
            time: self.body.time,
        };
        f(&mut body);
        Self {
            body: Arc::new(body),
        }
    }
}

/// Renders the metric in InfluxDB line protocol, with tags and fields
/// sorted by key.
impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body.name)?;

        let mut tags: Vec<_> = self.body.tags.iter().collect();
        tags.sort();
        for (k, v) in tags {
            write!(f, ",{k}={v}")?;
        }

        let mut fields: Vec<_> = self.body.fields.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (i, (k, v)) in fields.into_iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            write!(f, "{sep}{k}={v}")?;
        }

        let nanos = self
            .body
            .time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        write!(f, " {nanos}")
    }
}

/// Whole seconds since the Unix epoch, negative before it.
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
