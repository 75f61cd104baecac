use regex::Regex;

use super::{values_equal, ExprError, Value};
use crate::topology::Topology;

/// Every function callable from an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sum,
    Min,
    Max,
    Avg,
    Median,
    Len,
    Match,
    GetCpuCore,
    GetCpuSocket,
    GetCpuNuma,
    GetCpuDie,
    GetSockCpuList,
    GetNumaCpuList,
    GetDieCpuList,
    GetCoreCpuList,
    GetCpuList,
    GetCpuListOfType,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Self> {
        let f = match name {
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "avg" | "mean" => Self::Avg,
            "median" => Self::Median,
            "len" => Self::Len,
            "match" => Self::Match,
            "getCpuCore" => Self::GetCpuCore,
            "getCpuSocket" => Self::GetCpuSocket,
            "getCpuNuma" => Self::GetCpuNuma,
            "getCpuDie" => Self::GetCpuDie,
            "getSockCpuList" => Self::GetSockCpuList,
            "getNumaCpuList" => Self::GetNumaCpuList,
            "getDieCpuList" => Self::GetDieCpuList,
            "getCoreCpuList" => Self::GetCoreCpuList,
            "getCpuList" => Self::GetCpuList,
            "getCpuListOfType" => Self::GetCpuListOfType,
            _ => return None,
        };
        Some(f)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Median => "median",
            Self::Len => "len",
            Self::Match => "match",
            Self::GetCpuCore => "getCpuCore",
            Self::GetCpuSocket => "getCpuSocket",
            Self::GetCpuNuma => "getCpuNuma",
            Self::GetCpuDie => "getCpuDie",
            Self::GetSockCpuList => "getSockCpuList",
            Self::GetNumaCpuList => "getNumaCpuList",
            Self::GetDieCpuList => "getDieCpuList",
            Self::GetCoreCpuList => "getCoreCpuList",
            Self::GetCpuList => "getCpuList",
            Self::GetCpuListOfType => "getCpuListOfType",
        }
    }

    pub const fn arity(self) -> usize {
        match self {
            Self::GetCpuList => 0,
            Self::Match | Self::GetCpuListOfType => 2,
            _ => 1,
        }
    }

    pub(super) fn call(self, args: Vec<Value>, topo: &dyn Topology) -> Result<Value, ExprError> {
        let mut args = args.into_iter();
        let mut next = || args.next().ok_or(ExprError::Arity {
            name: self.name(),
            expected: self.arity(),
            got: 0,
        });

        match self {
            Self::Sum => fold_numbers(self, &next()?, |a, b| a.checked_add(b), |a, b| a + b),
            Self::Min => fold_numbers(self, &next()?, |a, b| Some(a.min(b)), f64::min),
            Self::Max => fold_numbers(self, &next()?, |a, b| Some(a.max(b)), f64::max),
            Self::Avg => {
                let values = numbers(self, &next()?)?;
                Ok(Value::Float(values.iter().sum::<f64>() / values.len() as f64))
            }
            Self::Median => {
                let mut values = numbers(self, &next()?)?;
                values.sort_by(f64::total_cmp);
                let mid = values.len() / 2;
                let median = if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                };
                Ok(Value::Float(median))
            }
            Self::Len => match next()? {
                Value::List(l) => Ok(Value::Int(l.len() as i64)),
                Value::Map(m) => Ok(Value::Int(m.len() as i64)),
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                other => Err(ExprError::Type(format!(
                    "len() expects a list, map or string, got {}",
                    other.type_name()
                ))),
            },
            Self::Match => {
                let pattern = next()?;
                let subject = next()?;
                match (pattern, subject) {
                    (Value::Str(p), Value::Str(s)) => Ok(Value::Bool(compile_pattern(&p)?.is_match(&s))),
                    _ => Ok(Value::Bool(false)),
                }
            }
            Self::GetCpuCore => Ok(Value::Int(topo.cpu_core(id_arg(self, &next()?)?).unwrap_or(-1))),
            Self::GetCpuSocket => Ok(Value::Int(topo.cpu_socket(id_arg(self, &next()?)?).unwrap_or(-1))),
            Self::GetCpuNuma => Ok(Value::Int(topo.cpu_numa(id_arg(self, &next()?)?).unwrap_or(-1))),
            Self::GetCpuDie => Ok(Value::Int(topo.cpu_die(id_arg(self, &next()?)?).unwrap_or(-1))),
            Self::GetSockCpuList => Ok(int_list(topo.socket_cpus(id_arg(self, &next()?)?))),
            Self::GetNumaCpuList => Ok(int_list(topo.numa_cpus(id_arg(self, &next()?)?))),
            Self::GetDieCpuList => Ok(int_list(topo.die_cpus(id_arg(self, &next()?)?))),
            Self::GetCoreCpuList => Ok(int_list(topo.core_cpus(id_arg(self, &next()?)?))),
            Self::GetCpuList => Ok(int_list(topo.cpu_list())),
            Self::GetCpuListOfType => {
                let kind = next()?;
                let id = next()?;
                let Value::Str(kind) = kind else {
                    return Err(ExprError::Type(format!(
                        "getCpuListOfType() expects a string type, got {}",
                        kind.type_name()
                    )));
                };
                let cpus = match kind.as_str() {
                    "node" => topo.cpu_list(),
                    "socket" => topo.socket_cpus(id_arg(self, &id)?),
                    "die" => topo.die_cpus(id_arg(self, &id)?),
                    "numadomain" | "memoryDomain" => topo.numa_cpus(id_arg(self, &id)?),
                    "core" => topo.core_cpus(id_arg(self, &id)?),
                    "hwthread" => vec![id_arg(self, &id)?],
                    other => {
                        return Err(ExprError::InvalidArgument(format!(
                            "getCpuListOfType(): unknown type {other:?}"
                        )))
                    }
                };
                Ok(int_list(cpus))
            }
        }
    }
}

/// Compiles a `match()` pattern. `%` stands in for `\` so patterns survive
/// JSON/YAML quoting.
pub(super) fn compile_pattern(pattern: &str) -> Result<Regex, ExprError> {
    let translated = pattern.replace('%', "\\");
    Regex::new(&translated).map_err(|e| ExprError::Regex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// `in` operator: substring, list membership, int within string, map key.
pub(super) fn contains(needle: &Value, haystack: &Value) -> bool {
    match (needle, haystack) {
        (Value::Str(n), Value::Str(h)) => h.contains(n.as_str()),
        (Value::Int(n), Value::Str(h)) => h.contains(&n.to_string()),
        (n, Value::List(items)) => items.iter().any(|item| values_equal(n, item)),
        (Value::Str(n), Value::Map(m)) => m.contains_key(n),
        _ => false,
    }
}

fn int_list(cpus: Vec<i64>) -> Value {
    Value::List(cpus.into_iter().map(Value::Int).collect())
}

/// CPU and domain ids may arrive as strings when taken from a `type-id` tag.
fn id_arg(f: Function, v: &Value) -> Result<i64, ExprError> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Str(s) => s.trim().parse::<i64>().map_err(|_| {
            ExprError::InvalidArgument(format!("{}(): {s:?} is not an integer id", f.name()))
        }),
        other => Err(ExprError::Type(format!(
            "{}() expects an int id, got {}",
            f.name(),
            other.type_name()
        ))),
    }
}

fn list_arg<'a>(f: Function, v: &'a Value) -> Result<&'a [Value], ExprError> {
    match v {
        Value::List(items) if items.is_empty() => Err(ExprError::InvalidArgument(format!(
            "{}() requires at least one value",
            f.name()
        ))),
        Value::List(items) => Ok(items),
        other => Err(ExprError::Type(format!(
            "{}() expects a list of numbers, got {}",
            f.name(),
            other.type_name()
        ))),
    }
}

fn numbers(f: Function, v: &Value) -> Result<Vec<f64>, ExprError> {
    list_arg(f, v)?
        .iter()
        .map(|item| match item {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(x) => Ok(*x),
            other => Err(ExprError::Type(format!(
                "{}() expects numbers, got {}",
                f.name(),
                other.type_name()
            ))),
        })
        .collect()
}

/// Folds a numeric list, staying in integers while every element is an int.
fn fold_numbers(
    f: Function,
    v: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, ExprError> {
    let items = list_arg(f, v)?;

    let ints: Option<Vec<i64>> = items
        .iter()
        .map(|item| match item {
            Value::Int(i) => Some(*i),
            _ => None,
        })
        .collect();

    if let Some(ints) = ints {
        let mut acc = ints[0];
        for i in &ints[1..] {
            acc = int_op(acc, *i).ok_or_else(|| {
                ExprError::InvalidArgument(format!("{}(): integer overflow", f.name()))
            })?;
        }
        return Ok(Value::Int(acc));
    }

    let floats = numbers(f, v)?;
    let mut acc = floats[0];
    for x in &floats[1..] {
        acc = float_op(acc, *x);
    }
    Ok(Value::Float(acc))
}
