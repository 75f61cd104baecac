//! Compile-once, evaluate-many expressions over a variable binding map.
//!
//! Expressions drive aggregation rules and the router's conditional
//! processing. Sources are parsed with nom into a tree, function names and
//! literal `match()` patterns are resolved at compile time, and evaluation
//! walks the tree against an immutable [`Vars`] map.

mod functions;
mod parse;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;

use crate::metric::{FieldValue, Metric};
use crate::topology::Topology;

pub use functions::Function;
use parse::{Ast, BinaryOp, UnaryOp};

/// Variable bindings visible to an expression.
pub type Vars = HashMap<String, Value>;

/// Errors raised while compiling or evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error in {src:?}: {reason}")]
    Parse { src: String, reason: String },

    #[error("unknown identifier {0:?}")]
    UnknownIdentifier(String),

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("{name}() takes {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid regular expression {pattern:?}: {reason}")]
    Regex { pattern: String, reason: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("variable {0:?} is not bound")]
    UnboundVariable(String),

    #[error("key {0:?} not found")]
    MissingKey(String),

    #[error("expression result is {got}, expected {expected}")]
    ResultType {
        expected: &'static str,
        got: &'static str,
    },
}

/// Result of evaluating an expression, and the type of bound variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Metric(Metric),
}

impl Value {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Metric(_) => "metric",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn string_map(m: &HashMap<String, String>) -> Self {
        Self::Map(
            m.iter()
                .map(|(k, v)| (k.clone(), Self::Str(v.clone())))
                .collect(),
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
            Self::Metric(m) => write!(f, "{m}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Metric> for Value {
    fn from(v: Metric) -> Self {
        Self::Metric(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<&FieldValue> for Value {
    fn from(v: &FieldValue) -> Self {
        match v {
            FieldValue::Float(x) => Self::Float(*x),
            FieldValue::Int(i) => Self::Int(*i),
            FieldValue::Bool(b) => Self::Bool(*b),
            FieldValue::Str(s) => Self::Str(s.clone()),
        }
    }
}

/// Numeric values compare across int/float; everything else structurally.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

#[derive(Debug, Clone)]
enum Node {
    Const(Value),
    Var(String),
    List(Vec<Node>),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    /// `=~`/`!~` with a literal pattern.
    RegexMatch {
        negate: bool,
        subject: Box<Node>,
        regex: Regex,
    },
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
    /// `match()` with a literal pattern.
    MatchConst(Regex, Box<Node>),
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Compiles `src`, allowing any free identifier.
    pub fn compile(src: &str) -> Result<Self, ExprError> {
        Self::build(src, None)
    }

    /// Compiles `src`, rejecting identifiers outside `allowed`.
    pub fn compile_with(src: &str, allowed: &[&str]) -> Result<Self, ExprError> {
        Self::build(src, Some(allowed))
    }

    fn build(src: &str, allowed: Option<&[&str]>) -> Result<Self, ExprError> {
        let ast = parse::parse(src)?;
        let root = resolve(ast, allowed)?;
        Ok(Self {
            source: src.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, vars: &Vars, topo: &dyn Topology) -> Result<Value, ExprError> {
        eval(&self.root, vars, topo)
    }

    pub fn eval_bool(&self, vars: &Vars, topo: &dyn Topology) -> Result<bool, ExprError> {
        match self.eval(vars, topo)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::ResultType {
                expected: "bool",
                got: other.type_name(),
            }),
        }
    }

    pub fn eval_f64(&self, vars: &Vars, topo: &dyn Topology) -> Result<f64, ExprError> {
        let v = self.eval(vars, topo)?;
        v.as_f64().ok_or(ExprError::ResultType {
            expected: "number",
            got: v.type_name(),
        })
    }
}

fn resolve(ast: Ast, allowed: Option<&[&str]>) -> Result<Node, ExprError> {
    let r = |a: Ast| resolve(a, allowed).map(Box::new);

    let node = match ast {
        Ast::Bool(b) => Node::Const(Value::Bool(b)),
        Ast::Int(i) => Node::Const(Value::Int(i)),
        Ast::Float(f) => Node::Const(Value::Float(f)),
        Ast::Str(s) => Node::Const(Value::Str(s)),
        Ast::List(items) => Node::List(
            items
                .into_iter()
                .map(|a| resolve(a, allowed))
                .collect::<Result<_, _>>()?,
        ),
        Ast::Ident(name) => {
            if let Some(allowed) = allowed {
                if !allowed.contains(&name.as_str()) {
                    return Err(ExprError::UnknownIdentifier(name));
                }
            }
            Node::Var(name)
        }
        Ast::Unary(op, inner) => Node::Unary(op, r(*inner)?),
        Ast::Binary(op @ (BinaryOp::Match | BinaryOp::NotMatch), lhs, rhs) => match *rhs {
            Ast::Str(pattern) => Node::RegexMatch {
                negate: op == BinaryOp::NotMatch,
                subject: r(*lhs)?,
                regex: Regex::new(&pattern).map_err(|e| ExprError::Regex {
                    pattern,
                    reason: e.to_string(),
                })?,
            },
            rhs => Node::Binary(op, r(*lhs)?, r(rhs)?),
        },
        Ast::Binary(op, lhs, rhs) => Node::Binary(op, r(*lhs)?, r(*rhs)?),
        Ast::Ternary(c, a, b) => Node::Ternary(r(*c)?, r(*a)?, r(*b)?),
        Ast::Member(base, name) => Node::Member(r(*base)?, name),
        Ast::Index(base, idx) => Node::Index(r(*base)?, r(*idx)?),
        Ast::Call(name, args) => {
            let func = Function::lookup(&name).ok_or(ExprError::UnknownFunction(name))?;
            if args.len() != func.arity() {
                return Err(ExprError::Arity {
                    name: func.name(),
                    expected: func.arity(),
                    got: args.len(),
                });
            }
            let mut args: Vec<Node> = args
                .into_iter()
                .map(|a| resolve(a, allowed))
                .collect::<Result<_, _>>()?;

            let literal = match (func, args.first()) {
                (Function::Match, Some(Node::Const(Value::Str(pattern)))) => {
                    Some(functions::compile_pattern(pattern)?)
                }
                _ => None,
            };
            match literal {
                Some(regex) => {
                    let subject = args.swap_remove(1);
                    Node::MatchConst(regex, Box::new(subject))
                }
                None => Node::Call(func, args),
            }
        }
    };
    Ok(node)
}

fn eval(node: &Node, vars: &Vars, topo: &dyn Topology) -> Result<Value, ExprError> {
    match node {
        Node::Const(v) => Ok(v.clone()),
        Node::Var(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnboundVariable(name.clone())),
        Node::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|n| eval(n, vars, topo))
                .collect::<Result<_, _>>()?,
        )),
        Node::Unary(op, inner) => match (op, eval(inner, vars, topo)?) {
            (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
            (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(|| {
                ExprError::InvalidArgument(format!("integer overflow negating {i}"))
            }),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (op, v) => Err(ExprError::Type(format!(
                "unary {op:?} not defined for {}",
                v.type_name()
            ))),
        },
        Node::Binary(BinaryOp::And, lhs, rhs) => {
            Ok(Value::Bool(as_bool(eval(lhs, vars, topo)?)? && as_bool(eval(rhs, vars, topo)?)?))
        }
        Node::Binary(BinaryOp::Or, lhs, rhs) => {
            Ok(Value::Bool(as_bool(eval(lhs, vars, topo)?)? || as_bool(eval(rhs, vars, topo)?)?))
        }
        Node::Binary(op, lhs, rhs) => binary(*op, eval(lhs, vars, topo)?, eval(rhs, vars, topo)?),
        Node::RegexMatch {
            negate,
            subject,
            regex,
        } => match eval(subject, vars, topo)? {
            Value::Str(s) => Ok(Value::Bool(regex.is_match(&s) != *negate)),
            other => Err(ExprError::Type(format!(
                "regex match on {}",
                other.type_name()
            ))),
        },
        Node::Ternary(c, a, b) => {
            if as_bool(eval(c, vars, topo)?)? {
                eval(a, vars, topo)
            } else {
                eval(b, vars, topo)
            }
        }
        Node::Member(base, name) => member(eval(base, vars, topo)?, name),
        Node::Index(base, idx) => index(eval(base, vars, topo)?, eval(idx, vars, topo)?),
        Node::Call(func, args) => {
            let args = args
                .iter()
                .map(|n| eval(n, vars, topo))
                .collect::<Result<Vec<_>, _>>()?;
            func.call(args, topo)
        }
        Node::MatchConst(regex, subject) => match eval(subject, vars, topo)? {
            Value::Str(s) => Ok(Value::Bool(regex.is_match(&s))),
            _ => Ok(Value::Bool(false)),
        },
    }
}

fn as_bool(v: Value) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Type(format!(
            "expected bool, got {}",
            other.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    use std::cmp::Ordering;

    let type_error = |lhs: &Value, rhs: &Value| {
        ExprError::Type(format!(
            "{op:?} not defined for {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ))
    };

    let ordering = |lhs: &Value, rhs: &Value| -> Result<Ordering, ExprError> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            _ => match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| type_error(lhs, rhs)),
                _ => Err(type_error(lhs, rhs)),
            },
        }
    };

    let v = match op {
        BinaryOp::Eq => Value::Bool(values_equal(&lhs, &rhs)),
        BinaryOp::Ne => Value::Bool(!values_equal(&lhs, &rhs)),
        BinaryOp::Lt => Value::Bool(ordering(&lhs, &rhs)? == Ordering::Less),
        BinaryOp::Le => Value::Bool(ordering(&lhs, &rhs)? != Ordering::Greater),
        BinaryOp::Gt => Value::Bool(ordering(&lhs, &rhs)? == Ordering::Greater),
        BinaryOp::Ge => Value::Bool(ordering(&lhs, &rhs)? != Ordering::Less),
        BinaryOp::In => Value::Bool(functions::contains(&lhs, &rhs)),
        BinaryOp::Match | BinaryOp::NotMatch => match (&lhs, &rhs) {
            (Value::Str(s), Value::Str(p)) => {
                let regex = Regex::new(p).map_err(|e| ExprError::Regex {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })?;
                Value::Bool(regex.is_match(s) == (op == BinaryOp::Match))
            }
            _ => return Err(type_error(&lhs, &rhs)),
        },
        BinaryOp::Add => match (&lhs, &rhs) {
            (Value::Str(a), Value::Str(b)) => Value::Str(format!("{a}{b}")),
            _ => arith(&lhs, &rhs, i64::checked_add, |a, b| a + b)
                .ok_or_else(|| type_error(&lhs, &rhs))?,
        },
        BinaryOp::Sub => arith(&lhs, &rhs, i64::checked_sub, |a, b| a - b)
            .ok_or_else(|| type_error(&lhs, &rhs))?,
        BinaryOp::Mul => arith(&lhs, &rhs, i64::checked_mul, |a, b| a * b)
            .ok_or_else(|| type_error(&lhs, &rhs))?,
        BinaryOp::Div => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Value::Float(a / b),
            _ => return Err(type_error(&lhs, &rhs)),
        },
        BinaryOp::Rem => match (&lhs, &rhs) {
            (Value::Int(_), Value::Int(0)) => {
                return Err(ExprError::InvalidArgument("modulo by zero".to_string()))
            }
            (Value::Int(a), Value::Int(b)) => {
                Value::Int(a.checked_rem(*b).ok_or_else(|| {
                    ExprError::InvalidArgument(format!("integer overflow in {a} % {b}"))
                })?)
            }
            _ => return Err(type_error(&lhs, &rhs)),
        },
        BinaryOp::And => Value::Bool(as_bool(lhs)? && as_bool(rhs)?),
        BinaryOp::Or => Value::Bool(as_bool(lhs)? || as_bool(rhs)?),
    };
    Ok(v)
}

/// Int op Int stays Int (overflow is an error); any float promotes.
fn arith(
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b).map(Value::Int),
        _ => Some(Value::Float(float_op(lhs.as_f64()?, rhs.as_f64()?))),
    }
}

fn member(base: Value, name: &str) -> Result<Value, ExprError> {
    match base {
        Value::Metric(m) => match name {
            "Name" | "name" => Ok(Value::Str(m.name().to_string())),
            "Time" | "time" => Ok(Value::Int(m.unix_seconds())),
            "Tags" | "tags" => Ok(Value::string_map(m.tags())),
            "Meta" | "meta" => Ok(Value::string_map(m.meta())),
            "Fields" | "fields" => Ok(Value::Map(
                m.fields()
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            )),
            "Value" | "value" => m
                .value()
                .map(Value::from)
                .ok_or_else(|| ExprError::MissingKey("value".to_string())),
            other => Err(ExprError::MissingKey(other.to_string())),
        },
        Value::Map(mut m) => m
            .remove(name)
            .ok_or_else(|| ExprError::MissingKey(name.to_string())),
        other => Err(ExprError::Type(format!(
            "member {name:?} on {}",
            other.type_name()
        ))),
    }
}

fn index(base: Value, idx: Value) -> Result<Value, ExprError> {
    match (base, idx) {
        (Value::Map(mut m), Value::Str(key)) => m.remove(&key).ok_or(ExprError::MissingKey(key)),
        (Value::List(items), Value::Int(i)) => usize::try_from(i)
            .ok()
            .and_then(|i| items.into_iter().nth(i))
            .ok_or_else(|| ExprError::InvalidArgument(format!("index {i} out of range"))),
        (Value::Metric(m), Value::Str(key)) => member(Value::Metric(m), &key),
        (base, idx) => Err(ExprError::Type(format!(
            "cannot index {} with {}",
            base.type_name(),
            idx.type_name()
        ))),
    }
}

/// Rewrites config-friendly quoting: `'` becomes `"` and `%` becomes `\`.
pub fn normalize(src: &str) -> String {
    src.replace('\'', "\"").replace('%', "\\")
}

/// Evaluates ad-hoc condition strings, caching compiled forms by source.
pub struct ExprEvaluator {
    topology: Arc<dyn Topology>,
    cache: Mutex<HashMap<String, Arc<Expression>>>,
}

impl fmt::Debug for ExprEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExprEvaluator")
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl ExprEvaluator {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        Self {
            topology,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compiles and caches `src` without evaluating it.
    pub fn prepare(&self, src: &str) -> Result<Arc<Expression>, ExprError> {
        if let Some(e) = self.cache.lock().get(src) {
            return Ok(Arc::clone(e));
        }

        let compiled = Arc::new(Expression::compile(&normalize(src))?);
        self.cache
            .lock()
            .insert(src.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn eval_bool(&self, src: &str, vars: &Vars) -> Result<bool, ExprError> {
        self.prepare(src)?.eval_bool(vars, self.topology.as_ref())
    }

    pub fn eval_f64(&self, src: &str, vars: &Vars) -> Result<f64, ExprError> {
        self.prepare(src)?.eval_f64(vars, self.topology.as_ref())
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }
}
