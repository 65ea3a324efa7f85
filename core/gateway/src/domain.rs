//! Structured filter expressions sent to the remote gateway.
//!
//! A domain is a boolean combination of `(field, operator, value)`
//! triples. `write_date` comparisons are the sync-critical operators:
//! incremental pulls are built from a strict `write_date >` condition.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use erpsync_common::Record;

/// Comparison operator in a domain condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "ilike")]
    Ilike,
}

impl CompareOp {
    /// Wire representation of the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Like => "like",
            CompareOp::Ilike => "ilike",
        }
    }
}

/// A single `(field, operator, value)` filter triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    /// Create a condition.
    pub fn new(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluate this condition against a record.
    ///
    /// A missing field only satisfies negative operators (`!=`, `not in`).
    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(&self.field);
        match self.op {
            CompareOp::Eq => actual == Some(&self.value),
            CompareOp::Ne => actual != Some(&self.value),
            CompareOp::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            CompareOp::Ge => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            CompareOp::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            CompareOp::Le => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            CompareOp::In => in_set(actual, &self.value),
            CompareOp::NotIn => !in_set(actual, &self.value),
            CompareOp::Like => like(actual, &self.value, false),
            CompareOp::Ilike => like(actual, &self.value, true),
        }
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual?, expected) {
        // Lexicographic order matches chronological order for the
        // server datetime format, so write_date filters work on strings.
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (a, b) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            a.partial_cmp(&b)
        }
    }
}

fn in_set(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(v), Value::Array(set)) => set.contains(v),
        _ => false,
    }
}

fn like(actual: Option<&Value>, expected: &Value, fold_case: bool) -> bool {
    let (Some(Value::String(haystack)), Value::String(needle)) = (actual, expected) else {
        return false;
    };
    let needle = needle.trim_matches('%');
    if fold_case {
        haystack.to_lowercase().contains(&needle.to_lowercase())
    } else {
        haystack.contains(needle)
    }
}

/// A node in a domain expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainExpr {
    /// A single condition.
    Cond(Condition),
    /// All children must match.
    All(Vec<DomainExpr>),
    /// At least one child must match.
    Any(Vec<DomainExpr>),
}

impl DomainExpr {
    fn matches(&self, record: &Record) -> bool {
        match self {
            DomainExpr::Cond(c) => c.matches(record),
            DomainExpr::All(children) => children.iter().all(|e| e.matches(record)),
            DomainExpr::Any(children) => children.iter().any(|e| e.matches(record)),
        }
    }

    fn to_wire(&self) -> Value {
        match self {
            DomainExpr::Cond(c) => json!([c.field, c.op.as_str(), c.value]),
            DomainExpr::All(children) => {
                json!({ "and": children.iter().map(DomainExpr::to_wire).collect::<Vec<_>>() })
            }
            DomainExpr::Any(children) => {
                json!({ "or": children.iter().map(DomainExpr::to_wire).collect::<Vec<_>>() })
            }
        }
    }
}

/// A filter domain: an implicit AND over its top-level expressions.
///
/// The empty domain matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain {
    exprs: Vec<DomainExpr>,
}

impl Domain {
    /// The unrestricted domain.
    pub fn all() -> Self {
        Self::default()
    }

    /// Domain with a single condition.
    pub fn filter(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            exprs: vec![DomainExpr::Cond(Condition::new(field, op, value))],
        }
    }

    /// AND another condition onto this domain.
    pub fn and(mut self, field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        self.exprs
            .push(DomainExpr::Cond(Condition::new(field, op, value)));
        self
    }

    /// AND a disjunction of conditions onto this domain.
    pub fn and_any(mut self, conditions: Vec<Condition>) -> Self {
        self.exprs
            .push(DomainExpr::Any(conditions.into_iter().map(DomainExpr::Cond).collect()));
        self
    }

    /// AND every expression of another domain onto this one.
    pub fn merge(mut self, other: Domain) -> Self {
        self.exprs.extend(other.exprs);
        self
    }

    /// Whether this is the unrestricted domain.
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Evaluate the domain against a record.
    pub fn matches(&self, record: &Record) -> bool {
        self.exprs.iter().all(|e| e.matches(record))
    }

    /// Wire representation: a JSON array of triples/groups.
    pub fn to_wire(&self) -> Value {
        Value::Array(self.exprs.iter().map(DomainExpr::to_wire).collect())
    }

    /// Top-level expressions.
    pub fn exprs(&self) -> &[DomainExpr] {
        &self.exprs
    }
}
