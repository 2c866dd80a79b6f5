//! Structured filter predicates.
//!
//! # Responsibility
//! - Define the storage-agnostic filter language accepted by repositories.
//! - Keep the wire shape stable: plain nested records keyed by `operator`.
//!
//! # Invariants
//! - A `Predicate` is an immutable strict tree (no sharing, no cycles).
//! - `And`/`Or` must hold at least one child; the compiler rejects empty
//!   junctions instead of guessing.
//! - Field references and literals stay distinct all the way to the store.

mod compile;

pub use compile::{compile, CompileError, CompiledExpression};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt::{Display, Formatter};

/// Scalar literal usable on either side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(Number),
    String(String),
}

impl Scalar {
    /// Returns the document value sent to the store.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(value) => Value::Bool(*value),
            Self::Number(value) => Value::Number(value.clone()),
            Self::String(value) => Value::String(value.clone()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

/// Error for non-finite floats, which have no document representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonFiniteNumber(pub f64);

impl Display for NonFiniteNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "number `{}` cannot be stored", self.0)
    }
}

impl std::error::Error for NonFiniteNumber {}

impl TryFrom<f64> for Scalar {
    type Error = NonFiniteNumber;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Number::from_f64(value)
            .map(Self::Number)
            .ok_or(NonFiniteNumber(value))
    }
}

/// Reference to a record attribute by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub name: String,
}

/// One side of a comparison.
///
/// On the wire a field reference is `{"name": "..."}`; anything else is a
/// literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Field(FieldRef),
    Literal(Scalar),
}

impl Operand {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(FieldRef { name: name.into() })
    }

    pub fn literal(value: impl Into<Scalar>) -> Self {
        Self::Literal(value.into())
    }
}

impl From<Scalar> for Operand {
    fn from(value: Scalar) -> Self {
        Self::Literal(value)
    }
}

macro_rules! literal_operand_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Self::Literal(value.into())
                }
            }
        )*
    };
}

literal_operand_from!(&str, String, bool, i64, i32, u64);

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Lt,
    Le,
    Eq,
    Gt,
    Ge,
    Ne,
    Contains,
    NotContains,
}

/// Recursive filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WirePredicate", into = "WirePredicate")]
pub enum Predicate {
    Comparison {
        lhs: Operand,
        op: ComparisonOp,
        rhs: Operand,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(lhs: impl Into<Operand>, op: ComparisonOp, rhs: impl Into<Operand>) -> Self {
        Self::Comparison {
            lhs: lhs.into(),
            op,
            rhs: rhs.into(),
        }
    }

    /// `field = value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::Ge, value)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::Contains, value)
    }

    pub fn not_contains(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(Operand::field(field), ComparisonOp::NotContains, value)
    }

    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self::And(predicates.into_iter().collect())
    }

    pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self::Or(predicates.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    /// Number of leaf operands (literals and field references) in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Comparison { .. } => 2,
            Self::And(children) | Self::Or(children) => {
                children.iter().map(Predicate::leaf_count).sum()
            }
            Self::Not(inner) => inner.leaf_count(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "operator")]
enum WirePredicate {
    #[serde(rename = "<")]
    Lt { lhs: Operand, rhs: Operand },
    #[serde(rename = "<=")]
    Le { lhs: Operand, rhs: Operand },
    #[serde(rename = "=")]
    Eq { lhs: Operand, rhs: Operand },
    #[serde(rename = ">")]
    Gt { lhs: Operand, rhs: Operand },
    #[serde(rename = ">=")]
    Ge { lhs: Operand, rhs: Operand },
    #[serde(rename = "!=")]
    Ne { lhs: Operand, rhs: Operand },
    #[serde(rename = "CONTAINS")]
    Contains { lhs: Operand, rhs: Operand },
    #[serde(rename = "NOT CONTAINS")]
    NotContains { lhs: Operand, rhs: Operand },
    #[serde(rename = "AND")]
    And { predicates: Vec<Predicate> },
    #[serde(rename = "OR")]
    Or { predicates: Vec<Predicate> },
    #[serde(rename = "NOT")]
    Not { expr: Box<Predicate> },
}

impl From<WirePredicate> for Predicate {
    fn from(value: WirePredicate) -> Self {
        let comparison = |lhs, op, rhs| Predicate::Comparison { lhs, op, rhs };
        match value {
            WirePredicate::Lt { lhs, rhs } => comparison(lhs, ComparisonOp::Lt, rhs),
            WirePredicate::Le { lhs, rhs } => comparison(lhs, ComparisonOp::Le, rhs),
            WirePredicate::Eq { lhs, rhs } => comparison(lhs, ComparisonOp::Eq, rhs),
            WirePredicate::Gt { lhs, rhs } => comparison(lhs, ComparisonOp::Gt, rhs),
            WirePredicate::Ge { lhs, rhs } => comparison(lhs, ComparisonOp::Ge, rhs),
            WirePredicate::Ne { lhs, rhs } => comparison(lhs, ComparisonOp::Ne, rhs),
            WirePredicate::Contains { lhs, rhs } => comparison(lhs, ComparisonOp::Contains, rhs),
            WirePredicate::NotContains { lhs, rhs } => {
                comparison(lhs, ComparisonOp::NotContains, rhs)
            }
            WirePredicate::And { predicates } => Predicate::And(predicates),
            WirePredicate::Or { predicates } => Predicate::Or(predicates),
            WirePredicate::Not { expr } => Predicate::Not(expr),
        }
    }
}

impl From<Predicate> for WirePredicate {
    fn from(value: Predicate) -> Self {
        match value {
            Predicate::Comparison { lhs, op, rhs } => match op {
                ComparisonOp::Lt => Self::Lt { lhs, rhs },
                ComparisonOp::Le => Self::Le { lhs, rhs },
                ComparisonOp::Eq => Self::Eq { lhs, rhs },
                ComparisonOp::Gt => Self::Gt { lhs, rhs },
                ComparisonOp::Ge => Self::Ge { lhs, rhs },
                ComparisonOp::Ne => Self::Ne { lhs, rhs },
                ComparisonOp::Contains => Self::Contains { lhs, rhs },
                ComparisonOp::NotContains => Self::NotContains { lhs, rhs },
            },
            Predicate::And(predicates) => Self::And { predicates },
            Predicate::Or(predicates) => Self::Or { predicates },
            Predicate::Not(expr) => Self::Not { expr },
        }
    }
}
