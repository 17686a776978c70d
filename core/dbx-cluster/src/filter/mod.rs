//! Scan Predicates — 스캔 조건 트리
//!
//! A [`Predicate`] tree is compiled two ways:
//! - [`compiler`]: into a server-evaluated [`FilterProgram`](compiler::FilterProgram)
//! - [`bounds`]: into key ranges on an index column
//!
//! [`QueryPredicate`] wraps a tree and caches its first compiler pass.

pub mod bounds;
pub mod compiler;

use crate::error::{DbxError, DbxResult};
use crate::schema::{TableMetadata, Value};
use ahash::AHashMap;
use bounds::NumberLine;
use compiler::{FilterProgram, FilterSpec};
use std::sync::{Arc, OnceLock};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    /// Apply to an already computed ordering of `column` against the operand.
    pub fn matches(&self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparator::Eq => ord == Equal,
            Comparator::Ne => ord != Equal,
            Comparator::Lt => ord == Less,
            Comparator::Le => ord != Greater,
            Comparator::Gt => ord == Greater,
            Comparator::Ge => ord != Less,
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// Bound per execution from [`Params`]
    Param(String),
}

impl Operand {
    pub fn param(name: impl Into<String>) -> Self {
        Operand::Param(name.into())
    }

    pub fn is_param(&self) -> bool {
        matches!(self, Operand::Param(_))
    }
}

macro_rules! literal_operand {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Operand {
            fn from(v: $ty) -> Self {
                Operand::Literal(Value::from(v))
            }
        }
    )*};
}

literal_operand!(bool, i32, i64, u64, f64, &str, String, Vec<u8>);

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Literal(v)
    }
}

/// Predicate tree over the columns of one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        column: String,
        op: Comparator,
        operand: Operand,
    },
    /// `low <= column <= high`
    Between {
        column: String,
        low: Operand,
        high: Operand,
    },
    IsNull(String),
    IsNotNull(String),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: Comparator, operand: impl Into<Operand>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            operand: operand.into(),
        }
    }

    pub fn eq(column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::compare(column, Comparator::Eq, operand)
    }

    pub fn ne(column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::compare(column, Comparator::Ne, operand)
    }

    pub fn lt(column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::compare(column, Comparator::Lt, operand)
    }

    pub fn le(column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::compare(column, Comparator::Le, operand)
    }

    pub fn gt(column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::compare(column, Comparator::Gt, operand)
    }

    pub fn ge(column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::compare(column, Comparator::Ge, operand)
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<Operand>,
        high: impl Into<Operand>,
    ) -> Self {
        Predicate::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Predicate::IsNotNull(column.into())
    }

    /// Conjunction; nested ANDs are flattened.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut children) => {
                children.push(other);
                Predicate::And(children)
            }
            this => Predicate::And(vec![this, other]),
        }
    }

    /// Disjunction; nested ORs are flattened.
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut children) => {
                children.push(other);
                Predicate::Or(children)
            }
            this => Predicate::Or(vec![this, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// True when no operand in the tree is a parameter.
    pub fn is_constant(&self) -> bool {
        match self {
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().all(Predicate::is_constant)
            }
            Predicate::Not(child) => child.is_constant(),
            Predicate::Compare { operand, .. } => !operand.is_param(),
            Predicate::Between { low, high, .. } => !low.is_param() && !high.is_param(),
            Predicate::IsNull(_) | Predicate::IsNotNull(_) => true,
        }
    }
}

/// Parameter values for one execution.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: AHashMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub(crate) fn require(&self, name: &str) -> DbxResult<&Value> {
        self.get(name)
            .ok_or_else(|| DbxError::MissingParameter(name.to_string()))
    }
}

/// A predicate tree plus its cached layout pass.
#[derive(Debug)]
pub struct QueryPredicate {
    root: Predicate,
    spec: OnceLock<FilterSpec>,
}

impl QueryPredicate {
    pub fn new(root: Predicate) -> Arc<Self> {
        Arc::new(Self {
            root,
            spec: OnceLock::new(),
        })
    }

    pub fn root(&self) -> &Predicate {
        &self.root
    }

    /// Layout pass against `table`, computed on first use.
    pub fn filter_spec(&self, table: &TableMetadata) -> DbxResult<&FilterSpec> {
        let spec = match self.spec.get() {
            Some(spec) => spec,
            None => {
                let spec = FilterSpec::analyze(&self.root, table)?;
                // a concurrent first use may have won; either result is equivalent
                let _ = self.spec.set(spec);
                self.spec.get().ok_or_else(|| {
                    DbxError::invalid_operation("filter layout missing", "QueryPredicate")
                })?
            }
        };
        if spec.table() != table.qualified_name() {
            return Err(DbxError::invalid_operation(
                format!(
                    "predicate compiled for '{}' used against '{}'",
                    spec.table(),
                    table.qualified_name()
                ),
                "QueryPredicate::filter_spec",
            ));
        }
        Ok(spec)
    }

    /// Filter program for one execution.
    pub fn program(&self, table: &TableMetadata, params: &Params) -> DbxResult<Arc<FilterProgram>> {
        self.filter_spec(table)?.program(table, params)
    }

    /// Range of `column` a scan filtered by this predicate has to read.
    pub fn bounds(&self, column: &str, params: &Params) -> NumberLine {
        bounds::compile_bounds(&self.root, column, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_flatten() {
        let p = Predicate::eq("a", 1)
            .and(Predicate::eq("b", 2))
            .and(Predicate::eq("c", 3));
        assert!(matches!(&p, Predicate::And(children) if children.len() == 3));
    }

    #[test]
    fn test_constant_detection() {
        assert!(Predicate::eq("a", 1).or(Predicate::is_null("b")).is_constant());
        assert!(!Predicate::eq("a", Operand::param("x")).is_constant());
    }

    #[test]
    fn test_missing_param() {
        let params = Params::new().with("a", 1);
        assert!(params.require("a").is_ok());
        assert!(matches!(params.require("b"), Err(DbxError::MissingParameter(_))));
    }
}
