//! Query Model
//!
//! Parameterized query templates: a source (tables and joins), a list of
//! projected expressions and a boolean test. Evaluation belongs to the
//! store; this module only describes queries.

use crate::domain::value_objects::{Column, Table, Value};
use std::collections::BTreeSet;

/// A use of a table inside a query source.
///
/// The alias distinguishes two uses of the same table in a self-join.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableReference {
    pub table: Table,
    pub alias: String,
}

impl TableReference {
    pub fn new(table: Table) -> Self {
        let alias = table.id().to_string();
        Self { table, alias }
    }

    pub fn aliased(table: Table, alias: impl Into<String>) -> Self {
        Self {
            table,
            alias: alias.into(),
        }
    }

    /// Reference one of this table's columns.
    pub fn column(&self, column: &Column) -> Expression {
        Expression::Column(ColumnReference {
            table: self.clone(),
            column: column.clone(),
        })
    }
}

/// A column of a particular table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnReference {
    pub table: TableReference,
    pub column: Column,
}

/// Where query rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Table(TableReference),
    /// Inner join: every combination of left and right rows.
    Join { left: Box<Source>, right: Box<Source> },
}

impl Source {
    pub fn join(left: Source, right: Source) -> Self {
        Self::Join {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Table references in source order.
    pub fn references(&self) -> Vec<&TableReference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a TableReference>) {
        match self {
            Self::Table(r) => out.push(r),
            Self::Join { left, right } => {
                left.collect_references(out);
                right.collect_references(out);
            }
        }
    }

    /// Distinct tables read by this source.
    pub fn tables(&self) -> BTreeSet<Table> {
        self.references().into_iter().map(|r| r.table.clone()).collect()
    }
}

impl From<TableReference> for Source {
    fn from(r: TableReference) -> Self {
        Self::Table(r)
    }
}

/// A scalar expression over the rows of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Column(ColumnReference),
    Constant(Value),
    /// Positional parameter bound at subscribe time.
    Parameter(usize),
    Equal(Box<Expression>, Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    pub fn parameter(index: usize) -> Self {
        Self::Parameter(index)
    }

    pub fn equal(left: Expression, right: Expression) -> Self {
        Self::Equal(Box::new(left), Box::new(right))
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    pub fn not(inner: Expression) -> Self {
        Self::Not(Box::new(inner))
    }

    /// One past the highest parameter index used, or 0.
    fn parameter_bound(&self) -> usize {
        match self {
            Self::Parameter(i) => i + 1,
            Self::Column(_) | Self::Constant(_) => 0,
            Self::Equal(a, b) | Self::And(a, b) | Self::Or(a, b) => {
                a.parameter_bound().max(b.parameter_bound())
            }
            Self::Not(a) => a.parameter_bound(),
        }
    }
}

/// A parameterized query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    pub expressions: Vec<Expression>,
    pub source: Source,
    pub test: Expression,
    parameter_count: usize,
}

impl QueryTemplate {
    pub fn new(expressions: Vec<Expression>, source: Source, test: Expression) -> Self {
        let parameter_count = expressions
            .iter()
            .chain(std::iter::once(&test))
            .map(Expression::parameter_bound)
            .max()
            .unwrap_or(0);
        Self {
            expressions,
            source,
            test,
            parameter_count,
        }
    }

    /// Number of parameters a subscription must bind.
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Table {
        Table::new("items", vec![Column::new("id")])
    }

    fn tags() -> Table {
        Table::new("tags", vec![Column::new("id")])
    }

    #[test]
    fn test_tables_deduplicates_self_join() {
        let a = TableReference::aliased(items(), "a");
        let b = TableReference::aliased(items(), "b");
        let source = Source::join(a.into(), b.into());
        assert_eq!(source.references().len(), 2);
        assert_eq!(source.tables().len(), 1);
    }

    #[test]
    fn test_tables_of_join() {
        let source = Source::join(
            TableReference::new(items()).into(),
            TableReference::new(tags()).into(),
        );
        let tables: Vec<_> = source.tables().into_iter().collect();
        assert_eq!(tables, vec![items(), tags()]);
    }

    #[test]
    fn test_parameter_count() {
        let r = TableReference::new(items());
        let id = Column::new("id");
        let q = QueryTemplate::new(
            vec![r.column(&id)],
            r.clone().into(),
            Expression::or(
                Expression::equal(r.column(&id), Expression::parameter(0)),
                Expression::equal(r.column(&id), Expression::parameter(2)),
            ),
        );
        assert_eq!(q.parameter_count(), 3);

        let unbound = QueryTemplate::new(vec![], r.into(), Expression::constant(true));
        assert_eq!(unbound.parameter_count(), 0);
    }
}
