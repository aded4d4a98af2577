//! In-Memory Query Evaluation
//!
//! Evaluates query templates against `MemoryRevision`s with nested-loop
//! joins and diffs the results row by row.

use crate::adapters::outbound::memory_store::{MemoryRevision, Row};
use crate::domain::diff::RowEvent;
use crate::domain::ports::{QueryCursor, StoreError};
use crate::domain::query::{Expression, QueryTemplate, Source, TableReference};
use crate::domain::value_objects::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// One source row per table reference.
type Binding<'a> = Vec<(&'a TableReference, &'a [Value], &'a Row)>;

/// Query results keyed by the identity of the source rows they came from.
type Results = BTreeMap<Vec<Value>, Vec<Value>>;

pub(crate) struct QueryDiff {
    events: VecDeque<RowEvent>,
}

impl QueryDiff {
    pub(crate) fn new(
        base: &MemoryRevision,
        fork: &MemoryRevision,
        query: &QueryTemplate,
        parameters: &[Value],
    ) -> Result<Self, StoreError> {
        let before = evaluate(base, query, parameters)?;
        let after = evaluate(fork, query, parameters)?;

        let mut events = VecDeque::new();
        let identities: BTreeSet<&Vec<Value>> = before.keys().chain(after.keys()).collect();
        for identity in identities {
            match (before.get(identity), after.get(identity)) {
                (Some(old), Some(new)) if old == new => {}
                (Some(old), Some(new)) => {
                    events.push_back(RowEvent::Deleted {
                        row: old.clone(),
                        updated: true,
                    });
                    events.push_back(RowEvent::Inserted(new.clone()));
                }
                (Some(old), None) => events.push_back(RowEvent::Deleted {
                    row: old.clone(),
                    updated: false,
                }),
                (None, Some(new)) => events.push_back(RowEvent::Inserted(new.clone())),
                (None, None) => {}
            }
        }
        Ok(Self { events })
    }
}

impl QueryCursor for QueryDiff {
    fn next_row(&mut self) -> Result<RowEvent, StoreError> {
        Ok(self.events.pop_front().unwrap_or(RowEvent::End))
    }
}

/// Evaluate `query` against `revision`.
pub fn evaluate(
    revision: &MemoryRevision,
    query: &QueryTemplate,
    parameters: &[Value],
) -> Result<BTreeMap<Vec<Value>, Vec<Value>>, StoreError> {
    if parameters.len() < query.parameter_count() {
        return Err(StoreError::Query(format!(
            "query takes {} parameters, {} bound",
            query.parameter_count(),
            parameters.len()
        )));
    }

    let mut results = Results::new();
    for binding in bindings(revision, &query.source) {
        if !truthy(&eval(&query.test, &binding, parameters)?) {
            continue;
        }
        let row = query
            .expressions
            .iter()
            .map(|e| eval(e, &binding, parameters))
            .collect::<Result<Vec<_>, _>>()?;
        let identity = binding
            .iter()
            .flat_map(|(reference, key, _)| {
                std::iter::once(Value::Text(reference.alias.clone())).chain(key.iter().cloned())
            })
            .collect();
        results.insert(identity, row);
    }
    Ok(results)
}

fn bindings<'a>(revision: &'a MemoryRevision, source: &'a Source) -> Vec<Binding<'a>> {
    match source {
        Source::Table(reference) => revision
            .table_rows(&reference.table)
            .map(|(key, row)| vec![(reference, key.as_slice(), row.as_ref())])
            .collect(),
        Source::Join { left, right } => {
            let left = bindings(revision, left);
            let right = bindings(revision, right);
            let mut joined = Vec::with_capacity(left.len() * right.len());
            for l in &left {
                for r in &right {
                    joined.push(l.iter().chain(r.iter()).copied().collect());
                }
            }
            joined
        }
    }
}

fn eval(
    expression: &Expression,
    binding: &Binding<'_>,
    parameters: &[Value],
) -> Result<Value, StoreError> {
    Ok(match expression {
        Expression::Column(c) => {
            let (_, _, row) = binding
                .iter()
                .find(|(reference, _, _)| reference.alias == c.table.alias)
                .ok_or_else(|| {
                    StoreError::Query(format!("unknown table reference {}", c.table.alias))
                })?;
            row.get(&c.column).cloned().unwrap_or(Value::Null)
        }
        Expression::Constant(v) => v.clone(),
        Expression::Parameter(i) => parameters
            .get(*i)
            .cloned()
            .ok_or_else(|| StoreError::Query(format!("parameter {} is not bound", i)))?,
        Expression::Equal(a, b) => {
            Value::Bool(eval(a, binding, parameters)? == eval(b, binding, parameters)?)
        }
        Expression::And(a, b) => Value::Bool(
            truthy(&eval(a, binding, parameters)?) && truthy(&eval(b, binding, parameters)?),
        ),
        Expression::Or(a, b) => Value::Bool(
            truthy(&eval(a, binding, parameters)?) || truthy(&eval(b, binding, parameters)?),
        ),
        Expression::Not(a) => Value::Bool(!truthy(&eval(a, binding, parameters)?)),
    })
}

fn truthy(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryStore;
    use crate::domain::ports::{RevisionBuilder, Store};
    use crate::domain::value_objects::{Column, Table};

    fn people() -> Table {
        Table::new("people", vec![Column::new("id")])
    }

    fn pets() -> Table {
        Table::new("pets", vec![Column::new("id")])
    }

    fn seed(store: &MemoryStore) {
        let id = Column::new("id");
        let name = Column::new("name");
        let owner = Column::new("owner");
        store
            .apply(|b| {
                b.insert_row(&people(), &[(id.clone(), 1.into()), (name.clone(), "ann".into())])?;
                b.insert_row(&people(), &[(id.clone(), 2.into()), (name.clone(), "bob".into())])?;
                b.insert_row(&pets(), &[(id.clone(), 10.into()), (owner.clone(), 1.into())])?;
                b.insert_row(&pets(), &[(id.clone(), 11.into()), (owner.clone(), 1.into())])
            })
            .unwrap();
    }

    #[test]
    fn test_filter_with_parameter() {
        let store = MemoryStore::new();
        seed(&store);
        let p = TableReference::new(people());
        let query = QueryTemplate::new(
            vec![p.column(&Column::new("name"))],
            p.clone().into(),
            Expression::equal(p.column(&Column::new("id")), Expression::parameter(0)),
        );

        let results = evaluate(&store.head(), &query, &[Value::Int(2)]).unwrap();
        let rows: Vec<_> = results.into_values().collect();
        assert_eq!(rows, vec![vec![Value::from("bob")]]);
    }

    #[test]
    fn test_join() {
        let store = MemoryStore::new();
        seed(&store);
        let p = TableReference::new(people());
        let q = TableReference::new(pets());
        let query = QueryTemplate::new(
            vec![p.column(&Column::new("name")), q.column(&Column::new("id"))],
            Source::join(p.clone().into(), q.clone().into()),
            Expression::equal(p.column(&Column::new("id")), q.column(&Column::new("owner"))),
        );

        let rows: Vec<_> = evaluate(&store.head(), &query, &[])
            .unwrap()
            .into_values()
            .collect();
        assert_eq!(
            rows,
            vec![
                vec![Value::from("ann"), Value::Int(10)],
                vec![Value::from("ann"), Value::Int(11)],
            ]
        );
    }

    #[test]
    fn test_missing_parameter_is_an_error() {
        let store = MemoryStore::new();
        let p = TableReference::new(people());
        let query = QueryTemplate::new(
            vec![],
            p.clone().into(),
            Expression::equal(p.column(&Column::new("id")), Expression::parameter(0)),
        );
        assert!(evaluate(&store.head(), &query, &[]).is_err());
    }

    #[test]
    fn test_query_diff_marks_updates() {
        let store = MemoryStore::new();
        seed(&store);
        let base = store.head();
        store
            .apply(|b| {
                b.insert_row(&people(), &[(Column::new("id"), 1.into()), (Column::new("name"), "amy".into())])?;
                b.delete(&[Value::from(people()), Value::Int(2)])
            })
            .unwrap();

        let p = TableReference::new(people());
        let query = QueryTemplate::new(
            vec![p.column(&Column::new("name"))],
            p.clone().into(),
            Expression::constant(true),
        );
        let mut cursor = store
            .query_diff(&base, &store.head(), &query, &[])
            .unwrap();
        assert_eq!(
            cursor.next_row().unwrap(),
            RowEvent::Deleted {
                row: vec![Value::from("ann")],
                updated: true
            }
        );
        assert_eq!(cursor.next_row().unwrap(), RowEvent::Inserted(vec![Value::from("amy")]));
        assert_eq!(
            cursor.next_row().unwrap(),
            RowEvent::Deleted {
                row: vec![Value::from("bob")],
                updated: false
            }
        );
        assert_eq!(cursor.next_row().unwrap(), RowEvent::End);
    }
}
