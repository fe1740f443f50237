//! Query filters

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{Document, get_path};
use crate::error::{Result, StoreError};

/// Pseudo field addressing the document id in filters
pub const ID_FIELD: &str = "__id__";

/// Maximum number of values accepted by a single set-membership filter
pub const MAX_IN_VALUES: usize = 30;

/// Filter operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    /// Value must be an array; matches when the field equals any element
    In,
}

/// A single field filter
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In,
            value: Value::Array(values),
        }
    }

    /// Match documents whose id is one of `ids`
    pub fn id_in<S: AsRef<str>>(ids: &[S]) -> Self {
        Self::is_in(
            ID_FIELD,
            ids.iter().map(|id| Value::String(id.as_ref().to_string())).collect(),
        )
    }

    fn validate(&self) -> Result<()> {
        if self.op == FilterOp::In {
            let values = self
                .value
                .as_array()
                .ok_or_else(|| StoreError::InvalidQuery(format!("'in' filter on {} needs an array", self.field)))?;
            if values.len() > MAX_IN_VALUES {
                return Err(StoreError::InvalidQuery(format!(
                    "'in' filter on {} has {} values (max {})",
                    self.field,
                    values.len(),
                    MAX_IN_VALUES
                )));
            }
        }
        Ok(())
    }

    fn matches(&self, doc: &Document) -> bool {
        let id_value;
        let field = if self.field == ID_FIELD {
            id_value = Value::String(doc.id().to_string());
            Some(&id_value)
        } else {
            get_path(&doc.fields, &self.field)
        };

        match self.op {
            FilterOp::Eq => field.is_some_and(|v| *v == self.value),
            FilterOp::Ne => field.is_none_or(|v| *v != self.value),
            FilterOp::In => match (field, self.value.as_array()) {
                (Some(v), Some(values)) => values.contains(v),
                _ => false,
            },
            FilterOp::Gt => compare(field, &self.value) == Some(Ordering::Greater),
            FilterOp::Lt => compare(field, &self.value) == Some(Ordering::Less),
            FilterOp::Gte => matches!(compare(field, &self.value), Some(Ordering::Greater | Ordering::Equal)),
            FilterOp::Lte => matches!(compare(field, &self.value), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Query over one collection
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Order)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.filters.iter().try_for_each(Filter::validate)
    }

    /// Apply filters, ordering and limit to the collection's documents
    pub(crate) fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs
            .into_iter()
            .filter(|doc| self.filters.iter().all(|f| f.matches(doc)))
            .collect();

        if let Some((field, order)) = &self.order_by {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

fn compare(field: Option<&Value>, value: &Value) -> Option<Ordering> {
    match (field?, value) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order used for sorting; missing values sort first
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(Some(a), b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocRef, Fields};
    use serde_json::json;

    fn doc(id: &str, body: Value) -> Document {
        let fields: Fields = body.as_object().cloned().unwrap_or_default();
        Document {
            reference: DocRef::new("materials", id),
            version: 1,
            fields,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_eq_and_in_filters() {
        let docs = vec![
            doc("a", json!({"status": "done", "tier": 1})),
            doc("b", json!({"status": "queued", "tier": 2})),
            doc("c", json!({"status": "done", "tier": 3})),
        ];

        let q = Query::new("materials").filter(Filter::eq("status", "done"));
        let ids: Vec<_> = q.apply(docs.clone()).iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let q = Query::new("materials").filter(Filter::id_in(&["b", "c"]));
        let ids: Vec<_> = q.apply(docs).iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_order_and_limit() {
        let docs = vec![
            doc("a", json!({"tier": 2})),
            doc("b", json!({"tier": 3})),
            doc("c", json!({"tier": 1})),
        ];
        let q = Query::new("materials").order_by("tier", Order::Desc).limit(2);
        let ids: Vec<_> = q.apply(docs).iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_comparison_filters() {
        let docs = vec![doc("a", json!({"run_at": 10})), doc("b", json!({"run_at": 20}))];
        let q = Query::new("tasks").filter(Filter {
            field: "run_at".to_string(),
            op: FilterOp::Lte,
            value: json!(15),
        });
        assert_eq!(q.apply(docs).len(), 1);
    }

    #[test]
    fn test_in_filter_value_limit() {
        let ids: Vec<String> = (0..31).map(|i| format!("m{}", i)).collect();
        let q = Query::new("materials").filter(Filter::id_in(&ids));
        assert!(matches!(q.validate(), Err(StoreError::InvalidQuery(_))));

        let q = Query::new("materials").filter(Filter::id_in(&ids[..30]));
        assert!(q.validate().is_ok());
    }

    #[test]
    fn test_ne_matches_missing_field() {
        let docs = vec![doc("a", json!({})), doc("b", json!({"status": "x"}))];
        let q = Query::new("m").filter(Filter {
            field: "status".to_string(),
            op: FilterOp::Ne,
            value: json!("x"),
        });
        assert_eq!(q.apply(docs).len(), 1);
    }
}
