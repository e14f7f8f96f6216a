//! Channel query filters.
//!
//! A [`Filter`] is sent to the server as part of a channel list query and can
//! also be evaluated locally against any [`FilterTarget`], which is how newly
//! observed channels are matched against an already-running query.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::UserId;

/// Something a [`Filter`] can be evaluated against.
pub trait FilterTarget {
    /// Value of a named field, if the target has one.
    fn field(&self, name: &str) -> Option<Value>;

    /// Whether `user` is a member.
    fn has_member(&self, user: &UserId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    All,
    Equal { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    ContainsMember(UserId),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equal {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, target: &dyn FilterTarget) -> bool {
        match self {
            Filter::All => true,
            Filter::Equal { field, value } => target.field(field).as_ref() == Some(value),
            Filter::In { field, values } => target
                .field(field)
                .map(|v| values.contains(&v))
                .unwrap_or(false),
            Filter::ContainsMember(user) => target.has_member(user),
            Filter::And(filters) => filters.iter().all(|f| f.matches(target)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(target)),
            Filter::Not(inner) => !inner.matches(target),
        }
    }

    /// Whether the filter explicitly asks for hidden channels.
    pub fn selects_hidden(&self) -> bool {
        match self {
            Filter::Equal { field, value } => field == "hidden" && value == &Value::Bool(true),
            Filter::And(filters) => filters.iter().any(Filter::selects_hidden),
            _ => false,
        }
    }

    /// Render the filter in the server's operator syntax.
    pub fn to_query_json(&self) -> Value {
        match self {
            Filter::All => json!({}),
            Filter::Equal { field, value } => json!({ field: { "$eq": value } }),
            Filter::In { field, values } => json!({ field: { "$in": values } }),
            Filter::ContainsMember(user) => json!({ "members": { "$in": [user] } }),
            Filter::And(filters) => {
                json!({ "$and": filters.iter().map(Filter::to_query_json).collect::<Vec<_>>() })
            }
            Filter::Or(filters) => {
                json!({ "$or": filters.iter().map(Filter::to_query_json).collect::<Vec<_>>() })
            }
            Filter::Not(inner) => json!({ "$nor": [inner.to_query_json()] }),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}
