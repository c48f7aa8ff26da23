//! A small JSON document store: named collections of documents keyed by
//! [`ObjectId`]. Documents are opaque `serde_json::Value`s at this layer;
//! typing and validation live in `db_ops`.

pub mod postgres;
#[cfg(test)]
pub mod memory;

use super::models::ObjectId;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// One predicate of a [`Filter`]. Field names are always compile-time
/// constants so they can be spliced into queries.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// `doc[field] == value`
    Eq(&'static str, Value),
    /// `doc[field]` is an array holding `value`
    Has(&'static str, Value),
    /// `doc[field]` equals one of the values; none matches nothing.
    OneOf(&'static str, Vec<Value>),
    /// Case-insensitive substring match: true when any of `fields` contains
    /// any of `needles`.
    ContainsAny {
        fields: Vec<&'static str>,
        needles: Vec<String>,
    },
}

/// A conjunction of [`Condition`]s; the empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field, value.into()));
        self
    }

    pub fn has(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Has(field, value.into()));
        self
    }

    pub fn one_of<V: Into<Value>>(
        mut self,
        field: &'static str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push(Condition::OneOf(field, values));
        self
    }

    /// Empty needles are dropped; with none left the filter is unchanged.
    pub fn contains_any(
        mut self,
        fields: Vec<&'static str>,
        needles: Vec<String>,
    ) -> Self {
        let needles: Vec<String> =
            needles.into_iter().filter(|n| !n.is_empty()).collect();
        if !needles.is_empty() && !fields.is_empty() {
            self.conditions.push(Condition::ContainsAny { fields, needles });
        }
        self
    }
}

/// A write collided with a unique key. Stores return it inside their
/// `anyhow::Error` so callers can `downcast_ref` it.
#[derive(Debug, thiserror::Error)]
#[error("duplicate {field} in {collection}")]
pub struct DuplicateKey {
    pub collection: &'static str,
    pub field: String,
}

/// How to compare values of the sort field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    /// RFC 3339 timestamps
    Timestamp,
    Number,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sort {
    pub field: &'static str,
    pub key: SortKey,
    pub descending: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: Option<Sort>,
    pub limit: Option<i64>,
    pub skip: i64,
}

impl FindOptions {
    pub fn newest_first() -> Self {
        Self {
            sort: Some(Sort {
                field: "createdAt",
                key: SortKey::Timestamp,
                descending: true,
            }),
            ..Default::default()
        }
    }

    pub fn oldest_first() -> Self {
        Self {
            sort: Some(Sort {
                field: "createdAt",
                key: SortKey::Timestamp,
                descending: false,
            }),
            ..Default::default()
        }
    }
}

/// Per-document atomic operations over named collections. There are no
/// cross-document transactions.
#[async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    async fn insert(
        &self,
        collection: &'static str,
        id: &ObjectId,
        doc: Value,
    ) -> Result<()>;

    async fn find_by_id(
        &self,
        collection: &'static str,
        id: &ObjectId,
    ) -> Result<Option<Value>>;

    async fn find(
        &self,
        collection: &'static str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>>;

    async fn count(&self, collection: &'static str, filter: &Filter)
        -> Result<i64>;

    /// Replace the whole document. `false` when there is no such document.
    async fn replace(
        &self,
        collection: &'static str,
        id: &ObjectId,
        doc: Value,
    ) -> Result<bool>;

    /// Add `by` to a numeric field (missing counts as 0). `false` when there
    /// is no such document.
    async fn increment(
        &self,
        collection: &'static str,
        id: &ObjectId,
        field: &'static str,
        by: i64,
    ) -> Result<bool>;

    /// `false` when there is no such document.
    async fn delete(&self, collection: &'static str, id: &ObjectId)
        -> Result<bool>;

    /// Returns how many documents were removed.
    async fn delete_many(
        &self,
        collection: &'static str,
        filter: &Filter,
    ) -> Result<u64>;

    /// Append `value` to the array `field` of every matching document that
    /// does not hold it yet. A missing field counts as empty. Returns how
    /// many documents changed.
    async fn add_to_set(
        &self,
        collection: &'static str,
        filter: &Filter,
        field: &'static str,
        value: Value,
    ) -> Result<u64>;

    /// Remove every occurrence of `value` from the array `field` of each
    /// matching document. Returns how many documents changed.
    async fn pull(
        &self,
        collection: &'static str,
        filter: &Filter,
        field: &'static str,
        value: Value,
    ) -> Result<u64>;
}
