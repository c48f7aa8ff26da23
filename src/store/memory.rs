//! In-memory [`DocumentStore`] for tests.

use super::{
    Condition, DocumentStore, DuplicateKey, Filter, FindOptions, SortKey,
};
use crate::models::ObjectId;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

type Collection = BTreeMap<String, Value>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<&'static str, Collection>>,
    unique: Vec<(&'static str, &'static str)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that repeat another document's `field`, like a unique
    /// index would.
    pub fn with_unique(mut self, collection: &'static str, field: &'static str) -> Self {
        self.unique.push((collection, field));
        self
    }

    fn check_unique(
        &self,
        collection: &'static str,
        docs: &Collection,
        key: &str,
        doc: &Value,
    ) -> Result<()> {
        for (_, field) in self.unique.iter().filter(|(c, _)| *c == collection) {
            let Some(value) = doc.get(*field) else {
                continue;
            };
            let taken = docs
                .iter()
                .any(|(k, other)| k != key && other.get(*field) == Some(value));
            if taken {
                return Err(DuplicateKey {
                    collection,
                    field: (*field).to_owned(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Total documents in `collection`.
    pub fn len(&self, collection: &'static str) -> usize {
        self.collections
            .lock()
            .expect("store lock poisoned")
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

fn matches(doc: &Value, filter: &Filter) -> bool {
    filter.conditions.iter().all(|condition| match condition {
        Condition::Eq(field, value) => doc.get(*field) == Some(value),
        Condition::Has(field, value) => doc
            .get(*field)
            .and_then(|v| v.as_array())
            .map_or(false, |items| items.contains(value)),
        Condition::OneOf(field, values) => {
            doc.get(*field).map_or(false, |v| values.contains(v))
        }
        Condition::ContainsAny { fields, needles } => fields.iter().any(|f| {
            let Some(haystack) = doc.get(*f).and_then(|v| v.as_str()) else {
                return false;
            };
            let haystack = haystack.to_lowercase();
            needles
                .iter()
                .any(|n| haystack.contains(&n.to_lowercase()))
        }),
    })
}

fn compare(a: &Value, b: &Value, key: SortKey) -> Ordering {
    match key {
        SortKey::Number => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        SortKey::Timestamp => {
            let parse = |v: &Value| {
                v.as_str()
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            };
            parse(a).cmp(&parse(b))
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(
        &self,
        collection: &'static str,
        id: &ObjectId,
        doc: Value,
    ) -> Result<()> {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        let docs = collections.entry(collection).or_default();
        let key = id.to_string();
        if docs.contains_key(&key) {
            return Err(DuplicateKey {
                collection,
                field: "_id".into(),
            }
            .into());
        }
        self.check_unique(collection, docs, &key, &doc)?;
        docs.insert(key, doc);
        Ok(())
    }

    async fn find_by_id(
        &self,
        collection: &'static str,
        id: &ObjectId,
    ) -> Result<Option<Value>> {
        let collections = self.collections.lock().expect("store lock poisoned");
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(&id.to_string()))
            .cloned())
    }

    async fn find(
        &self,
        collection: &'static str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>> {
        let collections = self.collections.lock().expect("store lock poisoned");
        let mut found: Vec<(&String, &Value)> = collections
            .get(collection)
            .map(|docs| docs.iter().filter(|(_, d)| matches(d, filter)).collect())
            .unwrap_or_default();

        if let Some(sort) = options.sort {
            found.sort_by(|(a_id, a), (b_id, b)| {
                let null = Value::Null;
                let ord = compare(
                    a.get(sort.field).unwrap_or(&null),
                    b.get(sort.field).unwrap_or(&null),
                    sort.key,
                )
                .then_with(|| a_id.cmp(b_id));
                if sort.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let skip = options.skip.max(0) as usize;
        let limit = options
            .limit
            .map(|l| l.max(0) as usize)
            .unwrap_or(usize::MAX);

        Ok(found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn count(
        &self,
        collection: &'static str,
        filter: &Filter,
    ) -> Result<i64> {
        let collections = self.collections.lock().expect("store lock poisoned");
        Ok(collections
            .get(collection)
            .map(|docs| docs.values().filter(|d| matches(d, filter)).count())
            .unwrap_or(0) as i64)
    }

    async fn replace(
        &self,
        collection: &'static str,
        id: &ObjectId,
        doc: Value,
    ) -> Result<bool> {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let key = id.to_string();
        if !docs.contains_key(&key) {
            return Ok(false);
        }
        self.check_unique(collection, docs, &key, &doc)?;
        docs.insert(key, doc);
        Ok(true)
    }

    async fn increment(
        &self,
        collection: &'static str,
        id: &ObjectId,
        field: &'static str,
        by: i64,
    ) -> Result<bool> {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        let Some(doc) = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(&id.to_string()))
        else {
            return Ok(false);
        };
        let Some(object) = doc.as_object_mut() else {
            bail!("document {id} in {collection} is not an object");
        };
        let current = object.get(field).and_then(|v| v.as_i64()).unwrap_or(0);
        object.insert(field.to_owned(), Value::from(current + by));
        Ok(true)
    }

    async fn delete(
        &self,
        collection: &'static str,
        id: &ObjectId,
    ) -> Result<bool> {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        Ok(collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(&id.to_string()))
            .is_some())
    }

    async fn delete_many(
        &self,
        collection: &'static str,
        filter: &Filter,
    ) -> Result<u64> {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, d| !matches(d, filter));
        Ok((before - docs.len()) as u64)
    }

    async fn add_to_set(
        &self,
        collection: &'static str,
        filter: &Filter,
        field: &'static str,
        value: Value,
    ) -> Result<u64> {
        self.update_arrays(collection, filter, field, |items| {
            if items.contains(&value) {
                false
            } else {
                items.push(value.clone());
                true
            }
        })
    }

    async fn pull(
        &self,
        collection: &'static str,
        filter: &Filter,
        field: &'static str,
        value: Value,
    ) -> Result<u64> {
        self.update_arrays(collection, filter, field, |items| {
            let before = items.len();
            items.retain(|v| *v != value);
            items.len() != before
        })
    }
}

impl MemoryStore {
    /// Run `f` on the array `field` of each matching document; `f` reports
    /// whether it changed anything.
    fn update_arrays(
        &self,
        collection: &'static str,
        filter: &Filter,
        field: &'static str,
        mut f: impl FnMut(&mut Vec<Value>) -> bool,
    ) -> Result<u64> {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut changed = 0;
        for (key, doc) in docs.iter_mut().filter(|(_, d)| matches(d, filter)) {
            let Some(object) = doc.as_object_mut() else {
                bail!("document {key} in {collection} is not an object");
            };
            let slot = object
                .entry(field)
                .or_insert_with(|| Value::Array(Vec::new()));
            let Some(items) = slot.as_array_mut() else {
                bail!("{field} of {key} in {collection} is not an array");
            };
            if f(items) {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let docs = [
            json!({"title": "Calculus I", "subject": "Mathematics", "year": 2021, "rating": 4.5, "createdAt": "2024-01-01T00:00:00Z"}),
            json!({"title": "Organic Chemistry", "subject": "Chemistry", "year": 2022, "rating": 3.0, "createdAt": "2024-03-01T00:00:00Z"}),
            json!({"title": "Discrete Math", "subject": "Computer Science", "year": 2022, "rating": 5.0, "createdAt": "2024-02-01T00:00:00Z"}),
        ];
        for doc in docs {
            store.insert("notes", &ObjectId::new(), doc).await.unwrap();
        }
        store
    }

    fn titles(docs: &[Value]) -> Vec<&str> {
        docs.iter().map(|d| d["title"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_find_with_filters_and_sort() {
        let store = seeded().await;

        let found = store
            .find(
                "notes",
                &Filter::new().eq("year", 2022),
                &FindOptions::newest_first(),
            )
            .await
            .unwrap();
        assert_eq!(titles(&found), vec!["Organic Chemistry", "Discrete Math"]);

        let found = store
            .find(
                "notes",
                &Filter::new().contains_any(
                    vec!["title", "subject"],
                    vec!["MATH".into(), "chem".into()],
                ),
                &FindOptions {
                    sort: Some(crate::store::Sort {
                        field: "rating",
                        key: SortKey::Number,
                        descending: true,
                    }),
                    limit: Some(2),
                    skip: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(titles(&found), vec!["Discrete Math", "Calculus I"]);
    }

    #[tokio::test]
    async fn test_increment_and_delete_many() {
        let store = seeded().await;
        let id = ObjectId::new();
        store
            .insert("notes", &id, json!({"title": "x", "year": 1999}))
            .await
            .unwrap();

        assert!(store.increment("notes", &id, "downloadCount", 1).await.unwrap());
        assert!(store.increment("notes", &id, "downloadCount", 1).await.unwrap());
        let doc = store.find_by_id("notes", &id).await.unwrap().unwrap();
        assert_eq!(doc["downloadCount"], json!(2));
        assert!(!store
            .increment("notes", &ObjectId::new(), "downloadCount", 1)
            .await
            .unwrap());

        let removed = store
            .delete_many("notes", &Filter::new().eq("year", 2022))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count("notes", &Filter::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_array_updates() {
        let store = MemoryStore::new();
        let (jack, jill) = (ObjectId::new(), ObjectId::new());
        store
            .insert("users", &jack, json!({"_id": jack, "savedNotes": ["n1"]}))
            .await
            .unwrap();
        store
            .insert("users", &jill, json!({"_id": jill}))
            .await
            .unwrap();
        let only_jill = Filter::new().eq("_id", jill);

        let added = store
            .add_to_set("users", &only_jill, "savedNotes", json!("n1"))
            .await
            .unwrap();
        assert_eq!(added, 1);
        let added = store
            .add_to_set("users", &only_jill, "savedNotes", json!("n1"))
            .await
            .unwrap();
        assert_eq!(added, 0);

        let holders = Filter::new().has("savedNotes", "n1");
        assert_eq!(store.count("users", &holders).await.unwrap(), 2);
        let pulled = store
            .pull("users", &holders, "savedNotes", json!("n1"))
            .await
            .unwrap();
        assert_eq!(pulled, 2);
        let doc = store.find_by_id("users", &jill).await.unwrap().unwrap();
        assert_eq!(doc["savedNotes"], json!([]));

        let found = store
            .find(
                "users",
                &Filter::new().one_of("_id", [jack]),
                &FindOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], json!(jack));
    }

    #[tokio::test]
    async fn test_unique_fields() {
        let store = MemoryStore::new().with_unique("users", "email");
        let (a, b) = (ObjectId::new(), ObjectId::new());
        store
            .insert("users", &a, json!({"email": "a@example.com"}))
            .await
            .unwrap();

        let err = store
            .insert("users", &b, json!({"email": "a@example.com"}))
            .await
            .unwrap_err();
        let dup = err.downcast_ref::<DuplicateKey>().unwrap();
        assert_eq!(dup.field, "email");

        store
            .insert("users", &b, json!({"email": "b@example.com"}))
            .await
            .unwrap();
        assert!(store
            .replace("users", &b, json!({"email": "a@example.com"}))
            .await
            .is_err());
        assert!(store
            .replace("users", &a, json!({"email": "a@example.com", "name": "A"}))
            .await
            .unwrap());
    }
}
