//! Postgres-backed [`DocumentStore`]. Every collection is a table of
//! `(id text primary key, doc jsonb)`; equality filters use `jsonb`
//! containment and substring filters use `ilike`.

use super::{
    Condition, DocumentStore, DuplicateKey, Filter, FindOptions, SortKey,
};
use crate::models::ObjectId;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    types::Json,
    Postgres, QueryBuilder,
};

#[derive(Clone, Debug)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self { db })
    }

    /// Create the backing table for each collection if it does not exist.
    pub async fn ensure_collections(
        &self,
        collections: &[&'static str],
    ) -> Result<()> {
        for collection in collections {
            let sql = format!(
                r#"create table if not exists "{collection}" (
                    id text primary key,
                    doc jsonb not null
                )"#
            );
            sqlx::query(&sql).execute(&self.db).await?;
        }

        Ok(())
    }

    /// A unique index over one top-level string field.
    pub async fn ensure_unique(
        &self,
        collection: &'static str,
        field: &'static str,
    ) -> Result<()> {
        let sql = format!(
            r#"create unique index if not exists "{collection}_{field}_key"
            on "{collection}" ((doc->>'{field}'))"#
        );
        sqlx::query(&sql).execute(&self.db).await?;

        Ok(())
    }
}

const UNIQUE_VIOLATION: &str = "23505";

/// Constraint names are `{collection}_pkey` and `{collection}_{field}_key`.
fn constraint_field(collection: &str, constraint: &str) -> String {
    if constraint == format!("{collection}_pkey") {
        return "_id".into();
    }
    constraint
        .strip_prefix(collection)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix("_key"))
        .unwrap_or(constraint)
        .to_owned()
}

/// Unique violations surface as [`DuplicateKey`].
fn write_error(collection: &'static str, err: sqlx::Error) -> anyhow::Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            let field = db_err
                .constraint()
                .map(|c| constraint_field(collection, c))
                .unwrap_or_else(|| "_id".into());
            return DuplicateKey { collection, field }.into();
        }
    }
    err.into()
}

/// `{"field": value}`, for `@>` containment.
fn single_field(field: &str, value: Value) -> Json<Value> {
    let mut object = Map::new();
    object.insert(field.to_owned(), value);
    Json(Value::Object(object))
}

/// Escape `ilike` wildcards so needles match literally.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    for condition in &filter.conditions {
        match condition {
            Condition::Eq(field, value) => {
                builder.push(" and doc @> ");
                builder.push_bind(single_field(field, value.clone()));
            }
            Condition::Has(field, value) => {
                builder.push(" and doc @> ");
                builder.push_bind(single_field(
                    field,
                    Value::Array(vec![value.clone()]),
                ));
            }
            Condition::OneOf(field, values) => {
                builder.push(" and ");
                builder.push_bind(Json(Value::Array(values.clone())));
                builder.push(format!(" @> jsonb_build_array(doc->'{field}')"));
            }
            Condition::ContainsAny { fields, needles } => {
                builder.push(" and (false");
                for field in fields {
                    for needle in needles {
                        builder.push(format!(" or doc->>'{field}' ilike "));
                        builder.push_bind(like_pattern(needle));
                    }
                }
                builder.push(")");
            }
        }
    }
}

fn push_options(builder: &mut QueryBuilder<'_, Postgres>, options: &FindOptions) {
    if let Some(sort) = options.sort {
        let cast = match sort.key {
            SortKey::Timestamp => "timestamptz",
            SortKey::Number => "float8",
        };
        let direction = if sort.descending { "desc" } else { "asc" };
        builder.push(format!(
            " order by (doc->>'{}')::{cast} {direction}, id {direction}",
            sort.field
        ));
    }
    if let Some(limit) = options.limit {
        builder.push(" limit ");
        builder.push_bind(limit);
    }
    if options.skip > 0 {
        builder.push(" offset ");
        builder.push_bind(options.skip);
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert(
        &self,
        collection: &'static str,
        id: &ObjectId,
        doc: Value,
    ) -> Result<()> {
        let sql = format!(r#"insert into "{collection}" (id, doc) values ($1, $2)"#);
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(Json(doc))
            .execute(&self.db)
            .await
            .map_err(|e| write_error(collection, e))?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        collection: &'static str,
        id: &ObjectId,
    ) -> Result<Option<Value>> {
        let sql = format!(r#"select doc from "{collection}" where id = $1"#);
        let row: Option<(Json<Value>,)> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;

        Ok(row.map(|(Json(doc),)| doc))
    }

    async fn find(
        &self,
        collection: &'static str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Value>> {
        let mut builder = QueryBuilder::new(format!(
            r#"select doc from "{collection}" where true"#
        ));
        push_filter(&mut builder, filter);
        push_options(&mut builder, options);

        let rows: Vec<(Json<Value>,)> = builder
            .build_query_as()
            .fetch_all(&self.db)
            .await?;

        Ok(rows.into_iter().map(|(Json(doc),)| doc).collect())
    }

    async fn count(
        &self,
        collection: &'static str,
        filter: &Filter,
    ) -> Result<i64> {
        let mut builder = QueryBuilder::new(format!(
            r#"select count(*) from "{collection}" where true"#
        ));
        push_filter(&mut builder, filter);

        let (count,): (i64,) =
            builder.build_query_as().fetch_one(&self.db).await?;

        Ok(count)
    }

    async fn replace(
        &self,
        collection: &'static str,
        id: &ObjectId,
        doc: Value,
    ) -> Result<bool> {
        let sql = format!(r#"update "{collection}" set doc = $1 where id = $2"#);
        let res = sqlx::query(&sql)
            .bind(Json(doc))
            .bind(id.to_string())
            .execute(&self.db)
            .await
            .map_err(|e| write_error(collection, e))?;

        Ok(res.rows_affected() > 0)
    }

    async fn increment(
        &self,
        collection: &'static str,
        id: &ObjectId,
        field: &'static str,
        by: i64,
    ) -> Result<bool> {
        let sql = format!(
            r#"update "{collection}"
            set doc = jsonb_set(
                doc,
                $1,
                to_jsonb(coalesce((doc->>'{field}')::bigint, 0) + $2)
            )
            where id = $3"#
        );
        let res = sqlx::query(&sql)
            .bind(vec![field.to_owned()])
            .bind(by)
            .bind(id.to_string())
            .execute(&self.db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn delete(
        &self,
        collection: &'static str,
        id: &ObjectId,
    ) -> Result<bool> {
        let sql = format!(r#"delete from "{collection}" where id = $1"#);
        let res = sqlx::query(&sql)
            .bind(id.to_string())
            .execute(&self.db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn delete_many(
        &self,
        collection: &'static str,
        filter: &Filter,
    ) -> Result<u64> {
        let mut builder =
            QueryBuilder::new(format!(r#"delete from "{collection}" where true"#));
        push_filter(&mut builder, filter);
        let res = builder.build().execute(&self.db).await?;

        Ok(res.rows_affected())
    }

    async fn add_to_set(
        &self,
        collection: &'static str,
        filter: &Filter,
        field: &'static str,
        value: Value,
    ) -> Result<u64> {
        let mut builder = QueryBuilder::new(format!(
            r#"update "{collection}" set doc = jsonb_set(doc, "#
        ));
        builder.push_bind(vec![field.to_owned()]);
        builder.push(format!(
            ", coalesce(doc->'{field}', '[]'::jsonb) || jsonb_build_array("
        ));
        builder.push_bind(Json(value.clone()));
        builder.push(")) where not doc @> ");
        builder.push_bind(single_field(field, Value::Array(vec![value])));
        push_filter(&mut builder, filter);
        let res = builder.build().execute(&self.db).await?;

        Ok(res.rows_affected())
    }

    async fn pull(
        &self,
        collection: &'static str,
        filter: &Filter,
        field: &'static str,
        value: Value,
    ) -> Result<u64> {
        let mut builder = QueryBuilder::new(format!(
            r#"update "{collection}" set doc = jsonb_set(doc, "#
        ));
        builder.push_bind(vec![field.to_owned()]);
        builder.push(format!(
            ", coalesce((select jsonb_agg(v) from jsonb_array_elements(doc->'{field}') as e(v) where v <> "
        ));
        builder.push_bind(Json(value.clone()));
        builder.push("), '[]'::jsonb)) where doc @> ");
        builder.push_bind(single_field(field, Value::Array(vec![value])));
        push_filter(&mut builder, filter);
        let res = builder.build().execute(&self.db).await?;

        Ok(res.rows_affected())
    }
}
