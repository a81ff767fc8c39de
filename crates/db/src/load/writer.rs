use async_trait::async_trait;
use pg_escape::quote_identifier;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::load::schema::{ColumnType, FieldDef};
use crate::load::LoadError;
use shopsync_common::record::{Record, RecordKey};

// Postgres caps bind parameters per statement at u16::MAX.
const MAX_BIND_PARAMS: usize = 65_535;

/// Destination-side interface: the pipeline never builds destination SQL
/// itself.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Create the table if missing and reconcile its columns with the
    /// observed fields: new fields are added, incompatible types fail.
    async fn ensure_schema(
        &self,
        table: &str,
        key_field: &str,
        fields: &[FieldDef],
    ) -> Result<(), LoadError>;

    /// Upsert records by primary key inside a single transaction: the whole
    /// batch lands or none of it does. Returns the committed row count.
    async fn upsert(
        &self,
        table: &str,
        key_field: &str,
        fields: &[FieldDef],
        records: &[Record],
    ) -> Result<u64, LoadError>;
}

pub struct PgDestination {
    pool: PgPool,
    schema: String,
}

impl PgDestination {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(table)
        )
    }

    async fn existing_columns(&self, table: &str) -> Result<Vec<(String, String)>, LoadError> {
        let rows = sqlx::query(
            "select column_name, data_type
             from information_schema.columns
             where table_schema = $1 and table_name = $2
             order by ordinal_position",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(LoadError::from_sqlx)?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>(0), r.get::<String, _>(1)))
            .collect())
    }

    fn push_record_binds(
        builder: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
        key_field: &str,
        fields: &[FieldDef],
        record: &Record,
    ) {
        for field in fields {
            if field.name == key_field {
                match &record.key {
                    RecordKey::Int(id) => builder.push_bind(*id),
                    RecordKey::Text(id) => builder.push_bind(id.clone()),
                };
                continue;
            }
            let value = record.payload.get(&field.name);
            match field.ty {
                ColumnType::Boolean => {
                    builder.push_bind(value.and_then(Value::as_bool));
                }
                ColumnType::BigInt => {
                    builder.push_bind(value.and_then(Value::as_i64));
                }
                ColumnType::Double => {
                    builder.push_bind(value.and_then(Value::as_f64));
                }
                ColumnType::Text => {
                    builder.push_bind(value.and_then(|v| v.as_str().map(str::to_owned)));
                }
                ColumnType::Jsonb => {
                    builder.push_bind(value.filter(|v| !v.is_null()).cloned());
                }
            }
        }
    }
}

#[async_trait]
impl Destination for PgDestination {
    async fn ensure_schema(
        &self,
        table: &str,
        key_field: &str,
        fields: &[FieldDef],
    ) -> Result<(), LoadError> {
        sqlx::query(&format!(
            "create schema if not exists {}",
            quote_identifier(&self.schema)
        ))
        .execute(&self.pool)
        .await
        .map_err(LoadError::from_sqlx)?;

        let columns: Vec<String> = fields
            .iter()
            .map(|f| {
                let mut col = format!("{} {}", quote_identifier(&f.name), f.ty.pg_type());
                if f.name == key_field {
                    col.push_str(" primary key");
                }
                col
            })
            .collect();

        sqlx::query(&format!(
            "create table if not exists {} ({})",
            self.qualified(table),
            columns.join(", ")
        ))
        .execute(&self.pool)
        .await
        .map_err(LoadError::from_sqlx)?;

        let existing = self.existing_columns(table).await?;

        for field in fields {
            match existing.iter().find(|(name, _)| name == &field.name) {
                None => {
                    let sql = format!(
                        "alter table {} add column {} {}",
                        self.qualified(table),
                        quote_identifier(&field.name),
                        field.ty.pg_type()
                    );
                    sqlx::query(&sql)
                        .execute(&self.pool)
                        .await
                        .map_err(LoadError::from_sqlx)?;
                    tracing::info!(table, column = %field.name, ty = field.ty.pg_type(), "added column");
                }
                Some((_, data_type)) => {
                    if !field.ty.fits_existing(data_type) {
                        return Err(LoadError::SchemaConflict {
                            table: table.to_string(),
                            column: field.name.clone(),
                            existing: data_type.clone(),
                            incoming: field.ty.pg_type().to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        key_field: &str,
        fields: &[FieldDef],
        records: &[Record],
    ) -> Result<u64, LoadError> {
        if records.is_empty() {
            return Ok(0);
        }

        // A window can deliver the same entity on two pages if it changed
        // mid-fetch; ON CONFLICT cannot touch a row twice in one statement,
        // so keep only the last delivery per key.
        let mut by_key: std::collections::HashMap<String, &Record> =
            std::collections::HashMap::with_capacity(records.len());
        for record in records {
            by_key.insert(record.key.to_string(), record);
        }
        let deduped: Vec<&Record> = by_key.into_values().collect();

        let column_list: Vec<String> = fields
            .iter()
            .map(|f| quote_identifier(&f.name).into_owned())
            .collect();
        let updates: Vec<String> = fields
            .iter()
            .filter(|f| f.name != key_field)
            .map(|f| {
                let ident = quote_identifier(&f.name);
                format!("{ident} = excluded.{ident}")
            })
            .collect();

        let rows_per_batch = (MAX_BIND_PARAMS / fields.len().max(1)).clamp(1, 1_000);

        let mut tx = self.pool.begin().await.map_err(LoadError::from_sqlx)?;
        let mut committed = 0u64;

        for batch in deduped.chunks(rows_per_batch) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "insert into {} ({}) ",
                self.qualified(table),
                column_list.join(", ")
            ));
            qb.push_values(batch.iter().copied(), |mut b, record| {
                Self::push_record_binds(&mut b, key_field, fields, record);
            });
            if updates.is_empty() {
                qb.push(format!(
                    " on conflict ({}) do nothing",
                    quote_identifier(key_field)
                ));
            } else {
                qb.push(format!(
                    " on conflict ({}) do update set {}",
                    quote_identifier(key_field),
                    updates.join(", ")
                ));
            }

            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(LoadError::from_sqlx)?;
            committed += result.rows_affected();
        }

        tx.commit().await.map_err(LoadError::from_sqlx)?;

        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;
    use crate::load::schema::infer_fields;
    use chrono::Utc;
    use uuid::Uuid;

    const TEST_SCHEMA: &str = "shopsync_test";

    async fn test_destination() -> Option<(PgDestination, PgPool)> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");
        Some((PgDestination::new(pool.clone(), TEST_SCHEMA), pool))
    }

    fn fresh_table() -> String {
        format!("t_{}", Uuid::new_v4().simple())
    }

    fn record(id: i64, payload: serde_json::Value) -> Record {
        Record {
            key: RecordKey::Int(id),
            updated_at: Utc::now(),
            payload,
        }
    }

    async fn count_rows(pool: &PgPool, table: &str) -> i64 {
        sqlx::query(&format!(
            "select count(*) from {}.{}",
            quote_identifier(TEST_SCHEMA),
            quote_identifier(table)
        ))
        .fetch_one(pool)
        .await
        .expect("count")
        .get(0)
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let (dest, pool) = match test_destination().await {
            Some(d) => d,
            None => return,
        };
        let table = fresh_table();
        let records = vec![
            record(1, serde_json::json!({"id": 1, "email": "a@example.com"})),
            record(2, serde_json::json!({"id": 2, "email": "b@example.com"})),
        ];
        let fields = infer_fields(&table, "id", ColumnType::BigInt, &records).unwrap();

        dest.ensure_schema(&table, "id", &fields).await.unwrap();
        dest.upsert(&table, "id", &fields, &records).await.unwrap();
        dest.upsert(&table, "id", &fields, &records).await.unwrap();

        assert_eq!(count_rows(&pool, &table).await, 2);
    }

    #[tokio::test]
    async fn reload_overwrites_prior_values() {
        let (dest, pool) = match test_destination().await {
            Some(d) => d,
            None => return,
        };
        let table = fresh_table();

        let open = vec![record(10, serde_json::json!({"id": 10, "status": "open"}))];
        let fields = infer_fields(&table, "id", ColumnType::BigInt, &open).unwrap();
        dest.ensure_schema(&table, "id", &fields).await.unwrap();
        dest.upsert(&table, "id", &fields, &open).await.unwrap();

        let closed = vec![record(10, serde_json::json!({"id": 10, "status": "closed"}))];
        dest.upsert(&table, "id", &fields, &closed).await.unwrap();

        assert_eq!(count_rows(&pool, &table).await, 1);
        let status: String = sqlx::query(&format!(
            "select status from {}.{} where id = 10",
            quote_identifier(TEST_SCHEMA),
            quote_identifier(&table)
        ))
        .fetch_one(&pool)
        .await
        .expect("row")
        .get(0);
        assert_eq!(status, "closed");
    }

    #[tokio::test]
    async fn new_payload_field_adds_a_column() {
        let (dest, pool) = match test_destination().await {
            Some(d) => d,
            None => return,
        };
        let table = fresh_table();

        let first = vec![record(1, serde_json::json!({"id": 1, "title": "Mug"}))];
        let fields = infer_fields(&table, "id", ColumnType::BigInt, &first).unwrap();
        dest.ensure_schema(&table, "id", &fields).await.unwrap();
        dest.upsert(&table, "id", &fields, &first).await.unwrap();

        let second = vec![record(
            2,
            serde_json::json!({"id": 2, "title": "Cap", "vendor": "Acme"}),
        )];
        let fields = infer_fields(&table, "id", ColumnType::BigInt, &second).unwrap();
        dest.ensure_schema(&table, "id", &fields).await.unwrap();
        dest.upsert(&table, "id", &fields, &second).await.unwrap();

        let vendor: Option<String> = sqlx::query(&format!(
            "select vendor from {}.{} where id = 2",
            quote_identifier(TEST_SCHEMA),
            quote_identifier(&table)
        ))
        .fetch_one(&pool)
        .await
        .expect("row")
        .get(0);
        assert_eq!(vendor.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn type_conflict_on_existing_column_fails() {
        let (dest, _pool) = match test_destination().await {
            Some(d) => d,
            None => return,
        };
        let table = fresh_table();

        let first = vec![record(1, serde_json::json!({"id": 1, "amount": 5}))];
        let fields = infer_fields(&table, "id", ColumnType::BigInt, &first).unwrap();
        dest.ensure_schema(&table, "id", &fields).await.unwrap();

        let second = vec![record(2, serde_json::json!({"id": 2, "amount": "five"}))];
        let fields = infer_fields(&table, "id", ColumnType::BigInt, &second).unwrap();
        let err = dest.ensure_schema(&table, "id", &fields).await.unwrap_err();
        assert!(matches!(err, LoadError::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_keep_the_last_delivery() {
        let (dest, pool) = match test_destination().await {
            Some(d) => d,
            None => return,
        };
        let table = fresh_table();
        let records = vec![
            record(5, serde_json::json!({"id": 5, "status": "open"})),
            record(5, serde_json::json!({"id": 5, "status": "closed"})),
        ];
        let fields = infer_fields(&table, "id", ColumnType::BigInt, &records).unwrap();
        dest.ensure_schema(&table, "id", &fields).await.unwrap();
        dest.upsert(&table, "id", &fields, &records).await.unwrap();

        assert_eq!(count_rows(&pool, &table).await, 1);
        let status: String = sqlx::query(&format!(
            "select status from {}.{} where id = 5",
            quote_identifier(TEST_SCHEMA),
            quote_identifier(&table)
        ))
        .fetch_one(&pool)
        .await
        .expect("row")
        .get(0);
        assert_eq!(status, "closed");
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (dest, _pool) = match test_destination().await {
            Some(d) => d,
            None => return,
        };
        let count = dest.upsert("never_created", "id", &[], &[]).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn text_keys_are_supported() {
        let (dest, pool) = match test_destination().await {
            Some(d) => d,
            None => return,
        };
        let table = fresh_table();
        let records = vec![Record {
            key: RecordKey::Text("gid://shopify/Metaobject/7".into()),
            updated_at: Utc::now(),
            payload: serde_json::json!({"id": "gid://shopify/Metaobject/7", "type": "faq"}),
        }];
        let fields = infer_fields(&table, "id", ColumnType::Text, &records).unwrap();
        dest.ensure_schema(&table, "id", &fields).await.unwrap();
        dest.upsert(&table, "id", &fields, &records).await.unwrap();

        assert_eq!(count_rows(&pool, &table).await, 1);
    }
}
