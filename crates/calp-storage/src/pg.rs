//! Postgres-backed listing store. Each listing is one JSONB document keyed by
//! its source URL; sync state lives in plain columns next to it.

use std::time::Duration;

use async_trait::async_trait;
use calp_core::{Listing, UpsertOutcome};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{
    document_for_write, fingerprint, ListingPage, ListingQuery, ListingStore, StoreError,
    StoredListing,
};

pub const DEFAULT_TABLE: &str = "car_ads";

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
    table: String,
}

impl PgListingStore {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, StoreError> {
        let table = validate_table_name(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool, table })
    }

    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            table: validate_table_name(table)?,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn row_to_listing(row: &PgRow) -> Result<Listing, StoreError> {
        let doc: serde_json::Value = row.try_get("doc")?;
        let mut listing: Listing = serde_json::from_value(doc)?;
        listing.indexed = row.try_get("indexed")?;
        listing.last_indexed = row.try_get("last_indexed")?;
        Ok(listing)
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> Result<String, StoreError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && table.len() <= 63 {
        Ok(table.to_string())
    } else {
        Err(StoreError::InvalidTableName(table.to_string()))
    }
}

pub fn schema_statements(table: &str) -> Vec<String> {
    let t = table;
    let mut statements = vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                url TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                doc JSONB NOT NULL,
                fingerprint TEXT NOT NULL,
                indexed BOOLEAN NOT NULL DEFAULT FALSE,
                last_indexed TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS {t}_id_key ON {t} (id)"),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS {t}_fulltext_idx ON {t} USING GIN (
                to_tsvector('simple'::regconfig,
                    coalesce(doc->>'title', '') || ' ' ||
                    coalesce(doc->>'description', '') || ' ' ||
                    coalesce(doc->>'search_text', ''))
            )
            "#
        ),
    ];

    let expressions = [
        ("price", "((doc->>'price')::bigint)"),
        ("year", "((doc->>'year')::int)"),
        ("mileage", "((doc->>'mileage')::bigint)"),
        ("make", "((doc->>'make'))"),
        ("model", "((doc->>'model'))"),
        ("fuel_type", "((doc->>'fuel_type'))"),
        ("transmission", "((doc->>'transmission'))"),
        ("seller_type", "((doc->'seller'->>'type'))"),
        ("scrape_timestamp", "((doc->>'scrape_timestamp')::bigint)"),
        ("publication_timestamp", "((doc->>'publication_timestamp')::bigint)"),
        ("active", "((doc->>'active')::boolean)"),
        ("indexed", "(indexed)"),
        ("created_at", "(created_at)"),
    ];
    for (name, expr) in expressions {
        statements.push(format!("CREATE INDEX IF NOT EXISTS {t}_{name}_idx ON {t} {expr}"));
    }
    statements
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('%');
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &ListingQuery) {
    builder.push(" WHERE TRUE");
    if let Some(make) = &query.make {
        builder.push(" AND doc->>'make' ILIKE ").push_bind(escape_like(make));
    }
    if let Some(model) = &query.model {
        builder.push(" AND doc->>'model' ILIKE ").push_bind(escape_like(model));
    }
    if let Some(min) = query.min_price {
        builder.push(" AND (doc->>'price')::bigint >= ").push_bind(min);
    }
    if let Some(max) = query.max_price {
        builder.push(" AND (doc->>'price')::bigint <= ").push_bind(max);
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        for statement in schema_statements(&self.table) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!(table = %self.table, "listing table and indexes ensured");
        Ok(())
    }

    async fn upsert(&self, listing: &Listing) -> Result<UpsertOutcome, StoreError> {
        let fingerprint = fingerprint(listing)?;
        let doc = serde_json::to_value(document_for_write(listing))?;
        let t = &self.table;
        let sql = format!(
            r#"
            INSERT INTO {t} (url, id, doc, fingerprint, indexed, last_indexed)
            VALUES ($1, $2, $3, $4, FALSE, NULL)
            ON CONFLICT (url) DO UPDATE
               SET id = EXCLUDED.id,
                   doc = EXCLUDED.doc,
                   fingerprint = EXCLUDED.fingerprint,
                   indexed = FALSE,
                   last_indexed = NULL,
                   updated_at = now()
             WHERE {t}.fingerprint IS DISTINCT FROM EXCLUDED.fingerprint
            RETURNING (xmax = 0) AS inserted
            "#
        );

        let result = sqlx::query(&sql)
            .bind(&listing.url)
            .bind(&listing.id)
            .bind(&doc)
            .bind(&fingerprint)
            .fetch_optional(&self.pool)
            .await;

        let row = match result {
            Ok(row) => row,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StoreError::DuplicateId {
                    id: listing.id.clone(),
                    url: listing.url.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = match row {
            None => UpsertOutcome::Unchanged,
            Some(row) if row.try_get::<bool, _>("inserted")? => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        };
        debug!(url = %listing.url, ?outcome, "listing upserted");
        Ok(outcome)
    }

    async fn find_unindexed(&self) -> Result<Vec<StoredListing>, StoreError> {
        let sql = format!(
            r#"
            SELECT doc, fingerprint, indexed, last_indexed
              FROM {}
             WHERE indexed IS NOT TRUE
             ORDER BY created_at, url
            "#,
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredListing {
                listing: Self::row_to_listing(&row)?,
                fingerprint: row.try_get("fingerprint")?,
            });
        }
        Ok(out)
    }

    async fn mark_indexed(
        &self,
        url: &str,
        fingerprint: &str,
        indexed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
               SET indexed = TRUE, last_indexed = $3
             WHERE url = $1 AND fingerprint = $2
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(url)
            .bind(fingerprint)
            .bind(indexed_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_image_downloaded(&self, url: &str, image_url: &str) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {t}
               SET doc = jsonb_set(doc, '{{images}}', (
                       SELECT coalesce(jsonb_agg(
                                  CASE WHEN e.img->>'url' = $2
                                       THEN jsonb_set(e.img, '{{downloaded}}', 'true'::jsonb)
                                       ELSE e.img END
                                  ORDER BY e.ord), '[]'::jsonb)
                         FROM jsonb_array_elements(doc->'images') WITH ORDINALITY AS e(img, ord)
                   )),
                   updated_at = now()
             WHERE url = $1
               AND EXISTS (
                   SELECT 1 FROM jsonb_array_elements(doc->'images') AS i(img)
                    WHERE i.img->>'url' = $2
               )
            "#,
            t = self.table
        );
        let result = sqlx::query(&sql)
            .bind(url)
            .bind(image_url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let sql = format!(
            "SELECT doc, indexed, last_indexed FROM {} WHERE id = $1",
            self.table
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_listing).transpose()
    }

    async fn query(&self, query: &ListingQuery) -> Result<ListingPage, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new(format!("SELECT count(*) AS total FROM {}", self.table));
        push_filters(&mut count, query);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT doc, indexed, last_indexed FROM {}",
            self.table
        ));
        push_filters(&mut select, query);
        select
            .push(" ORDER BY created_at DESC, url LIMIT ")
            .push_bind(query.limit() as i64)
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let rows = select.build().fetch_all(&self.pool).await?;

        let listings = rows
            .iter()
            .map(Self::row_to_listing)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ListingPage::new(query, total.max(0) as usize, listings))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let sql = format!("SELECT count(*) AS total FROM {}", self.table);
        let total: i64 = sqlx::query(&sql).fetch_one(&self.pool).await?.try_get("total")?;
        Ok(total.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_plain_identifiers() {
        assert_eq!(validate_table_name("car_ads").unwrap(), "car_ads");
        assert!(validate_table_name("_staging2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2cars").is_err());
        assert!(validate_table_name("car_ads; DROP TABLE x").is_err());
        assert!(validate_table_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn schema_covers_search_and_filter_fields() {
        let statements = schema_statements("car_ads");
        let joined = statements.join("\n");
        assert!(joined.contains("CREATE TABLE IF NOT EXISTS car_ads"));
        assert!(joined.contains("CREATE UNIQUE INDEX IF NOT EXISTS car_ads_id_key"));
        assert!(joined.contains("USING GIN"));
        for field in ["price", "year", "mileage", "make", "seller_type", "indexed", "active"] {
            assert!(
                joined.contains(&format!("car_ads_{field}_idx")),
                "missing index for {field}"
            );
        }
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("volvo"), "%volvo%");
        assert_eq!(escape_like("50%_off"), "%50\\%\\_off%");
    }
}
