//! Postgres-backed stores via `sqlx`.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pfcat_core::{
    AllowlistAction, AllowlistEntry, AllowlistTransition, AuditRecord, BrandCoverage, BrandStatus,
    CanonicalProduct, IngredientsFields, IngredientsSource, MergeOutcome, MergeRunResult,
    NutritionFields, ResidualRow, SkipReason, StagingRow,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::{
    seal_transition, AllowlistStore, CatalogStore, MergeTransaction, StagingStore, StoreError,
};

const PRODUCT_COLUMNS: &str = r#"
    id, product_key, brand, product_name, brand_slug, name_slug,
    ingredients_raw, ingredients_tokens, ingredients_language, ingredients_source,
    ingredients_parsed_at, protein_pct, fat_pct, fibre_pct, ash_pct, moisture_pct,
    macros_source, macros_updated_at, kcal_per_100g, kcal_source, kcal_updated_at,
    sources, created_at, updated_at
"#;

const STAGING_COLUMNS: &str = r#"
    id, run_id, brand, brand_slug, product_name_raw, name_slug, product_key_computed,
    product_url, ingredients_raw, ingredients_tokens, ingredients_language,
    ingredients_source, ingredients_parsed_at, extracted_at, debug
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }

    /// Rebuild the allowlist table from its audit log.
    pub async fn rebuild_allowlist(&self) -> Result<usize, StoreError> {
        let log = self.audit_log(None).await?;
        let entries = crate::project_allowlist(&log);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM brand_allowlist")
            .execute(&mut *tx)
            .await?;
        for entry in &entries {
            upsert_allowlist_entry(&mut tx, entry).await?;
        }
        tx.commit().await?;
        Ok(entries.len())
    }
}

fn parse_col<T: FromStr<Err = String>>(value: &str, column: &str) -> Result<T, StoreError> {
    value
        .parse::<T>()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn opt_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}: negative value {value}")))
}

fn staging_from_row(row: &PgRow) -> Result<StagingRow, StoreError> {
    let source: Option<String> = row.try_get("ingredients_source")?;
    Ok(StagingRow {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        brand: row.try_get("brand")?,
        brand_slug: row.try_get("brand_slug")?,
        product_name_raw: row.try_get("product_name_raw")?,
        name_slug: row.try_get("name_slug")?,
        product_key_computed: row.try_get("product_key_computed")?,
        product_url: row.try_get("product_url")?,
        ingredients_raw: row.try_get("ingredients_raw")?,
        ingredients_tokens: row
            .try_get::<Option<Vec<String>>, _>("ingredients_tokens")?
            .unwrap_or_default(),
        ingredients_language: row.try_get("ingredients_language")?,
        ingredients_source: source
            .as_deref()
            .map(|s| parse_col::<IngredientsSource>(s, "ingredients_source"))
            .transpose()?,
        ingredients_parsed_at: row.try_get("ingredients_parsed_at")?,
        extracted_at: row.try_get("extracted_at")?,
        debug: row.try_get("debug")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<CanonicalProduct, StoreError> {
    let source: Option<String> = row.try_get("ingredients_source")?;
    let sources: Vec<String> = row.try_get("sources")?;
    Ok(CanonicalProduct {
        id: row.try_get("id")?,
        product_key: row.try_get("product_key")?,
        brand: row.try_get("brand")?,
        product_name: row.try_get("product_name")?,
        brand_slug: row.try_get("brand_slug")?,
        name_slug: row.try_get("name_slug")?,
        ingredients: IngredientsFields {
            raw: row.try_get("ingredients_raw")?,
            tokens: row
                .try_get::<Option<Vec<String>>, _>("ingredients_tokens")?
                .unwrap_or_default(),
            language: row.try_get("ingredients_language")?,
            source: source
                .as_deref()
                .map(|s| parse_col::<IngredientsSource>(s, "ingredients_source"))
                .transpose()?,
            parsed_at: row.try_get("ingredients_parsed_at")?,
        },
        nutrition: NutritionFields {
            protein_pct: row.try_get("protein_pct")?,
            fat_pct: row.try_get("fat_pct")?,
            fibre_pct: row.try_get("fibre_pct")?,
            ash_pct: row.try_get("ash_pct")?,
            moisture_pct: row.try_get("moisture_pct")?,
            macros_source: row.try_get("macros_source")?,
            macros_updated_at: row.try_get("macros_updated_at")?,
            kcal_per_100g: row.try_get("kcal_per_100g")?,
            kcal_source: row.try_get("kcal_source")?,
            kcal_updated_at: row.try_get("kcal_updated_at")?,
        },
        sources: sources.into_iter().collect::<BTreeSet<_>>(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn coverage_from_json(value: Option<serde_json::Value>) -> Result<Option<BrandCoverage>, StoreError> {
    value
        .map(serde_json::from_value::<BrandCoverage>)
        .transpose()
        .map_err(StoreError::from)
}

fn audit_from_row(row: &PgRow) -> Result<AuditRecord, StoreError> {
    let action: String = row.try_get("action")?;
    let from_status: Option<String> = row.try_get("from_status")?;
    let to_status: String = row.try_get("to_status")?;
    let seq: i64 = row.try_get("seq")?;
    Ok(AuditRecord {
        seq: u64::try_from(seq).map_err(|_| StoreError::Corrupt(format!("seq: {seq}")))?,
        brand_slug: row.try_get("brand_slug")?,
        action: parse_col::<AllowlistAction>(&action, "action")?,
        from_status: from_status
            .as_deref()
            .map(|s| parse_col::<BrandStatus>(s, "from_status"))
            .transpose()?,
        to_status: parse_col::<BrandStatus>(&to_status, "to_status")?,
        actor: row.try_get("actor")?,
        reason: row.try_get("reason")?,
        coverage: coverage_from_json(row.try_get("coverage")?)?,
        recorded_at: row.try_get("recorded_at")?,
        prev_hash: row.try_get("prev_hash")?,
        entry_hash: row.try_get("entry_hash")?,
    })
}

fn allowlist_from_row(row: &PgRow) -> Result<AllowlistEntry, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(AllowlistEntry {
        brand_slug: row.try_get("brand_slug")?,
        status: parse_col::<BrandStatus>(&status, "status")?,
        coverage: coverage_from_json(row.try_get("coverage")?)?,
        version: opt_u32(row.try_get("version")?, "version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<MergeRunResult, StoreError> {
    let skipped: serde_json::Value = row.try_get("skipped")?;
    let count = |column: &str| -> Result<usize, StoreError> {
        let value: i32 = row.try_get(column)?;
        usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}: {value}")))
    };
    Ok(MergeRunResult {
        run_id: row.try_get("run_id")?,
        seq: opt_u32(row.try_get("seq")?, "seq")?,
        staged: count("staged")?,
        inserted: count("inserted")?,
        updated: count("updated")?,
        skipped: serde_json::from_value::<BTreeMap<SkipReason, usize>>(skipped)?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        dry_run: row.try_get("dry_run")?,
    })
}

fn residual_from_row(row: &PgRow) -> Result<ResidualRow, StoreError> {
    let reason: String = row.try_get("reason")?;
    Ok(ResidualRow {
        staging_id: row.try_get("staging_id")?,
        run_id: row.try_get("run_id")?,
        brand_slug: row.try_get("brand_slug")?,
        name_slug: row.try_get("name_slug")?,
        product_key: row.try_get("product_key")?,
        product_url: row.try_get("product_url")?,
        reason: parse_col::<SkipReason>(&reason, "reason")?,
        candidate_keys: row.try_get("candidate_keys")?,
        suggested_brand_slug: row.try_get("suggested_brand_slug")?,
    })
}

async fn upsert_allowlist_entry(
    tx: &mut Transaction<'static, Postgres>,
    entry: &AllowlistEntry,
) -> Result<(), StoreError> {
    let coverage = entry
        .coverage
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    sqlx::query(
        r#"
        INSERT INTO brand_allowlist (brand_slug, status, coverage, version, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (brand_slug) DO UPDATE SET
            status = excluded.status,
            coverage = COALESCE(excluded.coverage, brand_allowlist.coverage),
            version = excluded.version,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&entry.brand_slug)
    .bind(entry.status.as_str())
    .bind(coverage)
    .bind(entry.version as i32)
    .bind(entry.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl StagingStore for PgStore {
    async fn append_staging(&self, rows: &[StagingRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut appended = 0usize;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO staging_rows (
                    id, run_id, brand, brand_slug, product_name_raw, name_slug,
                    product_key_computed, product_url, ingredients_raw, ingredients_tokens,
                    ingredients_language, ingredients_source, ingredients_parsed_at,
                    extracted_at, debug
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(&row.run_id)
            .bind(&row.brand)
            .bind(&row.brand_slug)
            .bind(&row.product_name_raw)
            .bind(&row.name_slug)
            .bind(&row.product_key_computed)
            .bind(&row.product_url)
            .bind(&row.ingredients_raw)
            .bind(&row.ingredients_tokens)
            .bind(&row.ingredients_language)
            .bind(row.ingredients_source.map(|s| s.as_str()))
            .bind(row.ingredients_parsed_at)
            .bind(row.extracted_at)
            .bind(&row.debug)
            .execute(&mut *tx)
            .await?;
            appended += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(appended)
    }

    async fn staging_rows(&self, run_id: &str) -> Result<Vec<StagingRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM staging_rows WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(staging_from_row).collect()
    }
}

#[async_trait]
impl AllowlistStore for PgStore {
    async fn allowlist_entry(&self, brand_slug: &str) -> Result<Option<AllowlistEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT brand_slug, status, coverage, version, updated_at FROM brand_allowlist WHERE brand_slug = $1",
        )
        .bind(brand_slug)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(allowlist_from_row).transpose()
    }

    async fn allowlist(&self) -> Result<Vec<AllowlistEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT brand_slug, status, coverage, version, updated_at FROM brand_allowlist ORDER BY brand_slug",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(allowlist_from_row).collect()
    }

    async fn append_transition(
        &self,
        transition: AllowlistTransition,
    ) -> Result<AuditRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        // single writer for the chain
        sqlx::query("LOCK TABLE brand_allowlist_audit IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let tail = sqlx::query(
            r#"
            SELECT seq, brand_slug, action, from_status, to_status, actor, reason, coverage,
                   recorded_at, prev_hash, entry_hash
              FROM brand_allowlist_audit
             ORDER BY seq DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(audit_from_row)
        .transpose()?;

        let current = sqlx::query(
            "SELECT brand_slug, status, coverage, version, updated_at FROM brand_allowlist WHERE brand_slug = $1",
        )
        .bind(&transition.brand_slug)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(allowlist_from_row)
        .transpose()?;

        let record = seal_transition(tail.as_ref(), current.as_ref().map(|e| e.status), transition)?;
        let coverage = record
            .coverage
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO brand_allowlist_audit (
                seq, brand_slug, action, from_status, to_status, actor, reason, coverage,
                recorded_at, prev_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.seq as i64)
        .bind(&record.brand_slug)
        .bind(record.action.as_str())
        .bind(record.from_status.map(|s| s.as_str()))
        .bind(record.to_status.as_str())
        .bind(&record.actor)
        .bind(&record.reason)
        .bind(coverage)
        .bind(record.recorded_at)
        .bind(&record.prev_hash)
        .bind(&record.entry_hash)
        .execute(&mut *tx)
        .await?;

        let entry = AllowlistEntry {
            brand_slug: record.brand_slug.clone(),
            status: record.to_status,
            coverage: record
                .coverage
                .clone()
                .or_else(|| current.as_ref().and_then(|c| c.coverage.clone())),
            version: current.as_ref().map(|c| c.version).unwrap_or(0) + 1,
            updated_at: record.recorded_at,
        };
        upsert_allowlist_entry(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn audit_log(&self, brand_slug: Option<&str>) -> Result<Vec<AuditRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, brand_slug, action, from_status, to_status, actor, reason, coverage,
                   recorded_at, prev_hash, entry_hash
              FROM brand_allowlist_audit
             WHERE $1::text IS NULL OR brand_slug = $1
             ORDER BY seq
            "#,
        )
        .bind(brand_slug)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgMergeTx { tx }))
    }

    async fn product_by_key(
        &self,
        product_key: &str,
    ) -> Result<Option<CanonicalProduct>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM canonical_products WHERE product_key = $1"
        ))
        .bind(product_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn products(&self) -> Result<Vec<CanonicalProduct>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM canonical_products ORDER BY product_key"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(product_from_row).collect()
    }

    async fn merge_results(&self, run_id: &str) -> Result<Vec<MergeRunResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, seq, staged, inserted, updated, skipped, started_at, finished_at, dry_run
              FROM merge_runs
             WHERE run_id = $1
             ORDER BY seq
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn residuals(&self, run_id: &str, seq: u32) -> Result<Vec<ResidualRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT staging_id, run_id, brand_slug, name_slug, product_key, product_url, reason,
                   candidate_keys, suggested_brand_slug
              FROM merge_residuals
             WHERE run_id = $1 AND seq = $2
             ORDER BY brand_slug, product_key, staging_id
            "#,
        )
        .bind(run_id)
        .bind(seq as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(residual_from_row).collect()
    }
}

struct PgMergeTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MergeTransaction for PgMergeTx {
    async fn staging_rows(&mut self, run_id: &str) -> Result<Vec<StagingRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM staging_rows WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(staging_from_row).collect()
    }

    async fn lock_brands(&mut self, brand_slugs: &[String]) -> Result<(), StoreError> {
        let mut slugs = brand_slugs.to_vec();
        slugs.sort();
        slugs.dedup();
        for slug in &slugs {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext('pfcat:brand:' || $1))")
                .bind(slug)
                .execute(&mut *self.tx)
                .await?;
        }
        debug!(brands = slugs.len(), "acquired brand advisory locks");
        Ok(())
    }

    async fn brand_statuses(&mut self) -> Result<BTreeMap<String, BrandStatus>, StoreError> {
        let rows = sqlx::query("SELECT brand_slug, status FROM brand_allowlist")
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| {
                let slug: String = row.try_get("brand_slug")?;
                let status: String = row.try_get("status")?;
                Ok((slug, parse_col::<BrandStatus>(&status, "status")?))
            })
            .collect()
    }

    async fn product_by_key(
        &mut self,
        product_key: &str,
    ) -> Result<Option<CanonicalProduct>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM canonical_products WHERE product_key = $1"
        ))
        .bind(product_key)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn products_by_slugs(
        &mut self,
        brand_slug: &str,
        name_slug: &str,
    ) -> Result<Vec<CanonicalProduct>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM canonical_products WHERE brand_slug = $1 AND name_slug = $2 ORDER BY product_key"
        ))
        .bind(brand_slug)
        .bind(name_slug)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(product_from_row).collect()
    }

    async fn product_keys_for_brand(&mut self, brand_slug: &str) -> Result<Vec<String>, StoreError> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT product_key FROM canonical_products WHERE brand_slug = $1 ORDER BY product_key",
        )
        .bind(brand_slug)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(keys)
    }

    async fn insert_product(&mut self, product: &CanonicalProduct) -> Result<(), StoreError> {
        let sources: Vec<String> = product.sources.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO canonical_products (
                id, product_key, brand, product_name, brand_slug, name_slug,
                ingredients_raw, ingredients_tokens, ingredients_language, ingredients_source,
                ingredients_parsed_at, sources, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(product.id)
        .bind(&product.product_key)
        .bind(&product.brand)
        .bind(&product.product_name)
        .bind(&product.brand_slug)
        .bind(&product.name_slug)
        .bind(&product.ingredients.raw)
        .bind(&product.ingredients.tokens)
        .bind(&product.ingredients.language)
        .bind(product.ingredients.source.map(|s| s.as_str()))
        .bind(product.ingredients.parsed_at)
        .bind(&sources)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn fill_product(
        &mut self,
        product_key: &str,
        patch: &IngredientsFields,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // every assignment is guarded so a non-empty column is never replaced
        let result = sqlx::query(
            r#"
            UPDATE canonical_products SET
                ingredients_raw = CASE
                    WHEN COALESCE(btrim(ingredients_raw), '') = '' AND COALESCE(btrim($2), '') <> ''
                    THEN $2 ELSE ingredients_raw END,
                ingredients_tokens = CASE
                    WHEN NOT EXISTS (SELECT 1 FROM unnest(ingredients_tokens) t WHERE btrim(t) <> '')
                         AND EXISTS (SELECT 1 FROM unnest($3::text[]) t WHERE btrim(t) <> '')
                    THEN $3 ELSE ingredients_tokens END,
                ingredients_language = CASE
                    WHEN COALESCE(btrim(ingredients_language), '') = '' AND COALESCE(btrim($4), '') <> ''
                    THEN $4 ELSE ingredients_language END,
                ingredients_source = COALESCE(ingredients_source, $5),
                ingredients_parsed_at = COALESCE(ingredients_parsed_at, $6),
                sources = CASE WHEN $7 = ANY(sources) THEN sources ELSE array_append(sources, $7) END,
                updated_at = $8
            WHERE product_key = $1
            "#,
        )
        .bind(product_key)
        .bind(&patch.raw)
        .bind(&patch.tokens)
        .bind(&patch.language)
        .bind(patch.source.map(|s| s.as_str()))
        .bind(patch.parsed_at)
        .bind(origin)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "product_key `{product_key}` vanished mid-merge"
            )));
        }
        Ok(())
    }

    async fn record_outcome(&mut self, outcome: &MergeOutcome) -> Result<u32, StoreError> {
        let result = &outcome.result;
        let seq: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM merge_runs WHERE run_id = $1",
        )
        .bind(&result.run_id)
        .fetch_one(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO merge_runs (
                run_id, seq, staged, inserted, updated, skipped, started_at, finished_at, dry_run
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&result.run_id)
        .bind(seq)
        .bind(result.staged as i32)
        .bind(result.inserted as i32)
        .bind(result.updated as i32)
        .bind(serde_json::to_value(&result.skipped)?)
        .bind(result.started_at)
        .bind(result.finished_at)
        .bind(result.dry_run)
        .execute(&mut *self.tx)
        .await?;

        for residual in &outcome.residuals {
            sqlx::query(
                r#"
                INSERT INTO merge_residuals (
                    run_id, seq, staging_id, brand_slug, name_slug, product_key, product_url,
                    reason, candidate_keys, suggested_brand_slug
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(&residual.run_id)
            .bind(seq)
            .bind(residual.staging_id)
            .bind(&residual.brand_slug)
            .bind(&residual.name_slug)
            .bind(&residual.product_key)
            .bind(&residual.product_url)
            .bind(residual.reason.as_str())
            .bind(&residual.candidate_keys)
            .bind(&residual.suggested_brand_slug)
            .execute(&mut *self.tx)
            .await?;
        }

        opt_u32(seq, "seq")
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
