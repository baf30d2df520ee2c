//! Handoff contract between extraction workers and the staging table.
//!
//! Workers drop one JSON bundle per extraction run; this crate validates it
//! into immutable [`StagingRow`]s and appends them. Staging is insert-only.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pfcat_core::{IngredientsSource, StagingRow};
use pfcat_storage::{sha256_hex, StagingStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "pfcat-staging";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingBundle {
    pub run_id: String,
    #[serde(default)]
    pub extractor: Option<String>,
    /// Default for rows that do not carry their own timestamp.
    #[serde(default)]
    pub extracted_at: Option<DateTime<Utc>>,
    pub rows: Vec<StagingRowInput>,
}

/// A row as written by an extraction worker, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagingRowInput {
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub brand_slug: String,
    #[serde(default, alias = "product_name")]
    pub product_name_raw: String,
    #[serde(default)]
    pub name_slug: String,
    #[serde(default, alias = "product_key")]
    pub product_key_computed: String,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub ingredients_raw: Option<String>,
    #[serde(default)]
    pub ingredients_tokens: Vec<String>,
    #[serde(default)]
    pub ingredients_language: Option<String>,
    #[serde(default)]
    pub ingredients_source: Option<IngredientsSource>,
    #[serde(default)]
    pub ingredients_parsed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extracted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub debug: serde_json::Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StagingError {
    #[error("bundle run_id is blank")]
    BlankRunId,
    #[error("row {index}: `{field}` is blank")]
    BlankField { index: usize, field: &'static str },
    #[error("row {index}: no extracted_at on the row or the bundle")]
    MissingExtractedAt { index: usize },
}

/// Digest of what a row observed, independent of when and where it was read.
fn payload_digest(input: &StagingRowInput, product_name_raw: &str) -> String {
    let payload = serde_json::json!({
        "product_name_raw": product_name_raw,
        "ingredients_raw": input.ingredients_raw,
        "ingredients_tokens": input.ingredients_tokens,
        "ingredients_language": input.ingredients_language,
        "ingredients_source": input.ingredients_source,
        "ingredients_parsed_at": input.ingredients_parsed_at,
        "debug": input.debug,
    });
    sha256_hex(payload.to_string().as_bytes())
}

impl StagingBundle {
    /// Validate every row and stamp deterministic ids. Fails on the first bad row
    /// so a bundle lands whole or not at all.
    pub fn into_rows(self) -> Result<Vec<StagingRow>, StagingError> {
        let run_id = self.run_id.trim().to_string();
        if run_id.is_empty() {
            return Err(StagingError::BlankRunId);
        }

        let mut rows = Vec::with_capacity(self.rows.len());
        for (index, input) in self.rows.into_iter().enumerate() {
            for (field, value) in [
                ("brand_slug", &input.brand_slug),
                ("name_slug", &input.name_slug),
                ("product_key_computed", &input.product_key_computed),
            ] {
                if value.trim().is_empty() {
                    return Err(StagingError::BlankField { index, field });
                }
            }
            let extracted_at = input
                .extracted_at
                .or(self.extracted_at)
                .ok_or(StagingError::MissingExtractedAt { index })?;

            let product_key = input.product_key_computed.trim().to_string();
            let product_url = input
                .product_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from);
            let brand = if input.brand.trim().is_empty() {
                input.brand_slug.trim().to_string()
            } else {
                input.brand.trim().to_string()
            };
            let product_name_raw = if input.product_name_raw.trim().is_empty() {
                input.name_slug.trim().to_string()
            } else {
                input.product_name_raw.clone()
            };
            let digest = payload_digest(&input, &product_name_raw);

            rows.push(StagingRow {
                id: StagingRow::deterministic_id(
                    &run_id,
                    &product_key,
                    product_url.as_deref(),
                    extracted_at,
                    &digest,
                ),
                run_id: run_id.clone(),
                brand,
                brand_slug: input.brand_slug.trim().to_string(),
                product_name_raw,
                name_slug: input.name_slug.trim().to_string(),
                product_key_computed: product_key,
                product_url,
                ingredients_raw: input.ingredients_raw,
                ingredients_tokens: input.ingredients_tokens,
                ingredients_language: input.ingredients_language,
                ingredients_source: input.ingredients_source,
                ingredients_parsed_at: input.ingredients_parsed_at,
                extracted_at,
                debug: input.debug,
            });
        }
        Ok(rows)
    }
}

pub fn load_staging_bundle(path: impl AsRef<Path>) -> Result<StagingBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendSummary {
    pub run_id: String,
    pub rows: usize,
    pub appended: usize,
    pub duplicates: usize,
}

pub async fn append_bundle<S>(store: &S, bundle: StagingBundle) -> Result<AppendSummary>
where
    S: StagingStore + ?Sized,
{
    let run_id = bundle.run_id.trim().to_string();
    let extractor = bundle.extractor.clone().unwrap_or_else(|| "unknown".to_string());
    let rows = bundle
        .into_rows()
        .with_context(|| format!("validating staging bundle for run {run_id}"))?;
    let appended = store
        .append_staging(&rows)
        .await
        .with_context(|| format!("appending staging rows for run {run_id}"))?;

    let summary = AppendSummary {
        run_id,
        rows: rows.len(),
        appended,
        duplicates: rows.len() - appended,
    };
    info!(
        run_id = %summary.run_id,
        extractor = %extractor,
        rows = summary.rows,
        appended = summary.appended,
        duplicates = summary.duplicates,
        "staging bundle appended"
    );
    Ok(summary)
}

pub async fn append_bundle_file<S>(store: &S, path: impl AsRef<Path>) -> Result<AppendSummary>
where
    S: StagingStore + ?Sized,
{
    let bundle = load_staging_bundle(path)?;
    append_bundle(store, bundle).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn input(key: &str) -> StagingRowInput {
        StagingRowInput {
            brand: "Bozita".into(),
            brand_slug: "bozita".into(),
            product_name_raw: "Chicken Dry".into(),
            name_slug: "chicken-dry".into(),
            product_key_computed: key.into(),
            product_url: Some(" https://bozita.example/chicken-dry ".into()),
            ingredients_raw: Some("chicken, rice".into()),
            ..Default::default()
        }
    }

    fn bundle(rows: Vec<StagingRowInput>) -> StagingBundle {
        StagingBundle {
            run_id: " R1 ".into(),
            extractor: Some("site-scraper".into()),
            extracted_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()),
            rows,
        }
    }

    #[test]
    fn rows_inherit_bundle_defaults_and_are_trimmed() {
        let rows = bundle(vec![input("bozita-chicken-dry")]).into_rows().unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.run_id, "R1");
        assert_eq!(row.product_url.as_deref(), Some("https://bozita.example/chicken-dry"));
        assert_eq!(
            row.extracted_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
        );
        let again = bundle(vec![input("bozita-chicken-dry")]).into_rows().unwrap();
        assert_eq!(row.id, again[0].id);
    }

    #[test]
    fn distinct_reads_of_one_product_get_distinct_ids() {
        let mut label = input("bozita-chicken-dry");
        label.product_url = None;
        label.ingredients_source = Some(IngredientsSource::Label);
        let mut pdf = label.clone();
        pdf.ingredients_raw = Some("chicken, rice, salt".into());
        pdf.ingredients_source = Some(IngredientsSource::Pdf);

        let rows = bundle(vec![label, pdf]).into_rows().unwrap();
        assert_ne!(rows[0].id, rows[1].id);
    }

    #[test]
    fn blank_identity_fields_reject_the_whole_bundle() {
        let mut bad = input("bozita-chicken-dry");
        bad.name_slug = "  ".into();
        let err = bundle(vec![input("ok"), bad]).into_rows().unwrap_err();
        assert_eq!(
            err,
            StagingError::BlankField {
                index: 1,
                field: "name_slug"
            }
        );
    }

    #[test]
    fn missing_timestamp_is_an_error() {
        let mut b = bundle(vec![input("bozita-chicken-dry")]);
        b.extracted_at = None;
        assert_eq!(
            b.into_rows().unwrap_err(),
            StagingError::MissingExtractedAt { index: 0 }
        );
    }

    #[test]
    fn blank_run_id_is_rejected() {
        let mut b = bundle(vec![]);
        b.run_id = "   ".into();
        assert_eq!(b.into_rows().unwrap_err(), StagingError::BlankRunId);
    }
}
