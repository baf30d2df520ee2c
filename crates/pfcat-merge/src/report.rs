//! Per-invocation report artifacts consumed by the external coverage reports.
//!
//! Layout: `<reports_dir>/<run_id>/<invocation>/` holding `merge_result.json`,
//! `residuals.json`, `residuals.parquet` and a `manifest.json` that lists
//! every file with its sha256 and size. All files are write-once.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pfcat_core::{MergeOutcome, MergeRunResult, ResidualRow};
use pfcat_storage::{ArtifactStore, StoredArtifact};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub invocation: String,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl From<(&str, &StoredArtifact)> for ReportManifestFile {
    fn from((name, artifact): (&str, &StoredArtifact)) -> Self {
        Self {
            name: name.to_string(),
            path: artifact.relative_path.display().to_string(),
            sha256: artifact.content_hash.clone(),
            bytes: artifact.byte_size as u64,
        }
    }
}

/// Directory label for one merge invocation.
///
/// Committed merges use their seq; dry runs and run-health failures never
/// occupy a seq, so they are labelled by start time instead.
pub fn invocation_label(result: &MergeRunResult, failed: bool) -> String {
    let stamp = result.started_at.format("%Y%m%dT%H%M%S%.6fZ");
    if failed {
        format!("failed-{stamp}")
    } else if result.dry_run {
        format!("dry-run-{stamp}")
    } else {
        result.seq.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RunReportWriter {
    artifacts: ArtifactStore,
}

impl RunReportWriter {
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self { artifacts }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn write(&self, outcome: &MergeOutcome, failed: bool) -> Result<ReportManifest> {
        let run_id = outcome.result.run_id.as_str();
        let invocation = invocation_label(&outcome.result, failed);

        let result_json =
            serde_json::to_vec_pretty(&outcome.result).context("serializing merge result")?;
        let residuals_json =
            serde_json::to_vec_pretty(&outcome.residuals).context("serializing residuals")?;
        let residuals_parquet = residuals_parquet_bytes(&outcome.residuals)?;

        let mut files = Vec::with_capacity(3);
        for (name, file_name, bytes) in [
            ("merge_result", "merge_result.json", &result_json),
            ("residuals", "residuals.json", &residuals_json),
            ("residuals_parquet", "residuals.parquet", &residuals_parquet),
        ] {
            let stored = self
                .artifacts
                .store_bytes(run_id, &invocation, file_name, bytes)
                .await?;
            files.push(ReportManifestFile::from((name, &stored)));
        }

        let manifest = ReportManifest {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            invocation: invocation.clone(),
            files,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        let stored = self
            .artifacts
            .store_bytes(run_id, &invocation, "manifest.json", &bytes)
            .await?;
        info!(
            run_id,
            invocation = %invocation,
            residuals = outcome.residuals.len(),
            manifest = %stored.absolute_path.display(),
            "merge report written"
        );
        Ok(manifest)
    }
}

fn residuals_parquet_bytes(residuals: &[ResidualRow]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("staging_id", DataType::Utf8, false),
        ArrowField::new("run_id", DataType::Utf8, false),
        ArrowField::new("brand_slug", DataType::Utf8, false),
        ArrowField::new("name_slug", DataType::Utf8, false),
        ArrowField::new("product_key", DataType::Utf8, false),
        ArrowField::new("product_url", DataType::Utf8, true),
        ArrowField::new("reason", DataType::Utf8, false),
        ArrowField::new("candidate_keys", DataType::Utf8, true),
        ArrowField::new("suggested_brand_slug", DataType::Utf8, true),
    ]));

    let staging_ids = StringArray::from(
        residuals
            .iter()
            .map(|r| Some(r.staging_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let run_ids = StringArray::from(
        residuals
            .iter()
            .map(|r| Some(r.run_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let brand_slugs = StringArray::from(
        residuals
            .iter()
            .map(|r| Some(r.brand_slug.as_str()))
            .collect::<Vec<_>>(),
    );
    let name_slugs = StringArray::from(
        residuals
            .iter()
            .map(|r| Some(r.name_slug.as_str()))
            .collect::<Vec<_>>(),
    );
    let product_keys = StringArray::from(
        residuals
            .iter()
            .map(|r| Some(r.product_key.as_str()))
            .collect::<Vec<_>>(),
    );
    let product_urls = StringArray::from(
        residuals
            .iter()
            .map(|r| r.product_url.as_deref())
            .collect::<Vec<_>>(),
    );
    let reasons = StringArray::from(
        residuals
            .iter()
            .map(|r| Some(r.reason.as_str()))
            .collect::<Vec<_>>(),
    );
    let candidates = StringArray::from(
        residuals
            .iter()
            .map(|r| (!r.candidate_keys.is_empty()).then(|| r.candidate_keys.join(",")))
            .collect::<Vec<_>>(),
    );
    let suggestions = StringArray::from(
        residuals
            .iter()
            .map(|r| r.suggested_brand_slug.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(staging_ids),
            Arc::new(run_ids),
            Arc::new(brand_slugs),
            Arc::new(name_slugs),
            Arc::new(product_keys),
            Arc::new(product_urls),
            Arc::new(reasons),
            Arc::new(candidates),
            Arc::new(suggestions),
        ],
    )
    .context("building residuals record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening residuals parquet writer")?;
    writer
        .write(&batch)
        .context("writing residuals record batch")?;
    writer
        .into_inner()
        .context("closing residuals parquet writer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use pfcat_core::SkipReason;

    fn outcome() -> MergeOutcome {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        let mut result = MergeRunResult::new("bozita-site-2026-03-01", started);
        result.seq = 2;
        result.staged = 3;
        result.inserted = 1;
        result.record_skip(SkipReason::BrandNotAllowlisted);
        result.record_skip(SkipReason::KeyConflict);
        result.finished_at = started;
        let residual = |reason, keys: Vec<&str>, suggestion: Option<&str>| ResidualRow {
            staging_id: uuid::Uuid::new_v4(),
            run_id: result.run_id.clone(),
            brand_slug: "royal-canin".into(),
            name_slug: "mini-adult".into(),
            product_key: "royal-canin-mini-adult".into(),
            product_url: None,
            reason,
            candidate_keys: keys.into_iter().map(String::from).collect(),
            suggested_brand_slug: suggestion.map(String::from),
        };
        let residuals = vec![
            residual(SkipReason::BrandNotAllowlisted, vec![], Some("royalcanin")),
            residual(SkipReason::KeyConflict, vec!["a", "b"], None),
        ];
        MergeOutcome { result, residuals }
    }

    #[test]
    fn labels_distinguish_committed_dry_and_failed_runs() {
        let mut out = outcome();
        assert_eq!(invocation_label(&out.result, false), "2");
        assert_eq!(
            invocation_label(&out.result, true),
            "failed-20260301T093000.000000Z"
        );
        out.result.dry_run = true;
        assert!(invocation_label(&out.result, false).starts_with("dry-run-"));
    }

    #[test]
    fn parquet_has_one_row_per_residual() {
        let bytes = residuals_parquet_bytes(&outcome().residuals).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("residuals.parquet");
        std::fs::write(&path, bytes).unwrap();
        let reader = SerializedFileReader::new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }

    #[tokio::test]
    async fn writes_manifest_with_hashes_and_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunReportWriter::new(ArtifactStore::new(dir.path()));
        let out = outcome();

        let manifest = writer.write(&out, false).await.unwrap();
        assert_eq!(manifest.files.len(), 3);
        assert_eq!(manifest.invocation, "2");

        let invocation_dir = dir.path().join("bozita-site-2026-03-01").join("2");
        for file in ["merge_result.json", "residuals.json", "residuals.parquet", "manifest.json"] {
            assert!(invocation_dir.join(file).exists(), "{file} missing");
        }
        let residuals_json = std::fs::read(invocation_dir.join("residuals.json")).unwrap();
        let entry = manifest
            .files
            .iter()
            .find(|f| f.name == "residuals")
            .unwrap();
        assert_eq!(entry.sha256, pfcat_storage::sha256_hex(&residuals_json));
        assert_eq!(entry.bytes, residuals_json.len() as u64);

        // same outcome again is a no-op; a changed one for the same seq is refused
        writer.write(&out, false).await.unwrap();
        let mut changed = out.clone();
        changed.result.inserted = 7;
        assert!(writer.write(&changed, false).await.is_err());
    }
}
