//! Catalog persistence for the merge pipeline: store contracts, the
//! in-memory and Postgres backends, the allowlist audit chain, write-conflict
//! retry policy and the run report artifact store.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use pfcat_core::{
    AllowlistAction, AllowlistEntry, AllowlistTransition, AuditRecord, BrandCoverage, BrandStatus,
    CanonicalProduct, IngredientsFields, MergeOutcome, MergeRunResult, ResidualRow, StagingRow,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "pfcat-storage";

/// Hash that the first audit record chains from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("illegal allowlist transition {action} for brand `{brand_slug}` from {from}")]
    InvalidTransition {
        brand_slug: String,
        action: AllowlistAction,
        from: String,
    },
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // serialization_failure, deadlock_detected, unique_violation
            if matches!(db.code().as_deref(), Some("40001" | "40P01" | "23505")) {
                return StoreError::Conflict(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        classify_store_error(self) == RetryDisposition::Retryable
    }
}

/// Append-only landing zone written by extraction workers.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Insert rows that are not already present; returns how many were new.
    async fn append_staging(&self, rows: &[StagingRow]) -> Result<usize, StoreError>;

    async fn staging_rows(&self, run_id: &str) -> Result<Vec<StagingRow>, StoreError>;
}

/// Brand governance table plus its authoritative audit log.
#[async_trait]
pub trait AllowlistStore: Send + Sync {
    async fn allowlist_entry(&self, brand_slug: &str) -> Result<Option<AllowlistEntry>, StoreError>;

    async fn allowlist(&self) -> Result<Vec<AllowlistEntry>, StoreError>;

    /// Validate and append one transition atomically, returning the sealed record.
    async fn append_transition(
        &self,
        transition: AllowlistTransition,
    ) -> Result<AuditRecord, StoreError>;

    async fn audit_log(&self, brand_slug: Option<&str>) -> Result<Vec<AuditRecord>, StoreError>;
}

/// Canonical catalog. Mutated only through a [`MergeTransaction`]; there is no
/// delete path.
#[async_trait]
pub trait CatalogStore: StagingStore + AllowlistStore {
    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>, StoreError>;

    async fn product_by_key(&self, product_key: &str)
        -> Result<Option<CanonicalProduct>, StoreError>;

    async fn products(&self) -> Result<Vec<CanonicalProduct>, StoreError>;

    async fn merge_results(&self, run_id: &str) -> Result<Vec<MergeRunResult>, StoreError>;

    async fn residuals(&self, run_id: &str, seq: u32) -> Result<Vec<ResidualRow>, StoreError>;
}

/// One all-or-nothing merge. Dropping it without `commit` discards every write.
#[async_trait]
pub trait MergeTransaction: Send {
    async fn staging_rows(&mut self, run_id: &str) -> Result<Vec<StagingRow>, StoreError>;

    /// Serialize against other merges touching the same brands.
    async fn lock_brands(&mut self, brand_slugs: &[String]) -> Result<(), StoreError>;

    async fn brand_statuses(&mut self) -> Result<BTreeMap<String, BrandStatus>, StoreError>;

    async fn product_by_key(
        &mut self,
        product_key: &str,
    ) -> Result<Option<CanonicalProduct>, StoreError>;

    async fn products_by_slugs(
        &mut self,
        brand_slug: &str,
        name_slug: &str,
    ) -> Result<Vec<CanonicalProduct>, StoreError>;

    /// Keys of every canonical product of one brand, for residual hints.
    async fn product_keys_for_brand(&mut self, brand_slug: &str) -> Result<Vec<String>, StoreError>;

    async fn insert_product(&mut self, product: &CanonicalProduct) -> Result<(), StoreError>;

    /// Fill empty ingredient groups from `patch` and add `origin` to sources.
    /// Groups that are already non-empty in the store stay untouched.
    async fn fill_product(
        &mut self,
        product_key: &str,
        patch: &IngredientsFields,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record the invocation's counters and residuals; returns its seq.
    async fn record_outcome(&mut self, outcome: &MergeOutcome) -> Result<u32, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct AuditHashInput<'a> {
    seq: u64,
    brand_slug: &'a str,
    action: AllowlistAction,
    from_status: Option<BrandStatus>,
    to_status: BrandStatus,
    actor: &'a str,
    reason: &'a str,
    coverage: &'a Option<BrandCoverage>,
    recorded_at: String,
    prev_hash: &'a str,
}

fn audit_hash(record: &AuditRecord) -> Result<String, StoreError> {
    let input = AuditHashInput {
        seq: record.seq,
        brand_slug: &record.brand_slug,
        action: record.action,
        from_status: record.from_status,
        to_status: record.to_status,
        actor: &record.actor,
        reason: &record.reason,
        coverage: &record.coverage,
        recorded_at: record.recorded_at.to_rfc3339(),
        prev_hash: &record.prev_hash,
    };
    let bytes = serde_json::to_vec(&input)?;
    Ok(sha256_hex(&bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Current status of a brand as implied by its audit history.
pub fn replay_status(log: &[AuditRecord], brand_slug: &str) -> Option<BrandStatus> {
    log.iter()
        .filter(|r| r.brand_slug == brand_slug)
        .last()
        .map(|r| r.to_status)
}

/// Validate `transition` against the log and produce the next chained record.
///
/// `recorded_at` is truncated to microseconds so the hash survives a
/// round-trip through Postgres `timestamptz`.
pub fn seal_transition(
    log_tail: Option<&AuditRecord>,
    from_status: Option<BrandStatus>,
    transition: AllowlistTransition,
) -> Result<AuditRecord, StoreError> {
    let to_status =
        transition
            .action
            .target(from_status)
            .ok_or_else(|| StoreError::InvalidTransition {
                brand_slug: transition.brand_slug.clone(),
                action: transition.action,
                from: from_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "<absent>".to_string()),
            })?;

    let (seq, prev_hash) = match log_tail {
        Some(tail) => (tail.seq + 1, tail.entry_hash.clone()),
        None => (1, GENESIS_HASH.to_string()),
    };

    let mut record = AuditRecord {
        seq,
        brand_slug: transition.brand_slug,
        action: transition.action,
        from_status,
        to_status,
        actor: transition.actor,
        reason: transition.reason,
        coverage: transition.coverage,
        recorded_at: transition.recorded_at.trunc_subsecs(6),
        prev_hash,
        entry_hash: String::new(),
    };
    record.entry_hash = audit_hash(&record)?;
    Ok(record)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBreak {
    pub seq: u64,
    pub reason: String,
}

/// Re-hash the whole audit log and return the first broken link, if any.
pub fn verify_chain(log: &[AuditRecord]) -> Result<Option<ChainBreak>, StoreError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_seq = 1u64;
    for record in log {
        if record.seq != expected_seq {
            return Ok(Some(ChainBreak {
                seq: record.seq,
                reason: format!("expected seq {expected_seq}"),
            }));
        }
        if record.prev_hash != expected_prev {
            return Ok(Some(ChainBreak {
                seq: record.seq,
                reason: "prev_hash does not match predecessor".to_string(),
            }));
        }
        if audit_hash(record)? != record.entry_hash {
            return Ok(Some(ChainBreak {
                seq: record.seq,
                reason: "entry_hash does not match contents".to_string(),
            }));
        }
        expected_prev = record.entry_hash.clone();
        expected_seq += 1;
    }
    Ok(None)
}

/// Fold the audit log into the allowlist table it authorizes.
pub fn project_allowlist(log: &[AuditRecord]) -> Vec<AllowlistEntry> {
    let mut entries: BTreeMap<String, AllowlistEntry> = BTreeMap::new();
    for record in log {
        let entry = entries
            .entry(record.brand_slug.clone())
            .or_insert_with(|| AllowlistEntry {
                brand_slug: record.brand_slug.clone(),
                status: record.to_status,
                coverage: None,
                version: 0,
                updated_at: record.recorded_at,
            });
        entry.status = record.to_status;
        if record.coverage.is_some() {
            entry.coverage = record.coverage.clone();
        }
        entry.version += 1;
        entry.updated_at = record.recorded_at;
    }
    entries.into_values().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Conflict(_) => RetryDisposition::Retryable,
        StoreError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once report files for merge invocations, laid out as
/// `<root>/<run_id>/<invocation>/<file>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn invocation_dir(&self, run_id: &str, invocation: &str) -> PathBuf {
        PathBuf::from(sanitize_segment(run_id)).join(sanitize_segment(invocation))
    }

    /// Store bytes atomically via temp-file rename. Rewriting identical bytes is
    /// a deduplicated no-op; rewriting different bytes is an error.
    pub async fn store_bytes(
        &self,
        run_id: &str,
        invocation: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.invocation_dir(run_id, invocation).join(file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading artifact {}", absolute_path.display()))?;
            if sha256_hex(&existing) != content_hash {
                anyhow::bail!(
                    "artifact {} already exists with different content",
                    absolute_path.display()
                );
            }
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn sanitize_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn transition(brand: &str, action: AllowlistAction) -> AllowlistTransition {
        AllowlistTransition {
            brand_slug: brand.to_string(),
            action,
            actor: "ops@catalog".into(),
            reason: "onboarding review".into(),
            coverage: None,
            recorded_at: Utc
                .with_ymd_and_hms(2026, 2, 24, 12, 0, 0)
                .single()
                .unwrap(),
        }
    }

    fn build_log() -> Vec<AuditRecord> {
        let first = seal_transition(None, None, transition("bozita", AllowlistAction::Add)).unwrap();
        let second = seal_transition(
            Some(&first),
            Some(BrandStatus::Pending),
            transition("bozita", AllowlistAction::Promote),
        )
        .unwrap();
        let third = seal_transition(Some(&second), None, transition("acana", AllowlistAction::Add))
            .unwrap();
        vec![first, second, third]
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn audit_chain_verifies_and_detects_tampering() {
        let mut log = build_log();
        assert_eq!(log[0].prev_hash, GENESIS_HASH);
        assert_eq!(log[1].prev_hash, log[0].entry_hash);
        assert_eq!(verify_chain(&log).unwrap(), None);

        log[1].reason = "rewritten after the fact".into();
        let broken = verify_chain(&log).unwrap().expect("tampering detected");
        assert_eq!(broken.seq, 2);
    }

    #[test]
    fn illegal_transitions_are_rejected_before_sealing() {
        let err = seal_transition(None, None, transition("bozita", AllowlistAction::Promote))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn projection_reflects_latest_status_and_version() {
        let log = build_log();
        let entries = project_allowlist(&log);
        assert_eq!(entries.len(), 2);
        let bozita = entries.iter().find(|e| e.brand_slug == "bozita").unwrap();
        assert_eq!(bozita.status, BrandStatus::Active);
        assert_eq!(bozita.version, 2);
        assert_eq!(replay_status(&log, "acana"), Some(BrandStatus::Pending));
        assert_eq!(replay_status(&log, "orijen"), None);
    }

    #[test]
    fn conflicts_are_retryable_and_corruption_is_not() {
        assert!(StoreError::Conflict("dup".into()).is_retryable());
        assert!(!StoreError::Corrupt("bad".into()).is_retryable());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn artifacts_are_write_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_bytes("run/2026-03-01", "1", "merge_result.json", b"{\"inserted\":1}")
            .await
            .expect("first store");
        let second = store
            .store_bytes("run/2026-03-01", "1", "merge_result.json", b"{\"inserted\":1}")
            .await
            .expect("second store");
        let clash = store
            .store_bytes("run/2026-03-01", "1", "merge_result.json", b"{\"inserted\":2}")
            .await;

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert!(clash.is_err());
        assert_eq!(
            first.relative_path,
            PathBuf::from("run_2026-03-01").join("1").join("merge_result.json")
        );
        assert!(first.absolute_path.exists());
    }
}
