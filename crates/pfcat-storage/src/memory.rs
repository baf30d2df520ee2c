//! In-memory [`CatalogStore`] for tests and local dry runs.
//!
//! State sits behind a `std::sync::RwLock`; merges serialize per brand through
//! a map of `tokio::sync::Mutex`es. A merge transaction buffers its writes and
//! applies them in one step on commit, so an abandoned transaction leaves no
//! trace.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pfcat_core::{
    AllowlistEntry, AllowlistTransition, AuditRecord, BrandStatus, CanonicalProduct,
    IngredientsFields, MergeOutcome, MergeRunResult, ResidualRow, StagingRow,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::{
    project_allowlist, replay_status, seal_transition, AllowlistStore, CatalogStore,
    MergeTransaction, StagingStore, StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    staging: Vec<StagingRow>,
    staging_ids: HashSet<Uuid>,
    products: BTreeMap<String, CanonicalProduct>,
    audit: Vec<AuditRecord>,
    results: Vec<MergeOutcome>,
}

impl MemoryState {
    fn next_seq(&self, run_id: &str) -> u32 {
        self.results
            .iter()
            .filter(|o| o.result.run_id == run_id)
            .map(|o| o.result.seq)
            .max()
            .unwrap_or(0)
            + 1
    }
}

type BrandLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    brand_locks: BrandLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a canonical product directly, bypassing the merge path.
    pub fn seed_product(&self, product: CanonicalProduct) -> Result<(), StoreError> {
        let mut state = write(&self.state)?;
        state.products.insert(product.product_key.clone(), product);
        Ok(())
    }

    /// Tamper with the audit log. Only useful for exercising chain verification.
    #[doc(hidden)]
    pub fn audit_log_mut<F: FnOnce(&mut Vec<AuditRecord>)>(&self, f: F) -> Result<(), StoreError> {
        let mut state = write(&self.state)?;
        f(&mut state.audit);
        Ok(())
    }
}

fn read(state: &RwLock<MemoryState>) -> Result<RwLockReadGuard<'_, MemoryState>, StoreError> {
    state
        .read()
        .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
}

fn write(state: &RwLock<MemoryState>) -> Result<RwLockWriteGuard<'_, MemoryState>, StoreError> {
    state
        .write()
        .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn append_staging(&self, rows: &[StagingRow]) -> Result<usize, StoreError> {
        let mut state = write(&self.state)?;
        let mut appended = 0;
        for row in rows {
            if state.staging_ids.insert(row.id) {
                state.staging.push(row.clone());
                appended += 1;
            }
        }
        Ok(appended)
    }

    async fn staging_rows(&self, run_id: &str) -> Result<Vec<StagingRow>, StoreError> {
        let state = read(&self.state)?;
        Ok(state
            .staging
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AllowlistStore for MemoryStore {
    async fn allowlist_entry(&self, brand_slug: &str) -> Result<Option<AllowlistEntry>, StoreError> {
        let state = read(&self.state)?;
        Ok(project_allowlist(&state.audit)
            .into_iter()
            .find(|e| e.brand_slug == brand_slug))
    }

    async fn allowlist(&self) -> Result<Vec<AllowlistEntry>, StoreError> {
        let state = read(&self.state)?;
        Ok(project_allowlist(&state.audit))
    }

    async fn append_transition(
        &self,
        transition: AllowlistTransition,
    ) -> Result<AuditRecord, StoreError> {
        let mut state = write(&self.state)?;
        let from = replay_status(&state.audit, &transition.brand_slug);
        let record = seal_transition(state.audit.last(), from, transition)?;
        state.audit.push(record.clone());
        Ok(record)
    }

    async fn audit_log(&self, brand_slug: Option<&str>) -> Result<Vec<AuditRecord>, StoreError> {
        let state = read(&self.state)?;
        Ok(state
            .audit
            .iter()
            .filter(|r| brand_slug.map(|b| r.brand_slug == b).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>, StoreError> {
        Ok(Box::new(MemoryMergeTx {
            state: Arc::clone(&self.state),
            brand_locks: Arc::clone(&self.brand_locks),
            guards: Vec::new(),
            inserted: BTreeMap::new(),
            patched: BTreeMap::new(),
            patches: Vec::new(),
            outcome: None,
        }))
    }

    async fn product_by_key(
        &self,
        product_key: &str,
    ) -> Result<Option<CanonicalProduct>, StoreError> {
        let state = read(&self.state)?;
        Ok(state.products.get(product_key).cloned())
    }

    async fn products(&self) -> Result<Vec<CanonicalProduct>, StoreError> {
        let state = read(&self.state)?;
        Ok(state.products.values().cloned().collect())
    }

    async fn merge_results(&self, run_id: &str) -> Result<Vec<MergeRunResult>, StoreError> {
        let state = read(&self.state)?;
        Ok(state
            .results
            .iter()
            .filter(|o| o.result.run_id == run_id)
            .map(|o| o.result.clone())
            .collect())
    }

    async fn residuals(&self, run_id: &str, seq: u32) -> Result<Vec<ResidualRow>, StoreError> {
        let state = read(&self.state)?;
        Ok(state
            .results
            .iter()
            .find(|o| o.result.run_id == run_id && o.result.seq == seq)
            .map(|o| o.residuals.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct Patch {
    product_key: String,
    fields: IngredientsFields,
    origin: String,
    at: DateTime<Utc>,
}

struct MemoryMergeTx {
    state: Arc<RwLock<MemoryState>>,
    brand_locks: BrandLocks,
    guards: Vec<OwnedMutexGuard<()>>,
    inserted: BTreeMap<String, CanonicalProduct>,
    /// Working copies of committed products touched by this transaction.
    patched: BTreeMap<String, CanonicalProduct>,
    patches: Vec<Patch>,
    outcome: Option<MergeOutcome>,
}

impl MemoryMergeTx {
    fn visible(&self, product_key: &str) -> Result<Option<CanonicalProduct>, StoreError> {
        if let Some(p) = self.inserted.get(product_key) {
            return Ok(Some(p.clone()));
        }
        if let Some(p) = self.patched.get(product_key) {
            return Ok(Some(p.clone()));
        }
        let state = read(&self.state)?;
        Ok(state.products.get(product_key).cloned())
    }
}

fn apply_patch(product: &mut CanonicalProduct, patch: &Patch) {
    let written = product.ingredients.fill_missing_from(&patch.fields);
    if !written.is_empty() {
        product.sources.insert(patch.origin.clone());
        product.updated_at = patch.at;
    }
}

#[async_trait]
impl MergeTransaction for MemoryMergeTx {
    async fn staging_rows(&mut self, run_id: &str) -> Result<Vec<StagingRow>, StoreError> {
        let state = read(&self.state)?;
        Ok(state
            .staging
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn lock_brands(&mut self, brand_slugs: &[String]) -> Result<(), StoreError> {
        let mut slugs = brand_slugs.to_vec();
        slugs.sort();
        slugs.dedup();

        let locks = {
            let mut map = self.brand_locks.lock().await;
            slugs
                .iter()
                .map(|slug| {
                    map.entry(slug.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(())))
                        .clone()
                })
                .collect::<Vec<_>>()
        };
        for lock in locks {
            self.guards.push(lock.lock_owned().await);
        }
        debug!(brands = slugs.len(), "acquired brand locks");
        Ok(())
    }

    async fn brand_statuses(&mut self) -> Result<BTreeMap<String, BrandStatus>, StoreError> {
        let state = read(&self.state)?;
        Ok(project_allowlist(&state.audit)
            .into_iter()
            .map(|e| (e.brand_slug, e.status))
            .collect())
    }

    async fn product_by_key(
        &mut self,
        product_key: &str,
    ) -> Result<Option<CanonicalProduct>, StoreError> {
        self.visible(product_key)
    }

    async fn products_by_slugs(
        &mut self,
        brand_slug: &str,
        name_slug: &str,
    ) -> Result<Vec<CanonicalProduct>, StoreError> {
        let mut keys: Vec<String> = {
            let state = read(&self.state)?;
            state
                .products
                .values()
                .filter(|p| p.slug_pair() == (brand_slug, name_slug))
                .map(|p| p.product_key.clone())
                .collect()
        };
        keys.extend(
            self.inserted
                .values()
                .filter(|p| p.slug_pair() == (brand_slug, name_slug))
                .map(|p| p.product_key.clone()),
        );
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(p) = self.visible(&key)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    async fn product_keys_for_brand(&mut self, brand_slug: &str) -> Result<Vec<String>, StoreError> {
        let state = read(&self.state)?;
        let mut keys: Vec<String> = state
            .products
            .values()
            .filter(|p| p.brand_slug == brand_slug)
            .map(|p| p.product_key.clone())
            .collect();
        keys.extend(
            self.inserted
                .values()
                .filter(|p| p.brand_slug == brand_slug)
                .map(|p| p.product_key.clone()),
        );
        Ok(keys)
    }

    async fn insert_product(&mut self, product: &CanonicalProduct) -> Result<(), StoreError> {
        if self.visible(&product.product_key)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "product_key `{}` already exists",
                product.product_key
            )));
        }
        self.inserted
            .insert(product.product_key.clone(), product.clone());
        Ok(())
    }

    async fn fill_product(
        &mut self,
        product_key: &str,
        patch: &IngredientsFields,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let patch = Patch {
            product_key: product_key.to_string(),
            fields: patch.clone(),
            origin: origin.to_string(),
            at: now,
        };
        if let Some(product) = self.inserted.get_mut(product_key) {
            apply_patch(product, &patch);
            return Ok(());
        }
        let mut product = self.visible(product_key)?.ok_or_else(|| {
            StoreError::Conflict(format!("product_key `{product_key}` vanished mid-merge"))
        })?;
        apply_patch(&mut product, &patch);
        self.patched.insert(product_key.to_string(), product);
        self.patches.push(patch);
        Ok(())
    }

    async fn record_outcome(&mut self, outcome: &MergeOutcome) -> Result<u32, StoreError> {
        let seq = read(&self.state)?.next_seq(&outcome.result.run_id);
        let mut outcome = outcome.clone();
        outcome.result.seq = seq;
        self.outcome = Some(outcome);
        Ok(seq)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = write(&this.state)?;

        // validate everything before mutating anything
        for product in this.inserted.values() {
            let slug_taken = state
                .products
                .values()
                .any(|p| p.slug_pair() == product.slug_pair());
            if state.products.contains_key(&product.product_key) || slug_taken {
                return Err(StoreError::Conflict(format!(
                    "product_key `{}` was inserted concurrently",
                    product.product_key
                )));
            }
        }
        for patch in &this.patches {
            if !state.products.contains_key(&patch.product_key) {
                return Err(StoreError::Conflict(format!(
                    "product_key `{}` vanished before commit",
                    patch.product_key
                )));
            }
        }
        if let Some(outcome) = &this.outcome {
            if state.next_seq(&outcome.result.run_id) != outcome.result.seq {
                return Err(StoreError::Conflict(format!(
                    "merge result seq {} for run `{}` already recorded",
                    outcome.result.seq, outcome.result.run_id
                )));
            }
        }

        for patch in &this.patches {
            if let Some(product) = state.products.get_mut(&patch.product_key) {
                apply_patch(product, patch);
            }
        }
        for (key, product) in this.inserted {
            state.products.insert(key, product);
        }
        if let Some(outcome) = this.outcome {
            state.results.push(outcome);
        }
        drop(state);
        drop(this.guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
