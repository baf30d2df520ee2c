//! Administrative side of the brand allowlist.
//!
//! The merge engine only ever reads brand status. Every change goes through
//! [`AllowlistAdmin`], which checks actor, reason and promotion coverage before
//! the store seals the transition into the audit chain.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use pfcat_core::{
    AllowlistAction, AllowlistEntry, AllowlistTransition, AuditRecord, BrandCoverage, BrandStatus,
};
use pfcat_storage::{project_allowlist, verify_chain, AllowlistStore, ChainBreak, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AllowlistError {
    #[error("an actor is required for allowlist changes")]
    MissingActor,
    #[error("a reason is required for allowlist changes")]
    MissingReason,
    #[error("brand slug is blank")]
    BlankBrand,
    #[error("promoting `{brand_slug}` requires coverage figures (or --force)")]
    MissingCoverage { brand_slug: String },
    #[error("promotion of `{brand_slug}` blocked: {}", .shortfalls.join("; "))]
    PromotionBlocked {
        brand_slug: String,
        shortfalls: Vec<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coverage thresholds a PENDING or PAUSED brand must meet before promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionPolicy {
    pub min_form_pct: f64,
    pub min_life_stage_pct: f64,
    pub min_ingredients_pct: f64,
    pub min_price_pct: f64,
    pub max_kcal_outliers: u32,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            min_form_pct: 95.0,
            min_life_stage_pct: 90.0,
            min_ingredients_pct: 85.0,
            min_price_pct: 70.0,
            max_kcal_outliers: 0,
        }
    }
}

impl PromotionPolicy {
    /// `rules/promotion.yaml` under `root`, or the defaults when it is absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("promotion.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn shortfalls(&self, coverage: &BrandCoverage) -> Vec<String> {
        let mut out = Vec::new();
        for (label, actual, minimum) in [
            ("form", coverage.form_pct, self.min_form_pct),
            ("life_stage", coverage.life_stage_pct, self.min_life_stage_pct),
            ("ingredients", coverage.ingredients_pct, self.min_ingredients_pct),
            ("price", coverage.price_pct, self.min_price_pct),
        ] {
            if actual < minimum {
                out.push(format!("{label} {actual:.1}% < {minimum:.1}%"));
            }
        }
        if coverage.kcal_outliers > self.max_kcal_outliers {
            out.push(format!(
                "kcal outliers {} > {}",
                coverage.kcal_outliers, self.max_kcal_outliers
            ));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct AllowlistRequest {
    pub brand_slug: String,
    pub action: AllowlistAction,
    pub actor: String,
    pub reason: String,
    pub coverage: Option<BrandCoverage>,
    /// Promote despite missing or insufficient coverage.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub records: usize,
    pub chain_break: Option<ChainBreak>,
    /// Brands whose stored projection disagrees with a replay of the log.
    pub drifted_brands: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.chain_break.is_none() && self.drifted_brands.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistSeed {
    #[serde(default = "default_seed_actor")]
    pub actor: String,
    pub brands: Vec<SeedBrand>,
}

fn default_seed_actor() -> String {
    "allowlist-seed".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedBrand {
    pub brand_slug: String,
    pub status: BrandStatus,
    pub reason: String,
    #[serde(default)]
    pub coverage: Option<BrandCoverage>,
}

pub fn load_allowlist_seed(path: impl AsRef<Path>) -> Result<AllowlistSeed> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub brands: usize,
    pub unchanged: usize,
    pub transitions: usize,
}

/// Shortest action sequence from `from` to `to`, if any.
fn plan_path(from: Option<BrandStatus>, to: BrandStatus) -> Option<Vec<AllowlistAction>> {
    const ACTIONS: [AllowlistAction; 4] = [
        AllowlistAction::Add,
        AllowlistAction::Promote,
        AllowlistAction::Pause,
        AllowlistAction::Remove,
    ];
    if from == Some(to) {
        return Some(Vec::new());
    }
    let mut seen = HashSet::from([from]);
    let mut queue = VecDeque::from([(from, Vec::new())]);
    while let Some((status, path)) = queue.pop_front() {
        for action in ACTIONS {
            let Some(next) = action.target(status) else {
                continue;
            };
            let mut next_path = path.clone();
            next_path.push(action);
            if next == to {
                return Some(next_path);
            }
            if seen.insert(Some(next)) {
                queue.push_back((Some(next), next_path));
            }
        }
    }
    None
}

pub struct AllowlistAdmin<'a, S: ?Sized> {
    store: &'a S,
    policy: PromotionPolicy,
}

impl<'a, S: AllowlistStore + ?Sized> AllowlistAdmin<'a, S> {
    pub fn new(store: &'a S, policy: PromotionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &PromotionPolicy {
        &self.policy
    }

    pub async fn apply(&self, request: AllowlistRequest) -> Result<AuditRecord, AllowlistError> {
        let brand_slug = request.brand_slug.trim().to_string();
        if brand_slug.is_empty() {
            return Err(AllowlistError::BlankBrand);
        }
        let actor = request.actor.trim().to_string();
        if actor.is_empty() {
            return Err(AllowlistError::MissingActor);
        }
        let mut reason = request.reason.trim().to_string();
        if reason.is_empty() {
            return Err(AllowlistError::MissingReason);
        }

        if request.action == AllowlistAction::Promote {
            let shortfalls = match &request.coverage {
                Some(coverage) => self.policy.shortfalls(coverage),
                None if request.force => vec!["no coverage supplied".to_string()],
                None => return Err(AllowlistError::MissingCoverage { brand_slug }),
            };
            if !shortfalls.is_empty() {
                if !request.force {
                    return Err(AllowlistError::PromotionBlocked {
                        brand_slug,
                        shortfalls,
                    });
                }
                warn!(brand_slug = %brand_slug, ?shortfalls, "forced promotion below thresholds");
                reason = format!("{reason} [forced: {}]", shortfalls.join("; "));
            }
        }

        let record = self
            .store
            .append_transition(AllowlistTransition {
                brand_slug,
                action: request.action,
                actor,
                reason,
                coverage: request.coverage,
                recorded_at: Utc::now(),
            })
            .await?;
        info!(
            seq = record.seq,
            brand_slug = %record.brand_slug,
            action = %record.action,
            from = ?record.from_status,
            to = %record.to_status,
            actor = %record.actor,
            "allowlist transition recorded"
        );
        Ok(record)
    }

    pub async fn status(&self, brand_slug: &str) -> Result<Option<BrandStatus>, AllowlistError> {
        Ok(self
            .store
            .allowlist_entry(brand_slug)
            .await?
            .map(|e| e.status))
    }

    pub async fn list(&self) -> Result<Vec<AllowlistEntry>, AllowlistError> {
        Ok(self.store.allowlist().await?)
    }

    pub async fn audit(&self, brand_slug: Option<&str>) -> Result<Vec<AuditRecord>, AllowlistError> {
        Ok(self.store.audit_log(brand_slug).await?)
    }

    /// Re-hash the whole audit chain and compare the stored projection with a
    /// fresh replay.
    pub async fn verify(&self) -> Result<VerifyReport, AllowlistError> {
        let log = self.store.audit_log(None).await?;
        let chain_break = verify_chain(&log)?;
        let replayed = project_allowlist(&log);
        let stored = self.store.allowlist().await?;

        let mut drifted_brands = Vec::new();
        for entry in &replayed {
            let current = stored.iter().find(|s| s.brand_slug == entry.brand_slug);
            if current.map(|s| (s.status, s.version)) != Some((entry.status, entry.version)) {
                drifted_brands.push(entry.brand_slug.clone());
            }
        }
        for entry in &stored {
            if !replayed.iter().any(|r| r.brand_slug == entry.brand_slug) {
                drifted_brands.push(entry.brand_slug.clone());
            }
        }
        drifted_brands.sort();
        drifted_brands.dedup();

        if let Some(b) = &chain_break {
            warn!(seq = b.seq, reason = %b.reason, "audit chain broken");
        }
        Ok(VerifyReport {
            records: log.len(),
            chain_break,
            drifted_brands,
        })
    }

    /// Bring each seeded brand to its requested status, skipping brands that
    /// are already there. Seeded promotions bypass the coverage policy.
    pub async fn seed(&self, seed: &AllowlistSeed) -> Result<SeedSummary, AllowlistError> {
        let mut summary = SeedSummary {
            brands: seed.brands.len(),
            ..Default::default()
        };
        for brand in &seed.brands {
            let current = self.status(&brand.brand_slug).await?;
            let path = plan_path(current, brand.status).ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "no transition path for `{}` to {}",
                    brand.brand_slug, brand.status
                ))
            })?;
            if path.is_empty() {
                summary.unchanged += 1;
                continue;
            }
            for action in path {
                self.apply(AllowlistRequest {
                    brand_slug: brand.brand_slug.clone(),
                    action,
                    actor: seed.actor.clone(),
                    reason: brand.reason.clone(),
                    coverage: brand.coverage.clone(),
                    force: true,
                })
                .await?;
                summary.transitions += 1;
            }
        }
        info!(
            brands = summary.brands,
            unchanged = summary.unchanged,
            transitions = summary.transitions,
            "allowlist seed applied"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfcat_storage::MemoryStore;

    fn full_coverage() -> BrandCoverage {
        BrandCoverage {
            product_count: 40,
            form_pct: 100.0,
            life_stage_pct: 97.5,
            ingredients_pct: 90.0,
            price_pct: 75.0,
            kcal_outliers: 0,
        }
    }

    fn request(brand: &str, action: AllowlistAction) -> AllowlistRequest {
        AllowlistRequest {
            brand_slug: brand.to_string(),
            action,
            actor: "ops@pfcat".to_string(),
            reason: "coverage review".to_string(),
            coverage: None,
            force: false,
        }
    }

    #[test]
    fn policy_lists_every_shortfall() {
        let policy = PromotionPolicy::default();
        assert!(policy.shortfalls(&full_coverage()).is_empty());

        let weak = BrandCoverage {
            price_pct: 50.0,
            kcal_outliers: 2,
            ..full_coverage()
        };
        let shortfalls = policy.shortfalls(&weak);
        assert_eq!(shortfalls.len(), 2);
        assert!(shortfalls[0].starts_with("price"));
        assert!(shortfalls[1].starts_with("kcal outliers"));
    }

    #[test]
    fn plans_shortest_legal_path() {
        use AllowlistAction::*;
        assert_eq!(plan_path(None, BrandStatus::Active), Some(vec![Add, Promote]));
        assert_eq!(plan_path(None, BrandStatus::Paused), Some(vec![Add, Pause]));
        assert_eq!(
            plan_path(Some(BrandStatus::Removed), BrandStatus::Active),
            Some(vec![Add, Promote])
        );
        assert_eq!(plan_path(Some(BrandStatus::Active), BrandStatus::Active), Some(vec![]));
        assert_eq!(
            plan_path(Some(BrandStatus::Active), BrandStatus::Pending),
            Some(vec![Remove, Add])
        );
    }

    #[test]
    fn promotion_policy_loads_from_rules_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            PromotionPolicy::from_workspace_root(dir.path()).unwrap(),
            PromotionPolicy::default()
        );

        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/promotion.yaml"),
            "min_price_pct: 60.0\nmax_kcal_outliers: 1\n",
        )
        .unwrap();
        let policy = PromotionPolicy::from_workspace_root(dir.path()).unwrap();
        assert_eq!(policy.min_price_pct, 60.0);
        assert_eq!(policy.max_kcal_outliers, 1);
        assert_eq!(policy.min_form_pct, 95.0);
    }

    #[tokio::test]
    async fn actor_and_reason_are_mandatory() {
        let store = MemoryStore::new();
        let admin = AllowlistAdmin::new(&store, PromotionPolicy::default());

        let mut no_actor = request("bozita", AllowlistAction::Add);
        no_actor.actor = "  ".into();
        assert!(matches!(
            admin.apply(no_actor).await,
            Err(AllowlistError::MissingActor)
        ));

        let mut no_reason = request("bozita", AllowlistAction::Add);
        no_reason.reason = String::new();
        assert!(matches!(
            admin.apply(no_reason).await,
            Err(AllowlistError::MissingReason)
        ));
        assert!(store.audit_log(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn promotion_requires_coverage_unless_forced() {
        let store = MemoryStore::new();
        let admin = AllowlistAdmin::new(&store, PromotionPolicy::default());
        admin.apply(request("acana", AllowlistAction::Add)).await.unwrap();

        assert!(matches!(
            admin.apply(request("acana", AllowlistAction::Promote)).await,
            Err(AllowlistError::MissingCoverage { .. })
        ));

        let mut weak = request("acana", AllowlistAction::Promote);
        weak.coverage = Some(BrandCoverage {
            ingredients_pct: 10.0,
            ..full_coverage()
        });
        assert!(matches!(
            admin.apply(weak.clone()).await,
            Err(AllowlistError::PromotionBlocked { .. })
        ));
        assert_eq!(admin.status("acana").await.unwrap(), Some(BrandStatus::Pending));

        weak.force = true;
        let record = admin.apply(weak).await.unwrap();
        assert_eq!(record.to_status, BrandStatus::Active);
        assert!(record.reason.contains("forced: ingredients"));
    }

    #[tokio::test]
    async fn illegal_transitions_surface_store_error() {
        let store = MemoryStore::new();
        let admin = AllowlistAdmin::new(&store, PromotionPolicy::default());
        let err = admin
            .apply(request("orijen", AllowlistAction::Pause))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AllowlistError::Store(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn seed_is_repeatable_and_verify_detects_tampering() {
        let store = MemoryStore::new();
        let admin = AllowlistAdmin::new(&store, PromotionPolicy::default());
        let seed: AllowlistSeed = serde_yaml::from_str(
            r#"
actor: onboarding
brands:
  - brand_slug: bozita
    status: ACTIVE
    reason: launch brand
  - brand_slug: acana
    status: PENDING
    reason: coverage in progress
"#,
        )
        .unwrap();

        let first = admin.seed(&seed).await.unwrap();
        assert_eq!(first.transitions, 3);
        let second = admin.seed(&seed).await.unwrap();
        assert_eq!(second.transitions, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(admin.status("bozita").await.unwrap(), Some(BrandStatus::Active));

        assert!(admin.verify().await.unwrap().is_clean());

        store
            .audit_log_mut(|log| log[1].actor = "someone-else".to_string())
            .unwrap();
        let report = admin.verify().await.unwrap();
        assert_eq!(report.chain_break.map(|b| b.seq), Some(log_seq(&store, 1).await));
    }

    async fn log_seq(store: &MemoryStore, index: usize) -> u64 {
        store.audit_log(None).await.unwrap()[index].seq
    }
}
