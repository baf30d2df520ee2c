//! Core domain model for the pet-food catalog merge pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pfcat-core";

/// Namespace for deterministic staging row ids.
const STAGING_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b4d_4e57_8f60_2d1c_7a9e_b3f4);

/// Where an ingredient list was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngredientsSource {
    Label,
    Pdf,
    Site,
    Manual,
}

impl IngredientsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::Pdf => "pdf",
            Self::Site => "site",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for IngredientsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngredientsSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "label" => Ok(Self::Label),
            "pdf" => Ok(Self::Pdf),
            "site" => Ok(Self::Site),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown ingredients source `{other}`")),
        }
    }
}

/// One of the ingredient attributes the merge engine is allowed to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    IngredientsRaw,
    IngredientsTokens,
    IngredientsLanguage,
    IngredientsSource,
    IngredientsParsedAt,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 5] = [
        FieldGroup::IngredientsRaw,
        FieldGroup::IngredientsTokens,
        FieldGroup::IngredientsLanguage,
        FieldGroup::IngredientsSource,
        FieldGroup::IngredientsParsedAt,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            Self::IngredientsRaw => "ingredients_raw",
            Self::IngredientsTokens => "ingredients_tokens",
            Self::IngredientsLanguage => "ingredients_language",
            Self::IngredientsSource => "ingredients_source",
            Self::IngredientsParsedAt => "ingredients_parsed_at",
        }
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map(|v| v.trim().is_empty()).unwrap_or(true)
}

/// Ingredient field groups shared by staged observations and canonical products.
///
/// A group counts as empty when it is `None`, a blank string, or an empty
/// token list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IngredientsFields {
    pub raw: Option<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub language: Option<String>,
    pub source: Option<IngredientsSource>,
    pub parsed_at: Option<DateTime<Utc>>,
}

impl IngredientsFields {
    pub fn is_empty(&self, group: FieldGroup) -> bool {
        match group {
            FieldGroup::IngredientsRaw => blank(&self.raw),
            FieldGroup::IngredientsTokens => self.tokens.iter().all(|t| t.trim().is_empty()),
            FieldGroup::IngredientsLanguage => blank(&self.language),
            FieldGroup::IngredientsSource => self.source.is_none(),
            FieldGroup::IngredientsParsedAt => self.parsed_at.is_none(),
        }
    }

    /// Copy every group that is empty here and present in `staged`.
    ///
    /// Non-empty groups are never touched. Blank tokens are dropped on copy.
    /// Returns the groups written.
    pub fn fill_missing_from(&mut self, staged: &IngredientsFields) -> Vec<FieldGroup> {
        let mut written = Vec::new();
        for group in FieldGroup::ALL {
            if !self.is_empty(group) || staged.is_empty(group) {
                continue;
            }
            match group {
                FieldGroup::IngredientsRaw => self.raw = staged.raw.clone(),
                FieldGroup::IngredientsTokens => {
                    self.tokens = staged
                        .tokens
                        .iter()
                        .map(|t| t.trim())
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                }
                FieldGroup::IngredientsLanguage => self.language = staged.language.clone(),
                FieldGroup::IngredientsSource => self.source = staged.source,
                FieldGroup::IngredientsParsedAt => self.parsed_at = staged.parsed_at,
            }
            written.push(group);
        }
        written
    }
}

/// One extraction observation as landed in staging. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRow {
    pub id: Uuid,
    pub run_id: String,
    pub brand: String,
    pub brand_slug: String,
    pub product_name_raw: String,
    pub name_slug: String,
    pub product_key_computed: String,
    pub product_url: Option<String>,
    pub ingredients_raw: Option<String>,
    #[serde(default)]
    pub ingredients_tokens: Vec<String>,
    pub ingredients_language: Option<String>,
    pub ingredients_source: Option<IngredientsSource>,
    pub ingredients_parsed_at: Option<DateTime<Utc>>,
    pub extracted_at: DateTime<Utc>,
    #[serde(default)]
    pub debug: serde_json::Value,
}

impl StagingRow {
    /// Stable id for an observation so that appending it twice is a no-op.
    ///
    /// `payload_digest` fingerprints the observed content, so two different
    /// reads of one product at the same instant land as separate rows.
    pub fn deterministic_id(
        run_id: &str,
        product_key: &str,
        product_url: Option<&str>,
        extracted_at: DateTime<Utc>,
        payload_digest: &str,
    ) -> Uuid {
        let source = format!(
            "{}:{}:{}:{}:{}",
            run_id,
            product_key,
            product_url.unwrap_or("<no-url>"),
            extracted_at.to_rfc3339(),
            payload_digest
        );
        Uuid::new_v5(&STAGING_NAMESPACE, source.as_bytes())
    }

    pub fn ingredients(&self) -> IngredientsFields {
        IngredientsFields {
            raw: self.ingredients_raw.clone(),
            tokens: self.ingredients_tokens.clone(),
            language: self.ingredients_language.clone(),
            source: self.ingredients_source,
            parsed_at: self.ingredients_parsed_at,
        }
    }

    /// Origin identifier recorded in a canonical product's `sources`.
    pub fn origin(&self) -> String {
        match self.product_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!("staging:{}", self.id),
        }
    }
}

/// Macro and energy values; each group carries its own provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NutritionFields {
    pub protein_pct: Option<f64>,
    pub fat_pct: Option<f64>,
    pub fibre_pct: Option<f64>,
    pub ash_pct: Option<f64>,
    pub moisture_pct: Option<f64>,
    pub macros_source: Option<String>,
    pub macros_updated_at: Option<DateTime<Utc>>,
    pub kcal_per_100g: Option<f64>,
    pub kcal_source: Option<String>,
    pub kcal_updated_at: Option<DateTime<Utc>>,
}

/// Authoritative catalog record. Created and filled only by the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: Uuid,
    pub product_key: String,
    pub brand: String,
    pub product_name: String,
    pub brand_slug: String,
    pub name_slug: String,
    pub ingredients: IngredientsFields,
    #[serde(default)]
    pub nutrition: NutritionFields,
    #[serde(default)]
    pub sources: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalProduct {
    /// First sighting of a product: identity fields plus whatever the row carried.
    pub fn from_staging(row: &StagingRow, now: DateTime<Utc>) -> Self {
        let mut ingredients = IngredientsFields::default();
        ingredients.fill_missing_from(&row.ingredients());
        Self {
            id: Uuid::new_v4(),
            product_key: row.product_key_computed.clone(),
            brand: row.brand.clone(),
            product_name: row.product_name_raw.clone(),
            brand_slug: row.brand_slug.clone(),
            name_slug: row.name_slug.clone(),
            ingredients,
            nutrition: NutritionFields::default(),
            sources: BTreeSet::from([row.origin()]),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn slug_pair(&self) -> (&str, &str) {
        (&self.brand_slug, &self.name_slug)
    }
}

/// Governance status of a brand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrandStatus {
    Active,
    Pending,
    Paused,
    Removed,
}

impl BrandStatus {
    /// Whether an unmatched staged row may create a new canonical product.
    pub fn allows_creation(&self) -> bool {
        matches!(self, Self::Active | Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Pending => "PENDING",
            Self::Paused => "PAUSED",
            Self::Removed => "REMOVED",
        }
    }
}

impl fmt::Display for BrandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "PENDING" => Ok(Self::Pending),
            "PAUSED" => Ok(Self::Paused),
            "REMOVED" => Ok(Self::Removed),
            other => Err(format!("unknown brand status `{other}`")),
        }
    }
}

/// Administrative allowlist action. Each one is an explicit status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllowlistAction {
    Add,
    Promote,
    Pause,
    Remove,
}

impl AllowlistAction {
    /// Status reached by applying this action from `from`, or `None` when illegal.
    pub fn target(&self, from: Option<BrandStatus>) -> Option<BrandStatus> {
        use BrandStatus::*;
        match (self, from) {
            (Self::Add, None | Some(Removed)) => Some(Pending),
            (Self::Promote, Some(Pending | Paused)) => Some(Active),
            (Self::Pause, Some(Active | Pending)) => Some(Paused),
            (Self::Remove, Some(Active | Pending | Paused)) => Some(Removed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Promote => "PROMOTE",
            Self::Pause => "PAUSE",
            Self::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for AllowlistAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllowlistAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADD" => Ok(Self::Add),
            "PROMOTE" => Ok(Self::Promote),
            "PAUSE" => Ok(Self::Pause),
            "REMOVE" => Ok(Self::Remove),
            other => Err(format!("unknown allowlist action `{other}`")),
        }
    }
}

/// Per-brand data-quality coverage, as measured by the external reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BrandCoverage {
    pub product_count: u32,
    pub form_pct: f64,
    pub life_stage_pct: f64,
    pub ingredients_pct: f64,
    pub price_pct: f64,
    pub kcal_outliers: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub brand_slug: String,
    pub status: BrandStatus,
    pub coverage: Option<BrandCoverage>,
    /// Number of transitions applied to this brand.
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

/// A transition to be appended to the allowlist audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowlistTransition {
    pub brand_slug: String,
    pub action: AllowlistAction,
    pub actor: String,
    pub reason: String,
    pub coverage: Option<BrandCoverage>,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit log record, hash-chained to its predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub brand_slug: String,
    pub action: AllowlistAction,
    pub from_status: Option<BrandStatus>,
    pub to_status: BrandStatus,
    pub actor: String,
    pub reason: String,
    pub coverage: Option<BrandCoverage>,
    pub recorded_at: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Machine-readable reason a staged row was not merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BrandNotAllowlisted,
    KeyConflict,
    NoNewData,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BrandNotAllowlisted => "brand_not_allowlisted",
            Self::KeyConflict => "key_conflict",
            Self::NoNewData => "no_new_data",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkipReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "brand_not_allowlisted" => Ok(Self::BrandNotAllowlisted),
            "key_conflict" => Ok(Self::KeyConflict),
            "no_new_data" => Ok(Self::NoNewData),
            other => Err(format!("unknown skip reason `{other}`")),
        }
    }
}

/// Counters for one merge invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRunResult {
    pub run_id: String,
    /// Invocation number for this run id, assigned when recorded.
    pub seq: u32,
    pub staged: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
}

impl MergeRunResult {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            seq: 0,
            staged: 0,
            inserted: 0,
            updated: 0,
            skipped: BTreeMap::new(),
            started_at,
            finished_at: started_at,
            dry_run: false,
        }
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_default() += 1;
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    /// Rows that resolved to a canonical product, whether or not they changed it.
    pub fn effective(&self) -> usize {
        self.inserted + self.updated + self.skipped_for(SkipReason::NoNewData)
    }
}

/// A staged row that could not be merged, with enough context for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualRow {
    pub staging_id: Uuid,
    pub run_id: String,
    pub brand_slug: String,
    pub name_slug: String,
    pub product_key: String,
    pub product_url: Option<String>,
    pub reason: SkipReason,
    #[serde(default)]
    pub candidate_keys: Vec<String>,
    pub suggested_brand_slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub result: MergeRunResult,
    pub residuals: Vec<ResidualRow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn fill_missing_never_overwrites_present_groups() {
        let mut canonical = IngredientsFields {
            raw: Some("beef, peas".into()),
            tokens: vec![],
            language: Some("  ".into()),
            source: Some(IngredientsSource::Label),
            parsed_at: None,
        };
        let staged = IngredientsFields {
            raw: Some("lamb, carrots".into()),
            tokens: vec!["lamb".into(), "carrots".into()],
            language: Some("en".into()),
            source: Some(IngredientsSource::Site),
            parsed_at: Some(ts()),
        };

        let written = canonical.fill_missing_from(&staged);

        assert_eq!(canonical.raw.as_deref(), Some("beef, peas"));
        assert_eq!(canonical.source, Some(IngredientsSource::Label));
        assert_eq!(canonical.tokens, vec!["lamb".to_string(), "carrots".to_string()]);
        assert_eq!(canonical.language.as_deref(), Some("en"));
        assert_eq!(
            written,
            vec![
                FieldGroup::IngredientsTokens,
                FieldGroup::IngredientsLanguage,
                FieldGroup::IngredientsParsedAt
            ]
        );
    }

    #[test]
    fn blank_staged_values_do_not_count_as_data() {
        let mut canonical = IngredientsFields::default();
        let staged = IngredientsFields {
            raw: Some("   ".into()),
            tokens: vec!["".into()],
            ..Default::default()
        };
        assert!(canonical.fill_missing_from(&staged).is_empty());
        assert_eq!(canonical, IngredientsFields::default());
    }

    #[test]
    fn copied_tokens_drop_blank_entries() {
        let mut canonical = IngredientsFields::default();
        let staged = IngredientsFields {
            tokens: vec!["".into(), " chicken ".into(), "  ".into(), "rice".into()],
            ..Default::default()
        };
        assert_eq!(
            canonical.fill_missing_from(&staged),
            vec![FieldGroup::IngredientsTokens]
        );
        assert_eq!(canonical.tokens, vec!["chicken".to_string(), "rice".to_string()]);
    }

    #[test]
    fn allowlist_transitions_follow_the_lifecycle() {
        use BrandStatus::*;
        assert_eq!(AllowlistAction::Add.target(None), Some(Pending));
        assert_eq!(AllowlistAction::Add.target(Some(Removed)), Some(Pending));
        assert_eq!(AllowlistAction::Add.target(Some(Active)), None);
        assert_eq!(AllowlistAction::Promote.target(Some(Pending)), Some(Active));
        assert_eq!(AllowlistAction::Promote.target(Some(Paused)), Some(Active));
        assert_eq!(AllowlistAction::Promote.target(None), None);
        assert_eq!(AllowlistAction::Pause.target(Some(Active)), Some(Paused));
        assert_eq!(AllowlistAction::Pause.target(Some(Removed)), None);
        assert_eq!(AllowlistAction::Remove.target(Some(Paused)), Some(Removed));
        assert_eq!(AllowlistAction::Remove.target(Some(Removed)), None);
    }

    #[test]
    fn only_active_and_pending_allow_creation() {
        assert!(BrandStatus::Active.allows_creation());
        assert!(BrandStatus::Pending.allows_creation());
        assert!(!BrandStatus::Paused.allows_creation());
        assert!(!BrandStatus::Removed.allows_creation());
    }

    #[test]
    fn staging_ids_are_deterministic() {
        let id = |run: &str, digest: &str| {
            StagingRow::deterministic_id(run, "bozita-chicken-dry", Some("https://x"), ts(), digest)
        };
        assert_eq!(id("r1", "d1"), id("r1", "d1"));
        assert_ne!(id("r1", "d1"), id("r2", "d1"));
        assert_ne!(id("r1", "d1"), id("r1", "d2"));
    }

    #[test]
    fn wire_names_match_reason_codes() {
        let json = serde_json::to_string(&SkipReason::BrandNotAllowlisted).unwrap();
        assert_eq!(json, "\"brand_not_allowlisted\"");
        assert_eq!("key_conflict".parse::<SkipReason>(), Ok(SkipReason::KeyConflict));
        assert_eq!(
            serde_json::to_string(&IngredientsSource::Pdf).unwrap(),
            "\"pdf\""
        );
    }
}
