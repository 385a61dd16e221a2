//! Batch reconciliation of an external dataset against a two-level canonical
//! hierarchy (parents such as states, children such as LGAs).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mobilizer_core::{CanonicalLocation, ExternalRecord, LocationLevel, MatchReason, MatchResult};
use mobilizer_ingest::{load_canonical_locations, load_external_records, ExternalColumns};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{LocationIndex, LocationReconciler, MatchPolicy, OverrideTable, ReconcileError, TieBreak};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub workspace_root: PathBuf,
    /// Overrides applied to record names within a parent scope. `None` runs
    /// without a table.
    pub overrides_path: Option<PathBuf>,
    /// Overrides applied to parent keys only.
    pub parent_overrides_path: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub policy: MatchPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            overrides_path: Some(PathBuf::from("config/lga_overrides.yaml")),
            parent_overrides_path: Some(PathBuf::from("config/state_overrides.yaml")),
            reports_dir: PathBuf::from("reports"),
            policy: MatchPolicy::default(),
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ReconcileError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config from `lookup`, which returns a variable's value when
    /// it is set. Unset variables take their defaults; set but unparseable
    /// ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ReconcileError> {
        let defaults = Self::default();
        let policy = MatchPolicy {
            ratio_percent: parse_usize_var(&lookup, "MOBILIZER_FUZZY_RATIO_PERCENT")?
                .unwrap_or(defaults.policy.ratio_percent),
            floor: parse_usize_var(&lookup, "MOBILIZER_FUZZY_FLOOR")?.unwrap_or(defaults.policy.floor),
            tie_break: match lookup("MOBILIZER_TIE_BREAK") {
                Some(value) => value.parse::<TieBreak>()?,
                None => defaults.policy.tie_break,
            },
        };
        Ok(Self {
            workspace_root: lookup("MOBILIZER_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            overrides_path: optional_path(lookup("MOBILIZER_OVERRIDES_PATH"), defaults.overrides_path),
            parent_overrides_path: optional_path(
                lookup("MOBILIZER_PARENT_OVERRIDES_PATH"),
                defaults.parent_overrides_path,
            ),
            reports_dir: lookup("MOBILIZER_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            policy,
        })
    }

    /// Resolve a configured path against the workspace root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn load_overrides(&self) -> Result<OverrideTable> {
        self.load_table(self.overrides_path.as_deref())
    }

    pub fn load_parent_overrides(&self) -> Result<OverrideTable> {
        self.load_table(self.parent_overrides_path.as_deref())
    }

    fn load_table(&self, path: Option<&Path>) -> Result<OverrideTable> {
        match path {
            Some(path) => OverrideTable::from_path(self.resolve_path(path)),
            None => Ok(OverrideTable::new()),
        }
    }
}

fn parse_usize_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<usize>, ReconcileError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| ReconcileError::InvalidEnv { var, value: value.clone() })
        })
        .transpose()
}

/// Empty or `none` disables the table; unset keeps the default.
fn optional_path(value: Option<String>, default: Option<PathBuf>) -> Option<PathBuf> {
    match value {
        Some(v) if v.trim().is_empty() || v.trim().eq_ignore_ascii_case("none") => None,
        Some(v) => Some(PathBuf::from(v)),
        None => default,
    }
}

/// Everything one run reconciles. `input_files` only feed the report manifest.
#[derive(Debug, Clone, Default)]
pub struct ReconcileInputs {
    pub parents: Vec<CanonicalLocation>,
    pub children: Vec<CanonicalLocation>,
    pub records: Vec<ExternalRecord>,
    pub input_files: Vec<PathBuf>,
}

impl ReconcileInputs {
    pub fn load(
        parents_path: &Path,
        children_path: &Path,
        records_path: &Path,
        parent_level: LocationLevel,
        columns: &ExternalColumns,
    ) -> Result<Self> {
        let child_level = parent_level
            .child()
            .with_context(|| format!("{parent_level} has no child level"))?;
        let parents = load_canonical_locations(parents_path, parent_level)?;
        let children = load_canonical_locations(children_path, child_level)?;
        let records = load_external_records(records_path, columns)?;
        Ok(Self {
            parents,
            children,
            records,
            input_files: vec![
                parents_path.to_path_buf(),
                children_path.to_path_buf(),
                records_path.to_path_buf(),
            ],
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub record: ExternalRecord,
    pub parent: MatchResult,
    pub result: MatchResult,
}

impl RecordOutcome {
    pub fn parent_unmatched(&self) -> bool {
        !self.parent.is_match()
    }

    /// Unmatched and tie-broken matches both need a human to look at them.
    pub fn needs_review(&self) -> bool {
        !self.result.is_match() || self.result.ambiguous || self.parent.ambiguous
    }
}

/// Persistence seam: receives every outcome that resolved to a record.
pub trait LinkHook: Send + Sync {
    fn apply(&self, linked: &[RecordOutcome]) -> Result<()>;
}

/// Reporting seam: receives every outcome queued for manual mapping.
pub trait ReviewHook: Send + Sync {
    fn apply(&self, queue: &[RecordOutcome]) -> Result<()>;
}

#[derive(Default)]
pub struct NoopLinkHook;

impl LinkHook for NoopLinkHook {
    fn apply(&self, _linked: &[RecordOutcome]) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopReviewHook;

impl ReviewHook for NoopReviewHook {
    fn apply(&self, _queue: &[RecordOutcome]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub by_reason: BTreeMap<MatchReason, usize>,
    pub parent_unmatched: usize,
    pub ambiguous: usize,
    pub review_queue: usize,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputManifest {
    pub schema_version: u32,
    pub files: Vec<InputManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputManifestFile {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    parent_reconciler: LocationReconciler,
    reconciler: LocationReconciler,
    link: Box<dyn LinkHook>,
    review: Box<dyn ReviewHook>,
}

impl ReconcilePipeline {
    /// `parent_overrides` apply to parent keys, `overrides` to record names
    /// inside a resolved parent scope.
    pub fn new(
        config: ReconcileConfig,
        parent_overrides: OverrideTable,
        overrides: OverrideTable,
    ) -> Result<Self> {
        let parent_reconciler = LocationReconciler::new(parent_overrides, config.policy)
            .context("building parent reconciler")?;
        let reconciler =
            LocationReconciler::new(overrides, config.policy).context("building reconciler")?;
        Ok(Self {
            config,
            parent_reconciler,
            reconciler,
            link: Box::<NoopLinkHook>::default(),
            review: Box::<NoopReviewHook>::default(),
        })
    }

    pub fn with_hooks(mut self, link: Box<dyn LinkHook>, review: Box<dyn ReviewHook>) -> Self {
        self.link = link;
        self.review = review;
        self
    }

    pub fn reconciler(&self) -> &LocationReconciler {
        &self.reconciler
    }

    /// Resolve each record's parent key, then its name within that parent's
    /// children only. Output order follows `records`.
    pub fn reconcile_records(
        &self,
        parents: &[CanonicalLocation],
        children: &LocationIndex,
        records: &[ExternalRecord],
    ) -> Vec<RecordOutcome> {
        records
            .iter()
            .map(|record| {
                let parent = self.resolve_parent(&record.parent_key, parents);
                let result = match &parent.matched {
                    Some(scope) => self
                        .reconciler
                        .resolve(&record.raw_name, children.candidates_for(&scope.id)),
                    None => MatchResult::unmatched(),
                };
                debug!(
                    raw_name = %record.raw_name,
                    parent_key = %record.parent_key,
                    reason = %result.reason,
                    matched = ?result.matched_id(),
                    "reconciled record"
                );
                RecordOutcome {
                    record: record.clone(),
                    parent,
                    result,
                }
            })
            .collect()
    }

    /// A parent key equal to a parent id short-circuits name matching.
    fn resolve_parent(&self, parent_key: &str, parents: &[CanonicalLocation]) -> MatchResult {
        let key = parent_key.trim();
        if let Some(hit) = parents.iter().find(|p| p.id.as_str() == key) {
            return MatchResult::exact(hit.clone());
        }
        self.parent_reconciler.resolve(key, parents)
    }

    pub async fn run_once(&self, inputs: ReconcileInputs) -> Result<ReconcileRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_with_id(run_id, inputs)
            .instrument(info_span!("reconcile_run", %run_id))
            .await
    }

    async fn run_with_id(&self, run_id: Uuid, inputs: ReconcileInputs) -> Result<ReconcileRunSummary> {
        let started_at = Utc::now();
        let index = LocationIndex::new(inputs.children.iter().cloned());
        info!(
            parents = inputs.parents.len(),
            children = index.len(),
            scopes = index.scope_count(),
            records = inputs.records.len(),
            parent_overrides = self.parent_reconciler.overrides().len(),
            overrides = self.reconciler.overrides().len(),
            "starting reconciliation"
        );

        let outcomes = self.reconcile_records(&inputs.parents, &index, &inputs.records);

        let mut by_reason: BTreeMap<MatchReason, usize> = BTreeMap::new();
        let mut parent_unmatched = 0usize;
        let mut ambiguous = 0usize;
        for outcome in &outcomes {
            *by_reason.entry(outcome.result.reason).or_default() += 1;
            if outcome.parent_unmatched() {
                parent_unmatched += 1;
                warn!(parent_key = %outcome.record.parent_key, "parent scope unmatched");
            }
            if outcome.result.ambiguous || outcome.parent.ambiguous {
                ambiguous += 1;
                warn!(
                    raw_name = %outcome.record.raw_name,
                    chosen = ?outcome.result.matched_id(),
                    "fuzzy match tied with another candidate"
                );
            }
        }

        let linked: Vec<RecordOutcome> = outcomes
            .iter()
            .filter(|o| o.result.is_match())
            .cloned()
            .collect();
        let queue: Vec<RecordOutcome> = outcomes.iter().filter(|o| o.needs_review()).cloned().collect();
        self.link.apply(&linked).context("applying linked outcomes")?;
        self.review.apply(&queue).context("queueing outcomes for review")?;

        let reports_dir = self
            .config
            .resolve_path(&self.config.reports_dir)
            .join(run_id.to_string());
        let finished_at = Utc::now();
        let summary = ReconcileRunSummary {
            run_id,
            started_at,
            finished_at,
            total: outcomes.len(),
            by_reason,
            parent_unmatched,
            ambiguous,
            review_queue: queue.len(),
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary, &outcomes, &queue, &inputs.input_files)
            .await?;

        info!(
            total = summary.total,
            linked = linked.len(),
            review_queue = summary.review_queue,
            "reconciliation complete"
        );
        Ok(summary)
    }

    async fn write_reports(
        &self,
        reports_dir: &Path,
        summary: &ReconcileRunSummary,
        outcomes: &[RecordOutcome],
        queue: &[RecordOutcome],
        input_files: &[PathBuf],
    ) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(reports_dir.join("summary.md"), summary_markdown(summary))
            .await
            .context("writing summary.md")?;

        let outcomes_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run": summary,
            "outcomes": outcomes,
        }))
        .context("serializing outcomes")?;
        fs::write(reports_dir.join("outcomes.json"), outcomes_json)
            .await
            .context("writing outcomes.json")?;

        let queue_json = serde_json::to_vec_pretty(queue).context("serializing review queue")?;
        fs::write(reports_dir.join("review_queue.json"), queue_json)
            .await
            .context("writing review_queue.json")?;

        let mut files = Vec::with_capacity(input_files.len());
        for path in input_files {
            files.push(manifest_entry(path).await?);
        }
        let manifest = InputManifest {
            schema_version: 1,
            files,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest).context("serializing input manifest")?;
        fs::write(reports_dir.join("manifest.json"), manifest_json)
            .await
            .context("writing manifest.json")?;

        Ok(())
    }
}

fn summary_markdown(summary: &ReconcileRunSummary) -> String {
    let reasons = summary
        .by_reason
        .iter()
        .map(|(reason, count)| format!("- {reason}: {count}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Location Reconciliation\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Records: {}\n- Parent unmatched: {}\n- Ambiguous ties: {}\n- Review queue: {}\n\n## By Reason\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.total,
        summary.parent_unmatched,
        summary.ambiguous,
        summary.review_queue,
        reasons
    )
}

async fn manifest_entry(path: &Path) -> Result<InputManifestFile> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(InputManifestFile {
        path: path.display().to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Load inputs from files, reconcile them with env-driven config, and write
/// reports.
pub async fn run_reconcile_from_env(
    parents_path: &Path,
    children_path: &Path,
    records_path: &Path,
    columns: &ExternalColumns,
) -> Result<ReconcileRunSummary> {
    let config = ReconcileConfig::from_env().context("reading MOBILIZER_* configuration")?;
    let parent_overrides = config.load_parent_overrides()?;
    let overrides = config.load_overrides()?;
    let inputs = ReconcileInputs::load(
        &config.resolve_path(parents_path),
        &config.resolve_path(children_path),
        &config.resolve_path(records_path),
        LocationLevel::State,
        columns,
    )?;
    let pipeline = ReconcilePipeline::new(config, parent_overrides, overrides)?;
    pipeline.run_once(inputs).await
}
