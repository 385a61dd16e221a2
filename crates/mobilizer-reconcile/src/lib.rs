//! Fuzzy reconciliation of free-text administrative location names onto
//! canonical records.
//!
//! Resolution order is override table, exact normalized match, then the
//! closest Levenshtein candidate within a length-relative threshold. Every
//! comparison is confined to one parent scope.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use mobilizer_core::{CanonicalLocation, LocationId, MatchResult};
use serde::Deserialize;
use thiserror::Error;

pub mod pipeline;

pub use pipeline::{
    run_reconcile_from_env, LinkHook, NoopLinkHook, NoopReviewHook, ReconcileConfig,
    ReconcileInputs, ReconcilePipeline, ReconcileRunSummary, RecordOutcome, ReviewHook,
};

pub const CRATE_NAME: &str = "mobilizer-reconcile";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid match policy: {0}")]
    InvalidPolicy(String),
    #[error("unknown tie-break `{0}` (expected `first` or `lowest-id`)")]
    UnknownTieBreak(String),
    #[error("{var}=`{value}` is not a non-negative integer")]
    InvalidEnv { var: &'static str, value: String },
    #[error("override `{from}` -> `{to}` normalizes to an empty name")]
    EmptyOverride { from: String, to: String },
    #[error("override key `{key}` maps to both `{first}` and `{second}`")]
    ConflictingOverride {
        key: String,
        first: String,
        second: String,
    },
    #[error("unsupported override table version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Canonical comparison key: uppercase, parentheticals removed, anything but
/// `A-Z`, `0-9` and whitespace blanked, whitespace collapsed and trimmed.
pub fn normalize_name(input: &str) -> String {
    strip_parentheticals(&input.to_uppercase())
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drops every `(...)` span, shortest first. An unclosed `(` is kept.
fn strip_parentheticals(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        out.push_str(&rest[..open]);
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

/// Character-level Levenshtein distance (unit cost insert, delete, substitute).
pub fn edit_distance(a: &str, b: &str) -> usize {
    strsim::levenshtein(a, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Keep the first candidate at the minimal distance, in candidate order.
    #[default]
    FirstCandidate,
    /// Prefer the smallest id among candidates at the minimal distance.
    LowestId,
}

impl FromStr for TieBreak {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-candidate" => Ok(Self::FirstCandidate),
            "lowest-id" | "lowest_id" => Ok(Self::LowestId),
            other => Err(ReconcileError::UnknownTieBreak(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPolicy {
    /// Share of the normalized external name's length that may differ.
    pub ratio_percent: usize,
    /// Lower bound on the allowed distance so short names still tolerate typos.
    pub floor: usize,
    pub tie_break: TieBreak,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            ratio_percent: 30,
            floor: 2,
            tie_break: TieBreak::FirstCandidate,
        }
    }
}

impl MatchPolicy {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.ratio_percent > 100 {
            return Err(ReconcileError::InvalidPolicy(format!(
                "ratio_percent must be at most 100, got {}",
                self.ratio_percent
            )));
        }
        Ok(())
    }

    /// Largest accepted fuzzy distance for a normalized name of `len` chars.
    pub fn threshold_for(&self, len: usize) -> usize {
        self.floor.max(len * self.ratio_percent / 100)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OverrideFile {
    version: u32,
    #[serde(default)]
    overrides: Vec<OverrideEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct OverrideEntry {
    from: String,
    to: String,
}

/// Known spelling divergences, keyed and valued by normalized name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    entries: HashMap<String, String>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ReconcileError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut entries: HashMap<String, String> = HashMap::new();
        for (from, to) in pairs {
            let key = normalize_name(from.as_ref());
            let target = normalize_name(to.as_ref());
            if key.is_empty() || target.is_empty() {
                return Err(ReconcileError::EmptyOverride {
                    from: from.as_ref().to_string(),
                    to: to.as_ref().to_string(),
                });
            }
            match entries.get(&key) {
                Some(existing) if *existing != target => {
                    return Err(ReconcileError::ConflictingOverride {
                        key,
                        first: existing.clone(),
                        second: target,
                    });
                }
                Some(_) => {}
                None => {
                    entries.insert(key, target);
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ReconcileError> {
        let file: OverrideFile = serde_yaml::from_str(text)?;
        if file.version != 1 {
            return Err(ReconcileError::UnsupportedVersion(file.version));
        }
        Self::from_pairs(file.overrides.into_iter().map(|e| (e.from, e.to)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Normalized canonical target for an already-normalized external name.
    pub fn lookup(&self, normalized: &str) -> Option<&str> {
        self.entries.get(normalized).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves external names to canonical records. Holds only immutable state,
/// so one instance can serve any number of threads.
#[derive(Debug, Clone, Default)]
pub struct LocationReconciler {
    overrides: OverrideTable,
    policy: MatchPolicy,
}

impl LocationReconciler {
    pub fn new(overrides: OverrideTable, policy: MatchPolicy) -> Result<Self, ReconcileError> {
        policy.validate()?;
        Ok(Self { overrides, policy })
    }

    pub fn overrides(&self) -> &OverrideTable {
        &self.overrides
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Resolve `external_name` against `candidates`, which must already be
    /// limited to a single parent scope.
    pub fn resolve(&self, external_name: &str, candidates: &[CanonicalLocation]) -> MatchResult {
        if candidates.is_empty() {
            return MatchResult::unmatched();
        }

        let normalized = normalize_name(external_name);
        let keyed: Vec<(String, &CanonicalLocation)> = candidates
            .iter()
            .map(|c| (normalize_name(&c.name), c))
            .collect();

        if let Some(target) = self.overrides.lookup(&normalized) {
            if let Some((_, hit)) = keyed.iter().find(|(key, _)| key == target) {
                return MatchResult::overridden((*hit).clone());
            }
        }

        if let Some((_, hit)) = keyed.iter().find(|(key, _)| *key == normalized) {
            return MatchResult::exact((*hit).clone());
        }

        let threshold = self.policy.threshold_for(normalized.chars().count());
        let mut best: Option<(&CanonicalLocation, usize)> = None;
        let mut tied = false;
        for (key, candidate) in keyed.iter().map(|(k, c)| (k, *c)) {
            let distance = edit_distance(&normalized, key);
            match best {
                None => best = Some((candidate, distance)),
                Some((_, best_distance)) if distance < best_distance => {
                    best = Some((candidate, distance));
                    tied = false;
                }
                Some((current, best_distance)) if distance == best_distance => {
                    tied = true;
                    if self.policy.tie_break == TieBreak::LowestId && candidate.id < current.id {
                        best = Some((candidate, distance));
                    }
                }
                Some(_) => {}
            }
        }

        match best {
            Some((hit, distance)) if distance <= threshold => {
                MatchResult::fuzzy(hit.clone(), distance, tied)
            }
            _ => MatchResult::unmatched(),
        }
    }
}

/// Canonical locations grouped by parent, each scope in load order.
#[derive(Debug, Clone, Default)]
pub struct LocationIndex {
    scopes: HashMap<Option<LocationId>, Vec<CanonicalLocation>>,
    total: usize,
}

impl LocationIndex {
    pub fn new(locations: impl IntoIterator<Item = CanonicalLocation>) -> Self {
        let mut scopes: HashMap<Option<LocationId>, Vec<CanonicalLocation>> = HashMap::new();
        let mut total = 0usize;
        for location in locations {
            scopes
                .entry(location.parent_id.clone())
                .or_default()
                .push(location);
            total += 1;
        }
        Self { scopes, total }
    }

    /// Candidates under `parent`; empty when the parent has no children.
    pub fn candidates_for(&self, parent: &LocationId) -> &[CanonicalLocation] {
        self.scopes
            .get(&Some(parent.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn roots(&self) -> &[CanonicalLocation] {
        self.scopes.get(&None).map(Vec::as_slice).unwrap_or_default()
    }

    /// The only scope's candidates, or `None` when the index spans zero or
    /// several parents and a caller must pick one explicitly.
    pub fn sole_scope(&self) -> Option<&[CanonicalLocation]> {
        if self.scopes.len() != 1 {
            return None;
        }
        self.scopes.values().next().map(Vec::as_slice)
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilizer_core::{LocationLevel, MatchReason};

    fn lga(id: &str, name: &str) -> CanonicalLocation {
        CanonicalLocation::new(id, name, Some("X".into()), LocationLevel::Lga)
    }

    fn reconciler(pairs: &[(&str, &str)]) -> LocationReconciler {
        let table = OverrideTable::from_pairs(pairs.iter().copied()).unwrap();
        LocationReconciler::new(table, MatchPolicy::default()).unwrap()
    }

    #[test]
    fn normalization_strips_case_punctuation_and_parentheticals() {
        assert_eq!(normalize_name("Esit-Eket"), "ESIT EKET");
        assert_eq!(normalize_name("  ideato   north "), "IDEATO NORTH");
        assert_eq!(normalize_name("Ideato North (Isiala)"), normalize_name("Ideato North"));
        assert_eq!(normalize_name("Ward 10/B"), "WARD 10 B");
        assert_eq!(normalize_name("Oru (East) (Old)"), "ORU");
    }

    #[test]
    fn normalization_keeps_unclosed_parenthesis_content() {
        assert_eq!(normalize_name("Obi (Ngwa"), "OBI NGWA");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["Esit-Eket", "Ideato North (Isiala)", "  ", "Àbájí", "ward 3, unit 007"] {
            let once = normalize_name(raw);
            assert_eq!(normalize_name(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn whitespace_only_normalizes_to_empty() {
        assert_eq!(normalize_name(" \t\n "), "");
    }

    #[test]
    fn edit_distance_handles_empty_and_is_symmetric() {
        assert_eq!(edit_distance("", "ABC"), 3);
        assert_eq!(edit_distance("ABC", ""), 3);
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("YAKUUR", "YAKURR"), 1);
        assert_eq!(edit_distance("KITTEN", "SITTING"), edit_distance("SITTING", "KITTEN"));
        assert_eq!(edit_distance("KITTEN", "SITTING"), 3);
    }

    #[test]
    fn override_scenario_matches_fufore() {
        let r = reconciler(&[("FUFURE", "FUFORE")]);
        let result = r.resolve("FUFURE", &[lga("1", "Fufore")]);
        assert_eq!(result.reason, MatchReason::Override);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("1"));
    }

    #[test]
    fn exact_scenario_matches_ideato_north() {
        let r = reconciler(&[]);
        let result = r.resolve("IDEATO-NORTH", &[lga("2", "Ideato North")]);
        assert_eq!(result.reason, MatchReason::Exact);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("2"));
        assert_eq!(result.distance, Some(0));
    }

    #[test]
    fn fuzzy_scenario_matches_yakurr() {
        let r = reconciler(&[]);
        let result = r.resolve("YAKUUR", &[lga("3", "Yakurr")]);
        assert_eq!(result.reason, MatchReason::Fuzzy);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("3"));
        assert_eq!(result.distance, Some(1));
        assert!(!result.ambiguous);
    }

    #[test]
    fn distant_name_is_unmatched() {
        let r = reconciler(&[]);
        let result = r.resolve("Kano Municipal", &[lga("4", "Lagos Island")]);
        assert_eq!(result, MatchResult::unmatched());
    }

    #[test]
    fn case_and_punctuation_variants_resolve_identically() {
        let r = reconciler(&[]);
        let candidates = [lga("9", "Esit Eket"), lga("10", "Eket")];
        let a = r.resolve("Esit-Eket", &candidates);
        let b = r.resolve("ESIT EKET", &candidates);
        assert_eq!(a, b);
        assert_eq!(a.matched_id().map(LocationId::as_str), Some("9"));
    }

    #[test]
    fn parenthetical_annotation_still_matches_exactly() {
        let r = reconciler(&[]);
        let result = r.resolve("Ideato North (Isiala)", &[lga("2", "Ideato North")]);
        assert_eq!(result.reason, MatchReason::Exact);
    }

    #[test]
    fn override_wins_over_closer_fuzzy_candidate() {
        let r = reconciler(&[("MUNYA", "CHANCHAGA")]);
        let candidates = [lga("1", "Munyo"), lga("2", "Chanchaga")];
        let result = r.resolve("Munya", &candidates);
        assert_eq!(result.reason, MatchReason::Override);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("2"));
    }

    #[test]
    fn override_target_outside_scope_falls_through() {
        let r = reconciler(&[("FUFURE", "FUFORE")]);
        let result = r.resolve("FUFURE", &[lga("5", "Fufure")]);
        assert_eq!(result.reason, MatchReason::Exact);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("5"));
    }

    #[test]
    fn threshold_boundary_at_length_ten() {
        let r = reconciler(&[]);
        // "ABCDEFGHIJ" has length 10, so the threshold is 3.
        let three_off = r.resolve("ABCDEFGHIJ", &[lga("1", "XYZDEFGHIJ")]);
        assert_eq!(three_off.reason, MatchReason::Fuzzy);
        assert_eq!(three_off.distance, Some(3));

        let four_off = r.resolve("ABCDEFGHIJ", &[lga("1", "WXYZEFGHIJ")]);
        assert_eq!(four_off.reason, MatchReason::Unmatched);
    }

    #[test]
    fn short_names_get_a_floor_of_two() {
        let policy = MatchPolicy::default();
        assert_eq!(policy.threshold_for(0), 2);
        assert_eq!(policy.threshold_for(6), 2);
        assert_eq!(policy.threshold_for(10), 3);
        assert_eq!(policy.threshold_for(14), 4);

        let r = reconciler(&[]);
        let result = r.resolve("OYO", &[lga("1", "Ayo")]);
        assert_eq!(result.reason, MatchReason::Fuzzy);
        assert_eq!(result.distance, Some(1));
    }

    #[test]
    fn empty_candidate_set_is_always_unmatched() {
        let r = reconciler(&[("FUFURE", "FUFORE")]);
        for name in ["FUFURE", "", "Lagos Island"] {
            assert_eq!(r.resolve(name, &[]), MatchResult::unmatched());
        }
    }

    #[test]
    fn empty_external_name_matches_nothing_long() {
        let r = reconciler(&[]);
        let result = r.resolve("   ", &[lga("1", "Yakurr")]);
        assert_eq!(result.reason, MatchReason::Unmatched);
    }

    #[test]
    fn tie_keeps_first_candidate_and_flags_ambiguity() {
        let r = reconciler(&[]);
        let candidates = [lga("b", "Okene"), lga("a", "Okehi")];
        let result = r.resolve("Okeni", &candidates);
        assert_eq!(result.reason, MatchReason::Fuzzy);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("b"));
        assert!(result.ambiguous);
    }

    #[test]
    fn lowest_id_tie_break_prefers_smaller_id() {
        let policy = MatchPolicy {
            tie_break: TieBreak::LowestId,
            ..MatchPolicy::default()
        };
        let r = LocationReconciler::new(OverrideTable::new(), policy).unwrap();
        let candidates = [lga("b", "Okene"), lga("a", "Okehi")];
        let result = r.resolve("Okeni", &candidates);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("a"));
        assert!(result.ambiguous);
    }

    #[test]
    fn later_strictly_closer_candidate_clears_ambiguity() {
        let r = reconciler(&[]);
        let candidates = [lga("1", "Okene"), lga("2", "Okehi"), lga("3", "Okeni")];
        let result = r.resolve("Okeni", &candidates);
        assert_eq!(result.reason, MatchReason::Exact);

        let candidates = [lga("1", "Okexx"), lga("2", "Okeyy"), lga("3", "Okenx")];
        let result = r.resolve("Okeni", &candidates);
        assert_eq!(result.matched_id().map(LocationId::as_str), Some("3"));
        assert!(!result.ambiguous);
    }

    #[test]
    fn override_table_rejects_conflicts_and_blanks() {
        let err = OverrideTable::from_pairs([("Fufure", "Fufore"), ("FUFURE", "Yola")]).unwrap_err();
        assert!(matches!(err, ReconcileError::ConflictingOverride { .. }));

        let err = OverrideTable::from_pairs([("(note)", "Fufore")]).unwrap_err();
        assert!(matches!(err, ReconcileError::EmptyOverride { .. }));

        let table = OverrideTable::from_pairs([("Fufure", "Fufore"), ("FUFURE", "fufore")]).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("FUFURE"), Some("FUFORE"));
    }

    #[test]
    fn override_table_parses_yaml() {
        let yaml = "version: 1\noverrides:\n  - from: Egbado North\n    to: Yewa North\n";
        let table = OverrideTable::from_yaml_str(yaml).unwrap();
        assert_eq!(table.lookup("EGBADO NORTH"), Some("YEWA NORTH"));

        let err = OverrideTable::from_yaml_str("version: 2\n").unwrap_err();
        assert!(matches!(err, ReconcileError::UnsupportedVersion(2)));
    }

    #[test]
    fn shipped_override_tables_load_per_level() {
        let config_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config");
        let lgas = OverrideTable::from_path(config_dir.join("lga_overrides.yaml")).unwrap();
        assert_eq!(lgas.lookup("FUFURE"), Some("FUFORE"));
        assert_eq!(lgas.lookup("FCT"), None);

        let states = OverrideTable::from_path(config_dir.join("state_overrides.yaml")).unwrap();
        assert_eq!(states.lookup("FCT"), Some("FEDERAL CAPITAL TERRITORY"));
        assert_eq!(states.lookup("AMAC"), None);
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let policy = MatchPolicy {
            ratio_percent: 150,
            ..MatchPolicy::default()
        };
        assert!(matches!(
            LocationReconciler::new(OverrideTable::new(), policy),
            Err(ReconcileError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn tie_break_parses_from_str() {
        assert_eq!("first".parse::<TieBreak>().unwrap(), TieBreak::FirstCandidate);
        assert_eq!("Lowest-Id".parse::<TieBreak>().unwrap(), TieBreak::LowestId);
        assert!("random".parse::<TieBreak>().is_err());
    }

    #[test]
    fn index_scopes_candidates_by_parent() {
        let index = LocationIndex::new(vec![
            CanonicalLocation::new("NG", "Nigeria", None, LocationLevel::Country),
            CanonicalLocation::new("1", "Fufore", Some("AD".into()), LocationLevel::Lga),
            CanonicalLocation::new("2", "Yola North", Some("AD".into()), LocationLevel::Lga),
            CanonicalLocation::new("3", "Lagos Island", Some("LA".into()), LocationLevel::Lga),
        ]);
        assert_eq!(index.len(), 4);
        assert_eq!(index.scope_count(), 3);
        assert_eq!(index.roots().len(), 1);
        let adamawa = index.candidates_for(&"AD".into());
        assert_eq!(adamawa.len(), 2);
        assert_eq!(adamawa[0].name, "Fufore");
        assert!(index.candidates_for(&"KN".into()).is_empty());

        let r = reconciler(&[]);
        let result = r.resolve("Lagos Island", index.candidates_for(&"AD".into()));
        assert_eq!(result.reason, MatchReason::Unmatched);
        assert!(index.sole_scope().is_none());
    }

    #[test]
    fn sole_scope_requires_exactly_one_parent() {
        let single = LocationIndex::new(vec![
            CanonicalLocation::new("1", "Fufore", Some("AD".into()), LocationLevel::Lga),
            CanonicalLocation::new("2", "Yola North", Some("AD".into()), LocationLevel::Lga),
        ]);
        assert_eq!(single.sole_scope().map(<[_]>::len), Some(2));

        let states = LocationIndex::new(vec![
            CanonicalLocation::new("KN", "Kano", None, LocationLevel::State),
            CanonicalLocation::new("LA", "Lagos", None, LocationLevel::State),
        ]);
        assert_eq!(states.sole_scope().map(<[_]>::len), Some(2));

        // Kano Municipal and Lagos Island in one file span two states.
        let mixed = LocationIndex::new(vec![
            CanonicalLocation::new("401", "Kano Municipal", Some("KN".into()), LocationLevel::Lga),
            CanonicalLocation::new("601", "Lagos Island", Some("LA".into()), LocationLevel::Lga),
        ]);
        assert!(mixed.sole_scope().is_none());
        assert!(LocationIndex::new(Vec::new()).sole_scope().is_none());
    }

    #[test]
    fn reconciler_is_shareable_across_threads() {
        let r = &reconciler(&[("FUFURE", "FUFORE")]);
        let candidates = &vec![lga("1", "Fufore"), lga("2", "Yakurr")];
        std::thread::scope(|s| {
            let handles: Vec<_> = ["FUFURE", "YAKUUR"]
                .into_iter()
                .map(|name| s.spawn(move || r.resolve(name, candidates)))
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap().is_match());
            }
        });
    }
}
