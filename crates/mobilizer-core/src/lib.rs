//! Core domain model for Mobilizer location reconciliation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mobilizer-core";

/// Opaque identifier of a canonical location record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for LocationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Nigerian administrative hierarchy, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationLevel {
    Country,
    State,
    Lga,
    Ward,
    PollingUnit,
}

impl LocationLevel {
    pub fn child(self) -> Option<Self> {
        match self {
            Self::Country => Some(Self::State),
            Self::State => Some(Self::Lga),
            Self::Lga => Some(Self::Ward),
            Self::Ward => Some(Self::PollingUnit),
            Self::PollingUnit => None,
        }
    }

    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Country => None,
            Self::State => Some(Self::Country),
            Self::Lga => Some(Self::State),
            Self::Ward => Some(Self::Lga),
            Self::PollingUnit => Some(Self::Ward),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::State => "state",
            Self::Lga => "lga",
            Self::Ward => "ward",
            Self::PollingUnit => "polling_unit",
        }
    }
}

impl fmt::Display for LocationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown location level `{}` (expected country, state, lga, ward or polling_unit)",
            self.0
        )
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for LocationLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "country" => Ok(Self::Country),
            "state" => Ok(Self::State),
            "lga" => Ok(Self::Lga),
            "ward" => Ok(Self::Ward),
            "polling_unit" => Ok(Self::PollingUnit),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// A record from the canonical location table. Immutable for the length of a
/// reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalLocation {
    pub id: LocationId,
    pub name: String,
    /// `None` only at the root of the hierarchy.
    pub parent_id: Option<LocationId>,
    pub level: LocationLevel,
}

impl CanonicalLocation {
    pub fn new(
        id: impl Into<LocationId>,
        name: impl Into<String>,
        parent_id: Option<LocationId>,
        level: LocationLevel,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id,
            level,
        }
    }
}

/// Untrusted free-text location from an external dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub raw_name: String,
    pub parent_key: String,
    /// 1-based data row in the source file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_row: Option<u64>,
}

impl ExternalRecord {
    pub fn new(raw_name: impl Into<String>, parent_key: impl Into<String>) -> Self {
        Self {
            raw_name: raw_name.into(),
            parent_key: parent_key.into(),
            source_row: None,
        }
    }

    pub fn with_source_row(mut self, row: u64) -> Self {
        self.source_row = Some(row);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Override,
    Exact,
    Fuzzy,
    Unmatched,
}

impl MatchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving one external name against a candidate set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: Option<CanonicalLocation>,
    pub reason: MatchReason,
    /// Edit distance between normalized names; `None` when unmatched.
    pub distance: Option<usize>,
    /// More than one candidate shared the winning fuzzy distance.
    #[serde(default)]
    pub ambiguous: bool,
}

impl MatchResult {
    pub fn unmatched() -> Self {
        Self {
            matched: None,
            reason: MatchReason::Unmatched,
            distance: None,
            ambiguous: false,
        }
    }

    pub fn exact(location: CanonicalLocation) -> Self {
        Self {
            matched: Some(location),
            reason: MatchReason::Exact,
            distance: Some(0),
            ambiguous: false,
        }
    }

    pub fn overridden(location: CanonicalLocation) -> Self {
        Self {
            matched: Some(location),
            reason: MatchReason::Override,
            distance: Some(0),
            ambiguous: false,
        }
    }

    pub fn fuzzy(location: CanonicalLocation, distance: usize, ambiguous: bool) -> Self {
        Self {
            matched: Some(location),
            reason: MatchReason::Fuzzy,
            distance: Some(distance),
            ambiguous,
        }
    }

    pub fn is_match(&self) -> bool {
        self.matched.is_some()
    }

    pub fn matched_id(&self) -> Option<&LocationId> {
        self.matched.as_ref().map(|m| &m.id)
    }
}
