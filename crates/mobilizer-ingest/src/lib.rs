//! Loaders for canonical location tables and external location datasets.

use std::fs;
use std::path::{Path, PathBuf};

use mobilizer_core::{CanonicalLocation, ExternalRecord, LocationId, LocationLevel};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "mobilizer-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: missing column `{column}`", path.display())]
    MissingColumn { path: PathBuf, column: String },
    #[error("{}: row {row} has a blank id", path.display())]
    BlankId { path: PathBuf, row: u64 },
    #[error("{}: row {row} is not an object", path.display())]
    NotAnObject { path: PathBuf, row: u64 },
    #[error("{}: unsupported input format (expected .csv or .json)", path.display())]
    UnsupportedFormat { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Json,
}

impl InputFormat {
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("csv") => Ok(Self::Csv),
            Some("json") => Ok(Self::Json),
            _ => Err(IngestError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

/// Header names holding the location name and its parent in an external file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalColumns {
    pub name: String,
    pub parent: String,
}

impl Default for ExternalColumns {
    fn default() -> Self {
        Self {
            name: "name".to_string(),
            parent: "parent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CanonicalRow {
    id: String,
    name: String,
    #[serde(default)]
    parent_id: Option<String>,
}

/// Load canonical locations of one `level` from a `.csv` (`id,name,parent_id`)
/// or `.json` (array of the same objects) file, preserving file order.
pub fn load_canonical_locations(
    path: impl AsRef<Path>,
    level: LocationLevel,
) -> Result<Vec<CanonicalLocation>, IngestError> {
    let path = path.as_ref();
    let rows: Vec<CanonicalRow> = match InputFormat::from_path(path)? {
        InputFormat::Csv => {
            let mut reader = csv_reader(path)?;
            reader
                .deserialize::<CanonicalRow>()
                .collect::<Result<_, csv::Error>>()
                .map_err(|source| IngestError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?
        }
        InputFormat::Json => {
            let text = read_text(path)?;
            serde_json::from_str(&text).map_err(|source| IngestError::Json {
                path: path.to_path_buf(),
                source,
            })?
        }
    };

    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| {
            let id = row.id.trim();
            if id.is_empty() {
                return Err(IngestError::BlankId {
                    path: path.to_path_buf(),
                    row: idx as u64 + 1,
                });
            }
            let parent_id = row
                .parent_id
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .map(LocationId::from);
            Ok(CanonicalLocation::new(id, row.name.trim(), parent_id, level))
        })
        .collect()
}

/// Load external records from a `.csv` file with the given header names, or a
/// `.json` array of objects keyed by them. Missing values become empty strings.
pub fn load_external_records(
    path: impl AsRef<Path>,
    columns: &ExternalColumns,
) -> Result<Vec<ExternalRecord>, IngestError> {
    let path = path.as_ref();
    match InputFormat::from_path(path)? {
        InputFormat::Csv => load_external_csv(path, columns),
        InputFormat::Json => load_external_json(path, columns),
    }
}

fn load_external_csv(path: &Path, columns: &ExternalColumns) -> Result<Vec<ExternalRecord>, IngestError> {
    let csv_err = |source: csv::Error| IngestError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv_reader(path)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let position = |column: &str| {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| IngestError::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            })
    };
    let name_idx = position(columns.name.as_str())?;
    let parent_idx = position(columns.parent.as_str())?;

    let mut out = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let name = record.get(name_idx).unwrap_or_default();
        let parent = record.get(parent_idx).unwrap_or_default();
        out.push(ExternalRecord::new(name, parent).with_source_row(idx as u64 + 1));
    }
    Ok(out)
}

fn load_external_json(path: &Path, columns: &ExternalColumns) -> Result<Vec<ExternalRecord>, IngestError> {
    let text = read_text(path)?;
    let rows: Vec<JsonValue> = serde_json::from_str(&text).map_err(|source| IngestError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    rows.iter()
        .enumerate()
        .map(|(idx, row)| {
            let row_no = idx as u64 + 1;
            let Some(object) = row.as_object() else {
                return Err(IngestError::NotAnObject {
                    path: path.to_path_buf(),
                    row: row_no,
                });
            };
            let field = |key: &str| {
                object
                    .get(key)
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let record = ExternalRecord::new(field(columns.name.as_str()), field(columns.parent.as_str()));
            Ok(record.with_source_row(row_no))
        })
        .collect()
}

fn csv_reader(path: &Path) -> Result<csv::Reader<fs::File>, IngestError> {
    let file = fs::File::open(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(file))
}

fn read_text(path: &Path) -> Result<String, IngestError> {
    fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })
}
