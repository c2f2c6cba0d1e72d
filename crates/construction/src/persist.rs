use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atomic_io::write_text_atomic;
use crate::building::Building;
use crate::lifecycle::BuildingStatus;

pub const BUILDING_BOOK_VERSION: u32 = 1;

/// Persisted Building records. Blueprints are never stored; they are
/// re-derived from their resources on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingBook {
    pub save_version: u32,
    pub next_building_id: u64,
    pub buildings: Vec<Building>,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to read building book {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write building book {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode building book: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("parse building book json{}: {message}", at_field(.field))]
    Parse { field: String, message: String },
    #[error("building book validation failed at {field}: {message}")]
    Invalid { field: String, message: String },
}

fn at_field(field: &str) -> String {
    if field.is_empty() || field == "." {
        String::new()
    } else {
        format!(" at {field}")
    }
}

pub fn encode_building_book(book: &BuildingBook) -> Result<String, PersistError> {
    serde_json::to_string_pretty(book).map_err(PersistError::Encode)
}

pub fn parse_building_book(raw: &str) -> Result<BuildingBook, PersistError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    let book = serde_path_to_error::deserialize::<_, BuildingBook>(&mut deserializer).map_err(
        |error| {
            let field = error.path().to_string();
            PersistError::Parse {
                field,
                message: error.into_inner().to_string(),
            }
        },
    )?;
    validate_building_book(&book)?;
    Ok(book)
}

pub fn save_building_book(path: &Path, book: &BuildingBook) -> Result<(), PersistError> {
    let text = encode_building_book(book)?;
    write_text_atomic(path, &text).map_err(|source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_building_book(path: &Path) -> Result<BuildingBook, PersistError> {
    let raw = fs::read_to_string(path).map_err(|source| PersistError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_building_book(&raw)
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> PersistError {
    PersistError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

fn validate_building_book(book: &BuildingBook) -> Result<(), PersistError> {
    if book.save_version != BUILDING_BOOK_VERSION {
        return Err(invalid(
            "save_version",
            format!(
                "expected {BUILDING_BOOK_VERSION}, got {}",
                book.save_version
            ),
        ));
    }

    let mut seen = HashSet::with_capacity(book.buildings.len());
    for (index, building) in book.buildings.iter().enumerate() {
        let id = building.id();
        if !seen.insert(id) {
            return Err(invalid(
                format!("buildings[{index}].id"),
                format!("duplicate building id {}", id.0),
            ));
        }
        if id.0 >= book.next_building_id {
            return Err(invalid(
                format!("buildings[{index}].id"),
                format!(
                    "id {} must be below next_building_id {}",
                    id.0, book.next_building_id
                ),
            ));
        }
        let progress = building.progress();
        if !progress.is_finite() || !(0.0..=1.0).contains(&progress) {
            return Err(invalid(
                format!("buildings[{index}].progress"),
                format!("expected a value in [0, 1], got {progress}"),
            ));
        }
        let may_hold_materials = matches!(
            building.status(),
            BuildingStatus::InProgress | BuildingStatus::Completed
        );
        if !may_hold_materials && !building.provided_materials().is_empty() {
            return Err(invalid(
                format!("buildings[{index}].provided_materials"),
                format!("{} building cannot hold provided materials", building.status()),
            ));
        }
    }
    Ok(())
}
