//! Persistence of the reservation set across restarts.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{PersistenceError, Reservation};

/// Current state file format version.
const STATE_FILE_VERSION: u32 = 1;

/// Load/save boundary for the reservation set.
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Load every stored reservation. An absent store loads as empty.
    async fn load(&self) -> Result<Vec<Reservation>, PersistenceError>;

    /// Replace the stored set with `reservations`.
    async fn save(&self, reservations: &[Reservation]) -> Result<(), PersistenceError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    reservations: Vec<Reservation>,
}

/// Stores the reservation set as a JSON document on disk.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReservationRepository for JsonFileRepository {
    async fn load(&self) -> Result<Vec<Reservation>, PersistenceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let state: StateFile = serde_json::from_str(&contents)?;
        if state.version != STATE_FILE_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: state.version,
                expected: STATE_FILE_VERSION,
            });
        }
        Ok(state.reservations)
    }

    async fn save(&self, reservations: &[Reservation]) -> Result<(), PersistenceError> {
        let state = StateFile {
            version: STATE_FILE_VERSION,
            reservations: reservations.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&state)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| PersistenceError::Io(std::io::Error::other(e)))?
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut file = NamedTempFile::new_in(&dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| PersistenceError::Io(e.error))?;
    Ok(())
}
