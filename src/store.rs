use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::{debug, info};

use crate::boundaries::{BoundaryFeature, GeometrySource};
use crate::error::CensusError;
use crate::geography::GeographyLevel;

/// Serialized boundary set for one `(level, year)` vintage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub level: GeographyLevel,
    pub year: u16,
    pub fetched_at: String,
    pub features: Vec<BoundaryFeature>,
}

type KeyLocks = Mutex<HashMap<(GeographyLevel, u16), Arc<Mutex<()>>>>;

/// On-disk boundary cache under `<root>/boundaries/<level>/<year>.json.gz`.
///
/// Entries are only ever created by atomic rename, so readers never observe
/// a partial file. First population of a key is serialized by a per-key lock.
#[derive(Debug)]
pub struct BoundaryCache {
    root: Utf8PathBuf,
    locks: KeyLocks,
}

impl BoundaryCache {
    pub fn new() -> Result<Self, CensusError> {
        Ok(Self::with_root(Self::default_root()?))
    }

    pub fn with_root(root: Utf8PathBuf) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_root() -> Result<Utf8PathBuf, CensusError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("census-etl")).ok()
            })
            .ok_or_else(|| CensusError::Cache("unable to resolve cache directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn entry_path(&self, level: GeographyLevel, year: u16) -> Utf8PathBuf {
        self.root
            .join("boundaries")
            .join(level.as_str())
            .join(format!("{year}.json.gz"))
    }

    pub fn contains(&self, level: GeographyLevel, year: u16) -> bool {
        self.entry_path(level, year).as_std_path().exists()
    }

    pub fn read(&self, level: GeographyLevel, year: u16) -> Result<Option<CacheEntry>, CensusError> {
        let path = self.entry_path(level, year);
        let file = match fs::File::open(path.as_std_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CensusError::Cache(format!("open {path}: {err}"))),
        };
        let decoder = GzDecoder::new(BufReader::new(file));
        let entry: CacheEntry = serde_json::from_reader(decoder)
            .map_err(|err| CensusError::Cache(format!("decode {path}: {err}")))?;
        if entry.level != level || entry.year != year {
            return Err(CensusError::Cache(format!(
                "{path} holds {} {} boundaries",
                entry.level, entry.year
            )));
        }
        Ok(Some(entry))
    }

    pub fn write(&self, entry: &CacheEntry) -> Result<(), CensusError> {
        let path = self.entry_path(entry.level, entry.year);
        let parent = path
            .parent()
            .ok_or_else(|| CensusError::Cache("invalid cache path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CensusError::Cache(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".boundaries")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CensusError::Cache(err.to_string()))?;
        {
            let mut encoder =
                GzEncoder::new(BufWriter::new(temp.as_file_mut()), Compression::default());
            serde_json::to_writer(&mut encoder, entry)
                .map_err(|err| CensusError::Cache(err.to_string()))?;
            encoder
                .finish()
                .and_then(|mut writer| writer.flush())
                .map_err(|err| CensusError::Cache(err.to_string()))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| CensusError::Cache(err.to_string()))?;
        Ok(())
    }

    /// Drops one entry; the next lookup refetches it.
    pub fn remove(&self, level: GeographyLevel, year: u16) -> Result<bool, CensusError> {
        let path = self.entry_path(level, year);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CensusError::Cache(err.to_string())),
        }
    }

    pub fn lookup_or_fetch<G>(
        &self,
        level: GeographyLevel,
        year: u16,
        source: &G,
    ) -> Result<CacheEntry, CensusError>
    where
        G: GeometrySource + ?Sized,
    {
        if let Some(entry) = self.read(level, year)? {
            debug!(%level, year, features = entry.features.len(), "boundary cache hit");
            return Ok(entry);
        }

        let lock = self.key_lock(level, year)?;
        let _guard = lock
            .lock()
            .map_err(|_| CensusError::Cache("cache lock poisoned".to_string()))?;
        // Another caller may have populated the entry while we waited.
        if let Some(entry) = self.read(level, year)? {
            debug!(%level, year, "boundary cache populated by another caller");
            return Ok(entry);
        }

        info!(%level, year, "fetching boundaries");
        let features = source
            .fetch_geometry(level, year)
            .map_err(|err| CensusError::Geometry(format!("{level} {year}: {err}")))?;
        let entry = CacheEntry {
            level,
            year,
            fetched_at: Utc::now().to_rfc3339(),
            features,
        };
        self.write(&entry)?;
        info!(%level, year, features = entry.features.len(), "boundary cache populated");
        Ok(entry)
    }

    fn key_lock(&self, level: GeographyLevel, year: u16) -> Result<Arc<Mutex<()>>, CensusError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| CensusError::Cache("cache lock poisoned".to_string()))?;
        Ok(locks.entry((level, year)).or_default().clone())
    }
}
