use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{CompoundRecord, InchiKey, ProcessedArchiveRecord};
use crate::error::MolidError;

const MASTER_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS compounds (
    inchikey          TEXT PRIMARY KEY,
    inchikey14        TEXT NOT NULL,
    cid               INTEGER,
    title             TEXT,
    iupac_name        TEXT,
    formula           TEXT,
    smiles            TEXT,
    inchi             TEXT,
    exact_mass        TEXT,
    molecular_weight  TEXT,
    monoisotopic_mass TEXT
);
CREATE INDEX IF NOT EXISTS idx_compounds_inchikey14 ON compounds(inchikey14);
CREATE INDEX IF NOT EXISTS idx_compounds_cid ON compounds(cid);

CREATE TABLE IF NOT EXISTS processed_archives (
    archive_name TEXT PRIMARY KEY,
    ingested_at  TEXT NOT NULL,
    row_count    INTEGER NOT NULL
);
";

const SELECT_COMPOUND: &str = "SELECT inchikey, cid, title, iupac_name, formula, smiles, inchi, \
     exact_mass, molecular_weight, monoisotopic_mass FROM compounds";

/// Columns usable in filtered lookups. Only `Inchikey` and `Inchikey14` are indexed
/// for prefix work; the rest scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompoundColumn {
    Cid,
    Title,
    IupacName,
    Formula,
    Smiles,
    Inchi,
    Inchikey,
    Inchikey14,
}

impl CompoundColumn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompoundColumn::Cid => "cid",
            CompoundColumn::Title => "title",
            CompoundColumn::IupacName => "iupac_name",
            CompoundColumn::Formula => "formula",
            CompoundColumn::Smiles => "smiles",
            CompoundColumn::Inchi => "inchi",
            CompoundColumn::Inchikey => "inchikey",
            CompoundColumn::Inchikey14 => "inchikey14",
        }
    }
}

impl FromStr for CompoundColumn {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cid" => Ok(CompoundColumn::Cid),
            "title" | "name" => Ok(CompoundColumn::Title),
            "iupac_name" | "iupacname" => Ok(CompoundColumn::IupacName),
            "formula" | "molecularformula" => Ok(CompoundColumn::Formula),
            "smiles" => Ok(CompoundColumn::Smiles),
            "inchi" => Ok(CompoundColumn::Inchi),
            "inchikey" => Ok(CompoundColumn::Inchikey),
            "inchikey14" => Ok(CompoundColumn::Inchikey14),
            _ => Err(MolidError::InvalidQuery(format!("unknown column: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub path: String,
    pub compounds: u64,
    pub processed_archives: u64,
}

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// The master compound store. All writes to it go through this type.
#[derive(Debug)]
pub struct MasterStore {
    conn: Connection,
    path: PathBuf,
}

impl MasterStore {
    /// Opens the store, creating the file and schema when absent.
    pub fn create(path: &Path) -> Result<Self, MolidError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| MolidError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path)
            .map_err(|err| MolidError::Store(format!("open {}: {err}", path.display())))?;
        Self::initialize(conn, path.to_path_buf())
    }

    /// Opens an existing store; a missing file is a configuration error.
    pub fn open(path: &Path, required_by: &str) -> Result<Self, MolidError> {
        if !path.is_file() {
            return Err(MolidError::MissingStore {
                path: path.to_path_buf(),
                required_by: required_by.to_string(),
            });
        }
        let conn = Connection::open(path)
            .map_err(|err| MolidError::Store(format!("open {}: {err}", path.display())))?;
        Self::initialize(conn, path.to_path_buf())
    }

    pub fn in_memory() -> Result<Self, MolidError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, PathBuf::from(":memory:"))
    }

    fn initialize(conn: Connection, path: PathBuf) -> Result<Self, MolidError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        conn.execute_batch(MASTER_SCHEMA)?;
        debug!(path = %path.display(), "master store ready");
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How long a write waits on another connection's lock before failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), MolidError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Inserts records in one transaction. Existing InChIKeys are left untouched;
    /// the return value counts only newly stored rows.
    pub fn insert_batch(&mut self, records: &[CompoundRecord]) -> Result<usize, MolidError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| MolidError::StoreWrite(err.to_string()))?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO compounds (inchikey, inchikey14, cid, title, \
                     iupac_name, formula, smiles, inchi, exact_mass, molecular_weight, \
                     monoisotopic_mass) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(|err| MolidError::StoreWrite(err.to_string()))?;
            for record in records {
                inserted += stmt
                    .execute(params![
                        record.inchikey.as_str(),
                        record.inchikey14(),
                        record.cid,
                        record.title,
                        record.iupac_name,
                        record.formula,
                        record.smiles,
                        record.inchi,
                        record.exact_mass,
                        record.molecular_weight,
                        record.monoisotopic_mass,
                    ])
                    .map_err(|err| {
                        MolidError::StoreWrite(format!("insert {}: {err}", record.inchikey))
                    })?;
            }
        }
        tx.commit()
            .map_err(|err| MolidError::StoreWrite(err.to_string()))?;
        debug!(batch = records.len(), inserted, "batch committed");
        Ok(inserted)
    }

    /// Records a fully ingested archive. Call only after all its batches committed.
    pub fn mark_archive_processed(
        &mut self,
        record: &ProcessedArchiveRecord,
    ) -> Result<(), MolidError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO processed_archives (archive_name, ingested_at, row_count) \
                 VALUES (?1, ?2, ?3)",
                params![record.archive_name, record.ingested_at, record.row_count as i64],
            )
            .map_err(|err| MolidError::StoreWrite(err.to_string()))?;
        info!(archive = %record.archive_name, rows = record.row_count, "archive marked processed");
        Ok(())
    }

    pub fn is_archive_processed(&self, archive_name: &str) -> Result<bool, MolidError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_archives WHERE archive_name = ?1",
                params![archive_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn processed_archives(&self) -> Result<Vec<ProcessedArchiveRecord>, MolidError> {
        let mut stmt = self.conn.prepare(
            "SELECT archive_name, ingested_at, row_count FROM processed_archives \
             ORDER BY archive_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProcessedArchiveRecord {
                archive_name: row.get(0)?,
                ingested_at: row.get(1)?,
                row_count: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Forgets processed markers so the archives are ingested again on the next run.
    pub fn reset_processed(&mut self, archive_name: Option<&str>) -> Result<usize, MolidError> {
        let removed = match archive_name {
            Some(name) => self.conn.execute(
                "DELETE FROM processed_archives WHERE archive_name = ?1",
                params![name],
            ),
            None => self.conn.execute("DELETE FROM processed_archives", []),
        }
        .map_err(|err| MolidError::StoreWrite(err.to_string()))?;
        info!(removed, "processed markers reset");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats, MolidError> {
        let compounds: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM compounds", [], |row| row.get(0))?;
        let processed_archives: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM processed_archives", [], |row| row.get(0))?;
        Ok(StoreStats {
            path: self.path.display().to_string(),
            compounds: compounds.max(0) as u64,
            processed_archives: processed_archives.max(0) as u64,
        })
    }

    pub fn lookup_full(&self, inchikey: &InchiKey) -> Result<Option<CompoundRecord>, MolidError> {
        let sql = format!("{SELECT_COMPOUND} WHERE inchikey = ?1");
        self.conn
            .query_row(&sql, params![inchikey.as_str()], row_to_record)
            .optional()
            .map_err(Into::into)
    }

    /// All compounds sharing the 14-character connectivity block.
    pub fn lookup_prefix(&self, inchikey14: &str) -> Result<Vec<CompoundRecord>, MolidError> {
        let sql = format!("{SELECT_COMPOUND} WHERE inchikey14 = ?1 ORDER BY cid, inchikey");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![inchikey14], row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Conjunction of equality predicates.
    pub fn lookup_filtered(
        &self,
        predicates: &[(CompoundColumn, String)],
    ) -> Result<Vec<CompoundRecord>, MolidError> {
        if predicates.is_empty() {
            return Err(MolidError::InvalidQuery(
                "filtered lookup needs at least one predicate".to_string(),
            ));
        }
        let clause = predicates
            .iter()
            .enumerate()
            .map(|(idx, (column, _))| format!("{} = ?{}", column.as_sql(), idx + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("{SELECT_COMPOUND} WHERE {clause} ORDER BY cid, inchikey");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(predicates.iter().map(|(_, value)| value.as_str())),
            row_to_record,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CompoundRecord> {
    let inchikey = row
        .get::<_, String>(0)?
        .parse::<InchiKey>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))?;
    Ok(CompoundRecord {
        inchikey,
        cid: row.get(1)?,
        title: row.get(2)?,
        iupac_name: row.get(3)?,
        formula: row.get(4)?,
        smiles: row.get(5)?,
        inchi: row.get(6)?,
        exact_mass: row.get(7)?,
        molecular_weight: row.get(8)?,
        monoisotopic_mass: row.get(9)?,
    })
}

/// Exclusive advisory lock next to the store file; held for a whole ingestion run.
#[derive(Debug)]
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    pub fn acquire(store_path: &Path) -> Result<Self, MolidError> {
        let path = lock_path(store_path);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| MolidError::Filesystem(err.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| MolidError::Filesystem(format!("{}: {err}", path.display())))?;
        match file.try_lock() {
            Ok(()) => {
                debug!(lock = %path.display(), "writer lock acquired");
                Ok(Self { file, path })
            }
            Err(TryLockError::WouldBlock) => Err(MolidError::StoreLocked(store_path.to_path_buf())),
            Err(TryLockError::Error(err)) => Err(MolidError::Filesystem(err.to_string())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    store_path.with_file_name(name)
}
