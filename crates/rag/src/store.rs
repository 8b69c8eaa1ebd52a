use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use minirag_core::{Fingerprint, IndexBlob};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.bin";
const PREVIEW_CHARS: usize = 100;

/// Durable fingerprint -> (chunks, index) mapping.
///
/// `load` never fails: a missing row, a missing artifact and an unreadable
/// artifact all come back as `None` so the caller rebuilds. `save` keeps the
/// first usable record written for a fingerprint; `replace` overwrites one
/// the caller has judged stale.
pub trait DocumentStore: Send + Sync {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool>;

    fn load<I: IndexBlob>(&self, fingerprint: &Fingerprint) -> Option<(Vec<String>, I)>;

    fn save<I: IndexBlob>(
        &self,
        fingerprint: &Fingerprint,
        chunks: &[String],
        index: &I,
    ) -> Result<SaveOutcome>;

    fn replace<I: IndexBlob>(
        &self,
        fingerprint: &Fingerprint,
        chunks: &[String],
        index: &I,
    ) -> Result<SaveOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    AlreadyPresent,
    /// The row existed but its index artifact was missing or unreadable;
    /// the artifact was rewritten and the row now matches it.
    RepairedIndex,
    /// A stale record was overwritten through `replace`.
    Replaced,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub fingerprint: String,
    pub created_at: String,
    pub chunk_count: usize,
    pub preview: String,
    pub has_index: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub documents: Vec<DocumentSummary>,
    pub index_artifacts: Vec<String>,
}

/// Chunk metadata in sqlite, index blobs under `<index_dir>/<fingerprint>/`.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db_path: PathBuf,
    index_dir: PathBuf,
}

impl SqliteDocumentStore {
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(db_path: P, index_dir: Q) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
            index_dir: index_dir.as_ref().to_path_buf(),
        };
        fs::create_dir_all(&store.index_dir).with_context(|| {
            format!("failed to create index dir {}", store.index_dir.display())
        })?;
        store.init()?;
        Ok(store)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open {}", self.db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS documents (
                fingerprint TEXT PRIMARY KEY,
                chunks TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at);
            "#,
        )?;
        Ok(())
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.index_dir.join(fingerprint.to_hex()).join(INDEX_FILE)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn inspect(&self) -> Result<StoreSummary> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT fingerprint, created_at, chunk_count, chunks FROM documents ORDER BY created_at, fingerprint",
        )?;
        let mut rows = stmt.query([])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let fingerprint: String = row.get(0)?;
            let chunks_json: String = row.get(3)?;
            let chunks: Vec<String> = serde_json::from_str(&chunks_json).unwrap_or_default();
            let preview = chunks
                .first()
                .map(|chunk| chunk.chars().take(PREVIEW_CHARS).collect())
                .unwrap_or_default();
            let has_index = self.index_dir.join(&fingerprint).join(INDEX_FILE).exists();
            documents.push(DocumentSummary {
                created_at: row.get(1)?,
                chunk_count: row.get::<_, i64>(2)? as usize,
                fingerprint,
                preview,
                has_index,
            });
        }
        let mut index_artifacts = Vec::new();
        for entry in fs::read_dir(&self.index_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                index_artifacts.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        index_artifacts.sort();
        Ok(StoreSummary {
            documents,
            index_artifacts,
        })
    }

    fn try_load<I: IndexBlob>(&self, fingerprint: &Fingerprint) -> Result<Option<(Vec<String>, I)>> {
        let conn = self.connection()?;
        let row: Option<String> = conn
            .query_row(
                "SELECT chunks FROM documents WHERE fingerprint = ?1",
                [fingerprint.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(chunks_json) = row else {
            return Ok(None);
        };
        let path = self.artifact_path(fingerprint);
        if !path.exists() {
            warn!(%fingerprint, path = %path.display(), "index artifact missing; treating as cache miss");
            return Ok(None);
        }
        let chunks: Vec<String> =
            serde_json::from_str(&chunks_json).context("stored chunks are not a json array")?;
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let index = I::from_blob(&bytes)?;
        Ok(Some((chunks, index)))
    }

    /// Writes the artifact through a temp file in the target directory.
    /// Without `overwrite` an existing artifact is kept and `false` is
    /// returned, so the first of two racing writers owns the file.
    fn write_artifact(&self, fingerprint: &Fingerprint, blob: &[u8], overwrite: bool) -> Result<bool> {
        let path = self.artifact_path(fingerprint);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.index_dir.clone());
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(blob)?;
        tmp.as_file().sync_all()?;
        if overwrite {
            tmp.persist(&path)
                .with_context(|| format!("failed to persist {}", path.display()))?;
            return Ok(true);
        }
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.error)
                .with_context(|| format!("failed to persist {}", path.display())),
        }
    }

    fn artifact_decodes<I: IndexBlob>(&self, fingerprint: &Fingerprint) -> bool {
        fs::read(self.artifact_path(fingerprint))
            .map(|bytes| I::from_blob(&bytes).is_ok())
            .unwrap_or(false)
    }

    fn remove_artifact(&self, fingerprint: &Fingerprint) -> Result<()> {
        let path = self.artifact_path(fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// The writer that lands the artifact owns the row; everyone else only
    /// inserts when no row exists yet. Row and artifact therefore always come
    /// from the same build once both writers are done.
    fn write_record(
        &self,
        fingerprint: &Fingerprint,
        chunks: &[String],
        blob: &[u8],
        overwrite: bool,
    ) -> Result<RecordWrite> {
        let owns_artifact = self.write_artifact(fingerprint, blob, overwrite)?;
        let conn = self.connection()?;
        let sql = if owns_artifact {
            "INSERT INTO documents (fingerprint, chunks, chunk_count, created_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(fingerprint) DO UPDATE SET chunks = excluded.chunks, chunk_count = excluded.chunk_count"
        } else {
            "INSERT OR IGNORE INTO documents (fingerprint, chunks, chunk_count, created_at) VALUES (?1, ?2, ?3, ?4)"
        };
        conn.execute(
            sql,
            params![
                fingerprint.to_hex(),
                serde_json::to_string(chunks)?,
                chunks.len() as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(RecordWrite { owns_artifact })
    }
}

struct RecordWrite {
    owns_artifact: bool,
}

impl DocumentStore for SqliteDocumentStore {
    fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let conn = self.connection()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM documents WHERE fingerprint = ?1",
                [fingerprint.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load<I: IndexBlob>(&self, fingerprint: &Fingerprint) -> Option<(Vec<String>, I)> {
        match self.try_load(fingerprint) {
            Ok(found) => found,
            Err(err) => {
                warn!(%fingerprint, error = %format!("{err:#}"), "cached document unreadable; treating as cache miss");
                None
            }
        }
    }

    fn save<I: IndexBlob>(
        &self,
        fingerprint: &Fingerprint,
        chunks: &[String],
        index: &I,
    ) -> Result<SaveOutcome> {
        let had_row = self.exists(fingerprint)?;
        let had_artifact = self.artifact_path(fingerprint).exists();
        if had_artifact {
            if self.artifact_decodes::<I>(fingerprint) {
                if had_row {
                    debug!(%fingerprint, "document already cached; skipping save");
                    return Ok(SaveOutcome::AlreadyPresent);
                }
            } else {
                warn!(%fingerprint, "discarding unreadable index artifact");
                self.remove_artifact(fingerprint)?;
            }
        }
        let write = self.write_record(fingerprint, chunks, &index.to_blob()?, false)?;
        match (write.owns_artifact, had_row) {
            (true, true) => {
                info!(%fingerprint, "restored index artifact");
                Ok(SaveOutcome::RepairedIndex)
            }
            (true, false) => {
                info!(%fingerprint, chunks = chunks.len(), "cached new document");
                Ok(SaveOutcome::Inserted)
            }
            (false, _) => {
                debug!(%fingerprint, "concurrent save won the race");
                Ok(SaveOutcome::AlreadyPresent)
            }
        }
    }

    fn replace<I: IndexBlob>(
        &self,
        fingerprint: &Fingerprint,
        chunks: &[String],
        index: &I,
    ) -> Result<SaveOutcome> {
        self.write_record(fingerprint, chunks, &index.to_blob()?, true)?;
        info!(%fingerprint, chunks = chunks.len(), "replaced stale document");
        Ok(SaveOutcome::Replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minirag_core::FlatIndex;

    fn open(dir: &Path) -> SqliteDocumentStore {
        SqliteDocumentStore::open(dir.join("docs.sqlite"), dir.join("indices")).unwrap()
    }

    fn sample_index() -> FlatIndex {
        FlatIndex::from_parts(
            vec!["alpha".into(), "beta".into()],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        )
        .unwrap()
    }

    #[test]
    fn save_then_load_returns_chunks_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let fp = Fingerprint::of_bytes(b"doc");
        assert!(!store.exists(&fp).unwrap());
        assert!(store.load::<FlatIndex>(&fp).is_none());

        let chunks = vec!["alpha".to_string(), "beta".to_string()];
        let outcome = store.save(&fp, &chunks, &sample_index()).unwrap();
        assert_eq!(outcome, SaveOutcome::Inserted);
        assert!(store.exists(&fp).unwrap());

        let (loaded_chunks, index) = store.load::<FlatIndex>(&fp).unwrap();
        assert_eq!(loaded_chunks, chunks);
        assert_eq!(index, sample_index());
    }

    #[test]
    fn second_save_is_skipped_and_first_record_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let fp = Fingerprint::of_bytes(b"doc");
        store
            .save(&fp, &["first".to_string()], &sample_index())
            .unwrap();
        let outcome = store
            .save(&fp, &["second".to_string()], &sample_index())
            .unwrap();
        assert_eq!(outcome, SaveOutcome::AlreadyPresent);
        assert_eq!(store.len().unwrap(), 1);
        let (chunks, _) = store.load::<FlatIndex>(&fp).unwrap();
        assert_eq!(chunks, vec!["first".to_string()]);
    }

    #[test]
    fn missing_artifact_is_a_miss_and_save_repairs_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let fp = Fingerprint::of_bytes(b"doc");
        let chunks = vec!["alpha".to_string(), "beta".to_string()];
        store.save(&fp, &chunks, &sample_index()).unwrap();
        fs::remove_file(store.artifact_path(&fp)).unwrap();

        assert!(store.exists(&fp).unwrap());
        assert!(store.load::<FlatIndex>(&fp).is_none());

        let outcome = store.save(&fp, &chunks, &sample_index()).unwrap();
        assert_eq!(outcome, SaveOutcome::RepairedIndex);
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.load::<FlatIndex>(&fp).is_some());
    }

    #[test]
    fn corrupt_artifact_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let fp = Fingerprint::of_bytes(b"doc");
        store
            .save(&fp, &["alpha".to_string()], &sample_index())
            .unwrap();
        fs::write(store.artifact_path(&fp), b"garbage").unwrap();
        assert!(store.load::<FlatIndex>(&fp).is_none());
    }

    #[test]
    fn save_over_corrupt_artifact_rewrites_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let fp = Fingerprint::of_bytes(b"doc");
        let chunks = vec!["alpha".to_string(), "beta".to_string()];
        store.save(&fp, &chunks, &sample_index()).unwrap();
        fs::write(store.artifact_path(&fp), b"garbage").unwrap();

        let outcome = store.save(&fp, &chunks, &sample_index()).unwrap();
        assert_eq!(outcome, SaveOutcome::RepairedIndex);
        let (loaded_chunks, index) = store.load::<FlatIndex>(&fp).unwrap();
        assert_eq!(loaded_chunks, chunks);
        assert_eq!(index, sample_index());
    }

    #[test]
    fn artifact_written_by_another_saver_is_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let fp = Fingerprint::of_bytes(b"doc");
        let winner = FlatIndex::from_parts(vec!["winner".into()], vec![vec![1.0, 1.0]]).unwrap();
        // Another saver has landed its artifact but not yet its row.
        store.write_artifact(&fp, &winner.to_blob().unwrap(), false).unwrap();

        let outcome = store
            .save(&fp, &["loser".to_string()], &sample_index())
            .unwrap();
        assert_eq!(outcome, SaveOutcome::AlreadyPresent);
        let (_, index) = store.load::<FlatIndex>(&fp).unwrap();
        assert_eq!(index, winner);

        // The winner's row write takes precedence over the loser's insert.
        store
            .write_record(&fp, &["winner".to_string()], &winner.to_blob().unwrap(), false)
            .unwrap();
        let (chunks, index) = store.load::<FlatIndex>(&fp).unwrap();
        assert_eq!(index, winner);
        assert_eq!(chunks, vec!["winner".to_string()]);
    }

    #[test]
    fn replace_overwrites_chunks_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let fp = Fingerprint::of_bytes(b"doc");
        store
            .save(&fp, &["alpha".to_string(), "beta".to_string()], &sample_index())
            .unwrap();

        let wider = FlatIndex::from_parts(vec!["gamma".into()], vec![vec![0.0, 0.0, 1.0]]).unwrap();
        let outcome = store.replace(&fp, &["gamma".to_string()], &wider).unwrap();
        assert_eq!(outcome, SaveOutcome::Replaced);
        assert_eq!(store.len().unwrap(), 1);
        let (chunks, index) = store.load::<FlatIndex>(&fp).unwrap();
        assert_eq!(chunks, vec!["gamma".to_string()]);
        assert_eq!(index.dimensions(), 3);
        assert_eq!(store.inspect().unwrap().documents[0].chunk_count, 1);
    }

    #[test]
    fn inspect_lists_documents_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let long_chunk = "x".repeat(250);
        let fp = Fingerprint::of_bytes(b"doc");
        store
            .save(&fp, &[long_chunk, "tail".to_string()], &sample_index())
            .unwrap();

        let summary = store.inspect().unwrap();
        assert_eq!(summary.documents.len(), 1);
        let doc = &summary.documents[0];
        assert_eq!(doc.fingerprint, fp.to_hex());
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(doc.preview.chars().count(), PREVIEW_CHARS);
        assert!(doc.has_index);
        assert_eq!(summary.index_artifacts, vec![fp.to_hex()]);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fp = Fingerprint::of_bytes(b"doc");
        open(dir.path())
            .save(&fp, &["alpha".to_string()], &sample_index())
            .unwrap();
        let reopened = open(dir.path());
        assert!(reopened.load::<FlatIndex>(&fp).is_some());
    }
}
