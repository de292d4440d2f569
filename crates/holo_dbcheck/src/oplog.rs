//! Replicated operation log.
//!
//! dbCheck only appends. `OpLog::append` is one unit of work: either the
//! entry is committed and its position returned, or nothing was written and
//! the caller may resubmit the identical entry. `FileOpLog` persists entries as
//! length-prefixed, CRC32-checked records and rolls back a failed write;
//! `MemoryOpLog` backs tests and can inject conflicts and failures.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use std::{env, io};

use anyhow::Context;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::DbCheckError;
use crate::types::{CollectionMetadataRecord, CollectionUuid, DocKey, Namespace, OpTime};

/// File name used for the log within the oplog directory.
const OPLOG_FILE: &str = "oplog.log";
/// Command entries carry this op type.
pub const OP_COMMAND: &str = "c";

/// Semantic kind of a dbCheck entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OplogEntryKind {
    CollectionMetadata,
    Batch,
}

impl OplogEntryKind {
    /// Operation name used in health-log records.
    pub fn operation(self) -> &'static str {
        match self {
            OplogEntryKind::CollectionMetadata => "dbCheckCollection",
            OplogEntryKind::Batch => "dbCheckBatch",
        }
    }
}

impl fmt::Display for OplogEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

/// Digest summary of one batch, replayed by secondaries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOplogEntry {
    pub nss: Namespace,
    pub digest: String,
    pub min_key: DocKey,
    pub max_key: DocKey,
}

/// Payload of a dbCheck command entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DbCheckOplogEntry {
    Collection(CollectionMetadataRecord),
    Batch(BatchOplogEntry),
}

impl DbCheckOplogEntry {
    pub fn kind(&self) -> OplogEntryKind {
        match self {
            DbCheckOplogEntry::Collection(_) => OplogEntryKind::CollectionMetadata,
            DbCheckOplogEntry::Batch(_) => OplogEntryKind::Batch,
        }
    }
}

/// Entry waiting for a position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub term: u64,
    pub ns: Namespace,
    pub uuid: Option<CollectionUuid>,
    pub object: DbCheckOplogEntry,
}

/// Committed entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_time: OpTime,
    pub op: String,
    pub ns: Namespace,
    #[serde(default)]
    pub uuid: Option<CollectionUuid>,
    pub object: DbCheckOplogEntry,
}

impl OplogEntry {
    fn commit(pending: &PendingEntry, ts: u64) -> Self {
        Self {
            op_time: OpTime {
                ts,
                term: pending.term,
            },
            op: OP_COMMAND.to_string(),
            ns: pending.ns.clone(),
            uuid: pending.uuid,
            object: pending.object.clone(),
        }
    }
}

/// Append-only, totally ordered log.
pub trait OpLog: Send + Sync + 'static {
    /// Commit `entry` and return its position. `WriteConflict` means nothing
    /// was written.
    fn append(&self, entry: &PendingEntry) -> Result<OpTime, DbCheckError>;
    /// All committed entries in order.
    fn entries(&self) -> Result<Vec<OplogEntry>, DbCheckError>;
}

#[derive(Default)]
struct MemoryOpLogState {
    entries: Vec<OplogEntry>,
    last_ts: u64,
    attempts: u64,
    pending_conflicts: u32,
    pending_failures: u32,
    pending_failure: Option<DbCheckError>,
    fail_with: Option<DbCheckError>,
}

#[derive(Default)]
pub struct MemoryOpLog {
    state: Mutex<MemoryOpLogState>,
}

impl MemoryOpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` appends with a transient write conflict.
    pub fn inject_write_conflicts(&self, n: u32) {
        self.lock().pending_conflicts = n;
    }

    /// Fail the next `n` appends with `err`, then accept writes again.
    pub fn fail_next_appends(&self, n: u32, err: DbCheckError) {
        let mut state = self.lock();
        state.pending_failures = n;
        state.pending_failure = Some(err);
    }

    /// Fail every append with `err` until cleared with `None`.
    pub fn fail_appends_with(&self, err: Option<DbCheckError>) {
        self.lock().fail_with = err;
    }

    /// Append attempts, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryOpLogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OpLog for MemoryOpLog {
    fn append(&self, entry: &PendingEntry) -> Result<OpTime, DbCheckError> {
        let mut state = self.lock();
        state.attempts += 1;
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(DbCheckError::WriteConflict);
        }
        if state.pending_failures > 0 {
            if let Some(err) = state.pending_failure.clone() {
                state.pending_failures -= 1;
                return Err(err);
            }
        }
        if let Some(err) = &state.fail_with {
            return Err(err.clone());
        }
        let ts = state.last_ts + 1;
        let committed = OplogEntry::commit(entry, ts);
        let op_time = committed.op_time;
        state.entries.push(committed);
        state.last_ts = ts;
        Ok(op_time)
    }

    fn entries(&self) -> Result<Vec<OplogEntry>, DbCheckError> {
        Ok(self.lock().entries.clone())
    }
}

/// Sync strategy used when persisting oplog records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    None,
    Data,
    All,
}

struct FileOpLogState {
    file: File,
    last_ts: u64,
    fenced: bool,
}

/// File-backed oplog.
pub struct FileOpLog {
    dir: PathBuf,
    log_path: PathBuf,
    sync_mode: SyncMode,
    state: Mutex<FileOpLogState>,
}

impl FileOpLog {
    /// Open or create an oplog directory, resuming after its last entry.
    ///
    /// The sync mode comes from `HOLO_DBCHECK_OPLOG_PERSIST_MODE`.
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mode = parse_persist_mode(env::var("HOLO_DBCHECK_OPLOG_PERSIST_MODE").ok().as_deref());
        Self::open_dir_with_mode(path, mode)
    }

    pub fn open_dir_with_mode(path: impl AsRef<Path>, sync_mode: SyncMode) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create oplog dir")?;
        let log_path = dir.join(OPLOG_FILE);

        let (existing, valid_len) = scan_log(&log_path).context("replay oplog")?;
        let last_ts = existing.last().map(|entry| entry.op_time.ts).unwrap_or(0);
        let file = open_log_for_append(&log_path).context("open oplog for append")?;
        if file.metadata().context("stat oplog")?.len() > valid_len {
            // Drop a torn tail so new records stay readable.
            file.set_len(valid_len).context("truncate torn oplog tail")?;
        }

        tracing::debug!(
            path = %log_path.display(),
            entries = existing.len(),
            last_ts,
            ?sync_mode,
            "opened oplog"
        );

        Ok(Self {
            dir,
            log_path,
            sync_mode,
            state: Mutex::new(FileOpLogState {
                file,
                last_ts,
                fenced: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl OpLog for FileOpLog {
    fn append(&self, entry: &PendingEntry) -> Result<OpTime, DbCheckError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DbCheckError::Storage("oplog writer poisoned".to_string()))?;
        let ts = state.last_ts + 1;
        let committed = OplogEntry::commit(entry, ts);
        let payload = serde_json::to_vec(&committed)
            .map_err(|err| DbCheckError::Storage(format!("encode oplog entry: {err}")))?;

        append_or_rollback(&mut state, &payload, |file, payload| {
            persist_record(file, payload, self.sync_mode)
        })?;

        state.last_ts = ts;
        Ok(committed.op_time)
    }

    fn entries(&self) -> Result<Vec<OplogEntry>, DbCheckError> {
        read_log_entries(&self.log_path).map_err(|err| DbCheckError::Storage(format!("{err:#}")))
    }
}

/// Run `persist` and, if it fails, cut the file back to its previous length
/// so a partial or unsynced record never precedes the next append.
///
/// If the rollback itself fails the writer is fenced: the tail is unknown and
/// every later append is refused until the log is reopened.
fn append_or_rollback<F>(
    state: &mut FileOpLogState,
    payload: &[u8],
    persist: F,
) -> Result<(), DbCheckError>
where
    F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
{
    if state.fenced {
        return Err(DbCheckError::Storage(
            "oplog tail is unknown after a failed rollback; reopen the log".to_string(),
        ));
    }
    let committed_len = state
        .file
        .metadata()
        .map_err(|err| DbCheckError::Storage(format!("stat oplog: {err}")))?
        .len();

    let Err(err) = persist(&mut state.file, payload) else {
        return Ok(());
    };
    if let Err(rollback) = state.file.set_len(committed_len) {
        state.fenced = true;
        tracing::error!(error = ?rollback, len = committed_len, "oplog rollback failed");
        return Err(DbCheckError::Storage(format!(
            "append oplog entry: {err}; rollback failed: {rollback}"
        )));
    }
    tracing::warn!(error = ?err, len = committed_len, "oplog append rolled back");
    Err(DbCheckError::Storage(format!("append oplog entry: {err}")))
}

/// Write, flush and sync one record.
fn persist_record(file: &mut File, payload: &[u8], mode: SyncMode) -> io::Result<()> {
    write_record(file, payload)?;
    file.flush()?;
    sync_file(file, mode)
}

/// Write a single length-prefixed record with CRC32 checksum.
fn write_record(file: &mut File, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    let mut record = Vec::with_capacity(8 + payload.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&checksum.to_be_bytes());
    record.extend_from_slice(payload);
    file.write_all(&record)
}

/// Read and decode every complete record. A torn final record is ignored.
fn read_log_entries(path: &Path) -> anyhow::Result<Vec<OplogEntry>> {
    scan_log(path).map(|(entries, _)| entries)
}

/// Decode complete records and return them with the byte length they span.
fn scan_log(path: &Path) -> anyhow::Result<(Vec<OplogEntry>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        // Missing log means nothing was ever appended.
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err.into()),
    };
    let mut reader = io::BufReader::new(file);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(path = %path.display(), "ignoring torn oplog tail record");
                break;
            }
            Err(err) => return Err(err.into()),
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "oplog checksum mismatch");
        let entry: OplogEntry =
            serde_json::from_slice(&payload).context("decode oplog entry")?;
        entries.push(entry);
        valid_len += 8 + len as u64;
    }
    Ok((entries, valid_len))
}

/// Open the log file for appending.
fn open_log_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Perform the configured fsync mode on the log file.
fn sync_file(file: &File, mode: SyncMode) -> io::Result<()> {
    let start = Instant::now();
    let res = match mode {
        SyncMode::None => return Ok(()),
        SyncMode::Data => file.sync_data(),
        SyncMode::All => file.sync_all(),
    };
    tracing::trace!(elapsed_us = start.elapsed().as_micros() as u64, ?mode, "oplog fsync");
    res
}

/// Parse the requested persistence mode.
pub fn parse_persist_mode(value: Option<&str>) -> SyncMode {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        // "none" and "buffer" both rely on OS buffering.
        Some("none") | Some("buffer") => SyncMode::None,
        Some("sync_data") => SyncMode::Data,
        // Unknown or unset defaults to the safest mode.
        _ => SyncMode::All,
    }
}
