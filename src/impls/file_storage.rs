use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::raft_storage::VecLog;
use crate::{LogEntry, NodeId, Storage};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.jsonl";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Meta {
    current_term: u64,
    voted_for: Option<NodeId>,
}

/// Storage in a directory:
/// - `meta.json`: term and vote, replaced atomically on every change
/// - `log.jsonl`: one JSON entry per line, appended and synced
///
/// The whole log is also kept in memory for reads.
#[derive(Debug)]
pub struct FileStorage<C> {
    dir: PathBuf,
    meta: Meta,
    log: VecLog<C>,
    _command: PhantomData<fn() -> C>,
}

impl<C> FileStorage<C>
where
    C: Serialize + DeserializeOwned,
{
    /// Open the storage at `dir`, creating it if needed and loading whatever
    /// a previous incarnation persisted.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let meta = load_meta(&dir.join(META_FILE))?;
        let (entries, unterminated) = load_log(&dir.join(LOG_FILE))?;
        let log = VecLog::from_entries(entries)?;

        let storage = FileStorage {
            dir,
            meta,
            log,
            _command: PhantomData,
        };
        if unterminated {
            // later appends must start on a fresh line
            storage.rewrite_log(storage.log.entries())?;
        }
        log::debug!(
            "Opened storage at {}: term {}, {} entries",
            storage.dir.display(),
            storage.meta.current_term,
            storage.log.entries().len()
        );
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_meta(&self, meta: &Meta) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.dir, META_FILE, &json)
    }

    fn rewrite_log(&self, entries: &[LogEntry<C>]) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        write_atomic(&self.dir, LOG_FILE, &buf)
    }
}

impl<C> Storage for FileStorage<C>
where
    C: Serialize + DeserializeOwned + Send + 'static,
{
    type Command = C;

    fn current_term(&self) -> u64 {
        self.meta.current_term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.meta.voted_for
    }

    fn persist_term(&mut self, term: u64) -> Result<(), StorageError> {
        let meta = Meta {
            current_term: term,
            voted_for: None,
        };
        self.write_meta(&meta)?;
        self.meta = meta;
        Ok(())
    }

    fn persist_vote(&mut self, term: u64, candidate_id: NodeId) -> Result<(), StorageError> {
        let meta = Meta {
            current_term: term,
            voted_for: Some(candidate_id),
        };
        self.write_meta(&meta)?;
        self.meta = meta;
        Ok(())
    }

    fn append_log(&mut self, entries: Vec<LogEntry<C>>) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.log.check_append(&entries)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        let mut writer = BufWriter::new(file);
        for entry in entries.iter() {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;

        self.log.extend(entries);
        Ok(())
    }

    fn truncate_log_from(&mut self, index: u64) -> Result<(), StorageError> {
        if index > self.log.last_index_term().0 {
            return Ok(());
        }
        self.rewrite_log(self.log.slice(1, index))?;
        self.log.truncate_from(index);
        Ok(())
    }

    fn entry(&self, index: u64) -> Option<&LogEntry<C>> {
        self.log.at(index)
    }

    fn read_log(&self, from_index: u64, to_index: u64) -> &[LogEntry<C>] {
        self.log.slice(from_index, to_index)
    }

    fn last_log_index_term(&self) -> (u64, u64) {
        self.log.last_index_term()
    }
}

// write to a temp file, sync, then rename over `name`
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = dir.join(format!("{}.tmp", name));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}

fn load_meta(path: &Path) -> Result<Meta, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Meta::default()),
        Err(e) => Err(e.into()),
    }
}

/// Returns the entries and whether the file must be rewritten because its
/// last line was unterminated.
fn load_log<C: DeserializeOwned>(path: &Path) -> Result<(Vec<LogEntry<C>>, bool), StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(e.into()),
    };

    // every complete line ends in a newline, so the piece after the last
    // one is empty unless a crash cut an append short
    let mut lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    let tail = lines.pop().unwrap_or_default();
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        entries.push(serde_json::from_slice(line)?);
    }
    if tail.is_empty() {
        return Ok((entries, false));
    }

    match serde_json::from_slice(tail) {
        Ok(entry) => {
            log::warn!("Unterminated last entry in {}", path.display());
            entries.push(entry);
        }
        Err(e) => log::warn!("Dropping torn entry at end of {}: {}", path.display(), e),
    }
    Ok((entries, true))
}
