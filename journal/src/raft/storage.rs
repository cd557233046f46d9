use crate::raft::log_file::LogFile;
use once_cell::sync::Lazy;
use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};
use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const ENTRIES_PER_FILE: u64 = 16 * 1024;
const HARD_STATE_FILE: &str = "hardstate";
const CONF_STATE_FILE: &str = "confstate";

static LOG_FILE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{20})\.log$").unwrap());

fn other_error<E>(e: E) -> raft::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    raft::Error::Store(raft::StorageError::Other(e.into()))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedHardState {
    term: u64,
    vote: u64,
    commit: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedConfState {
    voters: Vec<u64>,
    learners: Vec<u64>,
}

/// Raft storage that keeps the log in memory and mirrors it to disk.
///
/// Nothing is ever compacted, so the in-memory log always starts at index 1
/// and a joining node can be caught up from entries alone.
pub struct FileStorage {
    mem_storage: MemStorage,
    log_files: BTreeMap<u64, LogFile>,
    base_path: PathBuf,
    last_persisted: u64,
}

impl FileStorage {
    /// Whether `base_path` holds any raft state.
    pub fn exists<P: AsRef<Path>>(base_path: P) -> bool {
        base_path.as_ref().join(CONF_STATE_FILE).exists()
            || base_path.as_ref().join(HARD_STATE_FILE).exists()
    }

    /// Initializes a brand-new group whose only voter is `voter`.
    pub fn bootstrap<P: AsRef<Path>>(base_path: P, voter: u64) -> Result<Self> {
        let mut storage = Self::open(base_path)?;
        let conf_state = ConfState::from((vec![voter], Vec::<u64>::new()));
        storage.set_conf_state(conf_state)?;
        Ok(storage)
    }

    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let mem_storage = MemStorage::new();

        if let Some(cs) = read_state::<PersistedConfState>(&base_path.join(CONF_STATE_FILE))? {
            mem_storage
                .wl()
                .set_conf_state(ConfState::from((cs.voters, cs.learners)));
        }

        // Find all log files, ordered by start index
        let mut starts: Vec<u64> = fs::read_dir(&base_path)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name();
                let caps = LOG_FILE_NAME.captures(name.to_str()?)?;
                caps[1].parse::<u64>().ok()
            })
            .collect();
        starts.sort_unstable();

        let mut log_files = BTreeMap::new();
        let mut entries = Vec::new();
        for start_index in starts {
            let mut log_file = LogFile::open(log_path(&base_path, start_index), start_index)
                .map_err(other_error)?;
            if log_file.is_empty() {
                continue;
            }
            let expected = entries.last().map(|e: &Entry| e.index + 1).unwrap_or(1);
            if start_index != expected {
                return Err(other_error(format!(
                    "log file {} does not continue the log at index {}",
                    log_file.path().display(),
                    expected
                )));
            }

            for index in start_index..=log_file.end_index() {
                let data = log_file.read_entry(index).map_err(other_error)?;
                let mut entry = Entry::default();
                entry.merge_from_bytes(&data).map_err(other_error)?;
                entries.push(entry);
            }
            log_files.insert(start_index, log_file);
        }

        let last_persisted = entries.last().map(|e| e.index).unwrap_or(0);
        if !entries.is_empty() {
            mem_storage.wl().append(&entries)?;
        }

        if let Some(hs) = read_state::<PersistedHardState>(&base_path.join(HARD_STATE_FILE))? {
            let mut hard_state = HardState::default();
            hard_state.term = hs.term;
            hard_state.vote = hs.vote;
            hard_state.commit = hs.commit.min(last_persisted);
            mem_storage.wl().set_hardstate(hard_state);
        }

        Ok(FileStorage {
            mem_storage,
            log_files,
            base_path,
            last_persisted,
        })
    }

    fn file_start(index: u64) -> u64 {
        ((index - 1) / ENTRIES_PER_FILE) * ENTRIES_PER_FILE + 1
    }

    fn get_or_create_log_file(&mut self, start_index: u64) -> Result<&mut LogFile> {
        if !self.log_files.contains_key(&start_index) {
            let path = log_path(&self.base_path, start_index);
            let log_file = LogFile::open(path, start_index).map_err(other_error)?;
            self.log_files.insert(start_index, log_file);
        }
        self.log_files
            .get_mut(&start_index)
            .ok_or_else(|| other_error("log file vanished"))
    }

    /// Drops `index` and everything after it from disk.
    fn truncate_from(&mut self, index: u64) -> Result<()> {
        let doomed: Vec<u64> = self.log_files.range(index..).map(|(s, _)| *s).collect();
        for start in doomed {
            if let Some(log_file) = self.log_files.remove(&start) {
                fs::remove_file(log_file.path())?;
            }
        }
        if let Some((_, log_file)) = self.log_files.range_mut(..index).next_back() {
            log_file.truncate_from(index).map_err(other_error)?;
        }
        self.last_persisted = index - 1;
        Ok(())
    }

    pub fn append_entries(&mut self, entries: &[Entry], sync: bool) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // MemStorage drops its own conflicting suffix
        self.mem_storage.wl().append(entries)?;

        let first = entries[0].index;
        if first <= self.last_persisted {
            self.truncate_from(first)?;
        }

        let mut entries_by_file: BTreeMap<u64, Vec<Vec<u8>>> = BTreeMap::new();
        for entry in entries {
            entries_by_file
                .entry(Self::file_start(entry.index))
                .or_default()
                .push(entry.write_to_bytes().map_err(other_error)?);
        }

        for (start_index, entries) in entries_by_file {
            let log_file = self.get_or_create_log_file(start_index)?;
            log_file.append(&entries).map_err(other_error)?;
            if sync {
                log_file.sync().map_err(other_error)?;
            }
        }

        self.last_persisted = entries[entries.len() - 1].index;
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        let persisted = PersistedConfState {
            voters: conf_state.voters.clone(),
            learners: conf_state.learners.clone(),
        };
        write_state(&self.base_path.join(CONF_STATE_FILE), &persisted)?;
        self.mem_storage.wl().set_conf_state(conf_state);
        Ok(())
    }

    pub fn set_hardstate(&mut self, hs: HardState) -> Result<()> {
        self.persist_hardstate(&hs)?;
        self.mem_storage.wl().set_hardstate(hs);
        Ok(())
    }

    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        let mut hs = self.mem_storage.rl().hard_state().clone();
        hs.commit = commit;
        self.set_hardstate(hs)
    }

    fn persist_hardstate(&self, hs: &HardState) -> Result<()> {
        let persisted = PersistedHardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        };
        write_state(&self.base_path.join(HARD_STATE_FILE), &persisted)
    }

    pub fn commit(&self) -> u64 {
        self.mem_storage.rl().hard_state().commit
    }

    /// Term of the entry at `index`, `None` outside the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 || index > self.last_persisted {
            return None;
        }
        self.mem_storage.term(index).ok()
    }

    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        let conf_state = metadata.get_conf_state().clone();
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        self.set_conf_state(conf_state)?;
        self.truncate_from(1)?;
        self.last_persisted = metadata.index;
        Ok(())
    }
}

fn log_path(base_path: &Path, start_index: u64) -> PathBuf {
    base_path.join(format!("{:020}.log", start_index))
}

fn read_state<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    let state = bincode::deserialize(&data).map_err(other_error)?;
    Ok(Some(state))
}

fn write_state<T: serde::Serialize>(path: &Path, state: &T) -> Result<()> {
    let data = bincode::serialize(state).map_err(other_error)?;
    let temp_path = path.with_extension("tmp");

    // Write to temporary file first
    fs::write(&temp_path, &data)?;
    fs::File::open(&temp_path)?.sync_all()?;

    // Rename temp file to actual state file
    fs::rename(&temp_path, path)?;
    Ok(())
}

impl Storage for FileStorage {
    /// Implements the Storage trait.
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    /// Implements the Storage trait.
    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    /// Implements the Storage trait.
    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    /// Implements the Storage trait.
    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    /// Implements the Storage trait.
    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    /// Implements the Storage trait.
    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        self.mem_storage.snapshot(request_index, to)
    }
}
