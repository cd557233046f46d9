use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 16; // start_index, version
const ENTRY_HEADER_SIZE: u64 = 8; // payload length
const FORMAT_VERSION: u64 = 1;

/// One file of the raft log holding a contiguous run of entries.
#[derive(Debug)]
pub struct LogFile {
    file: File,
    start_index: u64,
    // index of the last entry, start_index - 1 when empty
    end_index: u64,
    path: PathBuf,
    entry_positions: BTreeMap<u64, u64>, // index -> file position
}

#[derive(Debug, Serialize, Deserialize)]
struct LogFileHeader {
    start_index: u64,
    version: u64,
}

impl LogFile {
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut log_file = LogFile {
            file,
            start_index,
            end_index: start_index - 1,
            path: path.as_ref().to_path_buf(),
            entry_positions: BTreeMap::new(),
        };

        if log_file.file.metadata()?.len() < HEADER_SIZE {
            log_file.file.set_len(0)?;
            log_file.write_header()?;
        } else {
            log_file.read_header()?;
            log_file.rebuild_entry_positions()?;
        }

        Ok(log_file)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = LogFileHeader {
            start_index: self.start_index,
            version: FORMAT_VERSION,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: LogFileHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if header.start_index != self.start_index || header.version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} has header {:?}, expected start index {}",
                    self.path.display(),
                    header,
                    self.start_index
                ),
            ));
        }
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    /// Drops a torn tail left by a crash in the middle of an append.
    fn rebuild_entry_positions(&mut self) -> io::Result<()> {
        self.entry_positions.clear();
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + ENTRY_HEADER_SIZE <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            // a garbage length that overflows is torn as well
            let end = match (pos + ENTRY_HEADER_SIZE).checked_add(entry_size) {
                Some(end) if end <= len => end,
                _ => break,
            };
            let entry_index = self.start_index + (self.entry_positions.len() as u64);
            self.entry_positions.insert(entry_index, pos);
            pos = end;
        }

        if pos < len {
            log::warn!(
                "{}: dropping {} bytes of torn tail",
                self.path.display(),
                len - pos
            );
            self.file.set_len(pos)?;
        }
        self.end_index = self.start_index + self.entry_positions.len() as u64 - 1;
        Ok(())
    }

    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;

        let mut buf = Vec::new();
        for entry in entries {
            let entry_size = entry.len() as u64;
            buf.extend_from_slice(&entry_size.to_le_bytes());
            buf.extend_from_slice(entry);

            let entry_index = self.end_index + 1;
            self.entry_positions.insert(entry_index, pos);
            self.end_index = entry_index;
            pos += ENTRY_HEADER_SIZE + entry_size;
        }
        self.file.write_all(&buf)?;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.start_index || index > self.end_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let pos = *self.entry_positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Entry position not found")
        })?;

        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Removes `index` and every entry after it.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if index > self.end_index {
            return Ok(());
        }
        let pos = if index <= self.start_index {
            HEADER_SIZE
        } else {
            *self.entry_positions.get(&index).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "Entry position not found")
            })?
        };

        self.file.set_len(pos)?;
        let _ = self.entry_positions.split_off(&index.max(self.start_index));
        self.end_index = index.max(self.start_index) - 1;
        Ok(())
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn end_index(&self) -> u64 {
        self.end_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
