//! Close-safe segment handles
//!
//! Every operation registers itself in an in-flight counter before touching
//! the segment and checks the closing flag after registering. `close()` sets
//! the flag and then waits for the counter to drain, so an operation either
//! completes against a live segment or fails with `Closed`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;
use tokio::sync::Notify;

use crate::command::JournalCommand;
use crate::directory::Record;
use crate::error::{JournalError, Result};
use crate::node::NodeCore;

/// How much of the journal a read may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Only committed and applied state.
    #[default]
    Committed,
    /// Committed state overlaid with this node's own writes still in flight.
    Uncommitted,
}

// seq of the latest write per key, value None for a delete
type Overlay = FxHashMap<Vec<u8>, (u64, Option<Vec<u8>>)>;

struct SegmentInner {
    name: String,
    index: u64,
    core: Arc<NodeCore>,
    in_flight: AtomicUsize,
    closing: AtomicBool,
    drained: Notify,
    pending: Mutex<Overlay>,
    next_seq: AtomicU64,
}

struct OpGuard<'a> {
    inner: &'a SegmentInner,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.inner.closing.load(Ordering::SeqCst) {
            self.inner.drained.notify_waiters();
        }
    }
}

/// Shared handle to one segment. Clones share one reference counter.
#[derive(Clone)]
pub struct CloseSafeSegment {
    inner: Arc<SegmentInner>,
}

impl CloseSafeSegment {
    pub(crate) fn new(name: &str, index: u64, core: Arc<NodeCore>) -> Self {
        CloseSafeSegment {
            inner: Arc::new(SegmentInner {
                name: name.to_string(),
                index,
                core,
                in_flight: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
                drained: Notify::new(),
                pending: Mutex::new(FxHashMap::default()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn index(&self) -> u64 {
        self.inner.index
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<OpGuard<'_>> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = OpGuard { inner: &self.inner };
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(JournalError::closed(format!("segment {}", self.inner.name)));
        }
        if !self.inner.core.directory().contains_index(self.inner.index) {
            return Err(JournalError::SegmentNotFound(self.inner.name.clone()));
        }
        Ok(guard)
    }

    fn not_found(&self) -> JournalError {
        JournalError::SegmentNotFound(self.inner.name.clone())
    }

    pub fn get(&self, key: &[u8], mode: ReadMode) -> Result<Option<Vec<u8>>> {
        let _guard = self.enter()?;
        if mode == ReadMode::Uncommitted {
            if let Some((_, value)) = self.inner.pending.lock().unwrap().get(key) {
                return Ok(value.clone());
            }
        }
        self.inner
            .core
            .directory()
            .get(self.inner.index, key)
            .ok_or_else(|| self.not_found())
    }

    /// Master only. Returns once the write is committed and applied locally.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.enter()?;
        self.write(
            key,
            Some(value.to_vec()),
            JournalCommand::Put {
                segment: self.inner.index,
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )
        .await
    }

    /// Master only.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let _guard = self.enter()?;
        self.write(
            key,
            None,
            JournalCommand::Delete {
                segment: self.inner.index,
                key: key.to_vec(),
            },
        )
        .await
    }

    async fn write(&self, key: &[u8], value: Option<Vec<u8>>, cmd: JournalCommand) -> Result<()> {
        self.inner.core.ensure_writable()?;
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(key.to_vec(), (seq, value));

        let result = self.inner.core.propose(&cmd).await;

        let mut pending = self.inner.pending.lock().unwrap();
        if pending.get(key).map(|(s, _)| *s == seq).unwrap_or(false) {
            pending.remove(key);
        }
        result
    }

    pub fn count(&self) -> Result<usize> {
        let _guard = self.enter()?;
        self.inner
            .core
            .directory()
            .count(self.inner.index)
            .ok_or_else(|| self.not_found())
    }

    /// Committed records in commit order.
    pub fn records(&self) -> Result<Vec<Record>> {
        let _guard = self.enter()?;
        self.inner
            .core
            .directory()
            .records(self.inner.index)
            .ok_or_else(|| self.not_found())
    }

    /// Accepts operations again after a `close()` whose segment survived.
    pub(crate) fn reopen(&self) {
        self.inner.closing.store(false, Ordering::SeqCst);
    }

    /// Rejects new operations and waits for the running ones. Idempotent.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }
        log::debug!(
            "[{}] segment {} closed",
            self.inner.core.label,
            self.inner.name
        );
    }
}
