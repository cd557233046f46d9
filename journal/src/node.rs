//! Replication group node
//!
//! `GroupShared` answers peers (join and probe requests) from the moment
//! the endpoint is bound. `GroupNode` is the caller-facing side once the
//! raft loop runs: role, segments, membership.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fxhash::{FxHashMap, FxHashSet};
use getset::{CopyGetters, Getters};
use raft::prelude::Message as RaftMessage;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::{mpsc::Sender, oneshot, Mutex};
use tokio::time::{self, Instant};

use crate::command::{JournalCommand, MemberInfo};
use crate::directory::{JournalState, MemberBook, SegmentDirectory};
use crate::error::{JournalError, Result};
use crate::handle::CloseSafeSegment;
use crate::protocol::{Frame, JoinReply, JoinRequest, ProbeReply};
use crate::raft::proposal::Proposal;
use crate::raft::{GroupStatus, RaftHandle};

const NODE_META_FILE: &str = "node.meta";
// conf changes are dropped while another one is pending
const MEMBER_CHANGE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Follower,
    Observer,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Master => "Master",
            NodeRole::Follower => "Follower",
            NodeRole::Observer => "Observer",
        };
        f.write_str(name)
    }
}

/// Identity of this node inside its group, kept next to the raft state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct NodeMeta {
    #[getset(get_copy = "pub")]
    id: u64,
    #[getset(get = "pub")]
    addr: String,
    #[getset(get_copy = "pub")]
    voter: bool,
}

impl NodeMeta {
    pub fn new(id: u64, addr: impl Into<String>, voter: bool) -> Self {
        NodeMeta {
            id,
            addr: addr.into(),
            voter,
        }
    }

    fn path(storage_path: &Path) -> PathBuf {
        storage_path.join(NODE_META_FILE)
    }

    pub fn load(storage_path: &Path) -> Result<Option<Self>> {
        let path = Self::path(storage_path);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(bincode::deserialize(&data)?))
    }

    pub fn save(&self, storage_path: &Path) -> Result<()> {
        fs::create_dir_all(storage_path)?;
        let path = Self::path(storage_path);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bincode::serialize(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Commits a membership change, retrying while raft drops it because an
/// earlier change is still being applied.
pub(crate) async fn commit_member_change<F>(
    raft: &RaftHandle,
    label: &str,
    timeout: Duration,
    make: F,
) -> Result<()>
where
    F: Fn() -> Result<(Proposal, oneshot::Receiver<bool>)>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if raft.submit(make()?).await? {
            return Ok(());
        }
        if !raft.status().is_leader {
            return Err(JournalError::not_writable(label, "non-leader"));
        }
        if Instant::now() >= deadline {
            return Err(JournalError::CommitTimeout(timeout.as_secs()));
        }
        time::sleep(MEMBER_CHANGE_BACKOFF).await;
    }
}

/// State the replication endpoint needs before and after the raft loop is
/// running.
pub struct GroupShared {
    pub(crate) label: String,
    mailbox: Sender<RaftMessage>,
    members: MemberBook,
    raft: RwLock<Option<RaftHandle>>,
    join_lock: Mutex<()>,
    propose_timeout: Duration,
}

impl GroupShared {
    pub fn new(
        label: impl Into<String>,
        mailbox: Sender<RaftMessage>,
        members: MemberBook,
        propose_timeout: Duration,
    ) -> Self {
        GroupShared {
            label: label.into(),
            mailbox,
            members,
            raft: RwLock::new(None),
            join_lock: Mutex::new(()),
            propose_timeout,
        }
    }

    pub fn attach(&self, raft: RaftHandle) {
        *self.raft.write().unwrap() = Some(raft);
    }

    pub fn detach(&self) {
        self.raft.write().unwrap().take();
    }

    fn raft(&self) -> Option<RaftHandle> {
        self.raft.read().unwrap().clone()
    }

    /// Queues an inbound raft message; raft retransmits whatever is dropped.
    pub fn deliver(&self, msg: RaftMessage) {
        if let Err(e) = self.mailbox.try_send(msg) {
            log::debug!("[{}] inbound mailbox rejected message: {}", self.label, e);
        }
    }

    pub async fn handle_request(&self, request: Frame) -> Frame {
        match request {
            Frame::Join(req) => Frame::JoinReply(self.handle_join(req).await),
            Frame::Probe { index } => match self.handle_probe(index).await {
                Ok(reply) => Frame::ProbeReply(reply),
                Err(e) => Frame::Error(e.to_string()),
            },
            _ => Frame::Error("unexpected request".to_string()),
        }
    }

    async fn handle_probe(&self, index: u64) -> Result<ProbeReply> {
        let raft = self
            .raft()
            .ok_or_else(|| JournalError::IllegalState(format!("{} is still starting", self.label)))?;
        let probe = raft.probe(index).await?;
        let leader_addr = if probe.leader_id == 0 {
            None
        } else {
            self.members.addr(probe.leader_id)
        };
        Ok(ProbeReply {
            is_leader: probe.is_leader,
            leader_addr,
            commit: probe.commit,
            last_index: probe.last_index,
            term_at: probe.term_at,
        })
    }

    async fn handle_join(&self, req: JoinRequest) -> JoinReply {
        let raft = match self.raft() {
            Some(raft) => raft,
            None => return JoinReply::NoLeader,
        };
        let status = raft.status();
        if !status.is_leader {
            return match self.members.addr(status.leader_id) {
                Some(leader_addr) if status.leader_id != 0 => JoinReply::Redirect { leader_addr },
                _ => JoinReply::NoLeader,
            };
        }

        // one membership change at a time, so ids stay unique
        let _guard = self.join_lock.lock().await;
        if let Some(existing) = self.members.find_by_addr(&req.addr) {
            if existing.voter != req.voter {
                return JoinReply::Rejected {
                    reason: format!(
                        "{} is already a member with voter={}",
                        req.addr, existing.voter
                    ),
                };
            }
            log::info!(
                "[{}] {} rejoins as node {}",
                self.label,
                req.label,
                existing.id
            );
            return JoinReply::Accepted {
                node_id: existing.id,
                commit: raft.status().commit,
                members: self.members.members(),
            };
        }

        let info = MemberInfo {
            id: self.members.next_id(),
            label: req.label.clone(),
            addr: req.addr.clone(),
            voter: req.voter,
        };
        log::info!(
            "[{}] admitting {} at {} as node {} (voter: {})",
            self.label,
            info.label,
            info.addr,
            info.id,
            info.voter
        );
        let result = commit_member_change(&raft, &self.label, self.propose_timeout, || {
            Ok(Proposal::add_member(info.id, info.voter, info.encode()?))
        })
        .await;
        match result {
            Ok(()) => JoinReply::Accepted {
                node_id: info.id,
                commit: raft.status().commit,
                members: self.members.members(),
            },
            Err(JournalError::NotWritable { .. }) => JoinReply::NoLeader,
            Err(e) => JoinReply::Rejected {
                reason: e.to_string(),
            },
        }
    }
}

/// Pieces of a running node shared with every handle it gives out.
pub(crate) struct NodeCore {
    pub(crate) label: String,
    pub(crate) meta: NodeMeta,
    pub(crate) state: JournalState,
    pub(crate) raft: RaftHandle,
    pub(crate) propose_timeout: Duration,
}

impl NodeCore {
    pub(crate) fn directory(&self) -> &SegmentDirectory {
        &self.state.directory
    }

    pub(crate) fn status(&self) -> GroupStatus {
        self.raft.status()
    }

    pub(crate) fn role(&self) -> NodeRole {
        if self.status().is_leader {
            return NodeRole::Master;
        }
        let voter = self
            .state
            .members
            .get(self.meta.id())
            .map(|m| m.voter)
            .unwrap_or_else(|| self.meta.voter());
        if voter {
            NodeRole::Follower
        } else {
            NodeRole::Observer
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        match self.role() {
            NodeRole::Master => Ok(()),
            role => Err(JournalError::not_writable(&self.label, role)),
        }
    }

    /// Waits until `cmd` is committed and applied locally.
    pub(crate) async fn propose(&self, cmd: &JournalCommand) -> Result<()> {
        self.ensure_writable()?;
        if self.raft.submit(Proposal::normal(cmd.encode()?)).await? {
            Ok(())
        } else {
            Err(JournalError::not_writable(&self.label, self.role()))
        }
    }
}

#[derive(Default)]
struct HandleTable {
    open: FxHashMap<String, CloseSafeSegment>,
    // names whose removal is being committed
    removing: FxHashSet<String>,
    closed: bool,
}

/// Caller-facing side of a joined node.
pub struct GroupNode {
    core: Arc<NodeCore>,
    handles: Mutex<HandleTable>,
    // serializes create/remove so index allocation sees the latest directory
    write_lock: Mutex<()>,
}

impl GroupNode {
    pub(crate) fn new(core: NodeCore) -> Self {
        GroupNode {
            core: Arc::new(core),
            handles: Mutex::new(HandleTable::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.core.meta.id()
    }

    pub fn role(&self) -> NodeRole {
        self.core.role()
    }

    pub fn status(&self) -> GroupStatus {
        self.core.status()
    }

    pub fn leader_address(&self) -> Option<String> {
        let status = self.core.status();
        if status.leader_id == 0 {
            return None;
        }
        self.core.state.members.addr(status.leader_id)
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.core.state.members.members()
    }

    /// Indexes of the segments this node has applied, ascending.
    pub fn segment_indexes(&self) -> Vec<u64> {
        self.core.directory().indexes()
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.core.directory().names()
    }

    /// Returns the shared handle of `name`, creating the segment on the
    /// master when it does not exist yet.
    pub async fn open_segment(&self, name: &str) -> Result<CloseSafeSegment> {
        if let Some(handle) = self.existing_handle(name).await? {
            return Ok(handle);
        }

        let _write = self.write_lock.lock().await;
        // created by a concurrent caller, or kept by a failed removal
        if let Some(handle) = self.existing_handle(name).await? {
            return Ok(handle);
        }
        self.core.ensure_writable()?;
        let index = self
            .core
            .directory()
            .allocate_index(name)
            .map_err(|reason| JournalError::invalid_segment(name, reason))?;
        self.core
            .propose(&JournalCommand::CreateSegment {
                name: name.to_string(),
                index,
            })
            .await?;
        match self.existing_handle(name).await? {
            Some(handle) if handle.index() == index => {
                log::info!("[{}] created segment {} at index {}", self.core.label, name, index);
                Ok(handle)
            }
            other => Err(JournalError::IllegalState(format!(
                "segment {} was committed at index {} but applied as {:?}",
                name,
                index,
                other.map(|h| h.index())
            ))),
        }
    }

    /// `None` when the segment does not exist or is being removed; callers
    /// then wait on `write_lock` for the removal to settle.
    async fn existing_handle(&self, name: &str) -> Result<Option<CloseSafeSegment>> {
        let mut table = self.handles.lock().await;
        if table.closed {
            return Err(JournalError::closed(format!("{} segments", self.core.label)));
        }
        if table.removing.contains(name) {
            return Ok(None);
        }
        let index = match self.core.directory().index_of(name) {
            Some(index) => index,
            None => return Ok(None),
        };
        if let Some(handle) = table.open.get(name) {
            if !handle.is_closed() && handle.index() == index {
                return Ok(Some(handle.clone()));
            }
        }
        let handle = CloseSafeSegment::new(name, index, self.core.clone());
        table.open.insert(name.to_string(), handle.clone());
        Ok(Some(handle))
    }

    /// Master only. Drains the local handle before the removal is committed;
    /// if the removal fails the handle serves again.
    pub async fn remove_segment(&self, name: &str) -> Result<()> {
        self.core.ensure_writable()?;
        let _write = self.write_lock.lock().await;
        if self.core.directory().index_of(name).is_none() {
            return Err(JournalError::SegmentNotFound(name.to_string()));
        }
        let handle = {
            let mut table = self.handles.lock().await;
            table.removing.insert(name.to_string());
            table.open.get(name).cloned()
        };
        if let Some(handle) = &handle {
            handle.close().await;
        }

        let result = self
            .core
            .propose(&JournalCommand::RemoveSegment {
                name: name.to_string(),
            })
            .await;

        let mut table = self.handles.lock().await;
        table.removing.remove(name);
        match result {
            Ok(()) => {
                table.open.remove(name);
                log::info!("[{}] removed segment {}", self.core.label, name);
                Ok(())
            }
            Err(e) => {
                if let Some(handle) = handle {
                    if !table.closed {
                        handle.reopen();
                    }
                }
                log::warn!(
                    "[{}] removing segment {} failed: {}",
                    self.core.label,
                    name,
                    e
                );
                Err(e)
            }
        }
    }

    /// Master only. The member leaves the voter and learner sets.
    pub async fn remove_member(&self, addr: &str) -> Result<()> {
        self.core.ensure_writable()?;
        let member = self
            .core
            .state
            .members
            .find_by_addr(addr)
            .ok_or_else(|| JournalError::IllegalState(format!("no member at {}", addr)))?;
        if member.id == self.id() {
            return Err(JournalError::IllegalState(format!(
                "{} cannot remove itself from the group",
                self.core.label
            )));
        }
        log::info!(
            "[{}] removing member {} ({}) at {}",
            self.core.label,
            member.id,
            member.label,
            member.addr
        );
        commit_member_change(
            &self.core.raft,
            &self.core.label,
            self.core.propose_timeout,
            || Ok(Proposal::remove_member(member.id)),
        )
        .await
    }

    /// Closes every handle given out, waiting for in-flight operations.
    /// No handle is given out afterwards.
    pub async fn close_handles(&self) {
        let handles: Vec<_> = {
            let mut table = self.handles.lock().await;
            table.closed = true;
            table.open.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }
}
