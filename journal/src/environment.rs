//! Journal environment lifecycle
//!
//! `setup()` walks `Uninitialized → Binding → Joining → Syncing → Ready` and
//! ends in one of the failure states when a step cannot complete:
//!
//! * `BindFailed`: the endpoint address (or the storage path) stayed taken
//!   after every retry.
//! * `RollbackFailed`: the group's leader does not hold our committed
//!   history. Never resolved automatically.
//! * `SyncFailed`: joining or catching up did not finish.
//!
//! A failed environment only accepts `close()`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fs2::FileExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::command::MemberInfo;
use crate::config::{JournalConfig, NodeConfig};
use crate::directory::{JournalState, MemberBook};
use crate::error::{JournalError, Result};
use crate::handle::CloseSafeSegment;
use crate::metrics::record_metrics;
use crate::node::{commit_member_change, GroupNode, GroupShared, NodeCore, NodeMeta, NodeRole};
use crate::protocol::{Frame, JoinReply, JoinRequest};
use crate::raft::node::{self as raft_node, Node, RaftOptions, RaftTask};
use crate::raft::proposal::Proposal;
use crate::raft::storage::FileStorage;
use crate::raft::{GroupStatus, RaftHandle};
use crate::raft_client::{self, RaftClient};
use crate::raft_service::RaftService;

const RAFT_DIR: &str = "raft";
const LOCK_FILE: &str = "LOCK";
const BOOTSTRAP_ID: u64 = 1;
const MAX_REDIRECTS: u32 = 3;
// pause between probes while the group has no leader
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Uninitialized,
    Binding,
    Joining,
    Syncing,
    Ready,
    Closed,
    BindFailed,
    RollbackFailed,
    SyncFailed,
}

impl EnvironmentState {
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            EnvironmentState::BindFailed
                | EnvironmentState::RollbackFailed
                | EnvironmentState::SyncFailed
        )
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Exclusive OS lock on `<storage_path>/LOCK`, shared by nothing else in
/// this or any other process until dropped.
struct StorageClaim {
    file: File,
    path: PathBuf,
}

impl StorageClaim {
    fn acquire(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let lock_path = path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if let Err(e) = file.try_lock_exclusive() {
            log::debug!("{} is locked: {}", lock_path.display(), e);
            return Err(JournalError::StorageInUse(path.display().to_string()));
        }
        Ok(StorageClaim {
            file,
            path: lock_path,
        })
    }
}

impl Drop for StorageClaim {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Everything `close()` has to stop.
#[derive(Default)]
struct Running {
    claim: Option<StorageClaim>,
    shared: Option<Arc<GroupShared>>,
    service: Option<RaftService>,
    raft_task: Option<RaftTask>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Running {
    async fn release(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.detach();
        }
        if let Some(mut task) = self.raft_task.take() {
            task.stop().await;
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        if let Some(mut service) = self.service.take() {
            service.stop().await;
        }
        self.claim.take();
    }
}

/// How this node enters the group.
enum Admission {
    /// `node.meta` exists: replay and rejoin with the same id.
    Existing(NodeMeta),
    /// First node of a new group.
    Bootstrap(NodeMeta),
    /// Admitted by the leader, which had committed up to `commit`.
    Joined { meta: NodeMeta, commit: u64 },
}

/// One node's journal: lifecycle, segments and membership.
pub struct JournalEnvironment {
    node_config: NodeConfig,
    config: JournalConfig,
    state: RwLock<EnvironmentState>,
    node: RwLock<Option<Arc<GroupNode>>>,
    running: tokio::sync::Mutex<Running>,
}

impl JournalEnvironment {
    pub fn new(node_config: NodeConfig, config: JournalConfig) -> Self {
        JournalEnvironment {
            node_config,
            config,
            state: RwLock::new(EnvironmentState::Uninitialized),
            node: RwLock::new(None),
            running: tokio::sync::Mutex::new(Running::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.node_config.label
    }

    pub fn node_config(&self) -> &NodeConfig {
        &self.node_config
    }

    pub fn state(&self) -> EnvironmentState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, next: EnvironmentState) {
        let mut state = self.state.write().unwrap();
        log::info!("[{}] {} -> {}", self.node_config.label, *state, next);
        *state = next;
    }

    /// Binds, joins and catches up. On error the environment is left in a
    /// failure state and must not be set up again.
    pub async fn setup(&self) -> Result<()> {
        record_metrics("setup", || self.do_setup()).await
    }

    async fn do_setup(&self) -> Result<()> {
        self.node_config.validate()?;
        {
            let mut state = self.state.write().unwrap();
            if *state != EnvironmentState::Uninitialized {
                return Err(JournalError::IllegalState(format!(
                    "setup of {} called in state {}",
                    self.node_config.label, *state
                )));
            }
            *state = EnvironmentState::Binding;
        }
        log::info!(
            "[{}] setting up at {} (helper {}, voter {})",
            self.node_config.label,
            self.node_config.self_addr,
            self.node_config.helper_addr,
            self.node_config.can_vote
        );

        let mut running = self.running.lock().await;
        match self.try_setup(&mut running).await {
            Ok(node) => {
                *self.node.write().unwrap() = Some(Arc::new(node));
                self.set_state(EnvironmentState::Ready);
                Ok(())
            }
            Err(e) => {
                let failed = match (&e, self.state()) {
                    (JournalError::RollbackDivergence { .. }, _) => EnvironmentState::RollbackFailed,
                    (_, EnvironmentState::Binding) => EnvironmentState::BindFailed,
                    _ => EnvironmentState::SyncFailed,
                };
                log::error!("[{}] setup failed: {}", self.node_config.label, e);
                running.release().await;
                self.set_state(failed);
                Err(e)
            }
        }
    }

    async fn try_setup(&self, running: &mut Running) -> Result<GroupNode> {
        let storage_path = self.node_config.storage_path.clone();
        let raft_path = storage_path.join(RAFT_DIR);
        running.claim = Some(StorageClaim::acquire(&storage_path)?);
        let listener = self.bind_with_retry().await?;

        self.set_state(EnvironmentState::Joining);
        let members = MemberBook::new();
        let state = JournalState {
            members: members.clone(),
            ..Default::default()
        };
        let (mailbox_tx, mailbox_rx) = raft_node::mailbox();
        let shared = Arc::new(GroupShared::new(
            self.node_config.label.clone(),
            mailbox_tx,
            members.clone(),
            self.config.propose_timeout(),
        ));
        running.service = Some(RaftService::serve(listener, shared.clone())?);
        running.shared = Some(shared.clone());

        let admission = match NodeMeta::load(&storage_path)? {
            Some(meta) => {
                if meta.addr() != &self.node_config.self_addr {
                    return Err(JournalError::Config(format!(
                        "{} belongs to the member at {}, not {}",
                        storage_path.display(),
                        meta.addr(),
                        self.node_config.self_addr
                    )));
                }
                log::info!(
                    "[{}] existing member {} of the group",
                    self.node_config.label,
                    meta.id()
                );
                Admission::Existing(meta)
            }
            None => {
                if FileStorage::exists(&raft_path) {
                    return Err(JournalError::Config(format!(
                        "{} holds raft state without a node identity; wipe it and rejoin",
                        storage_path.display()
                    )));
                }
                if self.node_config.is_bootstrap_helper() {
                    if !self.node_config.can_vote {
                        return Err(JournalError::Config(
                            "an observer cannot bootstrap a group".to_string(),
                        ));
                    }
                    Admission::Bootstrap(NodeMeta::new(
                        BOOTSTRAP_ID,
                        self.node_config.self_addr.clone(),
                        true,
                    ))
                } else {
                    let (meta, commit, group) = self.join_group().await?;
                    members.seed(group);
                    Admission::Joined { meta, commit }
                }
            }
        };

        self.set_state(EnvironmentState::Syncing);
        let (meta, storage, target) = match admission {
            Admission::Existing(meta) => {
                let storage = FileStorage::open(&raft_path)?;
                let commit = storage.commit();
                if !self.node_config.is_bootstrap_helper() {
                    let term = storage.term_at(commit).unwrap_or(0);
                    self.check_history(commit, term).await?;
                }
                (meta, storage, Some(commit))
            }
            Admission::Bootstrap(meta) => {
                let storage = FileStorage::bootstrap(&raft_path, meta.id())?;
                meta.save(&storage_path)?;
                (meta, storage, None)
            }
            Admission::Joined { meta, commit } => {
                let storage = FileStorage::open(&raft_path)?;
                meta.save(&storage_path)?;
                (meta, storage, Some(commit))
            }
        };

        let options = RaftOptions {
            label: self.node_config.label.clone(),
            election_tick: self.config.election_tick,
            heartbeat_tick: self.config.heartbeat_tick,
            tick_interval: self.config.tick_interval(),
            campaign: target.is_none(),
        };
        let (raft, out_mailbox, raft_task) = Node::start_raft(
            meta.id(),
            options,
            storage,
            mailbox_rx,
            state.clone(),
            self.config.propose_timeout(),
        )?;
        running.raft_task = Some(raft_task);
        running.dispatcher = Some(RaftClient::new(members.clone()).spawn_dispatcher(out_mailbox));
        shared.attach(raft.clone());

        let target = match target {
            Some(target) => target,
            None => self.register_self(&raft, &members).await?,
        };
        self.catch_up(&raft, target).await?;

        Ok(GroupNode::new(NodeCore {
            label: self.node_config.label.clone(),
            meta,
            state,
            raft,
            propose_timeout: self.config.propose_timeout(),
        }))
    }

    async fn bind_with_retry(&self) -> Result<TcpListener> {
        let addr = &self.node_config.self_addr;
        let attempts = self.config.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match RaftService::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    if attempt >= attempts {
                        return Err(JournalError::BindConflict {
                            addr: addr.clone(),
                            attempts,
                            source: e,
                        });
                    }
                    log::warn!(
                        "[{}] {} is in use, attempt {}/{}, retry in {:?}",
                        self.node_config.label,
                        addr,
                        attempt,
                        attempts,
                        self.config.sleep_interval()
                    );
                    time::sleep(self.config.sleep_interval()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Asks the helper (or the leader it points to) to admit this node.
    async fn join_group(&self) -> Result<(NodeMeta, u64, Vec<MemberInfo>)> {
        let helper = &self.node_config.helper_addr;
        let request = Frame::Join(JoinRequest {
            label: self.node_config.label.clone(),
            addr: self.node_config.self_addr.clone(),
            voter: self.node_config.can_vote,
        });
        let attempts = self.config.attempts();
        let mut target = helper.clone();
        let mut redirects = 0;
        let mut failures = 0;
        let mut reason = String::new();

        while failures < attempts {
            match raft_client::call(&target, &request).await {
                Ok(Frame::JoinReply(JoinReply::Accepted {
                    node_id,
                    commit,
                    members,
                })) => {
                    log::info!(
                        "[{}] admitted by {} as node {}, group commit {}",
                        self.node_config.label,
                        target,
                        node_id,
                        commit
                    );
                    let meta = NodeMeta::new(
                        node_id,
                        self.node_config.self_addr.clone(),
                        self.node_config.can_vote,
                    );
                    return Ok((meta, commit, members));
                }
                Ok(Frame::JoinReply(JoinReply::Redirect { leader_addr })) if redirects < MAX_REDIRECTS => {
                    log::info!(
                        "[{}] {} redirects the join to {}",
                        self.node_config.label,
                        target,
                        leader_addr
                    );
                    redirects += 1;
                    target = leader_addr;
                    continue;
                }
                Ok(Frame::JoinReply(JoinReply::Rejected { reason })) => {
                    return Err(JournalError::JoinFailure {
                        helper: target,
                        reason,
                    });
                }
                Ok(Frame::JoinReply(JoinReply::NoLeader)) => {
                    reason = format!("{} knows no leader", target);
                }
                Ok(Frame::JoinReply(JoinReply::Redirect { .. })) => {
                    reason = "too many redirects".to_string();
                }
                Ok(_) => reason = format!("unexpected reply from {}", target),
                Err(e) => reason = e.to_string(),
            }

            failures += 1;
            target = helper.clone();
            redirects = 0;
            if failures < attempts {
                log::warn!(
                    "[{}] join attempt {}/{} failed: {}",
                    self.node_config.label,
                    failures,
                    attempts,
                    reason
                );
                time::sleep(self.config.sleep_interval()).await;
            }
        }
        Err(JournalError::JoinFailure {
            helper: helper.clone(),
            reason,
        })
    }

    /// Verifies that the group still holds the entry we committed last.
    ///
    /// Only a leader's answer is authoritative. A follower that holds the
    /// entry is enough, and with no reachable leader we trust local history.
    async fn check_history(&self, local_commit: u64, local_term: u64) -> Result<()> {
        if local_commit == 0 {
            return Ok(());
        }
        let label = &self.node_config.label;
        let helper = &self.node_config.helper_addr;
        let probe = Frame::Probe {
            index: local_commit,
        };
        let deadline = Instant::now() + self.config.leader_wait();
        let attempts = self.config.attempts();
        let mut target = helper.clone();
        let mut failures = 0;

        loop {
            match raft_client::call(&target, &probe).await {
                Ok(Frame::ProbeReply(reply)) => {
                    if reply.is_leader {
                        if reply.term_at == Some(local_term) {
                            log::info!(
                                "[{}] leader {} holds committed index {}",
                                label,
                                target,
                                local_commit
                            );
                            return Ok(());
                        }
                        return Err(JournalError::RollbackDivergence {
                            label: label.clone(),
                            local_commit,
                            local_term,
                            group_last_index: reply.last_index,
                            group_term: reply.term_at,
                        });
                    }
                    if reply.term_at == Some(local_term) {
                        log::info!(
                            "[{}] {} holds committed index {}, no leader yet",
                            label,
                            target,
                            local_commit
                        );
                        return Ok(());
                    }
                    if let Some(leader) = reply.leader_addr {
                        target = leader;
                    }
                }
                Ok(_) => {
                    failures += 1;
                    log::warn!("[{}] unexpected probe reply from {}", label, target);
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("[{}] probing {} failed: {}", label, target, e);
                    target = helper.clone();
                }
            }

            if failures >= attempts {
                log::warn!(
                    "[{}] group unreachable after {} attempts, continuing with local history",
                    label,
                    failures
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "[{}] no leader within {:?}, continuing with local history",
                    label,
                    self.config.leader_wait()
                );
                return Ok(());
            }
            time::sleep(self.config.sleep_interval().max(LEADER_POLL_INTERVAL)).await;
        }
    }

    /// Records the bootstrap node in the group's member list; returns the
    /// index the directory has to reach.
    async fn register_self(&self, raft: &RaftHandle, members: &MemberBook) -> Result<u64> {
        let info = MemberInfo {
            id: BOOTSTRAP_ID,
            label: self.node_config.label.clone(),
            addr: self.node_config.self_addr.clone(),
            voter: true,
        };
        members.seed(vec![info.clone()]);

        let timeout = self.config.sync_timeout();
        if raft.wait_for(timeout, |s| s.is_leader).await.is_none() {
            return Err(self.sync_timeout(&raft.status(), 0));
        }
        commit_member_change(raft, &self.node_config.label, timeout, || {
            Ok(Proposal::add_member(info.id, true, info.encode()?))
        })
        .await?;
        Ok(raft.status().applied)
    }

    async fn catch_up(&self, raft: &RaftHandle, target: u64) -> Result<()> {
        log::info!(
            "[{}] catching up to index {}",
            self.node_config.label,
            target
        );
        match raft
            .wait_for(self.config.sync_timeout(), |s| s.applied >= target)
            .await
        {
            Some(status) => {
                log::info!(
                    "[{}] caught up at index {} (term {}, leader {})",
                    self.node_config.label,
                    status.applied,
                    status.term,
                    status.leader_id
                );
                Ok(())
            }
            None => Err(self.sync_timeout(&raft.status(), target)),
        }
    }

    fn sync_timeout(&self, status: &GroupStatus, target: u64) -> JournalError {
        JournalError::SyncTimeout {
            label: self.node_config.label.clone(),
            target,
            applied: status.applied,
            seconds: self.config.sync_timeout_sec,
        }
    }

    /// Closes all handles, stops the raft loop and releases address and
    /// storage. Idempotent; a failure state is kept.
    pub async fn close(&self) {
        let mut running = self.running.lock().await;
        let node = self.node.write().unwrap().take();
        if let Some(node) = node {
            node.close_handles().await;
        }
        running.release().await;
        if !self.state().is_failed() && self.state() != EnvironmentState::Closed {
            self.set_state(EnvironmentState::Closed);
        }
    }

    fn node(&self) -> Result<Arc<GroupNode>> {
        match self.state() {
            EnvironmentState::Ready => self
                .node
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| self.closed()),
            EnvironmentState::Closed => Err(self.closed()),
            other => Err(JournalError::IllegalState(format!(
                "{} is {}",
                self.node_config.label, other
            ))),
        }
    }

    fn closed(&self) -> JournalError {
        JournalError::closed(format!("journal environment {}", self.node_config.label))
    }

    /// Shared handle of `name`; only the master creates missing segments.
    pub async fn open_segment(&self, name: &str) -> Result<CloseSafeSegment> {
        record_metrics("open_segment", || async {
            self.node()?.open_segment(name).await
        })
        .await
    }

    pub async fn remove_segment(&self, name: &str) -> Result<()> {
        record_metrics("remove_segment", || async {
            self.node()?.remove_segment(name).await
        })
        .await
    }

    /// This node's view, ascending. A lagging replica sees a prefix.
    pub fn segment_indexes(&self) -> Result<Vec<u64>> {
        Ok(self.node()?.segment_indexes())
    }

    pub fn segment_names(&self) -> Result<Vec<String>> {
        Ok(self.node()?.segment_names())
    }

    pub fn role(&self) -> Result<NodeRole> {
        Ok(self.node()?.role())
    }

    pub fn status(&self) -> Result<GroupStatus> {
        Ok(self.node()?.status())
    }

    pub fn leader_address(&self) -> Result<Option<String>> {
        Ok(self.node()?.leader_address())
    }

    pub fn members(&self) -> Result<Vec<MemberInfo>> {
        Ok(self.node()?.members())
    }

    pub async fn remove_member(&self, addr: &str) -> Result<()> {
        record_metrics("remove_member", || async {
            self.node()?.remove_member(addr).await
        })
        .await
    }
}
