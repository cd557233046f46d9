//! Raft loop
//!
//! Drives one `RawNode` over file-backed storage: steps incoming messages,
//! ticks, proposes, persists and applies committed entries to the state
//! machine. Everything else talks to the loop through a `RaftHandle`.

#![allow(clippy::field_reassign_with_default)]

use std::collections::VecDeque;

use slog::Drain;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};

use crate::command::MemberInfo;
use crate::error::{JournalError, Result};
use crate::raft::proposal::Proposal;
use crate::raft::{MemberChange, StateMachine};
use slog::o;

use super::storage::FileStorage;

const LOGGER_CHANNEL_SIZE: usize = 4096;
const MAILBOX_SIZE: usize = 1000;

/// check_quorum stays off: a leader cut off from its voters keeps its role
/// until a newer term reaches it.
fn default_config(id: u64, options: &RaftOptions) -> Config {
    Config {
        id,
        election_tick: options.election_tick,
        heartbeat_tick: options.heartbeat_tick,
        ..Default::default()
    }
}

/// Raft log position and leadership as seen by this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStatus {
    pub id: u64,
    pub is_leader: bool,
    /// 0 while no leader is known
    pub leader_id: u64,
    pub term: u64,
    pub commit: u64,
    pub applied: u64,
    pub last_index: u64,
    pub stopped: bool,
}

/// Answer to "what does your log hold at this index".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogProbe {
    pub is_leader: bool,
    pub leader_id: u64,
    pub term: u64,
    pub commit: u64,
    pub last_index: u64,
    pub term_at: Option<u64>,
}

struct ProbeQuery {
    index: u64,
    reply: oneshot::Sender<LogProbe>,
}

#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub label: String,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub tick_interval: Duration,
    /// Campaign right away; only for the first node of a new group.
    pub campaign: bool,
}

/// Cloneable access to a running raft loop.
#[derive(Clone)]
pub struct RaftHandle {
    proposals: Sender<Proposal>,
    probes: Sender<ProbeQuery>,
    status: watch::Receiver<GroupStatus>,
    propose_timeout: Duration,
}

impl RaftHandle {
    pub fn status(&self) -> GroupStatus {
        *self.status.borrow()
    }

    /// Resolves to whether the proposal was committed and applied.
    pub async fn submit(&self, proposal: (Proposal, oneshot::Receiver<bool>)) -> Result<bool> {
        let (proposal, rx) = proposal;
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| JournalError::closed("raft node"))?;
        match time::timeout(self.propose_timeout, rx).await {
            Ok(Ok(applied)) => Ok(applied),
            Ok(Err(_)) => Err(JournalError::closed("raft node")),
            Err(_) => Err(JournalError::CommitTimeout(
                self.propose_timeout.as_secs(),
            )),
        }
    }

    pub async fn probe(&self, index: u64) -> Result<LogProbe> {
        let (reply, rx) = oneshot::channel();
        self.probes
            .send(ProbeQuery { index, reply })
            .await
            .map_err(|_| JournalError::closed("raft node"))?;
        rx.await.map_err(|_| JournalError::closed("raft node"))
    }

    /// Waits until `cond` holds; `None` on timeout or when the loop stops.
    pub async fn wait_for<F>(&self, timeout: Duration, cond: F) -> Option<GroupStatus>
    where
        F: Fn(&GroupStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let deadline = Instant::now() + timeout;
        loop {
            let status = *rx.borrow_and_update();
            if cond(&status) {
                return Some(status);
            }
            if status.stopped {
                return None;
            }
            match time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }
}

/// Everything needed to stop a raft loop and collect it.
pub struct RaftTask {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl RaftTask {
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                log::error!("raft loop ended abnormally: {}", e);
            }
        }
    }
}

/// State owned by the raft loop task.
pub struct Node<S: StateMachine> {
    raft_group: RawNode<FileStorage>,
    out_mailbox: Sender<Message>,  // -> peers
    my_mailbox: Receiver<Message>, // <- peers
    state_machine: S,
    proposals: Receiver<Proposal>,
    probes: Receiver<ProbeQuery>,
    proposed: VecDeque<Proposal>, // waiting for their entry to apply
    status: watch::Sender<GroupStatus>,
    applied: u64,
    label: String,
}

impl<S: StateMachine + Send + 'static> Node<S> {
    /// Applies `entries` in order; returns the last applied index.
    fn handle_committed_entries(
        raft_group: &mut RawNode<FileStorage>,
        entries: Vec<Entry>,
        state_machine: &mut S,
        proposed: &mut VecDeque<Proposal>,
    ) -> u64 {
        let mut last_index = 0u64;
        for entry in entries {
            let has_data = !entry.data.is_empty();
            if !has_data {
                // leader's empty entry or a dropped conf change
                state_machine.advance(entry.index);
            } else {
                match entry.get_entry_type() {
                    EntryType::EntryConfChange => {
                        Self::handle_conf_change(raft_group, &entry, state_machine);
                    }
                    EntryType::EntryNormal => {
                        state_machine.apply(entry.index, &entry.data[..]);
                    }
                    EntryType::EntryConfChangeV2 => {
                        log::warn!("[{}] joint conf change is not used, skip", entry.index);
                        state_machine.advance(entry.index);
                    }
                }
            }

            Self::notice_proposed(entry.index, entry.term, has_data, proposed);
            last_index = entry.index;
        }
        last_index
    }

    fn handle_conf_change(raft_group: &mut RawNode<FileStorage>, entry: &Entry, state_machine: &mut S) {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(&entry.data[..]) {
            log::error!("[{}] undecodable conf change: {}", entry.index, e);
            state_machine.advance(entry.index);
            return;
        }

        match raft_group.apply_conf_change(&cc) {
            Ok(cs) => {
                if let Err(e) = raft_group.raft.raft_log.store.set_conf_state(cs) {
                    log::error!("Failed to persist conf state: {:?}", e);
                }
            }
            Err(e) => log::error!("[{}] conf change rejected: {:?}", entry.index, e),
        }

        let change = match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                match MemberInfo::decode(&cc.context[..]) {
                    Ok(info) => Some(MemberChange::Added(info)),
                    Err(e) => {
                        log::warn!("[{}] conf change without member info: {}", entry.index, e);
                        None
                    }
                }
            }
            ConfChangeType::RemoveNode => Some(MemberChange::Removed(cc.node_id)),
        };
        match change {
            Some(change) => state_machine.apply_member_change(entry.index, change),
            None => state_machine.advance(entry.index),
        }
    }

    /// One pass over raft's pending output: send, apply, persist, advance.
    fn on_ready(&mut self) {
        let raft_group = &mut self.raft_group;

        if !raft_group.has_ready() {
            return;
        }

        let mut ready = raft_group.ready();

        // leader messages can go out before the entries are persisted
        if !ready.messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            Self::handle_snapshot(raft_group, &ready);
        }

        let index1 = Self::handle_committed_entries(
            raft_group,
            ready.take_committed_entries(),
            &mut self.state_machine,
            &mut self.proposed,
        );

        Self::persist_raft_state(raft_group, &ready);
        if !ready.persisted_messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_persisted_messages());
        }

        let mut light_rd = raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            Self::update_commit(raft_group, commit);
        }
        Self::handle_out_messages(&self.out_mailbox, light_rd.messages());
        let index2 = Self::handle_committed_entries(
            raft_group,
            light_rd.take_committed_entries(),
            &mut self.state_machine,
            &mut self.proposed,
        );

        self.applied = self.applied.max(index1).max(index2);
        raft_group.advance_apply();
    }

    /// A proposal succeeds only if its own entry, not a replacement written by
    /// a later leader, was applied at its index.
    fn notice_proposed(index: u64, term: u64, has_data: bool, proposed: &mut VecDeque<Proposal>) {
        while proposed.front().map(|p| p.proposed <= index).unwrap_or(false) {
            if let Some(mut proposal) = proposed.pop_front() {
                let success = proposal.proposed == index && proposal.term == term && has_data;
                proposal.finish(success);
            }
        }
    }

    fn handle_out_messages(sender: &Sender<Message>, messages: &[Message]) {
        for msg in messages {
            if let Err(e) = sender.try_send(msg.clone()) {
                log::warn!("Failed to send raft message {:?}, Raft will retry", e);
            }
        }
    }

    /// Logs are never compacted, so a snapshot only reaches us from a
    /// foreign group; keep storage consistent with it anyway.
    fn handle_snapshot(raft_group: &mut RawNode<FileStorage>, ready: &Ready) {
        let snapshot = ready.snapshot().clone();
        log::warn!(
            "Unexpected snapshot at index {}",
            snapshot.get_metadata().index
        );
        let store = &mut raft_group.raft.raft_log.store;
        if let Err(e) = store.apply_snapshot(&snapshot) {
            log::error!("Failed to apply snapshot: {:?}", e);
        }
    }

    /// Entries first, then the hard state that may commit them.
    fn persist_raft_state(raft_group: &mut RawNode<FileStorage>, ready: &Ready) {
        let store = &mut raft_group.raft.raft_log.store;

        if let Err(e) = store.append_entries(ready.entries(), ready.must_sync()) {
            log::error!("Failed to persist raft log: {:?}", e);
            return;
        }

        if let Some(hs) = ready.hs() {
            if let Err(e) = store.set_hardstate(hs.clone()) {
                log::error!("Failed to persist hard state: {:?}", e);
            }
        }
    }

    fn update_commit(raft_group: &mut RawNode<FileStorage>, commit: u64) {
        let store = &mut raft_group.raft.raft_log.store;
        if let Err(e) = store.set_commit(commit) {
            log::error!("Failed to persist commit index {}: {:?}", commit, e);
        }
    }

    /// Non-leaders fail the proposal right away. A proposal raft silently
    /// drops leaves the log unchanged and fails as well.
    fn propose(
        raft_group: &mut RawNode<FileStorage>,
        mut proposal: Proposal,
        proposed: &mut VecDeque<Proposal>,
    ) {
        if raft_group.raft.state != StateRole::Leader {
            proposal.finish(false);
            return;
        }

        let last_index = raft_group.raft.raft_log.last_index() + 1;

        let result = if let Some(data) = proposal.normal.take() {
            raft_group.propose(vec![], data)
        } else if let Some(cc) = proposal.conf_change.take() {
            raft_group.propose_conf_change(vec![], cc)
        } else {
            Ok(())
        };

        let new_last_index = raft_group.raft.raft_log.last_index() + 1;
        if result.is_err() || new_last_index == last_index {
            proposal.finish(false);
        } else {
            proposal.proposed = last_index;
            proposal.term = raft_group.raft.term;
            proposed.push_back(proposal);
        }
    }

    fn answer_probe(raft_group: &RawNode<FileStorage>, query: ProbeQuery) {
        let raft = &raft_group.raft;
        let last_index = raft.raft_log.last_index();
        let term_at = if query.index == 0 || query.index > last_index {
            None
        } else {
            raft.raft_log.term(query.index).ok().filter(|t| *t > 0)
        };
        let _ = query.reply.send(LogProbe {
            is_leader: raft.state == StateRole::Leader,
            leader_id: raft.leader_id,
            term: raft.term,
            commit: raft.raft_log.committed,
            last_index,
            term_at,
        });
    }

    /// Pending proposals can't commit under another leader.
    fn fail_proposals_if_follower(&mut self) {
        if self.raft_group.raft.state == StateRole::Leader {
            return;
        }
        while let Some(mut proposal) = self.proposed.pop_front() {
            proposal.finish(false);
        }
    }

    fn publish_status(&self) {
        let raft = &self.raft_group.raft;
        let status = GroupStatus {
            id: raft.id,
            is_leader: raft.state == StateRole::Leader,
            leader_id: raft.leader_id,
            term: raft.term,
            commit: raft.raft_log.committed,
            applied: self.applied,
            last_index: raft.raft_log.last_index(),
            stopped: false,
        };
        self.status.send_if_modified(|current| {
            if *current != status {
                if current.leader_id != status.leader_id {
                    log::info!(
                        "[{}] leader changed from {} to {} at term {}",
                        self.label,
                        current.leader_id,
                        status.leader_id,
                        status.term
                    );
                }
                *current = status;
                true
            } else {
                false
            }
        });
    }

    async fn run_background_tasks(
        &mut self,
        tick_interval: Duration,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut ticker = time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // replay whatever is already committed locally
        self.on_ready();
        self.publish_status();

        loop {
            let raft_group = &mut self.raft_group;
            tokio::select! {
                _ = &mut shutdown => break,
                Some(msg) = self.my_mailbox.recv() => {
                    let _ = raft_group.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        let _ = raft_group.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    Self::propose(raft_group, proposal, &mut self.proposed);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        Self::propose(raft_group, proposal, &mut self.proposed);
                    }
                }
                Some(query) = self.probes.recv() => {
                    Self::answer_probe(raft_group, query);
                }
                _ = ticker.tick() => {
                    raft_group.tick();
                }
            }

            self.on_ready();
            self.fail_proposals_if_follower();
            self.publish_status();
        }

        while let Some(mut proposal) = self.proposed.pop_front() {
            proposal.finish(false);
        }
        self.status.send_modify(|status| status.stopped = true);
        log::info!("[{}] raft loop stopped", self.label);
    }

    /// Builds the raft group over `storage` and spawns its loop. The
    /// returned receiver carries messages for peers.
    pub fn start_raft(
        id: u64,
        options: RaftOptions,
        storage: FileStorage,
        my_mailbox: Receiver<Message>,
        state_machine: S,
        propose_timeout: Duration,
    ) -> Result<(RaftHandle, Receiver<Message>, RaftTask)> {
        let logger = build_logger(&options.label, id);

        let (sx, out_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let (proposals_tx, proposals) = mpsc::channel(MAILBOX_SIZE);
        let (probes_tx, probes) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(GroupStatus {
            id,
            ..Default::default()
        });

        let cfg = default_config(id, &options);
        let mut raft_group = RawNode::new(&cfg, storage, &logger)?;
        if options.campaign {
            raft_group.campaign()?;
        }

        let mut node = Node {
            raft_group,
            out_mailbox: sx,
            my_mailbox,
            state_machine,
            proposals,
            probes,
            proposed: VecDeque::new(),
            status: status_tx,
            applied: 0,
            label: options.label.clone(),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let tick_interval = options.tick_interval;
        let join = tokio::spawn(async move {
            node.run_background_tasks(tick_interval, shutdown_rx).await;
        });

        let handle = RaftHandle {
            proposals: proposals_tx,
            probes: probes_tx,
            status: status_rx,
            propose_timeout,
        };
        let task = RaftTask {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        };
        Ok((handle, out_mailbox, task))
    }
}

/// Inbound mailbox, created before the raft loop so early messages queue up.
pub fn mailbox() -> (Sender<Message>, Receiver<Message>) {
    mpsc::channel(MAILBOX_SIZE)
}

#[cfg(feature = "slog-term")]
fn build_logger(label: &str, id: u64) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Info).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!("node" => label.to_string(), "peer" => id))
}

#[cfg(not(feature = "slog-term"))]
fn build_logger(label: &str, id: u64) -> slog::Logger {
    let drain = slog_async::Async::new(slog::Discard)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .build()
        .fuse();
    slog::Logger::root(drain, o!("node" => label.to_string(), "peer" => id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::JournalCommand;
    use crate::directory::JournalState;
    use tempfile::TempDir;

    fn options(label: &str, campaign: bool) -> RaftOptions {
        RaftOptions {
            label: label.to_string(),
            election_tick: 10,
            heartbeat_tick: 3,
            tick_interval: Duration::from_millis(20),
            campaign,
        }
    }

    #[tokio::test]
    async fn test_single_voter_commits_and_replays() {
        let dir = TempDir::new().unwrap();
        let state = JournalState::new();
        {
            let storage = FileStorage::bootstrap(dir.path(), 1).unwrap();
            let (_tx, rx) = mailbox();
            let (handle, _out, mut task) = Node::start_raft(
                1,
                options("single", true),
                storage,
                rx,
                state.clone(),
                Duration::from_secs(5),
            )
            .unwrap();

            assert!(handle
                .wait_for(Duration::from_secs(5), |s| s.is_leader)
                .await
                .is_some());
            let cmd = JournalCommand::CreateSegment {
                name: "0".to_string(),
                index: 0,
            };
            assert!(handle
                .submit(Proposal::normal(cmd.encode().unwrap()))
                .await
                .unwrap());
            assert_eq!(state.directory.indexes(), vec![0]);

            let probe = handle.probe(1).await.unwrap();
            assert!(probe.is_leader);
            assert_eq!(probe.term_at, Some(probe.term));
            assert_eq!(handle.probe(100).await.unwrap().term_at, None);
            task.stop().await;
            assert!(handle.status.borrow().stopped);
        }

        // restart replays the committed create into a fresh directory
        let replayed = JournalState::new();
        let storage = FileStorage::open(dir.path()).unwrap();
        let commit = storage.commit();
        assert!(commit >= 2);
        let (_tx, rx) = mailbox();
        let (handle, _out, mut task) = Node::start_raft(
            1,
            options("single", false),
            storage,
            rx,
            replayed.clone(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(handle
            .wait_for(Duration::from_secs(5), |s| s.applied >= commit)
            .await
            .is_some());
        assert_eq!(replayed.directory.indexes(), vec![0]);
        task.stop().await;
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let (_tx, rx) = mailbox();
        let (handle, _out, mut task) = Node::start_raft(
            2,
            options("lonely", false),
            storage,
            rx,
            JournalState::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let cmd = JournalCommand::RemoveSegment {
            name: "0".to_string(),
        };
        assert!(!handle
            .submit(Proposal::normal(cmd.encode().unwrap()))
            .await
            .unwrap());
        task.stop().await;
        assert!(handle.submit(Proposal::normal(vec![1])).await.is_err());
    }
}
