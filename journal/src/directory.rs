//! Segment directory
//!
//! The materialized view of the replicated journal on this node: which
//! segments exist, in which index order, and what records they hold. It is
//! only mutated by the raft loop applying committed entries, so every node
//! that has applied the same prefix of the log holds the same directory.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use fxhash::FxHashMap;
use log::{info, warn};

use crate::command::{JournalCommand, MemberInfo};
use crate::raft::{MemberChange, StateMachine};

/// One key/value entry of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Default)]
struct SegmentData {
    name: String,
    records: Vec<Record>,
    // key -> position in `records`
    positions: FxHashMap<Vec<u8>, usize>,
}

impl SegmentData {
    fn new(name: String) -> Self {
        SegmentData {
            name,
            ..Default::default()
        }
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        match self.positions.get(&key) {
            Some(&pos) => self.records[pos].value = value,
            None => {
                self.positions.insert(key.clone(), self.records.len());
                self.records.push(Record { key, value });
            }
        }
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        let pos = match self.positions.remove(key) {
            Some(pos) => pos,
            None => return false,
        };
        self.records.remove(pos);
        for p in self.positions.values_mut() {
            if *p > pos {
                *p -= 1;
            }
        }
        true
    }

    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.positions
            .get(key)
            .map(|&pos| self.records[pos].value.as_slice())
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    segments: BTreeMap<u64, SegmentData>,
    names: FxHashMap<String, u64>,
    // one past the largest index ever created; indexes are never reused
    next_index: u64,
    applied: u64,
}

/// Shared view over the journal's segments.
#[derive(Debug, Clone, Default)]
pub struct SegmentDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl SegmentDirectory {
    pub fn new() -> Self {
        SegmentDirectory::default()
    }

    pub fn index_of(&self, name: &str) -> Option<u64> {
        self.state.read().unwrap().names.get(name).copied()
    }

    pub fn contains_index(&self, index: u64) -> bool {
        self.state.read().unwrap().segments.contains_key(&index)
    }

    /// Indexes in ascending order.
    pub fn indexes(&self) -> Vec<u64> {
        self.state.read().unwrap().segments.keys().copied().collect()
    }

    /// Names ordered by index.
    pub fn names(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .segments
            .values()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn applied(&self) -> u64 {
        self.state.read().unwrap().applied
    }

    /// Index a new segment with this name would receive.
    ///
    /// A name that is an unsigned integer is its own index; anything else
    /// takes the next free index.
    pub fn allocate_index(&self, name: &str) -> Result<u64, String> {
        let state = self.state.read().unwrap();
        Self::index_for(&state, name)
    }

    fn index_for(state: &DirectoryState, name: &str) -> Result<u64, String> {
        if name.is_empty() {
            return Err("segment name is empty".to_string());
        }
        match name.parse::<u64>() {
            Ok(index) if index < state.next_index => Err(format!(
                "index {} is not above the highest index ever created ({})",
                index,
                state.next_index - 1
            )),
            Ok(u64::MAX) => Err(format!("index {} is reserved", u64::MAX)),
            Ok(index) => Ok(index),
            Err(_) if state.next_index == u64::MAX => {
                Err("segment indexes are exhausted".to_string())
            }
            Err(_) => Ok(state.next_index),
        }
    }

    /// `None` when the segment does not exist.
    pub fn get(&self, index: u64, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let state = self.state.read().unwrap();
        state
            .segments
            .get(&index)
            .map(|segment| segment.get(key).map(|v| v.to_vec()))
    }

    pub fn count(&self, index: u64) -> Option<usize> {
        let state = self.state.read().unwrap();
        state.segments.get(&index).map(|s| s.records.len())
    }

    pub fn records(&self, index: u64) -> Option<Vec<Record>> {
        let state = self.state.read().unwrap();
        state.segments.get(&index).map(|s| s.records.clone())
    }

    fn apply_command(state: &mut DirectoryState, raft_index: u64, cmd: JournalCommand) {
        match cmd {
            JournalCommand::CreateSegment { name, index } => {
                if state.names.contains_key(&name) {
                    warn!("[{}] segment {} already exists, skip", raft_index, name);
                    return;
                }
                if index < state.next_index {
                    warn!(
                        "[{}] segment {} reuses index {}, skip",
                        raft_index, name, index
                    );
                    return;
                }
                let next_index = match index.checked_add(1) {
                    Some(next) => next,
                    None => {
                        warn!(
                            "[{}] segment {} has out of range index {}, skip",
                            raft_index, name, index
                        );
                        return;
                    }
                };
                info!("[{}] create segment {} at index {}", raft_index, name, index);
                state.names.insert(name.clone(), index);
                state.segments.insert(index, SegmentData::new(name));
                state.next_index = next_index;
            }
            JournalCommand::RemoveSegment { name } => match state.names.remove(&name) {
                Some(index) => {
                    info!("[{}] remove segment {} at index {}", raft_index, name, index);
                    state.segments.remove(&index);
                }
                None => warn!("[{}] segment {} does not exist, skip", raft_index, name),
            },
            JournalCommand::Put {
                segment,
                key,
                value,
            } => match state.segments.get_mut(&segment) {
                Some(data) => data.put(key, value),
                None => warn!("[{}] put into missing segment {}", raft_index, segment),
            },
            JournalCommand::Delete { segment, key } => match state.segments.get_mut(&segment) {
                Some(data) => {
                    data.delete(&key);
                }
                None => warn!("[{}] delete from missing segment {}", raft_index, segment),
            },
        }
    }
}

/// Addresses and roles of the group's members.
#[derive(Debug, Clone, Default)]
pub struct MemberBook {
    state: Arc<RwLock<MemberBookState>>,
}

#[derive(Debug, Default)]
struct MemberBookState {
    members: BTreeMap<u64, MemberInfo>,
    max_id: u64,
}

impl MemberBook {
    pub fn new() -> Self {
        MemberBook::default()
    }

    pub fn addr(&self, id: u64) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .members
            .get(&id)
            .map(|m| m.addr.clone())
    }

    pub fn find_by_addr(&self, addr: &str) -> Option<MemberInfo> {
        self.state
            .read()
            .unwrap()
            .members
            .values()
            .find(|m| m.addr == addr)
            .cloned()
    }

    /// Ids of removed members are never handed out again.
    pub fn next_id(&self) -> u64 {
        self.state.read().unwrap().max_id + 1
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.state
            .read()
            .unwrap()
            .members
            .values()
            .cloned()
            .collect()
    }

    /// Known members before the log has been replayed.
    pub fn seed(&self, members: Vec<MemberInfo>) {
        for info in members {
            self.apply(MemberChange::Added(info));
        }
    }

    pub fn get(&self, id: u64) -> Option<MemberInfo> {
        self.state.read().unwrap().members.get(&id).cloned()
    }

    fn apply(&self, change: MemberChange) {
        let mut state = self.state.write().unwrap();
        match change {
            MemberChange::Added(info) => {
                state.max_id = state.max_id.max(info.id);
                state.members.insert(info.id, info);
            }
            MemberChange::Removed(id) => {
                state.max_id = state.max_id.max(id);
                state.members.remove(&id);
            }
        }
    }
}

/// What the raft loop applies committed entries to.
#[derive(Debug, Clone, Default)]
pub struct JournalState {
    pub directory: SegmentDirectory,
    pub members: MemberBook,
}

impl JournalState {
    pub fn new() -> Self {
        JournalState::default()
    }
}

impl StateMachine for JournalState {
    fn apply(&mut self, index: u64, data: &[u8]) {
        let mut state = self.directory.state.write().unwrap();
        match JournalCommand::decode(data) {
            Ok(cmd) => SegmentDirectory::apply_command(&mut state, index, cmd),
            Err(e) => warn!("[{}] undecodable journal command: {}", index, e),
        }
        state.applied = state.applied.max(index);
    }

    fn apply_member_change(&mut self, index: u64, change: MemberChange) {
        info!("[{}] membership change {:?}", index, change);
        self.members.apply(change);
        self.advance(index);
    }

    fn advance(&mut self, index: u64) {
        let mut state = self.directory.state.write().unwrap();
        state.applied = state.applied.max(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(sm: &mut JournalState, index: u64, cmd: JournalCommand) {
        sm.apply(index, &cmd.encode().unwrap());
    }

    fn create(sm: &mut JournalState, index: u64, name: &str) {
        let segment = sm.directory.allocate_index(name).unwrap();
        apply(
            sm,
            index,
            JournalCommand::CreateSegment {
                name: name.to_string(),
                index: segment,
            },
        );
    }

    #[test]
    fn test_indexes_follow_creation_order() {
        let mut sm = JournalState::new();
        for (i, name) in ["0", "1", "2", "9", "10"].iter().enumerate() {
            create(&mut sm, i as u64 + 1, name);
        }
        assert_eq!(sm.directory.indexes(), vec![0, 1, 2, 9, 10]);
        assert_eq!(sm.directory.applied(), 5);

        apply(&mut sm, 6, JournalCommand::RemoveSegment { name: "0".into() });
        apply(&mut sm, 7, JournalCommand::RemoveSegment { name: "1".into() });
        assert_eq!(sm.directory.indexes(), vec![2, 9, 10]);
        assert_eq!(sm.directory.names(), vec!["2", "9", "10"]);
    }

    #[test]
    fn test_named_segments_take_next_index() {
        let mut sm = JournalState::new();
        create(&mut sm, 1, "catalog");
        create(&mut sm, 2, "5");
        create(&mut sm, 3, "tablets");
        assert_eq!(sm.directory.index_of("catalog"), Some(0));
        assert_eq!(sm.directory.index_of("5"), Some(5));
        assert_eq!(sm.directory.index_of("tablets"), Some(6));
    }

    #[test]
    fn test_removed_index_is_never_reused() {
        let mut sm = JournalState::new();
        create(&mut sm, 1, "3");
        apply(&mut sm, 2, JournalCommand::RemoveSegment { name: "3".into() });
        assert!(sm.directory.allocate_index("3").is_err());
        assert!(sm.directory.allocate_index("2").is_err());
        assert_eq!(sm.directory.allocate_index("4"), Ok(4));

        // a replayed stale create is skipped
        apply(
            &mut sm,
            3,
            JournalCommand::CreateSegment {
                name: "old".into(),
                index: 1,
            },
        );
        assert!(sm.directory.indexes().is_empty());
    }

    #[test]
    fn test_max_index_is_rejected() {
        let mut sm = JournalState::new();
        let max = u64::MAX.to_string();
        assert!(sm.directory.allocate_index(&max).is_err());
        assert_eq!(
            sm.directory.allocate_index(&(u64::MAX - 1).to_string()),
            Ok(u64::MAX - 1)
        );

        // an entry already in the log is skipped instead of overflowing
        apply(
            &mut sm,
            1,
            JournalCommand::CreateSegment {
                name: max.clone(),
                index: u64::MAX,
            },
        );
        assert!(sm.directory.indexes().is_empty());
        assert_eq!(sm.directory.applied(), 1);

        create(&mut sm, 2, "catalog");
        assert_eq!(sm.directory.index_of("catalog"), Some(0));
    }

    #[test]
    fn test_records_keep_commit_order() {
        let mut sm = JournalState::new();
        create(&mut sm, 1, "0");
        for (i, key) in [b"b", b"a", b"c"].iter().enumerate() {
            apply(
                &mut sm,
                i as u64 + 2,
                JournalCommand::Put {
                    segment: 0,
                    key: key.to_vec(),
                    value: vec![i as u8],
                },
            );
        }
        apply(
            &mut sm,
            5,
            JournalCommand::Put {
                segment: 0,
                key: b"a".to_vec(),
                value: b"new".to_vec(),
            },
        );
        apply(
            &mut sm,
            6,
            JournalCommand::Delete {
                segment: 0,
                key: b"b".to_vec(),
            },
        );

        let keys: Vec<_> = sm
            .directory
            .records(0)
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(sm.directory.get(0, b"a"), Some(Some(b"new".to_vec())));
        assert_eq!(sm.directory.get(0, b"c"), Some(Some(vec![2])));
        assert_eq!(sm.directory.get(0, b"b"), Some(None));
        assert_eq!(sm.directory.get(1, b"a"), None);
        assert_eq!(sm.directory.count(0), Some(2));
    }

    #[test]
    fn test_member_ids_are_not_reused() {
        let mut sm = JournalState::new();
        let info = |id: u64| MemberInfo {
            id,
            label: format!("follower{}", id),
            addr: format!("127.0.0.1:{}", 9000 + id),
            voter: true,
        };
        sm.apply_member_change(1, MemberChange::Added(info(1)));
        sm.apply_member_change(2, MemberChange::Added(info(2)));
        sm.apply_member_change(3, MemberChange::Removed(2));
        assert_eq!(sm.members.next_id(), 3);
        assert_eq!(sm.members.addr(1).as_deref(), Some("127.0.0.1:9001"));
        assert!(sm.members.find_by_addr("127.0.0.1:9002").is_none());
        assert_eq!(sm.directory.applied(), 3);
    }
}
