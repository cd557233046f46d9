use crate::command::MemberInfo;

mod log_file;
pub mod node;
pub mod proposal;
pub mod storage;

pub use node::{GroupStatus, LogProbe, RaftHandle};

/// A committed change of the group's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberChange {
    Added(MemberInfo),
    Removed(u64),
}

pub trait StateMachine {
    fn apply(&mut self, index: u64, data: &[u8]);
    fn apply_member_change(&mut self, index: u64, change: MemberChange);
    /// Entries without payload still move the applied index.
    fn advance(&mut self, index: u64);
}
