#![allow(clippy::field_reassign_with_default)]

use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use raft::prelude::*;

/// A write waiting to be applied, with the channel reporting its outcome.
pub struct Proposal {
    pub normal: Option<Vec<u8>>,         // encoded journal command
    pub conf_change: Option<ConfChange>, // membership change, context carries the member
    // position of the entry once raft accepted it
    pub proposed: u64,
    pub term: u64,
    pub propose_success: Option<Sender<bool>>,
}

impl Proposal {
    pub fn conf_change(cc: &ConfChange) -> (Self, Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: None,
            conf_change: Some(cc.clone()),
            proposed: 0,
            term: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    pub fn normal(data: Vec<u8>) -> (Self, Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: Some(data),
            conf_change: None,
            proposed: 0,
            term: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    pub fn add_member(id: u64, voter: bool, context: Vec<u8>) -> (Self, Receiver<bool>) {
        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(if voter {
            ConfChangeType::AddNode
        } else {
            ConfChangeType::AddLearnerNode
        });
        cc.context = context.into();
        Self::conf_change(&cc)
    }

    pub fn remove_member(id: u64) -> (Self, Receiver<bool>) {
        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(ConfChangeType::RemoveNode);
        Self::conf_change(&cc)
    }

    pub fn finish(&mut self, success: bool) {
        if let Some(sender) = self.propose_success.take() {
            let _ = sender.send(success);
        }
    }
}
