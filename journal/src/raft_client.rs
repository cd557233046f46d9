//! Outbound raft traffic
//!
//! One queue and one TCP stream per peer for raft messages, plus one-shot
//! request/response calls used while joining.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time;

use crate::directory::MemberBook;
use crate::error::{JournalError, Result};
use crate::protocol::{read_frame, write_frame, Frame};

const PEER_QUEUE_SIZE: usize = 1000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

struct PeerClient {
    sender: Sender<Frame>,
    // set once the stream broke; the next message reconnects
    invalid: Arc<AtomicBool>,
    addr: String,
    task: JoinHandle<()>,
}

impl PeerClient {
    /// The connection is established by a background task, so a peer that is
    /// down only costs the messages queued for it.
    fn new(addr: String) -> Self {
        let (sender, receiver) = mpsc::channel(PEER_QUEUE_SIZE);
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        let target = addr.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(&target, receiver).await {
                log::debug!("Streaming messages to {} failed: {}", target, e);
            }
            invalid_clone.store(true, Ordering::SeqCst);
        });

        Self {
            sender,
            invalid,
            addr,
            task,
        }
    }

    async fn stream_messages(addr: &str, mut receiver: Receiver<Frame>) -> std::io::Result<()> {
        let mut stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        stream.set_nodelay(true)?;
        while let Some(frame) = receiver.recv().await {
            write_frame(&mut stream, &frame).await?;
        }
        Ok(())
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Routes raft messages to peers by id, resolving addresses in the member book.
pub struct RaftClient {
    /// Map of peer IDs to their respective clients
    peers: HashMap<u64, PeerClient>,
    members: MemberBook,
}

impl RaftClient {
    pub fn new(members: MemberBook) -> RaftClient {
        RaftClient {
            peers: HashMap::new(),
            members,
        }
    }

    /// Queues `data` for its target. A peer whose stream broke or whose
    /// address changed gets a fresh client; a full queue drops the message
    /// and raft retransmits.
    pub fn post_data(&mut self, data: RaftMessage) {
        let addr = match self.members.addr(data.to) {
            Some(addr) => addr,
            None => {
                log::debug!("no address for peer {}, drop message", data.to);
                return;
            }
        };

        let stale = self
            .peers
            .get(&data.to)
            .map(|peer| peer.invalid.load(Ordering::SeqCst) || peer.addr != addr)
            .unwrap_or(false);
        if stale {
            self.peers.remove(&data.to);
        }

        let peer_client = self
            .peers
            .entry(data.to)
            .or_insert_with(|| PeerClient::new(addr));

        let bytes = match data.write_to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode raft message: {}", e);
                return;
            }
        };
        if peer_client.sender.try_send(Frame::Raft(bytes)).is_err() {
            log::debug!("queue to peer {} is full, drop message", data.to);
        }
    }

    /// Forwards the raft loop's outgoing messages until the loop stops.
    pub fn spawn_dispatcher(mut self, mut out_mailbox: Receiver<RaftMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = out_mailbox.recv().await {
                self.post_data(msg);
            }
        })
    }
}

/// Sends one request frame to `addr` and waits for the reply.
pub async fn call(addr: &str, request: &Frame) -> Result<Frame> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    };
    match time::timeout(CALL_TIMEOUT, exchange).await {
        Ok(Ok(Some(Frame::Error(reason)))) => Err(JournalError::Protocol(reason)),
        Ok(Ok(Some(reply))) => Ok(reply),
        Ok(Ok(None)) => Err(JournalError::Protocol(format!(
            "{} closed the connection without replying",
            addr
        ))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(JournalError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no reply from {}", addr),
        ))),
    }
}
