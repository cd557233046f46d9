//! Inbound side of the replication endpoint: accepts peer connections and
//! hands raft messages and join/probe requests to the group node.

use std::net::SocketAddr;
use std::sync::Arc;

use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::node::GroupShared;
use crate::protocol::{read_frame, write_frame, Frame};

/// A bound listener serving one group node.
pub struct RaftService {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl RaftService {
    /// One attempt to bind the replication endpoint.
    pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    pub fn serve(listener: TcpListener, shared: Arc<GroupShared>) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("[{}] accepted connection from {}", shared.label, peer);
                            connections.spawn(handle_connection(stream, shared.clone()));
                        }
                        Err(e) => log::warn!("[{}] accept failed: {}", shared.label, e),
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
            connections.abort_all();
            while connections.join_next().await.is_some() {}
            log::info!("[{}] stopped listening", shared.label);
        });
        log::info!("replication endpoint listening on {}", local_addr);

        Ok(RaftService {
            local_addr,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listener and every inbound connection.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

async fn handle_connection(mut stream: TcpStream, shared: Arc<GroupShared>) {
    let _ = stream.set_nodelay(true);
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(Frame::Raft(bytes))) => match RaftMessage::parse_from_bytes(&bytes) {
                Ok(message) => shared.deliver(message),
                Err(e) => log::warn!("raft parse error: {}", e),
            },
            Ok(Some(request)) => {
                let reply = shared.handle_request(request).await;
                if let Err(e) = write_frame(&mut stream, &reply).await {
                    log::debug!("[{}] reply failed: {}", shared.label, e);
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                log::debug!("[{}] connection dropped: {}", shared.label, e);
                return;
            }
        }
    }
}
