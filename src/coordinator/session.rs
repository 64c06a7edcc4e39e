//! Per-connection sessions
//!
//! The first line decides what a connection is: `JOIN <port>` makes it a
//! dstore's control connection for the rest of its life, anything else makes
//! it a client session. Client lines are parsed by a reader task into a
//! bounded inbox and dispatched one at a time.

use crate::common::protocol::{self, NodeReply, Request};
use crate::common::NodeId;
use crate::coordinator::links::{BoxedWriter, NodeLink};
use crate::coordinator::state::Coordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Serve one accepted connection until it closes.
pub async fn serve_connection(coordinator: Arc<Coordinator>, stream: TcpStream, peer: SocketAddr) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let first = match protocol::read_line(&mut reader).await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!("Connection from {} failed before its first line: {}", peer, e);
            return;
        }
    };

    match Request::parse(&first) {
        Ok(Request::Join(port)) => {
            serve_dstore(coordinator, port, reader, Box::new(write_half), peer).await;
        }
        Ok(request) => {
            serve_client(coordinator, Some(request), reader, write_half, peer).await;
        }
        Err(e) => {
            tracing::warn!("Bad request from {}: {}", peer, e);
            serve_client(coordinator, None, reader, write_half, peer).await;
        }
    }
}

async fn serve_dstore<R>(
    coordinator: Arc<Coordinator>,
    port: NodeId,
    mut reader: R,
    writer: BoxedWriter,
    peer: SocketAddr,
) where
    R: AsyncBufRead + Unpin,
{
    let link = Arc::new(NodeLink::new(port, writer));
    {
        let _permit = coordinator.gate.enter_critical().await;
        coordinator.join(link.clone());
    }

    loop {
        let line = match protocol::read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Dstore {} ({}) read failed: {}", port, peer, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match NodeReply::parse(&line) {
            Ok(reply) => {
                if let Err(reply) = link.deliver(reply) {
                    tracing::warn!("Dstore {}: unmatched reply {:?}", port, reply);
                }
            }
            Err(e) => tracing::warn!("Dstore {}: protocol violation: {}", port, e),
        }
    }

    coordinator.disconnect(&link);
}

async fn serve_client<R, W>(
    coordinator: Arc<Coordinator>,
    first: Option<Request>,
    reader: R,
    mut writer: W,
    peer: SocketAddr,
) where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (tx, mut inbox) = mpsc::channel(coordinator.config().inbox_capacity);
    let reader_task = tokio::spawn(read_requests(reader, tx, peer));

    let mut next = first;
    loop {
        let request = match next.take() {
            Some(request) => request,
            None => match inbox.recv().await {
                Some(request) => request,
                None => break,
            },
        };
        tracing::debug!("{} -> {:?}", peer, request);
        next = coordinator.dispatch(request, &mut writer, &mut inbox).await;
    }

    reader_task.abort();
    tracing::debug!("Client {} disconnected", peer);
}

/// Parse client lines into the inbox; a full inbox stalls reading.
async fn read_requests<R>(mut reader: R, tx: mpsc::Sender<Request>, peer: SocketAddr)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = match protocol::read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("Client {} read failed: {}", peer, e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Request::parse(&line) {
            Ok(request) => {
                if tx.send(request).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("Bad request from {}: {}", peer, e),
        }
    }
}
