//! Dstore server
//!
//! A dstore keeps one control connection to the controller (joined with
//! `JOIN <port>`) and listens on its own port for clients and peers:
//!
//! - `STORE name size`: `ACK`, then `size` raw bytes; acknowledged to the
//!   controller with `STORE_ACK name`
//! - `REBALANCE_STORE name size`: same handshake, no controller acknowledgement
//! - `LOAD_DATA name`: the raw bytes, or the connection is closed if absent

use crate::common::protocol::{self, RebalanceInstruction};
use crate::common::{DstoreConfig, Error, NodeId, Result};
use crate::dstore::store::FileStore;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Lines queued for the control connection by peer and rebalance tasks
type ControlQueue = mpsc::Sender<String>;

pub struct Dstore {
    config: DstoreConfig,
    listener: TcpListener,
    port: NodeId,
    store: FileStore,
}

impl Dstore {
    /// Bind the listening port and open (clearing) the data directory.
    pub async fn bind(config: DstoreConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();
        let store = FileStore::open(&config.data_dir).await?;
        Ok(Self {
            config,
            listener,
            port,
            store,
        })
    }

    /// Listening port, which is also this dstore's identity.
    pub fn port(&self) -> NodeId {
        self.port
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Join the controller and serve until the control connection closes.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting dstore on port {}", self.port);
        tracing::info!("  Controller port: {}", self.config.controller_port);
        tracing::info!("  Data path: {}", self.store.root().display());

        let control = TcpStream::connect(("127.0.0.1", self.config.controller_port)).await?;
        control.set_nodelay(true)?;
        let (read_half, mut writer) = control.into_split();
        protocol::write_line(&mut writer, &format!("{} {}", protocol::JOIN, self.port)).await?;
        let mut commands = BufReader::new(read_half).lines();

        let (queue, mut outgoing) = mpsc::channel::<String>(64);
        tracing::info!("✓ Dstore {} joined", self.port);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = self.store.clone();
                        let queue = queue.clone();
                        let timeout = self.config.timeout();
                        tokio::spawn(async move {
                            if let Err(e) = serve_peer(stream, store, queue, timeout).await {
                                tracing::debug!("Peer {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                Some(line) = outgoing.recv() => {
                    protocol::write_line(&mut writer, &line).await?;
                }
                line = commands.next_line() => match line? {
                    Some(line) => self.handle_command(&line, &mut writer, &queue).await?,
                    None => {
                        tracing::warn!("Controller closed the connection");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle_command<W>(&self, line: &str, writer: &mut W, queue: &ControlQueue) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        tracing::debug!("Controller -> {}", line);
        let mut words = line.split_whitespace();
        match words.next() {
            Some(protocol::LIST) => {
                let names = self.store.list().await?;
                protocol::write_line(writer, &protocol::list_line(&names)).await
            }
            Some(protocol::REMOVE) => {
                let Some(name) = words.next() else {
                    tracing::warn!("REMOVE without a file name");
                    return Ok(());
                };
                let reply = match self.store.remove(name).await {
                    Ok(true) => format!("{} {}", protocol::REMOVE_ACK, name),
                    Ok(false) => format!("{} {}", protocol::ERROR_FILE_DOES_NOT_EXIST, name),
                    Err(e) => {
                        tracing::error!("Failed to remove {}: {}", name, e);
                        return Ok(());
                    }
                };
                protocol::write_line(writer, &reply).await
            }
            Some(protocol::REBALANCE) => {
                let instruction = match RebalanceInstruction::parse(line) {
                    Ok(instruction) => instruction,
                    Err(e) => {
                        tracing::warn!("Ignoring rebalance instruction: {}", e);
                        return Ok(());
                    }
                };
                // Pushes wait on peers, which may be pushing back to us.
                let store = self.store.clone();
                let queue = queue.clone();
                let timeout = self.config.timeout();
                tokio::spawn(async move {
                    match execute_rebalance(&instruction, &store, timeout).await {
                        Ok(()) => {
                            report(&queue, protocol::REBALANCE_COMPLETE.to_string()).await;
                        }
                        Err(e) => tracing::error!("Rebalance instruction failed: {}", e),
                    }
                });
                Ok(())
            }
            Some(other) => {
                tracing::warn!("Unknown controller command: {}", other);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Queue a line for the controller. Returns false once the control
/// connection is gone.
async fn report(queue: &ControlQueue, line: String) -> bool {
    match queue.send(line).await {
        Ok(()) => true,
        Err(mpsc::error::SendError(line)) => {
            tracing::warn!("Control connection gone, dropping {:?}", line);
            false
        }
    }
}

/// Push every listed file to its destinations, then delete the evicted ones.
/// Nothing is deleted if a push fails.
async fn execute_rebalance(
    instruction: &RebalanceInstruction,
    store: &FileStore,
    timeout: Duration,
) -> Result<()> {
    for push in &instruction.pushes {
        let data = store
            .get(&push.name)
            .await?
            .ok_or_else(|| Error::FileDoesNotExist(push.name.clone()))?;
        for dest in &push.destinations {
            push_to(*dest, &push.name, &data, timeout).await?;
            tracing::debug!("Pushed {} to dstore {}", push.name, dest);
        }
    }

    for name in &instruction.removals {
        if !store.remove(name).await? {
            tracing::debug!("Evicted {} was already gone", name);
        }
    }
    Ok(())
}

async fn push_to(dest: NodeId, name: &str, data: &[u8], timeout: Duration) -> Result<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", dest)))
        .await
        .map_err(|_| Error::Timeout(format!("connect to dstore {}", dest)))??;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    protocol::write_line(
        &mut writer,
        &format!("{} {} {}", protocol::REBALANCE_STORE, name, data.len()),
    )
    .await?;
    expect_ack(&mut reader, timeout, dest).await?;

    writer.write_all(data).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Wait for the `ACK` that opens a payload transfer.
pub(crate) async fn expect_ack<R>(reader: &mut R, timeout: Duration, peer: NodeId) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let line = tokio::time::timeout(timeout, protocol::read_line(reader))
        .await
        .map_err(|_| Error::Timeout(format!("ACK from dstore {}", peer)))??
        .ok_or(Error::ConnectionClosed)?;
    if line != protocol::ACK {
        return Err(Error::UnexpectedReply {
            peer: format!("dstore {}", peer),
            line,
        });
    }
    Ok(())
}

async fn serve_peer(
    stream: TcpStream,
    store: FileStore,
    queue: ControlQueue,
    timeout: Duration,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let line = match tokio::time::timeout(timeout, protocol::read_line(&mut reader)).await {
            Ok(line) => line?,
            Err(_) => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };

        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(token @ (protocol::STORE | protocol::REBALANCE_STORE)), Some(name), Some(size)) => {
                let size: u64 = size
                    .parse()
                    .map_err(|_| Error::Protocol(format!("invalid size in: {}", line)))?;
                protocol::write_line(&mut writer, protocol::ACK).await?;

                tokio::time::timeout(timeout, store.put_stream(name, &mut reader, size))
                    .await
                    .map_err(|_| Error::Timeout(format!("payload of {}", name)))??;
                tracing::debug!("Stored {} ({} bytes)", name, size);

                if token == protocol::STORE {
                    report(&queue, format!("{} {}", protocol::STORE_ACK, name)).await;
                }
            }
            (Some(protocol::LOAD_DATA), Some(name), None) => match store.get(name).await? {
                Some(data) => {
                    writer.write_all(&data).await?;
                    writer.flush().await?;
                }
                None => {
                    tracing::debug!("LOAD_DATA for missing {}", name);
                    return Ok(());
                }
            },
            _ => tracing::warn!("Unknown peer request: {}", line),
        }
    }
}
