//! Client library
//!
//! Talks to the controller over one persistent connection and moves file
//! contents directly to and from dstores.

use crate::common::protocol;
use crate::common::{Error, NodeId, Result};
use crate::dstore::server::expect_ack;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl Client {
    pub async fn connect(controller_port: u16, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", controller_port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
            timeout,
        })
    }

    async fn request(&mut self, line: &str) -> Result<()> {
        protocol::write_line(&mut self.writer, line).await
    }

    async fn reply(&mut self, name: &str) -> Result<String> {
        let line = tokio::time::timeout(self.timeout, protocol::read_line(&mut self.reader))
            .await
            .map_err(|_| Error::Timeout(format!("controller reply for {}", name)))??
            .ok_or(Error::ConnectionClosed)?;
        match Error::from_wire_token(&line, name) {
            Some(e) => Err(e),
            None => Ok(line),
        }
    }

    /// Upload `data` as `name` to every dstore the controller picks.
    pub async fn store(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.request(&format!("{} {} {}", protocol::STORE, name, data.len()))
            .await?;

        let line = self.reply(name).await?;
        let mut words = line.split_whitespace();
        if words.next() != Some(protocol::STORE_TO) {
            return Err(unexpected(line));
        }
        let ports = words
            .map(|w| w.parse::<NodeId>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::Protocol(format!("bad STORE_TO line: {}", line)))?;

        let timeout = self.timeout;
        let uploads = ports.iter().map(|port| upload(*port, name, data, timeout));
        for (port, result) in ports.iter().zip(join_all(uploads).await) {
            if let Err(e) = result {
                tracing::warn!("Upload of {} to dstore {} failed: {}", name, port, e);
                return Err(e);
            }
        }

        let line = self.reply(name).await?;
        if line != protocol::STORE_COMPLETE {
            return Err(unexpected(line));
        }
        Ok(())
    }

    /// Download `name`, moving on to the next replica when one fails.
    pub async fn load(&mut self, name: &str) -> Result<Vec<u8>> {
        self.request(&format!("{} {}", protocol::LOAD, name)).await?;
        loop {
            let line = self.reply(name).await?;
            let mut words = line.split_whitespace();
            let (Some(protocol::LOAD_FROM), Some(port), Some(size), None) =
                (words.next(), words.next(), words.next(), words.next())
            else {
                return Err(unexpected(line));
            };
            let (Ok(port), Ok(size)) = (port.parse::<NodeId>(), size.parse::<u64>()) else {
                return Err(Error::Protocol(format!("bad LOAD_FROM line: {}", line)));
            };

            match download(port, name, size, self.timeout).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    tracing::debug!("Load of {} from dstore {} failed: {}", name, port, e);
                    self.request(&format!("{} {}", protocol::RELOAD, name)).await?;
                }
            }
        }
    }

    pub async fn remove(&mut self, name: &str) -> Result<()> {
        self.request(&format!("{} {}", protocol::REMOVE, name)).await?;
        let line = self.reply(name).await?;
        if line != protocol::REMOVE_COMPLETE {
            return Err(unexpected(line));
        }
        Ok(())
    }

    pub async fn list(&mut self) -> Result<Vec<String>> {
        self.request(protocol::LIST).await?;
        let line = self.reply("list").await?;
        let mut words = line.split_whitespace();
        if words.next() != Some(protocol::LIST) {
            return Err(unexpected(line));
        }
        Ok(words.map(str::to_string).collect())
    }
}

fn unexpected(line: String) -> Error {
    Error::UnexpectedReply {
        peer: "controller".into(),
        line,
    }
}

async fn upload(port: NodeId, name: &str, data: &[u8], timeout: Duration) -> Result<()> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    protocol::write_line(&mut writer, &format!("{} {} {}", protocol::STORE, name, data.len())).await?;
    expect_ack(&mut reader, timeout, port).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Fetch `name` from a dstore. The buffer grows with the bytes that
/// actually arrive, never with the announced size.
async fn download(port: NodeId, name: &str, size: u64, timeout: Duration) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    protocol::write_line(&mut stream, &format!("{} {}", protocol::LOAD_DATA, name)).await?;

    let mut data = Vec::new();
    let received = tokio::time::timeout(timeout, (&mut stream).take(size).read_to_end(&mut data))
        .await
        .map_err(|_| Error::Timeout(format!("download of {} from dstore {}", name, port)))??;
    if received as u64 != size {
        return Err(Error::Protocol(format!(
            "dstore {} sent {} of {} bytes of {}",
            port, received, size, name
        )));
    }
    Ok(data)
}
