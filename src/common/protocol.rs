//! Line-oriented wire protocol shared by the controller, dstores and clients
//!
//! Every message is a single ASCII line terminated by `\n`. Payload bytes
//! follow `STORE`, `REBALANCE_STORE` and `LOAD_DATA` exchanges raw, with the
//! length announced in the preceding line.

use crate::common::{Error, NodeId, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const JOIN: &str = "JOIN";
pub const STORE: &str = "STORE";
pub const STORE_TO: &str = "STORE_TO";
pub const STORE_ACK: &str = "STORE_ACK";
pub const STORE_COMPLETE: &str = "STORE_COMPLETE";
pub const LOAD: &str = "LOAD";
pub const LOAD_FROM: &str = "LOAD_FROM";
pub const LOAD_DATA: &str = "LOAD_DATA";
pub const RELOAD: &str = "RELOAD";
pub const REMOVE: &str = "REMOVE";
pub const REMOVE_ACK: &str = "REMOVE_ACK";
pub const REMOVE_COMPLETE: &str = "REMOVE_COMPLETE";
pub const LIST: &str = "LIST";
pub const REBALANCE: &str = "REBALANCE";
pub const REBALANCE_STORE: &str = "REBALANCE_STORE";
pub const REBALANCE_COMPLETE: &str = "REBALANCE_COMPLETE";
pub const ACK: &str = "ACK";

pub const ERROR_NOT_ENOUGH_DSTORES: &str = "ERROR_NOT_ENOUGH_DSTORES";
pub const ERROR_FILE_ALREADY_EXISTS: &str = "ERROR_FILE_ALREADY_EXISTS";
pub const ERROR_FILE_DOES_NOT_EXIST: &str = "ERROR_FILE_DOES_NOT_EXIST";
pub const ERROR_LOAD: &str = "ERROR_LOAD";

/// A line received by the controller on a session before it is known to be a dstore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join(NodeId),
    Store { name: String, size: u64 },
    Load(String),
    Reload(String),
    Remove(String),
    List,
    Unknown(String),
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let token = words
            .next()
            .ok_or_else(|| Error::Protocol("empty request".into()))?;

        let request = match token {
            JOIN => Request::Join(parse_port(words.next(), line)?),
            STORE => {
                let name = parse_name(words.next(), line)?;
                let size = parse_number(words.next(), line)?;
                Request::Store { name, size }
            }
            LOAD => Request::Load(parse_name(words.next(), line)?),
            RELOAD => Request::Reload(parse_name(words.next(), line)?),
            REMOVE => Request::Remove(parse_name(words.next(), line)?),
            LIST => Request::List,
            other => return Ok(Request::Unknown(other.to_string())),
        };

        if words.next().is_some() {
            return Err(Error::Protocol(format!("trailing arguments in: {}", line)));
        }
        Ok(request)
    }

    /// Requests that change placement and must not overlap a rebalance.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Request::Join(_) | Request::Store { .. } | Request::Remove(_)
        )
    }
}

/// A line sent by a dstore on its control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeReply {
    StoreAck(String),
    RemoveAck(String),
    RemoveMissing(String),
    List(Vec<String>),
    RebalanceComplete,
}

impl NodeReply {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let token = words
            .next()
            .ok_or_else(|| Error::Protocol("empty reply".into()))?;

        match token {
            STORE_ACK => Ok(NodeReply::StoreAck(parse_name(words.next(), line)?)),
            REMOVE_ACK => Ok(NodeReply::RemoveAck(parse_name(words.next(), line)?)),
            ERROR_FILE_DOES_NOT_EXIST => {
                Ok(NodeReply::RemoveMissing(parse_name(words.next(), line)?))
            }
            LIST => Ok(NodeReply::List(words.map(str::to_string).collect())),
            REBALANCE_COMPLETE => Ok(NodeReply::RebalanceComplete),
            other => Err(Error::Protocol(format!("unknown dstore reply: {}", other))),
        }
    }
}

/// One file a dstore must copy to other dstores during a rebalance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePush {
    pub name: String,
    pub size: u64,
    pub destinations: Vec<NodeId>,
}

/// Combined push/evict instruction sent to one dstore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceInstruction {
    pub pushes: Vec<FilePush>,
    pub removals: Vec<String>,
}

impl RebalanceInstruction {
    /// `REBALANCE <k> (<name> <size> <m> <port>*)×k <j> <name>×j`
    pub fn encode(&self) -> String {
        let mut parts = vec![REBALANCE.to_string(), self.pushes.len().to_string()];
        for push in &self.pushes {
            parts.push(push.name.clone());
            parts.push(push.size.to_string());
            parts.push(push.destinations.len().to_string());
            parts.extend(push.destinations.iter().map(|port| port.to_string()));
        }
        parts.push(self.removals.len().to_string());
        parts.extend(self.removals.iter().cloned());
        parts.join(" ")
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        if words.next() != Some(REBALANCE) {
            return Err(Error::Protocol(format!("not a rebalance line: {}", line)));
        }

        let push_count: usize = parse_number(words.next(), line)?;
        let mut pushes = Vec::with_capacity(push_count);
        for _ in 0..push_count {
            let name = parse_name(words.next(), line)?;
            let size = parse_number(words.next(), line)?;
            let dest_count: usize = parse_number(words.next(), line)?;
            let destinations = (0..dest_count)
                .map(|_| parse_port(words.next(), line))
                .collect::<Result<Vec<_>>>()?;
            pushes.push(FilePush {
                name,
                size,
                destinations,
            });
        }

        let removal_count: usize = parse_number(words.next(), line)?;
        let removals = (0..removal_count)
            .map(|_| parse_name(words.next(), line))
            .collect::<Result<Vec<_>>>()?;

        if words.next().is_some() {
            return Err(Error::Protocol(format!("trailing arguments in: {}", line)));
        }
        Ok(Self { pushes, removals })
    }
}

fn parse_name(word: Option<&str>, line: &str) -> Result<String> {
    word.map(str::to_string)
        .ok_or_else(|| Error::Protocol(format!("missing file name in: {}", line)))
}

fn parse_number<T: std::str::FromStr>(word: Option<&str>, line: &str) -> Result<T> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("missing or invalid number in: {}", line)))
}

fn parse_port(word: Option<&str>, line: &str) -> Result<NodeId> {
    parse_number(word, line)
}

/// Write one protocol line and flush it.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one protocol line; `None` at end of stream.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Format a `LIST` response; an empty listing is the bare token.
pub fn list_line(names: &[String]) -> String {
    if names.is_empty() {
        LIST.to_string()
    } else {
        format!("{} {}", LIST, names.join(" "))
    }
}
