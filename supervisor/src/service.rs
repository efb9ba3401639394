//! Client for the child's live-patch endpoint.
//!
//! The child announces its endpoint on stdout or stderr with a line containing
//! [`ANNOUNCE_MARKER`] followed by `host:port`. The supervisor connects once per
//! announcement and speaks newline-delimited JSON-RPC:
//!
//! ```text
//! -> {"id":1,"method":"getExecutionContext"}
//! <- {"id":1,"result":{"context":"main"}}
//! -> {"id":2,"method":"reload","params":{"context":"main"}}
//! <- {"id":2,"result":{"success":true}}
//! ```
//!
//! Callers only ever branch on [`ReloadOutcome::is_success`]; the failure text
//! is diagnostic.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const ANNOUNCE_MARKER: &str = "live-patch service listening on ";

/// Extracts the endpoint address from an announcement line, if the line is one.
pub fn discover_address(line: &str) -> Option<String> {
    let start = line.find(ANNOUNCE_MARKER)? + ANNOUNCE_MARKER.len();
    let token = line[start..].split_whitespace().next()?;
    let token = token.strip_prefix("tcp://").unwrap_or(token);
    let token = token.trim_end_matches('/');
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Code was swapped in place and running state survived.
    Success,
    /// Anything else: rejected, errored, timed out or not connected.
    Failure(String),
}

impl ReloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReloadOutcome::Success)
    }
}

/// The live-patch capability of a running child.
#[async_trait]
pub trait LivePatch: Send {
    async fn reload(&mut self) -> ReloadOutcome;

    /// Releases the connection. Must tolerate repeated calls and broken channels.
    async fn dispose(&mut self) {}
}

/// Turns an announced address into a [`LivePatch`] connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn LivePatch>>;
}

pub struct TcpConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn LivePatch>> {
        let connection =
            RuntimeConnection::open(address, self.connect_timeout, self.request_timeout).await?;
        Ok(Box::new(connection))
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Response {
    /// Absent on notifications, which are skipped.
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

struct Session {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// An open session against one execution context of one child.
pub struct RuntimeConnection {
    address: String,
    context: String,
    /// `None` once disposed or after the channel broke.
    session: Option<Session>,
    next_id: u64,
    request_timeout: Duration,
}

impl RuntimeConnection {
    pub async fn open(
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .with_context(|| format!("Timed out connecting to live-patch service at {address}"))?
            .with_context(|| format!("Failed to connect to live-patch service at {address}"))?;
        let (read, write) = stream.into_split();

        let mut connection = Self {
            address: address.to_string(),
            context: String::new(),
            session: Some(Session {
                reader: BufReader::new(read).lines(),
                writer: write,
            }),
            next_id: 1,
            request_timeout,
        };

        let result = connection.call("getExecutionContext", None).await?;
        connection.context = result
            .get("context")
            .and_then(Value::as_str)
            .context("live-patch service did not report an execution context")?
            .to_string();
        debug!(address, context = %connection.context, "live-patch session established");
        Ok(connection)
    }

    /// One request/response exchange bounded by the request timeout.
    async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        let Some(session) = self.session.as_mut() else {
            bail!("not connected to {}", self.address);
        };

        let id = self.next_id;
        self.next_id += 1;
        let mut line = serde_json::to_string(&Request { id, method, params })?;
        line.push('\n');

        // Outer result: transport. Inner result: an explicit error reply.
        let exchange = async {
            session.writer.write_all(line.as_bytes()).await?;
            session.writer.flush().await?;
            loop {
                let Some(reply) = session.reader.next_line().await? else {
                    bail!("live-patch service closed the connection");
                };
                let response: Response = match serde_json::from_str(reply.trim()) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if response.id != Some(id) {
                    continue;
                }
                let reply: std::result::Result<Value, String> = match response.error {
                    Some(err) => Err(format!("{} (code {})", err.message, err.code)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                return Ok::<_, anyhow::Error>(reply);
            }
        };

        match timeout(self.request_timeout, exchange).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rejected))) => bail!("{method} failed: {rejected}"),
            // The stream is in an unknown state after a transport error or timeout.
            Ok(Err(e)) => {
                self.session = None;
                Err(e)
            }
            Err(_) => {
                self.session = None;
                bail!("{method} timed out after {:?}", self.request_timeout)
            }
        }
    }
}

#[async_trait]
impl LivePatch for RuntimeConnection {
    async fn reload(&mut self) -> ReloadOutcome {
        let params = json!({ "context": self.context });
        match self.call("reload", Some(params)).await {
            Ok(result) if result.get("success").and_then(Value::as_bool) == Some(true) => {
                ReloadOutcome::Success
            }
            Ok(result) => ReloadOutcome::Failure(format!("reload rejected: {result}")),
            Err(e) => ReloadOutcome::Failure(format!("{e:#}")),
        }
    }

    async fn dispose(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.writer.shutdown().await;
            debug!(address = %self.address, "live-patch session closed");
        }
    }
}
