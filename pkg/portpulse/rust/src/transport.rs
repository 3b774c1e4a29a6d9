// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Loopback TCP messaging between hub processes.
//!
//! One message per connection: the sender connects, writes, closes. The
//! receiver reads until EOF, the buffer limit or the read timeout, whichever
//! comes first, so oversized messages are truncated. There is no framing
//! beyond that.

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: String,
    pub sender_pid: Option<u32>,
}

/// Wire form used when the sender is known.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    sender_pid: u32,
    payload: String,
}

impl Message {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            sender_pid: None,
        }
    }

    pub fn from_pid(sender_pid: u32, payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            sender_pid: Some(sender_pid),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self.sender_pid {
            Some(pid) => serde_json::to_vec(&Envelope {
                sender_pid: pid,
                payload: self.payload.clone(),
            })
            .unwrap_or_else(|_| self.payload.clone().into_bytes()),
            None => self.payload.clone().into_bytes(),
        }
    }

    /// Invalid UTF-8 is replaced, anything that is not an envelope is taken
    /// as a raw payload.
    pub fn decode(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        match serde_json::from_str::<Envelope>(&text) {
            Ok(env) => Self::from_pid(env.sender_pid, env.payload),
            Err(_) => Self::new(text),
        }
    }
}

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<u16>,
    pub failed: Vec<(u16, HubError)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Transport {
    host: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    buffer_size: usize,
}

impl Transport {
    pub fn new(connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            host: LOOPBACK.to_string(),
            connect_timeout,
            read_timeout: connect_timeout,
            buffer_size,
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.connect_timeout, config.buffer_size)
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bind the inbound listener. Port 0 picks an ephemeral port.
    pub async fn bind(&self, port: u16) -> Result<Listener> {
        let inner = TcpListener::bind((self.host.as_str(), port))
            .await
            .map_err(|source| HubError::BindError { port, source })?;
        let port = inner.local_addr()?.port();
        Ok(Listener {
            inner,
            port,
            buffer_size: self.buffer_size,
            read_timeout: self.read_timeout,
        })
    }

    pub async fn send(&self, port: u16, message: &Message) -> Result<()> {
        self.send_to(&self.host, port, message).await
    }

    /// Fire-and-forget delivery: connect, write, close.
    pub async fn send_to(&self, host: &str, port: u16, message: &Message) -> Result<()> {
        let failed = |reason: String| HubError::SendFailed {
            host: host.to_string(),
            port,
            reason,
        };

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect((host, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(HubError::ConnectionRefused {
                    host: host.to_string(),
                    port,
                });
            }
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => {
                return Err(failed(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                )));
            }
        };

        let bytes = message.encode();
        let write = async {
            stream.write_all(&bytes).await?;
            stream.flush().await?;
            stream.shutdown().await
        };
        match timeout(self.connect_timeout, write).await {
            Ok(Ok(())) => {
                debug!("sent {} bytes to {host}:{port}", bytes.len());
                Ok(())
            }
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed("write timed out".to_string())),
        }
    }

    /// Sequential best-effort delivery to every port.
    pub async fn broadcast(&self, ports: &[u16], message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for &port in ports {
            match self.send(port, message).await {
                Ok(()) => report.delivered.push(port),
                Err(e) => report.failed.push((port, e)),
            }
        }
        report
    }
}

pub struct Listener {
    inner: TcpListener,
    port: u16,
    buffer_size: usize,
    read_timeout: Duration,
}

impl Listener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept connections until `token` is cancelled, handing each decoded
    /// message to `on_message`.
    pub async fn serve<F>(self, mut on_message: F, token: CancellationToken) -> Result<()>
    where
        F: FnMut(Message),
    {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.inner.accept() => accepted,
            };
            let (mut stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept on port {} failed: {e}", self.port);
                    continue;
                }
            };
            // a slow peer must not hold up shutdown
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = read_bounded(&mut stream, self.buffer_size, self.read_timeout) => read,
            };
            match read {
                Ok(bytes) if bytes.is_empty() => debug!("empty connection from {peer}"),
                Ok(bytes) => on_message(Message::decode(&bytes)),
                Err(e) => warn!("read from {peer} failed: {e}"),
            }
        }
        debug!("listener on port {} stopping", self.port);
        Ok(())
    }
}

/// Read until EOF or `limit` bytes. A peer that stalls past `deadline` gets
/// whatever it sent so far.
async fn read_bounded(
    stream: &mut TcpStream,
    limit: usize,
    deadline: Duration,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    let read_all = async {
        while filled < limit {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok::<(), io::Error>(())
    };
    let outcome = timeout(deadline, read_all).await;
    match outcome {
        Ok(Ok(())) => {}
        // a reset after some bytes still yields a message
        Ok(Err(e)) if filled == 0 => return Err(e),
        Ok(Err(e)) => debug!("read ended early: {e}"),
        Err(_) => debug!("read timed out after {}ms", deadline.as_millis()),
    }
    buf.truncate(filled);
    Ok(buf)
}
