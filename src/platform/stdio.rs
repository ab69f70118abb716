//! NDJSON bridge to an external platform adapter.
//!
//! Inbound [`PlatformEvent`]s arrive one per line on stdin; outbound calls are
//! written one per line to stdout, e.g.
//! `{"call":"post_message","channel":"C1","thread_ts":"1.2","ts":"...","message":{...}}`.
//! Message ts values for posted messages are assigned here.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::{ChatPlatform, Message, Modal, PlatformEvent};

#[derive(Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
enum OutboundCall<'a> {
    PostMessage {
        channel: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_ts: Option<&'a str>,
        ts: &'a str,
        message: &'a Message,
    },
    UpdateMessage {
        channel: &'a str,
        ts: &'a str,
        message: &'a Message,
    },
    OpenModal {
        trigger_id: &'a str,
        modal: &'a Modal,
    },
}

pub struct StdioGateway<W> {
    out: Mutex<W>,
    seq: AtomicU64,
}

impl StdioGateway<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> StdioGateway<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            seq: AtomicU64::new(0),
        }
    }

    fn next_ts(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{seq:06}", Utc::now().timestamp())
    }

    async fn emit(&self, call: &OutboundCall<'_>) -> Result<()> {
        let line = serde_json::to_string(call)?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await.context("failed to flush gateway output")
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChatPlatform for StdioGateway<W> {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        message: &Message,
    ) -> Result<String> {
        let ts = self.next_ts();
        self.emit(&OutboundCall::PostMessage {
            channel,
            thread_ts,
            ts: &ts,
            message,
        })
        .await?;
        Ok(ts)
    }

    async fn update_message(&self, channel: &str, ts: &str, message: &Message) -> Result<()> {
        self.emit(&OutboundCall::UpdateMessage {
            channel,
            ts,
            message,
        })
        .await
    }

    async fn open_modal(&self, trigger_id: &str, modal: &Modal) -> Result<()> {
        self.emit(&OutboundCall::OpenModal { trigger_id, modal }).await
    }
}

/// Parse one inbound line. Blank lines yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<PlatformEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("invalid platform event")?;
    Ok(Some(event))
}

/// Read events from `reader` until EOF. The channel closes at EOF.
pub fn read_events<R>(reader: R) -> mpsc::UnboundedReceiver<PlatformEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_event_line(&line) {
                    Ok(Some(event)) => {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %format!("{e:#}"), "skipping platform event line"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "platform input read failed");
                    break;
                }
            }
        }
        debug!("platform input closed");
    });
    rx
}
