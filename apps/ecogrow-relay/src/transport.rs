//! Outbound half of a relay connection.
//!
//! Every socket gets a bounded frame queue drained by its own writer task, so
//! routing code only ever performs a non-blocking `try_send`. The receiving end
//! of the queue doubles as an in-memory transport in tests.

use std::borrow::Cow;
use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY: u16 = 1008;
/// Application close code sent to a controller replaced by a newer connection.
pub const CLOSE_SUPERSEDED: u16 = 4001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: &'static str },
}

/// Cloneable handle used to push frames towards one socket.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl Outbox {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)?;
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(Frame::Text(text)).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Queue a close frame and signal both halves of the connection to stop.
    /// Calling it more than once is a no-op.
    pub fn close(&self, code: u16, reason: &'static str) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.tx.try_send(Frame::Close { code, reason });
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Drain `frames` into the websocket sink, pinging the peer every `heartbeat`.
/// A failed write counts as closure of the whole connection.
pub fn spawn_writer<S>(
    mut sink: S,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    heartbeat: Duration,
    label: String,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(Frame::Text(text)) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!(connection = %label, error = %err, "write failed; closing connection");
                            break;
                        }
                    }
                    Some(Frame::Close { code, reason }) => {
                        let _ = sink.send(close_message(code, reason)).await;
                        break;
                    }
                    None => break,
                },
                _ = closed.cancelled() => {
                    let _ = sink.send(close_message(CLOSE_NORMAL, "closed")).await;
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                        warn!(connection = %label, error = %err, "keep-alive ping failed; closing connection");
                        break;
                    }
                }
            }
        }

        closed.cancel();
        let _ = sink.close().await;
        debug!(connection = %label, "writer task finished");
    })
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}
