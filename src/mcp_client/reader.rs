//! Background reader loop.
//!
//! The single consumer of the transport's stdout. Decodes every line and
//! routes responses to the correlator; unsolicited server messages go to an
//! optional bounded channel via `try_send`, so a slow consumer can never
//! stall response routing. Whatever makes the loop exit (end of stream, a
//! read error, or a stop request) it runs `Correlator::fail_all` before the
//! task finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::codec::{self, DecodedMessage};
use super::correlator::Correlator;
use super::errors::McpError;
use super::transport::{ReadOutcome, StdioTransport};
use super::types::ServerMessage;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    EndOfStream,
    ReadError(String),
    Stopped,
}

impl ExitReason {
    pub fn describe(&self) -> String {
        match self {
            ExitReason::EndOfStream => "stream closed".to_string(),
            ExitReason::ReadError(e) => format!("read failed: {e}"),
            ExitReason::Stopped => "session shut down".to_string(),
        }
    }
}

/// Called once, after `fail_all`, when the loop exits.
pub type ExitHook = Box<dyn FnOnce(&ExitReason) + Send + 'static>;

/// Handle to the running loop.
pub struct ReaderLoop {
    handle: JoinHandle<ExitReason>,
    stop: Arc<Notify>,
}

impl ReaderLoop {
    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(
        transport: Arc<StdioTransport>,
        correlator: Arc<Correlator>,
        unsolicited: Option<mpsc::Sender<ServerMessage>>,
        on_exit: Option<ExitHook>,
    ) -> Self {
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(run(
            transport,
            correlator,
            unsolicited,
            on_exit,
            stop.clone(),
        ));
        Self { handle, stop }
    }

    /// Ask the loop to exit. Pending waiters are failed on the way out.
    pub fn stop(&self) {
        // notify_one stores a permit, so this works even if the loop is
        // not currently parked in select!.
        self.stop.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to finish, aborting it if it takes longer than
    /// `timeout`.
    pub async fn join(self, timeout: Duration) -> Option<ExitReason> {
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(reason)) => Some(reason),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "reader loop task failed");
                None
            }
            Err(_) => {
                tracing::warn!("reader loop did not exit in time, aborting");
                abort.abort();
                None
            }
        }
    }
}

async fn run(
    transport: Arc<StdioTransport>,
    correlator: Arc<Correlator>,
    unsolicited: Option<mpsc::Sender<ServerMessage>>,
    on_exit: Option<ExitHook>,
    stop: Arc<Notify>,
) -> ExitReason {
    let server = transport.server_name().to_string();
    tracing::debug!(server = %server, "reader loop started");

    let reason = loop {
        let outcome = tokio::select! {
            _ = stop.notified() => break ExitReason::Stopped,
            outcome = transport.read_line() => outcome,
        };

        let line = match outcome {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::EndOfStream) => break ExitReason::EndOfStream,
            Err(e) => break ExitReason::ReadError(e.to_string()),
        };

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match codec::decode_message(&line) {
            Ok(DecodedMessage::Response { id, outcome }) => {
                let matched = match outcome {
                    Ok(result) => correlator.resolve(id, result),
                    Err(err) => correlator.reject(
                        id,
                        McpError::ProtocolError {
                            code: err.code,
                            message: err.message,
                            data: err.data,
                        },
                    ),
                };
                if !matched {
                    tracing::warn!(server = %server, id, "response for unknown or completed request");
                }
            }
            Ok(DecodedMessage::Unsolicited(msg)) => forward(&server, unsolicited.as_ref(), msg),
            Err(McpError::DecodeError { raw, reason }) => {
                tracing::warn!(server = %server, %reason, line = %raw, "skipping undecodable line");
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "skipping undecodable line");
            }
        }
    };

    let description = reason.describe();
    let failed = correlator.fail_all(&description);
    tracing::info!(
        server = %server,
        reason = %description,
        failed_requests = failed,
        "reader loop exited"
    );

    if let Some(hook) = on_exit {
        hook(&reason);
    }
    reason
}

fn forward(server: &str, unsolicited: Option<&mpsc::Sender<ServerMessage>>, msg: ServerMessage) {
    let method = match &msg {
        ServerMessage::Notification { method, .. } | ServerMessage::Request { method, .. } => {
            method.clone()
        }
    };

    let Some(tx) = unsolicited else {
        tracing::debug!(server, %method, "discarding unsolicited server message");
        return;
    };

    match tx.try_send(msg) {
        Ok(()) => tracing::trace!(server, %method, "forwarded server message"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(server, %method, "notification buffer full, dropping message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(server, %method, "notification receiver gone, dropping message");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
