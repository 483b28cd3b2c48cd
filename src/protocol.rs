//! Request/response client for the KEL103 text protocol.
//!
//! Frames are the command text followed by a single LF byte, one frame per datagram.
//! Queries (`:NAME?`, `*IDN?`) expect one reply datagram; actions expect nothing.
//!
//! The link drops datagrams silently, so [`ProtocolClient::query`] resends the same
//! frame until a reply arrives or the [`QueryPolicy`] ceiling expires. There are no
//! correlation ids: with a single query in flight the first non-empty reply answers it.

use crate::error::{AppResult, DaqError};
use crate::transport::Transport;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Line terminator appended to every frame.
pub const LINE_FEED: u8 = 0x0A;

/// Timing of a query: how long one attempt waits and how long the whole query may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    /// Receive timeout of one attempt.
    pub attempt_timeout: Duration,
    /// Upper bound on the total time spent on one query.
    pub ceiling: Duration,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(1),
            ceiling: Duration::from_secs(3),
        }
    }
}

impl QueryPolicy {
    /// Build a policy from millisecond values as found in the configuration file.
    pub fn from_millis(attempt_timeout_ms: u64, ceiling_ms: u64) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(attempt_timeout_ms),
            ceiling: Duration::from_millis(ceiling_ms),
        }
    }

    /// Number of attempts that fit in the ceiling (at least one).
    pub fn max_attempts(&self) -> u32 {
        if self.attempt_timeout.is_zero() {
            return 1;
        }
        let attempts = self.ceiling.as_nanos().div_ceil(self.attempt_timeout.as_nanos());
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

/// Encode command text as a wire frame.
pub fn encode_frame(text: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(LINE_FEED);
    frame
}

/// Text-protocol client owning one transport.
///
/// All methods take `&mut self`: one query in flight at a time.
#[derive(Debug)]
pub struct ProtocolClient<T> {
    transport: T,
    policy: QueryPolicy,
}

impl<T: Transport> ProtocolClient<T> {
    /// Wrap a transport with the default query policy (1 s per attempt, 3 s ceiling).
    pub fn new(transport: T) -> Self {
        Self::with_policy(transport, QueryPolicy::default())
    }

    /// Wrap a transport with an explicit query policy.
    pub fn with_policy(transport: T, policy: QueryPolicy) -> Self {
        Self { transport, policy }
    }

    /// The active query policy.
    pub fn policy(&self) -> QueryPolicy {
        self.policy
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a query and return the reply text.
    ///
    /// # Errors
    /// - [`DaqError::CommunicationTimeout`] when no non-empty reply arrived in time
    /// - [`DaqError::ProtocolDecode`] when the reply is not valid UTF-8
    /// - [`DaqError::Io`] when the transport itself fails
    pub async fn query(&mut self, text: &str) -> AppResult<String> {
        let frame = encode_frame(text);
        let max_attempts = self.policy.max_attempts();
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let reply = self
                .transport
                .send_and_receive(&frame, self.policy.attempt_timeout)
                .await?;

            match reply {
                Some(payload) if !payload.is_empty() => {
                    let reply = String::from_utf8(payload)
                        .map_err(|e| DaqError::decode(text, "<binary>", e.to_string()))?;
                    debug!(command = text, reply = reply.trim_end(), attempts, "query answered");
                    return Ok(reply);
                }
                Some(_) => debug!(command = text, attempts, "empty datagram, retrying"),
                None => debug!(command = text, attempts, "no reply within attempt timeout"),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.policy.ceiling || attempts >= max_attempts {
                warn!(command = text, attempts, ?elapsed, "query timed out");
                return Err(DaqError::CommunicationTimeout {
                    command: text.to_string(),
                    attempts,
                    elapsed_ms: elapsed.as_millis(),
                });
            }
        }
    }

    /// Send an action. No reply is awaited and nothing is retried.
    pub async fn command(&mut self, text: &str) -> AppResult<()> {
        self.transport.send(&encode_frame(text)).await?;
        debug!(command = text, "command sent");
        Ok(())
    }

    /// Release the transport.
    pub async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await?;
        Ok(())
    }
}
