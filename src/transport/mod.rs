//! Datagram transport to the instrument.
//!
//! The protocol layer only needs three operations from the link: fire a frame, fire a
//! frame and wait a bounded time for one reply, and release the link. [`Transport`]
//! captures exactly that so the protocol client can run against the UDP socket in
//! production and against [`crate::instrument::mock::MockLoad`] in tests.
//!
//! A transport carries no session: there is no connection state, no sequence numbers
//! and no delivery acknowledgement. Retrying and verifying is the job of the layers
//! above.

pub mod udp;

pub use udp::UdpTransport;

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Largest datagram the instrument sends.
pub const MAX_DATAGRAM: usize = 1024;

/// Connectionless, message-oriented link to one instrument.
///
/// # Contract
/// - Every call to `send`/`send_and_receive` transmits `frame` as one whole datagram.
/// - `send_and_receive` returns `Ok(None)` when nothing arrived within `timeout`.
///   A receive timeout is not an I/O error.
/// - `Err` is reserved for failures of the link itself (socket closed, unreachable
///   network, ...).
#[async_trait]
pub trait Transport: Send {
    /// Transmit a frame without waiting for anything in return.
    async fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Transmit a frame and wait up to `timeout` for a single reply datagram.
    async fn send_and_receive(
        &mut self,
        frame: &[u8],
        timeout: Duration,
    ) -> io::Result<Option<Vec<u8>>>;

    /// Release the link. Further sends fail with [`io::ErrorKind::NotConnected`].
    async fn close(&mut self) -> io::Result<()>;
}
