//! UDP transport for the KEL103 LAN interface.
//!
//! The instrument listens on a fixed port (18190 by default) and answers to the address
//! the query came from, so the host binds a fixed local endpoint as well.

use super::{Transport, MAX_DATAGRAM};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// UDP socket bound to a local endpoint and aimed at one instrument.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    device: SocketAddr,
}

impl UdpTransport {
    /// Bind `local` and target `device`.
    ///
    /// # Errors
    /// Returns an error if the local endpoint cannot be bound.
    pub async fn bind(local: SocketAddr, device: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        debug!(%local, %device, "UDP transport bound");
        Ok(Self {
            socket: Some(socket),
            device,
        })
    }

    /// Address of the instrument.
    pub fn device_addr(&self) -> SocketAddr {
        self.device
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?.local_addr()
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
    }

    /// Drop datagrams already queued on the socket, e.g. a reply to an attempt that
    /// timed out. Returns how many were dropped.
    fn discard_pending(&self) -> io::Result<usize> {
        let socket = self.socket()?;
        let mut buffer = [0u8; MAX_DATAGRAM];
        let mut discarded = 0;
        loop {
            match socket.try_recv_from(&mut buffer) {
                Ok((len, from)) => {
                    debug!(bytes = len, %from, "discarding stale datagram");
                    discarded += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(discarded),
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let device = self.device;
        self.socket()?.send_to(frame, device).await?;
        trace!(bytes = frame.len(), %device, "datagram sent");
        Ok(())
    }

    async fn send_and_receive(
        &mut self,
        frame: &[u8],
        timeout: Duration,
    ) -> io::Result<Option<Vec<u8>>> {
        // A late reply left in the queue would answer this query instead.
        self.discard_pending()?;
        self.send(frame).await?;

        let device = self.device;
        let socket = self.socket()?;
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; MAX_DATAGRAM];

        loop {
            match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Err(_) => return Ok(None),
                Ok(Ok((len, from))) if from.ip() == device.ip() => {
                    trace!(bytes = len, %from, "datagram received");
                    return Ok(Some(buffer[..len].to_vec()));
                }
                Ok(Ok((len, from))) => {
                    // Stray traffic on the bound port; keep waiting for the device.
                    debug!(bytes = len, %from, "discarding datagram from unexpected peer");
                }
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.socket.take().is_some() {
            debug!(device = %self.device, "UDP transport closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_pair() -> (UdpTransport, UdpSocket) {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), device_addr)
            .await
            .unwrap();
        (transport, device)
    }

    #[tokio::test]
    async fn send_delivers_one_datagram() {
        let (mut transport, device) = loopback_pair().await;

        transport.send(b":INP 1\n").await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b":INP 1\n");
        assert_eq!(from, transport.local_addr().unwrap());
    }

    #[tokio::test]
    async fn send_and_receive_returns_reply() {
        let (mut transport, device) = loopback_pair().await;

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(b"ON\n", from).await.unwrap();
        });

        let reply = transport
            .send_and_receive(b":INP?\n", Duration::from_secs(2))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(reply.as_deref(), Some(&b"ON\n"[..]));
    }

    #[tokio::test]
    async fn silent_device_yields_none() {
        let (mut transport, _device) = loopback_pair().await;

        let reply = transport
            .send_and_receive(b":INP?\n", Duration::from_millis(50))
            .await
            .unwrap();

        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn stale_reply_is_discarded_before_query() {
        let (mut transport, device) = loopback_pair().await;
        let local = transport.local_addr().unwrap();
        device.send_to(b"3.700V\n", local).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(b"ON\n", from).await.unwrap();
        });

        let reply = transport
            .send_and_receive(b":INP?\n", Duration::from_secs(2))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(reply.as_deref(), Some(&b"ON\n"[..]));
    }

    #[tokio::test]
    async fn closed_transport_refuses_to_send() {
        let (mut transport, _device) = loopback_pair().await;

        transport.close().await.unwrap();
        let err = transport.send(b"*IDN?\n").await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
