//! The facade over a real UDP socket, talking to a minimal responder on loopback.

use korad_daq::instrument::Kel103;
use korad_daq::protocol::QueryPolicy;
use korad_daq::DaqError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Answers `*IDN?` and `:INP?`, ignoring the first `skip` datagrams it receives.
async fn spawn_responder(skip: usize) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if seen <= skip {
                continue;
            }
            let reply: &[u8] = match &buf[..len] {
                b"*IDN?\n" => b"KORAD-KEL103 V3.30 SN:00000042\n",
                b":INP?\n" => b"OFF\n",
                _ => continue,
            };
            let _ = socket.send_to(reply, from).await;
        }
    });

    (addr, received)
}

/// Answers `:INP?` and `:MEAS:VOLT?`, holding back the first reply for `delay`.
async fn spawn_slow_responder(delay: Duration) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(delay).await;
            }
            let reply: &[u8] = match &buf[..len] {
                b":INP?\n" => b"ON\n",
                b":MEAS:VOLT?\n" => b"3.700V\n",
                _ => continue,
            };
            let _ = socket.send_to(reply, from).await;
        }
    });

    (addr, received)
}

fn fast_policy() -> QueryPolicy {
    QueryPolicy::from_millis(200, 1000)
}

#[tokio::test]
async fn identifies_over_udp() {
    let (device, received) = spawn_responder(0).await;
    let mut load = Kel103::connect("127.0.0.1:0".parse().unwrap(), device, fast_policy())
        .await
        .unwrap();

    let identity = load.identify().await.unwrap();

    assert_eq!(identity, "KORAD-KEL103 V3.30 SN:00000042");
    assert!(!load.output_enabled().await.unwrap());
    assert_eq!(received.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn lost_datagram_is_resent() {
    let (device, received) = spawn_responder(1).await;
    let mut load = Kel103::connect("127.0.0.1:0".parse().unwrap(), device, fast_policy())
        .await
        .unwrap();

    assert!(load.is_model("KEL103").await.unwrap());
    assert_eq!(received.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreachable_responder_times_out() {
    let (device, received) = spawn_responder(usize::MAX).await;
    let mut load = Kel103::connect("127.0.0.1:0".parse().unwrap(), device, fast_policy())
        .await
        .unwrap();

    let err = load.identify().await.unwrap_err();

    match err {
        DaqError::CommunicationTimeout { attempts, .. } => {
            assert!((1..=5).contains(&attempts));
            assert!(received.load(Ordering::SeqCst) >= attempts as usize);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn late_reply_does_not_answer_the_next_query() {
    let (device, received) = spawn_slow_responder(Duration::from_millis(300)).await;
    let mut load = Kel103::connect("127.0.0.1:0".parse().unwrap(), device, fast_policy())
        .await
        .unwrap();

    // the first attempt times out, its reply then arrives alongside the retry's
    assert!(load.output_enabled().await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..3 {
        assert_eq!(load.measure_voltage().await.unwrap(), 3.7);
        assert!(load.output_enabled().await.unwrap());
    }
    assert_eq!(received.load(Ordering::SeqCst), 8);
}
