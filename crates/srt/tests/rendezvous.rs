// tests/rendezvous.rs
//! Symmetric connect: two sockets on distinct local ports dial each other
//! and the cookie contest elects exactly one initiator.

use srt::{SocketState, SrtOpt, SrtSocket};
use std::time::Duration;
use tokio::time::timeout;

const RDV_TIMEOUT: Duration = Duration::from_secs(30);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(0x9E3779B9) >> 5) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rendezvous_connect_and_round_trip() {
    let a = SrtSocket::new();
    let b = SrtSocket::new();
    a.set_option(SrtOpt::Rendezvous(true)).unwrap();
    b.set_option(SrtOpt::Rendezvous(true)).unwrap();

    a.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    b.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr_a = a.local_addr().unwrap();
    let addr_b = b.local_addr().unwrap();

    let (ra, rb) = tokio::join!(
        timeout(RDV_TIMEOUT, a.connect(addr_b)),
        timeout(RDV_TIMEOUT, b.connect(addr_a)),
    );
    ra.expect("side A timed out").unwrap();
    rb.expect("side B timed out").unwrap();

    assert_eq!(a.state(), SocketState::Connected);
    assert_eq!(b.state(), SocketState::Connected);

    // A payload crosses in both directions after the contest settles.
    let forward = pattern(1316);
    a.sendmsg(forward.clone().into()).await.unwrap();
    let got = timeout(Duration::from_secs(5), b.recvmsg())
        .await
        .expect("payload a->b timed out")
        .unwrap();
    assert_eq!(got.as_ref(), &forward[..]);

    let back = pattern(600);
    b.sendmsg(back.clone().into()).await.unwrap();
    let got = timeout(Duration::from_secs(5), a.recvmsg())
        .await
        .expect("payload b->a timed out")
        .unwrap();
    assert_eq!(got.as_ref(), &back[..]);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rendezvous_with_matching_passphrase() {
    let a = SrtSocket::new();
    let b = SrtSocket::new();
    for s in [&a, &b] {
        s.set_option(SrtOpt::Rendezvous(true)).unwrap();
        s.set_option(SrtOpt::Passphrase("rendezvous-secret".into()))
            .unwrap();
    }

    a.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    b.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr_a = a.local_addr().unwrap();
    let addr_b = b.local_addr().unwrap();

    let (ra, rb) = tokio::join!(
        timeout(RDV_TIMEOUT, a.connect(addr_b)),
        timeout(RDV_TIMEOUT, b.connect(addr_a)),
    );
    ra.expect("side A timed out").unwrap();
    rb.expect("side B timed out").unwrap();

    // Both directions are secured from the initiator's key material.
    assert_eq!(a.km_state(), srt::KmState::Secured);
    assert_eq!(b.km_state(), srt::KmState::Secured);

    let payload = pattern(1000);
    a.sendmsg(payload.clone().into()).await.unwrap();
    let got = timeout(Duration::from_secs(5), b.recvmsg())
        .await
        .expect("secured payload timed out")
        .unwrap();
    assert_eq!(got.as_ref(), &payload[..]);

    a.close().await;
    b.close().await;
}
