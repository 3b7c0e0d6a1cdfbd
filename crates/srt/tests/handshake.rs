// tests/handshake.rs
//! Caller/listener establishment over loopback UDP: the unencrypted path,
//! both enforcement behaviors on a passphrase mismatch, and listener
//! option inheritance.

use srt::{KmState, RejectReason, SocketState, SrtError, SrtOpt, SrtSocket};
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = srt_log::SrtLogger::init(log::Level::Info);
    });
}

async fn bound_listener(sock: SrtSocket) -> (srt::SrtListener, SocketAddr) {
    sock.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let listener = sock.listen(5).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn v5_handshake_without_encryption() {
    init_logging();
    let (listener, addr) = bound_listener(SrtSocket::new()).await;
    let caller = SrtSocket::new();

    let (connected, accepted) = tokio::join!(
        timeout(CONNECT_TIMEOUT, caller.connect(addr)),
        timeout(CONNECT_TIMEOUT, listener.accept()),
    );
    connected.expect("connect timed out").unwrap();
    let accepted = accepted.expect("accept timed out").unwrap();

    assert_eq!(caller.state(), SocketState::Connected);
    assert_eq!(accepted.state(), SocketState::Connected);
    assert_eq!(caller.km_state(), KmState::Unsecured);
    assert_eq!(accepted.km_state(), KmState::Unsecured);

    // Default MSS 1500 leaves 1456 bytes of payload per packet.
    assert_eq!(caller.options().payload_capacity(), 1456);
    assert_eq!(accepted.options().payload_capacity(), 1456);

    caller.close().await;
    accepted.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passphrase_mismatch_enforced_rejects() {
    init_logging();
    let listener_sock = SrtSocket::new();
    listener_sock
        .set_option(SrtOpt::Passphrase("s!t@r#i$c^tu".into()))
        .unwrap();
    listener_sock
        .set_option(SrtOpt::EnforcedEncryption(true))
        .unwrap();
    let (listener, addr) = bound_listener(listener_sock).await;

    let caller = SrtSocket::new();
    caller
        .set_option(SrtOpt::Passphrase("s!t@r#i$c^t".into()))
        .unwrap();
    caller
        .set_option(SrtOpt::EnforcedEncryption(true))
        .unwrap();

    let result = timeout(CONNECT_TIMEOUT, caller.connect(addr))
        .await
        .expect("connect timed out");
    assert!(
        matches!(result, Err(SrtError::Setup(_))),
        "expected setup error, got {:?}",
        result
    );
    assert_eq!(caller.state(), SocketState::Broken);

    // The listener must not have produced a connection for this attempt.
    let accepted = timeout(Duration::from_millis(500), listener.accept()).await;
    assert!(accepted.is_err(), "listener accepted a rejected caller");

    assert_eq!(caller.km_state(), KmState::Unsecured);
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passphrase_mismatch_unenforced_connects_opaque() {
    init_logging();
    let listener_sock = SrtSocket::new();
    listener_sock
        .set_option(SrtOpt::Passphrase("s!t@r#i$c^tu".into()))
        .unwrap();
    listener_sock
        .set_option(SrtOpt::EnforcedEncryption(false))
        .unwrap();
    let (listener, addr) = bound_listener(listener_sock).await;

    let caller = SrtSocket::new();
    caller
        .set_option(SrtOpt::Passphrase("s!t@r#i$c^t".into()))
        .unwrap();
    caller
        .set_option(SrtOpt::EnforcedEncryption(false))
        .unwrap();

    let (connected, accepted) = tokio::join!(
        timeout(CONNECT_TIMEOUT, caller.connect(addr)),
        timeout(CONNECT_TIMEOUT, listener.accept()),
    );
    connected.expect("connect timed out").unwrap();
    let accepted = accepted.expect("accept timed out").unwrap();

    assert_eq!(caller.km_state(), KmState::BadSecret);
    assert_eq!(accepted.km_state(), KmState::BadSecret);

    // Sending succeeds at the API; the receiver cannot decrypt but still
    // gets the packet at its deadline, opaque and flagged.
    let plain = vec![0xA5u8; 1316];
    let sent = caller.sendmsg(plain.clone().into()).await.unwrap();
    assert_eq!(sent, 1316);

    let (payload, info) = timeout(Duration::from_secs(5), accepted.recvmsg2())
        .await
        .expect("opaque message timed out")
        .unwrap();
    assert_eq!(payload.len(), 1316);
    assert!(info.undecryptable);
    assert_ne!(payload.as_ref(), &plain[..], "payload must stay ciphertext");

    let stats = accepted.stats();
    assert_eq!(stats.pkt_rcv_undecrypt, 1, "{:?}", stats);

    caller.close().await;
    accepted.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listener_options_inheritance() {
    init_logging();
    let listener_sock = SrtSocket::new();
    listener_sock
        .set_option(SrtOpt::RcvLatency(Duration::from_millis(140)))
        .unwrap();
    listener_sock
        .set_option(SrtOpt::PeerLatency(Duration::from_millis(100)))
        .unwrap();
    listener_sock.set_option(SrtOpt::LossMaxTtl(5)).unwrap();
    listener_sock.set_option(SrtOpt::TlPktDrop(false)).unwrap();
    listener_sock
        .set_option(SrtOpt::StreamId("listener-private".into()))
        .unwrap();
    let (listener, addr) = bound_listener(listener_sock).await;

    let caller = SrtSocket::new();
    caller
        .set_option(SrtOpt::StreamId("live/camera-7".into()))
        .unwrap();

    let (connected, accepted) = tokio::join!(
        timeout(CONNECT_TIMEOUT, caller.connect(addr)),
        timeout(CONNECT_TIMEOUT, listener.accept()),
    );
    connected.expect("connect timed out").unwrap();
    let accepted = accepted.expect("accept timed out").unwrap();

    // Accepted socket: listener's 140ms receive latency wins over the
    // caller's default proposal; the peer side settles on the caller's
    // default 120ms.
    let acc_opts = accepted.options();
    assert_eq!(acc_opts.rcv_latency, Duration::from_millis(140));
    assert_eq!(acc_opts.peer_latency, Duration::from_millis(120));
    assert_eq!(acc_opts.loss_max_ttl, 5);
    assert!(!acc_opts.tlpktdrop);

    // The stream identifier travels from the caller and is never
    // inherited from the listener.
    assert_eq!(accepted.stream_id(), "live/camera-7");

    let caller_opts = caller.options();
    assert_eq!(caller_opts.rcv_latency, Duration::from_millis(120));
    assert_eq!(caller_opts.peer_latency, Duration::from_millis(140));
    assert!(!caller_opts.tlpktdrop);

    caller.close().await;
    accepted.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_stream_id_is_rejected() {
    init_logging();
    let (listener, addr) = bound_listener(SrtSocket::new()).await;

    // MSS 800 leaves 756 bytes of payload; a 400-byte stream id passes
    // the local ceiling but exceeds half the payload on the wire.
    let caller = SrtSocket::new();
    caller.set_option(SrtOpt::Mss(800)).unwrap();
    caller.set_option(SrtOpt::StreamId("s".repeat(400))).unwrap();

    let result = timeout(CONNECT_TIMEOUT, caller.connect(addr))
        .await
        .expect("connect timed out");
    assert!(
        matches!(result, Err(SrtError::Setup(_))),
        "expected setup error, got {:?}",
        result
    );
    assert_eq!(caller.state(), SocketState::Broken);

    let accepted = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(accepted.is_err(), "listener accepted an oversized stream id");

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listen_callback_can_reject() {
    init_logging();
    let (listener, addr) = bound_listener(SrtSocket::new()).await;
    listener.set_listen_callback(Box::new(|_pre, sid, _peer, version| {
        assert_eq!(version, 5);
        if sid == "blocked" {
            Err(RejectReason::Peer)
        } else {
            Ok(())
        }
    }));

    let caller = SrtSocket::new();
    caller.set_option(SrtOpt::StreamId("blocked".into())).unwrap();
    let result = timeout(CONNECT_TIMEOUT, caller.connect(addr))
        .await
        .expect("connect timed out");
    assert!(matches!(result, Err(SrtError::Setup(_))));

    // A caller with an acceptable stream id still gets through.
    let ok_caller = SrtSocket::new();
    ok_caller
        .set_option(SrtOpt::StreamId("allowed".into()))
        .unwrap();
    let (connected, accepted) = tokio::join!(
        timeout(CONNECT_TIMEOUT, ok_caller.connect(addr)),
        timeout(CONNECT_TIMEOUT, listener.accept()),
    );
    connected.expect("connect timed out").unwrap();
    let accepted = accepted.expect("accept timed out").unwrap();
    assert_eq!(accepted.stream_id(), "allowed");

    ok_caller.close().await;
    accepted.close().await;
    listener.close().await;
}
