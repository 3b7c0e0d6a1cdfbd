// tests/transfer.rs
//! Data-path tests over loopback: live message delivery and a file-mode
//! bulk upload several times the size of the send buffer.

use srt::{SrtOpt, SrtSocket, TransType};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

async fn bound_listener(sock: SrtSocket) -> (srt::SrtListener, SocketAddr) {
    sock.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let listener = sock.listen(5).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(2654435761) >> 3) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_messages_round_trip() {
    let (listener, addr) = bound_listener(SrtSocket::new()).await;
    let caller = SrtSocket::new();
    let (connected, accepted) = tokio::join!(
        timeout(CONNECT_TIMEOUT, caller.connect(addr)),
        timeout(CONNECT_TIMEOUT, listener.accept()),
    );
    connected.expect("connect timed out").unwrap();
    let accepted = accepted.expect("accept timed out").unwrap();

    let first = pattern(1316);
    let second = pattern(700);
    caller.sendmsg(first.clone().into()).await.unwrap();
    caller.sendmsg(second.clone().into()).await.unwrap();

    let got1 = timeout(Duration::from_secs(5), accepted.recvmsg())
        .await
        .expect("first message timed out")
        .unwrap();
    assert_eq!(got1.as_ref(), &first[..]);

    let (got2, info2) = timeout(Duration::from_secs(5), accepted.recvmsg2())
        .await
        .expect("second message timed out")
        .unwrap();
    assert_eq!(got2.as_ref(), &second[..]);
    assert!(info2.in_order);

    // The reverse direction works over the same connection.
    accepted.sendmsg(pattern(512).into()).await.unwrap();
    let back = timeout(Duration::from_secs(5), caller.recvmsg())
        .await
        .expect("reverse message timed out")
        .unwrap();
    assert_eq!(back.len(), 512);

    let stats = caller.stats();
    assert!(stats.pkt_sent >= 2, "{:?}", stats);
    assert_eq!(stats.pkt_snd_drop, 0);

    caller.close().await;
    accepted.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_message_is_split_and_reassembled() {
    let (listener, addr) = bound_listener(SrtSocket::new()).await;
    let caller = SrtSocket::new();
    let (connected, accepted) = tokio::join!(
        timeout(CONNECT_TIMEOUT, caller.connect(addr)),
        timeout(CONNECT_TIMEOUT, listener.accept()),
    );
    connected.expect("connect timed out").unwrap();
    let accepted = accepted.expect("accept timed out").unwrap();

    // Four packets worth of payload in one message.
    let payload = pattern(1316 * 3 + 500);
    caller.sendmsg(payload.clone().into()).await.unwrap();

    let got = timeout(Duration::from_secs(5), accepted.recvmsg())
        .await
        .expect("split message timed out")
        .unwrap();
    assert_eq!(got.as_ref(), &payload[..]);

    caller.close().await;
    accepted.close().await;
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_mode_bulk_upload_is_lossless() {
    let listener_sock = SrtSocket::new();
    listener_sock
        .set_option(SrtOpt::TransType(TransType::File))
        .unwrap();
    let (listener, addr) = bound_listener(listener_sock).await;

    let caller = SrtSocket::new();
    caller.set_option(SrtOpt::SndBuf(128)).unwrap();
    caller
        .set_option(SrtOpt::TransType(TransType::File))
        .unwrap();

    let (connected, accepted) = tokio::join!(
        timeout(CONNECT_TIMEOUT, caller.connect(addr)),
        timeout(CONNECT_TIMEOUT, listener.accept()),
    );
    connected.expect("connect timed out").unwrap();
    let accepted = accepted.expect("accept timed out").unwrap();

    // Seven times the send buffer, written in payload-sized chunks.
    let total = 7 * 128 * 1456;
    let data = pattern(total);

    let sender = {
        let data = data.clone();
        tokio::spawn(async move {
            for chunk in data.chunks(1456) {
                caller.send(chunk).await.unwrap();
            }
            caller
        })
    };

    let mut received = Vec::with_capacity(total);
    let mut buf = vec![0u8; 65536];
    let deadline = Duration::from_secs(60);
    while received.len() < total {
        let n = timeout(deadline, accepted.recv(&mut buf))
            .await
            .expect("receive stalled")
            .unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    let caller = sender.await.unwrap();

    assert_eq!(received.len(), total);
    assert_eq!(received, data, "byte stream must arrive intact and in order");

    let snd_stats = caller.stats();
    let rcv_stats = accepted.stats();
    assert_eq!(snd_stats.pkt_snd_drop, 0, "{:?}", snd_stats);
    assert_eq!(rcv_stats.pkt_rcv_drop, 0, "{:?}", rcv_stats);

    caller.close().await;
    accepted.close().await;
    listener.close().await;
}
