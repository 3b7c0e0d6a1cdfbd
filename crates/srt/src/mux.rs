// src/mux.rs
//! The per-binding UDP multiplexer: one receive loop demultiplexing
//! datagrams to their owner connections, one pacing loop draining the
//! earliest-scheduled sender, and one timer loop driving per-connection
//! evaluation.

use crate::connection::Core;
use crate::error::Result;
use crate::options::Options;
use crate::packet::{Control, Packet, SocketId};
use bytes::Bytes;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, error, trace};

const MAX_UDP_PACKET_SIZE: usize = 65536;

#[derive(PartialEq, Eq)]
struct SendEntry {
    when: Instant,
    id: u32,
}

impl Ord for SendEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when.cmp(&other.when).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for SendEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Shared state of one `(local_addr, local_port)` binding.
pub(crate) struct Multiplexer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    conns: DashMap<u32, Weak<Core>>,
    listener: StdMutex<Option<Weak<Core>>>,
    rendezvous: StdMutex<Option<Weak<Core>>>,
    sched: StdMutex<BinaryHeap<Reverse<SendEntry>>>,
    sched_cv: Notify,
    closing: AtomicBool,
    close_cv: Notify,
}

impl Multiplexer {
    pub(crate) async fn bind(addr: SocketAddr, _opts: &Options) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("Multiplexer bound to {}", local_addr);

        let mux = Arc::new(Multiplexer {
            socket: Arc::new(socket),
            local_addr,
            conns: DashMap::new(),
            listener: StdMutex::new(None),
            rendezvous: StdMutex::new(None),
            sched: StdMutex::new(BinaryHeap::new()),
            sched_cv: Notify::new(),
            closing: AtomicBool::new(false),
            close_cv: Notify::new(),
        });

        tokio::spawn(recv_loop(mux.clone()));
        tokio::spawn(send_loop(mux.clone()));
        tokio::spawn(tick_loop(mux.clone()));
        Ok(mux)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn register(&self, core: Weak<Core>, id: SocketId) {
        self.conns.insert(id.0, core);
    }

    pub(crate) async fn unregister(&self, id: SocketId) {
        self.conns.remove(&id.0);
        if self.conns.is_empty() {
            self.close();
        }
    }

    pub(crate) fn set_listener(&self, core: Weak<Core>) {
        *self.listener.lock().unwrap() = Some(core);
    }

    pub(crate) fn set_rendezvous(&self, core: Weak<Core>) {
        *self.rendezvous.lock().unwrap() = Some(core);
    }

    pub(crate) fn clear_rendezvous(&self) {
        *self.rendezvous.lock().unwrap() = None;
    }

    /// Asks the pacing loop to visit a connection no later than `when`.
    pub(crate) fn schedule(&self, id: SocketId, when: Instant) {
        self.sched
            .lock()
            .unwrap()
            .push(Reverse(SendEntry { when, id: id.0 }));
        self.sched_cv.notify_waiters();
    }

    pub(crate) async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    fn lookup(&self, id: u32) -> Option<Arc<Core>> {
        self.conns.get(&id).and_then(|w| w.upgrade())
    }

    pub(crate) fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            debug!("Multiplexer {} closing", self.local_addr);
            self.close_cv.notify_waiters();
            self.sched_cv.notify_waiters();
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Routes one datagram to its owner, or to the connection-request path
    /// for unknown destinations.
    async fn dispatch(self: &Arc<Self>, data: &[u8], addr: SocketAddr, now: Instant) {
        let pkt = match Packet::decode(Bytes::copy_from_slice(data)) {
            Ok(pkt) => pkt,
            Err(e) => {
                trace!("Undecodable datagram from {}: {}", addr, e);
                return;
            }
        };
        let dst = pkt.dst();
        if dst != SocketId::HANDSHAKE {
            if let Some(core) = self.lookup(dst.0) {
                core.process_packet(pkt, addr, now).await;
                return;
            }
        }

        // Destination zero or unknown: only handshake traffic is eligible,
        // handled by a rendezvous peer or the listener.
        let is_handshake = matches!(
            &pkt,
            Packet::Control(cp) if matches!(cp.body, Control::Handshake(_))
        );
        if !is_handshake {
            trace!(
                "Dropping datagram for unknown socket {} from {}",
                dst, addr
            );
            return;
        }
        let rdv = self.rendezvous.lock().unwrap().clone();
        if let Some(core) = rdv.and_then(|w| w.upgrade()) {
            core.process_packet(pkt, addr, now).await;
            return;
        }
        let listener = self.listener.lock().unwrap().clone();
        if let Some(core) = listener.and_then(|w| w.upgrade()) {
            core.process_packet(pkt, addr, now).await;
            return;
        }
        trace!("No owner for handshake from {}", addr);
    }
}

async fn recv_loop(mux: Arc<Multiplexer>) {
    let socket = mux.socket.clone();
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
    loop {
        if mux.is_closing() {
            break;
        }
        tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok((len, addr)) => {
                    mux.dispatch(&buf[..len], addr, Instant::now()).await;
                }
                Err(e) => {
                    // UDP errors are transient; log and keep serving.
                    error!("UDP receive error on {}: {}", mux.local_addr, e);
                }
            },
            _ = mux.close_cv.notified() => break,
        }
    }
    trace!("Receive loop on {} finished", mux.local_addr);
}

/// The pacing loop: always serves the connection with the earliest
/// next-send time.
async fn send_loop(mux: Arc<Multiplexer>) {
    enum Next {
        Serve,
        SleepUntil(Instant),
        Idle,
    }
    loop {
        if mux.is_closing() {
            break;
        }
        let now = Instant::now();
        let next = {
            let sched = mux.sched.lock().unwrap();
            match sched.peek() {
                Some(Reverse(entry)) if entry.when <= now => Next::Serve,
                Some(Reverse(entry)) => Next::SleepUntil(entry.when),
                None => Next::Idle,
            }
        };
        match next {
            Next::SleepUntil(at) => {
                tokio::select! {
                    _ = sleep_until(at.into()) => {}
                    _ = mux.sched_cv.notified() => {}
                }
                continue;
            }
            Next::Idle => {
                let _ = timeout(crate::SYN_INTERVAL, mux.sched_cv.notified()).await;
                continue;
            }
            Next::Serve => {}
        }
        let Some(Reverse(entry)) = mux.sched.lock().unwrap().pop() else {
            continue;
        };
        let Some(core) = mux.lookup(entry.id) else {
            continue;
        };
        if let Some((bytes, addr, next_time)) = core.pack_data(now).await {
            if let Err(e) = mux.socket.send_to(&bytes, addr).await {
                trace!("Data send to {} failed: {}", addr, e);
            }
            if let Some(when) = next_time {
                mux.schedule(SocketId(entry.id), when);
            }
        }
    }
    trace!("Send loop on {} finished", mux.local_addr);
}

/// Periodic evaluation of every registered connection.
async fn tick_loop(mux: Arc<Multiplexer>) {
    let mut ticker = tokio::time::interval(crate::SYN_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        if mux.is_closing() {
            break;
        }
        ticker.tick().await;
        let now = Instant::now();
        let cores: Vec<Arc<Core>> = mux
            .conns
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        let mut stale: Vec<u32> = Vec::new();
        for entry in mux.conns.iter() {
            if entry.value().upgrade().is_none() {
                stale.push(*entry.key());
            }
        }
        for id in stale {
            mux.conns.remove(&id);
        }
        for core in cores {
            core.check_timers(now).await;
        }
    }
    trace!("Timer loop on {} finished", mux.local_addr);
}
