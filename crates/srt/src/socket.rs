// src/socket.rs
//! Public socket surface: lifecycle, option access with tier checks, and
//! the blocking-style I/O entry points.

use crate::buffer::recv::MsgInfo;
use crate::buffer::send::MsgCtrl;
use crate::connection::{Core, SocketState};
use crate::crypto::KmState;
use crate::error::{RejectReason, Result, SrtError, UsageCause};
use crate::options::{OptBinding, Options, SrtOpt};
use crate::stats::StatsSnapshot;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;

/// Hook invoked on the listener after handshake parsing but before
/// acceptance: `(pre-accept socket, stream id, peer address, handshake
/// version)`. Returning an error rejects the caller with that code.
pub type ListenCallback = Box<
    dyn Fn(&SrtSocket, &str, SocketAddr, u32) -> std::result::Result<(), RejectReason>
        + Send
        + Sync,
>;

/// One SRT socket.
pub struct SrtSocket {
    core: Arc<Core>,
}

impl Default for SrtSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl SrtSocket {
    pub fn new() -> Self {
        Self {
            core: Core::new(Options::default()),
        }
    }

    pub fn with_options(opts: Options) -> Self {
        Self {
            core: Core::new(opts),
        }
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> crate::packet::SocketId {
        self.core.id
    }

    pub fn state(&self) -> SocketState {
        self.core.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    /// Applies one option, honoring its restriction tier against the
    /// socket's current state.
    pub fn set_option(&self, opt: SrtOpt) -> Result<()> {
        let state = self.core.state();
        let allowed = match opt.binding() {
            OptBinding::PreBind => matches!(state, SocketState::Init),
            OptBinding::Pre => matches!(state, SocketState::Init | SocketState::Opened),
            OptBinding::Post => !matches!(state, SocketState::Closing | SocketState::Closed),
        };
        if !allowed {
            return Err(SrtError::NotSup(UsageCause::WrongState));
        }
        self.core.opts.lock().unwrap().apply(opt)?;
        // Crypto configuration must be in place before the handshake runs.
        if matches!(state, SocketState::Init | SocketState::Opened) {
            self.core.refresh_crypto_from_opts();
        }
        Ok(())
    }

    /// A copy of the full option block (negotiated values after connect).
    pub fn options(&self) -> Options {
        self.core.opts_copy()
    }

    pub fn rcv_latency(&self) -> Duration {
        self.core.opts.lock().unwrap().rcv_latency
    }

    pub fn peer_latency(&self) -> Duration {
        self.core.opts.lock().unwrap().peer_latency
    }

    pub fn stream_id(&self) -> String {
        self.core.opts.lock().unwrap().stream_id.clone()
    }

    /// Key-material state; `Unsecured` until a connection is established.
    pub fn km_state(&self) -> KmState {
        if !self.core.is_connected() {
            return KmState::Unsecured;
        }
        self.core.crypto.lock().unwrap().km_state()
    }

    /// Binds to a local address, creating (or joining) its multiplexer.
    pub async fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.core.bind(addr).await
    }

    /// Connects to a listening peer (or, with the rendezvous option set,
    /// to a rendezvous peer).
    pub async fn connect(&self, remote: SocketAddr) -> Result<()> {
        if self.core.state() == SocketState::Init {
            let local = match remote {
                SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            };
            self.core.bind(local).await?;
        }
        self.core.connect(remote).await
    }

    /// Symmetric connect: both peers bind distinct ports and call this
    /// toward each other.
    pub async fn rendezvous(&self, local: SocketAddr, remote: SocketAddr) -> Result<()> {
        self.set_option(SrtOpt::Rendezvous(true))?;
        self.bind(local).await?;
        self.core.connect(remote).await
    }

    /// Turns a bound socket into a listener.
    pub fn listen(self, backlog: u32) -> Result<SrtListener> {
        if self.core.state() != SocketState::Opened {
            return Err(SrtError::NotSup(UsageCause::WrongState));
        }
        self.core.backlog.store(backlog, Ordering::Release);
        self.core.set_state(SocketState::Listening);
        if let Some(mux) = self.core.mux.get() {
            mux.set_listener(self.core.downgrade());
        }
        Ok(SrtListener { core: self.core })
    }

    /// Stream-mode send.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.core.api_send_stream(data).await
    }

    /// Message-mode send with default controls.
    pub async fn sendmsg(&self, payload: Bytes) -> Result<usize> {
        self.core
            .api_send_msg(payload, MsgCtrl { in_order: true, ..Default::default() })
            .await
    }

    /// Message-mode send with explicit TTL/order/source-time controls.
    pub async fn sendmsg2(&self, payload: Bytes, ctrl: MsgCtrl) -> Result<usize> {
        self.core.api_send_msg(payload, ctrl).await
    }

    /// Stream-mode receive.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.core.api_recv_stream(buf).await
    }

    /// Message-mode receive: one complete message.
    pub async fn recvmsg(&self) -> Result<Bytes> {
        Ok(self.core.api_recv_msg().await?.0)
    }

    /// Message-mode receive with delivery metadata.
    pub async fn recvmsg2(&self) -> Result<(Bytes, MsgInfo)> {
        self.core.api_recv_msg().await
    }

    /// Registers a hook for `PEERERROR` control messages.
    pub fn set_peer_error_callback<F>(&self, cb: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        *self.core.peer_error_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats_snapshot()
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl std::fmt::Debug for SrtSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtSocket")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}

/// A listening socket producing accepted connections.
pub struct SrtListener {
    core: Arc<Core>,
}

impl SrtListener {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    /// Installs the acceptance hook run for each incoming CONCLUSION.
    pub fn set_listen_callback(&self, cb: ListenCallback) {
        *self.core.listen_cb.lock().unwrap() = Some(cb);
    }

    /// Waits for the next accepted connection.
    pub async fn accept(&self) -> Result<SrtSocket> {
        loop {
            if self.core.is_closing() {
                return Err(SrtError::conn_lost());
            }
            if let Some(child) = self.core.accept_queue.lock().unwrap().pop_front() {
                return Ok(SrtSocket::from_core(child));
            }
            let _ = timeout(Duration::from_millis(100), self.core.accept_cv.notified()).await;
        }
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl std::fmt::Debug for SrtListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtListener")
            .field("id", &self.core.id)
            .finish()
    }
}
