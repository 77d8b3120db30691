//! Port-forward tunnel sessions
//!
//! A [`TunnelSession`] owns a local TCP listener and relays every accepted
//! connection to a port inside a pod through a [`TunnelTransport`]. The
//! listener is bound when the session is created, so the local address is
//! known before the tunnel starts and never changes afterwards.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use adminscope_types::{Error, Result, Target};

/// Primed streams older than this are discarded instead of relayed
const PRIMED_STREAM_MAX_AGE: Duration = Duration::from_secs(30);

/// Byte stream to a pod port
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Opens streams to a port inside a pod
pub trait TunnelTransport: Send + Sync + 'static {
    /// Open one stream to `remote_port` on the target pod
    fn open(
        &self,
        target: &Target,
        remote_port: u16,
    ) -> impl Future<Output = Result<TunnelStream>> + Send;
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a tunnel session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// Listener bound, tunnel not yet established
    Pending,
    /// Tunnel established and relaying connections
    Ready,
    /// Upstream failed after being ready; retrying in the background
    Reconnecting { attempt: u32 },
    /// Terminal
    Stopped,
}

/// A state together with the moment it was entered
#[derive(Clone, Debug)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub since: DateTime<Utc>,
}

impl TunnelStatus {
    fn now(state: TunnelState) -> Self {
        Self {
            state,
            since: Utc::now(),
        }
    }
}

/// Publishes state transitions; `Stopped` is never left once entered
#[derive(Clone)]
struct StateCell {
    tx: Arc<watch::Sender<TunnelStatus>>,
    target: String,
}

impl StateCell {
    fn set(&self, state: TunnelState) {
        let target = &self.target;
        self.tx.send_if_modified(|current| {
            if current.state == TunnelState::Stopped || current.state == state {
                return false;
            }
            tracing::debug!(pod = %target, from = ?current.state, to = ?state, "tunnel state change");
            *current = TunnelStatus::now(state);
            true
        });
    }

    fn get(&self) -> TunnelState {
        self.tx.borrow().state.clone()
    }
}

// ============================================================================
// Options
// ============================================================================

/// Delay schedule for background reconnects
#[derive(Clone, Copy, Debug)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectBackoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

/// Local side configuration of a tunnel
#[derive(Clone, Debug)]
pub struct TunnelOptions {
    pub bind_address: IpAddr,
    /// 0 lets the OS pick an ephemeral port
    pub local_port: u16,
    /// Upper bound on how long `start` waits for the first upstream stream
    pub ready_timeout: Duration,
    pub backoff: ReconnectBackoff,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 0,
            ready_timeout: Duration::from_secs(30),
            backoff: ReconnectBackoff::default(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// One local listener forwarding to one pod port
pub struct TunnelSession<T> {
    transport: Arc<T>,
    target: Target,
    remote_port: u16,
    options: TunnelOptions,
    local_addr: SocketAddr,
    runner: Mutex<Runner>,
    cancel: CancellationToken,
    state: StateCell,
}

/// Listener before `start`, relay task after it; swapped under one lock
struct Runner {
    listener: Option<std::net::TcpListener>,
    task: Option<JoinHandle<()>>,
}

impl<T: TunnelTransport> TunnelSession<T> {
    /// Bind the local listener; the tunnel itself is opened by [`start`](Self::start)
    pub fn new(
        transport: Arc<T>,
        target: Target,
        remote_port: u16,
        options: TunnelOptions,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let bind = SocketAddr::new(options.bind_address, options.local_port);
        let listener = std::net::TcpListener::bind(bind).map_err(|e| Error::Tunnel {
            target: target.to_string(),
            reason: format!("failed to bind {}: {}", bind, e),
        })?;
        listener.set_nonblocking(true).map_err(|e| Error::Tunnel {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| Error::Tunnel {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, _) = watch::channel(TunnelStatus::now(TunnelState::Pending));
        let state = StateCell {
            tx: Arc::new(tx),
            target: target.to_string(),
        };

        Ok(Self {
            transport,
            target,
            remote_port,
            options,
            local_addr,
            runner: Mutex::new(Runner {
                listener: Some(listener),
                task: None,
            }),
            cancel: parent.child_token(),
            state,
        })
    }

    /// Open the tunnel and wait until it is first ready
    ///
    /// Only the first connection attempt is reported; once ready, upstream
    /// failures are retried in the background until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        if self.state.get() == TunnelState::Stopped {
            return Err(self.tunnel_error("session already stopped"));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.runner.lock().task.is_some() {
            return Ok(());
        }

        let open = self.transport.open(&self.target, self.remote_port);
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(self.options.ready_timeout, open) => match result {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(Error::Timeout(format!("port-forward to {}", self.target)));
                }
            },
        };

        let mut runner = self.runner.lock();
        if runner.task.is_some() {
            // a concurrent start won; its stream serves the listener
            return Ok(());
        }
        let Some(listener) = runner.listener.take() else {
            return Err(self.tunnel_error("session already stopped"));
        };
        let listener = TcpListener::from_std(listener)
            .map_err(|e| self.tunnel_error(&format!("failed to adopt listener: {}", e)))?;

        self.state.set(TunnelState::Ready);
        tracing::debug!(pod = %self.target, address = %self.local_addr, port = self.remote_port, "tunnel ready");

        let relay = Relay {
            transport: Arc::clone(&self.transport),
            target: self.target.clone(),
            remote_port: self.remote_port,
            backoff: self.options.backoff,
            cancel: self.cancel.clone(),
            state: self.state.clone(),
        };
        runner.task = Some(tokio::spawn(relay.run(listener, first)));

        Ok(())
    }

    fn tunnel_error(&self, reason: &str) -> Error {
        Error::Tunnel {
            target: self.target.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl<T> TunnelSession<T> {
    /// "<bind-address>:<port>" of the local listener
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn state(&self) -> TunnelState {
        self.state.get()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<TunnelStatus> {
        self.state.tx.subscribe()
    }

    /// Stop the tunnel; safe to call repeatedly and before `start`
    pub fn stop(&self) {
        self.cancel.cancel();
        self.runner.lock().listener.take();
        self.state.set(TunnelState::Stopped);
    }

    /// Stop and wait for the relay and every open connection to be torn down
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.runner.lock().task.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(pod = %self.target, error = %e, "tunnel relay task failed");
        }
    }

    /// Wait until the session is stopped, directly or by its parent token
    pub async fn wait_for_stop(&self) {
        self.cancel.cancelled().await;
    }
}

impl<T> Drop for TunnelSession<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Background relay
// ============================================================================

struct Relay<T> {
    transport: Arc<T>,
    target: Target,
    remote_port: u16,
    backoff: ReconnectBackoff,
    cancel: CancellationToken,
    state: StateCell,
}

impl<T: TunnelTransport> Relay<T> {
    async fn run(self, listener: TcpListener, first: TunnelStream) {
        let mut primed = Some((first, Instant::now()));
        let mut pipes = JoinSet::new();

        loop {
            let local = tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(_) = pipes.join_next() => continue,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::trace!(pod = %self.target, %peer, "accepted local connection");
                        stream
                    }
                    Err(e) => {
                        // back off so a persistent accept error does not spin
                        tracing::warn!(pod = %self.target, error = %e, "accept failed");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.backoff.delay(1)) => {}
                        }
                        continue;
                    }
                },
            };

            let upstream = match primed.take() {
                Some((stream, opened)) if opened.elapsed() < PRIMED_STREAM_MAX_AGE => stream,
                _ => match self.reconnect().await {
                    Some(stream) => stream,
                    None => break,
                },
            };

            pipes.spawn(pipe(local, upstream, self.cancel.clone()));
        }

        pipes.shutdown().await;
        self.state.set(TunnelState::Stopped);
        tracing::debug!(pod = %self.target, "tunnel relay exited");
    }

    /// Open a fresh upstream stream, retrying until it succeeds or the
    /// session is cancelled
    async fn reconnect(&self) -> Option<TunnelStream> {
        let mut attempt = 0u32;
        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.transport.open(&self.target, self.remote_port) => result,
            };

            match opened {
                Ok(stream) => {
                    self.state.set(TunnelState::Ready);
                    return Some(stream);
                }
                Err(e) => {
                    attempt += 1;
                    self.state.set(TunnelState::Reconnecting { attempt });
                    tracing::warn!(pod = %self.target, attempt, error = %e, "port-forward lost, reconnecting");

                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.backoff.delay(attempt)) => {}
                    }
                }
            }
        }
    }
}

async fn pipe(mut local: TcpStream, mut upstream: TunnelStream, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut local, &mut upstream) => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "tunnel connection closed with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
    use tokio_test::{assert_err, assert_ok};

    use adminscope_types::TargetRole;

    /// Echoes every byte back; fails the first `fail_first` opens
    struct EchoTransport {
        opens: AtomicUsize,
        fail_first: usize,
    }

    impl EchoTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    impl TunnelTransport for EchoTransport {
        async fn open(&self, target: &Target, _remote_port: u16) -> Result<TunnelStream> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::Tunnel {
                    target: target.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            let (ours, theirs) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(theirs);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(Box::new(ours))
        }
    }

    fn target() -> Target {
        Target::new("default", "envoy-0", TargetRole::Proxy)
    }

    fn fast_options() -> TunnelOptions {
        TunnelOptions {
            ready_timeout: Duration::from_secs(2),
            backoff: ReconnectBackoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
            },
            ..Default::default()
        }
    }

    fn local_port<T>(session: &TunnelSession<T>) -> u16 {
        session.address().parse::<SocketAddr>().unwrap().port()
    }

    async fn echo_roundtrip(address: &str, payload: &[u8]) -> Vec<u8> {
        let mut conn = TcpStream::connect(address).await.unwrap();
        conn.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        conn.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_address_known_before_start() {
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(EchoTransport::new(0), target(), 19000, fast_options(), &root)
                .unwrap();

        let port = local_port(&session);
        assert!(port > 0);
        assert_eq!(session.address(), format!("127.0.0.1:{}", port));
        assert_eq!(session.state(), TunnelState::Pending);
    }

    #[tokio::test]
    async fn test_start_relays_connections() {
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(EchoTransport::new(0), target(), 19000, fast_options(), &root)
                .unwrap();
        let port_before = local_port(&session);

        assert_ok!(session.start().await);
        assert_eq!(session.state(), TunnelState::Ready);
        assert_eq!(local_port(&session), port_before);

        assert_eq!(echo_roundtrip(&session.address(), b"first").await, b"first");
        // second connection needs a new upstream stream
        assert_eq!(echo_roundtrip(&session.address(), b"second").await, b"second");

        session.stop();
        assert_eq!(session.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_start_reports_first_failure() {
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(EchoTransport::new(1), target(), 19000, fast_options(), &root)
                .unwrap();

        let err = assert_err!(session.start().await);
        assert!(matches!(err, Error::Tunnel { .. }));
        assert_eq!(session.state(), TunnelState::Pending);

        // stop after a failed start is fine
        session.stop();
        session.stop();
        assert_eq!(session.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_idempotent() {
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(EchoTransport::new(0), target(), 19000, fast_options(), &root)
                .unwrap();

        session.stop();
        session.stop();
        assert_eq!(session.state(), TunnelState::Stopped);

        tokio::time::timeout(Duration::from_millis(100), session.wait_for_stop())
            .await
            .expect("wait_for_stop should return promptly after stop");

        assert_err!(session.start().await);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_session() {
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(EchoTransport::new(0), target(), 19000, fast_options(), &root)
                .unwrap();
        session.start().await.unwrap();

        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), session.wait_for_stop())
            .await
            .unwrap();

        let mut watch = session.watch_state();
        tokio::time::timeout(
            Duration::from_secs(1),
            watch.wait_for(|s| s.state == TunnelState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_background_reconnect_is_silent() {
        // first open succeeds, the next two fail, then it recovers
        struct FlakyTransport {
            opens: AtomicUsize,
        }

        impl TunnelTransport for FlakyTransport {
            async fn open(&self, target: &Target, port: u16) -> Result<TunnelStream> {
                let n = self.opens.fetch_add(1, Ordering::SeqCst);
                if n == 1 || n == 2 {
                    return Err(Error::Tunnel {
                        target: target.to_string(),
                        reason: format!("stream to {} reset", port),
                    });
                }
                EchoTransport::new(0).open(target, port).await
            }
        }

        let transport = Arc::new(FlakyTransport {
            opens: AtomicUsize::new(0),
        });
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(Arc::clone(&transport), target(), 19000, fast_options(), &root)
                .unwrap();
        let watch = session.watch_state();

        session.start().await.unwrap();
        assert_eq!(echo_roundtrip(&session.address(), b"one").await, b"one");
        assert_eq!(echo_roundtrip(&session.address(), b"two").await, b"two");

        assert_eq!(transport.opens.load(Ordering::SeqCst), 4);
        assert_eq!(session.state(), TunnelState::Ready);
        assert!(watch.has_changed().unwrap());

        session.stop();
    }

    #[tokio::test]
    async fn test_caller_supplied_port() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let root = CancellationToken::new();
        let options = TunnelOptions {
            local_port: port,
            ..fast_options()
        };
        let session =
            TunnelSession::new(EchoTransport::new(0), target(), 19000, options, &root).unwrap();
        assert_eq!(local_port(&session), port);

        // port is held by the session, a second bind must fail
        let clash = TunnelSession::new(
            EchoTransport::new(0),
            target(),
            19000,
            TunnelOptions {
                local_port: port,
                ..fast_options()
            },
            &root,
        );
        assert!(clash.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_starts_both_succeed() {
        let transport = EchoTransport::new(0);
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(Arc::clone(&transport), target(), 19000, fast_options(), &root)
                .unwrap();

        let (a, b) = tokio::join!(session.start(), session.start());
        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(session.state(), TunnelState::Ready);
        assert_eq!(echo_roundtrip(&session.address(), b"once").await, b"once");

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_open_connections() {
        /// Tracks how many upstream streams are still alive
        struct CountedStream {
            inner: tokio::io::DuplexStream,
            live: Arc<AtomicUsize>,
        }

        impl Drop for CountedStream {
            fn drop(&mut self) {
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }

        impl AsyncRead for CountedStream {
            fn poll_read(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                Pin::new(&mut self.inner).poll_read(cx, buf)
            }
        }

        impl AsyncWrite for CountedStream {
            fn poll_write(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<std::io::Result<usize>> {
                Pin::new(&mut self.inner).poll_write(cx, buf)
            }

            fn poll_flush(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Pin::new(&mut self.inner).poll_flush(cx)
            }

            fn poll_shutdown(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Pin::new(&mut self.inner).poll_shutdown(cx)
            }
        }

        struct CountingTransport {
            live: Arc<AtomicUsize>,
        }

        impl TunnelTransport for CountingTransport {
            async fn open(&self, _target: &Target, _port: u16) -> Result<TunnelStream> {
                let (ours, theirs) = tokio::io::duplex(1024);
                tokio::spawn(async move {
                    let (mut r, mut w) = tokio::io::split(theirs);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
                self.live.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(CountedStream {
                    inner: ours,
                    live: Arc::clone(&self.live),
                }))
            }
        }

        let live = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(CountingTransport {
            live: Arc::clone(&live),
        });
        let root = CancellationToken::new();
        let session =
            TunnelSession::new(transport, target(), 19000, fast_options(), &root).unwrap();
        session.start().await.unwrap();

        // connection stays open across shutdown
        let mut conn = TcpStream::connect(session.address()).await.unwrap();
        conn.write_all(b"held").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);

        session.shutdown().await;
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), TunnelState::Stopped);
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = ReconnectBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }
}
