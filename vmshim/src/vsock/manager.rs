//! Managed VM-socket link with on-demand (re)dialing.
//!
//! A [`VsockManager`] owns at most one live connection to a guest port.
//! Callers ask for the connection with [`VsockManager::connect`]; concurrent
//! callers share a single dial, and a link that fails (read or write error,
//! EOF) is dropped so the next caller dials again.

use super::VsockStream;
use crate::constants::{VSOCK_MAX_RETRIES, timeouts};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};

type DialFn = Arc<dyn Fn() -> BoxFuture<'static, io::Result<VsockStream>> + Send + Sync>;

/// Link state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsockState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Pause between failed dials.
    pub interval: Duration,
    /// Dial attempts before `connect` gives up. Zero is treated as one.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: timeouts::VSOCK_RETRY_INTERVAL,
            max_retries: VSOCK_MAX_RETRIES,
        }
    }
}

struct Link {
    current: Mutex<Option<Arc<ManagedConnection>>>,
    state: watch::Sender<VsockState>,
}

impl Link {
    fn connected(&self) -> Option<Arc<ManagedConnection>> {
        self.current.lock().clone()
    }

    fn install(&self, conn: Arc<ManagedConnection>) {
        let mut current = self.current.lock();
        *current = Some(conn);
        self.state.send_replace(VsockState::Connected);
    }

    /// Forget `id` if it is still the live connection.
    fn forget(&self, id: u64) -> bool {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| c.id == id) {
            *current = None;
            self.state.send_replace(VsockState::Disconnected);
            true
        } else {
            false
        }
    }

    fn take(&self) -> Option<Arc<ManagedConnection>> {
        let mut current = self.current.lock();
        let conn = current.take();
        self.state.send_replace(VsockState::Disconnected);
        conn
    }
}

/// Owner of a single reconnecting VM-socket link.
pub struct VsockManager {
    name: String,
    dial: DialFn,
    policy: RetryPolicy,
    /// Held for a whole dial cycle. Guards the failure of the last finished cycle.
    dial_lock: tokio::sync::Mutex<Option<String>>,
    /// Bumped each time a dial cycle finishes, successful or not.
    dial_generation: AtomicU64,
    link: Arc<Link>,
    next_id: AtomicU64,
}

impl VsockManager {
    /// `dial` opens a fresh stream to the guest each time it is called.
    pub fn new<F, Fut>(name: impl Into<String>, policy: RetryPolicy, dial: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<VsockStream>> + Send + 'static,
    {
        let (state, _) = watch::channel(VsockState::Disconnected);
        Self {
            name: name.into(),
            dial: Arc::new(move || -> BoxFuture<'static, io::Result<VsockStream>> {
                Box::pin(dial())
            }),
            policy,
            dial_lock: tokio::sync::Mutex::new(None),
            dial_generation: AtomicU64::new(0),
            link: Arc::new(Link {
                current: Mutex::new(None),
                state,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> VsockState {
        *self.link.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<VsockState> {
        self.link.state.subscribe()
    }

    /// Return the live connection, dialing if there is none.
    ///
    /// At most one dial cycle runs at a time; callers arriving during a
    /// cycle wait for it and share its result, failure included.
    pub async fn connect(&self, cancel: &CancellationToken) -> VmshimResult<Arc<ManagedConnection>> {
        if let Some(conn) = self.link.connected() {
            return Ok(conn);
        }

        let seen = self.dial_generation.load(Ordering::Acquire);
        let mut last_failure = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled()),
            guard = self.dial_lock.lock() => guard,
        };

        // Someone else may have connected while we waited for the lock.
        if let Some(conn) = self.link.connected() {
            return Ok(conn);
        }
        if self.dial_generation.load(Ordering::Acquire) != seen {
            if let Some(failure) = last_failure.as_ref() {
                return Err(VmshimError::Portal(failure.clone()));
            }
        }

        let result = self.dial_cycle(cancel).await;
        if result.as_ref().is_err_and(VmshimError::is_cancelled) {
            return result;
        }
        *last_failure = match &result {
            Err(VmshimError::Portal(msg)) => Some(msg.clone()),
            _ => None,
        };
        self.dial_generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn dial_cycle(&self, cancel: &CancellationToken) -> VmshimResult<Arc<ManagedConnection>> {
        let attempts = self.policy.max_retries.max(1);
        let mut last_error: Option<io::Error> = None;
        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                r = (self.dial)() => r,
            };
            match result {
                Ok(stream) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let conn = Arc::new(ManagedConnection::new(
                        id,
                        stream,
                        Arc::downgrade(&self.link),
                    ));
                    self.link.install(Arc::clone(&conn));
                    tracing::debug!(link = %self.name, attempt, conn_id = id, "vsock link connected");
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::debug!(link = %self.name, attempt, error = %e, "vsock dial failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(self.cancelled()),
                    _ = tokio::time::sleep(self.policy.interval) => {}
                }
            }
        }

        Err(VmshimError::Portal(format!(
            "{}: vsock dial failed after {} attempts: {}",
            self.name,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Tear down the live connection, if any.
    ///
    /// Cancellation is signalled before the stream is shut down so pending
    /// readers and writers return instead of racing the close.
    pub async fn close(&self) {
        if let Some(conn) = self.link.take() {
            conn.cancel.cancel();
            conn.shutdown().await;
            tracing::debug!(link = %self.name, conn_id = conn.id, "vsock link closed");
        }
    }

    fn cancelled(&self) -> VmshimError {
        VmshimError::Cancelled(format!("{}: vsock connect", self.name))
    }
}

/// A connection handed out by [`VsockManager`].
///
/// Any read or write failure (or EOF) marks the link lost, flipping the
/// manager back to [`VsockState::Disconnected`].
pub struct ManagedConnection {
    id: u64,
    reader: tokio::sync::Mutex<ReadHalf<VsockStream>>,
    writer: tokio::sync::Mutex<WriteHalf<VsockStream>>,
    cancel: CancellationToken,
    link: Weak<Link>,
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ManagedConnection {
    fn new(id: u64, stream: VsockStream, link: Weak<Link>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            cancel: CancellationToken::new(),
            link,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(closed()),
            r = self.reader.lock() => r,
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(closed()),
            r = reader.read(buf) => r,
        };
        match &result {
            Ok(0) if !buf.is_empty() => self.lost("eof"),
            Err(e) => self.lost(&e.to_string()),
            _ => {}
        }
        result
    }

    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(closed()),
            w = self.writer.lock() => w,
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(closed()),
            r = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => r,
        };
        if let Err(e) = &result {
            self.lost(&e.to_string());
        }
        result
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn lost(&self, reason: &str) {
        self.cancel.cancel();
        if let Some(link) = self.link.upgrade() {
            if link.forget(self.id) {
                tracing::debug!(conn_id = self.id, reason, "vsock link lost");
            }
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "vsock connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(1),
            max_retries,
        }
    }

    /// Manager whose dial hands out one end of a fresh duplex pair and keeps
    /// the peer ends for the test.
    fn duplex_manager(
        delay: Duration,
    ) -> (
        VsockManager,
        Arc<AtomicUsize>,
        Arc<Mutex<Vec<DuplexStream>>>,
    ) {
        let dials = Arc::new(AtomicUsize::new(0));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let (d, p) = (Arc::clone(&dials), Arc::clone(&peers));
        let mgr = VsockManager::new("test", fast_policy(3), move || {
            let dials = Arc::clone(&d);
            let peers = Arc::clone(&p);
            async move {
                dials.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                let (ours, theirs) = tokio::io::duplex(1024);
                peers.lock().push(theirs);
                Ok(Box::new(ours) as VsockStream)
            }
        });
        (mgr, dials, peers)
    }

    #[tokio::test]
    async fn test_concurrent_connect_dials_once() {
        let (mgr, dials, _peers) = duplex_manager(Duration::from_millis(20));
        let mgr = Arc::new(mgr);
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let mgr = Arc::clone(&mgr);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { mgr.connect(&cancel).await }));
        }

        let mut conns = Vec::new();
        for h in handles {
            conns.push(h.await.unwrap().unwrap());
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
        assert_eq!(mgr.state(), VsockState::Connected);
    }

    #[tokio::test]
    async fn test_retry_cap_reports_attempts() {
        let dials = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dials);
        let mgr = VsockManager::new("refused", fast_policy(4), move || {
            let d = Arc::clone(&d);
            async move {
                d.fetch_add(1, Ordering::SeqCst);
                Err::<VsockStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        });

        let err = mgr.connect(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(dials.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("4 attempts"), "{err}");
        assert_eq!(mgr.state(), VsockState::Disconnected);
    }

    #[tokio::test]
    async fn test_callers_queued_behind_failed_dial_share_its_error() {
        let dials = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dials);
        let policy = RetryPolicy {
            interval: Duration::from_millis(50),
            max_retries: 3,
        };
        let mgr = Arc::new(VsockManager::new("refused", policy, move || {
            let d = Arc::clone(&d);
            async move {
                d.fetch_add(1, Ordering::SeqCst);
                Err::<VsockStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        }));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = Arc::clone(&mgr);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { mgr.connect(&cancel).await }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("3 attempts"), "{err}");
        }
        assert_eq!(dials.load(Ordering::SeqCst), 3);

        // A caller arriving after the failed cycle dials afresh.
        assert!(mgr.connect(&cancel).await.is_err());
        assert_eq!(dials.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_eof_marks_link_lost_and_redials() {
        let (mgr, dials, peers) = duplex_manager(Duration::ZERO);
        let cancel = CancellationToken::new();
        let mut states = mgr.subscribe();

        let conn = mgr.connect(&cancel).await.unwrap();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), VsockState::Connected);

        peers.lock().clear();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.is_closed());
        assert_eq!(mgr.state(), VsockState::Disconnected);
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), VsockState::Disconnected);

        let again = mgr.connect(&cancel).await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &again));
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let (mgr, _dials, peers) = duplex_manager(Duration::ZERO);
        let conn = mgr.connect(&CancellationToken::new()).await.unwrap();
        let mut peer = peers.lock().pop().unwrap();

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_close_cancels_pending_read() {
        let (mgr, _dials, _peers) = duplex_manager(Duration::ZERO);
        let mgr = Arc::new(mgr);
        let conn = mgr.connect(&CancellationToken::new()).await.unwrap();

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert_eq!(mgr.state(), VsockState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let (mgr, _dials, _peers) = duplex_manager(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.cancel();
        });
        let err = mgr.connect(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
