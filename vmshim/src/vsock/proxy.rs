//! Host-side proxies between local sockets and guest VM-socket ports.
//!
//! Three shapes are supported:
//! - [`connect_guest_port`]: dial a port the guest listens on and hand the
//!   caller one end of a socket pair.
//! - [`listen_guest_port`]: listen for the guest dialing a port and hand the
//!   caller one end of a socket pair.
//! - [`expose_guest_port`]: publish a guest port as a Unix socket file or a
//!   loopback TCP listener; every local client gets its own guest connection.
//!
//! Each proxy copies bytes in both directions until either side reaches EOF
//! or the connection is closed, after which both directions stop.

use super::{
    ClientConnectionType, ProxyInfo, TransferType, VsockClientConnection, VsockServerListener,
    VsockStream,
};
use crate::constants::timeouts;
use crate::vmm::VirtualMachine;
use chrono::Utc;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Handle to a running proxy. Closing is idempotent; dropping the handle
/// requests cancellation without waiting.
pub struct ProxyHandle {
    info: ProxyInfo,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    socket_path: Option<PathBuf>,
    closed: AtomicBool,
}

impl ProxyHandle {
    fn new(info: ProxyInfo, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        let socket_path = match info.connection_type() {
            ClientConnectionType::UnixSocketFile { path } => Some(path.clone()),
            _ => None,
        };
        Self {
            info,
            cancel,
            task: Mutex::new(Some(task)),
            socket_path,
            closed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &ProxyInfo {
        &self.info
    }

    /// Socket file callers connect to, for Unix-socket-file proxies.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Bound loopback port, for TCP proxies.
    pub fn tcp_port(&self) -> Option<u16> {
        match self.info.connection_type() {
            ClientConnectionType::Tcp { port } => Some(*port),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Stop forwarding and release everything the proxy holds.
    ///
    /// Order: forwarding task, internal socket pair, exposed listener, guest
    /// connection. The task drops the last three in that order as it unwinds.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(timeouts::PROXY_CLOSE, &mut task).await.is_err() {
                tracing::warn!(
                    guest_port = self.info.guest_port(),
                    "Proxy task did not stop in time, aborting"
                );
                task.abort();
            }
        }

        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), "Failed to remove proxy socket: {}", e);
                }
            }
        }
        tracing::debug!(guest_port = self.info.guest_port(), "Proxy closed");
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dial guest `port` and bridge it to a fresh socket pair.
///
/// Returns the caller's end of the pair and the proxy handle.
pub async fn connect_guest_port<VM>(
    vm: &VM,
    port: u32,
    parent: &CancellationToken,
) -> VmshimResult<(UnixStream, ProxyHandle)>
where
    VM: VirtualMachine + ?Sized,
{
    let guest = vm.vsock_connect(port).await.map_err(|e| {
        VmshimError::Portal(format!("connect to guest vsock port {}: {}", port, e))
    })?;
    let (caller, internal) = UnixStream::pair()?;

    let cancel = parent.child_token();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let (pair, guest) = bridge(internal, guest, &cancel, port).await;
            drop(pair);
            drop(guest);
        }
    });

    let info = ProxyInfo::HostConnects(VsockClientConnection {
        guest_port: port,
        connection_type: ClientConnectionType::UnixSocketPair,
        transfer_type: TransferType::Stream,
        created_at: Utc::now(),
    });
    tracing::debug!(guest_port = port, "Proxy connected to guest port");
    Ok((caller, ProxyHandle::new(info, cancel, task)))
}

/// Listen for the guest dialing `port` and bridge the first connection to a
/// fresh socket pair.
///
/// The caller's end is usable immediately; bytes flow once the guest
/// connects.
pub async fn listen_guest_port<VM>(
    vm: &VM,
    port: u32,
    parent: &CancellationToken,
) -> VmshimResult<(UnixStream, ProxyHandle)>
where
    VM: VirtualMachine + ?Sized,
{
    let mut listener = vm.vsock_listen(port).await.map_err(|e| {
        VmshimError::Portal(format!("listen on guest vsock port {}: {}", port, e))
    })?;
    let (caller, internal) = UnixStream::pair()?;

    let cancel = parent.child_token();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = listener.accept() => Some(r),
            };
            match accepted {
                Some(Ok(guest)) => {
                    tracing::debug!(guest_port = port, "Guest connected to proxy");
                    let (pair, guest) = bridge(internal, guest, &cancel, port).await;
                    drop(pair);
                    drop(listener);
                    drop(guest);
                }
                Some(Err(e)) => {
                    tracing::warn!(guest_port = port, "Accepting guest connection failed: {}", e);
                }
                None => {}
            }
        }
    });

    let info = ProxyInfo::GuestConnects(VsockServerListener {
        guest_port: port,
        connection_type: ClientConnectionType::UnixSocketPair,
        transfer_type: TransferType::Stream,
        created_at: Utc::now(),
    });
    Ok((caller, ProxyHandle::new(info, cancel, task)))
}

/// Publish guest `port` on a local endpoint.
///
/// `endpoint` selects the listener: a Unix socket file or a loopback TCP
/// port (`port: 0` picks a free one, reported by [`ProxyHandle::tcp_port`]).
/// UDP is not supported.
pub async fn expose_guest_port<VM>(
    vm: Arc<VM>,
    port: u32,
    endpoint: ClientConnectionType,
    parent: &CancellationToken,
) -> VmshimResult<ProxyHandle>
where
    VM: VirtualMachine + ?Sized,
{
    let cancel = parent.child_token();
    let (connection_type, task) = match endpoint {
        ClientConnectionType::UnixSocketFile { path } => {
            let listener = UnixListener::bind(&path).map_err(|e| {
                VmshimError::Portal(format!("bind proxy socket {}: {}", path.display(), e))
            })?;
            let task = tokio::spawn(serve(vm, port, cancel.clone(), LocalListener::Unix(listener)));
            (ClientConnectionType::UnixSocketFile { path }, task)
        }
        ClientConnectionType::Tcp { port: local_port } => {
            let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)))
                .await
                .map_err(|e| {
                    VmshimError::Portal(format!("bind proxy tcp port {}: {}", local_port, e))
                })?;
            let bound = listener.local_addr()?.port();
            let task = tokio::spawn(serve(vm, port, cancel.clone(), LocalListener::Tcp(listener)));
            (ClientConnectionType::Tcp { port: bound }, task)
        }
        ClientConnectionType::Udp { .. } => {
            return Err(VmshimError::Unsupported(
                "datagram proxies are not supported".into(),
            ));
        }
        ClientConnectionType::UnixSocketPair => {
            return Err(VmshimError::InvalidArgument(
                "socket-pair proxies are created with connect_guest_port".into(),
            ));
        }
    };

    tracing::debug!(guest_port = port, endpoint = ?connection_type, "Exposed guest port");
    let info = ProxyInfo::HostConnects(VsockClientConnection {
        guest_port: port,
        connection_type,
        transfer_type: TransferType::Stream,
        created_at: Utc::now(),
    });
    Ok(ProxyHandle::new(info, cancel, task))
}

enum LocalListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl LocalListener {
    async fn accept(&self) -> io::Result<VsockStream> {
        match self {
            LocalListener::Unix(l) => l.accept().await.map(|(s, _)| Box::new(s) as VsockStream),
            LocalListener::Tcp(l) => l.accept().await.map(|(s, _)| Box::new(s) as VsockStream),
        }
    }
}

/// Accept local clients until cancelled, bridging each to its own guest
/// connection. The listener is dropped once every client bridge has ended.
async fn serve<VM>(vm: Arc<VM>, port: u32, cancel: CancellationToken, listener: LocalListener)
where
    VM: VirtualMachine + ?Sized,
{
    let mut clients = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        let local = match accepted {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(guest_port = port, "Accepting proxy client failed: {}", e);
                continue;
            }
        };
        let vm = Arc::clone(&vm);
        let cancel = cancel.child_token();
        clients.spawn(async move {
            let dialed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = vm.vsock_connect(port) => r,
            };
            let guest = match dialed {
                Ok(guest) => guest,
                Err(e) => {
                    tracing::warn!(guest_port = port, "Guest port unreachable for proxy client: {}", e);
                    return;
                }
            };
            let (local, guest) = bridge(local, guest, &cancel, port).await;
            drop(local);
            drop(guest);
        });
        // Reap finished bridges without blocking.
        while clients.try_join_next().is_some() {}
    }
    while clients.join_next().await.is_some() {}
    drop(listener);
}

type Halves<T> = (ReadHalf<T>, WriteHalf<T>);

/// Copy bytes both ways between `local` and `guest` until both directions
/// stop. Returns the split halves so the caller controls drop order.
async fn bridge<L, G>(
    local: L,
    guest: G,
    cancel: &CancellationToken,
    port: u32,
) -> (Halves<L>, Halves<G>)
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    G: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (local_r, local_w) = tokio::io::split(local);
    let (guest_r, guest_w) = tokio::io::split(guest);

    let ((guest_r, local_w), (local_r, guest_w)) = tokio::join!(
        pump("guest->host", guest_r, local_w, cancel, port),
        pump("host->guest", local_r, guest_w, cancel, port),
    );
    ((local_r, local_w), (guest_r, guest_w))
}

/// One copy direction.
///
/// EOF or a closed peer cancels the whole bridge. Any other error stops only
/// this direction.
async fn pump<R, W>(
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    cancel: &CancellationToken,
    port: u32,
) -> (R, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = reader.read(&mut buf) => r,
        };
        let n = match read {
            Ok(0) => {
                tracing::trace!(guest_port = port, direction, "EOF");
                cancel.cancel();
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log_copy_error(direction, port, &e);
                if is_closed(&e) {
                    cancel.cancel();
                }
                break;
            }
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => r,
        };
        if let Err(e) = written {
            log_copy_error(direction, port, &e);
            if is_closed(&e) {
                cancel.cancel();
            }
            break;
        }
    }
    (reader, writer)
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn log_copy_error(direction: &'static str, port: u32, e: &io::Error) {
    if is_closed(e) {
        tracing::debug!(guest_port = port, direction, "Proxy peer closed: {}", e);
    } else {
        tracing::warn!(guest_port = port, direction, "Proxy copy failed: {}", e);
    }
}
