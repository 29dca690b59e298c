//! Integration tests for host/guest vsock proxies.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use vmshim::vmm::{Bootloader, NewVmOptions, Platform};
use vmshim::vsock::{
    ClientConnectionType, ProxyInfo, connect_guest_port, expose_guest_port, listen_guest_port,
};
use vmshim_shared::errors::VmshimError;
use vmshim_test_utils::{FakeBehavior, FakeVm};

const PORT: u32 = 5000;

fn fake_vm() -> Arc<FakeVm> {
    fake_vm_with(FakeBehavior {
        accept_unlistened: false,
        ..FakeBehavior::default()
    })
}

fn fake_vm_with(behavior: FakeBehavior) -> Arc<FakeVm> {
    Arc::new(FakeVm::new(
        "vm-1",
        NewVmOptions::new(1, 256 << 20, Platform::linux_arm64()),
        Bootloader {
            kernel_path: "/k".into(),
            initrd_path: None,
            cmdline: String::new(),
        },
        behavior,
    ))
}

async fn read_exact_string<R: AsyncReadExt + Unpin>(reader: &mut R, len: usize) -> String {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(2), reader.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    String::from_utf8(buf).unwrap()
}

async fn read_to_eof<R: AsyncReadExt + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), reader.read_to_end(&mut buf))
        .await
        .expect("eof timed out")
        .expect("read failed");
    buf
}

// ============================================================================
// HOST CONNECTS
// ============================================================================

#[tokio::test]
async fn connect_bridges_both_directions_in_order() {
    let vm = fake_vm();
    let mut accepts = vm.guest_listen(PORT);
    let parent = CancellationToken::new();

    let (mut caller, handle) = connect_guest_port(&*vm, PORT, &parent).await.unwrap();
    let mut guest = accepts.recv().await.unwrap();
    assert!(matches!(handle.info(), ProxyInfo::HostConnects(_)));
    assert_eq!(handle.info().guest_port(), PORT);

    for chunk in ["one,", "two,", "three"] {
        caller.write_all(chunk.as_bytes()).await.unwrap();
    }
    assert_eq!(read_exact_string(&mut guest, 13).await, "one,two,three");

    guest.write_all(b"pong").await.unwrap();
    assert_eq!(read_exact_string(&mut caller, 4).await, "pong");

    handle.close().await;
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let vm = fake_vm();
    let err = connect_guest_port(&*vm, PORT, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VmshimError::Portal(_)), "{err}");
}

#[tokio::test]
async fn guest_eof_closes_caller_side() {
    let vm = fake_vm();
    let mut accepts = vm.guest_listen(PORT);
    let (mut caller, _handle) = connect_guest_port(&*vm, PORT, &CancellationToken::new())
        .await
        .unwrap();
    let mut guest = accepts.recv().await.unwrap();

    guest.write_all(b"bye").await.unwrap();
    drop(guest);
    assert_eq!(read_to_eof(&mut caller).await, b"bye");
}

// ============================================================================
// GUEST CONNECTS
// ============================================================================

#[tokio::test]
async fn listen_accepts_guest_connection() {
    let vm = fake_vm();
    let (mut caller, handle) = listen_guest_port(&*vm, PORT, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(handle.info(), ProxyInfo::GuestConnects(_)));
    assert!(vm.is_host_listening(PORT));

    // Bytes written before the guest dials are delivered once it does.
    caller.write_all(b"early").await.unwrap();
    let mut guest = vm.guest_connect(PORT).unwrap();
    assert_eq!(read_exact_string(&mut guest, 5).await, "early");

    guest.write_all(b"stdout").await.unwrap();
    assert_eq!(read_exact_string(&mut caller, 6).await, "stdout");
}

#[tokio::test]
async fn close_is_idempotent_and_ends_caller_stream() {
    let vm = fake_vm();
    let (mut caller, handle) = listen_guest_port(&*vm, PORT, &CancellationToken::new())
        .await
        .unwrap();

    handle.close().await;
    handle.close().await;
    assert!(handle.is_closed());
    assert!(read_to_eof(&mut caller).await.is_empty());
}

#[tokio::test]
async fn parent_cancel_closes_proxy() {
    let vm = fake_vm();
    let parent = CancellationToken::new();
    let (mut caller, handle) = listen_guest_port(&*vm, PORT, &parent).await.unwrap();

    parent.cancel();
    assert!(handle.is_closed());
    assert!(read_to_eof(&mut caller).await.is_empty());
}

// ============================================================================
// EXPOSED ENDPOINTS
// ============================================================================

#[tokio::test]
async fn expose_over_unix_socket_file() {
    let vm = fake_vm();
    let mut accepts = vm.guest_listen(PORT);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("port.sock");

    let handle = expose_guest_port(
        Arc::clone(&vm),
        PORT,
        ClientConnectionType::UnixSocketFile { path: path.clone() },
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(handle.socket_path(), Some(path.as_path()));

    let mut client = UnixStream::connect(&path).await.unwrap();
    let mut guest = accepts.recv().await.unwrap();
    client.write_all(b"GET /").await.unwrap();
    assert_eq!(read_exact_string(&mut guest, 5).await, "GET /");
    guest.write_all(b"200").await.unwrap();
    assert_eq!(read_exact_string(&mut client, 3).await, "200");

    handle.close().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn expose_over_ephemeral_tcp_port() {
    let vm = fake_vm();
    let mut accepts = vm.guest_listen(PORT);

    let handle = expose_guest_port(
        Arc::clone(&vm),
        PORT,
        ClientConnectionType::Tcp { port: 0 },
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    let port = handle.tcp_port().expect("bound port recorded");
    assert_ne!(port, 0);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut guest = accepts.recv().await.unwrap();
    guest.write_all(b"hello").await.unwrap();
    assert_eq!(read_exact_string(&mut client, 5).await, "hello");

    handle.close().await;
}

#[tokio::test]
async fn expose_rejects_datagram_and_pair_endpoints() {
    let vm = fake_vm();
    let cancel = CancellationToken::new();

    let err = expose_guest_port(
        Arc::clone(&vm),
        PORT,
        ClientConnectionType::Udp { port: 0 },
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VmshimError::Unsupported(_)), "{err}");

    let err = expose_guest_port(
        Arc::clone(&vm),
        PORT,
        ClientConnectionType::UnixSocketPair,
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VmshimError::InvalidArgument(_)), "{err}");
}

#[tokio::test]
async fn slow_guest_dial_does_not_delay_close() {
    let vm = fake_vm_with(FakeBehavior {
        connect_delay: Duration::from_secs(30),
        ..FakeBehavior::default()
    });
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("slow.sock");
    let handle = expose_guest_port(
        Arc::clone(&vm),
        PORT,
        ClientConnectionType::UnixSocketFile { path: path.clone() },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // Both clients are accepted even though the first guest dial is stuck.
    let _first = UnixStream::connect(&path).await.unwrap();
    let _second = UnixStream::connect(&path).await.unwrap();
    let attempts = Arc::clone(&vm);
    tokio::time::timeout(Duration::from_secs(2), async move {
        while attempts.connect_attempts() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second client never dialed the guest");

    let started = Instant::now();
    handle.close().await;
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
}
