//! Container stdio forwarding over the well-known stdio vsock ports.
//!
//! The guest dials one port per stream; each is bridged through a proxy to
//! a host path (regular file or FIFO handed over by the container runtime).

use crate::constants::{ports, timeouts};
use crate::util::spawn_supervised;
use crate::vmm::VirtualMachine;
use crate::vsock::{ProxyHandle, listen_guest_port};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::VmshimResult;

/// Host paths for the container's standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioPaths {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl StdioPaths {
    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

/// Running stdio bridges of one VM.
#[derive(Default)]
pub struct StdioForwarder {
    proxies: Vec<ProxyHandle>,
    tasks: Vec<JoinHandle<VmshimResult<()>>>,
}

impl StdioForwarder {
    /// Listen on the stdio ports for every configured path.
    pub async fn start<VM>(
        vm: &VM,
        paths: &StdioPaths,
        cancel: &CancellationToken,
    ) -> VmshimResult<Self>
    where
        VM: VirtualMachine + ?Sized,
    {
        let mut fwd = Self::default();

        if let Some(path) = &paths.stdin {
            let (local, proxy) = listen_guest_port(vm, ports::STDIN, cancel).await?;
            fwd.proxies.push(proxy);
            fwd.tasks
                .push(spawn_supervised("stdin", copy_in(path.clone(), local, cancel.clone())));
        }
        for (name, port, path) in [
            ("stdout", ports::STDOUT, &paths.stdout),
            ("stderr", ports::STDERR, &paths.stderr),
        ] {
            if let Some(path) = path {
                let (local, proxy) = listen_guest_port(vm, port, cancel).await?;
                fwd.proxies.push(proxy);
                fwd.tasks
                    .push(spawn_supervised(name, copy_out(local, path.clone(), cancel.clone())));
            }
        }

        tracing::debug!(vm_id = %vm.id(), streams = fwd.proxies.len(), "Stdio forwarding started");
        Ok(fwd)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Close the proxies, then wait briefly for the copy tasks.
    pub async fn close(&mut self) {
        for proxy in &self.proxies {
            proxy.close().await;
        }
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(timeouts::PROXY_CLOSE, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        self.proxies.clear();
    }
}

async fn copy_out(
    mut local: UnixStream,
    path: PathBuf,
    cancel: CancellationToken,
) -> VmshimResult<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        r = tokio::io::copy(&mut local, &mut file) => {
            let n = r?;
            tracing::trace!(path = %path.display(), bytes = n, "Guest output stream ended");
        }
    }
    file.flush().await?;
    Ok(())
}

async fn copy_in(path: PathBuf, mut local: UnixStream, cancel: CancellationToken) -> VmshimResult<()> {
    let mut file = tokio::fs::File::open(&path).await?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        r = tokio::io::copy(&mut file, &mut local) => {
            let n = r?;
            tracing::trace!(path = %path.display(), bytes = n, "Guest input stream ended");
        }
    }
    // The guest may already be gone.
    let _ = local.shutdown().await;
    Ok(())
}
