//! Running-VM orchestration.
//!
//! [`RunningVm::create`] provisions and creates a VM for one container;
//! [`RunningVm::start`] boots it and brings up the guest control channel;
//! [`RunningVm::wait`] resolves when the VM exits; [`RunningVm::shutdown`]
//! tears everything down.

use super::console::{ConsoleTail, dump_console_log};
use super::stdio::{StdioForwarder, StdioPaths};
use crate::constants::{ports, timeouts, vm_defaults};
use crate::net::{NetworkAttachment, PortAllocator, PortReservation};
use crate::options::VmshimOptions;
use crate::portal::{
    CommandOutput, GrpcConnector, GuestConnector, GuestSession, GuestTransport, split_command,
};
use crate::provision::{GuestMount, ProvisionRequest, RootfsMount, TimeSyncWriter, provision};
use crate::util::{TaskGroup, spawn_supervised};
use crate::vmm::{
    Bootloader, Device, Hypervisor, NewVmOptions, Platform, VirtualMachine,
    VirtualMachineStateChange, VirtualMachineStateType, create_vm, validate_resources,
    wait_for_vm_state,
};
use crate::vsock::{ClientConnectionType, ProxyHandle, expose_guest_port};
use oci_spec::runtime::Spec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};
use vmshim_shared::layout::WorkdirLayout;

/// One container to run in its own VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciVmConfig {
    /// Container id; also the VM id.
    pub id: String,
    pub spec: Spec,
    pub rootfs: Vec<RootfsMount>,
    pub platform: Platform,
    pub vcpus: u32,
    pub memory_bytes: u64,
    #[serde(default)]
    pub stdio: StdioPaths,
}

impl OciVmConfig {
    pub fn new(id: impl Into<String>, spec: Spec, rootfs: Vec<RootfsMount>, platform: Platform) -> Self {
        Self {
            id: id.into(),
            spec,
            rootfs,
            platform,
            vcpus: vm_defaults::DEFAULT_CPUS,
            memory_bytes: vm_defaults::DEFAULT_MEMORY_BYTES,
            stdio: StdioPaths::default(),
        }
    }

    pub fn with_resources(mut self, vcpus: u32, memory_bytes: u64) -> Self {
        self.vcpus = vcpus;
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn with_stdio(mut self, stdio: StdioPaths) -> Self {
        self.stdio = stdio;
        self
    }

    fn validate(&self) -> VmshimResult<()> {
        if self.id.is_empty() || self.id.contains('/') {
            return Err(VmshimError::InvalidArgument(format!(
                "invalid container id '{}'",
                self.id
            )));
        }
        validate_resources(self.vcpus, self.memory_bytes)
    }
}

/// Process-wide collaborators a VM is created with.
#[derive(Clone)]
pub struct VmContext {
    pub options: VmshimOptions,
    pub ports: PortAllocator,
    pub network: Arc<dyn NetworkAttachment>,
    pub connector: Arc<dyn GuestConnector>,
}

impl VmContext {
    pub fn new(
        options: VmshimOptions,
        ports: PortAllocator,
        network: Arc<dyn NetworkAttachment>,
    ) -> Self {
        Self {
            ports,
            network,
            connector: Arc::new(GrpcConnector::new(options.rpc_timeout())),
            options,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn GuestConnector>) -> Self {
        self.connector = connector;
        self
    }
}

/// How a VM ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmExit {
    Stopped,
    Failed(String),
}

/// A provisioned VM running one container.
pub struct RunningVm<VM: VirtualMachine> {
    id: String,
    vm: Arc<VM>,
    bootloader: Bootloader,
    guest_mounts: Vec<GuestMount>,
    layout: WorkdirLayout,
    workdir: Mutex<Option<tempfile::TempDir>>,
    host_port: u16,
    port: Mutex<Option<PortReservation>>,
    network: Arc<dyn NetworkAttachment>,
    transport: GuestTransport<VM>,
    options: VmshimOptions,
    stdio_paths: StdioPaths,
    stdio: tokio::sync::Mutex<StdioForwarder>,
    exit: Arc<watch::Sender<Option<VmExit>>>,
    lifetime: CancellationToken,
    background: Mutex<Vec<JoinHandle<VmshimResult<()>>>>,
    supervisor: Mutex<Option<JoinHandle<VmshimResult<()>>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl<VM: VirtualMachine> RunningVm<VM> {
    /// Provision and create (but do not start) the VM for `config`.
    ///
    /// Configuration is validated before anything is allocated. On any later
    /// failure the working directory is removed again.
    pub async fn create<H>(hv: &H, ctx: &VmContext, config: OciVmConfig) -> VmshimResult<Self>
    where
        H: Hypervisor<Vm = VM> + ?Sized,
    {
        ctx.options.validate()?;
        config.validate()?;

        let vms_dir = ctx.options.vms_dir();
        std::fs::create_dir_all(&vms_dir)?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{}-", config.id))
            .tempdir_in(&vms_dir)?;
        let layout = WorkdirLayout::new(workdir.path());

        let network_device = ctx.network.device()?;
        let provisioned = provision(ProvisionRequest {
            container_id: &config.id,
            spec: &config.spec,
            rootfs: &config.rootfs,
            platform: &config.platform,
            workdir: &layout,
            build_dir: ctx.options.build_dir.as_deref(),
            network: Some(&network_device),
        })?;

        let port = ctx.ports.reserve()?;
        let host_port = port.port();

        let vm = create_vm(
            hv,
            &config.id,
            NewVmOptions {
                vcpus: config.vcpus,
                memory_bytes: config.memory_bytes,
                devices: provisioned.devices,
                platform: config.platform.clone(),
            },
            provisioned.bootloader.clone(),
        )
        .await?;

        tracing::info!(
            vm_id = %config.id,
            workdir = %layout.root().display(),
            host_port,
            network = ctx.network.name(),
            "VM created"
        );

        let transport = GuestTransport::new(
            Arc::clone(&vm),
            ports::GUEST_SERVICE,
            ctx.options.dial,
            Arc::clone(&ctx.connector),
        );
        let (exit, _) = watch::channel(None);

        Ok(Self {
            id: config.id,
            vm,
            bootloader: provisioned.bootloader,
            guest_mounts: provisioned.guest_mounts,
            layout,
            workdir: Mutex::new(Some(workdir)),
            host_port,
            port: Mutex::new(Some(port)),
            network: Arc::clone(&ctx.network),
            transport,
            options: ctx.options.clone(),
            stdio_paths: config.stdio,
            stdio: tokio::sync::Mutex::new(StdioForwarder::default()),
            exit: Arc::new(exit),
            lifetime: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vm(&self) -> &Arc<VM> {
        &self.vm
    }

    pub fn bootloader(&self) -> &Bootloader {
        &self.bootloader
    }

    pub fn devices(&self) -> &[Device] {
        self.vm.devices()
    }

    pub fn guest_mounts(&self) -> &[GuestMount] {
        &self.guest_mounts
    }

    pub fn workdir(&self) -> &Path {
        self.layout.root()
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Exit status, if the VM has exited.
    pub fn exit_status(&self) -> Option<VmExit> {
        self.exit.borrow().clone()
    }

    /// Boot the VM and connect to the guest service.
    ///
    /// Network readiness and boot run concurrently; the first failure
    /// cancels the other. The guest control channel is dialed only once the
    /// VM is running, and a failed clock sync fails the start.
    pub async fn start(&self, cancel: &CancellationToken) -> VmshimResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VmshimError::InvalidState(format!(
                "vm {} already started",
                self.id
            )));
        }

        // Subscribed before boot so no terminal transition is missed.
        let changes = self.vm.state_changes();
        *self.supervisor.lock() = Some(spawn_supervised(
            "exit-supervisor",
            supervise_exit(
                Arc::clone(&self.vm),
                changes,
                Arc::clone(&self.exit),
                self.lifetime.child_token(),
            ),
        ));

        if !self.stdio_paths.is_empty() {
            let forwarder = StdioForwarder::start(&*self.vm, &self.stdio_paths, &self.lifetime).await?;
            *self.stdio.lock().await = forwarder;
        }

        self.track(spawn_supervised(
            "timesync",
            TimeSyncWriter::new(
                &self.layout.runtime_data(),
                self.options.time_sync.interval(),
                self.options.time_sync.duration(),
            )
            .run(self.lifetime.child_token()),
        ));

        let mut group = TaskGroup::new(cancel);
        {
            let network = Arc::clone(&self.network);
            let token = group.token();
            group.spawn("network-wait", async move { network.wait(&token).await });
        }
        let boot_token = group.token();
        group.spawn(
            "boot",
            boot(
                Arc::clone(&self.vm),
                self.options.boot_timeout(),
                boot_token,
                self.layout.console_log_path(),
            ),
        );
        group.wait().await?;

        tracing::info!(vm_id = %self.id, "VM running");

        {
            let vm = Arc::clone(&self.vm);
            let token = self.lifetime.child_token();
            self.track(spawn_supervised("vm-background", async move {
                vm.run_background_tasks(token).await
            }));
        }
        self.track(spawn_supervised(
            "console-tail",
            ConsoleTail::new(self.id.clone(), self.layout.console_log_path())
                .run(self.lifetime.child_token()),
        ));

        let session = self.session(cancel).await?;
        self.call("clock sync", cancel, session.sync_clock()).await?;
        tracing::debug!(vm_id = %self.id, "Guest ready");
        Ok(())
    }

    /// Guest control channel, dialing on first use.
    pub async fn session(&self, cancel: &CancellationToken) -> VmshimResult<GuestSession> {
        Ok(GuestSession::new(self.transport.session(cancel).await?))
    }

    /// Run a space-separated command line in the guest.
    pub async fn run_command_simple(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> VmshimResult<CommandOutput> {
        split_command(command)?;
        let session = self.session(cancel).await?;
        self.call("run command", cancel, session.run_command_simple(command))
            .await
    }

    /// Run a control-channel call under the RPC deadline, abandoning it on cancel.
    async fn call<T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        rpc: impl Future<Output = VmshimResult<T>>,
    ) -> VmshimResult<T> {
        let limit = self.options.rpc_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VmshimError::Cancelled(format!("{} on vm {}", what, self.id))),
            r = tokio::time::timeout(limit, rpc) => r.unwrap_or_else(|_| {
                Err(VmshimError::Timeout(format!(
                    "{} on vm {} took longer than {:?}",
                    what, self.id, limit
                )))
            }),
        }
    }

    /// Block until the VM exits. Any number of callers may wait.
    pub async fn wait(&self) -> VmshimResult<()> {
        let mut rx = self.exit.subscribe();
        let exit = rx
            .wait_for(|exit| exit.is_some())
            .await
            .map_err(|_| VmshimError::Internal("exit channel closed".into()))?
            .clone();
        match exit {
            Some(VmExit::Stopped) => Ok(()),
            Some(VmExit::Failed(reason)) => Err(VmshimError::Engine(format!(
                "vm {} failed: {}",
                self.id, reason
            ))),
            None => Err(VmshimError::Internal("exit resolved without a value".into())),
        }
    }

    /// Publish a guest port on a host endpoint for the life of the VM.
    pub async fn expose_port(
        &self,
        guest_port: u32,
        endpoint: ClientConnectionType,
    ) -> VmshimResult<ProxyHandle> {
        expose_guest_port(Arc::clone(&self.vm), guest_port, endpoint, &self.lifetime).await
    }

    /// Stop the VM and release everything it holds.
    ///
    /// Idempotent. The working directory is removed unless `keep_workdir`
    /// is set.
    pub async fn shutdown(&self) -> VmshimResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stdio.lock().await.close().await;

        let mut result = Ok(());
        if self.vm.can_stop() {
            match self.vm.stop().await {
                Ok(()) => {
                    if let Err(e) = wait_for_vm_state(
                        &*self.vm,
                        VirtualMachineStateType::Stopped,
                        timeouts::VM_STOP,
                        &CancellationToken::new(),
                    )
                    .await
                    {
                        tracing::warn!(vm_id = %self.id, "VM did not stop cleanly: {}", e);
                    }
                }
                Err(e) => {
                    tracing::warn!(vm_id = %self.id, "Stopping VM failed: {}", e);
                    result = Err(e);
                }
            }
        }

        // The supervisor drains queued transitions on cancel, so a crash
        // that raced this shutdown still wins over a plain stop.
        self.lifetime.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(mut task) = supervisor {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        let outcome = match exit_from(self.vm.current_state(), None) {
            Some(failed @ VmExit::Failed(_)) => failed,
            _ => VmExit::Stopped,
        };
        resolve_exit(&self.exit, outcome);

        let tasks: Vec<_> = self.background.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        drop(self.port.lock().take());

        let workdir = self.workdir.lock().take();
        if let Some(dir) = workdir {
            if self.options.keep_workdir {
                #[allow(deprecated)]
                let path: PathBuf = dir.into_path();
                tracing::info!(vm_id = %self.id, workdir = %path.display(), "Keeping working directory");
            } else if let Err(e) = dir.close() {
                tracing::warn!(vm_id = %self.id, "Failed to remove working directory: {}", e);
            }
        }

        tracing::info!(vm_id = %self.id, "VM shut down");
        result
    }

    fn track(&self, handle: JoinHandle<VmshimResult<()>>) {
        let mut background = self.background.lock();
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }
}

impl<VM: VirtualMachine> Drop for RunningVm<VM> {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Start the VM and wait for it to run, dumping the console on failure.
async fn boot<VM>(
    vm: Arc<VM>,
    timeout: Duration,
    cancel: CancellationToken,
    console_log: PathBuf,
) -> VmshimResult<()>
where
    VM: VirtualMachine,
{
    let result = async {
        vm.start().await?;
        wait_for_vm_state(&*vm, VirtualMachineStateType::Running, timeout, &cancel).await
    }
    .await;

    if let Err(e) = &result {
        if !e.is_cancelled() {
            tracing::error!(vm_id = %vm.id(), "Boot failed: {}", e);
            dump_console_log(vm.id(), &console_log);
        }
    }
    result
}

/// Resolve the exit slot from the VM's terminal transition.
async fn supervise_exit<VM>(
    vm: Arc<VM>,
    mut changes: broadcast::Receiver<VirtualMachineStateChange>,
    exit: Arc<watch::Sender<Option<VmExit>>>,
    cancel: CancellationToken,
) -> VmshimResult<()>
where
    VM: VirtualMachine,
{
    let outcome = loop {
        let change = tokio::select! {
            biased;
            _ = cancel.cancelled() => match drain_terminal(&mut changes) {
                Some(outcome) => break outcome,
                None => return Ok(()),
            },
            change = changes.recv() => change,
        };
        match change {
            Ok(change) => {
                if let Some(outcome) = exit_from(change.state, change.reason()) {
                    break outcome;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(vm_id = %vm.id(), skipped, "Exit supervisor lagged");
                if let Some(outcome) = exit_from(vm.current_state(), None) {
                    break outcome;
                }
            }
            Err(RecvError::Closed) => {
                break VmExit::Failed("state notifications closed".to_string());
            }
        }
    };

    tracing::info!(vm_id = %vm.id(), exit = ?outcome, "VM exited");
    resolve_exit(&exit, outcome);
    Ok(())
}

/// Terminal outcome among transitions already queued, if any.
fn drain_terminal(
    changes: &mut broadcast::Receiver<VirtualMachineStateChange>,
) -> Option<VmExit> {
    loop {
        match changes.try_recv() {
            Ok(change) => {
                if let Some(outcome) = exit_from(change.state, change.reason()) {
                    return Some(outcome);
                }
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
        }
    }
}

fn exit_from(state: VirtualMachineStateType, reason: Option<&str>) -> Option<VmExit> {
    match state {
        VirtualMachineStateType::Stopped => Some(VmExit::Stopped),
        VirtualMachineStateType::Error => Some(VmExit::Failed(
            reason.unwrap_or("vm entered error state").to_string(),
        )),
        _ => None,
    }
}

/// Write the exit slot once; later writes are ignored.
fn resolve_exit(exit: &watch::Sender<Option<VmExit>>, outcome: VmExit) -> bool {
    exit.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(outcome);
            true
        } else {
            false
        }
    })
}
