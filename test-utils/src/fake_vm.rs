//! In-memory hypervisor whose VM sockets are tokio duplex pipes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use vmshim::vmm::{
    Bootloader, Device, Hypervisor, NewVmOptions, StateNotifier, VirtualMachine,
    VirtualMachineStateChange, VirtualMachineStateType, VmRegistry,
};
use vmshim::vsock::{VsockListener, VsockStream};
use vmshim_shared::errors::{VmshimError, VmshimResult};

const PIPE_CAPACITY: usize = 64 * 1024;

/// What happens after `start()`.
#[derive(Debug, Clone)]
pub enum BootOutcome {
    /// Reach `Running`.
    Run,
    /// Enter `Error` with the given reason.
    Fail(String),
    /// Stay in `Starting` forever.
    Hang,
}

#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub boot_delay: Duration,
    pub boot_outcome: BootOutcome,
    /// `start()` itself returns an error.
    pub fail_start: bool,
    /// The first N `vsock_connect` calls are refused.
    pub refuse_connects: usize,
    /// Connects to ports nobody listens on succeed (the guest end is parked).
    pub accept_unlistened: bool,
    /// Every `vsock_connect` takes this long before answering.
    pub connect_delay: Duration,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            boot_delay: Duration::from_millis(10),
            boot_outcome: BootOutcome::Run,
            fail_start: false,
            refuse_connects: 0,
            accept_unlistened: true,
            connect_delay: Duration::ZERO,
        }
    }
}

pub struct FakeVm {
    id: String,
    options: NewVmOptions,
    bootloader: Bootloader,
    behavior: FakeBehavior,
    state: StateNotifier,
    guest_listeners: Mutex<HashMap<u32, mpsc::UnboundedSender<DuplexStream>>>,
    host_listeners: Mutex<HashMap<u32, mpsc::UnboundedSender<VsockStream>>>,
    parked: Mutex<Vec<DuplexStream>>,
    connect_attempts: AtomicUsize,
    background_runs: AtomicUsize,
    balloon: AtomicU64,
}

impl std::fmt::Debug for FakeVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeVm")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl FakeVm {
    pub fn new(
        id: impl Into<String>,
        options: NewVmOptions,
        bootloader: Bootloader,
        behavior: FakeBehavior,
    ) -> Self {
        let balloon = options.memory_bytes;
        Self {
            id: id.into(),
            options,
            bootloader,
            behavior,
            state: StateNotifier::new(VirtualMachineStateType::Stopped),
            guest_listeners: Mutex::new(HashMap::new()),
            host_listeners: Mutex::new(HashMap::new()),
            parked: Mutex::new(Vec::new()),
            connect_attempts: AtomicUsize::new(0),
            background_runs: AtomicUsize::new(0),
            balloon: AtomicU64::new(balloon),
        }
    }

    pub fn options(&self) -> &NewVmOptions {
        &self.options
    }

    pub fn bootloader(&self) -> &Bootloader {
        &self.bootloader
    }

    pub fn notifier(&self) -> &StateNotifier {
        &self.state
    }

    /// Guest side: accept host connections to `port`.
    pub fn guest_listen(&self, port: u32) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.guest_listeners.lock().insert(port, tx);
        rx
    }

    /// Guest side: dial a port the host listens on.
    pub fn guest_connect(&self, port: u32) -> io::Result<DuplexStream> {
        let listeners = self.host_listeners.lock();
        let tx = listeners
            .get(&port)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (host, guest) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(Box::new(host))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(guest)
    }

    pub fn is_host_listening(&self, port: u32) -> bool {
        self.host_listeners.lock().contains_key(&port)
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn background_runs(&self) -> usize {
        self.background_runs.load(Ordering::SeqCst)
    }

    /// Simulate the guest powering off.
    pub fn power_off(&self) {
        self.state.set(VirtualMachineStateType::Stopped);
    }

    /// Simulate a crash.
    pub fn crash(&self, reason: &str) {
        self.state.fail(reason);
    }
}

#[async_trait]
impl VirtualMachine for FakeVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn current_state(&self) -> VirtualMachineStateType {
        self.state.current()
    }

    fn state_changes(&self) -> broadcast::Receiver<VirtualMachineStateChange> {
        self.state.subscribe()
    }

    fn devices(&self) -> &[Device] {
        &self.options.devices
    }

    async fn start(&self) -> VmshimResult<()> {
        if !self.can_start() {
            return Err(VmshimError::InvalidState(format!(
                "cannot start vm in state {}",
                self.current_state()
            )));
        }
        if self.behavior.fail_start {
            return Err(VmshimError::Engine("fake start failure".into()));
        }
        self.state.set(VirtualMachineStateType::Starting);

        let state = self.state.clone();
        let delay = self.behavior.boot_delay;
        let outcome = self.behavior.boot_outcome.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match outcome {
                BootOutcome::Run => state.set(VirtualMachineStateType::Running),
                BootOutcome::Fail(reason) => state.fail(reason),
                BootOutcome::Hang => {}
            }
        });
        Ok(())
    }

    async fn stop(&self) -> VmshimResult<()> {
        if !self.can_stop() {
            return Err(VmshimError::InvalidState(format!(
                "cannot stop vm in state {}",
                self.current_state()
            )));
        }
        self.state.set(VirtualMachineStateType::Stopping);
        self.state.set(VirtualMachineStateType::Stopped);
        Ok(())
    }

    async fn pause(&self) -> VmshimResult<()> {
        if !self.can_pause() {
            return Err(VmshimError::InvalidState("cannot pause".into()));
        }
        self.state.set(VirtualMachineStateType::Paused);
        Ok(())
    }

    async fn resume(&self) -> VmshimResult<()> {
        if !self.can_resume() {
            return Err(VmshimError::InvalidState("cannot resume".into()));
        }
        self.state.set(VirtualMachineStateType::Running);
        Ok(())
    }

    async fn vsock_connect(&self, port: u32) -> io::Result<VsockStream> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.behavior.connect_delay.is_zero() {
            tokio::time::sleep(self.behavior.connect_delay).await;
        }
        if attempt <= self.behavior.refuse_connects {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("guest not ready (attempt {attempt})"),
            ));
        }

        let (host, guest) = tokio::io::duplex(PIPE_CAPACITY);
        let listener = self.guest_listeners.lock().get(&port).cloned();
        match listener {
            Some(tx) => tx
                .send(guest)
                .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?,
            None if self.behavior.accept_unlistened => self.parked.lock().push(guest),
            None => return Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        }
        Ok(Box::new(host))
    }

    async fn vsock_listen(&self, port: u32) -> io::Result<Box<dyn VsockListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.host_listeners.lock();
        if listeners.contains_key(&port) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        listeners.insert(port, tx);
        Ok(Box::new(FakeListener { port, rx }))
    }

    async fn run_background_tasks(&self, cancel: CancellationToken) -> VmshimResult<()> {
        self.background_runs.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Ok(())
    }

    async fn balloon_target(&self) -> VmshimResult<u64> {
        Ok(self.balloon.load(Ordering::SeqCst))
    }

    async fn set_balloon_target(&self, bytes: u64) -> VmshimResult<()> {
        if bytes > self.options.memory_bytes {
            return Err(VmshimError::InvalidArgument(
                "balloon target exceeds vm memory".into(),
            ));
        }
        self.balloon.store(bytes, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeListener {
    port: u32,
    rx: mpsc::UnboundedReceiver<VsockStream>,
}

#[async_trait]
impl VsockListener for FakeListener {
    fn port(&self) -> u32 {
        self.port
    }

    async fn accept(&mut self) -> io::Result<VsockStream> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))
    }
}

/// Hypervisor creating [`FakeVm`]s.
pub struct FakeHypervisor {
    behavior: FakeBehavior,
    registry: VmRegistry<FakeVm>,
    creates: AtomicUsize,
}

impl FakeHypervisor {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            registry: VmRegistry::new(),
            creates: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &VmRegistry<FakeVm> {
        &self.registry
    }

    pub fn get(&self, id: &str) -> Option<Arc<FakeVm>> {
        self.registry.get(id)
    }

    /// Calls that reached the backend (after validation).
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new(FakeBehavior::default())
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    type Vm = FakeVm;

    async fn create(
        &self,
        id: &str,
        options: NewVmOptions,
        bootloader: Bootloader,
    ) -> VmshimResult<Arc<FakeVm>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let vm = Arc::new(FakeVm::new(id, options, bootloader, self.behavior.clone()));
        self.registry.insert(vm)
    }

    fn on_create(&self) -> broadcast::Receiver<Arc<FakeVm>> {
        self.registry.subscribe()
    }
}
