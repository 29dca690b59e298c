//! VM lifecycle states, change notifications, and waiting.

use super::VirtualMachine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Buffered notifications per subscriber before it starts lagging.
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Metadata key carrying the failure reason of an `Error` transition.
pub const META_ERROR: &str = "error";

/// Lifecycle state of a virtual machine.
///
/// ```text
/// Stopped ─start()→ Starting ─→ Running ─stop()→ Stopping ─→ Stopped
///                       │           │ ▲
///                       │     pause()│ │resume()
///                       │           ▼ │
///                       │          Paused
///                       └──────────────→ Error (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualMachineStateType {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Paused,
    Error,
}

impl VirtualMachineStateType {
    /// No further transitions happen from here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Unknown)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Starting)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for VirtualMachineStateType {
    type Err = VmshimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            other => Err(VmshimError::InvalidArgument(format!(
                "unknown vm state '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for VirtualMachineStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachineStateChange {
    pub state: VirtualMachineStateType,
    pub metadata: HashMap<String, String>,
}

impl VirtualMachineStateChange {
    pub fn new(state: VirtualMachineStateType) -> Self {
        Self {
            state,
            metadata: HashMap::new(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(META_ERROR.to_string(), reason.into());
        Self {
            state: VirtualMachineStateType::Error,
            metadata,
        }
    }

    /// Failure reason attached to an `Error` transition, if any.
    pub fn reason(&self) -> Option<&str> {
        self.metadata.get(META_ERROR).map(String::as_str)
    }
}

struct NotifierInner {
    current: RwLock<VirtualMachineStateType>,
    tx: broadcast::Sender<VirtualMachineStateChange>,
}

/// Current state plus a broadcast of every transition.
///
/// Hypervisor backends embed one of these to implement
/// [`VirtualMachine::current_state`] and [`VirtualMachine::state_changes`].
/// Cloning shares the same state.
#[derive(Clone)]
pub struct StateNotifier {
    inner: Arc<NotifierInner>,
}

impl StateNotifier {
    pub fn new(initial: VirtualMachineStateType) -> Self {
        let (tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(NotifierInner {
                current: RwLock::new(initial),
                tx,
            }),
        }
    }

    pub fn current(&self) -> VirtualMachineStateType {
        *self.inner.current.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VirtualMachineStateChange> {
        self.inner.tx.subscribe()
    }

    pub fn set(&self, state: VirtualMachineStateType) {
        self.publish(VirtualMachineStateChange::new(state));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.publish(VirtualMachineStateChange::error(reason));
    }

    /// Record and broadcast a transition.
    ///
    /// The write lock is held across the send so subscribers never observe
    /// notifications out of order with `current()`.
    pub fn publish(&self, change: VirtualMachineStateChange) {
        let mut current = self.inner.current.write();
        *current = change.state;
        // No subscribers is fine.
        let _ = self.inner.tx.send(change);
    }
}

impl std::fmt::Debug for StateNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateNotifier")
            .field("current", &self.current())
            .finish()
    }
}

/// Wait until `vm` reports `target`.
///
/// Subscribes before reading the current state so a transition between the
/// two cannot be missed. Returns:
/// - `Ok(())` once the state is `target` (immediately if it already is)
/// - `Engine` if the VM enters `Error` (or stops) while waiting for something else
/// - `Timeout` when `timeout` elapses first
/// - `Cancelled` when `cancel` fires; cancellation wins over a simultaneous timeout
///
/// SIGPIPE delivered to the host process while waiting is consumed and ignored.
pub async fn wait_for_vm_state<VM>(
    vm: &VM,
    target: VirtualMachineStateType,
    timeout: Duration,
    cancel: &CancellationToken,
) -> VmshimResult<()>
where
    VM: VirtualMachine + ?Sized,
{
    let mut changes = vm.state_changes();

    let current = vm.current_state();
    if current == target {
        return Ok(());
    }
    if current == VirtualMachineStateType::Error {
        return Err(unreachable(vm.id(), current, target, None));
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut sigpipe = pipe_signal();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return Err(VmshimError::Cancelled(format!(
                    "waiting for vm {} to reach {}",
                    vm.id(),
                    target
                )));
            }
            _ = &mut deadline => {
                return Err(VmshimError::Timeout(format!(
                    "vm {} did not reach {} within {:?} (last state: {})",
                    vm.id(),
                    target,
                    timeout,
                    vm.current_state()
                )));
            }
            _ = next_pipe_signal(&mut sigpipe) => {
                tracing::debug!(vm_id = %vm.id(), "Ignoring SIGPIPE while waiting for vm state");
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    tracing::trace!(vm_id = %vm.id(), state = %change.state, "vm state change");
                    if change.state == target {
                        return Ok(());
                    }
                    // Stopped after a transition was observed means the VM went away.
                    if change.state.is_terminal() {
                        return Err(unreachable(vm.id(), change.state, target, change.reason()));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        vm_id = %vm.id(),
                        skipped,
                        "State notifications lagged, re-reading current state"
                    );
                    let current = vm.current_state();
                    if current == target {
                        return Ok(());
                    }
                    if current.is_terminal() {
                        return Err(unreachable(vm.id(), current, target, None));
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(VmshimError::Engine(format!(
                        "state notifications for vm {} closed before reaching {}",
                        vm.id(),
                        target
                    )));
                }
            }
        }
    }
}

fn unreachable(
    vm_id: &str,
    state: VirtualMachineStateType,
    target: VirtualMachineStateType,
    reason: Option<&str>,
) -> VmshimError {
    VmshimError::Engine(match reason {
        Some(reason) => format!(
            "vm {} entered {} while waiting for {}: {}",
            vm_id, state, target, reason
        ),
        None => format!("vm {} entered {} while waiting for {}", vm_id, state, target),
    })
}

fn pipe_signal() -> Option<tokio::signal::unix::Signal> {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::pipe()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            tracing::debug!("Could not watch SIGPIPE: {}", e);
            None
        }
    }
}

async fn next_pipe_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    if let Some(s) = sig.as_mut() {
        if s.recv().await.is_some() {
            return;
        }
    }
    *sig = None;
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use VirtualMachineStateType::*;

    #[test]
    fn test_state_guards() {
        assert!(Stopped.can_start());
        assert!(!Running.can_start());
        assert!(Running.can_pause());
        assert!(!Paused.can_pause());
        assert!(Paused.can_resume());
        assert!(Running.can_stop());
        assert!(!Stopped.can_stop());
        assert!(Error.is_terminal());
        assert!(Stopped.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_state_str_roundtrip() {
        for state in [Unknown, Starting, Running, Stopping, Stopped, Paused, Error] {
            assert_eq!(state.as_str().parse::<VirtualMachineStateType>().unwrap(), state);
        }
        assert!("bogus".parse::<VirtualMachineStateType>().is_err());
    }

    #[tokio::test]
    async fn test_notifier_publishes_in_order() {
        let notifier = StateNotifier::new(Stopped);
        let mut rx = notifier.subscribe();

        notifier.set(Starting);
        notifier.set(Running);
        notifier.fail("kernel panic");

        assert_eq!(rx.recv().await.unwrap().state, Starting);
        assert_eq!(rx.recv().await.unwrap().state, Running);
        let err = rx.recv().await.unwrap();
        assert_eq!(err.state, Error);
        assert_eq!(err.reason(), Some("kernel panic"));
        assert_eq!(notifier.current(), Error);
    }

    #[test]
    fn test_notifier_clone_shares_state() {
        let a = StateNotifier::new(Stopped);
        let b = a.clone();
        b.set(Running);
        assert_eq!(a.current(), Running);
    }
}
