//! Integration tests for VM state tracking, the registry, and VM creation.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vmshim::vmm::{
    Bootloader, Hypervisor, NewVmOptions, Platform, VirtualMachine, VirtualMachineStateType,
    create_vm, wait_for_vm_state,
};
use vmshim_shared::errors::VmshimError;
use vmshim_test_utils::{BootOutcome, FakeBehavior, FakeHypervisor, FakeVm};

// ============================================================================
// TEST FIXTURES
// ============================================================================

fn bootloader() -> Bootloader {
    Bootloader {
        kernel_path: "/build/arm64/Image".into(),
        initrd_path: None,
        cmdline: "console=hvc0".into(),
    }
}

fn options() -> NewVmOptions {
    NewVmOptions::new(2, 512 << 20, Platform::linux_arm64())
}

fn vm(behavior: FakeBehavior) -> FakeVm {
    FakeVm::new("vm-1", options(), bootloader(), behavior)
}

const SHORT: Duration = Duration::from_millis(200);

// ============================================================================
// WAIT FOR STATE
// ============================================================================

#[tokio::test]
async fn already_in_target_returns_immediately() {
    let vm = vm(FakeBehavior::default());
    wait_for_vm_state(
        &vm,
        VirtualMachineStateType::Stopped,
        Duration::ZERO,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn reaches_running_after_start() {
    let vm = vm(FakeBehavior::default());
    vm.start().await.unwrap();
    wait_for_vm_state(
        &vm,
        VirtualMachineStateType::Running,
        Duration::from_secs(2),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(vm.current_state(), VirtualMachineStateType::Running);
}

#[tokio::test]
async fn hung_boot_times_out() {
    let vm = vm(FakeBehavior {
        boot_outcome: BootOutcome::Hang,
        ..FakeBehavior::default()
    });
    vm.start().await.unwrap();
    let err = wait_for_vm_state(
        &vm,
        VirtualMachineStateType::Running,
        SHORT,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(err.to_string().contains("starting"), "{err}");
}

#[tokio::test]
async fn error_state_fails_wait_with_reason() {
    let vm = vm(FakeBehavior {
        boot_outcome: BootOutcome::Fail("kernel panic".into()),
        ..FakeBehavior::default()
    });
    vm.start().await.unwrap();
    let err = wait_for_vm_state(
        &vm,
        VirtualMachineStateType::Running,
        Duration::from_secs(2),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VmshimError::Engine(_)), "{err}");
    assert!(err.to_string().contains("kernel panic"), "{err}");
}

#[tokio::test]
async fn already_errored_fails_immediately() {
    let vm = vm(FakeBehavior::default());
    vm.crash("boom");
    let err = wait_for_vm_state(
        &vm,
        VirtualMachineStateType::Running,
        Duration::from_secs(5),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VmshimError::Engine(_)), "{err}");
}

#[tokio::test]
async fn cancel_wins_over_deadline() {
    let vm = vm(FakeBehavior {
        boot_outcome: BootOutcome::Hang,
        ..FakeBehavior::default()
    });
    vm.start().await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = wait_for_vm_state(&vm, VirtualMachineStateType::Running, Duration::ZERO, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "{err}");
}

// ============================================================================
// LIFECYCLE GUARDS
// ============================================================================

#[tokio::test]
async fn pause_resume_stop() {
    let vm = vm(FakeBehavior::default());
    assert!(vm.pause().await.is_err());
    vm.start().await.unwrap();
    wait_for_vm_state(
        &vm,
        VirtualMachineStateType::Running,
        Duration::from_secs(2),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    vm.pause().await.unwrap();
    assert_eq!(vm.current_state(), VirtualMachineStateType::Paused);
    vm.resume().await.unwrap();
    vm.stop().await.unwrap();
    assert_eq!(vm.current_state(), VirtualMachineStateType::Stopped);
    assert!(matches!(vm.stop().await, Err(VmshimError::InvalidState(_))));
}

#[tokio::test]
async fn snapshots_unsupported_by_default() {
    let vm = vm(FakeBehavior::default());
    let err = vm.save_snapshot("/tmp/snap".as_ref()).await.unwrap_err();
    assert!(matches!(err, VmshimError::Unsupported(_)));
}

#[tokio::test]
async fn balloon_target_bounded_by_memory() {
    let vm = vm(FakeBehavior::default());
    assert_eq!(vm.balloon_target().await.unwrap(), 512 << 20);
    vm.set_balloon_target(256 << 20).await.unwrap();
    assert_eq!(vm.balloon_target().await.unwrap(), 256 << 20);
    assert!(vm.set_balloon_target(1 << 40).await.is_err());
}

// ============================================================================
// CREATION AND REGISTRY
// ============================================================================

#[tokio::test]
async fn create_vm_rejects_zero_vcpus_before_backend() {
    let hv = FakeHypervisor::default();
    let err = create_vm(
        &hv,
        "vm-1",
        NewVmOptions::new(0, 512 << 20, Platform::linux_arm64()),
        bootloader(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VmshimError::Config(_)), "{err}");
    assert_eq!(hv.creates(), 0);
}

#[tokio::test]
async fn created_vms_are_registered_and_announced() {
    let hv = FakeHypervisor::default();
    let mut created = hv.on_create();

    let vm = create_vm(&hv, "vm-1", options(), bootloader()).await.unwrap();
    let announced = created.recv().await.unwrap();
    assert!(Arc::ptr_eq(&vm, &announced));
    assert_eq!(hv.registry().ids(), vec!["vm-1".to_string()]);
    assert!(hv.get("vm-1").is_some());
    assert_eq!(vm.options().vcpus, 2);
}

#[tokio::test]
async fn duplicate_id_is_rejected() {
    let hv = FakeHypervisor::default();
    create_vm(&hv, "vm-1", options(), bootloader()).await.unwrap();
    let err = create_vm(&hv, "vm-1", options(), bootloader())
        .await
        .unwrap_err();
    assert!(matches!(err, VmshimError::InvalidState(_)), "{err}");
    assert_eq!(hv.registry().len(), 1);

    hv.registry().remove("vm-1");
    assert!(hv.registry().is_empty());
}
