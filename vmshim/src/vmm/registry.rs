//! In-process registry of live VMs.

use super::VirtualMachine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use vmshim_shared::errors::{VmshimError, VmshimResult};

const CREATED_CHANNEL_CAPACITY: usize = 16;

/// Tracks the VMs a hypervisor backend has created and broadcasts each
/// newly registered one. Backends use it to implement
/// [`Hypervisor::on_create`](super::Hypervisor::on_create).
pub struct VmRegistry<VM> {
    vms: RwLock<HashMap<String, Arc<VM>>>,
    created: broadcast::Sender<Arc<VM>>,
}

impl<VM: VirtualMachine> VmRegistry<VM> {
    pub fn new() -> Self {
        let (created, _) = broadcast::channel(CREATED_CHANNEL_CAPACITY);
        Self {
            vms: RwLock::new(HashMap::new()),
            created,
        }
    }

    /// Register `vm` under its id. Ids must be unique among live VMs.
    pub fn insert(&self, vm: Arc<VM>) -> VmshimResult<Arc<VM>> {
        {
            let mut vms = self.vms.write();
            if vms.contains_key(vm.id()) {
                return Err(VmshimError::InvalidState(format!(
                    "vm {} already exists",
                    vm.id()
                )));
            }
            vms.insert(vm.id().to_string(), Arc::clone(&vm));
        }
        let _ = self.created.send(Arc::clone(&vm));
        Ok(vm)
    }

    pub fn get(&self, id: &str) -> Option<Arc<VM>> {
        self.vms.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<VM>> {
        self.vms.write().remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.vms.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.vms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.read().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<VM>> {
        self.created.subscribe()
    }
}

impl<VM: VirtualMachine> Default for VmRegistry<VM> {
    fn default() -> Self {
        Self::new()
    }
}
