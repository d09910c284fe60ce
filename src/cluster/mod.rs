//! Cluster-wide lookups that the hypervisor only answers in bulk: where a VM
//! currently lives, and which ids are still free.

use std::collections::{HashMap, HashSet};

use crate::hypervisor::{ClusterVm, VmRef};

/// Point-in-time view of every VM in the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    vms: HashMap<u32, ClusterVm>,
}

impl ClusterView {
    pub fn from_vms(vms: Vec<ClusterVm>) -> Self {
        Self {
            vms: vms.into_iter().map(|vm| (vm.vmid, vm)).collect(),
        }
    }

    pub fn get(&self, vmid: u32) -> Option<&ClusterVm> {
        self.vms.get(&vmid)
    }

    /// Where a VM actually runs now; it may have migrated since it was recorded.
    pub fn locate(&self, vmid: u32) -> Option<VmRef> {
        self.vms.get(&vmid).map(ClusterVm::vm_ref)
    }

    pub fn contains(&self, vmid: u32) -> bool {
        self.vms.contains_key(&vmid)
    }

    pub fn is_running(&self, vmid: u32) -> bool {
        self.vms.get(&vmid).is_some_and(|vm| vm.running)
    }

    pub fn ids(&self) -> HashSet<u32> {
        self.vms.keys().copied().collect()
    }
}

/// Hands out VM ids for a whole job before any clone is submitted, so parallel
/// clones never race for the same id.
#[derive(Debug, Clone)]
pub struct VmidAllocator {
    next: u32,
    taken: HashSet<u32>,
}

impl VmidAllocator {
    pub fn new(first: u32, taken: HashSet<u32>) -> Self {
        Self { next: first, taken }
    }

    pub fn allocate(&mut self) -> u32 {
        while self.taken.contains(&self.next) {
            self.next += 1;
        }
        let vmid = self.next;
        self.taken.insert(vmid);
        self.next += 1;
        vmid
    }

    pub fn reserve(&mut self, count: usize) -> Vec<u32> {
        (0..count).map(|_| self.allocate()).collect()
    }
}
