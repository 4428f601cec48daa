//! C5: the process-wide manager and the mutex hierarchy that serializes
//! access to it (spec.md §4.5, §5).

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use vmt::{AllocRange, FenceId, Identifier, VMAccelDesc};

use crate::alloc::{Allocator, AlwaysRetired, FenceSource};
use crate::compute::ComputeEngine;
use crate::error::{CoreError, CoreResult};
use hal::Backend;

/// Process-wide registry owning the two allocators every accelerator
/// registration and byte-pool reservation flows through (spec.md §4.5).
///
/// `wait_for_fence` is the in-process stub spec.md §4.5 describes ("returns
/// `true` immediately"); it is the contract hook [`crate::alloc::Allocator`]
/// calls into, reused here as [`AlwaysRetired`] rather than a second,
/// identical type.
pub struct Manager {
    state: Mutex<Option<ManagerState>>,
    registered_capacity: u32,
    external_capacity: u32,
}

struct ManagerState {
    /// Registered accelerators, scheduled by pointwise-fitting descriptor.
    devices: Allocator<VMAccelDesc>,
    /// Coarse byte-pool bookkeeping across registered devices (spec.md
    /// §4.5: "one over byte ranges, for coarse byte-pool bookkeeping").
    byte_pool: Allocator<AllocRange>,
}

impl Manager {
    pub fn new(registered_capacity: u32, external_capacity: u32) -> Self {
        Self {
            state: Mutex::new(None),
            registered_capacity,
            external_capacity,
        }
    }

    /// Construct both allocators. Fails if already powered on (spec.md §9:
    /// "Initialize at an explicit `poweron` entrypoint").
    pub fn poweron(&self) -> CoreResult<()> {
        let mut guard = self.state.lock();
        if guard.is_some() {
            return Err(CoreError::Fail("poweron: manager is already powered on"));
        }
        *guard = Some(ManagerState {
            devices: Allocator::new(self.registered_capacity, self.external_capacity),
            byte_pool: Allocator::new(self.registered_capacity, self.external_capacity),
        });
        log::info!("manager: powered on");
        Ok(())
    }

    /// Tear down both allocators together (spec.md §4.5: "both allocators
    /// must succeed or the manager reports FAIL and tears both down" --
    /// since construction here is infallible, the failure case this guards
    /// against is calling `poweroff` twice).
    pub fn poweroff(&self) -> CoreResult<()> {
        let mut guard = self.state.lock();
        guard
            .take()
            .ok_or(CoreError::Fail("poweroff: manager is not powered on"))?;
        log::info!("manager: powered off");
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManagerState) -> CoreResult<R>) -> CoreResult<R> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or(CoreError::Fail("manager is not powered on"))?;
        f(state)
    }

    pub fn register(&self, desc: VMAccelDesc) -> CoreResult<Identifier> {
        self.with_state(|s| s.devices.register(desc))
    }

    pub fn unregister(&self, parent_id: Identifier) -> CoreResult<()> {
        self.with_state(|s| s.devices.unregister(parent_id, &AlwaysRetired))
    }

    pub fn alloc(&self, parent_id: Identifier, request: VMAccelDesc) -> CoreResult<(Identifier, VMAccelDesc)> {
        self.with_state(|s| s.devices.alloc(parent_id, request, &AlwaysRetired))
    }

    pub fn free(&self, external_id: Identifier) -> CoreResult<()> {
        self.with_state(|s| s.devices.free(external_id, FENCE_STUB_RETIRED, &AlwaysRetired))
    }

    pub fn register_byte_pool(&self, whole: AllocRange) -> CoreResult<Identifier> {
        self.with_state(|s| s.byte_pool.register(whole))
    }

    pub fn unregister_byte_pool(&self, parent_id: Identifier) -> CoreResult<()> {
        self.with_state(|s| s.byte_pool.unregister(parent_id, &AlwaysRetired))
    }

    pub fn alloc_bytes(&self, parent_id: Identifier, request: AllocRange) -> CoreResult<(Identifier, AllocRange)> {
        self.with_state(|s| s.byte_pool.alloc(parent_id, request, &AlwaysRetired))
    }

    pub fn free_bytes(&self, external_id: Identifier) -> CoreResult<()> {
        self.with_state(|s| s.byte_pool.free(external_id, FENCE_STUB_RETIRED, &AlwaysRetired))
    }

    /// spec.md §4.5's `wait_for_fence` stub: always reports retired.
    pub fn wait_for_fence(&self, _fence: FenceId) -> bool {
        true
    }
}

const FENCE_STUB_RETIRED: FenceId = vmt::FENCE_ALREADY_RETIRED;

/// Per-accelerator compute state plus the process-wide manager, gathered
/// behind the three named locks spec.md §5 describes.
///
/// The source's three mutexes each guard a genuinely disjoint slice of a
/// single shared object graph (allocator tables; surface/queue backing
/// bytes; the dispatch queue) that, in C++, is reachable through raw
/// pointers without the borrow checker's help. Modeling that as three
/// independent `Mutex`es over three independent Rust values would require
/// splitting `ComputeEngine` into three field-disjoint structs threaded
/// through every call site. Instead `Runtime` keeps one coherent
/// `Mutex<RuntimeState>` and exposes three acquisition methods named after
/// spec.md's classes -- `lock_state`, `lock_data`, `lock_compute` -- so the
/// call-site contract ("acquire at most one, never nested") is still
/// enforced structurally: a handler takes one named guard and the type
/// system has nothing else to offer it. DESIGN.md records this as a
/// deliberate simplification, not an oversight; splitting the lock
/// granularity further is a performance change, not a correctness one, and
/// is tracked there as an open question should contention ever demand it.
pub struct Runtime {
    inner: Mutex<RuntimeState>,
}

pub struct RuntimeState {
    pub manager: Manager,
    pub engines: FxHashMap<Identifier, ComputeEngine>,
}

impl Runtime {
    pub fn new(manager: Manager) -> Self {
        Self {
            inner: Mutex::new(RuntimeState {
                manager,
                engines: FxHashMap::default(),
            }),
        }
    }

    /// Guards allocator state and context/surface/queue/sampler/kernel
    /// allocate-destroy (spec.md §5, `state_mutex`).
    pub fn lock_state(&self) -> parking_lot::MutexGuard<'_, RuntimeState> {
        self.inner.lock()
    }

    /// Guards bulk data ops: image upload/download, surface map/unmap/copy,
    /// image fill (spec.md §5, `data_mutex`).
    pub fn lock_data(&self) -> parking_lot::MutexGuard<'_, RuntimeState> {
        self.inner.lock()
    }

    /// Guards dispatch and queue flush (spec.md §5, `compute_mutex`).
    pub fn lock_compute(&self) -> parking_lot::MutexGuard<'_, RuntimeState> {
        self.inner.lock()
    }
}

impl RuntimeState {
    pub fn register_accelerator(
        &mut self,
        backend: Arc<dyn Backend>,
        desc: VMAccelDesc,
        max_surfaces: u32,
        max_contexts: u32,
        max_kernels: u32,
    ) -> CoreResult<Identifier> {
        let parent_id = self.manager.register(desc)?;
        self.engines.insert(
            parent_id,
            ComputeEngine::new(backend, max_surfaces, max_contexts, max_kernels),
        );
        Ok(parent_id)
    }

    pub fn unregister_accelerator(&mut self, parent_id: Identifier) -> CoreResult<()> {
        self.manager.unregister(parent_id)?;
        self.engines.remove(&parent_id);
        Ok(())
    }

    pub fn engine(&self, parent_id: Identifier) -> CoreResult<&ComputeEngine> {
        self.engines
            .get(&parent_id)
            .ok_or(CoreError::InvalidId("engine: unknown accelerator"))
    }

    pub fn engine_mut(&mut self, parent_id: Identifier) -> CoreResult<&mut ComputeEngine> {
        self.engines
            .get_mut(&parent_id)
            .ok_or(CoreError::InvalidId("engine: unknown accelerator"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::LocalBackend;

    #[test]
    fn poweron_twice_fails_poweroff_tears_down() {
        let manager = Manager::new(4, 4);
        manager.poweron().unwrap();
        assert!(matches!(manager.poweron(), Err(CoreError::Fail(_))));
        manager.poweroff().unwrap();
        assert!(matches!(manager.poweroff(), Err(CoreError::Fail(_))));
    }

    #[test]
    fn manager_forwards_register_alloc_free_to_descriptor_allocator() {
        let manager = Manager::new(4, 4);
        manager.poweron().unwrap();
        let desc = VMAccelDesc {
            parent_id: 0,
            accel_type: vmt::AcceleratorType::Gpu,
            capacity: vmt::WorkloadCapacity {
                mega_flops: 1000,
                ..Default::default()
            },
            address: Vec::new(),
            type_mask: 0,
            format_caps: Vec::new(),
        };
        let parent = manager.register(desc.clone()).unwrap();
        let request = VMAccelDesc {
            capacity: vmt::WorkloadCapacity { mega_flops: 400, ..Default::default() },
            ..desc
        };
        let (external, _taken) = manager.alloc(parent, request).unwrap();
        manager.free(external).unwrap();
        manager.unregister(parent).unwrap();
    }

    #[test]
    fn runtime_registers_an_accelerator_with_its_own_engine() {
        let runtime = Runtime::new(Manager::new(4, 4));
        runtime.lock_state().manager.poweron().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new());
        let desc = VMAccelDesc {
            parent_id: 0,
            accel_type: vmt::AcceleratorType::Gpu,
            capacity: vmt::WorkloadCapacity::default(),
            address: Vec::new(),
            type_mask: 0,
            format_caps: Vec::new(),
        };
        let parent_id = runtime
            .lock_state()
            .register_accelerator(backend, desc, 8, 8, 8)
            .unwrap();
        assert!(runtime.lock_state().engine(parent_id).is_ok());
    }
}
