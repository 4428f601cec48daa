//! Adapts [`vmc::manager::Runtime`] (and the single [`vmc::compute::ComputeEngine`]
//! this process binds to) to [`rpc::server::Handler`], translating
//! `CoreError` into the wire-level `StatusCode` via `to_status_code` (SPEC_FULL.md
//! §2's single marshalling seam) and acquiring the lock named after each
//! operation's mutex class (spec.md §5).
//!
//! One `vmaccel-server` process binds to exactly one registered accelerator
//! (see `rpc::procedures`'s doc comment: "a connection binds to exactly one
//! accelerator for its lifetime"); multi-accelerator deployments run one
//! process per accelerator, each on its own RPC/streaming port range. This
//! sidesteps a context/surface-id routing problem a single process serving
//! several engines would otherwise have, since `ComputeEngine` ids are only
//! unique within one engine, not across engines (recorded as an open
//! question in DESIGN.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hal::{DispatchBinding, MapFlags, MappedRegion, Region, UnmapFlags};
use parking_lot::Mutex;
use vmc::compute::ComputeEngine;
use vmc::error::CoreResult;
use vmc::manager::Runtime;
use vmt::Identifier;

use rpc::procedures::*;
use rpc::server::Handler;

pub struct ServerHandler {
    runtime: Arc<Runtime>,
    accel_id: Identifier,
    /// Server-minted map tokens handed to clients, distinct from whatever
    /// token the backend itself assigns (the in-tree `LocalBackend` always
    /// returns `0`, so a wire token has to come from somewhere that actually
    /// varies per outstanding mapping).
    mapped: Mutex<HashMap<u64, MappedRegion>>,
    next_token: AtomicU64,
}

impl ServerHandler {
    pub fn new(runtime: Arc<Runtime>, accel_id: Identifier) -> Self {
        Self {
            runtime,
            accel_id,
            mapped: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn accel_id(&self) -> Identifier {
        self.accel_id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn with_engine_state<R>(&self, f: impl FnOnce(&mut ComputeEngine) -> CoreResult<R>) -> CoreResult<R> {
        let mut guard = self.runtime.lock_state();
        let engine = guard.engine_mut(self.accel_id)?;
        f(engine)
    }

    fn with_engine_data<R>(&self, f: impl FnOnce(&mut ComputeEngine) -> CoreResult<R>) -> CoreResult<R> {
        let mut guard = self.runtime.lock_data();
        let engine = guard.engine_mut(self.accel_id)?;
        f(engine)
    }

    fn with_engine_compute<R>(&self, f: impl FnOnce(&mut ComputeEngine) -> CoreResult<R>) -> CoreResult<R> {
        let mut guard = self.runtime.lock_compute();
        let engine = guard.engine_mut(self.accel_id)?;
        f(engine)
    }

    /// Backing-store length for `(surface_id, instance)`, for the streaming
    /// sink's capacity check (spec.md §4.4, §9's "validate header sanity
    /// before trusting `len`").
    pub fn streaming_capacity(&self, surface_id: Identifier, _instance: u32) -> Option<usize> {
        let guard = self.runtime.lock_data();
        let engine = guard.engine(self.accel_id).ok()?;
        engine.surface(surface_id).map(|s| s.backing.len())
    }

    /// Write one chunk of a streamed upload (spec.md §4.4 step 2: the
    /// server thread `recv`s into the mapped destination). The streaming
    /// path has no context id of its own, so it reuses this engine's
    /// instance-equals-context-id simplification (see
    /// `ComputeEngine::dispatch`'s doc comment) rather than inventing a
    /// second convention.
    pub fn streaming_write(&self, surface_id: Identifier, instance: u32, offset: u32, chunk: &[u8]) -> CoreResult<()> {
        let region = Region { offset: offset as usize, len: chunk.len() };
        self.with_engine_data(|e| e.upload(instance, surface_id, instance, region, chunk))
    }
}

fn reply_of<T>(result: CoreResult<T>) -> Reply<T> {
    match result {
        Ok(v) => Reply::ok(v),
        Err(e) => Reply::err(e.to_status_code()),
    }
}

fn reply_empty(result: CoreResult<()>) -> Reply<()> {
    match result {
        Ok(()) => Reply::ok_empty(),
        Err(e) => Reply::err(e.to_status_code()),
    }
}

impl Handler for ServerHandler {
    fn register(&self, req: RegisterRequest) -> RegisterReply {
        log::debug!("register");
        reply_of(self.runtime.lock_state().manager.register(req.desc))
    }

    fn unregister(&self, req: UnregisterRequest) -> UnregisterReply {
        log::debug!("unregister parent_id={}", req.parent_id);
        reply_empty(self.runtime.lock_state().manager.unregister(req.parent_id))
    }

    fn alloc(&self, req: AllocRequest) -> AllocReply {
        log::debug!("alloc parent_id={}", req.parent_id);
        let result = self
            .runtime
            .lock_state()
            .manager
            .alloc(req.parent_id, req.request)
            .map(|(external_id, taken)| AllocBody { external_id, taken });
        reply_of(result)
    }

    fn free(&self, req: FreeRequest) -> FreeReply {
        log::debug!("free external_id={}", req.external_id);
        reply_empty(self.runtime.lock_state().manager.free(req.external_id))
    }

    fn context_alloc(&self, req: ContextAllocRequest) -> ContextAllocReply {
        log::debug!("context_alloc accel_id={}", req.accel_id);
        if req.accel_id != self.accel_id {
            return Reply::err(vmt::StatusCode::Fail);
        }
        reply_of(self.with_engine_state(|e| e.context_alloc(req.accelerator_mask)))
    }

    fn context_destroy(&self, req: ContextDestroyRequest) -> ContextDestroyReply {
        log::debug!("context_destroy ctx_id={}", req.ctx_id);
        reply_empty(self.with_engine_state(|e| e.context_destroy(req.ctx_id)))
    }

    fn surface_alloc(&self, req: SurfaceAllocRequest) -> SurfaceAllocReply {
        log::trace!("surface_alloc ctx_id={} instance={}", req.ctx_id, req.instance);
        let result = self.with_engine_state(|e| {
            let surface_id = e.surface_create(req.parent_accel_id, req.desc)?;
            e.alloc_surface(req.ctx_id, surface_id, req.instance)?;
            Ok(surface_id)
        });
        reply_of(result)
    }

    fn surface_destroy(&self, req: SurfaceDestroyRequest) -> SurfaceDestroyReply {
        log::trace!("surface_destroy surface_id={}", req.surface_id);
        reply_empty(self.with_engine_state(|e| e.destroy_surface(req.ctx_id, req.surface_id, req.instance)))
    }

    fn queue_alloc(&self, req: QueueAllocRequest) -> QueueAllocReply {
        reply_of(self.with_engine_state(|e| e.queue_alloc(req.ctx_id)))
    }

    fn queue_destroy(&self, req: QueueDestroyRequest) -> QueueDestroyReply {
        reply_empty(self.with_engine_state(|e| e.queue_destroy(req.ctx_id, req.queue_id)))
    }

    fn queue_flush(&self, req: QueueFlushRequest) -> QueueFlushReply {
        log::trace!("queue_flush ctx_id={} queue_id={}", req.ctx_id, req.queue_id);
        reply_empty(self.with_engine_compute(|e| e.queue_flush(req.ctx_id, req.queue_id)))
    }

    fn sampler_alloc(&self, req: SamplerAllocRequest) -> SamplerAllocReply {
        reply_of(self.with_engine_state(|e| e.sampler_alloc(req.ctx_id, req.filter_mode, req.address_mode)))
    }

    fn sampler_destroy(&self, req: SamplerDestroyRequest) -> SamplerDestroyReply {
        reply_empty(self.with_engine_state(|e| e.sampler_destroy(req.ctx_id, req.sampler_id)))
    }

    fn kernel_alloc(&self, req: KernelAllocRequest) -> KernelAllocReply {
        reply_of(self.with_engine_state(|e| e.kernel_alloc(req.ctx_id, &req.language, &req.entry_point)))
    }

    fn kernel_destroy(&self, req: KernelDestroyRequest) -> KernelDestroyReply {
        reply_empty(self.with_engine_state(|e| e.kernel_destroy(req.ctx_id, req.kernel_id)))
    }

    fn image_upload(&self, req: ImageUploadRequest) -> ImageUploadReply {
        log::trace!("image_upload surface_id={} len={}", req.surface_id, req.data.len());
        let region = Region { offset: req.offset as usize, len: req.data.len() };
        reply_empty(self.with_engine_data(|e| e.upload(req.ctx_id, req.surface_id, req.instance, region, &req.data)))
    }

    fn image_download(&self, req: ImageDownloadRequest) -> ImageDownloadReply {
        log::trace!("image_download surface_id={} len={}", req.surface_id, req.len);
        let region = Region { offset: req.offset as usize, len: req.len as usize };
        let result = self.with_engine_data(|e| {
            let mut out = vec![0u8; req.len as usize];
            e.download(req.surface_id, req.instance, region, &mut out, req.force)?;
            Ok(ImageDownloadBody { data: out })
        });
        reply_of(result)
    }

    fn surface_map(&self, req: SurfaceMapRequest) -> SurfaceMapReply {
        log::trace!("surface_map surface_id={} len={}", req.surface_id, req.len);
        let region = Region { offset: req.offset as usize, len: req.len as usize };
        let flags = if req.writable { MapFlags::READ | MapFlags::WRITE } else { MapFlags::READ };
        let result = self.with_engine_data(|e| e.surface_map(req.surface_id, req.instance, region, flags));
        match result {
            Ok(mapped) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                self.mapped.lock().insert(token, mapped);
                Reply::ok(SurfaceMapBody { token })
            }
            Err(e) => Reply::err(e.to_status_code()),
        }
    }

    fn surface_unmap(&self, req: SurfaceUnmapRequest) -> SurfaceUnmapReply {
        log::trace!("surface_unmap surface_id={} token={}", req.surface_id, req.token);
        let mapped = {
            let mut mapped = self.mapped.lock();
            match mapped.remove(&req.token) {
                Some(m) => m,
                None => return Reply::err(vmt::StatusCode::Fail),
            }
        };
        let flags = if req.keep_ptr { UnmapFlags::NO_FREE_PTR } else { UnmapFlags::empty() };
        reply_empty(self.with_engine_data(|e| e.surface_unmap(mapped, flags)))
    }

    fn surface_copy(&self, req: SurfaceCopyRequest) -> SurfaceCopyReply {
        log::trace!("surface_copy src={} dst={} len={}", req.src_surface, req.dst_surface, req.len);
        let src_region = Region { offset: req.src_offset as usize, len: req.len as usize };
        let dst_region = Region { offset: req.dst_offset as usize, len: req.len as usize };
        reply_empty(self.with_engine_data(|e| {
            e.copy(req.ctx_id, req.src_surface, req.src_instance, src_region, req.dst_surface, req.dst_instance, dst_region)
        }))
    }

    fn image_fill(&self, req: ImageFillRequest) -> ImageFillReply {
        log::trace!("image_fill surface_id={} len={}", req.surface_id, req.len);
        let region = Region { offset: req.offset as usize, len: req.len as usize };
        reply_empty(self.with_engine_data(|e| e.fill(req.ctx_id, req.surface_id, req.instance, region, req.pattern)))
    }

    fn dispatch(&self, req: DispatchRequest) -> DispatchReply {
        log::trace!("dispatch ctx_id={} entry_point={}", req.ctx_id, req.entry_point);
        let bindings: Vec<DispatchBinding> = req
            .args
            .iter()
            .map(|b| DispatchBinding { slot: b.slot, surface: b.surface, instance: b.instance })
            .collect();
        reply_empty(self.with_engine_compute(|e| {
            e.dispatch(req.ctx_id, &req.language, &req.entry_point, &req.source, &bindings, &req.topology)
        }))
    }
}
