use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use vmt::{FenceId, Identifier, SurfaceDesc, WorkTopology};

use crate::{
    Backend, DeviceError, DeviceResult, DispatchBinding, MapFlags, MappedRegion, Region,
    UnmapFlags,
};

struct DeviceSurface {
    backing: Vec<u8>,
}

/// An in-process reference `Backend` that simulates device memory with
/// plain `Vec<u8>` buffers and device-side fences with a monotonic counter
/// that retires immediately. This is the backend `ENABLE_VMACCEL_LOCAL`
/// bypasses the RPC layer to talk to directly, and is what
/// `vmaccel-core`'s own test suite drives (spec.md §1: the real
/// SPIR-V/OpenCL-C binding is out of scope, but the core still needs
/// *something* implementing `Backend` to exercise the dispatch path).
pub struct LocalBackend {
    surfaces: Mutex<HashMap<(Identifier, u32), DeviceSurface>>,
    next_handle: AtomicU64,
    next_fence: AtomicU64,
    /// A fence value "retires" the instant it's submitted: there is no real
    /// device to wait on, so every submitted fence is immediately complete.
    last_retired: AtomicU64,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            surfaces: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            next_fence: AtomicU64::new(1),
            last_retired: AtomicU64::new(0),
        }
    }
}

impl Backend for LocalBackend {
    fn surface_alloc(
        &self,
        surface: Identifier,
        instance: u32,
        desc: &SurfaceDesc,
    ) -> DeviceResult<u64> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.surfaces.lock().insert(
            (surface, instance),
            DeviceSurface {
                backing: vec![0u8; desc.backing_len()],
            },
        );
        Ok(handle)
    }

    fn surface_destroy(&self, surface: Identifier, instance: u32, _handle: u64) -> DeviceResult<()> {
        self.surfaces.lock().remove(&(surface, instance));
        Ok(())
    }

    fn map(
        &self,
        surface: Identifier,
        instance: u32,
        _handle: u64,
        region: Region,
        _flags: MapFlags,
    ) -> DeviceResult<MappedRegion> {
        let surfaces = self.surfaces.lock();
        let dev = surfaces
            .get(&(surface, instance))
            .ok_or(DeviceError::Generic("map: surface not resident"))?;
        if region.offset + region.len > dev.backing.len() {
            return Err(DeviceError::Generic("map: region out of bounds"));
        }
        Ok(MappedRegion {
            surface,
            instance,
            region,
            token: 0,
        })
    }

    fn unmap(&self, _mapped: MappedRegion, _flags: UnmapFlags) -> DeviceResult<()> {
        Ok(())
    }

    fn image_upload(
        &self,
        surface: Identifier,
        instance: u32,
        _handle: u64,
        region: Region,
        data: &[u8],
    ) -> DeviceResult<()> {
        let mut surfaces = self.surfaces.lock();
        let dev = surfaces
            .get_mut(&(surface, instance))
            .ok_or(DeviceError::Generic("image_upload: surface not resident"))?;
        if region.offset + region.len > dev.backing.len() || region.len != data.len() {
            return Err(DeviceError::Generic("image_upload: region mismatch"));
        }
        dev.backing[region.offset..region.offset + region.len].copy_from_slice(data);
        Ok(())
    }

    fn image_download(
        &self,
        surface: Identifier,
        instance: u32,
        _handle: u64,
        region: Region,
        out: &mut [u8],
    ) -> DeviceResult<()> {
        let surfaces = self.surfaces.lock();
        let dev = surfaces
            .get(&(surface, instance))
            .ok_or(DeviceError::Generic("image_download: surface not resident"))?;
        if region.offset + region.len > dev.backing.len() || region.len != out.len() {
            return Err(DeviceError::Generic("image_download: region mismatch"));
        }
        out.copy_from_slice(&dev.backing[region.offset..region.offset + region.len]);
        Ok(())
    }

    fn fill(
        &self,
        surface: Identifier,
        instance: u32,
        _handle: u64,
        region: Region,
        pattern: [u32; 4],
    ) -> DeviceResult<()> {
        let mut surfaces = self.surfaces.lock();
        let dev = surfaces
            .get_mut(&(surface, instance))
            .ok_or(DeviceError::Generic("fill: surface not resident"))?;
        if region.offset + region.len > dev.backing.len() {
            return Err(DeviceError::Generic("fill: region out of bounds"));
        }
        let pattern_bytes: Vec<u8> = pattern.iter().flat_map(|v| v.to_le_bytes()).collect();
        for (i, byte) in dev.backing[region.offset..region.offset + region.len]
            .iter_mut()
            .enumerate()
        {
            *byte = pattern_bytes[i % pattern_bytes.len()];
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy(
        &self,
        src_surface: Identifier,
        src_instance: u32,
        _src_handle: u64,
        src_region: Region,
        dst_surface: Identifier,
        dst_instance: u32,
        _dst_handle: u64,
        dst_region: Region,
    ) -> DeviceResult<()> {
        if src_region.len != dst_region.len {
            return Err(DeviceError::Generic("copy: region length mismatch"));
        }
        let mut surfaces = self.surfaces.lock();
        let src_bytes = {
            let src = surfaces
                .get(&(src_surface, src_instance))
                .ok_or(DeviceError::Generic("copy: src surface not resident"))?;
            src.backing[src_region.offset..src_region.offset + src_region.len].to_vec()
        };
        let dst = surfaces
            .get_mut(&(dst_surface, dst_instance))
            .ok_or(DeviceError::Generic("copy: dst surface not resident"))?;
        dst.backing[dst_region.offset..dst_region.offset + dst_region.len]
            .copy_from_slice(&src_bytes);
        Ok(())
    }

    fn dispatch(
        &self,
        instance: u32,
        _language: &str,
        entry_point: &str,
        _source: &[u8],
        args: &[DispatchBinding],
        topology: &WorkTopology,
    ) -> DeviceResult<()> {
        log::trace!(
            "local backend dispatch: instance={instance} entry={entry_point} args={} dims={}",
            args.len(),
            topology.dims()
        );
        // The reference backend has no real kernel compiler; it accepts any
        // dispatch whose topology is well-formed and otherwise no-ops. Real
        // backends plug in here via the SPIR-V/OpenCL-C binding spec.md §1
        // calls out as out of scope.
        if topology.global_size.is_empty() {
            return Err(DeviceError::Generic("dispatch: empty work topology"));
        }
        Ok(())
    }

    fn flush_queue(&self, _instance: u32) -> DeviceResult<()> {
        Ok(())
    }

    fn fence_submit(&self, _instance: u32) -> DeviceResult<FenceId> {
        let value = self.next_fence.fetch_add(1, Ordering::Relaxed);
        self.last_retired.store(value, Ordering::Release);
        Ok(value)
    }

    fn fence_has_retired(&self, fence: FenceId) -> bool {
        fence == 0 || fence <= self.last_retired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmt::{BindFlags, FormatCaps, SurfacePool, SurfaceType, SurfaceUsage};

    fn desc(len: u32) -> SurfaceDesc {
        SurfaceDesc {
            parent_id: 0,
            surf_type: SurfaceType::Buffer,
            width: len,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_size: 1,
            samples: 1,
            format: 0,
            format_caps: FormatCaps::empty(),
            pool: SurfacePool::Auto,
            usage: SurfaceUsage::ReadWrite,
            bind_flags: BindFlags::KERNEL_ARG,
            slice_pitch: 0,
            row_pitch: 0,
        }
    }

    #[test]
    fn upload_then_download_round_trips() {
        let backend = LocalBackend::new();
        let handle = backend.surface_alloc(1, 0, &desc(16)).unwrap();
        let data = vec![7u8; 16];
        backend
            .image_upload(1, 0, handle, Region { offset: 0, len: 16 }, &data)
            .unwrap();
        let mut out = vec![0u8; 16];
        backend
            .image_download(1, 0, handle, Region { offset: 0, len: 16 }, &mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn fences_retire_immediately() {
        let backend = LocalBackend::new();
        let fence = backend.fence_submit(0).unwrap();
        assert!(backend.fence_has_retired(fence));
    }
}
