//! Program/procedure identifiers and the request/reply payload shapes for
//! each procedure (spec.md §6: "Each procedure is identified by a (program,
//! version, procedure) triple").
//!
//! Program A is the manager (device registration and the coarse byte-pool),
//! Program B is the per-accelerator compute context (surfaces, kernels,
//! dispatch), Program C is transcode -- named in spec.md §6 but out of scope
//! for this implementation (spec.md §1 Non-goals), so its procedures always
//! reply `StatusCode::Fail`.

use vmt::{Identifier, StatusCode, SurfaceDesc, VMAccelDesc, WorkTopology};

use crate::wire::{Decode, Encode, Reader, Writer, WireResult};

pub mod program {
    pub const MANAGER: u32 = 1;
    pub const COMPUTE: u32 = 2;
    pub const TRANSCODE: u32 = 3;
}

/// All three programs are versioned together; spec.md does not describe an
/// independent versioning scheme per program.
pub const VERSION: u32 = 1;

pub mod procedure {
    // Program A
    pub const REGISTER: u32 = 1;
    pub const UNREGISTER: u32 = 2;
    pub const ALLOC: u32 = 3;
    pub const FREE: u32 = 4;

    // Program B
    pub const CONTEXT_ALLOC: u32 = 10;
    pub const CONTEXT_DESTROY: u32 = 11;
    pub const SURFACE_ALLOC: u32 = 12;
    pub const SURFACE_DESTROY: u32 = 13;
    pub const QUEUE_ALLOC: u32 = 14;
    pub const QUEUE_DESTROY: u32 = 15;
    pub const QUEUE_FLUSH: u32 = 16;
    pub const SAMPLER_ALLOC: u32 = 17;
    pub const SAMPLER_DESTROY: u32 = 18;
    pub const KERNEL_ALLOC: u32 = 19;
    pub const KERNEL_DESTROY: u32 = 20;
    pub const IMAGE_UPLOAD: u32 = 21;
    pub const IMAGE_DOWNLOAD: u32 = 22;
    pub const SURFACE_MAP: u32 = 23;
    pub const SURFACE_UNMAP: u32 = 24;
    pub const SURFACE_COPY: u32 = 25;
    pub const IMAGE_FILL: u32 = 26;
    pub const DISPATCH: u32 = 27;

    // Program C
    pub const XCODE: u32 = 30;
    pub const VALIDATE: u32 = 31;
}

/// `(program, version, procedure)` triple prefixing every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl Encode for RequestHeader {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.program);
        w.write_u32(self.version);
        w.write_u32(self.procedure);
    }
}

impl Decode for RequestHeader {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            program: r.read_u32()?,
            version: r.read_u32()?,
            procedure: r.read_u32()?,
        })
    }
}

/// The reply envelope every procedure returns: `(status_code, optional
/// body)` (spec.md §6). `status == Success` does not by itself guarantee a
/// body is present -- several procedures (`Free`, `ContextDestroy`, ...)
/// succeed with no body at all -- so presence is carried by its own flag
/// rather than inferred from the status.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub status: StatusCode,
    pub body: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(body: T) -> Self {
        Self { status: StatusCode::Success, body: Some(body) }
    }

    pub fn ok_empty() -> Self {
        Self { status: StatusCode::Success, body: None }
    }

    pub fn err(status: StatusCode) -> Self {
        debug_assert_ne!(status, StatusCode::Success);
        Self { status, body: None }
    }
}

impl<T: Encode> Encode for Reply<T> {
    fn encode(&self, w: &mut Writer) {
        self.status.encode(w);
        w.write_bool(self.body.is_some());
        if let Some(body) = &self.body {
            body.encode(w);
        }
    }
}

impl<T: Decode> Decode for Reply<T> {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let status = StatusCode::decode(r)?;
        let body = if r.read_bool()? { Some(T::decode(r)?) } else { None };
        Ok(Self { status, body })
    }
}

macro_rules! record {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl Encode for $name {
            fn encode(&self, w: &mut Writer) {
                $(self.$field.encode(w);)*
            }
        }

        impl Decode for $name {
            fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
                Ok(Self { $($field: Decode::decode(r)?,)* })
            }
        }
    };
}

// ---- Program A: manager -----------------------------------------------

record!(RegisterRequest { desc: VMAccelDesc });
record!(UnregisterRequest { parent_id: Identifier });
record!(AllocRequest { parent_id: Identifier, request: VMAccelDesc });
record!(AllocBody { external_id: Identifier, taken: VMAccelDesc });
record!(FreeRequest { external_id: Identifier });

pub type RegisterReply = Reply<Identifier>;
pub type UnregisterReply = Reply<()>;
pub type AllocReply = Reply<AllocBody>;
pub type FreeReply = Reply<()>;

// ---- Program B: compute -------------------------------------------------

// `accel_id` selects which registered accelerator's engine a connection is
// bound to; a connection binds to exactly one accelerator for its lifetime
// (spec.md is silent on multi-accelerator multiplexing over one connection,
// so this implementation resolves the ambiguity the way a real client would
// use it: one connection per accelerator).
record!(ContextAllocRequest { accel_id: Identifier, accelerator_mask: u32 });
record!(ContextDestroyRequest { ctx_id: Identifier });

// `surface_alloc` both creates the surface record and binds its residency on
// `ctx_id`/`instance` in one call; there is no wire-visible "create without
// binding" step (spec.md's procedure list only names `surface_alloc`, not a
// separate residency call).
record!(SurfaceAllocRequest {
    ctx_id: Identifier,
    instance: u32,
    parent_accel_id: Identifier,
    desc: SurfaceDesc,
});
record!(SurfaceDestroyRequest { ctx_id: Identifier, surface_id: Identifier, instance: u32 });

record!(QueueAllocRequest { ctx_id: Identifier });
record!(QueueDestroyRequest { ctx_id: Identifier, queue_id: Identifier });
record!(QueueFlushRequest { ctx_id: Identifier, queue_id: Identifier });

record!(SamplerAllocRequest { ctx_id: Identifier, filter_mode: u32, address_mode: u32 });
record!(SamplerDestroyRequest { ctx_id: Identifier, sampler_id: Identifier });

record!(KernelAllocRequest { ctx_id: Identifier, language: String, entry_point: String });
record!(KernelDestroyRequest { ctx_id: Identifier, kernel_id: Identifier });

record!(ImageUploadRequest {
    ctx_id: Identifier,
    surface_id: Identifier,
    instance: u32,
    offset: u32,
    data: Vec<u8>,
});

record!(ImageDownloadRequest {
    ctx_id: Identifier,
    surface_id: Identifier,
    instance: u32,
    offset: u32,
    len: u32,
    force: bool,
});
record!(ImageDownloadBody { data: Vec<u8> });

record!(SurfaceMapRequest {
    surface_id: Identifier,
    instance: u32,
    offset: u32,
    len: u32,
    writable: bool,
});
record!(SurfaceMapBody { token: u64 });
record!(SurfaceUnmapRequest { surface_id: Identifier, instance: u32, token: u64, keep_ptr: bool });

record!(SurfaceCopyRequest {
    ctx_id: Identifier,
    src_surface: Identifier,
    src_instance: u32,
    src_offset: u32,
    dst_surface: Identifier,
    dst_instance: u32,
    dst_offset: u32,
    len: u32,
});

record!(ImageFillRequest {
    ctx_id: Identifier,
    surface_id: Identifier,
    instance: u32,
    offset: u32,
    len: u32,
    pattern: [u32; 4],
});

record!(DispatchBindingWire { slot: u32, surface: Identifier, instance: u32 });

impl Encode for [u32; 4] {
    fn encode(&self, w: &mut Writer) {
        for v in self {
            w.write_u32(*v);
        }
    }
}

impl Decode for [u32; 4] {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok([r.read_u32()?, r.read_u32()?, r.read_u32()?, r.read_u32()?])
    }
}

impl Encode for DispatchBindingWire {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.slot);
        w.write_u32(self.surface);
        w.write_u32(self.instance);
    }
}

impl Decode for DispatchBindingWire {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            slot: r.read_u32()?,
            surface: r.read_u32()?,
            instance: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub ctx_id: Identifier,
    pub language: String,
    pub entry_point: String,
    pub source: Vec<u8>,
    pub args: Vec<DispatchBindingWire>,
    pub topology: WorkTopology,
}

impl Encode for DispatchRequest {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.ctx_id);
        w.write_string(&self.language);
        w.write_string(&self.entry_point);
        w.write_bytes_array(&self.source);
        w.write_array(&self.args, |w, a| a.encode(w));
        self.topology.encode(w);
    }
}

impl Decode for DispatchRequest {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            ctx_id: r.read_u32()?,
            language: r.read_string()?,
            entry_point: r.read_string()?,
            source: r.read_bytes_array()?,
            args: r.read_array(DispatchBindingWire::decode)?,
            topology: WorkTopology::decode(r)?,
        })
    }
}

pub type ContextAllocReply = Reply<Identifier>;
pub type ContextDestroyReply = Reply<()>;
pub type SurfaceAllocReply = Reply<Identifier>;
pub type SurfaceDestroyReply = Reply<()>;
pub type QueueAllocReply = Reply<Identifier>;
pub type QueueDestroyReply = Reply<()>;
pub type QueueFlushReply = Reply<()>;
pub type SamplerAllocReply = Reply<Identifier>;
pub type SamplerDestroyReply = Reply<()>;
pub type KernelAllocReply = Reply<Identifier>;
pub type KernelDestroyReply = Reply<()>;
pub type ImageUploadReply = Reply<()>;
pub type ImageDownloadReply = Reply<ImageDownloadBody>;
pub type SurfaceMapReply = Reply<SurfaceMapBody>;
pub type SurfaceUnmapReply = Reply<()>;
pub type SurfaceCopyReply = Reply<()>;
pub type ImageFillReply = Reply<()>;
pub type DispatchReply = Reply<()>;

// ---- Program C: transcode (stub, spec.md §1 Non-goals) -----------------

record!(XcodeRequest { input: Vec<u8> });
record!(ValidateRequest { input: Vec<u8> });

pub type XcodeReply = Reply<()>;
pub type ValidateReply = Reply<()>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Reader, Writer};

    #[test]
    fn reply_presence_is_independent_of_status() {
        let reply: Reply<Identifier> = Reply::ok(42);
        let mut w = Writer::new();
        reply.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let decoded = Reply::<Identifier>::decode(&mut r).unwrap();
        assert_eq!(decoded, reply);

        let empty_ok: Reply<()> = Reply::ok_empty();
        let mut w = Writer::new();
        empty_ok.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(Reply::<()>::decode(&mut r).unwrap(), empty_ok);
    }

    #[test]
    fn dispatch_request_round_trips() {
        let req = DispatchRequest {
            ctx_id: 3,
            language: "opencl-c".into(),
            entry_point: "double".into(),
            source: vec![1, 2, 3, 4, 5],
            args: vec![DispatchBindingWire { slot: 0, surface: 9, instance: 0 }],
            topology: WorkTopology {
                global_offset: vec![0],
                global_size: vec![64],
                local_size: vec![8],
            },
        };
        let mut w = Writer::new();
        req.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(DispatchRequest::decode(&mut r).unwrap(), req);
    }

    #[test]
    fn request_header_round_trips() {
        let header = RequestHeader {
            program: program::COMPUTE,
            version: VERSION,
            procedure: procedure::DISPATCH,
        };
        let mut w = Writer::new();
        header.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(RequestHeader::decode(&mut r).unwrap(), header);
    }
}
