//! The blocking RPC client transport (`ENABLE_VMACCEL_RPC`, spec.md §6,
//! original's `clnt_call`).
//!
//! One `TcpStream` per client, serialized behind a mutex so concurrent
//! callers still see ordered request/reply delivery on the connection
//! (spec.md §1: "ordered delivery within a single connection" is the
//! transport's only contract). Two independent timeouts are exposed,
//! matching the original's split between a wire-level socket timeout and
//! an application-level deadline (spec.md §5, §9 "Supplemented features":
//! `CLSET_TIMEOUT` default 25s wire / 60s application).

use std::io;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::procedures::*;
use crate::wire::{read_frame_from, write_frame_to, Decode, Encode, Reader, Writer};
use vmt::{
    Identifier, SurfaceDesc, VMAccelDesc, WorkTopology, DEFAULT_APPLICATION_TIMEOUT_SECS,
    DEFAULT_WIRE_TIMEOUT_SECS,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),
    #[error("application timeout exceeded")]
    ApplicationTimeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A connected RPC client bound to one accelerator's compute server (or the
/// manager), per spec.md §6's procedure set split across programs A/B/C.
pub struct RpcClient {
    stream: Mutex<TcpStream>,
    wire_timeout: Duration,
    application_timeout: Duration,
}

impl RpcClient {
    pub fn connect(addr: impl std::net::ToSocketAddrs) -> io::Result<Self> {
        Self::connect_with_timeouts(
            addr,
            Duration::from_secs(DEFAULT_WIRE_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_APPLICATION_TIMEOUT_SECS),
        )
    }

    pub fn connect_with_timeouts(
        addr: impl std::net::ToSocketAddrs,
        wire_timeout: Duration,
        application_timeout: Duration,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok(); // reported, not mandated (spec.md §4.4)
        stream.set_read_timeout(Some(wire_timeout))?;
        stream.set_write_timeout(Some(wire_timeout))?;
        Ok(Self {
            stream: Mutex::new(stream),
            wire_timeout,
            application_timeout,
        })
    }

    /// Send `req` under `header` and decode the typed reply. Every
    /// individual socket read/write is bounded by the wire timeout; the
    /// whole call (across however many socket operations it takes) is
    /// additionally bounded by the application timeout, matching the
    /// original's two-tier `clnt_call` deadline.
    fn call<Req: Encode, Resp: Decode>(&self, header: RequestHeader, req: &Req) -> ClientResult<Resp> {
        let deadline = Instant::now() + self.application_timeout;
        let mut stream = self.stream.lock();

        let mut w = Writer::new();
        header.encode(&mut w);
        req.encode(&mut w);
        let payload = w.into_bytes();
        write_frame_to(&mut *stream, &payload)?;

        if Instant::now() >= deadline {
            return Err(ClientError::ApplicationTimeout);
        }
        let reply_bytes = read_frame_from(&mut *stream)?;
        let mut r = Reader::new(&reply_bytes);
        Ok(Resp::decode(&mut r)?)
    }

    pub fn wire_timeout(&self) -> Duration {
        self.wire_timeout
    }

    pub fn application_timeout(&self) -> Duration {
        self.application_timeout
    }

    fn header(program: u32, procedure: u32) -> RequestHeader {
        RequestHeader { program, version: VERSION, procedure }
    }

    // ---- Program A: manager --------------------------------------------

    pub fn register(&self, desc: VMAccelDesc) -> ClientResult<RegisterReply> {
        self.call(Self::header(program::MANAGER, procedure::REGISTER), &RegisterRequest { desc })
    }

    pub fn unregister(&self, parent_id: Identifier) -> ClientResult<UnregisterReply> {
        self.call(Self::header(program::MANAGER, procedure::UNREGISTER), &UnregisterRequest { parent_id })
    }

    pub fn alloc(&self, parent_id: Identifier, request: VMAccelDesc) -> ClientResult<AllocReply> {
        self.call(Self::header(program::MANAGER, procedure::ALLOC), &AllocRequest { parent_id, request })
    }

    pub fn free(&self, external_id: Identifier) -> ClientResult<FreeReply> {
        self.call(Self::header(program::MANAGER, procedure::FREE), &FreeRequest { external_id })
    }

    // ---- Program B: compute --------------------------------------------

    pub fn context_alloc(&self, accel_id: Identifier, accelerator_mask: u32) -> ClientResult<ContextAllocReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::CONTEXT_ALLOC),
            &ContextAllocRequest { accel_id, accelerator_mask },
        )
    }

    pub fn context_destroy(&self, ctx_id: Identifier) -> ClientResult<ContextDestroyReply> {
        self.call(Self::header(program::COMPUTE, procedure::CONTEXT_DESTROY), &ContextDestroyRequest { ctx_id })
    }

    pub fn surface_alloc(
        &self,
        ctx_id: Identifier,
        instance: u32,
        parent_accel_id: Identifier,
        desc: SurfaceDesc,
    ) -> ClientResult<SurfaceAllocReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::SURFACE_ALLOC),
            &SurfaceAllocRequest { ctx_id, instance, parent_accel_id, desc },
        )
    }

    pub fn surface_destroy(&self, ctx_id: Identifier, surface_id: Identifier, instance: u32) -> ClientResult<SurfaceDestroyReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::SURFACE_DESTROY),
            &SurfaceDestroyRequest { ctx_id, surface_id, instance },
        )
    }

    pub fn queue_alloc(&self, ctx_id: Identifier) -> ClientResult<QueueAllocReply> {
        self.call(Self::header(program::COMPUTE, procedure::QUEUE_ALLOC), &QueueAllocRequest { ctx_id })
    }

    pub fn queue_destroy(&self, ctx_id: Identifier, queue_id: Identifier) -> ClientResult<QueueDestroyReply> {
        self.call(Self::header(program::COMPUTE, procedure::QUEUE_DESTROY), &QueueDestroyRequest { ctx_id, queue_id })
    }

    pub fn queue_flush(&self, ctx_id: Identifier, queue_id: Identifier) -> ClientResult<QueueFlushReply> {
        self.call(Self::header(program::COMPUTE, procedure::QUEUE_FLUSH), &QueueFlushRequest { ctx_id, queue_id })
    }

    pub fn sampler_alloc(&self, ctx_id: Identifier, filter_mode: u32, address_mode: u32) -> ClientResult<SamplerAllocReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::SAMPLER_ALLOC),
            &SamplerAllocRequest { ctx_id, filter_mode, address_mode },
        )
    }

    pub fn sampler_destroy(&self, ctx_id: Identifier, sampler_id: Identifier) -> ClientResult<SamplerDestroyReply> {
        self.call(Self::header(program::COMPUTE, procedure::SAMPLER_DESTROY), &SamplerDestroyRequest { ctx_id, sampler_id })
    }

    pub fn kernel_alloc(&self, ctx_id: Identifier, language: impl Into<String>, entry_point: impl Into<String>) -> ClientResult<KernelAllocReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::KERNEL_ALLOC),
            &KernelAllocRequest { ctx_id, language: language.into(), entry_point: entry_point.into() },
        )
    }

    pub fn kernel_destroy(&self, ctx_id: Identifier, kernel_id: Identifier) -> ClientResult<KernelDestroyReply> {
        self.call(Self::header(program::COMPUTE, procedure::KERNEL_DESTROY), &KernelDestroyRequest { ctx_id, kernel_id })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn image_upload(
        &self,
        ctx_id: Identifier,
        surface_id: Identifier,
        instance: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> ClientResult<ImageUploadReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::IMAGE_UPLOAD),
            &ImageUploadRequest { ctx_id, surface_id, instance, offset, data },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn image_download(
        &self,
        ctx_id: Identifier,
        surface_id: Identifier,
        instance: u32,
        offset: u32,
        len: u32,
        force: bool,
    ) -> ClientResult<ImageDownloadReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::IMAGE_DOWNLOAD),
            &ImageDownloadRequest { ctx_id, surface_id, instance, offset, len, force },
        )
    }

    pub fn surface_map(&self, surface_id: Identifier, instance: u32, offset: u32, len: u32, writable: bool) -> ClientResult<SurfaceMapReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::SURFACE_MAP),
            &SurfaceMapRequest { surface_id, instance, offset, len, writable },
        )
    }

    pub fn surface_unmap(&self, surface_id: Identifier, instance: u32, token: u64, keep_ptr: bool) -> ClientResult<SurfaceUnmapReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::SURFACE_UNMAP),
            &SurfaceUnmapRequest { surface_id, instance, token, keep_ptr },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn surface_copy(
        &self,
        ctx_id: Identifier,
        src_surface: Identifier,
        src_instance: u32,
        src_offset: u32,
        dst_surface: Identifier,
        dst_instance: u32,
        dst_offset: u32,
        len: u32,
    ) -> ClientResult<SurfaceCopyReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::SURFACE_COPY),
            &SurfaceCopyRequest { ctx_id, src_surface, src_instance, src_offset, dst_surface, dst_instance, dst_offset, len },
        )
    }

    pub fn image_fill(&self, ctx_id: Identifier, surface_id: Identifier, instance: u32, offset: u32, len: u32, pattern: [u32; 4]) -> ClientResult<ImageFillReply> {
        self.call(
            Self::header(program::COMPUTE, procedure::IMAGE_FILL),
            &ImageFillRequest { ctx_id, surface_id, instance, offset, len, pattern },
        )
    }

    /// Retries transparently on `ResourceUnavailable` up to
    /// `DISPATCH_RETRY_LIMIT` iterations with `sleep(retry * 1ms)` backoff,
    /// matching the `clnt_call`-adjacent retry site spec.md §5/§7 describes
    /// ("dispatch layer retries") rather than surfacing the first transient
    /// back-pressure reply to the caller.
    pub fn dispatch(
        &self,
        ctx_id: Identifier,
        language: impl Into<String>,
        entry_point: impl Into<String>,
        source: Vec<u8>,
        args: Vec<DispatchBindingWire>,
        topology: WorkTopology,
    ) -> ClientResult<DispatchReply> {
        let header = Self::header(program::COMPUTE, procedure::DISPATCH);
        let req = DispatchRequest { ctx_id, language: language.into(), entry_point: entry_point.into(), source, args, topology };
        let mut retry = 0u32;
        loop {
            let reply: DispatchReply = self.call(header, &req)?;
            if !reply.status.is_retryable() || retry >= vmt::DISPATCH_RETRY_LIMIT {
                return Ok(reply);
            }
            retry += 1;
            log::warn!("dispatch: retrying after ResourceUnavailable (attempt {retry}/{})", vmt::DISPATCH_RETRY_LIMIT);
            std::thread::sleep(Duration::from_millis(retry as u64));
        }
    }

    // spec.md §6 only lists device-descriptor register/unregister/alloc/free
    // for Program A; the manager's second (byte-range) allocator from §4.5
    // has no wire procedures of its own, so there is no client method for it.

    // ---- Program C: transcode (stub, spec.md §1 Non-goals) --------------

    pub fn xcode(&self, input: Vec<u8>) -> ClientResult<XcodeReply> {
        self.call(Self::header(program::TRANSCODE, procedure::XCODE), &XcodeRequest { input })
    }

    pub fn validate(&self, input: Vec<u8>) -> ClientResult<ValidateReply> {
        self.call(Self::header(program::TRANSCODE, procedure::VALIDATE), &ValidateRequest { input })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::server::{Handler, RpcServer};

    /// Answers `dispatch` with `ResourceUnavailable` for its first
    /// `unavailable_for` calls, then `Success`; every other procedure is
    /// unreachable from this test.
    struct FlakyDispatchHandler {
        calls: AtomicU32,
        unavailable_for: u32,
    }

    impl Handler for FlakyDispatchHandler {
        fn register(&self, _req: RegisterRequest) -> RegisterReply {
            unreachable!()
        }
        fn unregister(&self, _req: UnregisterRequest) -> UnregisterReply {
            unreachable!()
        }
        fn alloc(&self, _req: AllocRequest) -> AllocReply {
            unreachable!()
        }
        fn free(&self, _req: FreeRequest) -> FreeReply {
            unreachable!()
        }
        fn context_alloc(&self, _req: ContextAllocRequest) -> ContextAllocReply {
            unreachable!()
        }
        fn context_destroy(&self, _req: ContextDestroyRequest) -> ContextDestroyReply {
            unreachable!()
        }
        fn surface_alloc(&self, _req: SurfaceAllocRequest) -> SurfaceAllocReply {
            unreachable!()
        }
        fn surface_destroy(&self, _req: SurfaceDestroyRequest) -> SurfaceDestroyReply {
            unreachable!()
        }
        fn queue_alloc(&self, _req: QueueAllocRequest) -> QueueAllocReply {
            unreachable!()
        }
        fn queue_destroy(&self, _req: QueueDestroyRequest) -> QueueDestroyReply {
            unreachable!()
        }
        fn queue_flush(&self, _req: QueueFlushRequest) -> QueueFlushReply {
            unreachable!()
        }
        fn sampler_alloc(&self, _req: SamplerAllocRequest) -> SamplerAllocReply {
            unreachable!()
        }
        fn sampler_destroy(&self, _req: SamplerDestroyRequest) -> SamplerDestroyReply {
            unreachable!()
        }
        fn kernel_alloc(&self, _req: KernelAllocRequest) -> KernelAllocReply {
            unreachable!()
        }
        fn kernel_destroy(&self, _req: KernelDestroyRequest) -> KernelDestroyReply {
            unreachable!()
        }
        fn image_upload(&self, _req: ImageUploadRequest) -> ImageUploadReply {
            unreachable!()
        }
        fn image_download(&self, _req: ImageDownloadRequest) -> ImageDownloadReply {
            unreachable!()
        }
        fn surface_map(&self, _req: SurfaceMapRequest) -> SurfaceMapReply {
            unreachable!()
        }
        fn surface_unmap(&self, _req: SurfaceUnmapRequest) -> SurfaceUnmapReply {
            unreachable!()
        }
        fn surface_copy(&self, _req: SurfaceCopyRequest) -> SurfaceCopyReply {
            unreachable!()
        }
        fn image_fill(&self, _req: ImageFillRequest) -> ImageFillReply {
            unreachable!()
        }
        fn dispatch(&self, _req: DispatchRequest) -> DispatchReply {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.unavailable_for {
                Reply::err(vmt::StatusCode::ResourceUnavailable)
            } else {
                Reply::ok_empty()
            }
        }
    }

    fn dispatch_request() -> (Identifier, String, String, Vec<u8>, Vec<DispatchBindingWire>, WorkTopology) {
        (
            0,
            "opencl-c".to_string(),
            "double".to_string(),
            b"kernel source".to_vec(),
            vec![],
            WorkTopology { global_offset: vec![0], global_size: vec![1], local_size: vec![1] },
        )
    }

    #[test]
    fn dispatch_retries_resource_unavailable_then_succeeds() {
        let handler = Arc::new(FlakyDispatchHandler { calls: AtomicU32::new(0), unavailable_for: 3 });
        let server = RpcServer::bind("127.0.0.1:0", handler.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.serve());

        let client = RpcClient::connect(addr).unwrap();
        let (ctx_id, language, entry_point, source, args, topology) = dispatch_request();
        let reply = client.dispatch(ctx_id, language, entry_point, source, args, topology).unwrap();
        assert_eq!(reply.status, vmt::StatusCode::Success);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn dispatch_gives_up_after_retry_limit() {
        let handler = Arc::new(FlakyDispatchHandler { calls: AtomicU32::new(0), unavailable_for: u32::MAX });
        let server = RpcServer::bind("127.0.0.1:0", handler.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.serve());

        let client = RpcClient::connect(addr).unwrap();
        let (ctx_id, language, entry_point, source, args, topology) = dispatch_request();
        let reply = client.dispatch(ctx_id, language, entry_point, source, args, topology).unwrap();
        assert_eq!(reply.status, vmt::StatusCode::ResourceUnavailable);
        assert_eq!(handler.calls.load(Ordering::SeqCst), vmt::DISPATCH_RETRY_LIMIT + 1);
    }
}
