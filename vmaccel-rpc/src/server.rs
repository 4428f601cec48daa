//! The blocking RPC server transport (`ENABLE_VMACCEL_RPC`, spec.md §6) and
//! the [`Handler`] trait that decouples the wire dispatch table from
//! `vmaccel-server`'s concrete `Runtime`.
//!
//! One OS thread per connection (spec.md §5: "The RPC server hosts multiple
//! simultaneous connections"); within one connection, requests are served
//! strictly in arrival order since each connection reads one frame, handles
//! it, and writes the reply before reading the next -- this is the "ordered
//! delivery within a single connection" contract spec.md §1 treats as the
//! transport's only requirement.

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::procedures::*;
use crate::wire::{read_frame_from, write_frame_to, Decode, Encode, Reader, WireError, WireResult, Writer};

/// Implemented by whatever owns the actual `vmc::manager::Runtime` (spec.md
/// §4.5, §5); `vmaccel-server` is the only real implementer, but the trait
/// lives here so the dispatch table and the transport loop don't need to
/// know about `vmaccel-core` or `vmaccel-hal` types.
pub trait Handler: Send + Sync {
    fn register(&self, req: RegisterRequest) -> RegisterReply;
    fn unregister(&self, req: UnregisterRequest) -> UnregisterReply;
    fn alloc(&self, req: AllocRequest) -> AllocReply;
    fn free(&self, req: FreeRequest) -> FreeReply;

    fn context_alloc(&self, req: ContextAllocRequest) -> ContextAllocReply;
    fn context_destroy(&self, req: ContextDestroyRequest) -> ContextDestroyReply;
    fn surface_alloc(&self, req: SurfaceAllocRequest) -> SurfaceAllocReply;
    fn surface_destroy(&self, req: SurfaceDestroyRequest) -> SurfaceDestroyReply;
    fn queue_alloc(&self, req: QueueAllocRequest) -> QueueAllocReply;
    fn queue_destroy(&self, req: QueueDestroyRequest) -> QueueDestroyReply;
    fn queue_flush(&self, req: QueueFlushRequest) -> QueueFlushReply;
    fn sampler_alloc(&self, req: SamplerAllocRequest) -> SamplerAllocReply;
    fn sampler_destroy(&self, req: SamplerDestroyRequest) -> SamplerDestroyReply;
    fn kernel_alloc(&self, req: KernelAllocRequest) -> KernelAllocReply;
    fn kernel_destroy(&self, req: KernelDestroyRequest) -> KernelDestroyReply;
    fn image_upload(&self, req: ImageUploadRequest) -> ImageUploadReply;
    fn image_download(&self, req: ImageDownloadRequest) -> ImageDownloadReply;
    fn surface_map(&self, req: SurfaceMapRequest) -> SurfaceMapReply;
    fn surface_unmap(&self, req: SurfaceUnmapRequest) -> SurfaceUnmapReply;
    fn surface_copy(&self, req: SurfaceCopyRequest) -> SurfaceCopyReply;
    fn image_fill(&self, req: ImageFillRequest) -> ImageFillReply;
    fn dispatch(&self, req: DispatchRequest) -> DispatchReply;

    /// Program C is out of scope (spec.md §1 Non-goals); the default
    /// implementation answers both its procedures with `Fail` so the wire
    /// procedure set is complete without a transcoder actually existing.
    fn xcode(&self, _req: XcodeRequest) -> XcodeReply {
        Reply::err(vmt::StatusCode::Fail)
    }

    fn validate(&self, _req: ValidateRequest) -> ValidateReply {
        Reply::err(vmt::StatusCode::Fail)
    }
}

/// Decode a request body for `header`'s `(program, procedure)`, call the
/// matching [`Handler`] method, and encode the reply -- the single place
/// the wire procedure table from spec.md §6 is exhaustively matched.
pub fn dispatch_request(handler: &dyn Handler, header: RequestHeader, r: &mut Reader<'_>) -> WireResult<Vec<u8>> {
    use procedure::*;
    use program::*;

    let mut w = Writer::new();
    match (header.program, header.procedure) {
        (MANAGER, REGISTER) => RegisterRequest::decode(r)?.pipe(|req| handler.register(req)).encode(&mut w),
        (MANAGER, UNREGISTER) => UnregisterRequest::decode(r)?.pipe(|req| handler.unregister(req)).encode(&mut w),
        (MANAGER, ALLOC) => AllocRequest::decode(r)?.pipe(|req| handler.alloc(req)).encode(&mut w),
        (MANAGER, FREE) => FreeRequest::decode(r)?.pipe(|req| handler.free(req)).encode(&mut w),

        (COMPUTE, CONTEXT_ALLOC) => ContextAllocRequest::decode(r)?.pipe(|req| handler.context_alloc(req)).encode(&mut w),
        (COMPUTE, CONTEXT_DESTROY) => ContextDestroyRequest::decode(r)?.pipe(|req| handler.context_destroy(req)).encode(&mut w),
        (COMPUTE, SURFACE_ALLOC) => SurfaceAllocRequest::decode(r)?.pipe(|req| handler.surface_alloc(req)).encode(&mut w),
        (COMPUTE, SURFACE_DESTROY) => SurfaceDestroyRequest::decode(r)?.pipe(|req| handler.surface_destroy(req)).encode(&mut w),
        (COMPUTE, QUEUE_ALLOC) => QueueAllocRequest::decode(r)?.pipe(|req| handler.queue_alloc(req)).encode(&mut w),
        (COMPUTE, QUEUE_DESTROY) => QueueDestroyRequest::decode(r)?.pipe(|req| handler.queue_destroy(req)).encode(&mut w),
        (COMPUTE, QUEUE_FLUSH) => QueueFlushRequest::decode(r)?.pipe(|req| handler.queue_flush(req)).encode(&mut w),
        (COMPUTE, SAMPLER_ALLOC) => SamplerAllocRequest::decode(r)?.pipe(|req| handler.sampler_alloc(req)).encode(&mut w),
        (COMPUTE, SAMPLER_DESTROY) => SamplerDestroyRequest::decode(r)?.pipe(|req| handler.sampler_destroy(req)).encode(&mut w),
        (COMPUTE, KERNEL_ALLOC) => KernelAllocRequest::decode(r)?.pipe(|req| handler.kernel_alloc(req)).encode(&mut w),
        (COMPUTE, KERNEL_DESTROY) => KernelDestroyRequest::decode(r)?.pipe(|req| handler.kernel_destroy(req)).encode(&mut w),
        (COMPUTE, IMAGE_UPLOAD) => ImageUploadRequest::decode(r)?.pipe(|req| handler.image_upload(req)).encode(&mut w),
        (COMPUTE, IMAGE_DOWNLOAD) => ImageDownloadRequest::decode(r)?.pipe(|req| handler.image_download(req)).encode(&mut w),
        (COMPUTE, SURFACE_MAP) => SurfaceMapRequest::decode(r)?.pipe(|req| handler.surface_map(req)).encode(&mut w),
        (COMPUTE, SURFACE_UNMAP) => SurfaceUnmapRequest::decode(r)?.pipe(|req| handler.surface_unmap(req)).encode(&mut w),
        (COMPUTE, SURFACE_COPY) => SurfaceCopyRequest::decode(r)?.pipe(|req| handler.surface_copy(req)).encode(&mut w),
        (COMPUTE, IMAGE_FILL) => ImageFillRequest::decode(r)?.pipe(|req| handler.image_fill(req)).encode(&mut w),
        (COMPUTE, DISPATCH) => DispatchRequest::decode(r)?.pipe(|req| handler.dispatch(req)).encode(&mut w),

        (TRANSCODE, XCODE) => XcodeRequest::decode(r)?.pipe(|req| handler.xcode(req)).encode(&mut w),
        (TRANSCODE, VALIDATE) => ValidateRequest::decode(r)?.pipe(|req| handler.validate(req)).encode(&mut w),

        _ => return Err(WireError::Invalid("unknown (program, procedure)")),
    }
    Ok(w.into_bytes())
}

/// Small local helper so `dispatch_request`'s match arms read as a single
/// decode-call-encode pipeline instead of three nested statements each.
trait Pipe: Sized {
    fn pipe<R>(self, f: impl FnOnce(Self) -> R) -> R {
        f(self)
    }
}
impl<T> Pipe for T {}

/// A bound listener plus the handler every accepted connection is served
/// against. `serve` blocks forever (or until the listener errors); callers
/// that want a lifecycle hook around it run it on its own thread.
pub struct RpcServer<H: Handler + 'static> {
    listener: TcpListener,
    handler: Arc<H>,
}

impl<H: Handler + 'static> RpcServer<H> {
    pub fn bind(addr: impl std::net::ToSocketAddrs, handler: Arc<H>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, spawning one OS thread per connection
    /// (spec.md §5).
    pub fn serve(&self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("rpc server: accept failed: {e}");
                    continue;
                }
            };
            let handler = self.handler.clone();
            thread::spawn(move || {
                if let Err(e) = serve_connection(stream, handler.as_ref()) {
                    log::debug!("rpc server: connection closed: {e}");
                }
            });
        }
        Ok(())
    }
}

fn serve_connection(mut stream: TcpStream, handler: &dyn Handler) -> io::Result<()> {
    let peer = stream.peer_addr().ok();
    log::debug!("rpc server: connection from {peer:?}");
    loop {
        let payload = match read_frame_from(&mut stream) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut r = Reader::new(&payload);
        let header = RequestHeader::decode(&mut r).map_err(to_io_error)?;
        log::trace!(
            "rpc server: program={} procedure={}",
            header.program,
            header.procedure
        );
        let reply = match dispatch_request(handler, header, &mut r) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("rpc server: dispatch failed: {e}");
                return Err(to_io_error(e));
            }
        };
        write_frame_to(&mut stream, &reply)?;
        stream.flush()?;
    }
}

fn to_io_error(e: WireError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}
