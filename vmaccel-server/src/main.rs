//! The VMAccel compute server binary: wires the manager, one compute
//! engine bound to a single registered accelerator, the RPC server loop,
//! and (when the `streaming` feature is on) the §4.4 streaming upload
//! listener pool, behind an explicit `poweron`/`poweroff` lifecycle
//! (spec.md §4.5, §9).

mod config;
mod handler;

use std::io;
use std::sync::Arc;

use config::ServerConfig;
use handler::ServerHandler;

use hal::LocalBackend;
use vmc::manager::{Manager, Runtime};
use vmt::{AcceleratorType, VMAccelDesc, WorkloadCapacity};

#[cfg(feature = "streaming")]
use rpc::stream::{StreamServer, StreamSink};
#[cfg(feature = "streaming")]
use vmt::Identifier;

fn main() -> io::Result<()> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!("vmaccel-server starting: rpc={} streams={}", config.rpc_listen_addr, config.max_streams);

    let manager = Manager::new(config.registered_capacity, config.external_capacity);
    manager.poweron().map_err(core_err_to_io)?;
    let runtime = Arc::new(Runtime::new(manager));

    let backend: Arc<dyn hal::Backend> = Arc::new(LocalBackend::new());
    let default_desc = VMAccelDesc {
        parent_id: 0,
        accel_type: AcceleratorType::Gpu,
        capacity: WorkloadCapacity::default(),
        address: Vec::new(),
        type_mask: 0,
        format_caps: Vec::new(),
    };
    let accel_id = runtime
        .lock_state()
        .register_accelerator(backend, default_desc, config.max_surfaces, config.max_contexts, config.max_kernels)
        .map_err(core_err_to_io)?;
    log::info!("registered default accelerator id={accel_id}");

    let handler = Arc::new(ServerHandler::new(runtime.clone(), accel_id));

    #[cfg(feature = "streaming")]
    let _stream_server = {
        let sink: Arc<dyn StreamSink> = Arc::new(StreamUploadSink { handler: handler.clone() });
        match StreamServer::spawn(&config.stream_host, config.stream_base_port, config.max_streams, sink) {
            Ok(server) => {
                log::info!(
                    "streaming listener pool bound: {}:{}..{}",
                    config.stream_host,
                    config.stream_base_port,
                    config.stream_base_port + config.max_streams as u16 - 1
                );
                Some(server)
            }
            Err(e) => {
                log::warn!("streaming listener pool failed to bind, continuing without it: {e}");
                None
            }
        }
    };

    let rpc_server = rpc::server::RpcServer::bind(&config.rpc_listen_addr, handler)?;
    log::info!("rpc server listening on {}", rpc_server.local_addr()?);
    rpc_server.serve()
}

fn core_err_to_io(e: vmc::CoreError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[cfg(feature = "streaming")]
struct StreamUploadSink {
    handler: Arc<ServerHandler>,
}

#[cfg(feature = "streaming")]
impl StreamSink for StreamUploadSink {
    fn capacity(&self, surface_id: Identifier, instance: u32, _offset: u32) -> Option<usize> {
        self.handler.streaming_capacity(surface_id, instance)
    }

    fn write_chunk(&self, surface_id: Identifier, instance: u32, absolute_offset: u32, chunk: &[u8]) -> io::Result<()> {
        self.handler
            .streaming_write(surface_id, instance, absolute_offset, chunk)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}
