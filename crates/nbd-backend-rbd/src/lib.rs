//! The reference object-store image back end (spec.md §4.3).
//!
//! Modeled on a Ceph-RBD-style bridge: construction connects to a cluster,
//! opens a pool context, and opens an image; reads/writes are issued
//! asynchronously and a completion callback inspects the result. Here
//! "cluster" is a small gRPC image service (see `nbd-cluster-proto`) rather
//! than `librados`/`librbd`, since this pack carries no safe Rust binding
//! for either — the async-client-with-completion-callback shape is
//! preserved exactly.

use std::sync::Arc;

use async_trait::async_trait;
use nbd_backend::{BackendFactory, CompletionSink, EIO, ExportDescriptor, Handler};
use nbd_cluster_proto::image::image_service_client::ImageServiceClient;
use nbd_cluster_proto::image::{
    FlushImageRequest, OpenImageRequest, ReadImageRequest, WriteImageRequest,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct RbdConfig {
    pool: String,
    image: String,
    #[serde(default = "default_user")]
    user: String,
    /// Accepted for parity with the handshake's back-end config, but this
    /// gRPC stand-in has no local cluster config file to load.
    #[serde(default)]
    #[allow(dead_code)]
    cluster_config: Option<String>,
}

fn default_user() -> String {
    "client.admin".to_string()
}

/// Connects to the image service named by `endpoint` for every session that
/// selects the `rbd` back end.
pub struct RbdBackendFactory {
    endpoint: String,
}

impl RbdBackendFactory {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BackendFactory for RbdBackendFactory {
    async fn construct(&self, descriptor: &ExportDescriptor) -> Result<Box<dyn Handler>, String> {
        let config: RbdConfig = serde_json::from_value(descriptor.raw.clone())
            .map_err(|e| format!("invalid rbd backend config: {e}"))?;

        let channel = tonic::transport::Endpoint::new(self.endpoint.clone())
            .map_err(|e| format!("invalid image service endpoint: {e}"))?
            .connect()
            .await
            .map_err(|e| format!("failed to connect to image service: {e}"))?;

        let mut client = ImageServiceClient::new(channel);
        let opened = client
            .open_image(OpenImageRequest {
                user: config.user,
                pool: config.pool.clone(),
                image: config.image.clone(),
            })
            .await
            .map_err(|e| format!("failed to open image {}: {e}", config.image))?
            .into_inner();

        Ok(Box::new(RbdHandler {
            client: Arc::new(Mutex::new(client)),
            pool: config.pool,
            image: config.image,
            size: opened.size_bytes,
        }))
    }
}

/// A [`Handler`] backed by a remote object-store image.
pub struct RbdHandler {
    client: Arc<Mutex<ImageServiceClient<Channel>>>,
    pool: String,
    image: String,
    size: u64,
}

impl Handler for RbdHandler {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, sink: CompletionSink, cookie: u64, offset: u64, length: u32) {
        let client = self.client_handle();
        let pool = self.pool.clone();
        let image = self.image.clone();
        tokio::spawn(async move {
            let mut client = client.lock().await;
            let result = client
                .read_image(ReadImageRequest {
                    pool,
                    image,
                    offset,
                    length: u64::from(length),
                })
                .await;
            match result {
                Ok(reply) => {
                    let reply = reply.into_inner();
                    if reply.posix_errno == 0 {
                        sink.ok_read(cookie, reply.data);
                    } else {
                        warn!("rbd: read failed with errno {}", reply.posix_errno);
                        sink.err(cookie, reply.posix_errno);
                    }
                }
                Err(status) => {
                    warn!("rbd: read RPC failed: {status}");
                    sink.err(cookie, EIO);
                }
            }
        });
    }

    fn write(&self, sink: CompletionSink, cookie: u64, offset: u64, data: Vec<u8>) {
        let client = self.client_handle();
        let pool = self.pool.clone();
        let image = self.image.clone();
        tokio::spawn(async move {
            let mut client = client.lock().await;
            let result = client
                .write_image(WriteImageRequest {
                    pool,
                    image,
                    offset,
                    data,
                })
                .await;
            match result {
                Ok(reply) => {
                    let errno = reply.into_inner().posix_errno;
                    if errno == 0 {
                        sink.ok(cookie);
                    } else {
                        warn!("rbd: write failed with errno {errno}");
                        sink.err(cookie, errno);
                    }
                }
                Err(status) => {
                    warn!("rbd: write RPC failed: {status}");
                    sink.err(cookie, EIO);
                }
            }
        });
    }

    fn flush(&self, sink: CompletionSink, cookie: u64) {
        let client = self.client_handle();
        let pool = self.pool.clone();
        let image = self.image.clone();
        tokio::spawn(async move {
            let mut client = client.lock().await;
            let result = client.flush_image(FlushImageRequest { pool, image }).await;
            match result {
                Ok(reply) => {
                    let errno = reply.into_inner().posix_errno;
                    if errno == 0 {
                        sink.ok(cookie);
                    } else {
                        warn!("rbd: flush failed with errno {errno}");
                        sink.err(cookie, errno);
                    }
                }
                Err(status) => {
                    warn!("rbd: flush RPC failed: {status}");
                    sink.err(cookie, EIO);
                }
            }
        });
    }

    fn close(&self) {
        // Dropping the channel is enough; any completions already in
        // flight tolerate the session (and thus the sink) being gone.
    }
}

impl RbdHandler {
    fn client_handle(&self) -> Arc<Mutex<ImageServiceClient<Channel>>> {
        Arc::clone(&self.client)
    }
}
