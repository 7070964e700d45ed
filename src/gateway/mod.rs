//! Real-time gateway.
//!
//! Clients hold one authenticated WebSocket each and exchange named events
//! with the server. Every request-style event is answered with exactly one
//! response envelope; a few events fan out to all connections instead.
//!
//! Layout:
//! - [`server`] owns the listener and the per-connection loops.
//! - [`router`] turns an inbound frame into a handler call and a reply.
//! - [`handlers`] holds the event catalogue.
//! - [`supervisor`] restarts the listener when the port stops accepting.

pub mod attachments;
pub mod auth;
pub mod chunks;
pub mod cipher;
pub mod envelope;
pub mod events;
pub mod fallback;
pub mod handlers;
pub mod router;
pub mod server;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::memory::MemoryBridge;
use crate::bridge::{
    ActionService, ContactsService, DeviceRegistry, MediaConverter, QueryService, QueueService,
};
use crate::config::ConfigStore;

pub use server::{Connection, ConnectionRegistry, GatewayServer, ServerError};

/// The services the gateway calls into. Each is a seam a host
/// integration replaces.
#[derive(Clone)]
pub struct Collaborators {
    pub query: Arc<dyn QueryService>,
    pub actions: Arc<dyn ActionService>,
    pub devices: Arc<dyn DeviceRegistry>,
    pub queue: Arc<dyn QueueService>,
    /// `None` when no contacts store is wired in at all.
    pub contacts: Option<Arc<dyn ContactsService>>,
    pub converter: Arc<dyn MediaConverter>,
}

impl Collaborators {
    /// Route every contract to one in-memory store.
    pub fn in_memory(bridge: Arc<MemoryBridge>, converter: Arc<dyn MediaConverter>) -> Self {
        Self {
            query: bridge.clone(),
            actions: bridge.clone(),
            devices: bridge.clone(),
            queue: bridge.clone(),
            contacts: Some(bridge),
            converter,
        }
    }
}

/// Everything a handler may touch, passed explicitly to each call.
pub struct GatewayContext {
    pub config: Arc<ConfigStore>,
    pub cipher: cipher::PayloadCipher,
    pub chunks: Arc<chunks::ChunkAssembler>,
    pub connections: Arc<ConnectionRegistry>,
    pub collaborators: Collaborators,
}

impl GatewayContext {
    /// Build the context. Leftover chunk buffers under the data directory
    /// are discarded.
    pub async fn new(
        config: Arc<ConfigStore>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, ServerError> {
        let snapshot = config.snapshot();
        let chunks = chunks::ChunkAssembler::new(
            snapshot.resolved_data_dir().join("chunks"),
            snapshot.chunk_ttl(),
        )
        .await?;
        let cipher = cipher::PayloadCipher::new(config.clone())?;
        Ok(Arc::new(Self {
            config,
            cipher,
            chunks: Arc::new(chunks),
            connections: Arc::new(ConnectionRegistry::new()),
            collaborators,
        }))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.snapshot().resolved_data_dir()
    }

    /// Where converted attachments are cached.
    pub fn convert_dir(&self) -> PathBuf {
        self.data_dir().join("convert")
    }

    /// Where the address book is exported to.
    pub fn contacts_dir(&self) -> PathBuf {
        self.data_dir().join("contacts")
    }
}
