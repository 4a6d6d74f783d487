//! Client library for the skiff storage framework.
//!
//! A [`Client`] owns the process-wide pieces: configuration, optional
//! linked-in backends, the connection pool, the background worker pool, and
//! the operation cache. Handles ([`ObjectHandle`], [`KvHandle`]) schedule
//! operations into a [`Batch`], and executing the batch dispatches them
//! under the batch's [`Semantics`].
//!
//! ```no_run
//! # async fn example() -> Result<(), skiff_client::ClientError> {
//! use bytes::Bytes;
//! use skiff_client::{Client, Semantics, Template};
//!
//! let client = Client::init()?;
//! let object = client.object("demo", "greeting")?;
//!
//! let mut batch = client.batch(Semantics::from_template(Template::Default));
//! object.create(&mut batch);
//! let write = object.write(&mut batch, Bytes::from_static(b"hello"), 0)?;
//! batch.execute().await?;
//! assert_eq!(write.bytes_written(), 5);
//! # Ok(())
//! # }
//! ```

mod background;
mod batch;
mod cache;
mod config;
mod error;
mod kv;
mod object;
mod pool;

use std::sync::Arc;

use skiff_backend::{KvBackend, ObjectBackend};
use skiff_types::key_index;
use tracing::info;

pub use background::{BackgroundPool, TaskHandle};
pub use batch::{Batch, CompletionCallback};
pub use config::{Component, Configuration, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT, StoreSection};
pub use error::ClientError;
pub use kv::{KvGetResult, KvHandle};
pub use object::{ObjectHandle, ReadResult, StatusResult, WriteResult};
pub use skiff_backend::{KvIterator, ObjectStatus};
pub use skiff_types::{
    Atomicity, Consistency, Ordering, Persistency, Safety, Semantics, Template,
};

use cache::OperationCache;
use pool::ConnectionPool;

/// Default bound on deferred safety-none batches.
const DEFAULT_CACHE_CAPACITY: usize = 256;

pub(crate) struct ClientInner {
    configuration: Configuration,
    pub(crate) object_backend: Option<Arc<dyn ObjectBackend>>,
    pub(crate) kv_backend: Option<Arc<dyn KvBackend>>,
    pub(crate) pool: ConnectionPool,
    pub(crate) background: BackgroundPool,
    pub(crate) cache: OperationCache,
}

/// Handle to an initialized skiff client.
///
/// Cloning is cheap; all clones share the pools and the cache. Call
/// [`shutdown`](Client::shutdown) once to flush deferred work.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Initialize from the configuration lookup chain.
    pub fn init() -> Result<Self, ClientError> {
        Self::with_configuration(Configuration::load()?)
    }

    /// Initialize from an explicit configuration.
    pub fn with_configuration(configuration: Configuration) -> Result<Self, ClientError> {
        Self::builder(configuration).build()
    }

    /// Start building a client with overrides (test backends, cache and
    /// worker tuning).
    pub fn builder(configuration: Configuration) -> ClientBuilder {
        ClientBuilder {
            configuration,
            object_backend: None,
            kv_backend: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            background_workers: 0,
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    /// Create a batch bound to a semantics bundle.
    pub fn batch(&self, semantics: Semantics) -> Batch {
        Batch::new(self.inner.clone(), semantics)
    }

    /// Create an object handle; the server index is hashed from the name.
    pub fn object(&self, namespace: &str, name: &str) -> Result<ObjectHandle, ClientError> {
        if namespace.is_empty() || name.is_empty() {
            return Err(ClientError::InvalidArgument("empty namespace or name"));
        }
        let index = key_index(name, self.inner.configuration.object_server_count());
        Ok(ObjectHandle::new(
            index,
            namespace.to_string(),
            name.to_string(),
        ))
    }

    /// Create an object handle pinned to an explicit server index.
    pub fn object_with_index(
        &self,
        index: u32,
        namespace: &str,
        name: &str,
    ) -> Result<ObjectHandle, ClientError> {
        if namespace.is_empty() || name.is_empty() {
            return Err(ClientError::InvalidArgument("empty namespace or name"));
        }
        let count = self.inner.configuration.object_server_count();
        if index >= count {
            return Err(ClientError::ServerIndex { index, count });
        }
        Ok(ObjectHandle::new(
            index,
            namespace.to_string(),
            name.to_string(),
        ))
    }

    /// Create a kv handle; the server index is hashed from the key.
    pub fn kv(&self, namespace: &str, key: &str) -> Result<KvHandle, ClientError> {
        if namespace.is_empty() || key.is_empty() {
            return Err(ClientError::InvalidArgument("empty namespace or key"));
        }
        let index = key_index(key, self.inner.configuration.kv_server_count());
        Ok(KvHandle::new(index, namespace.to_string(), key.to_string()))
    }

    /// Create a kv handle pinned to an explicit server index.
    pub fn kv_with_index(
        &self,
        index: u32,
        namespace: &str,
        key: &str,
    ) -> Result<KvHandle, ClientError> {
        if namespace.is_empty() || key.is_empty() {
            return Err(ClientError::InvalidArgument("empty namespace or key"));
        }
        let count = self.inner.configuration.kv_server_count();
        if index >= count {
            return Err(ClientError::ServerIndex { index, count });
        }
        Ok(KvHandle::new(index, namespace.to_string(), key.to_string()))
    }

    /// Iterate the keys of a namespace, optionally filtered by prefix.
    ///
    /// Iteration is served by a linked-in kv backend (`component =
    /// "client"`); there is no wire operation for it.
    pub async fn kv_iterate(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<KvIterator, ClientError> {
        let Some(backend) = &self.inner.kv_backend else {
            return Err(ClientError::InvalidArgument(
                "kv iteration requires a client-side kv backend",
            ));
        };
        if prefix.is_empty() {
            Ok(backend.get_all(namespace).await?)
        } else {
            Ok(backend.get_by_prefix(namespace, prefix).await?)
        }
    }

    /// Flush deferred batches and drain the background pool.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let flushed = self.inner.cache.flush(&self.inner).await;
        self.inner.background.shutdown().await;
        flushed
    }
}

/// Builder for [`Client`] with explicit backend and tuning overrides.
pub struct ClientBuilder {
    configuration: Configuration,
    object_backend: Option<Arc<dyn ObjectBackend>>,
    kv_backend: Option<Arc<dyn KvBackend>>,
    cache_capacity: usize,
    background_workers: usize,
}

impl ClientBuilder {
    /// Use this object backend instead of resolving the configured one.
    pub fn object_backend(mut self, backend: Arc<dyn ObjectBackend>) -> Self {
        self.object_backend = Some(backend);
        self
    }

    /// Use this kv backend instead of resolving the configured one.
    pub fn kv_backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.kv_backend = Some(backend);
        self
    }

    /// Bound the operation cache; 0 disables safety-none deferral.
    pub fn operation_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Number of background workers; 0 means one per host CPU.
    pub fn background_workers(mut self, workers: usize) -> Self {
        self.background_workers = workers;
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        let configuration = self.configuration;

        // `component = "client"` links the backend into this process;
        // otherwise the pool talks to the configured servers.
        let object_backend = match self.object_backend {
            Some(backend) => Some(backend),
            None if configuration.object().component == Component::Client => {
                let section = configuration.object();
                Some(skiff_backend::object_backend(
                    &section.backend,
                    &section.path,
                )?)
            }
            None => None,
        };
        let kv_backend = match self.kv_backend {
            Some(backend) => Some(backend),
            None if configuration.kv().component == Component::Client => {
                let section = configuration.kv();
                Some(skiff_backend::kv_backend(&section.backend, &section.path)?)
            }
            None => None,
        };

        info!(
            object_servers = configuration.object_server_count(),
            kv_servers = configuration.kv_server_count(),
            object_local = object_backend.is_some(),
            kv_local = kv_backend.is_some(),
            "client initialized"
        );

        let pool = ConnectionPool::new(&configuration);
        Ok(Client {
            inner: Arc::new(ClientInner {
                configuration,
                object_backend,
                kv_backend,
                pool,
                background: BackgroundPool::new(self.background_workers),
                cache: OperationCache::new(self.cache_capacity),
            }),
        })
    }
}
