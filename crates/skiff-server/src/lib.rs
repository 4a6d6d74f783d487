//! Server dispatch loop.
//!
//! A [`Server`] accepts TCP connections and runs one worker task per
//! connection. Each worker decodes frames, invokes the backends, and emits
//! replies according to the frame's safety flags. Connection failures end
//! the worker; the backends stay up.

mod dispatch;
mod error;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use skiff_backend::{KvBackend, ObjectBackend};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use error::ServerError;

/// A bound skiff server.
pub struct Server {
    listener: TcpListener,
    object_backend: Arc<dyn ObjectBackend>,
    kv_backend: Arc<dyn KvBackend>,
}

impl Server {
    /// Bind the listener; the server starts serving in [`serve`](Self::serve).
    pub async fn bind(
        addr: impl ToSocketAddrs,
        object_backend: Arc<dyn ObjectBackend>,
        kv_backend: Arc<dyn KvBackend>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            object_backend,
            kv_backend,
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves, then stop accepting
    /// and wait for in-flight workers to finish.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let mut workers = JoinSet::new();
        let mut shutdown = std::pin::pin!(shutdown);

        info!(addr = ?self.listener.local_addr().ok(), "serving");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let object_backend = self.object_backend.clone();
                            let kv_backend = self.kv_backend.clone();
                            workers.spawn(dispatch::serve_connection(
                                stream,
                                object_backend,
                                kv_backend,
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                () = &mut shutdown => {
                    break;
                }
            }
        }

        drop(self.listener);
        info!(in_flight = workers.len(), "draining workers");
        while workers.join_next().await.is_some() {}
        info!("shutdown complete");
        Ok(())
    }
}
