//! Per-connection session: one RPC server, every registered protocol, and
//! the cleanup that releases the connection's handlers exactly once.

use std::sync::{Arc, Once};

use hearth_core::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::context::ServiceContext;
use crate::handlers::{HandlerContext, ProtocolRegistry};
use crate::hooks::HookId;
use crate::rpc::{RpcError, RpcServer, Shutdownable, Transport};
use crate::state::ServiceState;

/// Serves accepted connections.
pub struct ConnectionHandler {
    ctx: Arc<ServiceContext>,
    state: Arc<ServiceState>,
    registry: ProtocolRegistry,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<ServiceContext>, state: Arc<ServiceState>, registry: ProtocolRegistry) -> Self {
        Self {
            ctx,
            state,
            registry,
        }
    }

    /// Serve one connection until its peer goes away or the transport fails.
    ///
    /// The connection's shutdownable handlers are released before this
    /// returns, or earlier if the service shuts down first.
    pub async fn handle<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transport = Transport::new(stream);
        let mut server = RpcServer::new(transport);
        let (closed_tx, closed_rx) = oneshot::channel::<RpcError>();
        let conn_id = self.ctx.router.add_connection(server.outbound(), closed_rx);
        tracing::debug!(conn_id = %conn_id, "connection accepted");

        let hctx = HandlerContext {
            conn_id,
            outbound: server.outbound(),
            ctx: Arc::clone(&self.ctx),
            state: Arc::clone(&self.state),
        };
        let (shutdowners, registered) = self.registry.register_all(&mut server, &hctx);
        drop(hctx);

        let cleanup = Arc::new(ConnectionCleanup::new(conn_id, shutdowners));
        let hook = {
            let cleanup = Arc::clone(&cleanup);
            self.ctx.shutdown_hooks.push("connection", move || {
                cleanup.run();
                Ok(())
            })
        };
        let _guard = CleanupGuard {
            cleanup: Arc::clone(&cleanup),
            ctx: &self.ctx,
            hook,
        };

        if let Err(err) = registered {
            tracing::error!(conn_id = %conn_id, error = %err, "protocol registration failed");
            let _ = closed_tx.send(err);
            return;
        }
        if cleanup.has_run() {
            tracing::debug!(conn_id = %conn_id, "service shutting down; not serving connection");
            let _ = closed_tx.send(RpcError::Closed);
            return;
        }

        let err = server.run().await;
        if err.is_eof() {
            tracing::debug!(conn_id = %conn_id, "connection reached EOF");
        } else {
            tracing::warn!(conn_id = %conn_id, error = %err, "connection serve loop failed");
        }
        let _ = closed_tx.send(err);
    }
}

/// Releases a connection's handlers once, whichever of connection close or
/// service shutdown gets there first.
struct ConnectionCleanup {
    conn_id: ConnectionId,
    once: Once,
    shutdowners: Vec<Arc<dyn Shutdownable>>,
}

impl ConnectionCleanup {
    fn new(conn_id: ConnectionId, shutdowners: Vec<Arc<dyn Shutdownable>>) -> Self {
        Self {
            conn_id,
            once: Once::new(),
            shutdowners,
        }
    }

    fn run(&self) {
        self.once.call_once(|| {
            tracing::debug!(
                conn_id = %self.conn_id,
                handlers = self.shutdowners.len(),
                "releasing connection handlers",
            );
            for handler in &self.shutdowners {
                handler.shutdown();
            }
        });
    }

    fn has_run(&self) -> bool {
        self.once.is_completed()
    }
}

struct CleanupGuard<'a> {
    cleanup: Arc<ConnectionCleanup>,
    ctx: &'a ServiceContext,
    hook: HookId,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.cleanup.run();
        self.ctx.shutdown_hooks.remove(self.hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use hearth_core::{Config, ForkType};
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::collaborators::Collaborators;
    use crate::handlers::{default_registry, ProtocolEntry, Registration};
    use crate::rpc::ProtocolHandler;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ProtocolHandler for Counting {
        async fn call(&self, _method: &str, _params: Value) -> Result<Value, RpcError> {
            Ok(Value::Null)
        }
    }

    impl Shutdownable for Counting {
        fn shutdown(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service(tmp: &TempDir) -> (Arc<ServiceContext>, Arc<ServiceState>) {
        let config = Config::defaults_at(tmp.path());
        let collaborators = Collaborators::defaults(&config);
        let rekey = Arc::clone(&collaborators.rekey);
        let (ctx, _stop) = ServiceContext::new(config, collaborators, ForkType::None);
        let ctx = Arc::new(ctx);
        let state = Arc::new(ServiceState::new(Arc::clone(&ctx.router), rekey));
        (ctx, state)
    }

    fn counting_entry(name: &'static str, count: &Arc<AtomicUsize>) -> ProtocolEntry {
        let count = Arc::clone(count);
        ProtocolEntry::new(name, move |_| {
            Registration::shutdownable(Counting(Arc::clone(&count)))
        })
    }

    #[tokio::test]
    async fn registration_failure_releases_handlers_once() {
        let tmp = TempDir::new().unwrap();
        let (ctx, state) = service(&tmp);
        let count = Arc::new(AtomicUsize::new(0));
        let registry = ProtocolRegistry::new()
            .with(counting_entry("dup", &count))
            .with(counting_entry("dup", &count));
        let handler = ConnectionHandler::new(Arc::clone(&ctx), state, registry);

        let (_client, server) = tokio::io::duplex(1024);
        handler.handle(server).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(ctx.shutdown_hooks.is_empty());
        ctx.shutdown_hooks.run_all();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_racing_service_shutdown_releases_once() {
        for _ in 0..50 {
            let tmp = TempDir::new().unwrap();
            let (ctx, state) = service(&tmp);
            let count = Arc::new(AtomicUsize::new(0));
            let registry = ProtocolRegistry::new().with(counting_entry("counted", &count));
            let handler = Arc::new(ConnectionHandler::new(Arc::clone(&ctx), state, registry));

            let (client, server) = tokio::io::duplex(1024);
            let serving = {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.handle(server).await })
            };
            while ctx.shutdown_hooks.is_empty() {
                tokio::task::yield_now().await;
            }

            let closer = tokio::spawn(async move { drop(client) });
            let stopper = {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { ctx.shutdown_hooks.run_all() })
            };
            closer.await.unwrap();
            stopper.await.unwrap();
            serving.await.unwrap();

            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn ping_round_trip_cleans_up_before_returning() {
        let tmp = TempDir::new().unwrap();
        let (ctx, state) = service(&tmp);
        let count = Arc::new(AtomicUsize::new(0));
        let registry = default_registry().with(counting_entry("counted", &count));
        let handler = Arc::new(ConnectionHandler::new(Arc::clone(&ctx), state, registry));

        let (client, server) = tokio::io::duplex(4096);
        let serving = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle(server).await })
        };

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(b"{\"seq\":1,\"method\":\"debugging.ping\",\"params\":null}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["seq"], 1);
        assert_eq!(frame["ok"], true);
        assert_eq!(frame["data"]["pong"], true);

        assert!(!ctx.shutdown_hooks.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(lines);
        drop(write_half);
        serving.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(ctx.shutdown_hooks.is_empty());
    }
}
