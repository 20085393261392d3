//! Per-connection protocol handlers and the registry that builds them.
//!
//! Every accepted connection gets a fresh handler for each registry entry.
//! Entries that implement [`Shutdownable`] are shut down when their
//! connection ends or the service stops, whichever comes first.

mod ctl;
mod notify;
mod push;
mod rekey;
mod session;
mod status;

use std::sync::Arc;

use hearth_core::ConnectionId;

use crate::context::ServiceContext;
use crate::rpc::{Outbound, ProtocolHandler, RpcError, RpcServer, Shutdownable};
use crate::state::ServiceState;

pub use ctl::{ConfigHandler, CtlHandler, DebuggingHandler};
pub use notify::NotifyCtlHandler;
pub use push::{GregorHandler, ReachabilityHandler};
pub use rekey::{DelegateUiCtlHandler, RekeyHandler};
pub use session::{IdentifyHandler, LoginHandler, SessionHandler, UserHandler};
pub use status::{BadgerHandler, ChatLocalHandler};

/// What a handler constructor sees of its connection and the service.
#[derive(Clone)]
pub struct HandlerContext {
    pub conn_id: ConnectionId,
    pub outbound: Outbound,
    pub ctx: Arc<ServiceContext>,
    pub state: Arc<ServiceState>,
}

/// A constructed handler, plus its shutdown half when it has one.
pub struct Registration {
    pub handler: Arc<dyn ProtocolHandler>,
    pub shutdown: Option<Arc<dyn Shutdownable>>,
}

impl Registration {
    pub fn plain<H: ProtocolHandler + 'static>(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            shutdown: None,
        }
    }

    pub fn shutdownable<H>(handler: H) -> Self
    where
        H: ProtocolHandler + Shutdownable + 'static,
    {
        let handler = Arc::new(handler);
        Self {
            handler: handler.clone(),
            shutdown: Some(handler),
        }
    }
}

type Constructor = Arc<dyn Fn(&HandlerContext) -> Registration + Send + Sync>;

/// One protocol: a wire name and a per-connection constructor.
#[derive(Clone)]
pub struct ProtocolEntry {
    pub name: &'static str,
    build: Constructor,
}

impl ProtocolEntry {
    pub fn new<F>(name: &'static str, build: F) -> Self
    where
        F: Fn(&HandlerContext) -> Registration + Send + Sync + 'static,
    {
        Self {
            name,
            build: Arc::new(build),
        }
    }
}

/// Ordered protocol list served on every connection.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    entries: Vec<ProtocolEntry>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entry: ProtocolEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn push(&mut self, entry: ProtocolEntry) {
        self.entries.push(entry);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Construct every handler, then register them in order.
    ///
    /// The shutdownables of all constructed handlers are returned even when
    /// registration fails part way, so the caller can release them.
    pub fn register_all(
        &self,
        server: &mut RpcServer,
        hctx: &HandlerContext,
    ) -> (Vec<Arc<dyn Shutdownable>>, Result<(), RpcError>) {
        let built: Vec<(&'static str, Registration)> =
            self.entries.iter().map(|e| (e.name, (e.build)(hctx))).collect();
        let shutdowners = built
            .iter()
            .filter_map(|(_, r)| r.shutdown.clone())
            .collect();
        for (name, registration) in built {
            if let Err(err) = server.register(name, registration.handler) {
                return (shutdowners, Err(err));
            }
        }
        (shutdowners, Ok(()))
    }
}

/// Every protocol the service serves.
pub fn default_registry() -> ProtocolRegistry {
    ProtocolRegistry::new()
        .with(ProtocolEntry::new("config", |h| Registration::plain(ConfigHandler::new(h))))
        .with(ProtocolEntry::new("ctl", |h| Registration::plain(CtlHandler::new(h))))
        .with(ProtocolEntry::new("debugging", |_| Registration::plain(DebuggingHandler)))
        .with(ProtocolEntry::new("login", |h| Registration::plain(LoginHandler::new(h))))
        .with(ProtocolEntry::new("session", |h| Registration::plain(SessionHandler::new(h))))
        .with(ProtocolEntry::new("identify", |h| Registration::plain(IdentifyHandler::new(h))))
        .with(ProtocolEntry::new("notify_ctl", |h| {
            Registration::shutdownable(NotifyCtlHandler::new(h))
        }))
        .with(ProtocolEntry::new("gregor", |h| Registration::plain(GregorHandler::new(h))))
        .with(ProtocolEntry::new("reachability", |h| {
            Registration::plain(ReachabilityHandler::new(h))
        }))
        .with(ProtocolEntry::new("rekey", |h| Registration::plain(RekeyHandler::new(h))))
        .with(ProtocolEntry::new("delegate_ui_ctl", |h| {
            Registration::shutdownable(DelegateUiCtlHandler::new(h))
        }))
        .with(ProtocolEntry::new("badger", |h| Registration::plain(BadgerHandler::new(h))))
        .with(ProtocolEntry::new("chat_local", |h| Registration::plain(ChatLocalHandler::new(h))))
        .with(ProtocolEntry::new("user", |h| Registration::plain(UserHandler::new(h))))
}
