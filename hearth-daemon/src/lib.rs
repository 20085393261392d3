//! hearth service runtime: background tasks, RPC connections, subsystem
//! lifecycle, and the client helpers the CLI uses to reach it.

pub mod background;
pub mod badger;
pub mod chat;
pub mod collaborators;
pub mod connection;
pub mod context;
mod error;
mod guard;
pub mod handlers;
pub mod hooks;
pub mod identifier;
pub mod key_upgrade;
pub mod lock;
pub mod logging;
pub mod profiling;
pub mod protocol;
pub mod push;
pub mod rekey;
pub mod router;
pub mod rpc;
pub mod service;
pub mod service_info;
mod startup;
pub mod state;
pub mod store;
mod transitions;

pub use background::{BackgroundTask, RoundContext, RoundError, RoundWork, TaskProbes};
pub use connection::ConnectionHandler;
pub use context::ServiceContext;
pub use error::DaemonError;
pub use handlers::{default_registry, ProtocolEntry, ProtocolRegistry, Registration};
pub use protocol::{call, request_status, request_stop, send_request};
pub use service::{Lifecycle, Service, ServiceBuilder};
pub use state::ServiceState;
pub use transitions::identify_self;
