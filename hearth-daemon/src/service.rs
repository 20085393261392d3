//! The service: startup sequence, accept loop, stop signal, and shutdown.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hearth_core::{Config, ExitCode, ForkType, Session};
use tokio::net::UnixListener;
use tokio::sync::{oneshot, watch};

use crate::collaborators::Collaborators;
use crate::connection::ConnectionHandler;
use crate::context::{ServiceContext, Stores};
use crate::error::{io_err, DaemonError};
use crate::guard::lock;
use crate::handlers::{default_registry, ProtocolRegistry};
use crate::hooks::LoginHook;
use crate::lock::PidLock;
use crate::profiling::Profiler;
use crate::service_info::{self, ServiceInfo};
use crate::startup;
use crate::state::ServiceState;
use crate::store::LocalStore;
use crate::transitions;

/// Where the service is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct ServiceBuilder {
    config: Config,
    collaborators: Option<Collaborators>,
    registry: Option<ProtocolRegistry>,
    fork_type: ForkType,
    chdir: Option<PathBuf>,
    profiler: Option<Profiler>,
}

impl ServiceBuilder {
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fork_type(mut self, fork_type: ForkType) -> Self {
        self.fork_type = fork_type;
        self
    }

    pub fn chdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chdir = Some(dir.into());
        self
    }

    pub fn profiler(mut self, profiler: Profiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn build(self) -> Arc<Service> {
        let collaborators = self
            .collaborators
            .unwrap_or_else(|| Collaborators::defaults(&self.config));
        let rekey_engine = Arc::clone(&collaborators.rekey);
        let (ctx, stop_rx) = ServiceContext::new(self.config, collaborators, self.fork_type);
        let ctx = Arc::new(ctx);
        let state = Arc::new(ServiceState::new(Arc::clone(&ctx.router), rekey_engine));
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        let (started, _) = watch::channel(false);
        Arc::new(Service {
            ctx,
            state,
            registry: self.registry.unwrap_or_else(default_registry),
            profiler: self.profiler.unwrap_or_else(Profiler::from_env),
            chdir: self.chdir,
            lifecycle,
            started,
            stop_rx: Mutex::new(Some(stop_rx)),
        })
    }
}

pub struct Service {
    ctx: Arc<ServiceContext>,
    state: Arc<ServiceState>,
    registry: ProtocolRegistry,
    profiler: Profiler,
    chdir: Option<PathBuf>,
    lifecycle: watch::Sender<Lifecycle>,
    started: watch::Sender<bool>,
    stop_rx: Mutex<Option<oneshot::Receiver<ExitCode>>>,
}

impl Service {
    pub fn builder(config: Config) -> ServiceBuilder {
        ServiceBuilder {
            config,
            collaborators: None,
            registry: None,
            fork_type: ForkType::None,
            chdir: None,
            profiler: None,
        }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Resolves once the listener is bound, or once the service has given up
    /// starting.
    pub async fn wait_started(&self) {
        let mut started = self.started.subscribe();
        let _ = started.wait_for(|started| *started).await;
    }

    /// Ask the running service to exit with `code`. The first request wins.
    pub fn stop(&self, code: ExitCode) -> bool {
        self.ctx.request_stop(code)
    }

    /// Start the service and serve connections until a stop is requested.
    ///
    /// Startup failures (lock held, socket in use, stores or critical
    /// subsystems failing) are returned after the hooks registered so far
    /// have run.
    pub async fn run(self: &Arc<Self>) -> Result<ExitCode, DaemonError> {
        let claimed = self.lifecycle.send_if_modified(|phase| {
            if *phase == Lifecycle::Created {
                *phase = Lifecycle::Starting;
                true
            } else {
                false
            }
        });
        let stop_rx = lock(&self.stop_rx).take();
        let (true, Some(stop_rx)) = (claimed, stop_rx) else {
            return Err(DaemonError::Protocol("service already started".to_string()));
        };

        let listener = match self.start() {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, "service failed to start");
                self.finish().await;
                return Err(err);
            }
        };
        self.lifecycle.send_replace(Lifecycle::Running);
        tracing::info!(
            socket = %self.ctx.config.socket_path().display(),
            label = self.ctx.config.label(),
            "service running",
        );

        let code = self.listen_loop_with_stopper(listener, stop_rx).await;
        self.finish().await;
        tracing::info!(exit_code = %code, "service stopped");
        Ok(code)
    }

    fn start(self: &Arc<Self>) -> Result<UnixListener, DaemonError> {
        let config = &self.ctx.config;
        self.profiler.start();

        let info = ServiceInfo::current(config.label(), self.ctx.fork_type, self.ctx.started_at);
        service_info::write(&config.service_info_path(), &info)?;

        if let Some(dir) = &self.chdir {
            if let Err(err) = std::env::set_current_dir(dir) {
                tracing::warn!(dir = %dir.display(), error = %err, "could not change directory");
            }
        }

        let pid_lock = PidLock::acquire(&config.pid_path())?;
        self.ctx
            .shutdown_hooks
            .push("pid_lock", move || pid_lock.release());

        let socket = config.socket_path();
        if let Some(dir) = socket.parent() {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        prepare_socket_for_bind(&socket)?;

        self.ctx.install_stores(Stores {
            local: LocalStore::force_open(&config.local_store_path())?,
            chat: LocalStore::force_open(&config.chat_store_path())?,
        })?;

        let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
        set_socket_permissions(&socket)?;
        self.started.send_replace(true);
        {
            let socket = socket.clone();
            self.ctx
                .shutdown_hooks
                .push("socket", move || remove_socket(&socket));
        }

        for subsystem in &self.ctx.collaborators.critical {
            subsystem.install(&self.ctx)?;
            tracing::debug!(subsystem = subsystem.name(), "critical subsystem installed");
        }

        startup::run_background_operations(self);
        Ok(listener)
    }

    /// Accept until the stop signal arrives, then close the listener and
    /// wait for the accept loop to let go of it.
    async fn listen_loop_with_stopper(
        self: &Arc<Self>,
        listener: UnixListener,
        stop_rx: oneshot::Receiver<ExitCode>,
    ) -> ExitCode {
        let (close_tx, close_rx) = oneshot::channel();
        let handler = Arc::new(ConnectionHandler::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.state),
            self.registry.clone(),
        ));
        let mut accept = tokio::spawn(accept_loop(listener, close_rx, handler));

        let code = tokio::select! {
            code = stop_rx => code.unwrap_or_else(|_| {
                tracing::warn!("stop signal dropped; exiting normally");
                ExitCode::Ok
            }),
            joined = &mut accept => {
                self.lifecycle.send_replace(Lifecycle::Stopping);
                return match handle_join("accept_loop", joined) {
                    Ok(()) => ExitCode::Ok,
                    Err(err) => {
                        tracing::error!(error = %err, "accept loop failed");
                        ExitCode::NotOk
                    }
                };
            }
        };

        self.lifecycle.send_replace(Lifecycle::Stopping);
        let _ = close_tx.send(());
        if let Err(err) = handle_join("accept_loop", accept.await) {
            tracing::error!(error = %err, "accept loop failed while stopping");
        }
        code
    }

    async fn finish(&self) {
        self.lifecycle.send_if_modified(|phase| {
            if *phase == Lifecycle::Stopping {
                return false;
            }
            *phase = Lifecycle::Stopping;
            true
        });
        self.profiler.stop();
        self.started.send_replace(true);
        transitions::on_shutdown(&self.state).await;
        self.ctx.shutdown_hooks.run_all();
        self.ctx.router.handle_service_shutdown();
        self.ctx.clear_login_hooks();
        self.lifecycle.send_replace(Lifecycle::Stopped);
    }
}

#[async_trait]
impl LoginHook for Service {
    async fn on_login(&self, session: &Session) -> Result<(), DaemonError> {
        transitions::on_login(&self.ctx, &self.state, session).await;
        Ok(())
    }

    async fn on_logout(&self) -> Result<(), DaemonError> {
        transitions::on_logout(&self.state).await;
        Ok(())
    }
}

async fn accept_loop(
    listener: UnixListener,
    mut close: oneshot::Receiver<()>,
    handler: Arc<ConnectionHandler>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = &mut close => {
                tracing::debug!("listener closed");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { handler.handle(stream).await });
                }
                Err(err) if is_transient(&err) => {
                    tracing::warn!(error = %err, "transient accept error");
                }
                Err(err) => return Err(io_err("service socket accept", err)),
            }
        }
    }
    drop(listener);
    Ok(())
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "service socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale service socket before bind",
            );
        }
    }
    remove_socket(socket)
}

fn remove_socket(socket: &Path) -> Result<(), DaemonError> {
    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
