//! `hearth service`: run the service in the foreground.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use hearth_core::{config, ExitCode, ForkType};
use hearth_daemon::logging::init_tracing;
use hearth_daemon::profiling::Profiler;
use hearth_daemon::Service;

/// Set by launchd plists; forces the launchd fork type.
pub const ENV_SERVICE_TYPE: &str = "HEARTH_SERVICE_TYPE";

#[derive(Args, Debug)]
pub struct ServiceArgs {
    /// Change to this directory once started.
    #[arg(long)]
    pub chdir: Option<PathBuf>,

    /// Override the service label.
    #[arg(long)]
    pub label: Option<String>,

    /// Started by a client that forked it automatically.
    #[arg(long, conflicts_with_all = ["watchdog_forked", "launchd_forked"])]
    pub auto_forked: bool,

    /// Started under the restart watchdog.
    #[arg(long, conflicts_with = "launchd_forked")]
    pub watchdog_forked: bool,

    /// Started by launchd.
    #[arg(long)]
    pub launchd_forked: bool,
}

impl ServiceArgs {
    pub fn fork_type(&self, service_type: Option<&str>) -> ForkType {
        if service_type.is_some_and(|t| t.eq_ignore_ascii_case("launchd")) || self.launchd_forked {
            ForkType::Launchd
        } else if self.watchdog_forked {
            ForkType::Watchdog
        } else if self.auto_forked {
            ForkType::Auto
        } else {
            ForkType::None
        }
    }

    pub fn run(self) -> Result<ExitCode> {
        let mut config = config::resolve().context("failed to load configuration")?;
        if let Some(label) = self.label.clone() {
            config.label = Some(label);
        }
        let fork_type = self.fork_type(std::env::var(ENV_SERVICE_TYPE).ok().as_deref());

        let profiler = Profiler::from_env();
        init_tracing(Some(&config.log_path()), profiler.trace_path())
            .context("failed to initialize logging")?;
        tracing::info!(fork_type = %fork_type, "starting service");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;

        runtime
            .block_on(async move {
                let mut builder = Service::builder(config)
                    .fork_type(fork_type)
                    .profiler(profiler);
                if let Some(dir) = self.chdir {
                    builder = builder.chdir(dir);
                }
                let service = builder.build();

                let signals = {
                    let service = service.clone();
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            tracing::info!("received ctrl-c, stopping service");
                            service.stop(ExitCode::Ok);
                        }
                    })
                };
                let result = service.run().await;
                signals.abort();
                result
            })
            .context("service exited with error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(auto: bool, watchdog: bool, launchd: bool) -> ServiceArgs {
        ServiceArgs {
            chdir: None,
            label: None,
            auto_forked: auto,
            watchdog_forked: watchdog,
            launchd_forked: launchd,
        }
    }

    #[test]
    fn fork_type_follows_flags_and_environment() {
        assert_eq!(args(false, false, false).fork_type(None), ForkType::None);
        assert_eq!(args(true, false, false).fork_type(None), ForkType::Auto);
        assert_eq!(args(false, true, false).fork_type(None), ForkType::Watchdog);
        assert_eq!(args(false, false, true).fork_type(None), ForkType::Launchd);
        assert_eq!(args(true, false, false).fork_type(Some("launchd")), ForkType::Launchd);
        assert_eq!(args(false, false, false).fork_type(Some("systemd")), ForkType::None);
    }
}
