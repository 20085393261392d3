//! `hearth ctl`: control a running service.

use anyhow::{Context, Result};
use clap::Subcommand;

use hearth_core::{config, ExitCode};
use hearth_daemon::{request_stop, DaemonError};

#[derive(Subcommand, Debug)]
pub enum CtlCommand {
    /// Ask the service to exit.
    Stop {
        /// Exit with the restart code so a supervisor starts it again.
        #[arg(long)]
        restart: bool,
    },
}

pub fn run(command: CtlCommand) -> Result<()> {
    let config = config::resolve().context("failed to load configuration")?;
    let socket = config.socket_path();

    match command {
        CtlCommand::Stop { restart } => {
            let code = if restart { ExitCode::Restart } else { ExitCode::Ok };
            match request_stop(&socket, code) {
                Ok(true) => println!("service stop requested ({code})"),
                Ok(false) => println!("service is already stopping"),
                Err(DaemonError::ServiceNotRunning { .. }) => println!("service is not running"),
                Err(err) => return Err(err).context("failed to stop service"),
            }
        }
    }
    Ok(())
}
