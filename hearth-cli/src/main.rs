//! hearth: local service daemon and its control client.
//!
//! # Usage
//!
//! ```text
//! hearth service [--chdir <dir>] [--label <label>] [--auto-forked|--watchdog-forked|--launchd-forked]
//! hearth ctl stop [--restart]
//! hearth status [--json]
//! hearth call <protocol.method> [params-json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{call::CallArgs, ctl::CtlCommand, service::ServiceArgs, status::StatusArgs};

#[derive(Parser, Debug)]
#[command(
    name = "hearth",
    version,
    about = "Run and control the hearth background service",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the service in the foreground until it is stopped.
    Service(ServiceArgs),

    /// Control a running service.
    Ctl {
        #[command(subcommand)]
        command: CtlCommand,
    },

    /// Show whether the service is running.
    Status(StatusArgs),

    /// Invoke one RPC method on the running service.
    Call(CallArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Service(args) => {
            let code = args.run()?;
            std::process::exit(code.code());
        }
        Commands::Ctl { command } => commands::ctl::run(command),
        Commands::Status(args) => args.run(),
        Commands::Call(args) => args.run(),
    }
}
