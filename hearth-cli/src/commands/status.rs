//! `hearth status`: is the service running, and which build.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use hearth_core::config;
use hearth_daemon::{request_status, service_info, DaemonError};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "field")]
    field: String,
    #[tabled(rename = "value")]
    value: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let config = config::resolve().context("failed to load configuration")?;
        let socket = config.socket_path();

        let mut payload = match request_status(&socket) {
            Ok(status) => status,
            Err(DaemonError::ServiceNotRunning { .. }) => json!({
                "running": false,
                "socket": socket.display().to_string(),
            }),
            Err(err) => return Err(err).context("failed to query service status"),
        };
        if let Some(info) = service_info::read(&config.service_info_path())
            .context("failed to read service info")?
        {
            payload["version"] = json!(info.version);
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render service status JSON")?
            );
            return Ok(());
        }

        print_table(&payload);
        Ok(())
    }
}

fn print_table(payload: &Value) {
    let running = payload["running"].as_bool().unwrap_or(false);
    let state = if running {
        "running".green().bold().to_string()
    } else {
        "stopped".red().bold().to_string()
    };
    let mut rows = vec![Row {
        field: "state".to_string(),
        value: state,
    }];
    if let Some(fields) = payload.as_object() {
        for (field, value) in fields {
            if field == "running" {
                continue;
            }
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => "-".to_string(),
                other => other.to_string(),
            };
            rows.push(Row {
                field: field.clone(),
                value,
            });
        }
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
