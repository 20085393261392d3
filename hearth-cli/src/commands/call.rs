//! `hearth call`: invoke one method on the running service.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use hearth_core::config;
use hearth_daemon::call;

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Method as `<protocol>.<method>`, e.g. `debugging.ping`.
    pub method: String,

    /// JSON parameters.
    pub params: Option<String>,
}

impl CallArgs {
    pub fn run(self) -> Result<()> {
        let config = config::resolve().context("failed to load configuration")?;
        let params = match self.params.as_deref() {
            Some(raw) => serde_json::from_str(raw).context("params must be valid JSON")?,
            None => Value::Null,
        };
        let data = call(&config.socket_path(), &self.method, params)
            .with_context(|| format!("call to {} failed", self.method))?;
        println!(
            "{}",
            serde_json::to_string_pretty(&data).context("failed to render response JSON")?
        );
        Ok(())
    }
}
