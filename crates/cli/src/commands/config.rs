// `tandem config`: show the effective client configuration.

use clap::Args;
use serde::Serialize;
use tandem_client::config::{global_config_path, ClientConfig};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    /// Config file location, whether or not it exists.
    pub path: Option<String>,
    pub exists: bool,
    #[serde(flatten)]
    pub config: ClientConfig,
}

pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let path = global_config_path();
    let report = ConfigReport {
        exists: path.as_deref().is_some_and(|p| p.exists()),
        path: path.map(|p| p.display().to_string()),
        config: ClientConfig::load(),
    };
    output::print_output(format, &report, format_human)?;
    Ok(())
}

fn format_human(report: &ConfigReport) -> String {
    let config = &report.config;
    let unset = |value: &Option<String>| value.clone().unwrap_or_else(|| "(generated)".into());
    let source = match (&report.path, report.exists) {
        (Some(path), true) => path.clone(),
        (Some(path), false) => format!("{path} (not found, using defaults)"),
        (None, _) => "(no home directory, using defaults)".into(),
    };

    [
        format!("config:            {source}"),
        format!("relay_url:         {}", config.relay_url),
        format!("project:           {}", config.project),
        format!("display_mode:      {}", config.display_mode),
        format!("user_id:           {}", unset(&config.identity.user_id)),
        format!("user_name:         {}", unset(&config.identity.user_name)),
        format!("user_display_name: {}", unset(&config.identity.user_display_name)),
        format!("local_window_ms:   {}", config.sync.local_window_ms),
        format!("remote_window_ms:  {}", config.sync.remote_window_ms),
        format!("max_requeue:       {}", config.sync.max_requeue),
        format!("reconnect_delay:   {}ms", config.sync.reconnect_delay_ms),
    ]
    .join("\n")
}
