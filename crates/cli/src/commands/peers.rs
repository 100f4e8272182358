// `tandem peers`: join the project room, list its members, leave.

use clap::Args;
use serde::Serialize;
use tandem_client::engine::{peer_label, DisplayMode};
use tandem_common::types::PeerInfo;

use crate::client::{self, RelayArgs, RelayClient};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct PeersArgs {
    #[command(flatten)]
    relay: RelayArgs,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeersResult {
    pub project: String,
    /// Our own user id; we are always listed.
    pub user_id: String,
    #[serde(skip)]
    pub display_mode: DisplayMode,
    pub peers: Vec<PeerInfo>,
}

pub fn run(args: PeersArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match client::block_on(list_peers(&args)).and_then(|result| result) {
        Ok(result) => {
            output::print_output(format, &result, format_human)?;
            Ok(())
        }
        Err(e) => {
            output::print_anyhow_error(format, &e);
            Err(e)
        }
    }
}

async fn list_peers(args: &PeersArgs) -> anyhow::Result<PeersResult> {
    let config = args.relay.resolve();
    let mut client = RelayClient::start(&config)?.with_timeout(args.relay.wait());
    let user_id = client.identity().user_id.clone();

    let joined = client.joined().await;
    let left = client.leave().await;
    let peers = joined?;
    left?;

    Ok(PeersResult { project: config.project, user_id, display_mode: config.display_mode, peers })
}

fn format_human(result: &PeersResult) -> String {
    let mut lines = vec![format!("{} member(s) in {}:", result.peers.len(), result.project)];
    for peer in &result.peers {
        let label = peer_label(peer, result.display_mode);
        let you = if peer.user_id == result.user_id { " (you)" } else { "" };
        if label == peer.user_id {
            lines.push(format!("  {label}{you}"));
        } else {
            lines.push(format!("  {label} ({}){you}", peer.user_id));
        }
    }
    lines.join("\n")
}
