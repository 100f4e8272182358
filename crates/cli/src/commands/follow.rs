// `tandem follow`: headless peer for one file.
//
// Loads the file, joins the room, registers the document and writes the file
// back after every batch of remote edits. Presence and chat are printed
// until Ctrl-C.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use tandem_client::engine::{peer_label, DisplayMode, MemoryDocument, SessionEvent};
use tandem_client::runtime::ClientCommand;
use tandem_common::path::paths_match;
use tracing::{debug, info};

use crate::client::{self, RelayArgs, RelayClient};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct FollowArgs {
    /// File to share.
    file: PathBuf,
    /// Document name announced to the room (defaults to FILE as given).
    #[arg(long)]
    name: Option<String>,
    #[command(flatten)]
    relay: RelayArgs,
    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,
}

pub fn run(args: FollowArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match client::block_on(follow(&args, format)).and_then(|result| result) {
        Ok(()) => Ok(()),
        Err(e) => {
            output::print_anyhow_error(format, &e);
            Err(e)
        }
    }
}

/// Name the document is announced under: the explicit name, else the path
/// as typed with `/` separators.
fn document_name(file: &Path, name: Option<&str>) -> String {
    match name {
        Some(name) => name.to_string(),
        None => file.to_string_lossy().replace('\\', "/"),
    }
}

async fn follow(args: &FollowArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = args.relay.resolve();
    let text = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read `{}`", args.file.display()))?;
    let path = document_name(&args.file, args.name.as_deref());
    let mode = config.display_mode;

    let mut client = RelayClient::start(&config)?.with_timeout(args.relay.wait());
    client
        .send(ClientCommand::Open { path: path.clone(), doc: MemoryDocument::from_text(&text) })
        .await?;
    client.send(ClientCommand::Activate { path: path.clone() }).await?;
    info!(path = %path, relay = %config.relay_url, project = %config.project, "following");

    let mut written = text;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            event = client.next_event() => {
                let Some(event) = event else {
                    break Err(anyhow::anyhow!("client runtime stopped"));
                };
                if let SessionEvent::RemoteApplied { path: applied, .. } = &event {
                    if paths_match(applied, &path) {
                        if let Err(e) = write_back(&client, &path, &args.file, &mut written).await {
                            break Err(e);
                        }
                    }
                }
                output::print_output(format, &event, |event| format_event(event, mode))?;
            }
        }
    };

    let left = client.leave().await;
    outcome?;
    left
}

async fn write_back(
    client: &RelayClient,
    path: &str,
    file: &Path,
    written: &mut String,
) -> anyhow::Result<()> {
    let Some(text) = client.snapshot(path).await? else {
        return Ok(());
    };
    if text == *written {
        return Ok(());
    }
    tokio::fs::write(file, &text)
        .await
        .with_context(|| format!("failed to write `{}`", file.display()))?;
    debug!(path = %path, bytes = text.len(), "wrote remote edits to disk");
    *written = text;
    Ok(())
}

fn format_event(event: &SessionEvent, mode: DisplayMode) -> String {
    match event {
        SessionEvent::PeerJoined { label, .. } => format!("+ {label} joined"),
        SessionEvent::PeerLeft { label, .. } => format!("- {label} left"),
        SessionEvent::PeersListed { peers } => {
            let names: Vec<&str> = peers.iter().map(|peer| peer_label(peer, mode)).collect();
            format!("in room: {}", names.join(", "))
        }
        SessionEvent::MarkerShown { label, marker, .. } => format!(
            "{label} at {}:{}:{}",
            marker.path,
            marker.cursor.line + 1,
            marker.cursor.character + 1
        ),
        SessionEvent::MarkerCleared { user_id } => format!("{user_id} left this document"),
        SessionEvent::Chat { label, msg, .. } => format!("<{label}> {msg}"),
        SessionEvent::RemoteApplied { path, count } => {
            format!("{path}: applied {count} remote edit(s)")
        }
        SessionEvent::TableReplaced { path, lines } => format!("{path}: synced ({lines} lines)"),
        SessionEvent::ResyncRequested { path, reason } => {
            format!("{path}: resyncing ({reason})")
        }
        SessionEvent::OperationDropped { path, reason } => {
            format!("{path}: dropped an edit ({reason})")
        }
    }
}
