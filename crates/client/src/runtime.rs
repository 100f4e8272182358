// Client runtime: one task owning the sync session.
//
// A biased `tokio::select!` waits on shutdown, relay frames, editor
// commands and the session's next timer deadline. After every step the
// session's outbound envelopes are written to the socket and its events
// forwarded to the front end.

use tandem_common::error::SyncError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::coalescer::TextChange;
use crate::engine::document::TextDocument;
use crate::engine::presence::Selection;
use crate::engine::session::{SessionEvent, SyncSession};
use crate::relay::{ConnectionState, ReconnectPolicy, RelayConnection};

/// Editor and user activity fed into the runtime.
pub enum ClientCommand<D> {
    /// Start syncing a document.
    Open { path: String, doc: D },
    Close { path: String },
    /// The user switched documents.
    Activate { path: String },
    /// The editor already changed its buffer.
    LocalChange { path: String, change: TextChange },
    /// Change a session-owned document.
    LocalEdit { path: String, change: TextChange },
    Selection { path: String, selection: Selection },
    Chat { msg: String },
    /// Current text of a document, if open.
    Snapshot { path: String, reply: oneshot::Sender<Option<String>> },
    /// Leave the room and stop; no reconnect.
    Leave,
}

/// Where the runtime connects and how it retries.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub relay_url: Url,
    pub reconnect: ReconnectPolicy,
}

enum Exit {
    Leave,
    Disconnected(String),
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until_deadline(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Run the session until the user leaves, the command channel closes or
/// shutdown is signalled. Connection failures are retried after a fixed
/// delay, during which commands are still processed.
pub async fn run_client<D: TextDocument>(
    config: RuntimeConfig,
    mut session: SyncSession<D>,
    mut commands: mpsc::Receiver<ClientCommand<D>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut state = ConnectionState::Disconnected;
    loop {
        state = transition(state, ConnectionState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = shutdown.recv() => return Ok(()),
            result = RelayConnection::connect(&config.relay_url) => result,
        };

        match connected {
            Ok(mut connection) => {
                state = transition(state, ConnectionState::Connected);
                session.on_connected();
                let exit =
                    drive(&mut session, &mut connection, &mut commands, &events, &mut shutdown).await;
                match exit {
                    Exit::Leave => {
                        session.leave();
                        if let Err(e) = flush(&mut session, &mut connection, &events).await {
                            debug!(error = %e, "could not deliver userLeft");
                        }
                        connection.close().await;
                        info!("left project");
                        return Ok(());
                    }
                    Exit::Disconnected(reason) => {
                        warn!(code = "SYNC_CONNECTION_LOST", reason = %reason, "relay connection lost");
                        session.on_disconnected();
                    }
                }
            }
            Err(e) => {
                warn!(code = e.code(), error = %e, url = %config.relay_url, "relay connect failed");
            }
        }
        state = transition(state, ConnectionState::Disconnected);

        let resume_at = Instant::now() + config.reconnect.delay;
        info!(delay_ms = config.reconnect.delay.as_millis() as u64, "reconnecting after delay");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep_until(resume_at) => break,
                command = commands.recv() => {
                    let Some(command) = command else { return Ok(()) };
                    if !apply_command(&mut session, command) {
                        return Ok(());
                    }
                }
                _ = sleep_until_deadline(session.next_deadline()) => session.poll(now()),
            }
            discard_offline(&mut session, &events);
        }
    }
}

fn transition(from: ConnectionState, to: ConnectionState) -> ConnectionState {
    debug!(from = ?from, to = ?to, "connection state");
    to
}

async fn drive<D: TextDocument>(
    session: &mut SyncSession<D>,
    connection: &mut RelayConnection,
    commands: &mut mpsc::Receiver<ClientCommand<D>>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Exit {
    loop {
        if let Err(e) = flush(session, connection, events).await {
            return Exit::Disconnected(e.to_string());
        }

        tokio::select! {
            biased;

            _ = shutdown.recv() => return Exit::Leave,

            frame = connection.recv() => match frame {
                None => return Exit::Disconnected("closed by relay".into()),
                Some(Ok(envelope)) => session.handle_envelope(envelope, now()),
                Some(Err(e)) if e.is_recoverable() => return Exit::Disconnected(e.to_string()),
                Some(Err(e)) => warn!(code = e.code(), error = %e, "dropping relay frame"),
            },

            command = commands.recv() => {
                let Some(command) = command else { return Exit::Leave };
                if !apply_command(session, command) {
                    return Exit::Leave;
                }
            }

            _ = sleep_until_deadline(session.next_deadline()) => session.poll(now()),
        }
    }
}

/// Returns false when the command asks the runtime to stop.
fn apply_command<D: TextDocument>(session: &mut SyncSession<D>, command: ClientCommand<D>) -> bool {
    match command {
        ClientCommand::Open { path, doc } => session.open_document(&path, doc),
        ClientCommand::Close { path } => {
            session.close_document(&path);
        }
        ClientCommand::Activate { path } => session.set_active(&path),
        ClientCommand::LocalChange { path, change } => session.on_local_change(&path, change, now()),
        ClientCommand::LocalEdit { path, change } => {
            if let Err(e) = session.apply_local_edit(&path, change, now()) {
                warn!(path = %path, code = e.code(), error = %e, "local edit rejected");
            }
        }
        ClientCommand::Selection { path, selection } => session.on_local_selection(&path, selection),
        ClientCommand::Chat { msg } => session.send_chat(&msg),
        ClientCommand::Snapshot { path, reply } => {
            let text = session.document(&path).map(TextDocument::text);
            if reply.send(text).is_err() {
                debug!(path = %path, "snapshot requester went away");
            }
        }
        ClientCommand::Leave => return false,
    }
    true
}

async fn flush<D: TextDocument>(
    session: &mut SyncSession<D>,
    connection: &mut RelayConnection,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), SyncError> {
    forward_events(session, events);
    for envelope in session.take_outbound() {
        connection.send(&envelope).await?;
    }
    Ok(())
}

fn forward_events<D: TextDocument>(
    session: &mut SyncSession<D>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    for event in session.take_events() {
        if events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

/// While disconnected nothing can be sent; the session re-announces its
/// state on reconnect.
fn discard_offline<D: TextDocument>(
    session: &mut SyncSession<D>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    forward_events(session, events);
    let dropped = session.take_outbound().len();
    if dropped > 0 {
        debug!(dropped, "discarding operations while disconnected");
    }
}

