// Relay session plumbing shared by the subcommands: resolve configuration,
// spawn the client runtime, and talk to it over its command/event channels.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use tandem_client::config::ClientConfig;
use tandem_client::engine::{Identity, MemoryDocument, SessionEvent, SyncSession};
use tandem_client::relay::{validate_relay_url, ReconnectPolicy};
use tandem_client::runtime::{run_client, ClientCommand, RuntimeConfig};
use tandem_common::types::PeerInfo;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const COMMAND_BUFFER: usize = 64;

/// Connection flags shared by every networked subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct RelayArgs {
    /// Relay WebSocket URL (overrides config and TANDEM_RELAY_URL).
    #[arg(long)]
    pub relay: Option<String>,
    /// Project room to join.
    #[arg(long)]
    pub project: Option<String>,
    /// Seconds to wait for the relay before giving up.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,
}

impl RelayArgs {
    /// Effective configuration: file, then environment, then these flags.
    pub fn resolve(&self) -> ClientConfig {
        let mut config = ClientConfig::load();
        self.apply(&mut config);
        config
    }

    fn apply(&self, config: &mut ClientConfig) {
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if let Some(project) = &self.project {
            config.project = project.clone();
        }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }
}

/// A running client runtime plus the channels to drive it.
pub struct RelayClient {
    commands: mpsc::Sender<ClientCommand<MemoryDocument>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
    identity: Identity,
    timeout: Duration,
}

impl RelayClient {
    /// Spawn the runtime on the current tokio runtime. It starts connecting
    /// immediately and keeps retrying until [`RelayClient::leave`].
    pub fn start(config: &ClientConfig) -> Result<Self> {
        let relay_url = validate_relay_url(&config.relay_url)
            .with_context(|| format!("invalid relay URL `{}`", config.relay_url))?;
        let identity = config.identity();
        let session = SyncSession::new(identity.clone(), config.session_config());
        let runtime_config = RuntimeConfig {
            relay_url,
            reconnect: ReconnectPolicy::with_delay(config.reconnect_delay()),
        };

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_client(runtime_config, session, command_rx, event_tx, shutdown_rx));

        debug!(user_id = %identity.user_id, project = %identity.project, "client runtime started");
        Ok(Self {
            commands,
            events,
            shutdown,
            task,
            identity,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn send(&self, command: ClientCommand<MemoryDocument>) -> Result<()> {
        self.commands.send(command).await.map_err(|_| anyhow!("client runtime stopped"))
    }

    /// Next session event; `None` once the runtime has stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait until `pick` accepts an event, discarding the ones before it.
    pub async fn wait_for<T, F>(&mut self, what: &str, mut pick: F) -> Result<T>
    where
        F: FnMut(&SessionEvent) -> Option<T>,
    {
        let events = &mut self.events;
        let found = timeout(self.timeout, async {
            while let Some(event) = events.recv().await {
                if let Some(value) = pick(&event) {
                    return Some(value);
                }
            }
            None
        })
        .await
        .with_context(|| format!("timed out waiting for {what}"))?;
        found.ok_or_else(|| anyhow!("client runtime stopped while waiting for {what}"))
    }

    /// Wait for the relay to confirm the join; returns the room members.
    pub async fn joined(&mut self) -> Result<Vec<PeerInfo>> {
        self.wait_for("the active user list", |event| match event {
            SessionEvent::PeersListed { peers } => Some(peers.clone()),
            _ => None,
        })
        .await
    }

    /// Current text of an open document.
    pub async fn snapshot(&self, path: &str) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Snapshot { path: path.to_string(), reply }).await?;
        rx.await.map_err(|_| anyhow!("client runtime stopped"))
    }

    /// Leave the room and wait for the runtime to finish.
    pub async fn leave(mut self) -> Result<()> {
        if self.commands.send(ClientCommand::Leave).await.is_err() {
            debug!("runtime already stopped before leave");
        }
        match timeout(self.timeout, &mut self.task).await {
            Ok(joined) => joined.context("client runtime panicked")?,
            Err(_) => {
                let _ = self.shutdown.send(());
                self.task.await.context("client runtime panicked")?
            }
        }
    }
}

/// Run `future` to completion on a fresh current-thread runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future))
}
