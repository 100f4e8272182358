// `tandem chat`: join the project room, send one message, leave.

use clap::Args;
use serde::Serialize;
use tandem_client::runtime::ClientCommand;

use crate::client::{self, RelayArgs, RelayClient};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Message text.
    message: String,
    #[command(flatten)]
    relay: RelayArgs,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResult {
    pub project: String,
    pub user_id: String,
    pub msg: String,
    /// Members in the room when the message went out, including us.
    pub recipients: usize,
}

pub fn run(args: ChatArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    if args.message.trim().is_empty() {
        let error = anyhow::anyhow!("chat message is empty");
        output::print_anyhow_error(format, &error);
        return Err(error);
    }

    match client::block_on(send_chat(&args)).and_then(|result| result) {
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

async fn send_chat(args: &ChatArgs) -> anyhow::Result<ChatResult> {
    let config = args.relay.resolve();
    let mut client = RelayClient::start(&config)?.with_timeout(args.relay.wait());
    let user_id = client.identity().user_id.clone();

    let sent = async {
        let peers = client.joined().await?;
        client.send(ClientCommand::Chat { msg: args.message.clone() }).await?;
        anyhow::Ok(peers.len())
    }
    .await;
    let left = client.leave().await;
    let recipients = sent?;
    left?;

    Ok(ChatResult { project: config.project, user_id, msg: args.message.clone(), recipients })
}

fn format_human(result: &ChatResult) -> String {
    let others = result.recipients.saturating_sub(1);
    format!("sent to {} ({} other member(s)): {}", result.project, others, result.msg)
}
