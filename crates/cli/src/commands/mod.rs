// CLI subcommand dispatch.

use clap::Subcommand;

pub mod chat;
pub mod config;
pub mod follow;
pub mod peers;

#[derive(Subcommand)]
pub enum Command {
    /// Share a file with the room and keep it in sync until Ctrl-C
    Follow(follow::FollowArgs),
    /// List the members of the project room
    Peers(peers::PeersArgs),
    /// Send a chat message to the project room
    Chat(chat::ChatArgs),
    /// Show the effective client configuration
    Config(config::ConfigArgs),
}

pub fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Follow(args) => follow::run(args),
        Command::Peers(args) => peers::run(args),
        Command::Chat(args) => chat::run(args),
        Command::Config(args) => config::run(args),
    }
}
