//! Clap CLI definitions for MeshLink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  meshlink run                       Launch the agent and keep it supervised
  meshlink locate                    Show where the agent binary is expected
  meshlink address                   Ask a running agent for its node address
  meshlink publish news \"hello\"      Join `news` if needed, then publish";

/// MeshLink: supervise the peer-to-peer agent and talk to it.
#[derive(Parser)]
#[command(name = "meshlink", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch and supervise the agent until Ctrl+C.
    Run,
    /// Print the resolved agent binary path.
    Locate,
    /// Print this node's address (agent must be running).
    Address,
    /// List connected peers.
    Peers,
    /// Show network statistics.
    Stats,
    /// Dial a peer by address.
    Connect {
        /// Peer multiaddress.
        address: String,
    },
    /// Send a message to every connected peer.
    Broadcast {
        /// Message text.
        message: String,
    },
    /// Subscribe the agent to a topic.
    Join {
        /// Topic name.
        topic: String,
    },
    /// Publish a message on a topic, joining it first.
    Publish {
        /// Topic name.
        topic: String,
        /// Message text.
        message: String,
    },
    /// Drop the connection to a peer.
    Disconnect {
        /// Peer ID.
        peer_id: String,
    },
}
