//! MeshLink CLI.
//!
//! `run` owns a supervised agent session for as long as the process lives.
//! The other commands attach to an agent that is already listening and send
//! a single command, without supervising anything.

mod cli;

use crate::cli::{Cli, Commands};
use clap::Parser;
use meshlink_kernel::{load_config, MeshLink, TopicRegistry};
use meshlink_runtime::locator::is_executable;
use meshlink_runtime::AgentLocator;
use meshlink_types::{Command, MeshLinkConfig, MeshLinkError, MeshLinkResult, Reply};
use meshlink_wire::CommandTransport;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = load_config(cli.config.as_deref());
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => runtime.block_on(cmd_run(config)),
        Commands::Locate => cmd_locate(&config),
        Commands::Address => runtime.block_on(cmd_send(&config, Command::address())),
        Commands::Peers => runtime.block_on(cmd_send(&config, Command::peers())),
        Commands::Stats => runtime.block_on(cmd_send(&config, Command::stats())),
        Commands::Connect { address } => {
            runtime.block_on(cmd_send(&config, Command::connect(&address)))
        }
        Commands::Broadcast { message } => {
            runtime.block_on(cmd_send(&config, Command::broadcast(&message)))
        }
        Commands::Join { topic } => runtime.block_on(cmd_send(&config, Command::join(&topic))),
        Commands::Publish { topic, message } => {
            runtime.block_on(cmd_publish(&config, &topic, &message))
        }
        Commands::Disconnect { peer_id } => {
            runtime.block_on(cmd_send(&config, Command::disconnect_peer(&peer_id)))
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(exit_code(&e));
    }
}

/// Distinct exit codes for "fix your setup" and "agent said no".
fn exit_code(e: &MeshLinkError) -> i32 {
    match e {
        MeshLinkError::RemoteError(_) => 2,
        MeshLinkError::NotFound(_) | MeshLinkError::LaunchFailed(_) => 3,
        MeshLinkError::TransportClosed { .. } => 4,
        _ => 1,
    }
}

async fn cmd_run(config: MeshLinkConfig) -> MeshLinkResult<()> {
    let mesh = MeshLink::new(config);
    mesh.start().await?;
    match mesh.node_address() {
        Some(address) => println!("{address}"),
        None => println!("(node address unavailable)"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for Ctrl+C, stopping");
    }
    mesh.stop().await;
    tracing::info!(restarts = mesh.agent_restarts(), "Agent session ended");
    Ok(())
}

fn cmd_locate(config: &MeshLinkConfig) -> MeshLinkResult<()> {
    let locator = AgentLocator::new(&config.install_dir);
    let path = locator.resolve()?;
    let note = if is_executable(&path) {
        ""
    } else {
        " (not executable yet; `meshlink run` will fix permissions)"
    };
    println!("{}{note}", path.display());
    Ok(())
}

/// Connect to an agent that is already listening.
async fn attach(config: &MeshLinkConfig) -> MeshLinkResult<CommandTransport> {
    CommandTransport::connect(&config.agent_endpoint(), config.startup_timeout()).await
}

async fn cmd_send(config: &MeshLinkConfig, command: Command) -> MeshLinkResult<()> {
    let transport = attach(config).await?;
    let result = transport.send(command).await;
    transport.close().await;
    print_reply(&result?);
    Ok(())
}

async fn cmd_publish(config: &MeshLinkConfig, topic: &str, message: &str) -> MeshLinkResult<()> {
    let transport = attach(config).await?;
    let topics = TopicRegistry::new();
    let result = match topics.ensure_joined(topic, &transport).await {
        Ok(_) => transport.send(Command::publish(topic, message)).await,
        Err(e) => Err(e),
    };
    transport.close().await;
    print_reply(&result?);
    Ok(())
}

fn print_reply(reply: &Reply) {
    match serde_json::to_string_pretty(reply) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{}", reply.clone().into_value()),
    }
}
