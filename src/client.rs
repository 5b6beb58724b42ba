use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use photond::ipc::protocol::{CommandRequest, Request, Response};
use photond::{DaemonClient, DaemonConfig};

#[derive(Parser)]
#[command(name = "photon-client")]
#[command(about = "Photon client - send requests to a running photond")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Socket path (defaults to the configured daemon socket)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon answers
    Ping,
    /// Show daemon status
    Status,
    /// Invoke a photon method
    Call {
        photon: String,
        method: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Instance to address
        #[arg(short, long)]
        instance: Option<String>,
    },
    /// Follow a channel and print its events
    Subscribe {
        channel: String,
        /// Replay events after this id first
        #[arg(short, long)]
        last_event_id: Option<u64>,
    },
    /// Publish a JSON message on a channel
    Publish { channel: String, message: String },
    /// Fetch buffered events after an id
    Events { channel: String, last_event_id: u64 },
    /// Reload a photon from disk
    Reload { photon: String },
    /// List scheduled jobs
    Jobs,
    /// Stop the daemon
    Shutdown,
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let socket = match cli.socket {
        Some(socket) => socket,
        None => DaemonConfig::load(None).await?.socket_path(),
    };
    let mut client = DaemonClient::connect(&socket).await?;

    match cli.command {
        Commands::Ping => {
            client.ping().await?;
            println!("🏓 pong");
        }
        Commands::Status => {
            let id = client.next_id();
            print_json(&client.call(&Request::Status { id }).await?)?;
        }
        Commands::Call {
            photon,
            method,
            args,
            instance,
        } => {
            let args: Value = serde_json::from_str(&args).context("--args must be JSON")?;
            let mut cmd = CommandRequest::new(client.next_id(), photon, method).with_args(args);
            cmd.session_id = Some(client.session_id().to_string());
            cmd.client_type = Some("cli".to_string());
            cmd.instance_name = instance;
            print_json(&client.call(&Request::Command(cmd)).await?)?;
        }
        Commands::Subscribe {
            channel,
            last_event_id,
        } => {
            let id = client.next_id();
            client
                .call(&Request::Subscribe {
                    id,
                    channel: channel.clone(),
                    photon_name: None,
                    client_type: Some("cli".to_string()),
                    last_event_id,
                })
                .await?;
            println!("📡 Subscribed to '{}'", channel);
            loop {
                match client.next_push(Duration::from_secs(3600)).await? {
                    Some(Response::ChannelMessage {
                        event_id, message, ..
                    }) => println!("[{}] {}", event_id, message),
                    Some(Response::RefreshNeeded { last_event_id, .. }) => {
                        println!("🔄 Events after {} are gone; refresh full state", last_event_id)
                    }
                    _ => {}
                }
            }
        }
        Commands::Publish { channel, message } => {
            let message: Value =
                serde_json::from_str(&message).unwrap_or(Value::String(message));
            let id = client.next_id();
            print_json(
                &client
                    .call(&Request::Publish {
                        id,
                        channel,
                        message,
                        photon_name: None,
                    })
                    .await?,
            )?;
        }
        Commands::Events {
            channel,
            last_event_id,
        } => {
            let id = client.next_id();
            print_json(
                &client
                    .call(&Request::GetEventsSince {
                        id,
                        channel,
                        last_event_id,
                    })
                    .await?,
            )?;
        }
        Commands::Reload { photon } => {
            let id = client.next_id();
            print_json(
                &client
                    .call(&Request::Reload {
                        id,
                        photon_name: photon,
                        photon_path: None,
                    })
                    .await?,
            )?;
        }
        Commands::Jobs => {
            let id = client.next_id();
            print_json(&client.call(&Request::ListJobs { id }).await?)?;
        }
        Commands::Shutdown => {
            let id = client.next_id();
            client.call(&Request::Shutdown { id }).await?;
            println!("🛑 Daemon is shutting down");
        }
    }

    Ok(())
}
