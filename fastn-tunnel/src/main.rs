//! fastn-tunnel: forward TCP connections over the fastn P2P network
//!
//! Run `fastn-tunnel server` on the machine that can reach the target, then
//! use `forward`, `pipe` or `ping` from anywhere with that server's ID52.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fastn_tunnel_net::PeerId;

mod cli;

#[derive(Parser)]
#[command(name = "fastn-tunnel")]
#[command(about = "Forward TCP connections over the fastn P2P network")]
struct Cli {
    /// Directory holding this node's key (defaults to FASTN_TUNNEL_HOME env var or ~/.fastn-tunnel)
    #[arg(long, env = "FASTN_TUNNEL_HOME", global = true)]
    home: Option<PathBuf>,

    /// Name of the key file inside the home directory
    #[arg(long, default_value = "tunnel", global = true)]
    alias: String,

    /// Tick interval of the event loop, in milliseconds
    #[arg(long, default_value_t = 20, global = true)]
    poll_interval_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept tunnel requests and connect to the targets they name
    Server {
        /// Only accept peers with this ID52 (repeatable; default: anyone)
        #[arg(long = "allow")]
        allow: Vec<PeerId>,

        /// Seconds to wait for a target to accept a connection
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
    /// Listen on a local port and forward each connection through a server
    Forward {
        /// Server ID52
        peer: PeerId,

        /// <local port>:<remote host>:<remote port>
        #[arg(short = 'L', long = "local")]
        local: cli::LocalForward,
    },
    /// Forward stdin/stdout through a server (for ssh ProxyCommand)
    Pipe {
        /// Server ID52
        peer: PeerId,

        /// <remote host>:<remote port>
        target: cli::Target,
    },
    /// Check that a server answers
    Ping {
        /// Server ID52
        peer: PeerId,

        /// Seconds to wait for the answer
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Print this node's ID52
    Id,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // stdout carries tunnel data in pipe mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let home = cli::get_tunnel_home(cli.home)?;
    let secret_key = fastn_tunnel_net::load_or_create_key(&home, &cli.alias).await?;

    let mut config = fastn_tunnel::TunnelConfig {
        poll_interval: std::time::Duration::from_millis(cli.poll_interval_ms.max(1)),
        ..Default::default()
    };

    match cli.command {
        Commands::Server {
            allow,
            connect_timeout,
        } => {
            config.connect_timeout = std::time::Duration::from_secs(connect_timeout);
            cli::server::run(secret_key, allow, config).await
        }
        Commands::Forward { peer, local } => {
            cli::client::forward(secret_key, peer, local, config).await
        }
        Commands::Pipe { peer, target } => {
            // stdin is still being read on a blocking thread
            cli::exit_now(cli::client::pipe(secret_key, peer, target, config).await)
        }
        Commands::Ping { peer, timeout } => {
            cli::client::ping(
                secret_key,
                peer,
                std::time::Duration::from_secs(timeout),
                config,
            )
            .await
        }
        Commands::Id => {
            println!("{}", PeerId::from(secret_key.public()));
            Ok(())
        }
    }
}
