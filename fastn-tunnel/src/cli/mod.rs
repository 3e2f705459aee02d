//! Command line front end: argument types and the glue that builds an
//! event loop for each subcommand.

use std::path::PathBuf;

pub mod client;
pub mod server;

/// Get the home directory from clap args, environment variable, or default
pub fn get_tunnel_home(custom_home: Option<PathBuf>) -> eyre::Result<PathBuf> {
    if let Some(home) = custom_home {
        return Ok(home);
    }

    let home_dir = directories::UserDirs::new()
        .ok_or_else(|| eyre::eyre!("Could not determine user home directory"))?
        .home_dir()
        .to_path_buf();

    Ok(home_dir.join(".fastn-tunnel"))
}

/// Run `event_loop` until it finishes on its own or the user hits Ctrl-C.
pub async fn run_until_interrupted<T, R>(
    event_loop: fastn_tunnel::EventLoop<T, R>,
) -> eyre::Result<R>
where
    T: fastn_tunnel_net::Transport,
    R: fastn_tunnel::Role,
{
    let cancel = event_loop.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            cancel.cancel();
        }
    });
    event_loop.run().await
}

/// Status the process exits with for a command's outcome.
pub fn exit_code(outcome: &eyre::Result<()>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// End the process now instead of returning from `main`.
///
/// Dropping the runtime would wait for the blocking read on stdin, which
/// returns only once the other end of the pipe writes or closes it. Exiting
/// also closes stdout, so the process on the other end sees EOF.
pub fn exit_now(outcome: eyre::Result<()>) -> ! {
    if let Err(e) = &outcome {
        eprintln!("Error: {e:?}");
    }
    if let Err(e) = std::io::Write::flush(&mut std::io::stdout()) {
        tracing::debug!("Flushing stdout: {e}");
    }
    std::process::exit(exit_code(&outcome))
}

/// `<host>:<port>` of a forwarding target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected <host>:<port>, got {s:?}"))?;
        // [::1]:22 style
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(format!("missing host in {s:?}"));
        }
        let port = port
            .parse()
            .map_err(|_| format!("invalid port {port:?} in {s:?}"))?;
        Ok(Target {
            host: host.to_string(),
            port,
        })
    }
}

/// `<local port>:<host>:<port>`, as in `ssh -L`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    pub local_port: u16,
    pub target: Target,
}

impl std::str::FromStr for LocalForward {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local_port, target) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <local port>:<host>:<port>, got {s:?}"))?;
        let local_port = local_port
            .parse()
            .map_err(|_| format!("invalid local port {local_port:?} in {s:?}"))?;
        Ok(LocalForward {
            local_port,
            target: target.parse()?,
        })
    }
}
