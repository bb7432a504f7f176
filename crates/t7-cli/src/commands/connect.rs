//! Connect command implementation

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use t7_core::config::ClientConfig;
use t7_core::{
    ChannelTarget, Credentials, Session, SessionContext, SessionEvents, SessionState,
    StaticFingerprint,
};
use t7_protocol::{ChannelId, Marker};
use t7_session::{
    HybridSession, PeerbookConnection, PeerbookIceServers, SshSession, SshTarget, WebRtcSession,
};

use crate::output::{
    format_outcome, format_resume_hint, print_error, print_info, print_success, print_warning,
};
use crate::terminal::{attach, local_size, Detach};

/// How to reach the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Via {
    /// WebRTC, signaling through the peerbook broker
    Peerbook,
    /// WebRTC, signaling with a single HTTP request
    Http,
    /// Plain SSH
    Ssh,
    /// SSH upgraded to WebRTC when webexec is installed
    Hybrid,
}

#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
    /// Peer fingerprint (peerbook), `host:port` (http) or `[user@]host[:port]` (ssh, hybrid)
    pub target: String,

    /// Transport to use
    #[arg(long, value_enum, default_value_t = Via::Hybrid)]
    pub via: Via,

    /// SSH login name
    #[arg(short, long)]
    pub user: Option<String>,

    /// SSH password
    #[arg(long, env = "T7_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// SSH private key file; takes precedence over a password
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Passphrase of the private key
    #[arg(long, env = "T7_KEY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Command to run in the new pane
    #[arg(short = 'e', long, default_value = "bash")]
    pub command: String,

    /// Resume from a marker printed by an earlier detach
    #[arg(long)]
    pub marker: Option<i64>,

    /// Re-attach to this pane instead of starting a new one
    #[arg(long, requires = "marker")]
    pub pane: Option<u32>,
}

/// Split `[user@]host[:port]`, IPv6 hosts in brackets
pub fn parse_ssh_target(target: &str, user: Option<&str>, default_port: u16) -> Result<SshTarget> {
    let (username, rest) = match target.rsplit_once('@') {
        Some((username, rest)) => (Some(username), rest),
        None => (None, target),
    };
    let username = match username.or(user) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => whoami::username(),
    };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .with_context(|| format!("Unterminated IPv6 address in {:?}", target))?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => bail!("Invalid target {:?}", target),
        }
    } else {
        match rest.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };
    if host.is_empty() {
        bail!("Missing host in {:?}", target);
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in {:?}", target))?,
        None => default_port,
    };

    Ok(SshTarget {
        host: host.to_string(),
        port,
        username,
    })
}

fn credentials(args: &ConnectArgs) -> Result<Option<Credentials>> {
    if let Some(path) = &args.key {
        let private_key = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {:?}", path))?;
        return Ok(Some(Credentials::Key {
            private_key,
            passphrase: args.passphrase.clone(),
        }));
    }
    Ok(args.password.clone().map(Credentials::Password))
}

/// A session ready to connect, and what keeps it alive
struct Built {
    session: Arc<dyn Session>,
    events: SessionEvents,
    peerbook: Option<PeerbookConnection>,
}

fn build_session(config: &ClientConfig, args: &ConnectArgs) -> Result<Built> {
    let fingerprint = config.peerbook.fingerprint.clone().unwrap_or_default();
    let ctx = SessionContext::new(config.net.clone())
        .with_fingerprint(Arc::new(StaticFingerprint(fingerprint.clone())));

    let built = match args.via {
        Via::Peerbook => {
            if fingerprint.is_empty() {
                bail!("peerbook.fingerprint must be set in the configuration");
            }
            let ctx = ctx.with_ice_provider(Arc::new(PeerbookIceServers::new(
                &config.peerbook,
                &config.net,
            )));
            let peerbook =
                PeerbookConnection::new(&config.peerbook, &fingerprint, config.net.queue_capacity)?;
            let (session, events) =
                WebRtcSession::over_peerbook(ctx, peerbook.clone(), args.target.as_str());
            Built {
                session: Arc::new(session),
                events,
                peerbook: Some(peerbook),
            }
        }
        Via::Http => {
            let (session, events) = WebRtcSession::over_http(ctx, &args.target);
            Built {
                session: Arc::new(session),
                events,
                peerbook: None,
            }
        }
        Via::Ssh => {
            let target = ssh_target(config, args)?;
            let (session, events) = SshSession::new(ctx, target, config.ssh.term.clone());
            Built {
                session: Arc::new(session),
                events,
                peerbook: None,
            }
        }
        Via::Hybrid => {
            let target = ssh_target(config, args)?;
            let (session, events) = HybridSession::new(
                ctx,
                target,
                config.ssh.term.clone(),
                config.ssh.accept_command.clone(),
            );
            Built {
                session: Arc::new(session),
                events,
                peerbook: None,
            }
        }
    };
    Ok(built)
}

fn ssh_target(config: &ClientConfig, args: &ConnectArgs) -> Result<SshTarget> {
    let user = args.user.as_deref().or(config.ssh.username.as_deref());
    parse_ssh_target(&args.target, user, config.ssh.port)
}

/// Execute the connect command: board, open a pane and attach to it
pub async fn connect_command(config: &ClientConfig, args: ConnectArgs) -> Result<()> {
    let credentials = credentials(&args)?;
    if matches!(args.via, Via::Ssh | Via::Hybrid) && credentials.is_none() {
        bail!("SSH needs --password (or T7_PASSWORD) or --key");
    }

    let Built {
        session,
        mut events,
        peerbook,
    } = build_session(config, &args)?;
    let marker = args.marker.map(Marker::new);

    print_info(&format!("Connecting to {} via {:?}...", args.target, args.via));
    session.connect(marker, credentials).await?;
    match events.wait_for_outcome().await {
        Some((state, _)) if state.is_boarded() => {}
        Some((state, failure)) => {
            let outcome = format_outcome(state, failure);
            print_error(&format!("Connection failed: {}", outcome));
            bail!("connection to {} ended {}", args.target, outcome);
        }
        None => bail!("session ended before connecting"),
    }
    if args.via == Via::Hybrid && session.is_ssh() {
        print_warning("webexec is not available on the host, continuing over plain SSH");
    }
    print_success("Connected (Ctrl+] to detach)");

    let target = match args.pane {
        Some(id) => ChannelTarget::Existing(ChannelId::new(id)),
        None => ChannelTarget::command(args.command.as_str()).with_size(local_size()),
    };
    let channel = session
        .open_channel(target)
        .await
        .context("Failed to open pane")?;
    let channel_id = channel.id();

    let detach = attach(channel, &mut events).await?;
    match detach {
        Detach::User => match session.disconnect().await {
            Ok(Some(marker)) => {
                print_success("Detached, the remote process keeps running");
                print_info(&format!(
                    "Resume with: {}",
                    format_resume_hint(&args.target, marker, channel_id)
                ));
            }
            Ok(None) => print_success("Detached"),
            Err(e) => {
                tracing::debug!("Disconnect failed: {}", e);
                print_success("Detached");
            }
        },
        Detach::Closed => print_info("Remote process exited"),
        Detach::Lost(state, failure) => {
            print_error(&format!(
                "Session {}",
                format_outcome(state, failure)
            ));
            if state == SessionState::Disconnected {
                if let Some(marker) = session.marker() {
                    print_info(&format!(
                        "Resume with: {}",
                        format_resume_hint(&args.target, marker, channel_id)
                    ));
                }
            }
        }
    }

    session.close().await;
    if let Some(peerbook) = peerbook {
        peerbook.close();
    }
    Ok(())
}
