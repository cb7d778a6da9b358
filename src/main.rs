use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mumbot::mumble::{ControlHandle, EventHandler, PermissionDenied, TextMessage, VoiceFrame};
use mumbot::transport::Rejection;
use mumbot::{ConnState, ConnectError, MumbleClient, MumbleConfig, TransportError};

/// Headless Mumble client that logs what it sees.
#[derive(Debug, Parser)]
#[command(name = "mumbot", version)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    server: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Only send a UDP status probe and print the answer
    #[arg(long)]
    status: bool,
}

fn build_config(cli: &Cli) -> Result<MumbleConfig, ConnectError> {
    let mut config = match &cli.config {
        Some(path) => MumbleConfig::from_json_file(path)?,
        None => MumbleConfig::default(),
    };
    if let Some(server) = &cli.server {
        config.server = server.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(username) = &cli.username {
        config.username = username.clone();
    }
    if cli.password.is_some() {
        config.password = cli.password.clone();
    }
    Ok(config)
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => mumbot::log_level(),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

struct LogBot;

impl EventHandler for LogBot {
    fn on_connected(&mut self, control: &ControlHandle) {
        let info = control.session_info();
        log::info!(
            "ready: session {:?}, {} channels, {} users",
            info.session,
            control.channels().len(),
            control.users().len()
        );
        if let Some(welcome) = info.welcome_text {
            log::info!("welcome: {welcome}");
        }
    }

    fn on_rejected(&mut self, _control: &ControlHandle, rejection: &Rejection) {
        log::error!("{rejection}");
    }

    fn on_message(&mut self, control: &ControlHandle, message: &TextMessage) {
        let sender = message
            .actor
            .and_then(|actor| control.user(actor))
            .map_or_else(|| "server".to_string(), |user| user.name);
        log::info!("{sender} ({:?}): {}", message.audience, message.message);
    }

    fn on_voice(&mut self, _control: &ControlHandle, frame: &VoiceFrame) {
        log::trace!(
            "voice from {} seq {} ({} bytes)",
            frame.session,
            frame.sequence,
            frame.payload.len()
        );
    }

    fn on_permission_denied(&mut self, _control: &ControlHandle, denied: &PermissionDenied) {
        log::warn!("denied: {}", denied.reason.as_deref().unwrap_or("no reason"));
    }

    fn on_error(&mut self, _control: &ControlHandle, error: &TransportError) {
        log::error!("connection lost: {error}");
    }
}

fn run_probe(client: &MumbleClient) -> ExitCode {
    match client.probe() {
        Ok(Some(status)) => {
            println!(
                "{}:{} version {} users {}/{} bandwidth {} latency {:?}",
                client.config().server,
                client.config().port,
                status.version,
                status.users,
                status.max_users,
                status.max_bandwidth,
                status.latency
            );
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("no response");
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let mut client = MumbleClient::new(config);
    if cli.status {
        return run_probe(&client);
    }

    if let Err(err) = client.connect(LogBot) {
        log::error!("{err}");
        return ExitCode::FAILURE;
    }
    client.wait();
    match client.conn_state() {
        ConnState::Rejected => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}
