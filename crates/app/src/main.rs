//! Skillsync - shared skill cooldown timers for a room of players
//!
//! Host or join a room, type an action id when you use it, and every member
//! sees the countdown.

use std::io::Stdout;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skillsync_core::{room_code, CountdownKey, RoomCode, Settings, TransportKind};
use skillsync_net::{Session, SessionOptions};

mod bus;
mod display;

use bus::SkillEventBus;
use display::ConsoleDisplay;

/// How often countdowns are advanced and session events applied
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "skillsync")]
#[command(about = "Shared skill cooldown timers for a room of players")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Display name, overriding the settings file
    #[arg(long, global = true)]
    name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a room and print its code
    Host {
        /// direct, nat_assisted or relay
        #[arg(short, long)]
        transport: Option<TransportKind>,
    },

    /// Join a room by code
    Join {
        code: String,

        #[arg(short, long)]
        transport: Option<TransportKind>,
    },

    /// Convert between addresses and room codes
    Code {
        #[command(subcommand)]
        action: CodeAction,
    },
}

#[derive(Subcommand)]
enum CodeAction {
    /// Print the room code for an address
    Encode { address: Ipv4Addr },
    /// Print the address a room code points at
    Decode { code: String },
}

/// One line typed while in a room
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Publish(String),
    Dismiss {
        action_id: String,
        player: Option<String>,
    },
    Members,
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Option<ReplCommand> {
    let mut words = line.split_whitespace();
    let first = words.next()?;
    let command = match first {
        "quit" | "exit" => ReplCommand::Quit,
        "members" => ReplCommand::Members,
        "status" => ReplCommand::Status,
        "help" | "?" => ReplCommand::Help,
        "dismiss" => ReplCommand::Dismiss {
            action_id: words.next()?.to_string(),
            player: words.next().map(str::to_string),
        },
        action => ReplCommand::Publish(action.to_string()),
    };
    Some(command)
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Settings::default_path()?,
    };
    let mut settings = Settings::load_or_default(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    if let Some(name) = &cli.name {
        settings.player_name = name.clone();
    }
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Code { action } => match action {
            CodeAction::Encode { address } => {
                println!("{}", RoomCode::encode(*address));
            }
            CodeAction::Decode { code } => {
                let address = room_code::decode(code)?;
                println!("{}", address);
            }
        },
        Commands::Host { transport } => {
            let settings = load_settings(&cli)?;
            let kind = transport.unwrap_or(settings.transport);
            let opts = SessionOptions::from_settings(&settings);
            let session = Session::create_room(kind, &settings.player_name, &opts).await?;

            println!("Room code: {}", session.code());
            if let Some(ip) = session.external_ip() {
                println!("External address: {}", ip);
            }
            if let Some(port) = session.port() {
                println!("Listening on port {}", port);
            }
            run_room(&settings, session).await?;
        }
        Commands::Join { code, transport } => {
            let settings = load_settings(&cli)?;
            let kind = transport.unwrap_or(settings.transport);
            let opts = SessionOptions::from_settings(&settings);
            let session = Session::join_room(kind, code, &settings.player_name, &opts).await?;

            println!("Joined room {}", session.code());
            run_room(&settings, session).await?;
        }
    }

    Ok(())
}

async fn run_room(settings: &Settings, session: Session) -> Result<()> {
    let display = ConsoleDisplay::new(std::io::stdout(), settings.sound);
    let mut bus = SkillEventBus::from_settings(settings, display, Instant::now())?;
    bus.attach(session)?;
    print_help(&mut bus);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pump = tokio::time::interval(PUMP_INTERVAL);
    pump.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = pump.tick() => {
                bus.pump(Instant::now());
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let Some(command) = parse_command(&line) else {
                    continue;
                };
                if command == ReplCommand::Quit {
                    break;
                }
                handle_command(&mut bus, command).await;
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    bus.leave().await;
    Ok(())
}

async fn handle_command(bus: &mut SkillEventBus<ConsoleDisplay<Stdout>>, command: ReplCommand) {
    match command {
        ReplCommand::Publish(action_id) => {
            if let Err(e) = bus.publish(&action_id, Instant::now()).await {
                bus.observer_mut().line(&e.to_string());
            }
        }
        ReplCommand::Dismiss { action_id, player } => {
            let player = player.unwrap_or_else(|| bus.player().to_string());
            let key = CountdownKey::new(player, action_id);
            if !bus.dismiss(&key) {
                bus.observer_mut().line(&format!("no countdown for {}", key));
            }
        }
        ReplCommand::Members => {
            let text = if bus.session().is_none() {
                "not in a room".to_string()
            } else {
                format!("members: {}", bus.members().join(", "))
            };
            bus.observer_mut().line(&text);
        }
        ReplCommand::Status => {
            let room = match bus.session() {
                Some(session) => format!("room {} ({})", session.code(), session.kind()),
                None => "not in a room".to_string(),
            };
            let views = bus.board().snapshot();
            let display = bus.observer_mut();
            display.line(&room);
            display.status(&views);
        }
        ReplCommand::Help => print_help(bus),
        ReplCommand::Quit => {}
    }
}

fn print_help(bus: &mut SkillEventBus<ConsoleDisplay<Stdout>>) {
    let actions: Vec<String> = bus.actions().map(str::to_string).collect();
    let display = bus.observer_mut();
    display.line(&format!("actions: {}", actions.join(", ")));
    display.line("type an action to use it; dismiss <action> [player], members, status, quit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), None);
        assert_eq!(parse_command("quit"), Some(ReplCommand::Quit));
        assert_eq!(
            parse_command(" dash "),
            Some(ReplCommand::Publish("dash".to_string()))
        );
        assert_eq!(
            parse_command("dismiss dash"),
            Some(ReplCommand::Dismiss {
                action_id: "dash".to_string(),
                player: None
            })
        );
        assert_eq!(
            parse_command("dismiss dash bob"),
            Some(ReplCommand::Dismiss {
                action_id: "dash".to_string(),
                player: Some("bob".to_string())
            })
        );
        assert_eq!(parse_command("dismiss"), None);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["skillsync", "--name", "bob", "join", "ABCD", "-t", "relay"])
            .unwrap();
        assert_eq!(cli.name.as_deref(), Some("bob"));
        match cli.command {
            Commands::Join { code, transport } => {
                assert_eq!(code, "ABCD");
                assert_eq!(transport, Some(TransportKind::Relay));
            }
            _ => panic!("expected join"),
        }

        assert!(Cli::try_parse_from(["skillsync", "host", "-t", "carrier-pigeon"]).is_err());
    }

    #[test]
    fn test_load_settings_with_override() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("settings.toml");
        let cli = Cli::try_parse_from([
            "skillsync",
            "--config",
            path.to_str().unwrap(),
            "--name",
            "carol",
            "host",
        ])
        .unwrap();

        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.player_name, "carol");
        assert_eq!(settings.transport, TransportKind::Direct);
    }
}
