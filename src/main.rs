//! SimApprover: approve or reject remote shell commands from your terminal
//!
//! Companion client for the `sim` command wrapper: commands run under `sim`
//! block until someone approves them here. New request ids arrive over a
//! streaming WebSocket (or an external push service), get resolved into full
//! requests, and queue up until you press y or n.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use simapprover::api;
use simapprover::backlog::Backlog;
use simapprover::config::{self, UplinkKind};
use simapprover::proto::ApproveResponse;
use simapprover::uplink::{self, Uplink, UplinkEvent};

#[derive(Parser)]
#[command(name = "simapprover", version, about = "Approve remote shell commands")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the server and approve requests interactively (default)
    Run {
        /// Server host, overrides the config file
        #[arg(long)]
        host: Option<String>,
        /// Path prefix of the sim endpoints, overrides the config file
        #[arg(long)]
        base_path: Option<String>,
        /// Shared-secret PIN, overrides the config file
        #[arg(long)]
        pin: Option<String>,
        /// Delivery strategy, overrides the config file
        #[arg(long, value_enum)]
        uplink: Option<UplinkKind>,
    },
    /// Show the persisted configuration
    Config,
    /// Persist one configuration value
    Set {
        /// One of: host, base_path, pin, poll, uplink, cloud_reply_url
        key: String,
        value: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        None => run(None, None, None, None).await,
        Some(Command::Run {
            host,
            base_path,
            pin,
            uplink,
        }) => run(host, base_path, pin, uplink).await,
        Some(Command::Config) => show_config(),
        Some(Command::Set { key, value }) => set_config(&key, &value),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn show_config() -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = config::load_or_init();
    cfg.pin = "********".into();
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

fn set_config(key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = config::load_or_init();
    match key {
        "host" => cfg.base_host = value.to_string(),
        "base_path" => cfg.base_path = value.to_string(),
        "pin" => cfg.pin = value.to_string(),
        "poll" => cfg.poll = value.parse()?,
        "uplink" => {
            cfg.uplink = match value {
                "stream" => UplinkKind::Stream,
                "push" => UplinkKind::Push,
                other => return Err(format!("unknown uplink kind {other:?}").into()),
            }
        }
        "cloud_reply_url" => cfg.cloud_reply_url = value.to_string(),
        other => return Err(format!("unknown config key {other:?}").into()),
    }
    config::save_config(&cfg)?;
    println!("{key} updated");
    Ok(())
}

async fn run(
    host: Option<String>,
    base_path: Option<String>,
    pin: Option<String>,
    uplink_kind: Option<UplinkKind>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = config::load_or_init();
    if let Some(host) = host {
        cfg.base_host = host;
    }
    if let Some(base_path) = base_path {
        cfg.base_path = base_path;
    }
    if let Some(pin) = pin {
        cfg.pin = pin;
    }
    if let Some(kind) = uplink_kind {
        cfg.uplink = kind;
    }

    let backlog = Arc::new(Backlog::new());
    let (events_tx, mut events_rx) = broadcast::channel::<UplinkEvent>(64);
    let (uplink, _push_tx) = Uplink::build(&cfg, backlog.clone(), events_tx.clone());
    let uplink = Arc::new(uplink);
    uplink.init();

    let mut polling = cfg.poll;
    if polling {
        uplink.start();
    } else {
        println!("{}", "Polling disabled; press p to start.".dimmed());
    }

    println!(
        "Connected to {}. {}",
        cfg.base_host.as_str().bold(),
        "y approve, n [comment] reject, p toggle polling, q quit".dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // Id of the request currently shown, to avoid redrawing the same head.
    let mut shown: Option<String> = None;

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Ok(UplinkEvent::BacklogChanged) => draw_head(&backlog, &mut shown),
                Ok(UplinkEvent::Status(status)) => {
                    let line = format!("Status: {status}");
                    println!("{}", line.as_str().dimmed());
                }
                Ok(UplinkEvent::Error(msg)) => {
                    eprintln!("{} {}", "!".red().bold(), msg);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("UI missed {} events", n);
                    draw_head(&backlog, &mut shown);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Some(Action::Approve) => decide(&uplink, &backlog, &events_tx, true, None),
                    Some(Action::Reject(comment)) => {
                        decide(&uplink, &backlog, &events_tx, false, comment)
                    }
                    Some(Action::TogglePoll) => {
                        polling = !polling;
                        if polling {
                            uplink.start();
                        } else {
                            uplink.stop();
                            shown = None;
                        }
                        cfg.poll = polling;
                        if let Err(e) = config::save_config(&cfg) {
                            tracing::warn!("Failed to persist poll switch: {}", e);
                        }
                    }
                    Some(Action::Quit) => break,
                    None => {
                        println!(
                            "{}",
                            "y approve, n [comment] reject, p toggle polling, q quit".dimmed()
                        );
                    }
                }
                draw_head(&backlog, &mut shown);
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    uplink.stop();
    Ok(())
}

enum Action {
    Approve,
    Reject(Option<String>),
    TogglePoll,
    Quit,
}

fn parse_command(line: &str) -> Option<Action> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    match cmd {
        "y" | "yes" | "a" | "approve" => Some(Action::Approve),
        "n" | "no" | "r" | "reject" => Some(Action::Reject(
            (!rest.is_empty()).then(|| rest.to_string()),
        )),
        "p" | "poll" => Some(Action::TogglePoll),
        "q" | "quit" | "exit" => Some(Action::Quit),
        _ => None,
    }
}

/// Pop the head and send the decision in the background. The reply is
/// fire-and-forget: a failure is reported but the request stays popped.
fn decide(
    uplink: &Arc<Uplink>,
    backlog: &Arc<Backlog>,
    events: &broadcast::Sender<UplinkEvent>,
    approved: bool,
    comment: Option<String>,
) {
    let Some(req) = backlog.pop() else {
        println!("{}", "Nothing pending.".dimmed());
        return;
    };
    let decision = ApproveResponse::for_request(&req, approved, comment);
    let uplink = uplink.clone();
    let events = events.clone();
    tokio::spawn(async move {
        match uplink.reply(&decision).await {
            Ok(()) => {
                let verdict = if approved { "approved" } else { "rejected" };
                tracing::info!("Request {} {}", decision.id(), verdict);
            }
            Err(uplink::UplinkError::Api(api::ApiError::NotFound)) => {
                let _ = events.send(UplinkEvent::Error(
                    "Command no longer exists".to_string(),
                ));
            }
            Err(e) => {
                let _ = events.send(UplinkEvent::Error(format!("Failed to reply: {e}")));
            }
        }
        let _ = events.send(UplinkEvent::BacklogChanged);
    });
}

/// Print the oldest pending request, if it is not the one already on screen.
fn draw_head(backlog: &Backlog, shown: &mut Option<String>) {
    match backlog.head() {
        Some(req) => {
            if shown.as_deref() == Some(req.id()) {
                return;
            }
            *shown = Some(req.id().to_string());
            let pending = backlog.len();
            println!();
            let queued = if pending > 1 {
                format!("({} pending)", pending)
            } else {
                String::new()
            };
            println!(
                "{} {}",
                "Approval request".bold().underline(),
                queued.as_str().dimmed()
            );
            println!("{}", req.summary());
            println!("{}", "[y]es / [n]o <comment>?".green());
        }
        None => {
            if shown.is_some() {
                *shown = None;
                println!("{}", "Waiting for next approval…".dimmed());
            }
        }
    }
}
