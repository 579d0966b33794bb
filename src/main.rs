//! ferry - ship code from a file or a terminal to a remote eval server.
//!
//! This is the command-line front-end: it owns argument parsing, logging
//! setup, and the presentation of session events. The protocol work lives
//! in the library.

mod repl;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::timeout;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferry::session::{check, PeerStatus, Session, SessionEvent};

/// Where a shipped piece of code came from, echoed back with its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub source: String,
    pub line: u32,
}

#[derive(Debug, Parser)]
#[command(name = "ferry")]
#[command(about = "Ship code to a remote eval server and print the replies", long_about = None)]
struct Cli {
    /// Address of the eval server.
    #[arg(long, default_value = "127.0.0.1:6666")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Evaluate a whole file and print the result.
    #[command(arg_required_else_help = true)]
    File { path: PathBuf },
    /// Interactive line-by-line evaluation.
    Repl,
    /// Probe whether the server is reachable and free.
    Check,
}

/// The check command owns its own answer deadline; the core does not.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ferry=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::File { path } => run_file(&cli.addr, &path).await,
        Commands::Repl => repl::run(&cli.addr).await,
        Commands::Check => run_check(&cli.addr).await,
    }
}

/// Ship one file and wait for its correlated reply.
async fn run_file(addr: &str, path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut session = Session::new(addr);
    session
        .start()
        .await
        .with_context(|| format!("failed to open session with {addr}"))?;

    let origin = Origin {
        source: path.display().to_string(),
        line: 1,
    };
    session.send_code(contents, Some(origin)).await?;

    let mut printer = Printer::new();
    while let Some(event) = session.next_event().await {
        let answered = matches!(
            event,
            SessionEvent::Result {
                context: Some(_),
                ..
            }
        );
        match &event {
            SessionEvent::PeerBusy => bail!("server at {addr} is busy with another session"),
            SessionEvent::Disconnected => {
                bail!("server closed the connection before replying")
            }
            _ => printer.render(&event),
        }
        if answered {
            break;
        }
    }

    session.disconnect();
    Ok(())
}

async fn run_check(addr: &str) -> Result<()> {
    match timeout(CHECK_TIMEOUT, check(addr)).await {
        Ok(Ok(PeerStatus::Available)) => {
            println!("server at {addr} is available");
            Ok(())
        }
        Ok(Ok(PeerStatus::Busy)) => {
            println!("server at {addr} is busy with another session");
            Ok(())
        }
        Ok(Err(e)) => Err(e).with_context(|| format!("check against {addr} failed")),
        Err(_) => bail!("no answer from {addr} within {CHECK_TIMEOUT:?}"),
    }
}

/// Presentation adapter: renders session events to the terminal.
///
/// Results are tagged with their origin, errors go to stderr. A short
/// result's inline echo would print the same text twice in a terminal, so
/// the notice immediately following its own result is suppressed.
pub struct Printer {
    last_result: Option<String>,
}

impl Printer {
    pub fn new() -> Self {
        Self { last_result: None }
    }

    pub fn render(&mut self, event: &SessionEvent<Origin>) {
        match event {
            SessionEvent::Result {
                contents,
                context,
                is_error,
            } => {
                self.last_result = Some(contents.clone());
                match (context, is_error) {
                    (Some(origin), true) => {
                        eprintln!("[{}:{}] error: {contents}", origin.source, origin.line)
                    }
                    (Some(origin), false) => {
                        println!("[{}:{}] {contents}", origin.source, origin.line)
                    }
                    (None, true) => eprintln!("error: {contents}"),
                    (None, false) => println!("{contents}"),
                }
            }
            SessionEvent::Notice { text, is_error } => {
                // the echo right after its own result would just repeat the line
                if self.last_result.take().as_deref() == Some(text.as_str()) {
                    return;
                }
                if *is_error {
                    eprintln!("! {text}");
                } else {
                    println!("{text}");
                }
            }
            SessionEvent::PeerReady => println!("server ready"),
            SessionEvent::PeerBusy => eprintln!("server is busy with another session"),
            SessionEvent::Disconnected => eprintln!("disconnected from server"),
        }
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}
