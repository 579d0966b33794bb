//! Interactive read-eval loop against the remote server.
//!
//! Line editing is blocking, so rustyline runs on its own thread and feeds
//! lines over a channel; the async side multiplexes user input with session
//! events, printing replies as they arrive.

use anyhow::Result;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info};

use crate::{Origin, Printer};
use ferry::session::{Session, SessionEvent};

/// One step of the multiplexed loop.
enum Step {
    Line(Option<String>),
    Event(Option<SessionEvent<Origin>>),
}

pub async fn run(addr: &str) -> Result<()> {
    let mut session: Session<Origin> = Session::new(addr);
    session.start_with_retry(3).await?;
    info!("session open, type 'exit' to leave");

    let (line_tx, mut lines) = mpsc::unbounded_channel();
    std::thread::spawn(move || read_lines(line_tx));

    let mut printer = Printer::new();
    let mut line_no = 0u32;

    loop {
        let step = tokio::select! {
            line = lines.recv() => Step::Line(line),
            event = session.next_event() => Step::Event(event),
        };

        match step {
            Step::Line(None) => break,
            Step::Line(Some(line)) => {
                line_no += 1;
                debug!(line_no, "shipping line");
                let origin = Origin {
                    source: "repl".to_string(),
                    line: line_no,
                };
                if let Err(e) = session.send_code(line, Some(origin)).await {
                    eprintln!("send failed: {e}");
                    if !session.is_connected() {
                        break;
                    }
                }
            }
            Step::Event(None) => break,
            Step::Event(Some(event)) => {
                let done = matches!(
                    event,
                    SessionEvent::PeerBusy | SessionEvent::Disconnected
                );
                printer.render(&event);
                if done {
                    break;
                }
            }
        }
    }

    // Flush failure events for anything still pending at teardown.
    session.disconnect();
    while let Some(event) = session.take_event() {
        printer.render(&event);
    }
    Ok(())
}

/// Blocking rustyline loop on a dedicated thread.
fn read_lines(lines: UnboundedSender<String>) {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("failed to initialize line editor: {e}");
            return;
        }
    };

    loop {
        match editor.readline(">> ") {
            Ok(line) => {
                if line.as_str() == "exit" {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                if lines.send(line).is_err() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("input error: {e}");
                break;
            }
        }
    }
}
