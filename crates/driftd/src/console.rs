//! Line-oriented terminal front-end.
//!
//! Reads commands from stdin, prints prompts and notifications from the
//! in-memory gateway, and answers prompts by id.

use std::path::PathBuf;
use std::sync::Arc;

use drift_core::message::{format_size, Answer};
use drift_services::{MemoryGateway, PeerRegistry, Prompt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HELP: &str = "\
commands:
  peers                       list discovered peers
  send <peer> <path>...       offer files (quote names with spaces)
  accept <id>                 accept an incoming offer
  decline <id>                decline an incoming offer
  quit                        shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Send { to: String, paths: Vec<PathBuf> },
    Answer { id: u64, answer: Answer },
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let words = split_words(line)?;
        let Some((verb, args)) = words.split_first() else {
            return Ok(None);
        };
        let command = match (verb.as_str(), args) {
            ("peers", []) => Command::Peers,
            ("send", [to, paths @ ..]) if !paths.is_empty() => Command::Send {
                to: to.clone(),
                paths: paths.iter().map(PathBuf::from).collect(),
            },
            ("send", _) => return Err("usage: send <peer> <path>...".into()),
            ("accept" | "decline", [id]) => Command::Answer {
                id: id.parse().map_err(|_| format!("not a prompt id: {id}"))?,
                answer: if verb == "accept" {
                    Answer::Accept
                } else {
                    Answer::Decline
                },
            },
            ("accept" | "decline", _) => return Err(format!("usage: {verb} <id>")),
            ("help" | "?", _) => Command::Help,
            ("quit" | "exit", _) => Command::Quit,
            _ => return Err(format!("unknown command: {verb} (try help)")),
        };
        Ok(Some(command))
    }
}

/// Whitespace-separated words; double quotes group a word with spaces.
fn split_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        return Err("unterminated quote".into());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

pub fn render_prompt(prompt: &Prompt) -> String {
    match prompt {
        Prompt::Single { id, question } => format!("[{id}] {question}  (accept {id} / decline {id})"),
        Prompt::Batch { id, peer, files } => {
            let total = files.iter().fold(0u64, |acc, f| acc.saturating_add(f.size));
            let mut text = format!(
                "[{id}] {peer} wants to send {} files ({}):",
                files.len(),
                format_size(total)
            );
            for file in files {
                text.push_str(&format!("\n      {file}"));
            }
            text.push_str(&format!("\n    (accept {id} / decline {id})"));
            text
        }
    }
}

/// Lines from stdin, read on a plain thread so a pending read never holds
/// up runtime shutdown.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub struct Console {
    gateway: Arc<MemoryGateway>,
    registry: PeerRegistry,
    prompts: mpsc::Receiver<Prompt>,
    notifications: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl Console {
    pub fn new(
        gateway: Arc<MemoryGateway>,
        registry: PeerRegistry,
        prompts: mpsc::Receiver<Prompt>,
        notifications: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            registry,
            prompts,
            notifications,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut lines = stdin_lines();
        let mut stdin_open = true;
        println!("{HELP}");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(prompt) = self.prompts.recv() => println!("{}", render_prompt(&prompt)),

                Some(note) = self.notifications.recv() => println!("* {note}"),

                line = lines.recv(), if stdin_open => match line {
                    Some(line) => self.execute(&line).await,
                    None => {
                        tracing::debug!("stdin closed, console keeps printing");
                        stdin_open = false;
                    }
                },
            }
        }
    }

    async fn execute(&self, line: &str) {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                println!("{e}");
                return;
            }
        };

        match command {
            Command::Peers => {
                let peers = self.registry.all();
                if peers.is_empty() {
                    println!("no peers yet");
                }
                for peer in peers {
                    let addr = peer
                        .first_address()
                        .map_or_else(|| "-".to_string(), |a| a.to_string());
                    let os = peer.record(drift_services::peer::TXT_OS).unwrap_or("?");
                    println!("  \"{}\"  {}  {addr}  {os}", peer.instance, peer.display_name());
                }
            }
            Command::Send { to, paths } => {
                if !self.gateway.request(to, paths).await {
                    println!("transfers are shutting down");
                }
            }
            Command::Answer { id, answer } => {
                if !self.gateway.answer(id, answer) {
                    println!("no open prompt {id}");
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => self.cancel.cancel(),
        }
    }
}
