//! Interactive dispatch conversation: the display collaborator.
//!
//! Renders the ordered timeline, reads driver input from stdin, and feeds
//! text back into the session core. All ordering and connection logic lives in
//! `lib`; this module only displays state and forwards commands.

use async_trait::async_trait;
use chrono::Local;
use lib::host::{NoticeKind, Notifier};
use lib::identity::LaunchContextSource;
use lib::session::{SendError, Session, SessionDeps};
use lib::supervisor::SupervisorEvent;
use lib::timeline::{Message, Sender, Timeline};
use lib::transport::WsTransportFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::templates;

/// Notifier for a terminal host: notices go to stderr, and "close the app" is
/// a notice too since a terminal has no shell to close.
struct TerminalNotifier;

#[async_trait]
impl Notifier for TerminalNotifier {
    async fn notify(&self, kind: NoticeKind, message: &str) {
        let tag = match kind {
            NoticeKind::Info => "notice",
            NoticeKind::Warning => "warning",
            NoticeKind::Error => "error",
        };
        eprintln!("[{}] {}", tag, message);
    }

    async fn close_app(&self) {
        eprintln!("[notice] dispatch asked to close the app");
    }
}

/// Launch context for the session: synthetic from --user-id, otherwise the
/// CABLINE_LAUNCH_CONTEXT payload from the host shell.
fn launch_context(user_id: Option<i64>, username: Option<String>) -> LaunchContextSource {
    match user_id {
        Some(id) => {
            let user = match username {
                Some(name) => serde_json::json!({ "id": id, "username": name }),
                None => serde_json::json!({ "id": id }),
            };
            LaunchContextSource::new(Some(serde_json::json!({ "user": user }).to_string()))
        }
        None => LaunchContextSource::from_env(),
    }
}

fn format_time(message: &Message) -> String {
    message
        .timestamp
        .with_timezone(&Local)
        .format("%I:%M:%S %p")
        .to_string()
}

fn render_message(message: &Message) -> String {
    let who = match message.sender {
        Sender::Driver => "you",
        Sender::Dispatcher => "dispatch",
    };
    format!("[{}] {}: {}", format_time(message), who, message.text)
}

fn print_timeline(timeline: &Timeline) {
    if timeline.is_empty() {
        println!("No communication yet. Send a request to start.");
        return;
    }
    for message in timeline.messages() {
        println!("{}", render_message(message));
    }
}

pub async fn run_chat(
    config_path: Option<PathBuf>,
    user_id: Option<i64>,
    username: Option<String>,
) -> anyhow::Result<()> {
    let (config, _path) = lib::config::load_config(config_path)?;
    let deps = SessionDeps {
        config,
        identity: Arc::new(launch_context(user_id, username)),
        transports: Arc::new(WsTransportFactory),
        notifier: Arc::new(TerminalNotifier),
    };

    let mut session = Session::new(deps)?;
    println!(
        "Loading conversation for {}...",
        session.user().display_name()
    );
    session.start().await?;
    for warning in session.degraded() {
        eprintln!("[warning] {}", warning);
    }

    print_timeline(&session.snapshot().await);
    println!("Type a message and press Enter. Commands: /templates, /t <id> [duration], /retry, /quit");

    let mut events = session.take_events().expect("event stream already taken");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SupervisorEvent::Online => println!("* online"),
                    SupervisorEvent::Offline => println!("* offline"),
                    SupervisorEvent::ReplyPushed(message) => println!("{}", render_message(&message)),
                    SupervisorEvent::SendAcked { success: false, error } => {
                        eprintln!(
                            "[warning] dispatch did not accept the message: {}",
                            error.unwrap_or_else(|| "no reason given".to_string())
                        );
                    }
                    SupervisorEvent::SendAcked { .. } => {}
                    SupervisorEvent::Failed(reason) => {
                        eprintln!("[error] connection failed: {} (use /retry)", reason);
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("/quit") || input.eq_ignore_ascii_case("/exit") {
                    break;
                }
                if input.eq_ignore_ascii_case("/retry") {
                    if let Err(e) = session.retry().await {
                        eprintln!("[error] {}", e);
                        break;
                    }
                    for warning in session.degraded() {
                        eprintln!("[warning] {}", warning);
                    }
                    print_timeline(&session.snapshot().await);
                    continue;
                }
                if input.eq_ignore_ascii_case("/templates") {
                    for t in templates::TEMPLATES {
                        let time_hint = if t.needs_time { " <duration>" } else { "" };
                        println!("  /t {}{} : {} ({})", t.id, time_hint, t.text, t.description);
                    }
                    println!("  durations: {}", templates::time_options().join(", "));
                    continue;
                }
                let outgoing = if let Some(rest) = input.strip_prefix("/t ") {
                    let mut parts = rest.split_whitespace();
                    let id = parts.next().unwrap_or_default();
                    let time = parts.next();
                    let Some(template) = templates::find(id) else {
                        eprintln!("[warning] unknown template {:?}; see /templates", id);
                        continue;
                    };
                    match templates::render(template, time) {
                        Ok(text) => text,
                        Err(e) => {
                            eprintln!("[warning] {}", e);
                            continue;
                        }
                    }
                } else if input.starts_with('/') {
                    eprintln!("[warning] unknown command {:?}", input);
                    continue;
                } else {
                    input.to_string()
                };
                match session.send_message(&outgoing).await {
                    Ok(message) => println!("{}", render_message(&message)),
                    Err(SendError::Empty) => eprintln!("[warning] message is empty"),
                    Err(SendError::Offline) => {
                        eprintln!("[warning] offline, message not sent (use /retry if the connection failed)");
                    }
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
