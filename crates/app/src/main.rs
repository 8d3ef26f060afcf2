use std::io::Write;

use braid::session::{ChatSession, TurnStep};
use braid::settings::SettingsStore;
use braid_transcript::ConversationId;
use braid_wire::{AgentEvent, EventKind};

/// Application entry point.
///
/// With no arguments, lists the backend's known sessions. With arguments,
/// treats them as one user message, streams the multi-agent response into
/// the transcript, and prints it as it arrives. An optional leading
/// `--conversation <id>` continues an existing session, reconciling its
/// persisted history first. Ctrl-C cancels the in-flight stream.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let settings = SettingsStore::load().settings();
    let session = match ChatSession::new(&settings) {
        Ok(session) => session,
        Err(error) => {
            eprintln!("failed to start: {error}");
            std::process::exit(1);
        }
    };

    let mut args = std::env::args().skip(1).peekable();
    let conversation_id = match args.peek().map(String::as_str) {
        Some("--conversation") => {
            args.next();
            let Some(raw) = args.next() else {
                eprintln!("--conversation requires a session id");
                std::process::exit(2);
            };
            match raw.parse::<ConversationId>() {
                Ok(id) => Some(id),
                Err(error) => {
                    eprintln!("invalid session id '{raw}': {error}");
                    std::process::exit(2);
                }
            }
        }
        _ => None,
    };
    let message = args.collect::<Vec<_>>().join(" ");

    let exit_code = if message.is_empty() {
        list_sessions(&session, settings.session_page_size).await
    } else {
        run_turn(&session, conversation_id, &message).await
    };
    std::process::exit(exit_code);
}

async fn list_sessions(session: &ChatSession, page_size: u32) -> i32 {
    match session.list_remote_sessions(Some(page_size)).await {
        Ok(page) => {
            for summary in &page.sessions {
                let updated = summary.updated_at.as_deref().unwrap_or("-");
                println!("{}  (updated {updated})", summary.session_id);
            }
            println!("{} session(s)", page.total);
            0
        }
        Err(error) => {
            eprintln!("failed to list sessions: {error}");
            1
        }
    }
}

async fn run_turn(
    session: &ChatSession,
    conversation_id: Option<ConversationId>,
    message: &str,
) -> i32 {
    let conversation_id = match conversation_id {
        Some(id) => {
            if let Err(error) = session.open_conversation(id).await {
                eprintln!("failed to load history: {error}");
                return 1;
            }
            id
        }
        None => session.new_conversation().id,
    };

    let mut turn = match session.submit(conversation_id, message).await {
        Ok(turn) => turn,
        Err(error) => {
            eprintln!("failed to send message: {error}");
            return 1;
        }
    };

    loop {
        tokio::select! {
            step = turn.next() => match step {
                Ok(Some(TurnStep::Event { event, .. })) => print_event(&event),
                Ok(Some(TurnStep::Finished(status))) => {
                    println!();
                    tracing::info!(%conversation_id, ?status, "turn finished");
                    return 0;
                }
                Ok(None) => return 0,
                Err(error) => {
                    eprintln!("stream failed: {error}");
                    return 1;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                turn.cancel();
            }
        }
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::MessageChunk { text, .. } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::NodeStart { channel, .. } => {
            println!("\n[{}]", channel.name());
        }
        AgentEvent::ToolStart { tool_name, .. } => {
            println!("\n(tool: {tool_name})");
        }
        AgentEvent::Error { detail, .. } => {
            eprintln!("\nerror: {detail}");
        }
        event if event.kind() == EventKind::Final => {
            println!();
        }
        _ => {}
    }
}
