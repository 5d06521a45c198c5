use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use aiaio_client::cli::{resolve_config, Args, Command};
use aiaio_client::model::{Attachment, Role};
use aiaio_client::session::StreamHandle;
use aiaio_client::{ApiClient, ClientConfig, LiveEvent, LiveUpdate, SessionContext, StreamOutcome};
use clap::Parser;
use colored::*;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// How long to wait after a reply for its id to arrive over the live channel.
const ID_GRACE: Duration = Duration::from_secs(2);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aiaio_client=info")),
        )
        .init();
}

// ---------------------------------------------------------------------------
// Streaming output
// ---------------------------------------------------------------------------

fn print_delta(session: &SessionContext, conversation_id: &str, printed: usize) -> usize {
    let buffer = session.with_state(|s| s.stream(conversation_id).map(|st| st.buffer().to_string()));
    let Some(buffer) = buffer else {
        return printed;
    };
    if buffer.len() > printed {
        print!("{}", &buffer[printed..]);
        let _ = io::stdout().flush();
    }
    buffer.len()
}

fn durable_id(session: &SessionContext, conversation_id: &str) -> Option<String> {
    session.with_state(|s| {
        s.stream(conversation_id)
            .and_then(|st| st.durable_id().map(str::to_string))
    })
}

/// Print a stream as it arrives. Ctrl-C cancels it locally and on the server.
async fn follow(session: &SessionContext, handle: StreamHandle) -> AppResult<()> {
    let conversation_id = handle.conversation_id().to_string();
    let mut changes = WatchStream::new(session.changes());
    let finished = handle.finished();
    tokio::pin!(finished);

    let mut printed = 0;
    let outcome = loop {
        tokio::select! {
            outcome = &mut finished => break outcome,
            Some(_) = changes.next() => {
                printed = print_delta(session, &conversation_id, printed);
            }
            _ = tokio::signal::ctrl_c() => {
                let out = session.cancel(&conversation_id);
                let how = if out.remote_signal_sent { "server asked to stop" } else { "local only" };
                eprintln!("\n{} {}", "[stopped]".bright_yellow(), how.dimmed());
            }
        }
    };
    print_delta(session, &conversation_id, printed);
    println!();

    match outcome {
        StreamOutcome::Completed => {
            let id = tokio::time::timeout(ID_GRACE, async {
                loop {
                    if let Some(id) = durable_id(session, &conversation_id) {
                        return id;
                    }
                    if changes.next().await.is_none() {
                        return String::new();
                    }
                }
            })
            .await
            .unwrap_or_default();
            eprintln!(
                "{} {}{}",
                "conversation".dimmed(),
                conversation_id.bright_white(),
                if id.is_empty() {
                    String::new()
                } else {
                    format!(" {} {}", "message".dimmed(), id.bright_white())
                }
            );
            Ok(())
        }
        StreamOutcome::Cancelled => Ok(()),
        StreamOutcome::Failed { .. } => {
            let notes = session.notifications();
            let detail = notes
                .last()
                .map(|n| n.message.clone())
                .unwrap_or_else(|| "Generation failed".to_string());
            eprintln!("{}", detail.bright_red());
            Err(detail.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_chat(
    config: ClientConfig,
    prompt: String,
    conversation: Option<String>,
    paths: Vec<PathBuf>,
    system: Option<String>,
) -> AppResult<()> {
    let mut attachments = Vec::with_capacity(paths.len());
    for path in &paths {
        attachments.push(Attachment::from_path(path).await?);
    }
    let session = SessionContext::new(config);
    session.start();
    if let Some(id) = &conversation {
        session.open_conversation(id).await?;
    }
    let handle = session.submit(&prompt, attachments, system).await?;
    let result = follow(&session, handle).await;
    session.shutdown();
    result
}

async fn run_regenerate(
    config: ClientConfig,
    conversation: String,
    message: String,
    system: Option<String>,
) -> AppResult<()> {
    let session = SessionContext::new(config);
    session.start();
    session.open_conversation(&conversation).await?;
    let handle = session.regenerate(&message, system).await?;
    let result = follow(&session, handle).await;
    session.shutdown();
    result
}

async fn run_watch(config: ClientConfig) -> AppResult<()> {
    let session = SessionContext::new(config);
    let mut updates = session.subscribe();
    session.start();
    eprintln!("{}", "watching live updates, Ctrl-C to quit".dimmed());
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => print_update(&update),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.shutdown();
    Ok(())
}

fn print_update(update: &LiveUpdate) {
    match update {
        LiveUpdate::Connected { reconnect } => {
            let label = if *reconnect { "reconnected" } else { "connected" };
            println!("{}", label.bright_green());
        }
        LiveUpdate::Disconnected => println!("{}", "disconnected, retrying".bright_yellow()),
        LiveUpdate::Event(event) => {
            let kind = event.kind().bright_cyan();
            match event {
                LiveEvent::MessageAdded { message_id, .. } => println!(
                    "{kind} {} {}",
                    event.conversation_id().unwrap_or_default(),
                    message_id.as_deref().unwrap_or("-")
                ),
                LiveEvent::MessageEdited { message_id, .. } => println!("{kind} {message_id}"),
                LiveEvent::SummaryUpdated { summary, .. } => println!(
                    "{kind} {} {}",
                    event.conversation_id().unwrap_or_default(),
                    summary.bright_white()
                ),
                _ => println!("{kind} {}", event.conversation_id().unwrap_or_default()),
            }
        }
    }
}

async fn run_list(api: &ApiClient, project: Option<String>) -> AppResult<()> {
    let conversations = api.list_conversations(project.as_deref()).await?;
    if conversations.is_empty() {
        println!("{}", "no conversations".dimmed());
    }
    for c in conversations {
        println!(
            "{}  {}  {}",
            c.conversation_id.bright_white(),
            c.summary.as_deref().unwrap_or("(untitled)"),
            c.message_count
                .map(|n| format!("{n} messages"))
                .unwrap_or_default()
                .dimmed()
        );
    }
    Ok(())
}

async fn run_show(api: &ApiClient, conversation: &str) -> AppResult<()> {
    for m in api.fetch_conversation(conversation).await? {
        let role = match m.role {
            Role::User => "user".bright_yellow().bold(),
            Role::Assistant => "assistant".bright_cyan().bold(),
            Role::System => continue,
        };
        println!("{} {}", role, m.message_id.dimmed());
        println!("{}", m.content);
        for a in &m.attachments {
            println!("  {} {}", "attachment".dimmed(), a.file_name);
        }
        println!();
    }
    Ok(())
}

async fn run_prompts(api: &ApiClient) -> AppResult<()> {
    for p in api.list_prompts().await? {
        let marker = if p.is_active { "*".bright_green() } else { " ".normal() };
        println!("{} {:>3}  {}", marker, p.id, p.name.bright_white());
    }
    Ok(())
}

async fn run_providers(api: &ApiClient) -> AppResult<()> {
    for p in api.list_providers().await? {
        let marker = if p.is_default { "*".bright_green() } else { " ".normal() };
        println!("{} {:>3}  {}  {}", marker, p.id, p.name.bright_white(), p.host.dimmed());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = Args::parse();
    init_tracing();
    if args.no_color {
        colored::control::set_override(false);
    }
    let config = resolve_config(&args, |key| std::env::var(key).ok())?;
    let api = ApiClient::new(config.clone());

    match args.command {
        Command::Chat {
            prompt,
            conversation,
            attachments,
            system,
        } => run_chat(config, prompt, conversation, attachments, system).await,
        Command::Regenerate {
            conversation,
            message,
            system,
        } => run_regenerate(config, conversation, message, system).await,
        Command::List { project } => run_list(&api, project).await,
        Command::Show { conversation } => run_show(&api, &conversation).await,
        Command::Delete { conversation } => {
            api.delete_conversation(&conversation).await?;
            println!("{} {}", "deleted".bright_green(), conversation);
            Ok(())
        }
        Command::Rename { conversation, title } => {
            api.rename_conversation(&conversation, &title).await?;
            println!("{} {}", "renamed".bright_green(), conversation);
            Ok(())
        }
        Command::Edit { message, content } => {
            api.edit_message(&message, &content).await?;
            println!("{} {}", "edited".bright_green(), message);
            Ok(())
        }
        Command::Watch => run_watch(config).await,
        Command::Prompts => run_prompts(&api).await,
        Command::Providers => run_providers(&api).await,
        Command::Version => {
            println!("{}", api.version().await?);
            Ok(())
        }
    }
}
