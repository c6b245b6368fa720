use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use chatsync_core::{
    Author, ChatFactory, ChatMembershipIndex, LifecycleScope, MessageStream, SyncConfig,
    SyncContext, SyncError, SyncEvent, SyncObserver, TracingObserver, UserDirectory,
};
use chatsync_store::SqliteStore;
use chatsync_types::api::{CreateChatRequest, RegisterRequest};
use chatsync_types::models::{UNKNOWN_SENDER, User};

const USAGE: &str = "usage:
  chatsync register <username> <password>
  chatsync create <requester> <name> <user,user,...>
  chatsync chats <username>
  chatsync send <username> <chat_id> <body...>
  chatsync history <chat_id> [pages]";

/// How long `send` waits for the chat summary before exiting.
const SUMMARY_WAIT: Duration = Duration::from_secs(2);

/// Logs like [`TracingObserver`] and hands summary outcomes to the command
/// that is waiting for them.
struct CliObserver {
    summaries: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncObserver for CliObserver {
    fn observe(&self, event: SyncEvent) {
        let summary = matches!(
            event,
            SyncEvent::SummaryUpdated { .. }
                | SyncEvent::SummarySuperseded { .. }
                | SyncEvent::SummaryUpdateFailed { .. }
        );
        if summary {
            let _ = self.summaries.send(event.clone());
        }
        TracingObserver.observe(event);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatsync=info,chatsync_core=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    // Config
    let config = SyncConfig::from_env()?;
    let store = SqliteStore::open(&config.db_path)?;
    info!("Using store at {}", config.db_path.display());

    let (summaries_tx, summaries_rx) = mpsc::unbounded_channel();
    let ctx = SyncContext::new(Arc::new(store), config)
        .with_observer(Arc::new(CliObserver { summaries: summaries_tx }));

    let outcome = match (command, &args[1..]) {
        ("register", [username, password]) => register(&ctx, username, password).await,
        ("create", [requester, name, members]) => create(&ctx, requester, name, members).await,
        ("chats", [username]) => chats(&ctx, username).await,
        ("send", [username, chat_id, body @ ..]) if !body.is_empty() => {
            send(&ctx, username, chat_id, &body.join(" "), summaries_rx).await
        }
        ("history", [chat_id]) => history(&ctx, chat_id, 1).await,
        ("history", [chat_id, pages]) => {
            let pages = pages
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("invalid page count '{}': {}", pages, e))?;
            history(&ctx, chat_id, pages.max(1)).await
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = outcome {
        eprintln!("error [{}]: {}", e.reason(), e);
        std::process::exit(1);
    }

    Ok(())
}

async fn lookup(ctx: &SyncContext, username: &str) -> Result<User, SyncError> {
    UserDirectory::new(ctx)
        .find_by_username(username)
        .await?
        .ok_or_else(|| SyncError::NotFound(username.to_string()))
}

async fn register(ctx: &SyncContext, username: &str, password: &str) -> Result<(), SyncError> {
    let user = UserDirectory::new(ctx)
        .register(RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await?;
    println!("{}\t{}", user.id, user.username);
    Ok(())
}

async fn create(
    ctx: &SyncContext,
    requester: &str,
    name: &str,
    members: &str,
) -> Result<(), SyncError> {
    let requester = lookup(ctx, requester).await?;
    let chat_id = ChatFactory::new(ctx)
        .create(CreateChatRequest {
            name: name.to_string(),
            participant_usernames: members.split(',').map(str::to_string).collect(),
            requester_id: requester.id,
            requester_username: requester.username,
        })
        .await?;
    println!("{}", chat_id);
    Ok(())
}

async fn chats(ctx: &SyncContext, username: &str) -> Result<(), SyncError> {
    let user = lookup(ctx, username).await?;
    let scope = LifecycleScope::new("cli:chats");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = ChatMembershipIndex::new(ctx)
        .subscribe(&user.id, move |result| {
            let _ = tx.send(result);
        })
        .await?;
    scope.attach(subscription);

    let first = rx.recv().await.ok_or(SyncError::Closed)?;
    scope.teardown();

    for chat in first? {
        let last = chat.last_message.as_deref().unwrap_or("-");
        println!("{}\t{}\t{}", chat.id, chat.name, last);
    }
    Ok(())
}

async fn send(
    ctx: &SyncContext,
    username: &str,
    chat_id: &str,
    body: &str,
    mut summaries: mpsc::UnboundedReceiver<SyncEvent>,
) -> Result<(), SyncError> {
    let user = lookup(ctx, username).await?;
    let stream = MessageStream::open(
        ctx,
        chat_id,
        Author {
            id: user.id,
            username: user.username,
        },
    )
    .await?;

    match stream.send(body).await? {
        Some(message_id) => {
            println!("{}", message_id);
            // The summary update runs in the background; give it a chance
            // to land before the runtime shuts down.
            let _ = tokio::time::timeout(SUMMARY_WAIT, summaries.recv()).await;
        }
        None => println!("nothing to send"),
    }
    stream.close();
    Ok(())
}

async fn history(ctx: &SyncContext, chat_id: &str, pages: usize) -> Result<(), SyncError> {
    let reader = Author {
        id: "cli-reader".to_string(),
        username: UNKNOWN_SENDER.to_string(),
    };
    let stream = MessageStream::open(ctx, chat_id, reader).await?;
    let scope = LifecycleScope::new("cli:history");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = stream
        .subscribe(move |result| {
            let _ = tx.send(result);
        })
        .await?;
    scope.attach(subscription);

    rx.recv().await.ok_or(SyncError::Closed)??;
    for _ in 1..pages {
        if !stream.load_older().await?.more {
            break;
        }
    }

    for message in stream.window() {
        println!(
            "{}\t{}\t{}\t{}",
            message.created_at, message.id, message.sender_username, message.body
        );
    }

    scope.teardown();
    stream.close();
    Ok(())
}
