/// ChatSync - inspect the local store or run the engine against an
/// in-process feed
use chatsync_core::directory::StaticDirectory;
use chatsync_core::feed::MemoryFeed;
use chatsync_core::store::LocalStore;
use chatsync_core::{ChatSync, Config, ConnectionState, FeedEvent, Message};
use futures_util::StreamExt;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: chatsync [--data-dir <path>] [--user <id>] [--preview-chars <n>] [--no-flush] <list | show <conversation> | demo>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    match rest.first().map(String::as_str) {
        Some("list") => list(&config),
        Some("show") => {
            let conversation_id = rest
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("show requires a conversation id\n{}", USAGE))?;
            show(&config, conversation_id)
        }
        Some("demo") => demo(&config).await,
        _ => Err(anyhow::anyhow!(USAGE)),
    }
}

fn list(config: &Config) -> anyhow::Result<()> {
    let store = LocalStore::open(config)?;
    let summaries = store.summaries_by_recency()?;
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn show(config: &Config, conversation_id: &str) -> anyhow::Result<()> {
    let store = LocalStore::open(config)?;
    let out = serde_json::json!({
        "summary": store.summary(conversation_id)?,
        "messages": store.messages(conversation_id)?,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn demo(config: &Config) -> anyhow::Result<()> {
    const CONVERSATION: &str = "demo";

    let feed = Arc::new(MemoryFeed::new());
    let directory = Arc::new(StaticDirectory::new().with(CONVERSATION, "Alice"));
    let engine = ChatSync::new(config, feed.clone(), directory)?;
    info!("🚀 Starting ChatSync demo");
    info!("   Data dir: {:?}", config.data_dir);
    info!("   Local user: {}", config.local_user_id);

    engine.attach_liveness(feed.liveness());
    engine.open_conversation(CONVERSATION).await;
    let mut views = engine.observe_conversation(CONVERSATION);

    feed.inject(
        CONVERSATION,
        FeedEvent::added(Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: CONVERSATION.to_string(),
            text: "hi there".to_string(),
            sender_id: "alice".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }),
    );

    let mut connection = engine.connection();
    while connection.current() != ConnectionState::Connected {
        if connection.changed().await.is_none() {
            anyhow::bail!("connection monitor stopped");
        }
    }
    engine
        .send(CONVERSATION, "hello Alice")
        .await
        .map_err(|e| anyhow::anyhow!("send failed: {}", e))?;

    let wait = async {
        while let Some(view) = views.next().await {
            println!("{}", serde_json::to_string_pretty(&view)?);
            if view.messages.iter().any(|m| m.sender_id == config.local_user_id) {
                break;
            }
        }
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for the sent message"))??;

    engine.mark_read(CONVERSATION).await?;
    println!("{}", serde_json::to_string_pretty(&engine.conversation_list()?)?);

    engine.shutdown().await;
    Ok(())
}
