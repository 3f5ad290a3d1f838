use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    conversation_id::{
        canonicalize, decode_from_transport, encode_for_transport, extract_participants,
    },
    domain::TabId,
    protocol::{PushEventName, PushFrame},
};
use sync_core::{
    load_settings, transport::ws_url_from_server, HttpConversationApi, LocalTabHub,
    LoopbackTransport, MissingConversationApi, SyncClient, WsPushTransport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Conversation-id tooling.
    Id {
        #[command(subcommand)]
        action: IdAction,
    },
    /// Replays recorded push frames, one `{"event", "data"}` object per line.
    Replay { file: PathBuf },
    /// Logs bus events from a live session until Ctrl-C.
    Watch {
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum IdAction {
    Canonicalize { value: String },
    Encode { value: String },
    Decode { value: String },
    Participants { value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    match cli.command {
        Command::Id { action } => run_id(action)?,
        Command::Replay { file } => replay(file).await?,
        Command::Watch { token } => watch(token).await?,
    }

    Ok(())
}

fn run_id(action: IdAction) -> Result<()> {
    match action {
        IdAction::Canonicalize { value } => println!("{}", canonicalize(&value)?),
        IdAction::Encode { value } => println!("{}", encode_for_transport(&canonicalize(&value)?)),
        IdAction::Decode { value } => println!("{}", decode_from_transport(&value)?),
        IdAction::Participants { value } => {
            let (first, second) = extract_participants(&value)?;
            println!("{first}\n{second}");
        }
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    frames: usize,
    applied: usize,
    rejected: usize,
    skipped: usize,
}

async fn replay(file: PathBuf) -> Result<()> {
    let raw = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let settings = load_settings();
    let hub = LocalTabHub::new(settings.channel_origin.clone());
    let client = SyncClient::new(
        settings,
        LoopbackTransport::new(false),
        Arc::new(MissingConversationApi),
        Arc::new(hub.clone()),
    );

    info!(origin = hub.origin(), "console: replaying offline");
    let summary = replay_frames(&client, &raw).await;

    println!(
        "frames={} applied={} rejected={} skipped={}",
        summary.frames, summary.applied, summary.rejected, summary.skipped
    );
    client
        .read(|store| {
            for conversation in store.conversations_by_recency() {
                println!(
                    "{} name={:?} messages={} unread={}",
                    conversation.id,
                    conversation.customer_name,
                    store.messages(&conversation.id).len(),
                    store.compute_unread_count(&conversation.id)
                );
            }
        })
        .await;
    Ok(())
}

async fn replay_frames(client: &SyncClient, raw: &str) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        summary.frames += 1;
        let frame: PushFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(line = line_number + 1, error = %err, "console: skipping malformed frame");
                summary.skipped += 1;
                continue;
            }
        };
        let Ok(event) = frame.event.parse::<PushEventName>() else {
            warn!(line = line_number + 1, event = %frame.event, "console: skipping unknown event");
            summary.skipped += 1;
            continue;
        };
        match client.handle_push(event, frame.data).await {
            Some(_) => summary.applied += 1,
            None => summary.rejected += 1,
        }
    }
    summary
}

async fn watch(token: Option<String>) -> Result<()> {
    let settings = load_settings();
    let tab_id = TabId::generate();
    let url = ws_url_from_server(&settings.server_url, tab_id.as_str())?;

    let transport = WsPushTransport::new(url, settings.reconnect_delay());
    transport
        .connect()
        .await
        .context("failed to connect push transport")?;

    let mut api = HttpConversationApi::new(settings.api_url());
    if let Some(token) = token {
        api = api.with_bearer_token(token);
    }
    let hub = LocalTabHub::new(settings.channel_origin.clone());
    info!(origin = hub.origin(), "console: tab channel ready");
    let client = SyncClient::with_tab_id(
        settings,
        tab_id,
        transport.clone(),
        Arc::new(api),
        Arc::new(hub),
    );
    let mut events = client.subscribe_events();

    let registration = client.attach().await?;
    info!(?registration, tab_id = %client.tab_id(), "console: watching");
    if let Err(err) = client.load_conversations().await {
        warn!(error = %err, "console: initial load failed");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => info!(?event, "console: event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console: events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.close().await;
    transport.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ConversationId;
    use sync_core::SyncSettings;

    const CONVERSATION: &str = "conv_+5214773790184_+5214793176502";

    fn offline_client() -> Arc<SyncClient> {
        let settings = SyncSettings {
            business_phone: Some("+5214793176502".into()),
            ..SyncSettings::default()
        };
        SyncClient::new(
            settings,
            LoopbackTransport::new(false),
            Arc::new(MissingConversationApi),
            Arc::new(LocalTabHub::new("local")),
        )
    }

    #[tokio::test]
    async fn replay_counts_each_kind_of_frame() {
        let client = offline_client();
        let raw = [
            r#"{"event":"new-message","data":{"conversationId":"conv_+5214773790184_+5214793176502","messageId":"wamid-1","content":"hola","senderId":"+5214773790184","timestamp":"2024-05-01T10:00:00Z"}}"#,
            "",
            r#"{"event":"new-message","data":{"conversationId":"conv_bad","messageId":"wamid-2"}}"#,
            "{not json",
            r#"{"event":"typing","data":{}}"#,
            r#"{"event":"new-message","data":{"conversationId":"conv_+5214773790184_+5214793176502","messageId":"wamid-1","content":"hola","senderId":"+5214773790184","timestamp":"2024-05-01T10:00:00Z"}}"#,
        ]
        .join("\n");

        let summary = replay_frames(&client, &raw).await;
        assert_eq!(
            summary,
            ReplaySummary {
                frames: 5,
                applied: 2,
                rejected: 1,
                skipped: 2,
            }
        );

        let conversation_id: ConversationId = CONVERSATION.parse().expect("id");
        client
            .read(|store| {
                assert_eq!(store.messages(&conversation_id).len(), 1);
                assert_eq!(store.compute_unread_count(&conversation_id), 1);
            })
            .await;
    }
}
