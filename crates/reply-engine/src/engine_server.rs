//! Line-oriented engine runner
//!
//! Inbound messages arrive as newline-delimited JSON; replies, hand-offs and
//! command results are written back as JSON lines. The generation backend is
//! the only network dependency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backend::HttpGenerationBackend,
    config::Config,
    engagement::{EngagementHandoff, InMemoryKeyValueStore, KeyValueStore, SqliteKeyValueStore},
    memory::{InMemoryMessageHistory, Message, MessageExcerpt, MessageHistory},
    memory_db::SqliteMessageHistory,
    orchestrator::{Collaborators, RelationshipBuilder, ReplySender, ThinkingSessionInfo},
    shared_state::EngineState,
};

/// One inbound line: a command or a message.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Command(CommandLine),
    Message(InboundRecord),
}

#[derive(Debug, Deserialize)]
struct CommandLine {
    command: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct InboundRecord {
    id: String,
    conversation_id: String,
    sender_id: String,
    text: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    interest_score: f64,
    #[serde(default)]
    mentions_agent: bool,
    #[serde(default)]
    is_vip: bool,
}

impl From<InboundRecord> for Message {
    fn from(record: InboundRecord) -> Self {
        Message::new(
            record.id,
            record.conversation_id,
            record.sender_id,
            record.text,
            record.timestamp.unwrap_or_else(Utc::now),
        )
        .with_interest(record.interest_score)
        .with_mention(record.mentions_agent)
        .with_vip(record.is_vip)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputLine<'a> {
    Reply {
        conversation_id: &'a str,
        thinking_id: &'a str,
        reply_to: &'a str,
        segments: &'a [String],
    },
    Handoff {
        conversation_id: &'a str,
        user_id: &'a str,
        total_messages: usize,
        excerpts: &'a [MessageExcerpt],
    },
    Status {
        conversation_id: &'a str,
        state: String,
        amplifier: f64,
        open_placeholders: usize,
        cache: serde_json::Value,
        recent_replies: serde_json::Value,
    },
    Metrics {
        text: String,
    },
    Error {
        message: String,
    },
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Writes engine events as JSON lines to a shared output.
#[derive(Clone)]
pub struct JsonLineWriter {
    out: SharedWriter,
}

impl JsonLineWriter {
    pub fn new<W>(out: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self { out: Arc::new(Mutex::new(Box::new(out))) }
    }

    async fn emit(&self, line: &OutputLine<'_>) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&bytes).await?;
        out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ReplySender for JsonLineWriter {
    async fn send_segments(&self, session: &ThinkingSessionInfo, segments: &[String]) -> anyhow::Result<()> {
        self.emit(&OutputLine::Reply {
            conversation_id: &session.conversation_id,
            thinking_id: &session.thinking_id,
            reply_to: &session.anchor_message_id,
            segments,
        })
        .await
    }
}

/// Relationship builder that only publishes the hand-off.
pub struct LoggingRelationshipBuilder {
    writer: JsonLineWriter,
}

impl LoggingRelationshipBuilder {
    pub fn new(writer: JsonLineWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl RelationshipBuilder for LoggingRelationshipBuilder {
    async fn build_relationship(&self, handoff: &EngagementHandoff) -> anyhow::Result<()> {
        info!(
            "[{}] hand-off for {}: {} messages, {} excerpts",
            handoff.conversation_id,
            handoff.user_id,
            handoff.total_messages,
            handoff.excerpts.len()
        );
        self.writer
            .emit(&OutputLine::Handoff {
                conversation_id: &handoff.conversation_id,
                user_id: &handoff.user_id,
                total_messages: handoff.total_messages,
                excerpts: &handoff.excerpts,
            })
            .await
    }
}

/// Engagement checkpoints and the message history they count against live in
/// the same database, or both in memory.
fn open_storage(cfg: &Config) -> (Arc<dyn KeyValueStore>, Arc<dyn MessageHistory>) {
    let db_path = cfg.engagement_db_path();
    let opened = SqliteKeyValueStore::new(&db_path).and_then(|store| {
        let history = SqliteMessageHistory::new(store.pool())?;
        Ok((store, history))
    });
    match opened {
        Ok((store, history)) => {
            info!("Engagement store initialized at: {}", db_path.display());
            (Arc::new(store), Arc::new(history))
        }
        Err(e) => {
            warn!("Failed to initialize engagement store: {}. Falling back to in-memory.", e);
            (Arc::new(InMemoryKeyValueStore::new()), Arc::new(InMemoryMessageHistory::new()))
        }
    }
}

/// Run the engine on stdin/stdout until stdin closes.
pub async fn run_engine(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    if let Err(e) = crate::metrics::init_metrics() {
        warn!("Metrics registration failed: {}", e);
    }
    cfg.print_config();

    let (store, history) = open_storage(&cfg);
    let reader = BufReader::new(tokio::io::stdin());
    run_engine_with_io(cfg, store, history, reader, tokio::io::stdout()).await
}

/// Engine loop over arbitrary input and output streams.
pub async fn run_engine_with_io<R, W>(
    cfg: Config,
    store: Arc<dyn KeyValueStore>,
    history: Arc<dyn MessageHistory>,
    reader: R,
    out: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = JsonLineWriter::new(out);
    let backend = HttpGenerationBackend::new(
        &cfg.backend_url,
        &cfg.backend_model,
        &cfg.agent_id,
        cfg.backend_request_timeout(),
    );
    let collaborators = Collaborators::new(Arc::new(backend), Arc::new(writer.clone()))
        .with_relationship_builder(Arc::new(LoggingRelationshipBuilder::new(writer.clone())));
    let drain_limit = cfg.orchestrator.thinking_timeout();

    let state = EngineState::new(cfg, history, store, collaborators)?;
    state.start();
    info!("Engine ready, reading messages from input");

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<InputLine>(line) {
            Ok(InputLine::Message(record)) => {
                if let Err(e) = state.submit(record.into()) {
                    warn!("Dropping message: {}", e);
                    writer.emit(&OutputLine::Error { message: e.to_string() }).await?;
                }
            }
            Ok(InputLine::Command(command)) => handle_command(&state, &writer, command).await?,
            Err(e) => {
                debug!("Unparseable input line: {}", line);
                writer
                    .emit(&OutputLine::Error { message: format!("invalid input: {}", e) })
                    .await?;
            }
        }
    }

    info!("Input closed, waiting for in-flight replies");
    drain(&state, drain_limit).await;
    state.shutdown();
    Ok(())
}

async fn handle_command(state: &EngineState, writer: &JsonLineWriter, command: CommandLine) -> anyhow::Result<()> {
    match command.command.as_str() {
        "status" => {
            let ids = match command.conversation_id {
                Some(id) => vec![id],
                None => state.conversation_ids(),
            };
            for id in ids {
                let Some(orchestrator) = state.orchestrator(&id) else {
                    writer
                        .emit(&OutputLine::Error { message: format!("unknown conversation {}", id) })
                        .await?;
                    continue;
                };
                let status = orchestrator.get_cache_status();
                info!("[{}] engagement cache:\n{}", id, status);
                let replies = orchestrator.get_recent_replies(command.limit.unwrap_or(5));
                writer
                    .emit(&OutputLine::Status {
                        conversation_id: &id,
                        state: format!("{:?}", orchestrator.state()),
                        amplifier: orchestrator.amplifier(),
                        open_placeholders: orchestrator.open_placeholders(),
                        cache: serde_json::to_value(&status)?,
                        recent_replies: serde_json::to_value(&replies)?,
                    })
                    .await?;
            }
        }
        "metrics" => {
            writer
                .emit(&OutputLine::Metrics { text: crate::metrics::render_metrics() })
                .await?;
        }
        other => {
            writer
                .emit(&OutputLine::Error { message: format!("unknown command {}", other) })
                .await?;
        }
    }
    Ok(())
}

/// Waits until no conversation has an open placeholder, up to `limit`.
async fn drain(state: &EngineState, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    // Let the intake tasks pick up the last lines first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while tokio::time::Instant::now() < deadline {
        let busy = state
            .conversation_ids()
            .iter()
            .filter_map(|id| state.orchestrator(id))
            .any(|o| o.open_placeholders() > 0);
        if !busy {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    warn!("In-flight replies still pending after {:?}, stopping anyway", limit);
}
