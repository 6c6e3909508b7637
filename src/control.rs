//! Typed control channel between the caching agent and the foreground UI.
//!
//! Events flow agent → UI over a broadcast channel; commands flow UI → agent
//! over an mpsc channel, each carrying a correlation id and a oneshot reply
//! slot so concurrent requests never get each other's answers.

use crate::cache::{CacheInfo, PartitionId, ResourceIdentity, VersionTag};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capacity of the event broadcast; slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 256;

/// Capacity of the command queue.
const COMMAND_CAPACITY: usize = 32;

// ── Agent → UI ──────────────────────────────────────────────────

/// User-visible, non-fatal conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notice {
    /// Neither backend could serve a detection call.
    NoDetectorAvailable,
    /// A sync task hit its retry cap and will not be retried.
    SyncDropped {
        task_id: String,
        kind: String,
        attempts: u32,
    },
    /// Cache storage is failing; the app keeps working without persistence.
    CacheDegraded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEvent {
    /// The first generation finished installing and activating; the app now
    /// works with zero connectivity.
    OfflineReady { version: VersionTag },
    /// A cached resource was replaced with different bytes.
    CacheUpdated {
        partition: PartitionId,
        key: ResourceIdentity,
        url: String,
    },
    /// A new generation is installed and waiting for activation.
    UpdateAvailable { version: VersionTag },
    /// A generation became the active one.
    Activated { version: VersionTag },
    /// A flush pass of the sync queue finished.
    SyncComplete {
        delivered: usize,
        retried: usize,
        dropped: usize,
        remaining: usize,
    },
    Notice(Notice),
}

/// Broadcast sender for agent events. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: AgentEvent) {
        tracing::debug!(?event, "Agent event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ── UI → Agent ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Activate a waiting generation without waiting for old clients to leave.
    SkipWaiting,
    /// Clear one partition of the active generation, or all of them.
    ClearCache {
        #[serde(default)]
        partition: Option<PartitionId>,
    },
    GetCacheInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandReply {
    Ack,
    Cleared { removed: usize },
    CacheInfo(CacheInfo),
    Error { message: String },
}

/// Reply tagged with the id of the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedReply {
    pub correlation_id: Uuid,
    pub reply: CommandReply,
}

/// A command in flight, owned by the agent until it replies.
pub struct CommandEnvelope {
    pub correlation_id: Uuid,
    pub command: Command,
    reply: oneshot::Sender<CorrelatedReply>,
}

impl CommandEnvelope {
    fn respond(self, reply: CommandReply) {
        let correlated = CorrelatedReply {
            correlation_id: self.correlation_id,
            reply,
        };
        if self.reply.send(correlated).is_err() {
            tracing::debug!(correlation_id = %self.correlation_id, "Command requester went away");
        }
    }
}

/// Agent-side command executor.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> CommandReply;
}

/// UI-side handle for sending commands and awaiting their replies.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl ControlHandle {
    /// Send a command and wait for the reply correlated to it.
    pub async fn request(&self, command: Command) -> anyhow::Result<CorrelatedReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let correlation_id = Uuid::new_v4();
        self.tx
            .send(CommandEnvelope {
                correlation_id,
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("control channel closed"))?;
        let reply = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("agent dropped command {correlation_id} without reply"))?;
        Ok(reply)
    }
}

/// Create a command channel: the handle goes to the UI, the receiver to
/// [`serve_commands`].
pub fn command_channel() -> (ControlHandle, mpsc::Receiver<CommandEnvelope>) {
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    (ControlHandle { tx }, rx)
}

/// Process commands until cancelled or every handle is dropped.
pub fn serve_commands(
    mut rx: mpsc::Receiver<CommandEnvelope>,
    handler: Arc<dyn CommandHandler>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    tracing::debug!(
                        correlation_id = %envelope.correlation_id,
                        command = ?envelope.command,
                        "Control command"
                    );
                    let reply = handler.handle(envelope.command.clone()).await;
                    envelope.respond(reply);
                }
            }
        }
        tracing::debug!("Control loop stopped");
    })
}
