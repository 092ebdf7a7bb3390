//! Remote register writes
//!
//! The MQTT event loop enqueues every command message; a single consumer
//! resolves it against the catalog, encodes the value, writes it through
//! the register bus and republishes the register state. Rejected commands
//! never reach the device and are reported on the error topic.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::modbus::{RegisterBus, TransportError};
use crate::mqtt::{Publisher, Topics};
use crate::registers::{codec, CodecError, DataFormat, LogicalValue};

/// Command message as received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCommand {
    /// Target register, `None` for a JSON object of several writes
    pub slug: Option<String>,
    pub payload: String,
}

/// Why a command did not result in a write
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown register {0}")]
    UnknownRegister(String),
    #[error("register {0} is read-only")]
    ReadOnly(String),
    #[error("invalid value for {slug}: {source}")]
    InvalidValue {
        slug: String,
        #[source]
        source: CodecError,
    },
    #[error("unsupported value for {0}")]
    UnsupportedValue(String),
    #[error("command payload is not a JSON object: {0}")]
    MalformedPayload(String),
    #[error("write to {slug} failed: {source}")]
    Transport {
        slug: String,
        #[source]
        source: TransportError,
    },
}

impl CommandError {
    fn slug(&self) -> Option<&str> {
        match self {
            CommandError::UnknownRegister(slug)
            | CommandError::ReadOnly(slug)
            | CommandError::UnsupportedValue(slug)
            | CommandError::InvalidValue { slug, .. }
            | CommandError::Transport { slug, .. } => Some(slug),
            CommandError::MalformedPayload(_) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CommandError::Transport { .. } => "failed",
            _ => "rejected",
        }
    }
}

/// Consumer side of the command queue
pub struct CommandHandler {
    bus: RegisterBus,
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    retain: bool,
}

impl CommandHandler {
    pub fn new(bus: RegisterBus, publisher: Arc<dyn Publisher>, topics: Topics, retain: bool) -> Self {
        Self {
            bus,
            publisher,
            topics,
            retain,
        }
    }

    /// Split a command into individual writes
    fn resolve(&self, command: &InboundCommand) -> Vec<Result<(String, LogicalValue), CommandError>> {
        match &command.slug {
            Some(slug) => {
                // text registers take the payload verbatim, even when it looks numeric
                let value = match self.bus.catalog().get(slug) {
                    Some(def) if def.data_format == DataFormat::AsciiText => {
                        LogicalValue::Text(command.payload.clone())
                    }
                    _ => LogicalValue::from_payload(&command.payload),
                };
                vec![Ok((slug.clone(), value))]
            }
            None => match serde_json::from_str::<Value>(&command.payload) {
                Ok(Value::Object(entries)) => entries
                    .into_iter()
                    .map(|(slug, value)| match LogicalValue::from_json(&value) {
                        Some(value) => Ok((slug, value)),
                        None => Err(CommandError::UnsupportedValue(slug)),
                    })
                    .collect(),
                _ => vec![Err(CommandError::MalformedPayload(command.payload.clone()))],
            },
        }
    }

    /// Validate, encode and write one value
    async fn apply(&self, slug: &str, value: &LogicalValue) -> Result<(), CommandError> {
        let def = self
            .bus
            .catalog()
            .get(slug)
            .ok_or_else(|| CommandError::UnknownRegister(slug.to_string()))?;
        if !def.is_writable() {
            return Err(CommandError::ReadOnly(slug.to_string()));
        }

        let words = codec::encode(def, value).map_err(|source| CommandError::InvalidValue {
            slug: slug.to_string(),
            source,
        })?;

        self.bus
            .write_raw(slug, &words)
            .await
            .map_err(|source| CommandError::Transport {
                slug: slug.to_string(),
                source,
            })?;
        info!("Wrote {} = {:?}", slug, value);

        self.refresh(slug).await;
        Ok(())
    }

    /// Re-read a register after a write and publish its new state
    async fn refresh(&self, slug: &str) {
        let Some(def) = self.bus.catalog().get(slug) else {
            return;
        };
        let decoded = match self.bus.read_raw(slug).await {
            Ok(words) => codec::decode(def, &words),
            Err(e) => {
                warn!("Re-read of {} after write failed: {}", slug, e);
                return;
            }
        };
        match decoded.map(|value| value.to_payload()) {
            Ok(Some(payload)) => {
                if let Err(e) = self
                    .publisher
                    .publish(&self.topics.state(slug), payload, self.retain)
                    .await
                {
                    warn!("Failed to publish state of {}: {}", slug, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot decode {} after write: {}", slug, e),
        }
    }

    async fn report(&self, command: &InboundCommand, error: &CommandError) {
        warn!("Command rejected: {}", error);
        let notification = json!({
            "slug": error.slug().or(command.slug.as_deref()),
            "payload": command.payload,
            "error": error.to_string(),
        });
        if let Err(e) = self
            .publisher
            .publish(&self.topics.error(), notification.to_string(), false)
            .await
        {
            warn!("Failed to publish command error: {}", e);
        }
    }

    /// Process one command; each write in it succeeds or fails on its own
    pub async fn handle(&self, command: InboundCommand) -> Vec<Result<String, CommandError>> {
        let mut results = Vec::new();
        for resolved in self.resolve(&command) {
            let result = match resolved {
                Ok((slug, value)) => self.apply(&slug, &value).await.map(|_| slug),
                Err(e) => Err(e),
            };
            match &result {
                Ok(_) => metrics::counter!("solarbridge_commands_total", "result" => "ok").increment(1),
                Err(e) => {
                    metrics::counter!("solarbridge_commands_total", "result" => e.kind()).increment(1);
                    self.report(&command, e).await;
                }
            }
            results.push(result);
        }
        results
    }

    /// Drain the queue until every sender is gone or shutdown fires
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<InboundCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Command consumer started");
        loop {
            // shutdown is only observed between commands
            let command = tokio::select! {
                command = commands.recv() => command,
                _ = shutdown.recv() => {
                    info!("Command consumer stopping");
                    break;
                }
            };
            let Some(command) = command else {
                info!("Command queue closed, stopping consumer");
                break;
            };
            debug!("Handling command for {:?}", command.slug);
            self.handle(command).await;
        }
    }
}
