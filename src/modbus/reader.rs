//! Register access by logical name
//!
//! Every request holds the transport lock for exactly one round trip, so
//! poll reads and command writes are strictly ordered and never interleave
//! on the wire.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{RegisterTransport, TransportError};
use crate::config::DeviceConfig;
use crate::registers::{Catalog, RegisterDefinition};

/// Transport shared between the poll loop and the command consumer
pub type SharedTransport = Arc<Mutex<Box<dyn RegisterTransport>>>;

/// Timeout and retry settings for a single register operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl From<&DeviceConfig> for RetryPolicy {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.read_timeout_ms),
            attempts: config.retries.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

#[derive(Clone, Copy)]
enum Request<'a> {
    Read { address: u16, count: u16 },
    Write { address: u16, words: &'a [u16] },
}

/// Catalog-aware handle on the shared transport
#[derive(Clone)]
pub struct RegisterBus {
    transport: SharedTransport,
    catalog: Arc<Catalog>,
    policy: RetryPolicy,
}

impl RegisterBus {
    pub fn new(
        transport: impl RegisterTransport + 'static,
        catalog: Arc<Catalog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Box::new(transport))),
            catalog,
            policy,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    fn definition(&self, slug: &str) -> Result<&RegisterDefinition, TransportError> {
        self.catalog
            .get(slug)
            .ok_or_else(|| TransportError::UnknownRegister(slug.to_string()))
    }

    /// Read the raw words of a register
    pub async fn read_raw(&self, slug: &str) -> Result<Vec<u16>, TransportError> {
        let def = self.definition(slug)?;
        let request = Request::Read {
            address: def.address,
            count: def.count,
        };
        self.execute(slug, request).await
    }

    /// Write raw words to a register
    pub async fn write_raw(&self, slug: &str, words: &[u16]) -> Result<(), TransportError> {
        let def = self.definition(slug)?;
        if !def.is_writable() {
            return Err(TransportError::NotWritable(slug.to_string()));
        }
        if words.len() != def.count as usize {
            return Err(TransportError::OutOfRange(slug.to_string()));
        }
        let request = Request::Write {
            address: def.address,
            words,
        };
        self.execute(slug, request).await.map(|_| ())
    }

    async fn execute(&self, slug: &str, request: Request<'_>) -> Result<Vec<u16>, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.attempt(request).await;
            match result {
                Ok(words) => return Ok(words),
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    warn!(
                        "{} on {}, retry {}/{}",
                        e,
                        slug,
                        attempt,
                        self.policy.attempts - 1
                    );
                    metrics::counter!("solarbridge_transport_retries_total").increment(1);
                    sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One round trip under the lock, reconnecting before release on failure
    async fn attempt(&self, request: Request<'_>) -> Result<Vec<u16>, TransportError> {
        let mut transport = self.transport.lock().await;

        let outcome = match request {
            Request::Read { address, count } => {
                timeout(self.policy.timeout, transport.read_words(address, count)).await
            }
            Request::Write { address, words } => {
                timeout(self.policy.timeout, transport.write_words(address, words))
                    .await
                    .map(|r| r.map(|_| Vec::new()))
            }
        };
        let result = outcome.unwrap_or(Err(TransportError::Timeout));

        if let Err(e) = &result {
            if e.is_transient() {
                match timeout(self.policy.timeout, transport.reconnect()).await {
                    Ok(Ok(())) => debug!("Transport reconnected"),
                    Ok(Err(re)) => debug!("Reconnect failed: {}", re),
                    Err(_) => debug!("Reconnect timed out"),
                }
            }
        }

        result
    }
}
