//! Modbus transport
//!
//! Supports Modbus TCP, RTU framing tunnelled through a serial-to-TCP
//! bridge, and local serial RTU connections

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, DeviceConfig, RtuConnection};

pub mod client;
pub mod reader;

pub use client::TransportError;
pub use reader::{RegisterBus, RetryPolicy};

/// Address-level access to the device's holding registers.
///
/// Implementations serve one request at a time; callers serialize access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_words(&mut self, address: u16, count: u16) -> Result<Vec<u16>, TransportError>;

    async fn write_words(&mut self, address: u16, words: &[u16]) -> Result<(), TransportError>;

    /// Drop the current connection and open a fresh one
    async fn reconnect(&mut self) -> Result<(), TransportError>;
}

/// Modbus client for a single inverter
pub struct ModbusClient {
    connection: ConnectionConfig,
    unit_id: u8,
    context: Option<client::Context>,
}

impl ModbusClient {
    /// Create a client without connecting; the first request connects
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            connection: config.connection.clone(),
            unit_id: config.unit_id,
            context: None,
        }
    }

    async fn open(&mut self) -> Result<client::Context, TransportError> {
        let slave = Slave(self.unit_id);
        match &self.connection {
            ConnectionConfig::Tcp(tcp) => {
                info!("Connecting to Modbus TCP: {}:{} (unit {})", tcp.host, tcp.port, self.unit_id);
                let addr = tokio::net::lookup_host((tcp.host.as_str(), tcp.port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        TransportError::ConnectionLost(format!("cannot resolve {}", tcp.host))
                    })?;
                let ctx = tcp::connect_slave(addr, slave).await?;
                Ok(client::Context::Tcp(ctx))
            }
            ConnectionConfig::RtuOverTcp(tcp) => {
                info!(
                    "Connecting to serial bridge: {}:{} (RTU framing, unit {})",
                    tcp.host, tcp.port, self.unit_id
                );
                let stream = TcpStream::connect((tcp.host.as_str(), tcp.port)).await?;
                stream.set_nodelay(true)?;
                Ok(client::Context::RtuOverTcp(rtu::attach_slave(stream, slave)))
            }
            ConnectionConfig::Rtu(serial) => {
                let port = open_serial(serial)?;
                Ok(client::Context::Rtu(rtu::attach_slave(port, slave)))
            }
        }
    }

    async fn context(&mut self) -> Result<&mut client::Context, TransportError> {
        if self.context.is_none() {
            self.context = Some(self.open().await?);
        }
        self.context
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionLost("no connection available".to_string()))
    }

    /// Forget a connection whose request/response framing can no longer be trusted
    fn check<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.is_transient() {
                debug!("Dropping Modbus connection after error: {}", e);
                self.context = None;
            }
        }
        result
    }

    /// Check if connection is open
    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }
}

fn open_serial(rtu: &RtuConnection) -> Result<tokio_serial::SerialStream, TransportError> {
    info!(
        "Connecting to Modbus RTU: {} @ {} baud",
        rtu.port, rtu.baud_rate
    );

    let parity = match rtu.parity.to_lowercase().as_str() {
        "none" => tokio_serial::Parity::None,
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => {
            warn!("Unknown parity '{}', using None", rtu.parity);
            tokio_serial::Parity::None
        }
    };

    let stop_bits = match rtu.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        _ => {
            warn!("Unknown stop bits {}, using 1", rtu.stop_bits);
            tokio_serial::StopBits::One
        }
    };

    let data_bits = match rtu.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        _ => {
            warn!("Unknown data bits {}, using 8", rtu.data_bits);
            tokio_serial::DataBits::Eight
        }
    };

    tokio_serial::new(&rtu.port, rtu.baud_rate)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits)
        .timeout(Duration::from_secs(1))
        .open_native_async()
        .map_err(|e| {
            TransportError::ConnectionLost(format!("serial port {}: {}", rtu.port, e))
        })
}

#[async_trait]
impl RegisterTransport for ModbusClient {
    async fn read_words(&mut self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        debug!("Reading {} holding registers from address {}", count, address);
        let result = self.context().await?.read_holding_registers(address, count).await;
        self.check(result)
    }

    async fn write_words(&mut self, address: u16, words: &[u16]) -> Result<(), TransportError> {
        let ctx = self.context().await?;
        let result = match words {
            [single] => ctx.write_single_register(address, *single).await,
            _ => ctx.write_multiple_registers(address, words).await,
        };
        let result = self.check(result);
        if result.is_ok() {
            info!("Wrote {} registers starting at {}", words.len(), address);
        }
        result
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.context = None;
        let context = self.open().await?;
        info!("Reconnected Modbus {} client", context.kind());
        self.context = Some(context);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Answers zeros after a delay and panics when a request arrives while
    /// another one is still on the wire. Clones share their counters.
    #[derive(Clone)]
    pub struct ExclusiveTransport {
        delay: Duration,
        busy: Arc<AtomicBool>,
        reads: Arc<AtomicUsize>,
        writes_started: Arc<AtomicUsize>,
        writes: Arc<AtomicUsize>,
    }

    impl ExclusiveTransport {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                busy: Arc::new(AtomicBool::new(false)),
                reads: Arc::new(AtomicUsize::new(0)),
                writes_started: Arc::new(AtomicUsize::new(0)),
                writes: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        pub fn writes_started(&self) -> usize {
            self.writes_started.load(Ordering::SeqCst)
        }

        /// Writes that ran to completion
        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn enter(&self) {
            assert!(
                !self.busy.swap(true, Ordering::SeqCst),
                "overlapping register requests"
            );
        }

        fn leave(&self) {
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RegisterTransport for ExclusiveTransport {
        async fn read_words(&mut self, _address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
            self.enter();
            tokio::time::sleep(self.delay).await;
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.leave();
            Ok(vec![0; count as usize])
        }

        async fn write_words(&mut self, _address: u16, _words: &[u16]) -> Result<(), TransportError> {
            self.enter();
            self.writes_started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.leave();
            Ok(())
        }

        async fn reconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpConnection;

    fn device(connection: ConnectionConfig) -> DeviceConfig {
        DeviceConfig {
            connection,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_client_starts_disconnected() {
        let client = ModbusClient::new(&device(ConnectionConfig::RtuOverTcp(TcpConnection {
            host: "192.168.1.100".to_string(),
            port: 23,
        })));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_connection_lost() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = ModbusClient::new(&device(ConnectionConfig::RtuOverTcp(TcpConnection {
            host: "127.0.0.1".to_string(),
            port,
        })));
        let err = client.read_words(202, 1).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_client_runs_on_spawned_task() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = ModbusClient::new(&device(ConnectionConfig::Tcp(TcpConnection {
            host: "127.0.0.1".to_string(),
            port,
        })));
        let err = tokio::spawn(async move { client.reconnect().await })
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_serial_port() {
        let rtu = RtuConnection {
            port: "/dev/does-not-exist".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
        };
        assert!(matches!(
            open_serial(&rtu),
            Err(TransportError::ConnectionLost(_))
        ));
    }
}
