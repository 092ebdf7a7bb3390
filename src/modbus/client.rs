//! Modbus client context types
//!
//! Supports Modbus TCP, RTU framing over a TCP serial bridge, and local
//! serial RTU connections

use tokio_modbus::client::Context as ModbusContext;
use tokio_modbus::prelude::*;
use tokio_modbus::Exception;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("register {0} is not writable")]
    NotWritable(String),
    #[error("value out of range for register {0}")]
    OutOfRange(String),
    #[error("unknown register {0}")]
    UnknownRegister(String),
    #[error("Modbus exception: {0:?}")]
    Exception(Exception),
}

impl TransportError {
    /// Errors worth a reconnect and another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::ConnectionLost(_))
    }
}

impl From<tokio_modbus::Error> for TransportError {
    fn from(e: tokio_modbus::Error) -> Self {
        TransportError::ConnectionLost(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::ConnectionLost(e.to_string()),
        }
    }
}

fn exception_error(address: u16, exception: Exception) -> TransportError {
    match exception {
        Exception::IllegalDataValue | Exception::IllegalDataAddress => {
            TransportError::OutOfRange(address.to_string())
        }
        code => TransportError::Exception(code),
    }
}

/// Unified context for the supported framings
pub enum Context {
    Tcp(ModbusContext),
    RtuOverTcp(ModbusContext),
    Rtu(ModbusContext),
}

impl Context {
    fn inner(&mut self) -> &mut ModbusContext {
        match self {
            Context::Tcp(ctx) | Context::RtuOverTcp(ctx) | Context::Rtu(ctx) => ctx,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Context::Tcp(_) => "TCP",
            Context::RtuOverTcp(_) => "RTU-over-TCP",
            Context::Rtu(_) => "RTU",
        }
    }

    pub async fn read_holding_registers(
        &mut self,
        addr: u16,
        cnt: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let result = self.inner().read_holding_registers(addr, cnt).await?;
        result.map_err(|e| exception_error(addr, e))
    }

    pub async fn write_single_register(
        &mut self,
        addr: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let result = self.inner().write_single_register(addr, value).await?;
        result.map_err(|e| exception_error(addr, e))
    }

    pub async fn write_multiple_registers(
        &mut self,
        addr: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let result = self.inner().write_multiple_registers(addr, values).await?;
        result.map_err(|e| exception_error(addr, e))
    }
}
