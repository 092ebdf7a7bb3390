//! Register semantics
//!
//! Describes how raw 16-bit words read from the inverter map to typed,
//! scaled values and back.

use serde::Serialize;

pub mod bitfield;
pub mod catalog;
pub mod codec;
pub mod enums;

pub use bitfield::BitfieldCodec;
pub use catalog::Catalog;
pub use codec::CodecError;
pub use enums::EnumCodec;

/// Layout of the words behind a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    SignedInt16,
    UnsignedInt16,
    UnsignedLong32,
    AsciiText,
    RawWordArray,
}

impl DataFormat {
    /// Parse the format column of a register table.
    ///
    /// An empty column falls back to the word count: one word is an
    /// unsigned value, more than one is a raw word array.
    pub fn parse(format: &str, count: u16) -> Option<Self> {
        match format.trim().to_ascii_lowercase().as_str() {
            "int" | "i16" => Some(DataFormat::SignedInt16),
            "uint" | "u16" => Some(DataFormat::UnsignedInt16),
            "ulong" | "u32" => Some(DataFormat::UnsignedLong32),
            "asc" | "ascii" => Some(DataFormat::AsciiText),
            "words" => Some(DataFormat::RawWordArray),
            "" if count > 1 => Some(DataFormat::RawWordArray),
            "" => Some(DataFormat::UnsignedInt16),
            _ => None,
        }
    }

    /// Number of words the format needs, `None` when any count is valid
    pub fn fixed_count(&self) -> Option<u16> {
        match self {
            DataFormat::SignedInt16 | DataFormat::UnsignedInt16 => Some(1),
            DataFormat::UnsignedLong32 => Some(2),
            DataFormat::AsciiText | DataFormat::RawWordArray => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn parse(access: &str) -> Option<Self> {
        let upper = access.trim().to_ascii_uppercase();
        match upper.as_str() {
            "" | "R" | "RO" => Some(Access::ReadOnly),
            _ if upper.contains('W') => Some(Access::ReadWrite),
            _ => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// How a decoded number is turned into something a human reads
#[derive(Debug, Clone, Copy)]
pub enum Presentation {
    Plain,
    Enum(&'static EnumCodec),
    Bitfield(&'static BitfieldCodec),
    PowerFlow,
}

/// Immutable descriptor of one register
#[derive(Debug, Clone)]
pub struct RegisterDefinition {
    /// Stable logical identifier
    pub slug: String,
    /// Human-readable label
    pub label: String,
    /// Holding register start address
    pub address: u16,
    /// Number of 16-bit words
    pub count: u16,
    pub data_format: DataFormat,
    /// Multiplier applied after the raw decode
    pub scale: f64,
    /// Unit of measurement without the scale prefix
    pub unit: Option<String>,
    pub access: Access,
    /// Lower bound accepted on write
    pub min: Option<f64>,
    /// Upper bound accepted on write
    pub max: Option<f64>,
    /// Increment advertised to clients
    pub step: Option<f64>,
    pub presentation: Presentation,
}

impl RegisterDefinition {
    pub fn is_writable(&self) -> bool {
        self.access.is_writable()
    }
}

/// Typed result of decoding one register
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Numeric(f64),
    Text(String),
    Series(Vec<f64>),
    EnumLabel(String),
    BitsetLabels(Vec<String>),
    /// The read failed this cycle
    Unavailable,
}

impl DecodedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Numeric(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, DecodedValue::Unavailable)
    }

    /// Payload published on the per-slug state topic.
    ///
    /// Returns `None` for unavailable values; an empty bitset reads "OK".
    pub fn to_payload(&self) -> Option<String> {
        match self {
            DecodedValue::Numeric(v) => serde_json::to_string(v).ok(),
            DecodedValue::Text(s) | DecodedValue::EnumLabel(s) => Some(s.clone()),
            DecodedValue::Series(values) => serde_json::to_string(values).ok(),
            DecodedValue::BitsetLabels(labels) => Some(join_labels(labels)),
            DecodedValue::Unavailable => None,
        }
    }

    /// JSON form used in the combined telemetry document
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DecodedValue::Numeric(v) => serde_json::json!(v),
            DecodedValue::Text(s) | DecodedValue::EnumLabel(s) => serde_json::json!(s),
            DecodedValue::Series(values) => serde_json::json!(values),
            DecodedValue::BitsetLabels(labels) => serde_json::json!(join_labels(labels)),
            DecodedValue::Unavailable => serde_json::Value::Null,
        }
    }
}

impl Serialize for DecodedValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn join_labels(labels: &[String]) -> String {
    if labels.is_empty() {
        "OK".to_string()
    } else {
        labels.join(", ")
    }
}

/// Value supplied by a command before it is encoded
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalValue {
    Number(f64),
    Text(String),
}

impl LogicalValue {
    /// Interpret a raw command payload
    pub fn from_payload(payload: &str) -> Self {
        let trimmed = payload.trim();
        match trimmed.parse::<f64>() {
            Ok(n) => LogicalValue::Number(n),
            Err(_) => LogicalValue::Text(trimmed.to_string()),
        }
    }

    /// Interpret one member of a JSON command object
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(LogicalValue::Number),
            serde_json::Value::String(s) => Some(LogicalValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(LogicalValue::Number(if *b { 1.0 } else { 0.0 })),
            _ => None,
        }
    }
}
