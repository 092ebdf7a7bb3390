//! Raw word <-> typed value conversion

use super::bitfield::decode_power_flow;
use super::{DataFormat, DecodedValue, LogicalValue, Presentation, RegisterDefinition};

/// Error type for register value conversion
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("expected {expected} words, got {actual}")]
    WordCount { expected: usize, actual: usize },
    #[error("not a number: {0:?}")]
    NotNumeric(String),
    #[error("value {value} outside {min}..={max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("unknown {codec} label: {label:?}")]
    UnknownLabel { codec: &'static str, label: String },
    #[error("expected a {expected} value")]
    WrongType { expected: &'static str },
    #[error("text is not ASCII: {0:?}")]
    NotAscii(String),
    #[error("writes are not supported for {0:?} registers")]
    Unsupported(DataFormat),
}

/// Decimal form of a scale factor: `mantissa / 10^decimals`
fn decimal_parts(scale: f64) -> Option<(i64, i32)> {
    if !scale.is_finite() || scale == 0.0 {
        return None;
    }
    // Display never uses exponent notation and prints the shortest
    // representation that reads back to the same double.
    let text = scale.to_string();
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let decimals = i32::try_from(frac_part.len()).ok().filter(|d| *d <= 15)?;
    let mantissa = format!("{}{}", int_part, frac_part).parse::<i64>().ok()?;
    Some((mantissa, decimals))
}

const EXACT_LIMIT: i128 = 1 << 53;

/// Multiply a raw integer by the scale without binary drift.
///
/// `249 * 0.1` yields the double nearest to 24.9.
pub fn scale_value(raw: i64, scale: f64) -> f64 {
    match decimal_parts(scale) {
        Some((mantissa, decimals)) => {
            let product = i128::from(raw) * i128::from(mantissa);
            if product.abs() <= EXACT_LIMIT {
                product as f64 / 10f64.powi(decimals)
            } else {
                raw as f64 * scale
            }
        }
        None => raw as f64 * scale,
    }
}

/// Divide a logical value by the scale and truncate to a raw integer
pub fn unscale_value(value: f64, scale: f64) -> f64 {
    let quotient = match decimal_parts(scale) {
        Some((mantissa, decimals)) => value * 10f64.powi(decimals) / mantissa as f64,
        None => value / scale,
    };
    let nearest = quotient.round();
    if (quotient - nearest).abs() < 1e-6 {
        nearest
    } else {
        quotient.trunc()
    }
}

fn check_count(def: &RegisterDefinition, words: &[u16]) -> Result<(), CodecError> {
    let expected = def
        .data_format
        .fixed_count()
        .unwrap_or(def.count)
        .max(1) as usize;
    if words.len() != expected || words.len() != def.count as usize {
        return Err(CodecError::WordCount {
            expected: def.count as usize,
            actual: words.len(),
        });
    }
    Ok(())
}

fn present(def: &RegisterDefinition, raw: u32, scaled: f64) -> DecodedValue {
    match def.presentation {
        Presentation::Plain => DecodedValue::Numeric(scaled),
        Presentation::Enum(codec) => DecodedValue::EnumLabel(codec.decode(raw)),
        Presentation::Bitfield(codec) => {
            DecodedValue::BitsetLabels(codec.decode(raw).into_iter().map(String::from).collect())
        }
        Presentation::PowerFlow => {
            DecodedValue::BitsetLabels(decode_power_flow(raw).into_iter().map(String::from).collect())
        }
    }
}

/// Convert the words read from a register into a typed value
pub fn decode(def: &RegisterDefinition, words: &[u16]) -> Result<DecodedValue, CodecError> {
    check_count(def, words)?;

    let value = match def.data_format {
        DataFormat::UnsignedInt16 => {
            let raw = words[0];
            present(def, u32::from(raw), scale_value(i64::from(raw), def.scale))
        }
        DataFormat::SignedInt16 => {
            let raw = words[0];
            let signed = i64::from(raw as i16);
            present(def, u32::from(raw), scale_value(signed, def.scale))
        }
        DataFormat::UnsignedLong32 => {
            let raw = (u32::from(words[0]) << 16) | u32::from(words[1]);
            present(def, raw, scale_value(i64::from(raw), def.scale))
        }
        DataFormat::AsciiText => {
            let bytes: Vec<u8> = words
                .iter()
                .flat_map(|w| w.to_be_bytes())
                .filter(u8::is_ascii)
                .collect();
            let text = String::from_utf8_lossy(&bytes);
            DecodedValue::Text(text.trim_end_matches('\0').to_string())
        }
        DataFormat::RawWordArray => DecodedValue::Series(
            words
                .iter()
                .map(|w| scale_value(i64::from(*w), def.scale))
                .collect(),
        ),
    };

    Ok(value)
}

fn encode_ascii(text: &str, count: u16) -> Result<Vec<u16>, CodecError> {
    if !text.is_ascii() {
        return Err(CodecError::NotAscii(text.to_string()));
    }
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(count as usize * 2, 0);
    Ok(bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn encode_raw(format: DataFormat, raw: f64) -> Result<Vec<u16>, CodecError> {
    let (min, max) = match format {
        DataFormat::SignedInt16 => (f64::from(i16::MIN), f64::from(i16::MAX)),
        DataFormat::UnsignedInt16 => (0.0, f64::from(u16::MAX)),
        DataFormat::UnsignedLong32 => (0.0, f64::from(u32::MAX)),
        other => return Err(CodecError::Unsupported(other)),
    };
    if !(min..=max).contains(&raw) {
        return Err(CodecError::OutOfRange { value: raw, min, max });
    }

    let words = match format {
        DataFormat::SignedInt16 => vec![raw as i16 as u16],
        DataFormat::UnsignedInt16 => vec![raw as u16],
        _ => {
            let raw = raw as u32;
            vec![(raw >> 16) as u16, (raw & 0xFFFF) as u16]
        }
    };
    Ok(words)
}

fn check_limits(def: &RegisterDefinition, value: f64) -> Result<(), CodecError> {
    let min = def.min.unwrap_or(f64::NEG_INFINITY);
    let max = def.max.unwrap_or(f64::INFINITY);
    if value < min || value > max {
        return Err(CodecError::OutOfRange { value, min, max });
    }
    Ok(())
}

/// Convert a logical value into the words to write to a register
pub fn encode(def: &RegisterDefinition, value: &LogicalValue) -> Result<Vec<u16>, CodecError> {
    match def.data_format {
        DataFormat::AsciiText => match value {
            LogicalValue::Text(text) => encode_ascii(text, def.count),
            LogicalValue::Number(_) => Err(CodecError::WrongType { expected: "text" }),
        },
        DataFormat::RawWordArray => Err(CodecError::Unsupported(DataFormat::RawWordArray)),
        format => {
            let raw = match (def.presentation, value) {
                (Presentation::Enum(codec), LogicalValue::Text(label)) => {
                    f64::from(codec.encode(label)?)
                }
                (Presentation::Enum(codec), LogicalValue::Number(n)) => {
                    f64::from(codec.validate_raw(*n)?)
                }
                (_, LogicalValue::Number(n)) => {
                    if !n.is_finite() {
                        return Err(CodecError::NotNumeric(n.to_string()));
                    }
                    check_limits(def, *n)?;
                    unscale_value(*n, def.scale)
                }
                (_, LogicalValue::Text(text)) => {
                    return Err(CodecError::NotNumeric(text.clone()));
                }
            };
            encode_raw(format, raw)
        }
    }
}
