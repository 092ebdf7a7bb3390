//! Enumerated settings
//!
//! Each codec is a single static table; both directions read from it, so a
//! canonical label always encodes to the integer it decodes from.

use super::codec::CodecError;

/// Bidirectional mapping between small integers and canonical labels
#[derive(Debug)]
pub struct EnumCodec {
    name: &'static str,
    entries: &'static [(u16, &'static str)],
}

impl EnumCodec {
    pub const fn new(name: &'static str, entries: &'static [(u16, &'static str)]) -> Self {
        Self { name, entries }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Label for a raw value, `Unknown(<value>)` when unmapped
    pub fn decode(&self, value: u32) -> String {
        self.entries
            .iter()
            .find(|(key, _)| u32::from(*key) == value)
            .map(|(_, label)| label.to_string())
            .unwrap_or_else(|| format!("Unknown({})", value))
    }

    /// Raw value for a label, matched case-insensitively
    pub fn encode(&self, label: &str) -> Result<u16, CodecError> {
        let wanted = label.trim();
        self.entries
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(wanted))
            .map(|(key, _)| *key)
            .ok_or_else(|| CodecError::UnknownLabel {
                codec: self.name,
                label: label.to_string(),
            })
    }

    /// Accept a raw integer only if it is one of the mapped values
    pub fn validate_raw(&self, value: f64) -> Result<u16, CodecError> {
        self.entries
            .iter()
            .find(|(key, _)| f64::from(*key) == value)
            .map(|(key, _)| *key)
            .ok_or_else(|| CodecError::UnknownLabel {
                codec: self.name,
                label: value.to_string(),
            })
    }

    /// Canonical labels in table order
    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(_, label)| *label)
    }
}

pub static WORKING_MODE: EnumCodec = EnumCodec::new(
    "working_mode",
    &[
        (0, "Power on mode"),
        (1, "Standby mode"),
        (2, "Mains mode"),
        (3, "Off-grid mode"),
        (4, "Bypass mode"),
        (5, "Charging mode"),
        (6, "Failure mode"),
    ],
);

pub static OUTPUT_MODE: EnumCodec = EnumCodec::new(
    "output_mode",
    &[
        (0, "single machine"),
        (1, "parallel"),
        (2, "three-phase combination-P1"),
        (3, "three-phase combination-P2"),
        (4, "three-phase combination-P3"),
    ],
);

pub static OUTPUT_PRIORITY: EnumCodec = EnumCodec::new(
    "output_priority",
    &[
        (0, "Main-PV-Battery (UTI)"),
        (1, "PV-mains-battery (SOL)"),
        (2, "PV-battery-mains (SBU)"),
        (3, "PV-Mains-Battery (SUB)"),
    ],
);

pub static INPUT_VOLTAGE_RANGE: EnumCodec =
    EnumCodec::new("input_voltage_range", &[(0, "APL"), (1, "UPS")]);

pub static BUZZER_MODE: EnumCodec = EnumCodec::new(
    "buzzer_mode",
    &[
        (0, "mute"),
        (1, "source change or warning"),
        (2, "warning or fault"),
        (3, "fault only"),
    ],
);

pub static BATTERY_TYPE: EnumCodec = EnumCodec::new(
    "battery_type",
    &[
        (0, "AGM"),
        (1, "FLD"),
        (2, "USER"),
        (3, "Li1"),
        (4, "Li2"),
        (5, "Li3"),
        (6, "Li4"),
    ],
);

pub static BATTERY_CHARGING_PRIORITY: EnumCodec = EnumCodec::new(
    "battery_charging_priority",
    &[
        (0, "mains first"),
        (1, "PV priority"),
        (2, "PV equals mains"),
        (3, "PV only"),
    ],
);

pub static BOOT_MODE: EnumCodec = EnumCodec::new(
    "boot_mode",
    &[(0, "local or remote"), (1, "local only"), (2, "remote only")],
);

pub static REMOTE_SWITCH: EnumCodec = EnumCodec::new(
    "remote_switch",
    &[(0, "remote shutdown"), (1, "remote power-on")],
);

pub static SWITCH: EnumCodec = EnumCodec::new("switch", &[(0, "off"), (1, "on")]);

/// Every settings codec, for exhaustive checks
pub static ALL: &[&EnumCodec] = &[
    &WORKING_MODE,
    &OUTPUT_MODE,
    &OUTPUT_PRIORITY,
    &INPUT_VOLTAGE_RANGE,
    &BUZZER_MODE,
    &BATTERY_TYPE,
    &BATTERY_CHARGING_PRIORITY,
    &BOOT_MODE,
    &REMOTE_SWITCH,
    &SWITCH,
];
