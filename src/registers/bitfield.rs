//! Fault, warning and power-flow bit decoding

/// Maps bit positions to condition descriptions.
///
/// Positions are normalized to the smallest bit in the table, so a table
/// numbered from bit 1 reads bit 1 from the least significant bit.
#[derive(Debug)]
pub struct BitfieldCodec {
    entries: &'static [(u8, &'static str)],
}

impl BitfieldCodec {
    /// `entries` must be sorted by bit position
    pub const fn new(entries: &'static [(u8, &'static str)]) -> Self {
        Self { entries }
    }

    fn base_bit(&self) -> u8 {
        self.entries.iter().map(|(bit, _)| *bit).min().unwrap_or(0)
    }

    /// Descriptions of every set bit, in ascending bit order
    pub fn decode(&self, value: u32) -> Vec<&'static str> {
        let base = self.base_bit();
        self.entries
            .iter()
            .filter(|(bit, _)| {
                let shift = u32::from(bit - base);
                shift < 32 && value & (1u32 << shift) != 0
            })
            .map(|(_, description)| *description)
            .collect()
    }
}

pub static FAULT_CODES: BitfieldCodec = BitfieldCodec::new(&[
    (1, "Inverter module over-temperature"),
    (2, "DCDC module over-temperature"),
    (3, "Battery overvoltage"),
    (4, "PV module over-temperature"),
    (5, "Output short circuit"),
    (6, "Inverter overvoltage"),
    (7, "Output overload"),
    (8, "Bus overvoltage"),
    (9, "Bus soft start timeout"),
    (10, "PV overcurrent"),
    (11, "PV overvoltage"),
    (12, "Battery overcurrent"),
    (13, "Inverter overcurrent"),
    (14, "Bus low voltage"),
    (15, "Inverter soft start failure"),
    (16, "Inverter DC component too high"),
    (18, "Output current zero offset too large"),
    (19, "Inverter current zero offset too large"),
    (20, "Battery current zero offset too large"),
    (21, "PV current zero offset too large"),
    (22, "Inverter low voltage"),
    (23, "Inverter negative power protection"),
    (24, "Parallel system host lost"),
    (25, "Parallel synchronization signal abnormal"),
    (26, "Parallel battery type incompatible"),
    (27, "Parallel software version incompatible"),
]);

pub static WARNING_CODES: BitfieldCodec = BitfieldCodec::new(&[
    (0, "Mains supply zero-crossing loss"),
    (1, "Mains waveform abnormal"),
    (2, "Mains overvoltage"),
    (3, "Mains undervoltage"),
    (4, "Mains overfrequency"),
    (5, "Mains underfrequency"),
    (6, "PV undervoltage"),
    (7, "Over-temperature"),
    (8, "Battery low voltage"),
    (9, "Battery not connected"),
    (10, "Overload"),
    (11, "Battery equalization charging"),
    (12, "Battery discharged below recovery point"),
    (13, "Output power derating"),
    (14, "Fan blocked"),
    (15, "PV energy too low to use"),
    (16, "Parallel communication interrupted"),
    (17, "Parallel output mode inconsistent"),
    (18, "Parallel battery voltage difference too large"),
]);

/// Decode the packed power-flow status word.
///
/// Bits 0-1 PV, 2-3 mains, 4-5 battery, 6-7 load, then one flag per bit
/// from 8 to 13.
pub fn decode_power_flow(value: u32) -> Vec<&'static str> {
    const FLAGS: [(u32, &str); 6] = [
        (8, "Mains charging"),
        (9, "PV charging"),
        (10, "Battery icon off"),
        (11, "PV icon off"),
        (12, "Mains icon off"),
        (13, "Load icon off"),
    ];

    let mut statuses = Vec::new();
    if value & 0b11 == 1 {
        statuses.push("PV connected");
    }
    if (value >> 2) & 0b11 == 1 {
        statuses.push("Mains connected");
    }
    match (value >> 4) & 0b11 {
        1 => statuses.push("Battery charging"),
        2 => statuses.push("Battery discharging"),
        _ => {}
    }
    if (value >> 6) & 0b11 == 1 {
        statuses.push("Load powered");
    }
    for (bit, label) in FLAGS {
        if value & (1 << bit) != 0 {
            statuses.push(label);
        }
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;

    static ZERO_BASED: BitfieldCodec =
        BitfieldCodec::new(&[(0, "zero"), (1, "one"), (2, "two"), (5, "five")]);

    #[test]
    fn test_no_bits_set() {
        assert!(ZERO_BASED.decode(0).is_empty());
        assert!(FAULT_CODES.decode(0).is_empty());
        assert!(WARNING_CODES.decode(0).is_empty());
    }

    #[test]
    fn test_single_bit() {
        assert_eq!(ZERO_BASED.decode(1 << 2), vec!["two"]);
    }

    #[test]
    fn test_ascending_order() {
        assert_eq!(
            ZERO_BASED.decode((1 << 5) | 1 | (1 << 1)),
            vec!["zero", "one", "five"]
        );
    }

    #[test]
    fn test_fault_codes_start_at_bit_one() {
        // table bit 3 sits at mask 1 << 2
        assert_eq!(FAULT_CODES.decode(1 << 2), vec!["Battery overvoltage"]);
        assert_eq!(FAULT_CODES.decode(1), vec!["Inverter module over-temperature"]);
    }

    #[test]
    fn test_warning_codes() {
        assert_eq!(WARNING_CODES.decode(1), vec!["Mains supply zero-crossing loss"]);
        assert_eq!(
            WARNING_CODES.decode((1 << 8) | (1 << 10)),
            vec!["Battery low voltage", "Overload"]
        );
    }

    #[test]
    fn test_unmapped_bits_are_ignored() {
        assert!(ZERO_BASED.decode(1 << 3).is_empty());
        assert!(FAULT_CODES.decode(1 << 31).is_empty());
    }

    #[test]
    fn test_power_flow() {
        let statuses = decode_power_flow(869);
        assert_eq!(
            statuses,
            vec![
                "PV connected",
                "Mains connected",
                "Battery discharging",
                "Load powered",
                "Mains charging",
                "PV charging",
            ]
        );
    }

    #[test]
    fn test_power_flow_battery_charging_and_icons() {
        let value = (1 << 4) | (1 << 10) | (1 << 13);
        assert_eq!(
            decode_power_flow(value),
            vec!["Battery charging", "Battery icon off", "Load icon off"]
        );
        assert!(decode_power_flow(0).is_empty());
        // 2-bit fields only report state 1
        assert!(decode_power_flow(0b10).is_empty());
    }
}
