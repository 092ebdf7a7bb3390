//! Register catalog
//!
//! Loaded once at startup from a CSV table, either the built-in EML3500-24L
//! map or an external file. Rows that cannot be interpreted are skipped.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

use super::bitfield::{FAULT_CODES, WARNING_CODES};
use super::enums;
use super::{Access, DataFormat, Presentation, RegisterDefinition};

const BUILTIN_TABLE: &str = include_str!("eml3500.csv");

/// One row of a register table
#[derive(Debug, Deserialize)]
struct CatalogRow {
    slug: String,
    label: String,
    address: u16,
    count: Option<u16>,
    #[serde(default)]
    format: String,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    access: String,
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
}

/// Split a unit column like `0.1V` into its scale and unit
pub fn parse_unit(unit: &str) -> (f64, Option<String>) {
    let unit = unit.trim();
    let numeric_len = unit
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(unit.len());
    let (numeric, rest) = unit.split_at(numeric_len);

    let scale = numeric
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s != 0.0)
        .unwrap_or(1.0);
    let rest = rest.trim();
    let unit = if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    };

    (scale, unit)
}

/// Decoder and encoder pairing for a slug
fn presentation_for(slug: &str) -> Presentation {
    match slug {
        "faults" => Presentation::Bitfield(&FAULT_CODES),
        "warnings" => Presentation::Bitfield(&WARNING_CODES),
        "power_flow_status" => Presentation::PowerFlow,
        "working_mode" => Presentation::Enum(&enums::WORKING_MODE),
        "output_mode" => Presentation::Enum(&enums::OUTPUT_MODE),
        "output_priority" => Presentation::Enum(&enums::OUTPUT_PRIORITY),
        "input_voltage_range" => Presentation::Enum(&enums::INPUT_VOLTAGE_RANGE),
        "buzzer_mode" => Presentation::Enum(&enums::BUZZER_MODE),
        "battery_type" => Presentation::Enum(&enums::BATTERY_TYPE),
        "battery_charging_priority" => Presentation::Enum(&enums::BATTERY_CHARGING_PRIORITY),
        "boot_mode" => Presentation::Enum(&enums::BOOT_MODE),
        "remote_switch" => Presentation::Enum(&enums::REMOTE_SWITCH),
        "lcd_backlight"
        | "energy_saving_mode"
        | "overload_restart"
        | "over_temperature_restart"
        | "overload_to_bypass"
        | "battery_equalization" => Presentation::Enum(&enums::SWITCH),
        _ => Presentation::Plain,
    }
}

impl CatalogRow {
    fn into_definition(self) -> Result<RegisterDefinition, String> {
        let slug = self.slug.trim().to_string();
        if slug.is_empty() || slug.contains(['/', '+', '#', ' ']) {
            return Err(format!("invalid slug {:?}", slug));
        }

        let declared = self.count.unwrap_or(0);
        let data_format = DataFormat::parse(&self.format, declared)
            .ok_or_else(|| format!("unknown data format {:?}", self.format))?;
        let count = match (data_format.fixed_count(), self.count) {
            (Some(fixed), None) => fixed,
            (Some(fixed), Some(n)) if n == fixed => n,
            (Some(fixed), Some(n)) => {
                return Err(format!("{:?} needs {} words, row has {}", data_format, fixed, n))
            }
            (None, Some(n)) if n > 0 => n,
            (None, _) => return Err("word count missing".to_string()),
        };
        let access =
            Access::parse(&self.access).ok_or_else(|| format!("unknown access {:?}", self.access))?;
        let (scale, unit) = parse_unit(&self.unit);

        Ok(RegisterDefinition {
            presentation: presentation_for(&slug),
            slug,
            label: self.label.trim().to_string(),
            address: self.address,
            count,
            data_format,
            scale,
            unit,
            access,
            min: self.min,
            max: self.max,
            step: self.step,
        })
    }
}

/// Read-only table of register definitions, in table order
#[derive(Debug, Clone)]
pub struct Catalog {
    registers: Vec<RegisterDefinition>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// The embedded EML3500-24L register map
    pub fn builtin() -> Self {
        Self::from_reader(BUILTIN_TABLE.as_bytes())
    }

    /// Load a register table from a CSV file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open register table: {}", path.display()))?;
        let catalog = Self::from_reader(file);
        info!(
            "Loaded {} register definitions from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parse a CSV table, skipping rows that cannot be used
    pub fn from_reader<R: Read>(reader: R) -> Self {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut catalog = Self::from_definitions(Vec::new());
        for (line, row) in csv.deserialize::<CatalogRow>().enumerate() {
            let definition = row
                .map_err(|e| e.to_string())
                .and_then(CatalogRow::into_definition);
            match definition {
                Ok(def) => {
                    if catalog.index.contains_key(&def.slug) {
                        warn!("Skipping duplicate register row {}: {}", line + 2, def.slug);
                        continue;
                    }
                    debug!("Register {} at {} ({:?})", def.slug, def.address, def.data_format);
                    catalog.index.insert(def.slug.clone(), catalog.registers.len());
                    catalog.registers.push(def);
                }
                Err(e) => warn!("Skipping malformed register row {}: {}", line + 2, e),
            }
        }
        catalog
    }

    pub fn from_definitions(registers: Vec<RegisterDefinition>) -> Self {
        let index = registers
            .iter()
            .enumerate()
            .map(|(i, def)| (def.slug.clone(), i))
            .collect();
        Self { registers, index }
    }

    pub fn get(&self, slug: &str) -> Option<&RegisterDefinition> {
        self.index.get(slug).map(|&i| &self.registers[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.registers.iter()
    }

    pub fn writable(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.registers.iter().filter(|def| def.is_writable())
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_loads_every_row() {
        let catalog = Catalog::builtin();
        let rows = BUILTIN_TABLE.lines().skip(1).filter(|l| !l.trim().is_empty()).count();
        assert_eq!(catalog.len(), rows);
    }

    #[test]
    fn test_mains_voltage_definition() {
        let catalog = Catalog::builtin();
        let reg = catalog.get("mains_voltage").unwrap();
        assert_eq!(reg.address, 202);
        assert_eq!(reg.count, 1);
        assert_eq!(reg.data_format, DataFormat::SignedInt16);
        assert_eq!(reg.scale, 0.1);
        assert_eq!(reg.unit.as_deref(), Some("V"));
        assert_eq!(reg.access, Access::ReadOnly);
    }

    #[test]
    fn test_presentations_are_bound() {
        let catalog = Catalog::builtin();
        assert!(matches!(
            catalog.get("faults").unwrap().presentation,
            Presentation::Bitfield(_)
        ));
        assert!(matches!(
            catalog.get("power_flow_status").unwrap().presentation,
            Presentation::PowerFlow
        ));
        assert!(matches!(
            catalog.get("output_priority").unwrap().presentation,
            Presentation::Enum(_)
        ));
        assert!(matches!(
            catalog.get("mains_power").unwrap().presentation,
            Presentation::Plain
        ));
    }

    #[test]
    fn test_writable_numbers_have_limits() {
        let catalog = Catalog::builtin();
        let reg = catalog.get("max_charge_voltage").unwrap();
        assert!(reg.is_writable());
        assert_eq!(reg.min, Some(24.0));
        assert_eq!(reg.max, Some(29.2));
        assert_eq!(reg.step, Some(0.1));
    }

    #[test]
    fn test_writable_registers() {
        let catalog = Catalog::builtin();
        let writable: Vec<&str> = catalog.writable().map(|def| def.slug.as_str()).collect();
        assert!(writable.contains(&"output_mode"));
        assert!(writable.contains(&"max_charge_voltage"));
        assert!(!writable.contains(&"mains_voltage"));
        assert!(writable.len() < catalog.len());
    }

    #[test]
    fn test_parse_unit() {
        assert_eq!(parse_unit("0.1V"), (0.1, Some("V".to_string())));
        assert_eq!(parse_unit("1w"), (1.0, Some("w".to_string())));
        assert_eq!(parse_unit("0.01Hz"), (0.01, Some("Hz".to_string())));
        assert_eq!(parse_unit("%"), (1.0, Some("%".to_string())));
        assert_eq!(parse_unit(""), (1.0, None));
        assert_eq!(parse_unit("1°C"), (1.0, Some("°C".to_string())));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let table = "\
slug,label,address,count,format,unit,access,min,max,step
good,Good,10,1,UInt,0.1V,R,,,
bad_address,Bad,abc,1,UInt,,R,,,
bad_format,Bad,11,1,Float,,R,,,
bad_count,Bad,12,1,ULong,,R,,,
bad_access,Bad,13,1,UInt,,X,,,
good,Duplicate,14,1,UInt,,R,,,
words,Words,15,3,,,R,,,
";
        let catalog = Catalog::from_reader(table.as_bytes());
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("good").unwrap().address, 10);
        assert_eq!(
            catalog.get("words").unwrap().data_format,
            DataFormat::RawWordArray
        );
        assert!(catalog.get("bad_address").is_none());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Catalog::from_path("/nonexistent/registers.csv").is_err());
    }
}
