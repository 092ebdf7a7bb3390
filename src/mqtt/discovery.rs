//! Home Assistant MQTT discovery
//!
//! One retained config message per entity under
//! `{discovery_prefix}/{component}/{prefix}_{slug}/config`.

use serde_json::{json, Map, Value};

use super::Topics;
use crate::energy::{EnergyCounter, PowerSnapshot};
use crate::registers::{Catalog, DataFormat, Presentation, RegisterDefinition};

const MANUFACTURER: &str = "VEVOR";
const MODEL: &str = "EML3500-24L";

fn device(topics: &Topics) -> Value {
    json!({
        "identifiers": [topics.prefix()],
        "name": format!("{} {}", MANUFACTURER, MODEL),
        "manufacturer": MANUFACTURER,
        "model": MODEL,
    })
}

fn device_class(unit: &str) -> Option<&'static str> {
    match unit {
        "V" => Some("voltage"),
        "A" => Some("current"),
        "W" => Some("power"),
        "VA" => Some("apparent_power"),
        "Hz" => Some("frequency"),
        "°C" => Some("temperature"),
        "kWh" => Some("energy"),
        _ => None,
    }
}

/// Home Assistant component for a register
fn component(def: &RegisterDefinition) -> &'static str {
    match def.presentation {
        Presentation::Enum(_) if def.is_writable() => "select",
        Presentation::Enum(_) | Presentation::Bitfield(_) | Presentation::PowerFlow => "sensor",
        Presentation::Plain if !def.is_writable() => "sensor",
        Presentation::Plain => match def.data_format {
            DataFormat::AsciiText => "text",
            DataFormat::RawWordArray => "sensor",
            _ if def.min.is_some() && def.max.is_some() => "number",
            _ => "sensor",
        },
    }
}

fn base_config(topics: &Topics, slug: &str, name: &str) -> Map<String, Value> {
    let mut config = Map::new();
    config.insert("name".into(), json!(name));
    config.insert("unique_id".into(), json!(format!("{}_{}", topics.prefix(), slug)));
    config.insert("object_id".into(), json!(format!("{}_{}", topics.prefix(), slug)));
    config.insert("state_topic".into(), json!(topics.state(slug)));
    config.insert("availability_topic".into(), json!(topics.availability()));
    config.insert("device".into(), device(topics));
    config
}

fn register_config(topics: &Topics, def: &RegisterDefinition) -> (&'static str, Value) {
    let component = component(def);
    let mut config = base_config(topics, &def.slug, &def.label);

    match component {
        "select" => {
            if let Presentation::Enum(codec) = def.presentation {
                config.insert("options".into(), json!(codec.labels().collect::<Vec<_>>()));
            }
            config.insert("command_topic".into(), json!(topics.command(&def.slug)));
            config.insert("entity_category".into(), json!("config"));
        }
        "number" => {
            config.insert("command_topic".into(), json!(topics.command(&def.slug)));
            config.insert("min".into(), json!(def.min));
            config.insert("max".into(), json!(def.max));
            config.insert("step".into(), json!(def.step.unwrap_or(def.scale)));
            config.insert("mode".into(), json!("box"));
            config.insert("entity_category".into(), json!("config"));
        }
        "text" => {
            config.insert("command_topic".into(), json!(topics.command(&def.slug)));
            config.insert("max".into(), json!(def.count * 2));
            config.insert("entity_category".into(), json!("config"));
        }
        _ => {
            if matches!(def.presentation, Presentation::Plain)
                && matches!(
                    def.data_format,
                    DataFormat::SignedInt16 | DataFormat::UnsignedInt16 | DataFormat::UnsignedLong32
                )
            {
                config.insert("state_class".into(), json!("measurement"));
            }
            if matches!(def.presentation, Presentation::Bitfield(_)) {
                config.insert("icon".into(), json!("mdi:alert-circle-outline"));
            }
        }
    }

    if let Some(unit) = &def.unit {
        config.insert("unit_of_measurement".into(), json!(unit));
        if component == "sensor" {
            if let Some(class) = device_class(unit) {
                config.insert("device_class".into(), json!(class));
            }
        }
    }

    (component, Value::Object(config))
}

/// Readable name for a derived slug, `pv_to_load_power` -> `PV to load power`
fn title(slug: &str) -> String {
    let words: Vec<String> = slug
        .split('_')
        .enumerate()
        .map(|(i, word)| match word {
            "pv" => "PV".to_string(),
            _ if i == 0 => {
                let mut chars = word.chars();
                chars
                    .next()
                    .map(|c| c.to_uppercase().chain(chars).collect::<String>())
                    .unwrap_or_default()
            }
            _ => word.to_string(),
        })
        .collect();
    words.join(" ")
}

fn derived_config(topics: &Topics, slug: &str, unit: &str, state_class: &str) -> Value {
    let mut config = base_config(topics, slug, &title(slug));
    config.insert("unit_of_measurement".into(), json!(unit));
    config.insert("state_class".into(), json!(state_class));
    if let Some(class) = device_class(unit) {
        config.insert("device_class".into(), json!(class));
    }
    Value::Object(config)
}

fn config_topic(topics: &Topics, component: &str, slug: &str) -> String {
    format!(
        "{}/{}/{}_{}/config",
        topics.discovery_prefix(),
        component,
        topics.prefix(),
        slug
    )
}

/// Every discovery message for the catalog and the derived values.
///
/// Empty when discovery is disabled by an empty discovery prefix.
pub fn messages(catalog: &Catalog, topics: &Topics) -> Vec<(String, String)> {
    if topics.discovery_prefix().is_empty() {
        return Vec::new();
    }

    let mut messages = Vec::new();
    for def in catalog.iter() {
        let (component, config) = register_config(topics, def);
        messages.push((config_topic(topics, component, &def.slug), config.to_string()));
    }

    for (slug, _) in PowerSnapshot::default().entries() {
        let config = derived_config(topics, slug, "W", "measurement");
        messages.push((config_topic(topics, "sensor", slug), config.to_string()));
    }

    for counter in EnergyCounter::ALL {
        for slug in [counter.slug().to_string(), counter.daily_slug()] {
            let config = derived_config(topics, &slug, "kWh", "total_increasing");
            messages.push((config_topic(topics, "sensor", &slug), config.to_string()));
        }
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("vevor_eml3500", "homeassistant")
    }

    fn find(messages: &[(String, String)], topic: &str) -> Value {
        let (_, payload) = messages
            .iter()
            .find(|(t, _)| t == topic)
            .unwrap_or_else(|| panic!("no discovery message on {}", topic));
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_fault_sensor() {
        let messages = messages(&Catalog::builtin(), &topics());
        let config = find(&messages, "homeassistant/sensor/vevor_eml3500_faults/config");
        assert_eq!(config["state_topic"], "vevor_eml3500/faults");
        assert_eq!(config["unique_id"], "vevor_eml3500_faults");
        assert_eq!(config["availability_topic"], "vevor_eml3500/availability");
        assert_eq!(config["device"]["manufacturer"], "VEVOR");
        assert!(config.get("command_topic").is_none());
    }

    #[test]
    fn test_measurement_sensor() {
        let messages = messages(&Catalog::builtin(), &topics());
        let config = find(&messages, "homeassistant/sensor/vevor_eml3500_mains_voltage/config");
        assert_eq!(config["unit_of_measurement"], "V");
        assert_eq!(config["device_class"], "voltage");
        assert_eq!(config["state_class"], "measurement");
    }

    #[test]
    fn test_writable_entities() {
        let messages = messages(&Catalog::builtin(), &topics());

        let select = find(&messages, "homeassistant/select/vevor_eml3500_output_mode/config");
        assert_eq!(select["command_topic"], "vevor_eml3500/output_mode/set");
        assert!(select["options"]
            .as_array()
            .unwrap()
            .contains(&json!("parallel")));

        let number = find(
            &messages,
            "homeassistant/number/vevor_eml3500_max_charge_voltage/config",
        );
        assert_eq!(number["min"], 24.0);
        assert_eq!(number["max"], 29.2);
        assert_eq!(number["step"], 0.1);

        let text = find(&messages, "homeassistant/text/vevor_eml3500_device_name/config");
        assert_eq!(text["max"], 24);
    }

    #[test]
    fn test_derived_sensors() {
        let messages = messages(&Catalog::builtin(), &topics());
        let power = find(
            &messages,
            "homeassistant/sensor/vevor_eml3500_pv_to_load_power/config",
        );
        assert_eq!(power["name"], "PV to load power");
        assert_eq!(power["device_class"], "power");

        let energy = find(
            &messages,
            "homeassistant/sensor/vevor_eml3500_grid_import_energy_today/config",
        );
        assert_eq!(energy["unit_of_measurement"], "kWh");
        assert_eq!(energy["state_class"], "total_increasing");
    }

    #[test]
    fn test_disabled_without_prefix() {
        let topics = Topics::new("vevor_eml3500", "");
        assert!(messages(&Catalog::builtin(), &topics).is_empty());
    }
}
