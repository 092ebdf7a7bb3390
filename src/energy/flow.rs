//! Power-flow apportionment
//!
//! Splits the four aggregate readings into directional flows with a fixed
//! greedy order: PV feeds the battery first, then the load; the grid covers
//! what is left of battery charging, then of the load; the battery covers
//! the rest of the load. The result is an allocation, not a measurement,
//! and it does not conserve power when the readings disagree.

use serde::Serialize;

/// Directional power in watts, every field non-negative
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerSnapshot {
    pub grid_import_power: f64,
    pub grid_export_power: f64,
    pub battery_charge_power: f64,
    pub battery_discharge_power: f64,
    pub pv_generation_power: f64,
    pub pv_to_battery_power: f64,
    pub pv_to_load_power: f64,
    pub grid_to_battery_power: f64,
    pub grid_to_load_power: f64,
    pub battery_to_load_power: f64,
    pub load_power: f64,
}

impl PowerSnapshot {
    /// Slug and watts for every derived flow
    pub fn entries(&self) -> [(&'static str, f64); 11] {
        [
            ("grid_import_power", self.grid_import_power),
            ("grid_export_power", self.grid_export_power),
            ("battery_charge_power", self.battery_charge_power),
            ("battery_discharge_power", self.battery_discharge_power),
            ("pv_generation_power", self.pv_generation_power),
            ("pv_to_battery_power", self.pv_to_battery_power),
            ("pv_to_load_power", self.pv_to_load_power),
            ("grid_to_battery_power", self.grid_to_battery_power),
            ("grid_to_load_power", self.grid_to_load_power),
            ("battery_to_load_power", self.battery_to_load_power),
            ("load_power", self.load_power),
        ]
    }
}

fn positive(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Derive directional flows.
///
/// Positive `mains_power` is grid import and positive `battery_power` is
/// battery discharge; negative values are export and charge.
pub fn derive_flows(
    mains_power: f64,
    pv_power: f64,
    output_power: f64,
    battery_power: f64,
) -> PowerSnapshot {
    let grid_import = positive(mains_power);
    let grid_export = positive(-mains_power);
    let battery_discharge = positive(battery_power);
    let battery_charge = positive(-battery_power);
    let pv = positive(pv_power);
    let output = positive(output_power);

    let pv_to_battery = pv.min(battery_charge);
    let pv_remaining = positive(pv - pv_to_battery);
    let pv_to_load = pv_remaining.min(output);

    let grid_to_battery = grid_import.min(positive(battery_charge - pv_to_battery));

    let load_after_pv = positive(output - pv_to_load);
    let grid_for_load = positive(grid_import - grid_to_battery);
    let grid_to_load = grid_for_load.min(load_after_pv);

    let battery_to_load = battery_discharge.min(positive(load_after_pv - grid_to_load));

    PowerSnapshot {
        grid_import_power: grid_import,
        grid_export_power: grid_export,
        battery_charge_power: battery_charge,
        battery_discharge_power: battery_discharge,
        pv_generation_power: pv,
        pv_to_battery_power: pv_to_battery,
        pv_to_load_power: pv_to_load,
        grid_to_battery_power: grid_to_battery,
        grid_to_load_power: grid_to_load,
        battery_to_load_power: battery_to_load,
        load_power: output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pv_charges_battery_then_feeds_load() {
        let flows = derive_flows(0.0, 1500.0, 800.0, -500.0);
        assert_eq!(flows.pv_to_battery_power, 500.0);
        assert_eq!(flows.pv_to_load_power, 800.0);
        assert_eq!(flows.grid_to_battery_power, 0.0);
        assert_eq!(flows.grid_to_load_power, 0.0);
        assert_eq!(flows.battery_to_load_power, 0.0);
    }

    #[test]
    fn test_grid_covers_shortfall() {
        let flows = derive_flows(1000.0, 200.0, 900.0, -400.0);
        assert_eq!(flows.grid_import_power, 1000.0);
        assert_eq!(flows.pv_to_battery_power, 200.0);
        assert_eq!(flows.pv_to_load_power, 0.0);
        assert_eq!(flows.grid_to_battery_power, 200.0);
        assert_eq!(flows.grid_to_load_power, 800.0);
        assert_eq!(flows.battery_to_load_power, 0.0);
    }

    #[test]
    fn test_battery_covers_night_load() {
        let flows = derive_flows(0.0, 0.0, 600.0, 650.0);
        assert_eq!(flows.battery_discharge_power, 650.0);
        assert_eq!(flows.battery_to_load_power, 600.0);
        assert_eq!(flows.load_power, 600.0);
    }

    #[test]
    fn test_export_and_negative_inputs() {
        let flows = derive_flows(-300.0, -5.0, -10.0, 0.0);
        assert_eq!(flows.grid_export_power, 300.0);
        assert_eq!(flows.grid_import_power, 0.0);
        assert_eq!(flows.pv_generation_power, 0.0);
        assert_eq!(flows.load_power, 0.0);
    }

    #[test]
    fn test_non_finite_inputs_count_as_zero() {
        let flows = derive_flows(f64::NAN, f64::INFINITY, f64::NEG_INFINITY, f64::NAN);
        assert_eq!(flows, PowerSnapshot::default());
    }

    #[test]
    fn test_invariants_hold_for_arbitrary_inputs() {
        let samples = [-4000.0, -1234.5, -1.0, 0.0, 0.5, 100.0, 999.9, 3500.0];
        for &mains in &samples {
            for &pv in &samples {
                for &output in &samples {
                    for &battery in &samples {
                        let flows = derive_flows(mains, pv, output, battery);
                        for (slug, watts) in flows.entries() {
                            assert!(watts >= 0.0, "{} negative for {:?}", slug, (mains, pv, output, battery));
                        }
                        assert!(
                            flows.pv_to_battery_power + flows.pv_to_load_power
                                <= flows.pv_generation_power + 1e-9
                        );
                        assert!(
                            flows.grid_to_battery_power + flows.grid_to_load_power
                                <= flows.grid_import_power + 1e-9
                        );
                        assert!(flows.battery_to_load_power <= flows.battery_discharge_power);
                    }
                }
            }
        }
    }
}
