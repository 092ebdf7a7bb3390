//! Energy integration with daily rollover

use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::time::Duration;

use super::flow::PowerSnapshot;

const COUNTERS: usize = 11;

/// Every integrated counter and the flow that feeds it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnergyCounter {
    GridImport,
    GridExport,
    PvGeneration,
    BatteryCharge,
    BatteryDischarge,
    Load,
    PvToBattery,
    PvToLoad,
    GridToBattery,
    GridToLoad,
    BatteryToLoad,
}

impl EnergyCounter {
    pub const ALL: [EnergyCounter; COUNTERS] = [
        EnergyCounter::GridImport,
        EnergyCounter::GridExport,
        EnergyCounter::PvGeneration,
        EnergyCounter::BatteryCharge,
        EnergyCounter::BatteryDischarge,
        EnergyCounter::Load,
        EnergyCounter::PvToBattery,
        EnergyCounter::PvToLoad,
        EnergyCounter::GridToBattery,
        EnergyCounter::GridToLoad,
        EnergyCounter::BatteryToLoad,
    ];

    /// Key of the cumulative total
    pub fn slug(&self) -> &'static str {
        match self {
            EnergyCounter::GridImport => "grid_import_energy",
            EnergyCounter::GridExport => "grid_export_energy",
            EnergyCounter::PvGeneration => "pv_energy",
            EnergyCounter::BatteryCharge => "battery_charge_energy",
            EnergyCounter::BatteryDischarge => "battery_discharge_energy",
            EnergyCounter::Load => "load_energy",
            EnergyCounter::PvToBattery => "pv_to_battery_energy",
            EnergyCounter::PvToLoad => "pv_to_load_energy",
            EnergyCounter::GridToBattery => "grid_to_battery_energy",
            EnergyCounter::GridToLoad => "grid_to_load_energy",
            EnergyCounter::BatteryToLoad => "battery_to_load_energy",
        }
    }

    /// Key of the daily total
    pub fn daily_slug(&self) -> String {
        format!("{}_today", self.slug())
    }

    fn power(&self, flows: &PowerSnapshot) -> f64 {
        match self {
            EnergyCounter::GridImport => flows.grid_import_power,
            EnergyCounter::GridExport => flows.grid_export_power,
            EnergyCounter::PvGeneration => flows.pv_generation_power,
            EnergyCounter::BatteryCharge => flows.battery_charge_power,
            EnergyCounter::BatteryDischarge => flows.battery_discharge_power,
            EnergyCounter::Load => flows.load_power,
            EnergyCounter::PvToBattery => flows.pv_to_battery_power,
            EnergyCounter::PvToLoad => flows.pv_to_load_power,
            EnergyCounter::GridToBattery => flows.grid_to_battery_power,
            EnergyCounter::GridToLoad => flows.grid_to_load_power,
            EnergyCounter::BatteryToLoad => flows.battery_to_load_power,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

pub const DAILY_DATE_KEY: &str = "dailyDate";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Cumulative and daily kWh counters
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyState {
    totals: [f64; COUNTERS],
    daily: [f64; COUNTERS],
    daily_date: NaiveDate,
}

impl EnergyState {
    /// All counters at zero, daily counters dated `today`
    pub fn new(today: NaiveDate) -> Self {
        Self {
            totals: [0.0; COUNTERS],
            daily: [0.0; COUNTERS],
            daily_date: today,
        }
    }

    pub fn total(&self, counter: EnergyCounter) -> f64 {
        self.totals[counter.index()]
    }

    pub fn daily(&self, counter: EnergyCounter) -> f64 {
        self.daily[counter.index()]
    }

    pub fn daily_date(&self) -> NaiveDate {
        self.daily_date
    }

    /// Zero the daily counters when the calendar day has changed.
    ///
    /// Returns whether a reset happened.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.daily_date == today {
            return false;
        }
        self.daily = [0.0; COUNTERS];
        self.daily_date = today;
        true
    }

    /// Add `kwh` to a counter, ignoring anything not strictly positive
    fn add(&mut self, counter: EnergyCounter, kwh: f64) {
        if kwh.is_finite() && kwh > 0.0 {
            self.totals[counter.index()] += kwh;
            self.daily[counter.index()] += kwh;
        }
    }

    /// Rebuild state from a persisted document.
    ///
    /// Missing, non-numeric, negative or non-finite counters read as 0.0. A
    /// missing or unparseable date reads as `today` with the daily counters
    /// zeroed; lifetime totals are kept.
    pub fn from_json(value: &Value, today: NaiveDate) -> Self {
        let mut state = Self::new(today);
        let Some(object) = value.as_object() else {
            return state;
        };

        let read = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(0.0)
        };
        for counter in EnergyCounter::ALL {
            state.totals[counter.index()] = read(counter.slug());
            state.daily[counter.index()] = read(&counter.daily_slug());
        }
        match object
            .get(DAILY_DATE_KEY)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
        {
            Some(date) => state.daily_date = date,
            // daily values of an unknown day cannot count toward today
            None => state.daily = [0.0; COUNTERS],
        }

        state
    }

    /// Full persisted document
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for counter in EnergyCounter::ALL {
            object.insert(counter.slug().to_string(), Value::from(self.total(counter)));
            object.insert(counter.daily_slug(), Value::from(self.daily(counter)));
        }
        object.insert(
            DAILY_DATE_KEY.to_string(),
            Value::from(self.daily_date.format(DATE_FORMAT).to_string()),
        );
        Value::Object(object)
    }
}

/// Advance the energy state by one poll interval.
///
/// Daily counters are reset first when `today` differs from the stored
/// date, then every positive flow adds `watts / 1000 * hours` to both its
/// cumulative and daily counter.
pub fn accumulate(
    mut state: EnergyState,
    flows: &PowerSnapshot,
    elapsed: Duration,
    today: NaiveDate,
) -> EnergyState {
    state.roll_over(today);

    let hours = elapsed.as_secs_f64() / 3600.0;
    for counter in EnergyCounter::ALL {
        let watts = counter.power(flows);
        if watts.is_finite() && watts > 0.0 {
            state.add(counter, watts / 1000.0 * hours);
        }
    }
    state
}
