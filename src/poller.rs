//! Poll loop
//!
//! Reads every catalog register once per cycle, derives power flows,
//! integrates them into the energy counters and hands the resulting
//! snapshot to subscribers.

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::energy::{accumulate, derive_flows, EnergyCounter, EnergyState, EnergyStore, PowerSnapshot};
use crate::modbus::RegisterBus;
use crate::registers::{codec, DecodedValue};

/// Registers feeding the power-flow apportionment
const MAINS_POWER: &str = "mains_power";
const PV_POWER: &str = "pv_power";
const OUTPUT_POWER: &str = "output_active_power";
const BATTERY_POWER: &str = "battery_power";

/// Everything learned in one poll cycle
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: DateTime<Local>,
    /// Decoded registers in address order
    pub values: Vec<(String, DecodedValue)>,
    pub flows: PowerSnapshot,
    pub energy: EnergyState,
}

impl Snapshot {
    pub fn value(&self, slug: &str) -> Option<&DecodedValue> {
        self.values
            .iter()
            .find(|(s, _)| s == slug)
            .map(|(_, value)| value)
    }

    /// Number of registers whose read failed this cycle
    pub fn unavailable(&self) -> usize {
        self.values.iter().filter(|(_, value)| !value.is_available()).count()
    }

    /// Numeric reading of a register, zero when missing or unavailable
    fn power(&self, slug: &str) -> f64 {
        self.value(slug).and_then(DecodedValue::as_f64).unwrap_or(0.0)
    }

    /// Per-slug state payloads: registers, derived flows and energy counters.
    ///
    /// Unavailable registers are left out so the last retained value stays.
    pub fn state_messages(&self) -> Vec<(String, String)> {
        let mut messages: Vec<(String, String)> = self
            .values
            .iter()
            .filter_map(|(slug, value)| value.to_payload().map(|p| (slug.clone(), p)))
            .collect();

        for (slug, watts) in self.flows.entries() {
            messages.push((slug.to_string(), Value::from(watts).to_string()));
        }
        for counter in EnergyCounter::ALL {
            messages.push((
                counter.slug().to_string(),
                Value::from(self.energy.total(counter)).to_string(),
            ));
            messages.push((
                counter.daily_slug(),
                Value::from(self.energy.daily(counter)).to_string(),
            ));
        }
        messages
    }

    /// Combined document with every value of the cycle
    pub fn telemetry(&self) -> Value {
        let mut object = Map::new();
        object.insert("timestamp".to_string(), Value::from(self.timestamp.to_rfc3339()));
        for (slug, value) in &self.values {
            object.insert(slug.clone(), value.to_json());
        }
        for (slug, watts) in self.flows.entries() {
            object.insert(slug.to_string(), Value::from(watts));
        }
        if let Value::Object(energy) = self.energy.to_json() {
            object.extend(energy);
        }
        Value::Object(object)
    }
}

/// Owns the energy state and drives the register bus on a fixed period
pub struct Poller {
    bus: RegisterBus,
    store: EnergyStore,
    state: EnergyState,
    interval: Duration,
}

impl Poller {
    /// Create a poller, restoring the persisted energy counters
    pub fn new(bus: RegisterBus, store: EnergyStore, interval: Duration) -> Self {
        let state = store.load(Local::now().date_naive());
        Self {
            bus,
            store,
            state,
            interval,
        }
    }

    pub fn energy(&self) -> &EnergyState {
        &self.state
    }

    /// Run one cycle against the current wall clock
    pub async fn poll_once(&mut self) -> Snapshot {
        self.poll_at(Local::now()).await
    }

    /// Run one cycle as if it happened at `now`
    pub async fn poll_at(&mut self, now: DateTime<Local>) -> Snapshot {
        let started = Instant::now();

        let mut definitions: Vec<_> = self.bus.catalog().iter().collect();
        definitions.sort_by_key(|def| def.address);

        let mut values = Vec::with_capacity(definitions.len());
        for def in definitions {
            let value = match self.bus.read_raw(&def.slug).await {
                Ok(words) => match codec::decode(def, &words) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Cannot decode {}: {}, marking stale", def.slug, e);
                        metrics::counter!("solarbridge_read_failures_total", "register" => def.slug.clone())
                            .increment(1);
                        DecodedValue::Unavailable
                    }
                },
                Err(e) => {
                    warn!("Read of {} failed: {}, marking stale", def.slug, e);
                    metrics::counter!("solarbridge_read_failures_total", "register" => def.slug.clone())
                        .increment(1);
                    DecodedValue::Unavailable
                }
            };
            values.push((def.slug.clone(), value));
        }

        let mut snapshot = Snapshot {
            timestamp: now,
            values,
            flows: PowerSnapshot::default(),
            energy: self.state.clone(),
        };
        snapshot.flows = derive_flows(
            snapshot.power(MAINS_POWER),
            snapshot.power(PV_POWER),
            snapshot.power(OUTPUT_POWER),
            snapshot.power(BATTERY_POWER),
        );

        self.state = accumulate(
            self.state.clone(),
            &snapshot.flows,
            self.interval,
            now.date_naive(),
        );
        if let Err(e) = self.store.save(&self.state).await {
            error!("Failed to persist energy state: {:#}", e);
        }
        snapshot.energy = self.state.clone();

        for counter in EnergyCounter::ALL {
            metrics::gauge!("solarbridge_energy_kwh", "counter" => counter.slug())
                .set(self.state.total(counter));
        }
        metrics::gauge!("solarbridge_registers_unavailable").set(snapshot.unavailable() as f64);
        metrics::counter!("solarbridge_poll_cycles_total").increment(1);
        metrics::histogram!("solarbridge_poll_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        debug!(
            "Poll cycle done in {:?}: load {:.0} W, PV {:.0} W, {} stale",
            started.elapsed(),
            snapshot.flows.load_power,
            snapshot.flows.pv_generation_power,
            snapshot.unavailable()
        );
        snapshot
    }

    /// Poll until the shutdown signal fires, publishing every snapshot
    pub async fn run(
        mut self,
        updates: broadcast::Sender<Arc<Snapshot>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            "Poller started: {} registers every {:?}",
            self.bus.catalog().len(),
            self.interval
        );

        loop {
            let snapshot = self.poll_once().await;
            if updates.send(Arc::new(snapshot)).is_err() {
                debug!("No snapshot subscribers");
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.recv() => {
                    info!("Poller stopping");
                    break;
                }
            }
        }
    }
}
