//! Energy state persistence

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::accumulator::EnergyState;

/// JSON file holding the latest energy snapshot
#[derive(Debug, Clone)]
pub struct EnergyStore {
    path: PathBuf,
}

impl EnergyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state, falling back to zeroed counters
    pub fn load(&self, today: NaiveDate) -> EnergyState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No energy state at {}, starting from zero", self.path.display());
                return EnergyState::new(today);
            }
            Err(e) => {
                warn!("Failed to read energy state {}: {}", self.path.display(), e);
                return EnergyState::new(today);
            }
        };

        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(value) => {
                let state = EnergyState::from_json(&value, today);
                info!(
                    "Loaded energy state from {} (daily date {})",
                    self.path.display(),
                    state.daily_date()
                );
                state
            }
            Err(e) => {
                warn!("Malformed energy state {}: {}", self.path.display(), e);
                EnergyState::new(today)
            }
        }
    }

    /// Overwrite the state file.
    ///
    /// The document goes to a sibling temporary file first and is renamed
    /// over the target, so readers see either the old or the new snapshot.
    pub async fn save(&self, state: &EnergyState) -> Result<()> {
        let payload = serde_json::to_string_pretty(&state.to_json())
            .with_context(|| "Failed to serialize energy state")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, payload)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!("Failed to remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }

        debug!("Saved energy state to {}", self.path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{accumulate, derive_flows, EnergyCounter};
    use std::time::Duration;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn test_missing_file_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnergyStore::new(dir.path().join("energy.json"));
        assert_eq!(store.load(today()), EnergyState::new(today()));
    }

    #[test]
    fn test_malformed_file_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = EnergyStore::new(&path);
        assert_eq!(store.load(today()), EnergyState::new(today()));
    }

    #[tokio::test]
    async fn test_counters_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnergyStore::new(dir.path().join("state").join("energy.json"));

        let flows = derive_flows(1000.0, 500.0, 0.0, -200.0);
        let interval = Duration::from_secs(60);
        let state = accumulate(EnergyState::new(today()), &flows, interval, today());
        let state = accumulate(state, &flows, interval, today());
        store.save(&state).await.unwrap();

        let reloaded = store.load(today());
        assert_eq!(reloaded, state);
        assert!((reloaded.total(EnergyCounter::GridImport) - 2.0 / 60.0).abs() < 1e-12);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["dailyDate"], "2026-10-19");
        assert!(raw["battery_charge_energy_today"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_save_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be
        let path = dir.path().join("energy.json");
        std::fs::create_dir(&path).unwrap();
        let store = EnergyStore::new(&path);

        assert!(store.save(&EnergyState::new(today())).await.is_err());
        assert!(path.is_dir());
        assert!(!dir.path().join("energy.json.tmp").exists());
    }
}
