// Simulation settings from the environment.
use courier_common::{Error, Result};
use std::path::PathBuf;

use crate::{ReplayTiming, SimulationMode};

pub const MODE_ENV: &str = "COURIER_SIMULATION_MODE";
pub const REPLAY_TIMING_ENV: &str = "COURIER_REPLAY_TIMING";
pub const RECORDING_PATH_ENV: &str = "COURIER_RECORDING_PATH";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationConfig {
    pub mode: SimulationMode,
    pub recording_path: Option<PathBuf>,
}

impl SimulationConfig {
    /// Reads `COURIER_SIMULATION_MODE` (`disabled`, `recording`, `replay`),
    /// `COURIER_REPLAY_TIMING` and `COURIER_RECORDING_PATH`.
    ///
    /// Replay without a timing is rejected rather than defaulted.
    pub fn from_env() -> Result<Self> {
        let mode = match read_env(MODE_ENV).map(|value| value.to_ascii_lowercase()).as_deref() {
            None | Some("disabled") => SimulationMode::Disabled,
            Some("recording") => SimulationMode::Recording,
            Some("replay") => {
                let timing = read_env(REPLAY_TIMING_ENV).ok_or_else(|| {
                    Error::Simulation(format!(
                        "{MODE_ENV}=replay requires {REPLAY_TIMING_ENV} (instant, realistic or fixed:<ms>)"
                    ))
                })?;
                SimulationMode::Replay(timing.parse::<ReplayTiming>()?)
            }
            Some(other) => {
                return Err(Error::Simulation(format!(
                    "unknown {MODE_ENV} value {other:?}"
                )));
            }
        };
        Ok(Self {
            mode,
            recording_path: read_env(RECORDING_PATH_ENV).map(PathBuf::from),
        })
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
