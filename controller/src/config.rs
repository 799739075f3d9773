use std::{fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::{bus::LogicalAddress, motion::FrameGeometry, power::SchedulerConfig};

/// Macroblock columns in a 1920x1080 frame
pub const COLUMNS: usize = 120;
pub const ROWS: usize = 68;
/// Vector length which suggests motion
pub const MAGNITUDE_THRESHOLD: u32 = 60;
/// Vectors above the magnitude threshold which trigger motion
pub const TOTAL_THRESHOLD: u32 = 10;
pub const SAMPLING_INTERVAL: Duration = Duration::from_millis(100);
pub const STANDBY_DURATION: Duration = Duration::from_secs(300);
pub const WAKEUP_INTERVAL: Duration = Duration::from_secs(3600);
pub const WAKEUP_PROBE_DELAY: Duration = Duration::from_secs(10);
/// How long the display takes to react to a power command
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const REMOTE_ADDRESS: &str = "127.0.0.1:5555";
/// The name the display shows for us
pub const DEVICE_NAME: &str = "Smart Mirror";
pub const CEC_CLIENT_PROGRAM: &str = "cec-client";
/// Longest duration a config file may set
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;
/// Environment variable holding the path of the JSON config file
pub const CONFIG_PATH_VAR: &str = "MOTION_POWER_CONFIG";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub columns: usize,
    pub rows: usize,
    pub magnitude_threshold: u32,
    pub total_threshold: u32,
    pub sampling_interval_ms: u64,
    pub standby_secs: u64,
    pub wakeup_interval_secs: u64,
    pub wakeup_probe_delay_secs: u64,
    pub settle_delay_ms: u64,
    /// `host:port` the motion packets are sent to
    pub remote: String,
    /// Adapter to open. The first discovered adapter is used when this is not set.
    pub device_address: Option<String>,
    /// Logical address of the display on the bus
    pub display: u8,
    pub device_name: String,
    pub cec_client: PathBuf,
    /// Forward everything cec-client prints to the log
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            columns: COLUMNS,
            rows: ROWS,
            magnitude_threshold: MAGNITUDE_THRESHOLD,
            total_threshold: TOTAL_THRESHOLD,
            sampling_interval_ms: SAMPLING_INTERVAL.as_millis() as u64,
            standby_secs: STANDBY_DURATION.as_secs(),
            wakeup_interval_secs: WAKEUP_INTERVAL.as_secs(),
            wakeup_probe_delay_secs: WAKEUP_PROBE_DELAY.as_secs(),
            settle_delay_ms: SETTLE_DELAY.as_millis() as u64,
            remote: REMOTE_ADDRESS.into(),
            device_address: None,
            display: LogicalAddress::TV.0,
            device_name: DEVICE_NAME.into(),
            cec_client: CEC_CLIENT_PROGRAM.into(),
            verbose: false,
        }
    }
}

impl Config {
    /// Reads the file named by [`CONFIG_PATH_VAR`], or returns the defaults if it isn't set
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => {
                let path = PathBuf::from(path);
                let json = fs::read_to_string(&path)
                    .with_context(|| format!("Error reading config file {path:?}"))?;
                Self::from_json(&json).with_context(|| format!("Error parsing config file {path:?}"))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        anyhow::ensure!(
            config.columns > 0 && config.rows > 0,
            "Frame must be at least one macroblock"
        );
        for (name, secs) in [
            ("standby_secs", config.standby_secs),
            ("wakeup_interval_secs", config.wakeup_interval_secs),
            ("wakeup_probe_delay_secs", config.wakeup_probe_delay_secs),
            ("sampling_interval_ms", config.sampling_interval_ms / 1000),
            ("settle_delay_ms", config.settle_delay_ms / 1000),
        ] {
            anyhow::ensure!(
                secs <= MAX_DURATION_SECS,
                "{name} can be at most {MAX_DURATION_SECS} seconds"
            );
        }
        Ok(config)
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            columns: self.columns,
            rows: self.rows,
        }
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            standby_duration: Duration::from_secs(self.standby_secs),
            wakeup_interval: Duration::from_secs(self.wakeup_interval_secs),
            wakeup_probe_delay: Duration::from_secs(self.wakeup_probe_delay_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            device_address: self.device_address.clone(),
            display: LogicalAddress(self.display),
        }
    }
}
