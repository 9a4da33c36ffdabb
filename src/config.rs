//! Tunable constants for a NeuroMaze rig, stored as [RON](ron).
//!
//! Every field has a default that matches the reference rig, so a config file
//! only needs to mention what differs. A minimal file looks like:
//!
//! ```text
//! (
//!     damping: 0.8,
//!     recorder: (endpoint: "10.0.0.7:5000"),
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path, time::Duration};

const MIN_TICK_RATE_HZ: f64 = 1.0;
const MAX_TICK_RATE_HZ: f64 = 1000.0;

/// Everything the controller needs to know about the rig and the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Scale applied to raw encoder increments before they move the subject.
    pub damping: f64,
    /// Distance below which the subject counts as "at" a reward tile.
    pub proximity_threshold: f64,
    /// Continuous time near a reward tile before a reward is given, seconds.
    pub dwell_secs: f64,
    /// How long the reward relay stays closed, seconds.
    pub reward_pulse_secs: f64,
    /// Distance to the end plate that counts as finishing a lap.
    pub lap_near_threshold: f64,
    /// Distance from the end plate beyond which a new lap may be detected.
    pub lap_far_threshold: f64,
    /// Number of light/dark alternations of the end plate.
    pub flash_cycles: u32,
    /// Length of one light/dark alternation, seconds.
    pub flash_period_secs: f64,
    /// Tick loop frequency, ticks per second.
    pub tick_rate_hz: f64,
    /// Serial link to the treadmill.
    pub serial: SerialConfig,
    /// Control socket of the acquisition software.
    pub recorder: RecorderConfig,
    /// Shape of the reference track.
    pub track: TrackConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            damping: 0.8,
            proximity_threshold: 8.5,
            dwell_secs: 2.0,
            reward_pulse_secs: 3.0,
            lap_near_threshold: 5.0,
            lap_far_threshold: 60.0,
            flash_cycles: 5,
            flash_period_secs: 0.5,
            tick_rate_hz: 50.0,
            serial: SerialConfig::default(),
            recorder: RecorderConfig::default(),
            track: TrackConfig::default(),
        }
    }
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate the firmware talks at.
    pub baud_rate: u32,
    /// How long a single blocking read may wait, milliseconds.
    pub read_timeout_ms: u64,
    /// Pause before re-opening a lost port, milliseconds.
    pub reconnect_delay_ms: u64,
    /// Unread readings kept before the oldest ones are dropped.
    pub max_unread_messages: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            read_timeout_ms: 100,
            reconnect_delay_ms: 1000,
            max_unread_messages: 1,
        }
    }
}

impl SerialConfig {
    /// [`Self::read_timeout_ms`] as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// [`Self::reconnect_delay_ms`] as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Acquisition software control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// `host:port` of the control server.
    pub endpoint: String,
    /// Give up on a connection attempt after this long, milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:5000".to_owned(),
            connect_timeout_ms: 3000,
        }
    }
}

impl RecorderConfig {
    /// [`Self::connect_timeout_ms`] as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// The straight reference track used when no scene provides geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Length from the start to the end plate.
    pub length: f64,
    /// Number of points sampled along the path.
    pub point_count: usize,
    /// Distance from the start of the track to the first wall tile.
    pub first_tile_offset: f64,
    /// Distance between consecutive wall tiles.
    pub tile_spacing: f64,
    /// Lateral distance from the centre line to either wall.
    pub wall_offset: f64,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            length: 270.0,
            point_count: 271,
            first_tile_offset: 12.0,
            tile_spacing: 20.0,
            wall_offset: 6.0,
        }
    }
}

/// Returned when a config file cannot be turned into a [`ControllerConfig`].
#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    IoError(std::io::Error),
    /// Serialization failed.
    RonError(ron::Error),
    /// The file is not valid RON for a [`ControllerConfig`].
    RonSpannedError(ron::de::SpannedError),
    /// The values parse but make no sense together.
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::IoError(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::RonError(error) => Cow::from(format!("ron error: {}", error)),
            ConfigError::RonSpannedError(error) => Cow::from(format!("ron parse error: {}", error)),
            ConfigError::Invalid(reason) => Cow::from(format!("invalid config: {}", reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl ControllerConfig {
    /// Read and validate a config from the path provided.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_ron(&text)
    }

    /// Parse and validate a config from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig =
            ron::from_str(text).map_err(ConfigError::RonSpannedError)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config out as pretty RON.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(ConfigError::RonError)?;
        fs::write(path, text).map_err(ConfigError::IoError)
    }

    /// Time between two ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.tick_rate_hz)
            .unwrap_or(Duration::from_millis(20))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tick_rate_hz.is_finite()
            && (MIN_TICK_RATE_HZ..=MAX_TICK_RATE_HZ).contains(&self.tick_rate_hz))
        {
            return Err(ConfigError::Invalid(
                "tick_rate_hz must be between 1 and 1000",
            ));
        }
        let non_negative = [
            (self.damping, "damping must be a non-negative number"),
            (self.proximity_threshold, "proximity_threshold must be a non-negative number"),
            (self.dwell_secs, "dwell_secs must be a non-negative number"),
            (self.reward_pulse_secs, "reward_pulse_secs must be a non-negative number"),
            (self.lap_near_threshold, "lap_near_threshold must be a non-negative number"),
            (self.lap_far_threshold, "lap_far_threshold must be a non-negative number"),
        ];
        for (value, reason) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Invalid(reason));
            }
        }
        if self.lap_far_threshold <= self.lap_near_threshold {
            return Err(ConfigError::Invalid(
                "lap_far_threshold must exceed lap_near_threshold",
            ));
        }
        if !(self.flash_period_secs.is_finite() && self.flash_period_secs > 0.0) {
            return Err(ConfigError::Invalid("flash_period_secs must be positive"));
        }
        if !(self.track.length.is_finite() && self.track.length > 0.0)
            || self.track.point_count < 2
        {
            return Err(ConfigError::Invalid(
                "track needs a positive length and at least two points",
            ));
        }
        if self.track.length <= self.lap_far_threshold {
            // The start has to be far enough from the end plate to re-arm laps.
            return Err(ConfigError::Invalid(
                "track length must exceed lap_far_threshold",
            ));
        }
        Ok(())
    }
}
