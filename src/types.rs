use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{
    error::BikeError, COMMAND_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS, DEVICE_NAME,
    MAX_CONSECUTIVE_ERRORS,
};

/// Kilometers per mile, as used by the bike's display conversion
pub const KM_PER_MILE: f64 = 1.60934;

/// Link state of the bike, driven by platform connection-status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No GATT link
    #[default]
    Disconnected,
    /// Link is up, characteristics are being resolved
    Connecting,
    /// Characteristics resolved and notifications enabled
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Lifecycle of the workout polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// No polling loop
    #[default]
    Idle,
    /// Polling loop is active
    Running,
    /// Stop requested, waiting for the loop's cleanup
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// One decoded workout sample
///
/// Equality is plain field-wise comparison, capture timestamp included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkoutTelemetry {
    /// When the sample was captured
    pub timestamp: SystemTime,
    /// Second-of-minute counter reported by the bike
    pub second: u8,
    /// Cumulative distance in miles
    pub distance_miles: f64,
    /// Elapsed workout time in seconds
    pub duration_secs: u16,
    /// Instantaneous speed in miles per hour
    pub speed_mph: f64,
    /// Pedal cadence in rotations per minute
    pub rpm: u16,
    /// Resistance/speed level selected on the bike (0..=9)
    pub speed_level: u8,
    #[serde(skip)]
    pub(crate) diag1: u8,
    #[serde(skip)]
    pub(crate) diag2: u8,
}

impl WorkoutTelemetry {
    /// Cumulative distance in kilometers
    #[must_use]
    pub fn distance_km(&self) -> f64 {
        self.distance_miles * KM_PER_MILE
    }

    /// Instantaneous speed in kilometers per hour
    #[must_use]
    pub fn speed_kph(&self) -> f64 {
        self.speed_mph * KM_PER_MILE
    }

    /// Elapsed workout time
    #[must_use]
    pub fn workout_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_secs))
    }

    /// The rider has stopped pedalling
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.rpm == 0
    }
}

/// Running aggregate over the samples of one workout
///
/// Paused samples are ignored so that averages reflect pedalling time only.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkoutSummary {
    /// Timestamp of the first counted sample
    pub started_at: Option<SystemTime>,
    /// Timestamp of the last counted sample
    pub ended_at: Option<SystemTime>,
    /// Elapsed workout time of the last counted sample
    pub duration_secs: u16,
    /// Distance of the last counted sample in kilometers
    pub distance_km: f64,
    /// Average speed in kilometers per hour
    pub average_speed_kph: f64,
    /// Average cadence in rotations per minute
    pub average_rpm: f64,
    /// Number of samples that contributed to the averages
    pub samples: u32,
}

impl WorkoutSummary {
    /// Create an empty summary
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into the summary
    pub fn record(&mut self, sample: &WorkoutTelemetry) {
        if sample.is_paused() {
            return;
        }

        if self.started_at.is_none() {
            self.started_at = Some(sample.timestamp);
        }
        self.ended_at = Some(sample.timestamp);
        self.duration_secs = sample.duration_secs;
        self.distance_km = sample.distance_km();

        let n = f64::from(self.samples);
        self.average_speed_kph = self.average_speed_kph.mul_add(n, sample.speed_kph()) / (n + 1.0);
        self.average_rpm = self.average_rpm.mul_add(n, f64::from(sample.rpm)) / (n + 1.0);
        self.samples += 1;
    }

    /// No pedalling sample has been recorded yet
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// Lifecycle and telemetry notifications published by [`crate::Bike`]
#[derive(Debug, Clone)]
pub enum BikeEvent {
    /// The GATT link is up and notifications are enabled
    Connected,
    /// The GATT link went down
    Disconnected,
    /// The first workout sample of a session was decoded
    WorkoutStarted,
    /// A workout sample was decoded
    WorkoutUpdate(WorkoutTelemetry),
    /// The polling loop finished its cleanup
    WorkoutEnded,
    /// The polling loop stopped because of an error
    Error {
        /// The error that ended the loop
        error: Arc<BikeError>,
        /// At least one subscriber received the event
        handled: bool,
    },
}

/// Timing and discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BikeConfig {
    /// Advertised name the bike is matched on
    pub device_name: String,
    /// How long a single command may take before it times out
    pub command_timeout_ms: u64,
    /// Default delay between workout polls
    pub poll_interval_ms: u64,
    /// Consecutive data errors after which a running workout is abandoned
    pub max_consecutive_errors: u32,
    /// How long discovery scans before giving up
    pub scan_timeout_ms: u64,
    /// Re-dial the bike after an unexpected disconnect
    pub maintain_connection: bool,
    /// Delay between re-dial attempts
    pub reconnect_delay_ms: u64,
}

impl BikeConfig {
    /// Command timeout as a [`Duration`]
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Default poll interval as a [`Duration`]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for BikeConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.to_string(),
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            scan_timeout_ms: 5_000,
            maintain_connection: true,
            reconnect_delay_ms: 1_000,
        }
    }
}
