use crate::{
    ble::BikeConnection,
    error::Result,
    protocol::{HoldCommand, Info1Command, Info2Command},
    session::WorkoutController,
    types::{BikeConfig, BikeEvent, ConnectionState, WorkoutTelemetry},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::info;

const EVENT_CAPACITY: usize = 64;

/// Main interface for an under-desk exercise bike
///
/// `Bike` ties the BLE connection to the workout polling loop. Lifecycle and
/// telemetry are delivered as [`BikeEvent`]s to every receiver obtained from
/// [`Bike::subscribe`].
///
/// # Examples
///
/// ```no_run
/// use deskbike::{Bike, BikeEvent};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bike = Bike::new();
///     let mut events = bike.subscribe();
///
///     bike.wait_for_connection().await?;
///     bike.start_workout().await?;
///
///     while let Ok(event) = events.recv().await {
///         if let BikeEvent::WorkoutUpdate(sample) = event {
///             println!("{:.1} km/h at {} rpm", sample.speed_kph(), sample.rpm);
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Bike {
    config: BikeConfig,
    connection: Arc<BikeConnection>,
    workout: Arc<WorkoutController>,
    events: broadcast::Sender<BikeEvent>,
}

impl Bike {
    /// Create a bike handle with default settings
    ///
    /// Nothing touches the Bluetooth adapter until [`Bike::start_listening`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BikeConfig::default())
    }

    /// Create a bike handle with custom timing and discovery settings
    #[must_use]
    pub fn with_config(config: BikeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connection = Arc::new(BikeConnection::new(config.clone(), events.clone()));
        let workout = Arc::new(WorkoutController::new(
            connection.engine(),
            connection.clone(),
            connection.watch_state(),
            events.clone(),
            config.max_consecutive_errors,
        ));

        Self {
            config,
            connection,
            workout,
            events,
        }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &BikeConfig {
        &self.config
    }

    /// Receive lifecycle and telemetry events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BikeEvent> {
        self.events.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Whether the GATT link is up and notifications are enabled
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Whether a workout polling loop is active
    #[must_use]
    pub fn is_workout_running(&self) -> bool {
        self.workout.is_running()
    }

    /// Most recent workout sample, if any
    pub async fn latest_telemetry(&self) -> Option<WorkoutTelemetry> {
        self.workout.latest().await
    }

    /// Find the bike and keep it connected
    ///
    /// # Errors
    ///
    /// See [`BikeConnection::start_listening`].
    pub async fn start_listening(&self) -> Result<()> {
        self.connection.start_listening().await
    }

    /// Stop any running workout, then tear down the connection
    ///
    /// Safe to call repeatedly.
    pub async fn stop_listening(&self) {
        self.workout.stop().await;
        self.connection.stop_listening().await;
    }

    /// Start listening if needed and wait until the bike is connected
    ///
    /// # Errors
    ///
    /// See [`BikeConnection::wait_for_connection`].
    pub async fn wait_for_connection(&self) -> Result<()> {
        self.connection.wait_for_connection().await
    }

    /// Start a workout polling at the configured interval
    ///
    /// # Errors
    ///
    /// See [`WorkoutController::start`].
    pub async fn start_workout(&self) -> Result<()> {
        self.start_workout_with_interval(self.config.poll_interval())
            .await
    }

    /// Start a workout polling every `interval`
    ///
    /// # Errors
    ///
    /// See [`WorkoutController::start`].
    pub async fn start_workout_with_interval(&self, interval: Duration) -> Result<()> {
        self.workout.start(interval).await?;
        info!("Workout requested with {:?} poll interval", interval);
        Ok(())
    }

    /// Stop the workout and wait for its cleanup; does nothing when idle
    pub async fn stop_workout(&self) {
        self.workout.stop().await;
    }

    /// Wait until no workout is running
    pub async fn wait_for_workout_end(&self) {
        self.workout.wait_for_end().await;
    }

    /// Send the keep-alive command and return its raw 32-byte response
    ///
    /// # Errors
    ///
    /// Returns any error of the exchange.
    pub async fn hold(&self) -> Result<[u8; 32]> {
        self.connection.execute(HoldCommand::new()).await
    }

    /// Run the first diagnostic exchange
    ///
    /// # Errors
    ///
    /// Returns any error of the exchange.
    pub async fn info1(&self) -> Result<u8> {
        self.connection.execute(Info1Command).await
    }

    /// Run the second diagnostic exchange
    ///
    /// # Errors
    ///
    /// Returns any error of the exchange.
    pub async fn info2(&self) -> Result<u16> {
        self.connection.execute(Info2Command).await
    }
}

impl Default for Bike {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bike {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = self.connection.clone();
        let workout = self.workout.clone();

        runtime.spawn(async move {
            workout.stop().await;
            connection.stop_listening().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BikeError;
    use crate::types::SessionState;

    #[tokio::test]
    async fn test_new_bike_is_idle() {
        let bike = Bike::new();

        assert_eq!(bike.connection_state(), ConnectionState::Disconnected);
        assert!(!bike.is_connected());
        assert!(!bike.is_workout_running());
        assert!(bike.latest_telemetry().await.is_none());
        assert_eq!(bike.config().poll_interval(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_start_workout_requires_connection() {
        let bike = Bike::new();
        let result = bike.start_workout().await;

        assert!(matches!(result, Err(BikeError::NotConnected)));
        assert!(!bike.is_workout_running());
    }

    #[tokio::test]
    async fn test_stop_calls_are_safe_when_idle() {
        let bike = Bike::new();
        let mut events = bike.subscribe();

        bike.stop_workout().await;
        bike.wait_for_workout_end().await;
        bike.stop_listening().await;
        bike.stop_listening().await;

        assert!(events.try_recv().is_err());
        assert_eq!(bike.workout.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_commands_fail_without_link() {
        let bike = Bike::with_config(BikeConfig {
            command_timeout_ms: 100,
            ..BikeConfig::default()
        });

        assert!(matches!(bike.hold().await, Err(BikeError::GattOperation(_))));
        assert!(matches!(bike.info1().await, Err(BikeError::GattOperation(_))));
        assert!(matches!(bike.info2().await, Err(BikeError::GattOperation(_))));
    }
}
