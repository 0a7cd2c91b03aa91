use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch, Mutex, RwLock},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{BikeError, Result},
    protocol::{ConnectCommand, WorkoutCommand},
    transaction::{CommandEngine, Transport},
    types::{BikeEvent, ConnectionState, SessionState, WorkoutTelemetry},
};

struct ActiveSession {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    engine: Arc<CommandEngine>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<BikeEvent>,
    state: watch::Sender<SessionState>,
    latest: RwLock<Option<WorkoutTelemetry>>,
    consecutive_errors: AtomicU32,
    max_consecutive_errors: u32,
}

/// Session controller for the workout polling loop
pub struct WorkoutController {
    shared: Arc<Shared>,
    connection: watch::Receiver<ConnectionState>,
    session: Mutex<Option<ActiveSession>>,
}

/// Runs the loop's terminal cleanup however the task exits
struct Finalizer {
    shared: Arc<Shared>,
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.shared.state.send_replace(SessionState::Idle);
        let _ = self.shared.events.send(BikeEvent::WorkoutEnded);
        info!("Workout ended");
    }
}

impl WorkoutController {
    /// Create a controller polling through `engine` and `transport`
    #[must_use]
    pub fn new(
        engine: Arc<CommandEngine>,
        transport: Arc<dyn Transport>,
        connection: watch::Receiver<ConnectionState>,
        events: broadcast::Sender<BikeEvent>,
        max_consecutive_errors: u32,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                engine,
                transport,
                events,
                state,
                latest: RwLock::new(None),
                consecutive_errors: AtomicU32::new(0),
                max_consecutive_errors,
            }),
            connection,
            session: Mutex::new(None),
        }
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Whether a polling loop is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() != SessionState::Idle
    }

    /// Most recent decoded sample
    pub async fn latest(&self) -> Option<WorkoutTelemetry> {
        *self.shared.latest.read().await
    }

    /// Data errors seen since the last successful poll
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.shared.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Open a command session and launch the polling loop
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::NotConnected`] if the bike is not connected,
    /// [`BikeError::AlreadyRunning`] if a loop is active,
    /// [`BikeError::ConnectRejected`] if the connect handshake could not be
    /// written, or any error of the connect exchange itself.
    pub async fn start(&self, poll_interval: Duration) -> Result<()> {
        let mut session = self.session.lock().await;

        if *self.connection.borrow() != ConnectionState::Connected {
            return Err(BikeError::NotConnected);
        }
        if self.is_running() {
            return Err(BikeError::AlreadyRunning);
        }

        if !self
            .shared
            .engine
            .execute(self.shared.transport.as_ref(), ConnectCommand)
            .await?
        {
            return Err(BikeError::ConnectRejected);
        }

        let (cancel, cancelled) = watch::channel(false);
        self.shared.consecutive_errors.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(SessionState::Running);

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let _finalizer = Finalizer {
                shared: shared.clone(),
            };
            if let Err(e) = shared.poll(poll_interval, cancelled).await {
                shared.publish_error(e);
            }
        });

        *session = Some(ActiveSession { cancel, task });
        info!("Workout loop launched, polling every {:?}", poll_interval);
        Ok(())
    }

    /// Ask the polling loop to stop and wait for its cleanup
    ///
    /// Does nothing when no loop is active.
    pub async fn stop(&self) {
        let Some(active) = self.session.lock().await.take() else {
            return;
        };

        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Stopping;
                true
            } else {
                false
            }
        });
        active.cancel.send_replace(true);

        if let Err(e) = active.task.await {
            error!("Workout task failed: {}", e);
        }
    }

    /// Wait until no polling loop is active
    pub async fn wait_for_end(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Idle).await;
    }
}

impl Shared {
    async fn poll(&self, interval: Duration, mut cancelled: watch::Receiver<bool>) -> Result<()> {
        let mut started = false;

        loop {
            if *cancelled.borrow() {
                debug!("Workout loop cancelled");
                return Ok(());
            }

            let command = WorkoutCommand::new(!started);
            let polled = tokio::select! {
                polled = self.engine.execute(self.transport.as_ref(), command) => polled,
                _ = cancelled.changed() => {
                    debug!("Workout poll abandoned on stop");
                    return Ok(());
                }
            };

            match polled {
                Ok(sample) => {
                    *self.latest.write().await = Some(sample);
                    if !started {
                        info!("Workout started");
                        let _ = self.events.send(BikeEvent::WorkoutStarted);
                        started = true;
                    }
                    self.consecutive_errors.store(0, Ordering::SeqCst);
                    let _ = self.events.send(BikeEvent::WorkoutUpdate(sample));
                }
                Err(e) if e.is_cancellation() || *cancelled.borrow() => {
                    debug!("Workout poll cancelled");
                    return Ok(());
                }
                Err(e) if started && e.is_data_error() => {
                    let count = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= self.max_consecutive_errors {
                        return Err(e);
                    }
                    warn!("Ignoring workout data error {}/{}: {}", count, self.max_consecutive_errors, e);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                () = sleep(interval) => {}
                changed = cancelled.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn publish_error(&self, error: BikeError) {
        error!("Workout loop failed: {}", error);
        let handled = self.events.receiver_count() > 0;
        if !handled {
            error!("No subscriber observed the workout error");
        }
        let _ = self.events.send(BikeEvent::Error {
            error: Arc::new(error),
            handled,
        });
    }
}
