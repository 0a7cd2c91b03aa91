use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{BikeError, Result},
    protocol::Command,
    transaction::{CommandEngine, Transport},
    types::{BikeConfig, BikeEvent, ConnectionState},
    DISCONNECT_SENTINEL, READ_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Resolved GATT endpoints of a connected bike
struct GattLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    read_char: Characteristic,
    notification_task: JoinHandle<()>,
}

/// Discovery result plus the task watching its connection status
struct Listener {
    peripheral: Peripheral,
    status_task: JoinHandle<()>,
    dial_task: Option<JoinHandle<()>>,
}

struct Shared {
    config: BikeConfig,
    engine: Arc<CommandEngine>,
    events: broadcast::Sender<BikeEvent>,
    state: watch::Sender<ConnectionState>,
    listening: watch::Sender<bool>,
    link: Mutex<Option<GattLink>>,
    listener: Mutex<Option<Listener>>,
}

/// Connection manager for the bike
///
/// Owns discovery, the GATT session, characteristic resolution and the
/// notification plumbing into the [`CommandEngine`]. Requests are written
/// through its [`Transport`] implementation.
pub struct BikeConnection {
    shared: Arc<Shared>,
}

impl BikeConnection {
    /// Create an idle connection manager publishing lifecycle events on `events`
    #[must_use]
    pub fn new(config: BikeConfig, events: broadcast::Sender<BikeEvent>) -> Self {
        let engine = Arc::new(CommandEngine::new(config.command_timeout()));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (listening, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                engine,
                events,
                state,
                listening,
                link: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    /// The transaction engine fed by this connection's notifications
    #[must_use]
    pub fn engine(&self) -> Arc<CommandEngine> {
        self.shared.engine.clone()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every connection state transition
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether discovery has found the bike and the status watcher is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        *self.shared.listening.borrow()
    }

    /// Find the bike, open a GATT session and keep it connected
    ///
    /// Does nothing if already listening. Once the bike is discovered with
    /// `maintain_connection` set, a failed first connect is retried in the
    /// background and [`BikeConnection::wait_for_connection`] waits for it.
    /// Any other failure rolls back the partial session before it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::DeviceNotFound`] if no adapter is present or no
    /// peripheral advertises the configured name before the scan timeout.
    /// Without `maintain_connection`, also returns [`BikeError::GattOperation`]
    /// if the bike's service or characteristics cannot be resolved, or
    /// [`BikeError::Ble`] for other Bluetooth errors.
    pub async fn start_listening(&self) -> Result<()> {
        let mut listener = self.shared.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        match self.open_session().await {
            Ok(opened) => {
                *listener = Some(opened);
                drop(listener);
                self.shared.listening.send_replace(true);
                info!("Listening for {}", self.shared.config.device_name);
                Ok(())
            }
            Err(e) => {
                drop(listener);
                self.shared.teardown_link().await;
                Err(e)
            }
        }
    }

    async fn open_session(&self) -> Result<Listener> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BikeError::DeviceNotFound)?;

        let status_events = adapter.events().await?;
        let peripheral = self.find_bike(&adapter).await?;
        let peripheral_id = peripheral.id();

        let shared = self.shared.clone();
        let watched = peripheral.clone();
        let status_task = tokio::spawn(async move {
            let mut status_events = status_events;
            while let Some(event) = status_events.next().await {
                match event {
                    CentralEvent::DeviceConnected(id) if id == peripheral_id => {
                        debug!("Connection status changed: connected");
                        if let Err(e) = shared.on_connected(&watched).await {
                            error!("Failed to set up bike connection: {}", e);
                            shared.publish_error(e);
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) if id == peripheral_id => {
                        debug!("Connection status changed: disconnected");
                        shared.on_disconnected().await;
                        if shared.config.maintain_connection {
                            shared.reconnect(&watched).await;
                        }
                    }
                    _ => {}
                }
            }
        });

        let connected = async {
            if !peripheral.is_connected().await? {
                peripheral.connect().await?;
            }
            self.shared.on_connected(&peripheral).await
        }
        .await;

        let dial_task = match connected {
            Ok(()) => None,
            Err(e) if keeps_listening_after(&self.shared.config, &e) => {
                warn!("First connection to bike failed, retrying: {}", e);
                let shared = self.shared.clone();
                let dialled = peripheral.clone();
                Some(tokio::spawn(async move {
                    shared.reconnect(&dialled).await;
                }))
            }
            Err(e) => {
                status_task.abort();
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        };

        Ok(Listener {
            peripheral,
            status_task,
            dial_task,
        })
    }

    async fn find_bike(&self, adapter: &Adapter) -> Result<Peripheral> {
        let name = &self.shared.config.device_name;
        info!("Scanning for {}...", name);

        adapter.start_scan(ScanFilter::default()).await?;
        let deadline = Instant::now() + Duration::from_millis(self.shared.config.scan_timeout_ms);

        let found = loop {
            let mut matched = None;
            for peripheral in adapter.peripherals().await? {
                if let Ok(Some(properties)) = peripheral.properties().await {
                    if properties.local_name.as_deref() == Some(name.as_str()) {
                        matched = Some(peripheral);
                        break;
                    }
                }
            }
            if matched.is_some() || Instant::now() >= deadline {
                break matched;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            debug!("Failed to stop scan cleanly: {}", e);
        }

        found.ok_or(BikeError::DeviceNotFound)
    }

    /// Tear down the session; safe to call repeatedly
    ///
    /// Cancels any in-flight command, disables notifications and drops the
    /// device handle.
    pub async fn stop_listening(&self) {
        let listener = self.shared.listener.lock().await.take();
        self.shared.listening.send_replace(false);

        let Some(listener) = listener else {
            return;
        };

        listener.status_task.abort();
        if let Some(dial_task) = listener.dial_task {
            dial_task.abort();
        }
        self.shared.teardown_link().await;

        if let Err(e) = listener.peripheral.disconnect().await {
            debug!("Disconnect failed: {}", e);
        }
        info!("Stopped listening");
    }

    /// Start listening if needed and wait until the bike is connected
    ///
    /// # Errors
    ///
    /// Returns any [`BikeConnection::start_listening`] error, or
    /// [`BikeError::Cancelled`] if listening stops before a connection is made.
    pub async fn wait_for_connection(&self) -> Result<()> {
        let mut state = self.watch_state();
        let mut listening = self.shared.listening.subscribe();

        self.start_listening().await?;

        tokio::select! {
            connected = state.wait_for(|s| *s == ConnectionState::Connected) => {
                connected.map(|_| ()).map_err(|_| BikeError::Cancelled)
            }
            _ = listening.wait_for(|l| !*l) => Err(BikeError::Cancelled),
        }
    }

    /// Write raw bytes to the bike's write characteristic
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::GattOperation`] if the bike is not connected or the
    /// write is rejected.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let (peripheral, write_char) = {
            let link = self.shared.link.lock().await;
            let link = link
                .as_ref()
                .ok_or_else(|| BikeError::GattOperation("Bike is not connected".to_string()))?;
            (link.peripheral.clone(), link.write_char.clone())
        };

        peripheral
            .write(&write_char, data, WriteType::WithResponse)
            .await
            .map_err(|e| BikeError::GattOperation(format!("Send to bike failed: {e}")))
    }

    /// Run one command through the transaction engine
    ///
    /// # Errors
    ///
    /// Returns whatever [`CommandEngine::execute`] returns.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        self.shared.engine.execute(self, command).await
    }
}

#[async_trait]
impl Transport for BikeConnection {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.send(data).await
    }
}

impl Shared {
    /// Resolve the bike's service and characteristics and enable notifications
    async fn on_connected(self: &Arc<Self>, peripheral: &Peripheral) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }
        self.state.send_replace(ConnectionState::Connecting);

        let resolved = async {
            let service_uuid = parse_uuid(SERVICE_UUID)?;
            let read_uuid = parse_uuid(READ_CHAR_UUID)?;
            let write_uuid = parse_uuid(WRITE_CHAR_UUID)?;

            peripheral
                .discover_services()
                .await
                .map_err(|e| BikeError::GattOperation(format!("Service discovery failed: {e}")))?;

            let services = peripheral.services();
            let service = services
                .iter()
                .find(|s| s.uuid == service_uuid)
                .ok_or_else(|| BikeError::GattOperation("Bike service not found".to_string()))?;

            let find = |uuid: Uuid, what: &str| {
                service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| BikeError::GattOperation(format!("{what} characteristic not found")))
            };
            let read_char = find(read_uuid, "Read")?;
            let write_char = find(write_uuid, "Write")?;

            let notifications = peripheral.notifications().await.map_err(|e| {
                BikeError::GattOperation(format!("Notification stream unavailable: {e}"))
            })?;
            peripheral.subscribe(&read_char).await.map_err(|e| {
                BikeError::GattOperation(format!("Enabling notifications failed: {e}"))
            })?;

            Ok::<_, BikeError>((read_char, write_char, notifications))
        }
        .await;

        let (read_char, write_char, mut notifications) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let engine = self.engine.clone();
        let read_uuid = read_char.uuid;
        let notification_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == read_uuid {
                    route_notification(&engine, &notification.value);
                }
            }
        });

        *link = Some(GattLink {
            peripheral: peripheral.clone(),
            write_char,
            read_char,
            notification_task,
        });
        drop(link);

        self.state.send_replace(ConnectionState::Connected);
        let _ = self.events.send(BikeEvent::Connected);
        info!("Bike connected");
        Ok(())
    }

    async fn on_disconnected(&self) {
        let was = self.teardown_link().await;
        if was != ConnectionState::Disconnected {
            info!("Bike disconnected");
        }
    }

    /// Drop the GATT link and publish the disconnect; returns the previous state
    async fn teardown_link(&self) -> ConnectionState {
        self.engine.cancel();

        if let Some(link) = self.link.lock().await.take() {
            link.notification_task.abort();
            if let Err(e) = link.peripheral.unsubscribe(&link.read_char).await {
                debug!("Disabling notifications failed: {}", e);
            }
        }

        let was = self.state.send_replace(ConnectionState::Disconnected);
        if was == ConnectionState::Connected {
            let _ = self.events.send(BikeEvent::Disconnected);
        }
        was
    }

    /// Re-dial the bike until it is connected again
    async fn reconnect(self: &Arc<Self>, peripheral: &Peripheral) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        loop {
            sleep(delay).await;
            if !*self.listening.borrow() {
                return;
            }
            match peripheral.connect().await {
                Ok(()) => match self.on_connected(peripheral).await {
                    Ok(()) => return,
                    Err(e) => warn!("Reconnected but setup failed: {}", e),
                },
                Err(e) => debug!("Reconnect attempt failed: {}", e),
            }
        }
    }

    fn publish_error(&self, error: BikeError) {
        let handled = self.events.receiver_count() > 0;
        let _ = self.events.send(BikeEvent::Error {
            error: Arc::new(error),
            handled,
        });
    }
}

/// A failed first connect leaves discovery armed for the re-dial loop
fn keeps_listening_after(config: &BikeConfig, error: &BikeError) -> bool {
    config.maintain_connection && error.is_connection_error()
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| BikeError::GattOperation(format!("Invalid UUID {value}: {e}")))
}

/// Forward a notification payload to the in-flight command
///
/// The bike's disconnect sentinel is swallowed.
pub(crate) fn route_notification(engine: &CommandEngine, data: &[u8]) {
    debug!("RECV: {:02X?}", data);
    if data == DISCONNECT_SENTINEL {
        debug!("Ignoring disconnect sentinel");
        return;
    }
    engine.deliver(data);
}
