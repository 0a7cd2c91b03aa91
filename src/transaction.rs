use async_trait::async_trait;
use std::{
    sync::{Mutex as StdMutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{oneshot, Mutex},
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::{
    error::{BikeError, Result},
    protocol::{Command, Progress},
};

/// Write side of the link to the bike
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one request packet
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::GattOperation`] if the packet cannot be written.
    async fn write(&self, data: &[u8]) -> Result<()>;
}

/// Type-erased command parked in the slot while its exchange is in flight
trait PendingCommand: Send {
    fn name(&self) -> &'static str;
    /// Feed a notification; returns true once resolved
    fn deliver(&mut self, data: &[u8]) -> bool;
    fn send_failed(&mut self, error: BikeError);
    fn fail(&mut self, error: BikeError);
}

struct Pending<C: Command> {
    command: C,
    resolver: Option<oneshot::Sender<Result<C::Output>>>,
}

impl<C: Command> Pending<C> {
    fn resolve(&mut self, result: Result<C::Output>) {
        // First resolution wins; later input is ignored.
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(result);
        }
    }
}

impl<C: Command> PendingCommand for Pending<C> {
    fn name(&self) -> &'static str {
        self.command.name()
    }

    fn deliver(&mut self, data: &[u8]) -> bool {
        if self.resolver.is_none() {
            return true;
        }
        match self.command.receive(data) {
            Progress::Pending => false,
            Progress::Done(result) => {
                self.resolve(result);
                true
            }
        }
    }

    fn send_failed(&mut self, error: BikeError) {
        let result = self.command.send_failed(error);
        self.resolve(result);
    }

    fn fail(&mut self, error: BikeError) {
        self.resolve(Err(error));
    }
}

/// Single-slot transaction engine
///
/// At most one command is in flight; concurrent callers of
/// [`CommandEngine::execute`] queue on an internal gate.
pub struct CommandEngine {
    gate: Mutex<()>,
    current: StdMutex<Option<Box<dyn PendingCommand>>>,
    command_timeout: Duration,
}

/// Clears the slot on every exit path of an exchange
struct SlotRelease<'a> {
    engine: &'a CommandEngine,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.engine.slot().take();
    }
}

impl CommandEngine {
    /// Create an engine with the given per-command timeout
    #[must_use]
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            gate: Mutex::new(()),
            current: StdMutex::new(None),
            command_timeout,
        }
    }

    /// Per-command timeout
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn PendingCommand>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// No command currently occupies the slot
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.slot().is_none()
    }

    /// Run one exchange: write the request, then wait for the command to resolve
    ///
    /// The write and the wait together are bounded by the command timeout.
    /// If the command resolves in the same instant the timer fires, the
    /// resolution wins.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::CommandTimeout`] if the bike does not answer in time,
    /// [`BikeError::Cancelled`] if [`CommandEngine::cancel`] aborts the exchange,
    /// or whatever error the command resolves with.
    pub async fn execute<C: Command>(&self, transport: &dyn Transport, command: C) -> Result<C::Output> {
        let _exclusive = self.gate.lock().await;

        let name = command.name();
        let request = command.request();
        let (resolver, mut resolution) = oneshot::channel();
        *self.slot() = Some(Box::new(Pending {
            command,
            resolver: Some(resolver),
        }));
        let _release = SlotRelease { engine: self };

        debug!("SEND {}: {:02X?}", name, &request[..]);

        let exchange = async {
            tokio::select! {
                biased;
                resolved = &mut resolution => return resolved.unwrap_or(Err(BikeError::Cancelled)),
                written = transport.write(&request) => {
                    if let Err(e) = written {
                        warn!("Write of {} command failed: {}", name, e);
                        if let Some(pending) = self.slot().as_mut() {
                            pending.send_failed(e);
                        }
                    }
                }
            }
            resolution.await.unwrap_or(Err(BikeError::Cancelled))
        };

        if let Ok(result) = timeout(self.command_timeout, exchange).await {
            result
        } else {
            let timeout_ms = u64::try_from(self.command_timeout.as_millis()).unwrap_or(u64::MAX);
            warn!("Timeout waiting for {} response from bike", name);
            Err(BikeError::CommandTimeout { timeout_ms })
        }
    }

    /// Hand a notification payload to the in-flight command, if any
    ///
    /// Never blocks; payloads that arrive while the slot is empty are dropped.
    pub fn deliver(&self, data: &[u8]) {
        let mut slot = self.slot();
        match slot.as_mut() {
            Some(pending) => {
                trace!("Routing {} bytes to {} command", data.len(), pending.name());
                pending.deliver(data);
            }
            None => warn!("Dropping notification with no command in flight: {:02X?}", data),
        }
    }

    /// Abort the in-flight command, if any, with [`BikeError::Cancelled`]
    pub fn cancel(&self) {
        if let Some(pending) = self.slot().as_mut() {
            debug!("Cancelling {} command", pending.name());
            pending.fail(BikeError::Cancelled);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{
        ConnectCommand, HoldCommand, WorkoutCommand, CONNECT_ACK, HEADER, PACKET_SIZE,
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio_test::{assert_err, assert_ok};

    /// In-memory link: every write pops the next scripted reply and delivers
    /// its notifications into the engine.
    pub(crate) struct ScriptedTransport {
        engine: Arc<CommandEngine>,
        replies: StdMutex<std::collections::VecDeque<Reply>>,
        pub(crate) writes: StdMutex<Vec<Vec<u8>>>,
    }

    #[derive(Clone)]
    pub(crate) enum Reply {
        Notify(Vec<Vec<u8>>),
        /// Deliver the packets from a separate task after a delay
        Later(Duration, Vec<Vec<u8>>),
        Silent,
        WriteError,
    }

    impl ScriptedTransport {
        pub(crate) fn new(engine: Arc<CommandEngine>, replies: Vec<Reply>) -> Self {
            Self {
                engine,
                replies: StdMutex::new(replies.into()),
                writes: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn push(&self, reply: Reply) {
            self.replies.lock().unwrap().push_back(reply);
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn write(&self, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Silent);
            match reply {
                Reply::Notify(packets) => {
                    for packet in packets {
                        self.engine.deliver(&packet);
                    }
                    Ok(())
                }
                Reply::Later(delay, packets) => {
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        for packet in packets {
                            engine.deliver(&packet);
                        }
                    });
                    Ok(())
                }
                Reply::Silent => Ok(()),
                Reply::WriteError => Err(BikeError::GattOperation("write rejected".to_string())),
            }
        }
    }

    pub(crate) fn frame(code: u8, fill: u8) -> Vec<u8> {
        let mut data = vec![fill; PACKET_SIZE];
        data[0] = HEADER;
        data[1] = code;
        data
    }

    pub(crate) fn workout_reply(fill: u8) -> Reply {
        Reply::Notify(vec![
            frame(0xE5, fill),
            frame(0xE6, fill),
            frame(0xE7, fill),
        ])
    }

    fn engine() -> Arc<CommandEngine> {
        Arc::new(CommandEngine::new(Duration::from_millis(2_000)))
    }

    #[tokio::test]
    async fn test_connect_exchange() {
        let engine = engine();
        let transport = ScriptedTransport::new(
            engine.clone(),
            vec![
                Reply::Notify(vec![CONNECT_ACK.to_vec()]),
                Reply::Notify(vec![vec![0xF9, 0xE0, 0x00, 0x00]]),
            ],
        );

        assert!(assert_ok!(engine.execute(&transport, ConnectCommand).await));
        assert!(engine.is_idle());

        let error = assert_err!(engine.execute(&transport, ConnectCommand).await);
        assert!(matches!(error, BikeError::Protocol(_)));
        assert!(engine.is_idle());
        assert_eq!(transport.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_the_slot() {
        let engine = engine();
        let transport = ScriptedTransport::new(
            engine.clone(),
            vec![Reply::Silent, Reply::Notify(vec![CONNECT_ACK.to_vec()])],
        );

        let started = tokio::time::Instant::now();
        let result = engine.execute(&transport, WorkoutCommand::new(true)).await;
        assert!(matches!(
            result,
            Err(BikeError::CommandTimeout { timeout_ms: 2_000 })
        ));
        assert!(started.elapsed() >= Duration::from_millis(2_000));
        assert!(engine.is_idle());

        assert!(engine.execute(&transport, ConnectCommand).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_failure_resolves_command() {
        let engine = engine();
        let transport = ScriptedTransport::new(
            engine.clone(),
            vec![Reply::WriteError, Reply::WriteError],
        );

        let result = engine.execute(&transport, HoldCommand::new()).await;
        assert!(matches!(result, Err(BikeError::GattOperation(_))));

        assert!(!engine.execute(&transport, ConnectCommand).await.unwrap());
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn test_late_packets_after_protocol_error_are_ignored() {
        let engine = engine();
        let transport = ScriptedTransport::new(
            engine.clone(),
            vec![Reply::Notify(vec![
                frame(0xE5, 0x01),
                frame(0xE7, 0x03),
                frame(0xE6, 0x02),
            ])],
        );

        let result = engine.execute(&transport, WorkoutCommand::new(false)).await;
        assert!(matches!(result, Err(BikeError::Protocol(_))));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_deliver_without_command_is_dropped_with_warning() {
        let engine = engine();
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || engine.deliver(&CONNECT_ACK));

        assert!(engine.is_idle());
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("no command in flight"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_executes_share_the_slot() {
        let engine = engine();
        let transport = ScriptedTransport::new(
            engine.clone(),
            vec![
                Reply::Later(
                    Duration::from_millis(100),
                    vec![frame(0xE5, 0x01), frame(0xE6, 0x01), frame(0xE7, 0x01)],
                ),
                Reply::Notify(vec![CONNECT_ACK.to_vec()]),
            ],
        );

        let (workout, connect) = tokio::join!(
            engine.execute(&transport, WorkoutCommand::new(true)),
            engine.execute(&transport, ConnectCommand),
        );

        assert_eq!(assert_ok!(workout).second, 0x01);
        assert!(assert_ok!(connect));
        assert!(engine.is_idle());

        let writes = transport.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][1], 0xD5);
        assert_eq!(writes[1][1], 0xD0);
    }

    struct CountingSilence {
        engine: Arc<CommandEngine>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingSilence {
        async fn write(&self, _data: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.engine.cancel();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_command() {
        let engine = engine();
        let transport = CountingSilence {
            engine: engine.clone(),
            calls: AtomicUsize::new(0),
        };

        let result = engine.execute(&transport, WorkoutCommand::new(false)).await;
        assert!(matches!(result, Err(BikeError::Cancelled)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn test_workout_exchange_decodes_telemetry() {
        let engine = engine();
        let transport = ScriptedTransport::new(engine.clone(), vec![workout_reply(0x00)]);

        let telemetry = engine
            .execute(&transport, WorkoutCommand::new(true))
            .await
            .unwrap();
        assert_eq!(telemetry.rpm, 0);
        assert!(telemetry.is_paused());
        assert_eq!(transport.writes.lock().unwrap()[0][3], 0x01);
    }
}
