//! Bridge session
//!
//! A session wires one BLE connection to one serial port, relays bytes until
//! something breaks or a stop is requested, and tears both sides down before
//! reporting how it ended. Sessions are single use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::{broadcast, watch};

use crate::ble::{BleCentral, DeviceDescriptor};
use crate::bridge::pump::{Direction, Pump};
use crate::bridge::state::SessionState;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::serial::SerialBackend;
use crate::supervisor::BridgeEvent;
use crate::transport::{BleNotifySource, ChunkStream, SerialDuplex, Transport};

/// How a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Ended by an explicit stop
    Stopped,
    /// Ended by an error; `was_active` tells whether bytes were ever relayed
    Failed { error: BridgeError, was_active: bool },
}

struct Shared {
    state: watch::Sender<SessionState>,
    last_error: Mutex<Option<BridgeError>>,
    ble_to_serial: Arc<AtomicU64>,
    serial_to_ble: Arc<AtomicU64>,
}

/// Read-only view of a running session
#[derive(Clone)]
pub struct SessionMonitor {
    shared: Arc<Shared>,
}

impl SessionMonitor {
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn last_error(&self) -> Option<BridgeError> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Bytes accepted by the sink of `direction` so far
    pub fn bytes_relayed(&self, direction: Direction) -> u64 {
        let counter = match direction {
            Direction::BleToSerial => &self.shared.ble_to_serial,
            Direction::SerialToBle => &self.shared.serial_to_ble,
        };
        counter.load(Ordering::Relaxed)
    }
}

/// Transports opened while connecting; whatever is present gets closed on failure
#[derive(Default)]
struct Opened {
    ble: Option<BleNotifySource>,
    serial: Option<SerialDuplex>,
}

pub struct BridgeSession {
    id: u32,
    config: Arc<BridgeConfig>,
    central: Arc<dyn BleCentral>,
    serial: Arc<dyn SerialBackend>,
    shared: Arc<Shared>,
    events: Option<broadcast::Sender<BridgeEvent>>,
}

impl BridgeSession {
    pub fn new(
        id: u32,
        config: Arc<BridgeConfig>,
        central: Arc<dyn BleCentral>,
        serial: Arc<dyn SerialBackend>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id,
            config,
            central,
            serial,
            shared: Arc::new(Shared {
                state,
                last_error: Mutex::new(None),
                ble_to_serial: Arc::new(AtomicU64::new(0)),
                serial_to_ble: Arc::new(AtomicU64::new(0)),
            }),
            events: None,
        }
    }

    /// Publish state changes on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<BridgeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            shared: self.shared.clone(),
        }
    }

    /// Run the session against `device` until it fails or `stop` turns true.
    pub async fn run(self, device: DeviceDescriptor, mut stop: watch::Receiver<bool>) -> SessionOutcome {
        self.transition(SessionState::Connecting);

        let mut opened = Opened::default();
        let wired = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => Err(BridgeError::Cancelled),
            result = self.connect(&device, &mut opened) => result,
        };

        let (ble, serial) = match (wired, opened.ble, opened.serial) {
            (Ok(()), Some(ble), Some(serial)) => {
                (Arc::new(ble) as Arc<dyn Transport>, Arc::new(serial) as Arc<dyn Transport>)
            }
            (result, ble, serial) => {
                if result == Err(BridgeError::Cancelled) {
                    self.transition(SessionState::Stopping);
                }
                let ble = ble.map(|b| Arc::new(b) as Arc<dyn Transport>);
                let serial = serial.map(|s| Arc::new(s) as Arc<dyn Transport>);
                self.close_all(ble.as_deref(), serial.as_deref()).await;

                return match result {
                    Err(BridgeError::Cancelled) => self.finish_stopped(),
                    Err(error) => self.finish_failed(error, false),
                    Ok(()) => self.finish_failed(
                        BridgeError::TransportClosed("transport missing after connect".into()),
                        false,
                    ),
                };
            }
        };

        let streams = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => Err(BridgeError::Cancelled),
            result = self.open_streams(ble.as_ref(), serial.as_ref()) => result,
        };
        let (ble_stream, serial_stream) = match streams {
            Ok(streams) => streams,
            Err(BridgeError::Cancelled) => {
                self.transition(SessionState::Stopping);
                self.close_all(Some(ble.as_ref()), Some(serial.as_ref())).await;
                return self.finish_stopped();
            }
            Err(error) => {
                self.close_all(Some(ble.as_ref()), Some(serial.as_ref())).await;
                return self.finish_failed(error, false);
            }
        };

        self.transition(SessionState::Active);
        debug!(
            "Session {}: relaying {} [{}] <-> {} ({:?})",
            self.id, device.name, device.address, self.config.port_name, self.config.mode
        );

        let to_serial = Pump::new(
            Direction::BleToSerial,
            self.config.write_timeout,
            self.shared.ble_to_serial.clone(),
        )
        .run(ble_stream, serial.clone());

        let to_ble = async {
            match serial_stream {
                Some(stream) => {
                    Pump::new(
                        Direction::SerialToBle,
                        self.config.write_timeout,
                        self.shared.serial_to_ble.clone(),
                    )
                    .run(stream, ble.clone())
                    .await
                }
                None => std::future::pending().await,
            }
        };

        // The first branch to finish drops the other, cancelling both pumps
        let failure = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => None,
            error = to_serial => Some(error),
            error = to_ble => Some(error),
        };

        match failure {
            None => {
                self.transition(SessionState::Stopping);
                self.close_all(Some(ble.as_ref()), Some(serial.as_ref())).await;
                self.finish_stopped()
            }
            Some(error) => {
                self.close_all(Some(ble.as_ref()), Some(serial.as_ref())).await;
                self.finish_failed(error, true)
            }
        }
    }

    /// Connect BLE and open serial concurrently, parking each transport in `opened` as it succeeds.
    async fn connect(&self, device: &DeviceDescriptor, opened: &mut Opened) -> Result<()> {
        let Opened {
            ble: ble_slot,
            serial: serial_slot,
        } = opened;
        let config = &self.config;

        let connect_ble = async {
            *ble_slot = Some(
                BleNotifySource::connect(
                    self.central.as_ref(),
                    device,
                    &config.gatt,
                    config.max_write_len,
                )
                .await?,
            );
            Ok::<(), BridgeError>(())
        };
        let open_serial = async {
            *serial_slot = Some(
                SerialDuplex::open(self.serial.as_ref(), &config.port_name, config.baud_rate)
                    .await?,
            );
            Ok::<(), BridgeError>(())
        };

        let (ble_result, serial_result) = tokio::join!(connect_ble, open_serial);
        ble_result.and(serial_result)
    }

    async fn open_streams(
        &self,
        ble: &dyn Transport,
        serial: &dyn Transport,
    ) -> Result<(ChunkStream, Option<ChunkStream>)> {
        let ble_stream = ble.read_stream().await?;
        let serial_stream = if self.config.mode.is_bidirectional() {
            Some(serial.read_stream().await?)
        } else {
            None
        };
        Ok((ble_stream, serial_stream))
    }

    /// Close whatever is open, each side bounded by the close timeout.
    async fn close_all(&self, ble: Option<&dyn Transport>, serial: Option<&dyn Transport>) {
        tokio::join!(self.close_one(ble), self.close_one(serial));
    }

    async fn close_one(&self, transport: Option<&dyn Transport>) {
        let Some(transport) = transport else {
            return;
        };
        match tokio::time::timeout(self.config.close_timeout, transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Session {}: closing {} failed: {}", self.id, transport.side(), e),
            Err(_) => warn!(
                "Session {}: closing {} timed out after {:?}",
                self.id,
                transport.side(),
                self.config.close_timeout
            ),
        }
    }

    fn finish_stopped(&self) -> SessionOutcome {
        self.transition(SessionState::Stopped);
        SessionOutcome::Stopped
    }

    fn finish_failed(&self, error: BridgeError, was_active: bool) -> SessionOutcome {
        self.record_error(&error);
        self.transition(SessionState::Failed);
        SessionOutcome::Failed { error, was_active }
    }

    fn record_error(&self, error: &BridgeError) {
        debug!("Session {}: {}", self.id, error);
        if let Ok(mut last) = self.shared.last_error.lock() {
            *last = Some(error.clone());
        }
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut from = None;
        let moved = self.shared.state.send_if_modified(|state| {
            from = Some(*state);
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if !moved {
            warn!(
                "Session {}: rejected transition {} -> {}",
                self.id,
                from.unwrap_or(next),
                next
            );
            return false;
        }

        debug!("Session {}: {}", self.id, next);
        if let Some(events) = &self.events {
            let _ = events.send(BridgeEvent::SessionState {
                session: self.id,
                state: next,
            });
        }
        true
    }
}

/// Resolves once a stop is requested or the stop sender is gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::traits::mock::MockCentral;
    use crate::config::DirectionMode;
    use crate::serial::traits::mock::MockSerialBackend;
    use crate::transport::Side;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        central: Arc<MockCentral>,
        serial: Arc<MockSerialBackend>,
        stop: watch::Sender<bool>,
        monitor: Option<SessionMonitor>,
    }

    impl Harness {
        fn new() -> Self {
            let (stop, _) = watch::channel(false);
            Self {
                central: Arc::new(MockCentral::new()),
                serial: Arc::new(MockSerialBackend::new()),
                stop,
                monitor: None,
            }
        }

        fn monitor(&self) -> &SessionMonitor {
            self.monitor.as_ref().unwrap()
        }

        fn spawn(&mut self, config: BridgeConfig) -> JoinHandle<SessionOutcome> {
            let device = self.central.advertise("ESP32S3_HELLO");
            let session = BridgeSession::new(
                1,
                Arc::new(config),
                self.central.clone(),
                self.serial.clone(),
            );
            self.monitor = Some(session.monitor());
            tokio::spawn(session.run(device, self.stop.subscribe()))
        }

        async fn wait_for_state(&self, state: SessionState) {
            let mut rx = self.monitor().watch_state();
            rx.wait_for(|s| *s == state).await.unwrap();
        }

        async fn wait_for_bytes(&self, direction: Direction, count: u64) {
            while self.monitor().bytes_relayed(direction) < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::new("ESP32S3_HELLO", "COM9");
        config.write_timeout = Duration::from_millis(200);
        config.close_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn test_notifications_reach_serial_unchanged() {
        let mut harness = Harness::new();
        let handle = harness.spawn(config());
        harness.wait_for_state(SessionState::Active).await;

        let peripheral = harness.central.last_peripheral().unwrap();
        let burst: Vec<u8> = (0..=255).collect();
        peripheral.notify(&[0x00, 0xc3]);
        peripheral.notify(&[]);
        peripheral.notify(&burst);
        peripheral.notify(b"\r\n");
        harness
            .wait_for_bytes(Direction::BleToSerial, 2 + 256 + 2)
            .await;

        harness.stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), SessionOutcome::Stopped);

        let mut expected = vec![0x00, 0xc3];
        expected.extend_from_slice(&burst);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(harness.serial.last_port().unwrap().get_tx_data(), expected);
        assert_eq!(harness.monitor().state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_bidirectional_serial_input_reaches_ble() {
        let mut harness = Harness::new();
        let mut config = config();
        config.mode = DirectionMode::Bidirectional;
        let handle = harness.spawn(config);
        harness.wait_for_state(SessionState::Active).await;

        harness.serial.last_port().unwrap().queue_rx_data(b"AT\r\n");
        harness.wait_for_bytes(Direction::SerialToBle, 4).await;

        harness.stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), SessionOutcome::Stopped);
        assert_eq!(
            harness.central.last_peripheral().unwrap().written(),
            b"AT\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_serial_input_ignored_in_ble_to_serial_mode() {
        let mut harness = Harness::new();
        let handle = harness.spawn(config());
        harness.wait_for_state(SessionState::Active).await;

        harness.serial.last_port().unwrap().queue_rx_data(b"AT\r\n");
        tokio::time::sleep(Duration::from_millis(20)).await;

        harness.stop.send(true).unwrap();
        handle.await.unwrap();
        assert!(harness.central.last_peripheral().unwrap().writes().is_empty());
        assert_eq!(harness.monitor().bytes_relayed(Direction::SerialToBle), 0);
    }

    #[tokio::test]
    async fn test_stop_mid_burst_closes_both_sides() {
        let mut harness = Harness::new();
        let handle = harness.spawn(config());
        harness.wait_for_state(SessionState::Active).await;

        let peripheral = harness.central.last_peripheral().unwrap();
        for i in 0..100u8 {
            peripheral.notify(&[i; 20]);
        }
        harness.stop.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), SessionOutcome::Stopped);
        assert!(harness.central.all_released());
        assert!(harness.serial.all_closed());
        assert_eq!(peripheral.unsubscribe_count(), 1);
        assert_eq!(peripheral.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_serial_write_fails_session() {
        let mut harness = Harness::new();
        harness.serial.block_writes();
        let handle = harness.spawn(config());
        harness.wait_for_state(SessionState::Active).await;

        let start = tokio::time::Instant::now();
        harness.central.last_peripheral().unwrap().notify(b"stuck");
        let outcome = handle.await.unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                error: BridgeError::WriteTimeout {
                    side: Side::Serial,
                    timeout: Duration::from_millis(200),
                },
                was_active: true,
            }
        );
        // Write timeout plus at most the close timeout
        assert!(start.elapsed() <= Duration::from_millis(400));

        let peripheral = harness.central.last_peripheral().unwrap();
        assert_eq!(peripheral.unsubscribe_count(), 1);
        assert_eq!(peripheral.disconnect_count(), 1);
        assert!(harness.serial.all_closed());
        assert_eq!(harness.monitor().state(), SessionState::Failed);
        assert!(matches!(
            harness.monitor().last_error(),
            Some(BridgeError::WriteTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_serial_open_failure_releases_ble() {
        let mut harness = Harness::new();
        harness
            .serial
            .fail_next_open(BridgeError::port_unavailable("COM9", "access denied"));
        let handle = harness.spawn(config());

        let outcome = handle.await.unwrap();

        match outcome {
            SessionOutcome::Failed {
                error: BridgeError::PortUnavailable { port, .. },
                was_active: false,
            } => assert_eq!(port, "COM9"),
            other => panic!("Expected PortUnavailable failure, got {:?}", other),
        }
        assert_eq!(harness.central.peripherals().len(), 1);
        assert!(harness.central.all_released());
        assert_eq!(harness.monitor().state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_serial() {
        let mut harness = Harness::new();
        harness
            .central
            .fail_next_connect(BridgeError::CharacteristicNotFound(
                crate::config::nus::TX_UUID,
            ));
        let handle = harness.spawn(config());

        let outcome = handle.await.unwrap();

        assert!(matches!(
            outcome,
            SessionOutcome::Failed {
                error: BridgeError::CharacteristicNotFound(_),
                was_active: false,
            }
        ));
        assert_eq!(harness.serial.ports().len(), 1);
        assert!(harness.serial.all_closed());
    }

    #[tokio::test]
    async fn test_serial_read_error_cancels_both_pumps() {
        let mut harness = Harness::new();
        let mut config = config();
        config.mode = DirectionMode::Bidirectional;
        let handle = harness.spawn(config);
        harness.wait_for_state(SessionState::Active).await;

        harness
            .serial
            .last_port()
            .unwrap()
            .fail_read(BridgeError::TransportClosed("serial read failed: EIO".into()));
        let outcome = handle.await.unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                error: BridgeError::TransportClosed("serial read failed: EIO".into()),
                was_active: true,
            }
        );
        // The notification subscriber went away with the other pump
        let peripheral = harness.central.last_peripheral().unwrap();
        assert!(!peripheral.notify(b"late"));
        assert_eq!(peripheral.unsubscribe_count(), 1);
        assert!(harness.central.all_released());
        assert!(harness.serial.all_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_ble_write_fails_session() {
        let mut harness = Harness::new();
        let mut config = config();
        config.mode = DirectionMode::Bidirectional;
        let handle = harness.spawn(config);
        harness.wait_for_state(SessionState::Active).await;

        let peripheral = harness.central.last_peripheral().unwrap();
        peripheral.block_writes();
        harness.serial.last_port().unwrap().queue_rx_data(b"AT\r\n");
        let outcome = handle.await.unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                error: BridgeError::WriteTimeout {
                    side: Side::Ble,
                    timeout: Duration::from_millis(200),
                },
                was_active: true,
            }
        );
        assert!(!peripheral.notify(b"late"));
        assert!(harness.central.all_released());
        assert!(harness.serial.all_closed());
        assert_eq!(harness.monitor().bytes_relayed(Direction::SerialToBle), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_both_sides() {
        let mut harness = Harness::new();
        harness
            .central
            .fail_next_subscribe(BridgeError::TransportClosed("subscribe refused".into()));
        let handle = harness.spawn(config());

        let outcome = handle.await.unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                error: BridgeError::TransportClosed("subscribe refused".into()),
                was_active: false,
            }
        );
        let peripheral = harness.central.last_peripheral().unwrap();
        assert_eq!(peripheral.unsubscribe_count(), 0);
        assert_eq!(peripheral.disconnect_count(), 1);
        assert!(harness.serial.all_closed());
        assert_eq!(harness.monitor().state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_ble_still_connecting() {
        let mut harness = Harness::new();
        harness.central.set_connect_delay(Duration::from_secs(10));
        let handle = harness.spawn(config());

        // Serial is open and the BLE link is up, but services are not resolved yet
        while harness.serial.ports().is_empty() || harness.central.peripherals().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let start = tokio::time::Instant::now();
        harness.stop.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), SessionOutcome::Stopped);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(harness.serial.all_closed());

        // The half-open link is released even though connect never returned
        let peripheral = harness.central.last_peripheral().unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while peripheral.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(peripheral.disconnect_count(), 1);
        assert_eq!(harness.monitor().state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_session() {
        let mut harness = Harness::new();
        let handle = harness.spawn(config());
        harness.wait_for_state(SessionState::Active).await;

        harness.central.last_peripheral().unwrap().drop_link();
        let outcome = handle.await.unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                error: BridgeError::TransportClosed("peripheral disconnected".into()),
                was_active: true,
            }
        );
        assert!(harness.serial.all_closed());
        assert!(harness.central.all_released());
    }

    #[tokio::test]
    async fn test_stop_before_connecting_opens_nothing() {
        let mut harness = Harness::new();
        harness.stop.send_replace(true);
        let handle = harness.spawn(config());

        assert_eq!(handle.await.unwrap(), SessionOutcome::Stopped);
        assert!(harness.central.peripherals().is_empty());
        assert!(harness.serial.ports().is_empty());
        assert_eq!(harness.monitor().state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_state_events_are_published() {
        let mut harness = Harness::new();
        let (events, mut rx) = broadcast::channel(16);
        let device = harness.central.advertise("ESP32S3_HELLO");
        let session = BridgeSession::new(
            7,
            Arc::new(config()),
            harness.central.clone(),
            harness.serial.clone(),
        )
        .with_events(events);
        harness.monitor = Some(session.monitor());
        let handle = tokio::spawn(session.run(device, harness.stop.subscribe()));

        harness.wait_for_state(SessionState::Active).await;
        harness.stop.send(true).unwrap();
        handle.await.unwrap();

        let mut states = Vec::new();
        while let Ok(BridgeEvent::SessionState { session, state }) = rx.try_recv() {
            assert_eq!(session, 7);
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::Active,
                SessionState::Stopping,
                SessionState::Stopped,
            ]
        );
    }
}
