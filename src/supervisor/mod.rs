//! Supervisor
//!
//! Owns the retry loop around discovery and bridge sessions. A supervisor is
//! started with a [`BridgeConfig`] and runs until it is stopped, exhausts its
//! attempt limit or hits an error that retrying cannot fix.
//!
//! ```text
//! scan -> session -> (failed) -> backoff -> scan -> ...
//!   |                                  |
//!   +---- NotFound / Unavailable ------+
//! ```

use core::fmt;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::ble::{BleCentral, DeviceDescriptor};
use crate::bridge::session::stop_requested;
use crate::bridge::{BridgeSession, Direction, SessionMonitor, SessionOutcome, SessionState};
use crate::config::BridgeConfig;
use crate::discovery::DiscoveryResolver;
use crate::error::{BridgeError, Result};
use crate::serial::SerialBackend;

pub mod backoff;
pub mod events;

pub use backoff::Backoff;
pub use events::BridgeEvent;

const EVENT_CAPACITY: usize = 64;

/// Why the supervisor loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorExit {
    /// Stop was requested
    Stopped,
    /// The attempt limit was reached; `attempts` consecutive attempts failed
    Exhausted { attempts: u32, last_error: BridgeError },
    /// An error retrying cannot fix
    Fatal(BridgeError),
}

impl SupervisorExit {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for SupervisorExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "gave up after {} consecutive failures: {}",
                attempts, last_error
            ),
            Self::Fatal(error) => write!(f, "fatal error: {}", error),
        }
    }
}

/// Snapshot of the supervisor's progress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeStatus {
    /// Attempts started so far
    pub attempts: u32,
    /// Failures since the last session that reached Active
    pub consecutive_failures: u32,
    /// Device of the current or most recent session
    pub device: Option<DeviceDescriptor>,
    /// State of the current or most recent session
    pub session_state: Option<SessionState>,
    pub last_error: Option<BridgeError>,
    pub ble_to_serial_bytes: u64,
    pub serial_to_ble_bytes: u64,
    /// The loop has exited
    pub finished: bool,
}

#[derive(Default)]
struct Shared {
    status: Mutex<BridgeStatus>,
    session: Mutex<Option<SessionMonitor>>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut BridgeStatus)) {
        if let Ok(mut status) = self.status.lock() {
            f(&mut status);
        }
    }

    fn snapshot(&self) -> BridgeStatus {
        let mut status = self
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();

        if let Some(monitor) = self.session.lock().ok().and_then(|m| m.clone()) {
            status.session_state = Some(monitor.state());
            status.ble_to_serial_bytes = monitor.bytes_relayed(Direction::BleToSerial);
            status.serial_to_ble_bytes = monitor.bytes_relayed(Direction::SerialToBle);
        }
        status
    }
}

/// Entry point: builds bridges on top of a BLE central and a serial backend
pub struct Supervisor {
    central: Arc<dyn BleCentral>,
    serial: Arc<dyn SerialBackend>,
    events: broadcast::Sender<BridgeEvent>,
}

impl Supervisor {
    pub fn new(central: Arc<dyn BleCentral>, serial: Arc<dyn SerialBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            central,
            serial,
            events,
        }
    }

    /// Receive every event from bridges started after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Validate `config` and spawn the retry loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, config: BridgeConfig) -> Result<SupervisorHandle> {
        config.validate()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        let shared = Arc::new(Shared::default());

        let retry_loop = RetryLoop {
            config: Arc::new(config),
            central: self.central.clone(),
            serial: self.serial.clone(),
            events: self.events.clone(),
            shared: shared.clone(),
            exit: exit_tx,
        };
        let task = tokio::spawn(retry_loop.run(stop_rx));

        Ok(SupervisorHandle {
            stop: stop_tx,
            exit: exit_rx,
            task,
            shared,
            events: self.events.clone(),
        })
    }
}

/// Control handle for a running supervisor
///
/// Dropping the handle requests a stop without waiting for it.
pub struct SupervisorHandle {
    stop: watch::Sender<bool>,
    exit: watch::Receiver<Option<SupervisorExit>>,
    task: JoinHandle<SupervisorExit>,
    shared: Arc<Shared>,
    events: broadcast::Sender<BridgeEvent>,
}

impl SupervisorHandle {
    /// Ask the loop to stop without waiting.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop and wait until the running session has closed both transports.
    pub async fn stop(self) -> SupervisorExit {
        self.request_stop();
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => SupervisorExit::Fatal(BridgeError::TransportClosed(format!(
                "supervisor task failed: {e}"
            ))),
        }
    }

    /// Wait for the loop to end on its own (exhausted, fatal or stopped elsewhere).
    pub async fn wait(&self) -> SupervisorExit {
        let mut exit = self.exit.clone();
        let result = match exit.wait_for(Option::is_some).await {
            Ok(exit) => Option::clone(&exit),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            SupervisorExit::Fatal(BridgeError::TransportClosed(
                "supervisor task ended without reporting".into(),
            ))
        })
    }

    pub fn status(&self) -> BridgeStatus {
        self.shared.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct RetryLoop {
    config: Arc<BridgeConfig>,
    central: Arc<dyn BleCentral>,
    serial: Arc<dyn SerialBackend>,
    events: broadcast::Sender<BridgeEvent>,
    shared: Arc<Shared>,
    exit: watch::Sender<Option<SupervisorExit>>,
}

impl RetryLoop {
    async fn run(self, mut stop: watch::Receiver<bool>) -> SupervisorExit {
        let resolver = DiscoveryResolver::new(self.central.clone());
        let mut backoff = Backoff::new(&self.config.retry);
        let mut attempt = 0u32;
        let mut failures = 0u32;

        let exit = loop {
            if *stop.borrow() {
                break SupervisorExit::Stopped;
            }

            attempt += 1;
            self.shared.update(|s| s.attempts = attempt);
            self.emit(BridgeEvent::AttemptStarted { attempt });

            let found = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    let _ = self.central.stop_scan().await;
                    break SupervisorExit::Stopped;
                }
                found = resolver.find(&self.config.name_filter, self.config.scan_timeout) => found,
            };

            let error = match found {
                Err(error) => error,
                Ok(device) => {
                    self.shared.update(|s| s.device = Some(device.clone()));
                    self.emit(BridgeEvent::DeviceFound {
                        attempt,
                        device: device.clone(),
                    });

                    match self.run_session(attempt, device, &stop, &mut failures, &mut backoff).await {
                        SessionOutcome::Stopped => break SupervisorExit::Stopped,
                        SessionOutcome::Failed { error, was_active } => {
                            if was_active {
                                failures = 0;
                                backoff.reset();
                            }
                            error
                        }
                    }
                }
            };

            failures += 1;
            self.shared.update(|s| {
                s.consecutive_failures = failures;
                s.last_error = Some(error.clone());
            });
            self.emit(BridgeEvent::AttemptFailed {
                attempt,
                error: error.clone(),
            });

            if !error.is_retryable() {
                break SupervisorExit::Fatal(error);
            }
            if !self.config.retry.max_attempts.allows_retry(failures) {
                break SupervisorExit::Exhausted {
                    attempts: failures,
                    last_error: error,
                };
            }

            let delay = backoff.next_delay();
            self.emit(BridgeEvent::RetryScheduled { failures, delay });
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break SupervisorExit::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        debug!("Supervisor: {}", exit);
        self.shared.update(|s| s.finished = true);
        self.emit(BridgeEvent::Finished(exit.clone()));
        self.exit.send_replace(Some(exit.clone()));
        exit
    }

    /// Run one session, resetting the failure count as soon as it reaches Active.
    async fn run_session(
        &self,
        attempt: u32,
        device: DeviceDescriptor,
        stop: &watch::Receiver<bool>,
        failures: &mut u32,
        backoff: &mut Backoff,
    ) -> SessionOutcome {
        let session = BridgeSession::new(
            attempt,
            self.config.clone(),
            self.central.clone(),
            self.serial.clone(),
        )
        .with_events(self.events.clone());

        let monitor = session.monitor();
        let mut state = monitor.watch_state();
        if let Ok(mut current) = self.shared.session.lock() {
            *current = Some(monitor);
        }

        let run = session.run(device, stop.clone());
        tokio::pin!(run);

        let activated = async {
            if state.wait_for(|s| *s == SessionState::Active).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            outcome = &mut run => outcome,
            _ = activated => {
                *failures = 0;
                backoff.reset();
                self.shared.update(|s| s.consecutive_failures = 0);
                run.await
            }
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }
}
