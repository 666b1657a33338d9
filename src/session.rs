//! Session orchestration.
//!
//! Owns the lifecycle of firmware update sessions: one worker thread per
//! target device, ordered observer delivery, cooperative cancellation and
//! an exactly-once completion contract. At most one session may be active
//! per device address; independent devices update fully in parallel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use serde::Serialize;

use crate::error::{DfuError, DfuResult};
use crate::events::LogLevel;
use crate::package::FirmwarePackage;
use crate::progress::ProgressSample;
use crate::protocol::{DfuProtocol, DfuState, ProtocolEvent};
use crate::target::DeviceTarget;
use crate::transport::DfuTransport;

/// Observer of a session's state, progress and errors.
///
/// Callbacks are invoked from the session's worker thread in transition
/// order. After a terminal state (`Completed`, `Aborted`, `Failed`) has
/// been delivered, no further callbacks fire for that session.
pub trait DfuObserver: Send + Sync {
    fn on_state_changed(&self, state: DfuState, device_address: &str) {
        let _ = (state, device_address);
    }

    fn on_progress(&self, sample: &ProgressSample, device_address: &str) {
        let _ = (sample, device_address);
    }

    /// Called once, before the terminal `Failed` state, when a session
    /// ends in error. Cancellation is not reported here.
    fn on_error(&self, error: &DfuError, device_address: &str) {
        let _ = (error, device_address);
    }

    fn on_log(&self, level: LogLevel, message: &str, device_address: &str) {
        let _ = (level, message, device_address);
    }
}

/// Successful session outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuCompletion {
    pub device_address: String,
}

/// Handle to a running session.
///
/// Dropping the handle does not stop the session; `cancel` does.
pub struct SessionHandle {
    device_address: String,
    cancel: Arc<AtomicBool>,
    outcome: mpsc::Receiver<DfuResult<DfuCompletion>>,
}

impl SessionHandle {
    /// Address of the device this session updates.
    pub fn device_address(&self) -> &str {
        &self.device_address
    }

    /// Request a cooperative abort.
    ///
    /// The in-flight protocol step completes first; the session then
    /// transitions to `Aborted` at its next checkpoint. Idempotent:
    /// calling this twice is the same as calling it once.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Block until the session reaches a terminal state.
    ///
    /// Resolves exactly once: `Ok` only when the session completed,
    /// `Err(Cancelled)` after an abort, and the underlying error after a
    /// failure. Consumes the handle.
    pub fn wait(self) -> DfuResult<DfuCompletion> {
        self.outcome
            .recv()
            .map_err(|_| DfuError::DeviceDisconnected {
                operation: "session worker".to_string(),
            })?
    }
}

/// Starts sessions and enforces the one-session-per-device rule.
#[derive(Default)]
pub struct SessionController {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session is currently running against `address`.
    pub fn is_active(&self, address: &str) -> bool {
        self.active
            .lock()
            .expect("session registry poisoned")
            .contains(address)
    }

    /// Start a firmware update session.
    ///
    /// Fails fast - before any observer event - when the device cannot be
    /// reached or another session already owns the target. On success the
    /// transfer runs on its own worker thread; the returned handle is the
    /// only way to cancel it or collect its outcome.
    pub fn start<T: DfuTransport + 'static>(
        &self,
        transport: T,
        target: DeviceTarget,
        package: FirmwarePackage,
        observer: Arc<dyn DfuObserver>,
    ) -> DfuResult<SessionHandle> {
        if !transport.is_connected() {
            return Err(DfuError::DeviceNotFound {
                address: target.address.clone(),
            });
        }

        {
            let mut active = self.active.lock().expect("session registry poisoned");
            if !active.insert(target.address.clone()) {
                return Err(DfuError::SessionAlreadyActive {
                    address: target.address.clone(),
                });
            }
        }

        let address = target.address.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = mpsc::channel();

        let worker_cancel = Arc::clone(&cancel);
        let registry = Arc::clone(&self.active);
        let worker_address = address.clone();

        thread::Builder::new()
            .name(format!("dfu-{}", address))
            .spawn(move || {
                let emit_address = worker_address.clone();
                let emit_observer = Arc::clone(&observer);
                let emit = move |event: ProtocolEvent| match event {
                    ProtocolEvent::StateChanged(state) => {
                        emit_observer.on_state_changed(state, &emit_address);
                    }
                    ProtocolEvent::Progress(sample) => {
                        emit_observer.on_progress(&sample, &emit_address);
                    }
                    ProtocolEvent::Log(level, message) => {
                        emit_observer.on_log(level, &message, &emit_address);
                    }
                };

                let protocol =
                    DfuProtocol::new(transport, target, package, worker_cancel, emit);
                let result = protocol.run();

                let outcome = match result {
                    Ok(()) => Ok(DfuCompletion {
                        device_address: worker_address.clone(),
                    }),
                    Err(DfuError::Cancelled) => {
                        observer.on_state_changed(DfuState::Aborted, &worker_address);
                        Err(DfuError::Cancelled)
                    }
                    Err(error) => {
                        observer.on_error(&error, &worker_address);
                        observer.on_state_changed(DfuState::Failed, &worker_address);
                        Err(error)
                    }
                };

                registry
                    .lock()
                    .expect("session registry poisoned")
                    .remove(&worker_address);
                let _ = outcome_tx.send(outcome);
            })
            .map_err(|_| {
                // The thread never started; release the target.
                self.active
                    .lock()
                    .expect("session registry poisoned")
                    .remove(&address);
                DfuError::TransportUnavailable
            })?;

        Ok(SessionHandle {
            device_address: address,
            cancel,
            outcome: outcome_rx,
        })
    }
}
