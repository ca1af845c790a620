//! Single-slot rendezvous between the platform event thread and the caller.
//!
//! The caller arms the slot with the result codes it cares about *before*
//! issuing the platform request, then blocks on the returned [`Pending`].
//! The event thread posts results; only armed codes (and disconnects) are
//! accepted, everything else is dropped on the floor.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::BleError;
use super::platform::Peripheral;

/// Waitable outcome kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Synthesized when a wait elapses and the caller accepted it.
    Timeout,
    PoweredOn,
    Connected,
    Disconnected,
    ServicesDiscovered,
    NotifyStateChanged,
    WriteCompleted,
    DeviceDiscovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalData {
    None,
    Peripheral(Peripheral),
    Error(String),
}

/// A posted result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub code: ResultCode,
    pub success: bool,
    pub data: SignalData,
}

impl Signal {
    pub fn ok(code: ResultCode) -> Self {
        Self {
            code,
            success: true,
            data: SignalData::None,
        }
    }

    pub fn failed(code: ResultCode, error: Option<String>) -> Self {
        Self {
            code,
            success: false,
            data: error.map_or(SignalData::None, SignalData::Error),
        }
    }

    pub fn from_error(code: ResultCode, error: Option<String>) -> Self {
        match error {
            None => Self::ok(code),
            Some(e) => Self::failed(code, Some(e)),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.data {
            SignalData::Error(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Slot {
    armed: Vec<ResultCode>,
    generation: u64,
    result: Option<Signal>,
}

#[derive(Default)]
pub struct Rendezvous {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register interest in `codes`. Replaces any previous registration.
    pub fn arm(&self, codes: &[ResultCode], waiter: &str) -> Pending<'_> {
        let mut slot = self.lock();
        slot.generation = slot.generation.wrapping_add(1);
        slot.armed = codes.to_vec();
        slot.result = None;
        Pending {
            rendezvous: self,
            codes: codes.to_vec(),
            waiter: waiter.to_string(),
            generation: slot.generation,
            done: false,
        }
    }

    /// Deliver a result. Returns whether a waiter accepted it.
    ///
    /// A disconnect is accepted by any armed waiter and overrides a result
    /// that has not been collected yet.
    pub fn post(&self, signal: Signal) -> bool {
        let mut slot = self.lock();
        if slot.armed.is_empty() {
            return false;
        }
        let is_disconnect = signal.code == ResultCode::Disconnected;
        if !is_disconnect && !slot.armed.contains(&signal.code) {
            return false;
        }
        if slot.result.is_some() && !is_disconnect {
            return false;
        }
        slot.result = Some(signal);
        self.cond.notify_all();
        true
    }

    pub fn is_armed(&self) -> bool {
        !self.lock().armed.is_empty()
    }
}

/// An armed wait.
pub struct Pending<'a> {
    rendezvous: &'a Rendezvous,
    codes: Vec<ResultCode>,
    waiter: String,
    generation: u64,
    done: bool,
}

impl Pending<'_> {
    /// Block until a matching result arrives or `timeout` elapses.
    pub fn wait(mut self, timeout: Duration) -> Result<Signal, BleError> {
        let rendezvous = self.rendezvous;
        let deadline = Instant::now() + timeout;
        let mut slot = rendezvous.lock();
        loop {
            if slot.generation != self.generation {
                // Re-armed underneath us; only one waiter is supported.
                self.done = true;
                return Err(BleError::Other(format!(
                    "{}: wait superseded by another caller",
                    self.waiter
                )));
            }
            if let Some(signal) = slot.result.take() {
                slot.armed.clear();
                self.done = true;
                if signal.code == ResultCode::Disconnected
                    && !self.codes.contains(&ResultCode::Disconnected)
                {
                    return Err(BleError::Disconnected {
                        waiter: self.waiter.clone(),
                    });
                }
                return Ok(signal);
            }
            let now = Instant::now();
            if now >= deadline {
                slot.armed.clear();
                self.done = true;
                if self.codes.contains(&ResultCode::Timeout) {
                    return Ok(Signal::ok(ResultCode::Timeout));
                }
                return Err(BleError::Timeout {
                    waiter: self.waiter.clone(),
                });
            }
            slot = match rendezvous.cond.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Abandoned before waiting (the platform request itself failed).
        let mut slot = self.rendezvous.lock();
        if slot.generation == self.generation {
            slot.armed.clear();
            slot.result = None;
        }
    }
}
