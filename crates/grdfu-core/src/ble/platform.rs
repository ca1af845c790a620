//! Platform BLE stack abstraction.
//!
//! A platform issues requests and reports every outcome later as a
//! [`BleEvent`] delivered to the attached [`BleEventHandler`], possibly on a
//! thread of its own. Requests return only immediate failures (the request
//! could not even be issued).

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::BleError;

/// An advertising device as seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peripheral {
    /// Platform-specific identifier.
    pub id: String,
    pub name: Option<String>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
        }
    }
}

impl fmt::Display for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} [{}]", name, self.id),
            None => write!(f, "<unnamed> [{}]", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Asynchronous outcomes reported by a platform.
#[derive(Debug, Clone)]
pub enum BleEvent {
    PowerStateChanged {
        powered_on: bool,
    },
    DeviceDiscovered {
        peripheral: Peripheral,
        rssi: i16,
    },
    Connected,
    ConnectFailed {
        reason: Option<String>,
    },
    Disconnected {
        error: Option<String>,
    },
    /// `count` services found; one `CharacteristicsDiscovered` follows each.
    ServicesDiscovered {
        count: usize,
        error: Option<String>,
    },
    /// One `DescriptorsDiscovered` follows each characteristic.
    CharacteristicsDiscovered {
        service: Uuid,
        count: usize,
        error: Option<String>,
    },
    DescriptorsDiscovered {
        characteristic: Uuid,
        error: Option<String>,
    },
    NotificationStateChanged {
        characteristic: Uuid,
        enabled: bool,
        error: Option<String>,
    },
    ValueUpdated {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteCompleted {
        characteristic: Uuid,
        error: Option<String>,
    },
    /// Local queue has room for another write-without-response.
    ReadyToSendWithoutResponse,
}

pub trait BleEventHandler: Send + Sync {
    fn handle(&self, event: BleEvent);
}

/// Callback-driven BLE central.
pub trait BlePlatform: Send + Sync {
    /// Install the event handler. Replaces any previous one.
    fn attach(&self, handler: Arc<dyn BleEventHandler>);

    fn is_powered_on(&self) -> bool;

    fn start_scan(&self) -> Result<(), BleError>;

    fn stop_scan(&self);

    fn connect(&self, peripheral: &Peripheral) -> Result<(), BleError>;

    /// Tear down (or abort) the link to `peripheral`.
    fn cancel_connection(&self, peripheral: &Peripheral) -> Result<(), BleError>;

    fn is_connected(&self) -> bool;

    fn discover_services(&self) -> Result<(), BleError>;

    /// Services found by the last discovery.
    fn services(&self) -> Vec<Service>;

    fn set_notify(&self, characteristic: &Characteristic, enabled: bool) -> Result<(), BleError>;

    fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError>;

    /// ATT MTU of the current link.
    fn mtu(&self) -> usize;
}
