use std::{fmt, sync::Arc};

/// Power state as reported by the display
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PowerStatus {
    On,
    Off,
    Unknown,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BusAlert {
    /// The adapter went away. The link has to be closed and opened again.
    ConnectionLost,
}

/// Called by the bus link from whatever thread noticed the alert
pub type AlertHandler = Arc<dyn Fn(BusAlert) + Send + Sync>;

/// Where a device sits on the bus
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LogicalAddress(pub u8);

impl LogicalAddress {
    pub const TV: Self = Self(0);
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// A connection to a device-control bus which can switch a display on and off
pub trait BusLink: Send {
    /// Lists adapters which can be passed to [`BusLink::open`]
    fn discover(&mut self) -> anyhow::Result<Vec<String>>;
    fn open(&mut self, address: &str, alerts: AlertHandler) -> anyhow::Result<()>;
    fn close(&mut self);
    fn power_on(&mut self, device: LogicalAddress) -> anyhow::Result<()>;
    fn standby(&mut self, device: LogicalAddress) -> anyhow::Result<()>;
    fn query_power_status(&mut self, device: LogicalAddress) -> PowerStatus;
}
