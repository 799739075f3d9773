use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::bus::{AlertHandler, BusAlert, BusLink, LogicalAddress, PowerStatus};

#[derive(Default)]
struct MockState {
    adapters: Vec<String>,
    /// What the simulated display is really doing
    display_on: bool,
    /// Report `Unknown` instead of the real state
    hide_status: bool,
    fail_open: bool,
    fail_commands: bool,
    is_open: bool,
    opened: Vec<String>,
    closes: usize,
    power_ons: usize,
    standbys: usize,
    queries: usize,
    alerts: Option<AlertHandler>,
}

pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

/// Inspects and scripts a [`MockBus`] after it was given away
#[derive(Clone)]
pub struct MockBusHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    /// A bus with one adapter and the display off
    pub fn new() -> (Self, MockBusHandle) {
        Self::with_adapters(vec!["/dev/mock0".into()])
    }

    pub fn with_adapters(adapters: Vec<String>) -> (Self, MockBusHandle) {
        let state = Arc::new(Mutex::new(MockState {
            adapters,
            ..Default::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            MockBusHandle { state },
        )
    }
}

impl BusLink for MockBus {
    fn discover(&mut self) -> anyhow::Result<Vec<String>> {
        Ok(self.state.lock().adapters.clone())
    }

    fn open(&mut self, address: &str, alerts: AlertHandler) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.opened.push(address.into());
        if state.fail_open {
            return Err(anyhow!("Could not open {address}"));
        }
        state.is_open = true;
        state.alerts = Some(alerts);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.is_open = false;
        state.closes += 1;
    }

    fn power_on(&mut self, _device: LogicalAddress) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.power_ons += 1;
        if state.fail_commands || !state.is_open {
            return Err(anyhow!("Power on was not acknowledged"));
        }
        state.display_on = true;
        Ok(())
    }

    fn standby(&mut self, _device: LogicalAddress) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.standbys += 1;
        if state.fail_commands || !state.is_open {
            return Err(anyhow!("Standby was not acknowledged"));
        }
        state.display_on = false;
        Ok(())
    }

    fn query_power_status(&mut self, _device: LogicalAddress) -> PowerStatus {
        let mut state = self.state.lock();
        state.queries += 1;
        match (state.hide_status || !state.is_open, state.display_on) {
            (true, _) => PowerStatus::Unknown,
            (false, true) => PowerStatus::On,
            (false, false) => PowerStatus::Off,
        }
    }
}

impl MockBusHandle {
    /// Calls the alert handler the way a real adapter would when unplugged
    pub fn trigger_connection_lost(&self) {
        // Don't hold the lock while the handler runs
        let alerts = self.state.lock().alerts.clone();
        if let Some(alerts) = alerts {
            alerts(BusAlert::ConnectionLost);
        }
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn set_fail_commands(&self, fail: bool) {
        self.state.lock().fail_commands = fail;
    }

    pub fn set_hide_status(&self, hide: bool) {
        self.state.lock().hide_status = hide;
    }

    /// Changes the display behind the controller's back, like a remote control would
    pub fn set_display_on(&self, on: bool) {
        self.state.lock().display_on = on;
    }

    pub fn display_on(&self) -> bool {
        self.state.lock().display_on
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    /// Every address passed to `open`, including failed attempts
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn power_ons(&self) -> usize {
        self.state.lock().power_ons
    }

    pub fn standbys(&self) -> usize {
        self.state.lock().standbys
    }

    pub fn queries(&self) -> usize {
        self.state.lock().queries
    }
}
