use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    bus::{AlertHandler, BusAlert, BusLink, LogicalAddress, PowerStatus},
    config::{SETTLE_DELAY, STANDBY_DURATION, WAKEUP_INTERVAL, WAKEUP_PROBE_DELAY},
};

/// The scheduler re-checks at least this often, even with nothing due
const MAX_WAIT: Duration = Duration::from_secs(60);
/// Longer durations are treated as never
const FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + duration`, saturating instead of panicking on huge durations
fn after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration.min(FOREVER)).unwrap_or(now + MAX_WAIT)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// No motion for this long puts the display in standby
    pub standby_duration: Duration,
    /// How long the display has to be off before it gets woken to check on it
    pub wakeup_interval: Duration,
    /// How long a wakeup keeps the display on
    pub wakeup_probe_delay: Duration,
    /// Wait between a power command and asking the display what it did
    pub settle_delay: Duration,
    /// `None` opens the first adapter found
    pub device_address: Option<String>,
    pub display: LogicalAddress,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            standby_duration: STANDBY_DURATION,
            wakeup_interval: WAKEUP_INTERVAL,
            wakeup_probe_delay: WAKEUP_PROBE_DELAY,
            settle_delay: SETTLE_DELAY,
            device_address: None,
            display: LogicalAddress::TV,
        }
    }
}

/// What we last found out about the display. It can be changed by other remotes without us knowing.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PowerState {
    Unknown,
    On,
    Off,
}

impl From<PowerStatus> for PowerState {
    fn from(status: PowerStatus) -> Self {
        match status {
            PowerStatus::On => Self::On,
            PowerStatus::Off => Self::Off,
            PowerStatus::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    pub believed: PowerState,
    pub standby_deadline: Instant,
    pub last_on_time: Instant,
    pub failed: bool,
}

struct State {
    believed: PowerState,
    standby_deadline: Instant,
    last_on_time: Instant,
    /// Once set the bus is never used again
    failed: bool,
    alerts: VecDeque<BusAlert>,
}

enum Task {
    /// Holds the deadline that was current when the standby was decided on
    Standby { armed: Instant },
    Probe,
}

impl State {
    fn new(config: &SchedulerConfig, now: Instant) -> Self {
        Self {
            believed: PowerState::Unknown,
            standby_deadline: after(now, config.standby_duration),
            last_on_time: now,
            failed: false,
            alerts: VecDeque::new(),
        }
    }

    fn probe_due(&self, config: &SchedulerConfig) -> Option<Instant> {
        // The interval has to be exceeded, not just reached
        let interval = config.wakeup_interval.saturating_add(Duration::from_nanos(1));
        (self.believed == PowerState::Off).then(|| after(self.last_on_time, interval))
    }

    fn next_wake(&self, config: &SchedulerConfig, now: Instant) -> Instant {
        let wake_at = self.standby_deadline.min(now + MAX_WAIT);
        match self.probe_due(config) {
            Some(probe_due) => wake_at.min(probe_due),
            None => wake_at,
        }
    }

    fn next_task(&mut self, config: &SchedulerConfig, now: Instant) -> Option<Task> {
        if now >= self.standby_deadline {
            // Re-armed even if the display is already off, so this doesn't fire again right away
            self.standby_deadline = after(now, config.standby_duration);
            (self.believed == PowerState::On).then_some(Task::Standby {
                armed: self.standby_deadline,
            })
        } else if self.probe_due(config).is_some_and(|due| now >= due) {
            Some(Task::Probe)
        } else {
            None
        }
    }
}

struct Link {
    bus: Box<dyn BusLink>,
    /// The adapter that was opened, used again to reconnect
    address: String,
}

/// `link` is always locked before `state`, and `state` is never held during a bus call.
/// Everything the scheduler reacts to lives in `state` and is signalled through `wake`.
struct Shared {
    config: SchedulerConfig,
    link: Mutex<Link>,
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn alert_handler(self: &Arc<Self>) -> AlertHandler {
        let shared: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |alert: BusAlert| {
            if let Some(shared) = shared.upgrade() {
                shared.push_alert(alert);
            }
        })
    }

    fn push_alert(&self, alert: BusAlert) {
        let mut state = self.state.lock();
        if state.failed || state.alerts.contains(&alert) {
            return;
        }
        state.alerts.push_back(alert);
        self.wake.notify_all();
    }

    fn fail(&self) {
        let mut state = self.state.lock();
        if !state.failed {
            state.failed = true;
            self.wake.notify_all();
        }
    }

    /// Waits out the settle delay. Returns `false` if the controller failed meanwhile.
    fn settle(&self) -> bool {
        let end = after(Instant::now(), self.config.settle_delay);
        let mut state = self.state.lock();
        while !state.failed {
            if self.wake.wait_until(&mut state, end).timed_out() {
                break;
            }
        }
        !state.failed
    }

    fn connect(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut link = self.link.lock();
        let address = match &self.config.device_address {
            Some(address) => address.clone(),
            None => {
                let adapters = link
                    .bus
                    .discover()
                    .context("Error looking for bus adapters")?;
                info!("Adapters found: {adapters:?}");
                adapters
                    .into_iter()
                    .next()
                    .ok_or(anyhow!("No bus adapters found"))?
            }
        };
        link.bus
            .open(&address, self.alert_handler())
            .with_context(|| format!("Could not open adapter {address:?}"))?;
        info!("Opened adapter {address:?}");
        link.address = address;
        Ok(())
    }

    fn handle_alert(self: &Arc<Self>, alert: BusAlert) {
        match alert {
            BusAlert::ConnectionLost => {
                warn!("Connection lost, trying to reconnect");
                let mut link = self.link.lock();
                link.bus.close();
                let address = link.address.clone();
                match link.bus.open(&address, self.alert_handler()) {
                    Ok(()) => info!("Reconnected to {address:?}"),
                    Err(e) => {
                        error!("Failed to reconnect to {address:?}: {e:#}");
                        self.fail();
                    }
                }
            }
        }
    }

    fn standby(&self, armed: Instant) {
        let mut link = self.link.lock();
        {
            let state = self.state.lock();
            // Motion came in while we were deciding
            if state.failed || state.believed != PowerState::On || state.standby_deadline != armed
            {
                return;
            }
        }
        info!("No motion for {:?}, putting display in standby", self.config.standby_duration);
        match link.bus.standby(self.config.display) {
            Ok(()) => {
                self.state.lock().believed = PowerState::Off;
                info!("Display Power: {:?}", PowerState::Off);
            }
            Err(e) => warn!("Error putting display in standby: {e:#}"),
        }
    }

    fn probe(&self) {
        let mut link = self.link.lock();
        {
            let state = self.state.lock();
            if state.failed || state.believed != PowerState::Off {
                return;
            }
        }
        info!("Waking display to check if it is really off");
        if let Err(e) = link.bus.power_on(self.config.display) {
            warn!("Error waking display: {e:#}");
        }
        if !self.settle() {
            return;
        }
        let status = link.bus.query_power_status(self.config.display);
        let now = Instant::now();
        let mut state = self.state.lock();
        state.believed = status.into();
        state.last_on_time = now;
        state.standby_deadline = after(now, self.config.wakeup_probe_delay);
        info!("Display Power after wakeup: {:?}", state.believed);
    }

    fn run_scheduler(self: Arc<Self>) {
        info!("Power scheduler started");
        loop {
            let mut state = self.state.lock();
            while !state.failed && state.alerts.is_empty() {
                let now = Instant::now();
                let wake_at = state.next_wake(&self.config, now);
                if now >= wake_at {
                    break;
                }
                self.wake.wait_until(&mut state, wake_at);
            }
            if state.failed {
                break;
            }
            if let Some(alert) = state.alerts.pop_front() {
                drop(state);
                self.handle_alert(alert);
                continue;
            }
            let task = state.next_task(&self.config, Instant::now());
            drop(state);
            match task {
                Some(Task::Standby { armed }) => self.standby(armed),
                Some(Task::Probe) => self.probe(),
                None => {}
            }
        }
        info!("Power scheduler stopped");
    }
}

/// Turns a display on and off over a [`BusLink`].
///
/// Dropping the controller stops the scheduler thread and closes the bus.
pub struct PowerController {
    shared: Arc<Shared>,
    scheduler: Option<JoinHandle<()>>,
}

impl PowerController {
    /// Opens the bus and starts the scheduler thread.
    ///
    /// Fails if there is no adapter or it can't be opened.
    pub fn new(config: SchedulerConfig, bus: impl BusLink + 'static) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            link: Mutex::new(Link {
                bus: Box::new(bus),
                address: String::new(),
            }),
            state: Mutex::new(State::new(&config, Instant::now())),
            wake: Condvar::new(),
            config,
        });
        if let Err(e) = shared.connect() {
            shared.fail();
            return Err(e);
        }
        let scheduler = thread::Builder::new()
            .name("power-scheduler".into())
            .spawn({
                let shared = shared.clone();
                move || shared.run_scheduler()
            });
        match scheduler {
            Ok(scheduler) => Ok(Self {
                shared,
                scheduler: Some(scheduler),
            }),
            Err(e) => {
                shared.fail();
                shared.link.lock().bus.close();
                Err(e).context("Error starting power scheduler")
            }
        }
    }

    /// Makes sure the display is on and restarts the standby countdown.
    ///
    /// Blocks for the settle delay when the display isn't already believed to be on.
    pub fn power_on(&self) -> PowerState {
        let shared = &self.shared;
        let mut link = shared.link.lock();
        let believed = {
            let state = shared.state.lock();
            if state.failed {
                return state.believed;
            }
            state.believed
        };
        if believed != PowerState::On {
            info!("Turning display on");
            if let Err(e) = link.bus.power_on(shared.config.display) {
                warn!("Error turning display on: {e:#}");
            }
            if !shared.settle() {
                return shared.state.lock().believed;
            }
            let status = link.bus.query_power_status(shared.config.display);
            shared.state.lock().believed = status.into();
            info!("Display Power: {:?}", PowerState::from(status));
        }
        drop(link);
        let mut state = shared.state.lock();
        if state.believed == PowerState::On {
            let now = Instant::now();
            state.standby_deadline = after(now, shared.config.standby_duration);
            state.last_on_time = now;
            shared.wake.notify_all();
        }
        state.believed
    }

    /// `true` once the bus is gone for good. The controller has to be recreated after that.
    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failed
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.shared.state.lock();
        ControllerStatus {
            believed: state.believed,
            standby_deadline: state.standby_deadline,
            last_on_time: state.last_on_time,
            failed: state.failed,
        }
    }

    #[cfg(test)]
    fn is_scheduler_running(&self) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(|scheduler| !scheduler.is_finished())
    }
}

impl Drop for PowerController {
    fn drop(&mut self) {
        info!("Stopping power scheduler");
        self.shared.fail();
        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.join() {
                error!("Power scheduler panicked: {e:?}");
            }
        }
        self.shared.link.lock().bus.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_bus::{MockBus, MockBusHandle};

    fn config(standby_ms: u64, wakeup_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            standby_duration: Duration::from_millis(standby_ms),
            wakeup_interval: Duration::from_millis(wakeup_ms),
            wakeup_probe_delay: Duration::from_secs(5),
            settle_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn start(config: SchedulerConfig) -> (PowerController, MockBusHandle) {
        let (bus, handle) = MockBus::new();
        (PowerController::new(config, bus).unwrap(), handle)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let give_up = Instant::now() + Duration::from_secs(3);
        while Instant::now() < give_up {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn starts_unknown_with_first_adapter_open() {
        let (bus, handle) =
            MockBus::with_adapters(vec!["/dev/ttyACM0".into(), "/dev/ttyACM1".into()]);
        let controller = PowerController::new(config(60_000, 60_000), bus).unwrap();
        assert_eq!(handle.opened(), vec!["/dev/ttyACM0".to_string()]);
        assert_eq!(controller.status().believed, PowerState::Unknown);
        assert!(!controller.is_failed());
        assert!(controller.is_scheduler_running());
    }

    #[test]
    fn configured_address_skips_discovery() {
        let (bus, handle) = MockBus::with_adapters(vec![]);
        let controller = PowerController::new(
            SchedulerConfig {
                device_address: Some("/dev/cec1".into()),
                ..config(60_000, 60_000)
            },
            bus,
        )
        .unwrap();
        assert_eq!(handle.opened(), vec!["/dev/cec1".to_string()]);
        assert!(!controller.is_failed());
    }

    #[test]
    fn no_adapters_is_fatal() {
        let (bus, handle) = MockBus::with_adapters(vec![]);
        assert!(PowerController::new(config(60_000, 60_000), bus).is_err());
        assert!(handle.opened().is_empty());
    }

    #[test]
    fn open_failure_is_fatal() {
        let (bus, handle) = MockBus::new();
        handle.set_fail_open(true);
        assert!(PowerController::new(config(60_000, 60_000), bus).is_err());
        assert_eq!(handle.opened().len(), 1);
        assert_eq!(handle.power_ons(), 0);
    }

    #[test]
    fn power_on_twice_sends_one_command() {
        let (controller, handle) = start(config(60_000, 60_000));
        assert_eq!(controller.power_on(), PowerState::On);
        assert_eq!(controller.power_on(), PowerState::On);
        assert_eq!(handle.power_ons(), 1);
        assert_eq!(handle.queries(), 1);
        assert!(handle.display_on());
    }

    #[test]
    fn power_on_refreshes_timers_when_already_on() {
        let (controller, _handle) = start(config(60_000, 60_000));
        controller.power_on();
        let first = controller.status();
        thread::sleep(Duration::from_millis(20));
        controller.power_on();
        let second = controller.status();
        assert!(second.standby_deadline > first.standby_deadline);
        assert!(second.last_on_time > first.last_on_time);
        assert_eq!(
            second.standby_deadline - second.last_on_time,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn unknown_status_retries_power_on() {
        let (controller, handle) = start(config(60_000, 60_000));
        handle.set_hide_status(true);
        assert_eq!(controller.power_on(), PowerState::Unknown);
        assert_eq!(controller.power_on(), PowerState::Unknown);
        assert_eq!(handle.power_ons(), 2);
    }

    #[test]
    fn failed_command_still_checks_status() {
        let (controller, handle) = start(config(60_000, 60_000));
        handle.set_fail_commands(true);
        assert_eq!(controller.power_on(), PowerState::Off);
        // Someone else turned it on
        handle.set_display_on(true);
        assert_eq!(controller.power_on(), PowerState::On);
        assert_eq!(handle.queries(), 2);
    }

    #[test]
    fn standby_after_idle_timeout() {
        let (controller, handle) = start(config(150, 60_000));
        controller.power_on();
        let on_at = Instant::now();
        assert_eq!(handle.standbys(), 0);
        assert!(wait_for(|| handle.standbys() == 1));
        assert!(on_at.elapsed() >= Duration::from_millis(150));
        assert!(wait_for(|| controller.status().believed == PowerState::Off));
        // Already off, so later timeouts don't send anything
        thread::sleep(Duration::from_millis(400));
        assert_eq!(handle.standbys(), 1);
        assert!(!handle.display_on());
    }

    #[test]
    fn motion_postpones_standby() {
        let (controller, handle) = start(config(200, 60_000));
        for _ in 0..6 {
            controller.power_on();
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(handle.standbys(), 0);
        assert_eq!(handle.power_ons(), 1);
    }

    #[test]
    fn idle_timeout_without_display_on_sends_nothing() {
        let (controller, handle) = start(config(50, 60_000));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(handle.standbys(), 0);
        assert_eq!(handle.power_ons(), 0);
        assert_eq!(controller.status().believed, PowerState::Unknown);
    }

    #[test]
    fn wakeup_probe_after_interval() {
        let (controller, handle) = start(config(100, 400));
        controller.power_on();
        let on_at = controller.status().last_on_time;
        assert!(wait_for(|| controller.status().believed == PowerState::Off));
        thread::sleep((on_at + Duration::from_millis(300)).saturating_duration_since(Instant::now()));
        assert_eq!(handle.power_ons(), 1);

        assert!(wait_for(|| handle.power_ons() == 2));
        assert!(on_at.elapsed() > Duration::from_millis(400));
        assert!(wait_for(|| controller.status().believed == PowerState::On));
        let status = controller.status();
        assert_eq!(
            status.standby_deadline - status.last_on_time,
            Duration::from_secs(5)
        );

        // The short window hasn't passed and the display is on, so nothing else happens
        thread::sleep(Duration::from_millis(300));
        assert_eq!(handle.power_ons(), 2);
        assert_eq!(handle.standbys(), 1);
    }

    #[test]
    fn reconnect_keeps_state() {
        let (controller, handle) = start(config(60_000, 60_000));
        controller.power_on();
        handle.trigger_connection_lost();
        assert!(wait_for(|| handle.opened().len() == 2));
        assert_eq!(handle.closes(), 1);
        assert!(handle.is_open());
        assert!(!controller.is_failed());
        assert_eq!(controller.status().believed, PowerState::On);
        assert!(controller.is_scheduler_running());
    }

    #[test]
    fn failed_reconnect_is_permanent() {
        let (controller, handle) = start(config(60_000, 60_000));
        controller.power_on();
        handle.set_fail_open(true);
        handle.trigger_connection_lost();
        assert!(wait_for(|| controller.is_failed()));
        assert!(wait_for(|| !controller.is_scheduler_running()));

        handle.set_fail_open(false);
        handle.set_display_on(false);
        controller.power_on();
        assert_eq!(handle.power_ons(), 1);
        // Alerts after failing are ignored
        handle.trigger_connection_lost();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.opened().len(), 2);
        assert!(controller.is_failed());
    }

    #[test]
    fn drop_while_waiting_joins_scheduler() {
        let (controller, handle) = start(config(3_600_000, 3_600_000));
        controller.power_on();
        let dropped_at = Instant::now();
        drop(controller);
        assert!(dropped_at.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.closes(), 1);
        assert!(!handle.is_open());
    }

    #[test]
    fn drop_interrupts_wakeup_settle() {
        let (controller, handle) = start(SchedulerConfig {
            settle_delay: Duration::from_millis(300),
            ..config(50, 100)
        });
        controller.power_on();
        assert!(wait_for(|| handle.power_ons() == 2));
        let dropped_at = Instant::now();
        drop(controller);
        assert!(dropped_at.elapsed() < Duration::from_millis(250));
        // The wakeup never got to ask for the status
        assert_eq!(handle.queries(), 1);
    }

    #[test]
    fn concurrent_power_on_sends_one_command() {
        let (controller, handle) = start(config(60_000, 60_000));
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| assert_eq!(controller.power_on(), PowerState::On));
            }
        });
        assert_eq!(handle.power_ons(), 1);
        assert_eq!(handle.queries(), 1);
    }

    #[test]
    fn power_on_cancels_decided_standby() {
        let (controller, handle) = start(config(100, 60_000));
        controller.power_on();
        let first_deadline = controller.status().standby_deadline;

        // Keep the scheduler from reaching the bus after it decided on a standby
        let link = controller.shared.link.lock();
        assert!(wait_for(|| controller.status().standby_deadline > first_deadline));
        // What power_on does once it gets the link
        controller.shared.state.lock().standby_deadline = Instant::now() + Duration::from_secs(60);
        drop(link);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(handle.standbys(), 0);
        assert!(handle.display_on());
        assert_eq!(controller.status().believed, PowerState::On);
    }

    #[test]
    fn huge_wakeup_interval_never_probes() {
        let (controller, handle) = start(SchedulerConfig {
            wakeup_interval: Duration::MAX,
            ..config(50, 0)
        });
        controller.power_on();
        assert!(wait_for(|| controller.status().believed == PowerState::Off));
        thread::sleep(Duration::from_millis(200));
        assert!(controller.is_scheduler_running());
        assert!(!controller.is_failed());
        assert_eq!(handle.power_ons(), 1);
        assert_eq!(handle.standbys(), 1);
    }

    #[test]
    fn huge_durations_dont_panic() {
        let (controller, handle) = start(SchedulerConfig {
            standby_duration: Duration::MAX,
            wakeup_probe_delay: Duration::MAX,
            ..config(0, 0)
        });
        assert_eq!(controller.power_on(), PowerState::On);
        thread::sleep(Duration::from_millis(100));
        assert!(controller.is_scheduler_running());
        assert_eq!(handle.standbys(), 0);
        assert!(controller.status().standby_deadline > Instant::now() + Duration::from_secs(3600));
    }
}
