//! Sensor scheduler.
//!
//! Heterogeneous sensors are organized into groups that share a power
//! rail, the I²C bus, or the switched UART. At every tick the
//! scheduler walks the groups in table order, starts whichever group
//! is eligible (configured, battery and comm mode in range, repeat
//! interval elapsed, shared resources free), runs its settling window,
//! then steps each sensor through its own settle/measure cycle until
//! everything reports complete and the group is powered back down.
//!
//! Chip drivers live outside the core behind [`SensorDriver`] /
//! [`GroupDriver`]; the scheduler owns all sequencing, failure
//! accounting and deconfiguration policy.

pub mod battery;

pub use battery::{
    battery_status_name, compute_soc_from_voltage, BatteryMonitor, BatteryStatus, OpMode,
};

use log::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::comm::CommModeSet;
use crate::gps::GpsStatus;
use crate::node::{UartDevice, UartMux};
use crate::storage::Storage;

/// Outcome of one measurement step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureOutcome {
    /// Still sampling; call again next pass.
    Sampling,
    /// Measurement is in; this sensor is done for the round.
    Completed,
}

/// A sensor chip driver. Default implementations make every hook
/// optional, mirroring table entries with no handler.
pub trait SensorDriver {
    /// One-time initialization at boot.
    fn init_once(&mut self) -> bool {
        true
    }

    /// Called after group power comes up.
    fn init_power(&mut self) -> bool {
        true
    }

    /// Called before group power goes down.
    fn term_power(&mut self) -> bool {
        true
    }

    /// This sensor's settling window ended.
    fn done_settling(&mut self) {}

    /// The whole group's settling window ended.
    fn done_group_settling(&mut self) {}

    /// Take (or continue) a measurement.
    fn measure(&mut self) -> MeasureOutcome {
        MeasureOutcome::Completed
    }

    /// A measurement is waiting to be uploaded.
    fn upload_needed(&self) -> bool {
        false
    }

    /// Periodic poll while this sensor's timer runs.
    fn poll(&mut self) {}
}

/// Group-level hooks.
pub trait GroupDriver {
    /// Veto this group for now.
    fn skip(&mut self) -> bool {
        false
    }

    /// The group's settling window ended.
    fn done_settling(&mut self) {}

    /// Periodic poll while the group timer runs (e.g. pumping NMEA out
    /// of a warming receiver).
    fn poll(&mut self) {}
}

/// Sensor power-rail control, implemented over GPIO on hardware.
pub trait PowerSwitch {
    fn set(&mut self, pin: u16, enable: bool);
}

/// Timer configuration for a group- or sensor-level poller.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub repeat_ms: u64,
    /// Run from init, not just while the group is active.
    pub continuously: bool,
    /// Start during the settling window rather than after it.
    pub during_settling: bool,
}

/// Battery-band to repeat-interval mapping; first matching entry wins.
#[derive(Debug, Clone, Copy)]
pub struct RepeatEntry {
    pub battery: BatteryStatus,
    pub seconds: u32,
}

/// Static configuration of a sensor group.
pub struct GroupConfig {
    pub name: &'static str,
    /// Which stored product id this group belongs to.
    pub product: u16,
    /// Power rail pin, if the group switches one.
    pub power_pin: Option<u16>,
    /// Only one power-exclusive group may be powered at a time.
    pub power_exclusive: bool,
    /// Requires sole use of the I²C bus while processing.
    pub twi_exclusive: bool,
    /// UART this group must own while processing.
    pub uart_required: Option<UartDevice>,
    /// UART this group would like, granted only when switching is
    /// allowed.
    pub uart_requested: Option<UartDevice>,
    pub settling_seconds: u32,
    /// Sample immediately at boot rather than one interval later.
    pub sense_at_boot: bool,
    pub repeat: Vec<RepeatEntry>,
    pub active_battery_status: BatteryStatus,
    pub active_comm_mode: CommModeSet,
    pub poll: Option<PollConfig>,
    /// Never run while the device operates in mobile mode.
    pub mobile_skip: bool,
}

impl GroupConfig {
    pub fn new(name: &'static str, product: u16) -> Self {
        Self {
            name,
            product,
            power_pin: None,
            power_exclusive: false,
            twi_exclusive: false,
            uart_required: None,
            uart_requested: None,
            settling_seconds: 0,
            sense_at_boot: false,
            repeat: Vec::new(),
            active_battery_status: BatteryStatus::all(),
            active_comm_mode: CommModeSet::all(),
            poll: None,
            mobile_skip: false,
        }
    }
}

/// Runtime state of a group.
#[derive(Debug, Default)]
pub struct GroupState {
    pub configured: bool,
    pub processing: bool,
    pub settling: bool,
    pub powered_on: bool,
    pub polling_valid: bool,
    pub being_tested: bool,
    pub requesting_deconfiguration: bool,
    pub last_repeated: u32,
    pub last_settled: u32,
    pub repeat_seconds_override: u32,
    timer_running: bool,
    next_poll_ms: u64,
}

/// Static configuration of one sensor.
pub struct SensorConfig {
    pub name: &'static str,
    /// Bit(s) in the stored sensors bitmap that enable this sensor.
    pub storage_sensor_mask: crate::storage::SensorMask,
    pub settling_seconds: u32,
    pub poll: Option<PollConfig>,
}

impl SensorConfig {
    pub fn new(name: &'static str, mask: crate::storage::SensorMask) -> Self {
        Self {
            name,
            storage_sensor_mask: mask,
            settling_seconds: 0,
            poll: None,
        }
    }
}

/// Runtime state of one sensor.
#[derive(Debug, Default)]
pub struct SensorState {
    pub configured: bool,
    pub processing: bool,
    pub settling: bool,
    pub completed: bool,
    pub polling_valid: bool,
    pub being_tested: bool,
    pub requesting_deconfiguration: bool,
    pub init_failures: u32,
    pub term_failures: u32,
    pub last_settled: u32,
    timer_running: bool,
    next_poll_ms: u64,
}

pub struct Sensor {
    pub config: SensorConfig,
    pub state: SensorState,
    pub driver: Box<dyn SensorDriver>,
}

impl Sensor {
    pub fn new(config: SensorConfig, driver: Box<dyn SensorDriver>) -> Self {
        Self {
            config,
            state: SensorState::default(),
            driver,
        }
    }
}

pub struct Group {
    pub config: GroupConfig,
    pub state: GroupState,
    pub sensors: Vec<Sensor>,
    pub driver: Option<Box<dyn GroupDriver>>,
}

impl Group {
    pub fn new(config: GroupConfig, sensors: Vec<Sensor>) -> Self {
        Self {
            config,
            state: GroupState::default(),
            sensors,
            driver: None,
        }
    }

    pub fn with_driver(mut self, driver: Box<dyn GroupDriver>) -> Self {
        self.driver = Some(driver);
        self
    }
}

/// What the scheduler needs from the rest of the node for one pass.
pub struct SensorCtx<'a> {
    pub clock: &'a Clock,
    pub storage: &'a Storage,
    pub uart: &'a mut UartMux,
    pub power: &'a mut dyn PowerSwitch,
    /// The supervisor's current mode, as a mask bit.
    pub comm_mode: CommModeSet,
    pub uart_switching_allowed: bool,
    pub gps_status: GpsStatus,
    pub in_motion: bool,
}

/// Pick the repeat interval for a group under the given battery band.
fn repeat_seconds(g: &Group, battery: BatteryStatus) -> u32 {
    if g.state.repeat_seconds_override != 0 {
        return g.state.repeat_seconds_override;
    }
    let mut seconds = 0;
    for entry in &g.config.repeat {
        if battery.intersects(entry.battery) {
            seconds = entry.seconds;
            break;
        }
    }
    if seconds == 0 {
        warn!(
            "{} has no repeat interval for {}",
            g.config.name,
            battery_status_name(battery)
        );
        return 3600;
    }
    // Testing runs everything at double speed.
    if battery == BatteryStatus::TEST {
        return seconds / 2;
    }
    seconds
}

/// The sensor scheduler.
pub struct SensorScheduler {
    groups: Vec<Group>,
    op_mode: OpMode,
    pub battery: BatteryMonitor,
    mobile_period: u16,
    test_mode_requested: bool,
    inside_poll: bool,
    init_done: bool,
    /// Hold sampling until a location is known (disabled on builds
    /// where a sensor group itself acquires the GPS).
    pub require_gps_before_sampling: bool,
}

impl SensorScheduler {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            op_mode: OpMode::Normal,
            battery: BatteryMonitor::new(),
            mobile_period: 0,
            test_mode_requested: false,
            inside_poll: false,
            init_done: false,
            require_gps_before_sampling: true,
        }
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.push(group);
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn op_mode(&self) -> OpMode {
        self.op_mode
    }

    /// Current battery band (mode overrides included).
    pub fn battery_status(&mut self) -> BatteryStatus {
        self.battery.status(self.op_mode)
    }

    pub fn mobile_upload_period(&self) -> u16 {
        self.mobile_period
    }

    pub fn set_mobile_upload_period(&mut self, seconds: u16) {
        self.mobile_period = seconds;
        if seconds == 0 {
            info!("mobile upload period set to maximum rate");
        } else {
            info!("mobile upload period set to {} seconds", seconds);
        }
    }

    /// Switch operating modes. Mobile mode requires a live GPS (it is
    /// pointless with a static location) and accelerates the GPS
    /// group; the caller should also ask comm for a location refresh.
    pub fn set_op_mode(&mut self, op_mode: OpMode, storage: &Storage) -> bool {
        if op_mode == OpMode::Mobile {
            if storage.gps_latitude != 0.0 || storage.gps_longitude != 0.0 {
                warn!("mobile mode doesn't make sense with a static GPS configuration");
                return false;
            }
            self.schedule_group_now("g-ugps");
        }
        self.op_mode = op_mode;
        true
    }

    /// True while any test mode short of battery test is active.
    pub fn test_mode(&self) -> bool {
        self.test_mode_requested || self.op_mode == OpMode::TestSensor
    }

    /// Moving devices hold their uploads; burn and mobile modes do
    /// not care.
    pub fn currently_in_motion(&self, in_motion: bool) -> bool {
        match self.op_mode {
            OpMode::TestBurn | OpMode::Mobile => false,
            _ => in_motion,
        }
    }

    // ==================== Sensor bookkeeping ====================

    /// Mark a sensor's measurement round complete.
    pub fn sensor_completed(&mut self, name: &str) {
        for g in &mut self.groups {
            for s in &mut g.sensors {
                if s.config.name == name {
                    s.state.completed = true;
                    s.state.polling_valid = false;
                    debug!("{} measurement completed", name);
                }
            }
        }
    }

    /// Permanently drop a failed sensor. In burn-in mode the request
    /// is logged and ignored instead.
    pub fn unconfigure(&mut self, name: &str) {
        for g in &mut self.groups {
            for s in &mut g.sensors {
                if s.config.name == name {
                    s.state.completed = true;
                    s.state.polling_valid = false;
                    if self.op_mode == OpMode::TestBurn {
                        info!("would have deconfigured {} (burn-in mode)", name);
                    } else {
                        s.state.requesting_deconfiguration = true;
                        warn!("deconfiguring {}", name);
                    }
                }
            }
        }
    }

    /// Mark every sensor in a group complete.
    pub fn group_completed(&mut self, name: &str) -> bool {
        let mut something = false;
        for g in &mut self.groups {
            if g.config.name != name {
                continue;
            }
            g.state.polling_valid = false;
            for s in &mut g.sensors {
                if s.state.configured && !s.state.completed {
                    s.state.completed = true;
                    s.state.polling_valid = false;
                    something = true;
                }
            }
            if something {
                debug!("{} is completed", name);
            }
        }
        something
    }

    /// Abort all in-progress measurements.
    pub fn abort_all(&mut self) {
        for g in &mut self.groups {
            if !g.state.configured {
                continue;
            }
            for s in &mut g.sensors {
                if s.state.configured {
                    s.state.completed = true;
                    s.state.polling_valid = false;
                }
            }
        }
    }

    /// Accelerate every configured group to run now.
    pub fn schedule_now(&mut self) -> bool {
        if !self.init_done {
            info!("sensor package not yet initialized, try again");
            return false;
        }
        for g in &mut self.groups {
            if g.state.configured {
                g.state.last_repeated = 0;
            }
        }
        info!("sensor timings accelerated");
        true
    }

    pub fn schedule_group_now(&mut self, name: &str) -> bool {
        for g in &mut self.groups {
            if g.config.name == name {
                g.state.last_repeated = 0;
                return true;
            }
        }
        false
    }

    /// Pin the scheduler to a single sensor; takes effect once the
    /// active groups quiesce.
    pub fn test_sensor(&mut self, name: &str) {
        self.op_mode = OpMode::Normal;
        self.test_mode_requested = false;
        for g in &mut self.groups {
            g.state.being_tested = false;
            for s in &mut g.sensors {
                if s.config.name == name {
                    g.state.being_tested = true;
                    s.state.being_tested = true;
                    info!("sensor test mode requested for {} {}", g.config.name, name);
                    self.test_mode_requested = true;
                } else {
                    s.state.being_tested = false;
                }
            }
        }
        if !self.test_mode_requested && !name.is_empty() {
            info!("sensor not found");
        }
    }

    // ==================== Shared-resource queries ====================

    /// Any power-exclusive group currently powered?
    pub fn any_exclusive_powered_on(&self) -> bool {
        if !self.init_done || self.op_mode == OpMode::TestSensor {
            return false;
        }
        self.groups.iter().any(|g| {
            g.state.configured
                && g.config.power_pin.is_some()
                && g.config.power_exclusive
                && g.state.powered_on
        })
    }

    /// Any I²C-exclusive group currently processing?
    pub fn any_exclusive_twi_on(&self) -> bool {
        if !self.init_done {
            return false;
        }
        self.groups
            .iter()
            .any(|g| g.state.configured && g.state.processing && g.config.twi_exclusive)
    }

    /// Anything measured and waiting to go out? Motion holds uploads.
    pub fn any_upload_needed(&self, in_motion: bool) -> bool {
        if !self.init_done || self.op_mode == OpMode::TestSensor {
            return false;
        }
        for g in &self.groups {
            if !g.state.configured {
                continue;
            }
            for s in &g.sensors {
                if s.state.configured && s.driver.upload_needed() {
                    if self.currently_in_motion(in_motion) {
                        debug!("upload pending, but device is in motion");
                        return false;
                    }
                    return true;
                }
            }
        }
        false
    }

    // ==================== Initialization ====================

    fn init(&mut self, ctx: &mut SensorCtx) {
        let init_time = ctx.clock.now();
        let now_ms = ctx.clock.now_ms();

        for g in &mut self.groups {
            g.state.requesting_deconfiguration = false;
            g.state.configured = g.config.product == ctx.storage.product;
            if !g.state.configured {
                continue;
            }

            // Apply per-group overrides from the stored parameter
            // string, e.g. "g-air.r=15/g-geigers.r=5".
            g.state.repeat_seconds_override = 0;
            for part in ctx.storage.sensor_params.split('/') {
                if let Some(rest) = part.strip_prefix(g.config.name) {
                    if let Some(value) = rest.strip_prefix(".r=") {
                        if let Ok(minutes) = value.trim().parse::<u32>() {
                            debug!("{} repeat overridden to {}m", g.config.name, minutes);
                            g.state.repeat_seconds_override = minutes * 60;
                        }
                    }
                }
            }

            g.state.settling = false;
            g.state.processing = false;
            g.state.polling_valid = false;
            g.state.last_repeated = if g.config.sense_at_boot { 0 } else { init_time };

            // Power starts off; groups without a rail count as powered.
            match g.config.power_pin {
                None => g.state.powered_on = true,
                Some(pin) => {
                    ctx.power.set(pin, false);
                    g.state.powered_on = false;
                }
            }

            if let Some(poll) = g.config.poll {
                if poll.continuously {
                    g.state.timer_running = true;
                    g.state.next_poll_ms = now_ms + poll.repeat_ms;
                    g.state.polling_valid = true;
                }
                // A settle shorter than one poll period can end before
                // the timer ever fires; stretch it.
                let min_settling = (poll.repeat_ms / 1000) as u32 + 5;
                if g.config.settling_seconds != 0 && g.config.settling_seconds < min_settling {
                    g.config.settling_seconds = min_settling;
                }
            }

            let mut configured_sensors = 0;
            for s in &mut g.sensors {
                s.state.requesting_deconfiguration = false;
                s.state.configured = s
                    .config
                    .storage_sensor_mask
                    .intersects(ctx.storage.sensors);
                if !s.state.configured {
                    continue;
                }
                configured_sensors += 1;

                s.state.settling = false;
                s.state.processing = false;
                s.state.completed = false;
                s.state.init_failures = 0;
                s.state.term_failures = 0;
                s.state.polling_valid = false;

                if let Some(poll) = s.config.poll {
                    if poll.continuously {
                        s.state.timer_running = true;
                        s.state.next_poll_ms = now_ms + poll.repeat_ms;
                        s.state.polling_valid = true;
                    }
                    let min_settling = (poll.repeat_ms / 1000) as u32 + 5;
                    if s.config.settling_seconds != 0 && s.config.settling_seconds < min_settling
                    {
                        s.config.settling_seconds = min_settling;
                    }
                }

                if !s.driver.init_once() {
                    s.state.init_failures += 1;
                } else {
                    s.state.init_failures = 0;
                }
            }

            if configured_sensors == 0 {
                g.state.configured = false;
            }
        }
    }

    // ==================== Poll timers ====================

    /// Fire due group/sensor pollers. Called from the node's tick.
    pub fn poll_timers(&mut self, clock: &Clock) {
        let now_ms = clock.now_ms();
        for g in &mut self.groups {
            if g.state.timer_running && now_ms >= g.state.next_poll_ms {
                let period = g.config.poll.map(|p| p.repeat_ms).unwrap_or(1000);
                g.state.next_poll_ms = now_ms + period;
                if g.state.polling_valid {
                    if let Some(driver) = g.driver.as_mut() {
                        driver.poll();
                    }
                }
            }
            for s in &mut g.sensors {
                if s.state.timer_running && now_ms >= s.state.next_poll_ms {
                    let period = s.config.poll.map(|p| p.repeat_ms).unwrap_or(1000);
                    s.state.next_poll_ms = now_ms + period;
                    if s.state.polling_valid {
                        s.driver.poll();
                    }
                }
            }
        }
    }

    // ==================== The scheduler pass ====================

    /// Advance the whole state machine one step.
    pub fn poll(&mut self, ctx: &mut SensorCtx) {
        // Sampling without a location would produce unmappable data;
        // wait for the fan-in (unless a sensor group acquires GPS).
        if self.require_gps_before_sampling
            && ctx.gps_status != GpsStatus::NotConfigured
            && ctx.gps_status != GpsStatus::Full
            && ctx.gps_status != GpsStatus::Partial
        {
            return;
        }

        if !self.init_done {
            self.init(ctx);
            self.init_done = true;
        }

        // A long-running handler can overlap the next tick; never
        // re-enter.
        if self.inside_poll {
            return;
        }
        self.inside_poll = true;
        self.run_pass(ctx);
        self.inside_poll = false;
    }

    fn run_pass(&mut self, ctx: &mut SensorCtx) {
        let mut groups_currently_active = 0;

        for gi in 0..self.groups.len() {
            let battery = self.battery.status(self.op_mode);
            let excl_power_elsewhere = self.any_exclusive_powered_on();
            let excl_twi_elsewhere = self.any_exclusive_twi_on();
            let op_mode = self.op_mode;
            let test_mode_requested = self.test_mode_requested;

            let g = &mut self.groups[gi];
            if !g.state.configured {
                continue;
            }
            if op_mode == OpMode::TestSensor && !g.state.being_tested {
                continue;
            }

            // Completely idle: consider starting this group.
            if !g.state.processing && !g.state.settling {
                if test_mode_requested {
                    continue;
                }

                // Skip handlers get the first veto.
                if op_mode != OpMode::TestSensor {
                    if g.config.mobile_skip && op_mode == OpMode::Mobile {
                        continue;
                    }
                    if let Some(driver) = g.driver.as_mut() {
                        if driver.skip() {
                            debug!("skipping {} at its request", g.config.name);
                            continue;
                        }
                    }
                }

                // If every sensor already has an upload pending there
                // is nothing to be gained by measuring again.
                let mut skip_group = true;
                let mut sensors = 0;
                for s in &g.sensors {
                    if s.state.configured {
                        sensors += 1;
                        if !s.driver.upload_needed() {
                            skip_group = false;
                            break;
                        }
                    }
                }
                if sensors == 0 {
                    g.state.configured = false;
                }
                if skip_group && op_mode != OpMode::TestSensor {
                    continue;
                }

                if g.config.power_exclusive && excl_power_elsewhere {
                    debug!("skipping {}: another exclusive group is powered", g.config.name);
                    continue;
                }
                if g.config.twi_exclusive && excl_twi_elsewhere {
                    debug!("skipping {}: the I2C bus is in use", g.config.name);
                    continue;
                }
                if g.config.uart_required.is_some() && ctx.uart.current().is_some() {
                    debug!("skipping {}: required UART is busy", g.config.name);
                    continue;
                }
                if ctx.uart_switching_allowed
                    && g.config.uart_requested.is_some()
                    && ctx.uart.current().is_some()
                {
                    debug!("skipping {}: requested UART is busy", g.config.name);
                    continue;
                }
                if !battery.intersects(g.config.active_battery_status) {
                    debug!(
                        "skipping {}: {} not in its battery range",
                        g.config.name,
                        battery_status_name(battery)
                    );
                    continue;
                }
                if !ctx.comm_mode.intersects(g.config.active_comm_mode) {
                    debug!("skipping {}: comm mode out of range", g.config.name);
                    continue;
                }

                // Still inside the repeat interval?
                let interval = repeat_seconds(g, battery);
                if op_mode != OpMode::TestSensor
                    && !clock::fire_aligned(ctx.clock, &mut g.state.last_repeated, interval)
                {
                    continue;
                }

                // Fresh round: reset sensor state.
                for s in &mut g.sensors {
                    if s.state.configured {
                        s.state.settling = false;
                        s.state.processing = false;
                        s.state.completed = false;
                    }
                }

                g.state.processing = true;

                // Power up and claim the UART.
                if let Some(pin) = g.config.power_pin {
                    ctx.power.set(pin, true);
                    g.state.powered_on = true;
                    debug!("{} power ON", g.config.name);
                }
                if let Some(dev) = g.config.uart_required {
                    ctx.uart.select(Some(dev));
                }
                if ctx.uart_switching_allowed {
                    if let Some(dev) = g.config.uart_requested {
                        ctx.uart.select(Some(dev));
                    }
                }

                for s in &mut g.sensors {
                    if !s.state.configured {
                        continue;
                    }
                    if !s.driver.init_power() {
                        s.state.init_failures += 1;
                    } else {
                        s.state.init_failures = 0;
                    }
                }

                g.state.last_settled = ctx.clock.now();
                g.state.settling = true;
                if g.config.settling_seconds != 0 {
                    debug!(
                        "begin {} settling for {}s",
                        g.config.name, g.config.settling_seconds
                    );
                }

                // Certain devices (GPS receivers in particular) need
                // their output pumped during warmup, so the poll timer
                // may start with the power.
                if let Some(poll) = g.config.poll {
                    if !poll.continuously && poll.during_settling {
                        g.state.timer_running = true;
                        g.state.next_poll_ms = ctx.clock.now_ms() + poll.repeat_ms;
                        g.state.polling_valid = true;
                    }
                }
                for s in &mut g.sensors {
                    if !s.state.configured {
                        continue;
                    }
                    if let Some(poll) = s.config.poll {
                        if !poll.continuously && poll.during_settling {
                            s.state.timer_running = true;
                            s.state.next_poll_ms = ctx.clock.now_ms() + poll.repeat_ms;
                            s.state.polling_valid = true;
                        }
                    }
                }
            }

            // Inside the settling window?
            if g.state.processing && g.state.settling {
                groups_currently_active += 1;

                if g.config.settling_seconds != 0
                    && !clock::fire(ctx.clock, &mut g.state.last_settled, g.config.settling_seconds)
                {
                    continue;
                }

                g.state.settling = false;

                if let Some(driver) = g.driver.as_mut() {
                    driver.done_settling();
                }
                for s in &mut g.sensors {
                    if s.state.configured {
                        s.driver.done_group_settling();
                    }
                }

                // Pollers that wanted to wait out the warmup start now.
                if let Some(poll) = g.config.poll {
                    if !poll.continuously && !poll.during_settling {
                        g.state.timer_running = true;
                        g.state.next_poll_ms = ctx.clock.now_ms() + poll.repeat_ms;
                        g.state.polling_valid = true;
                    }
                }
                for s in &mut g.sensors {
                    if !s.state.configured {
                        continue;
                    }
                    if let Some(poll) = s.config.poll {
                        if !poll.continuously && !poll.during_settling {
                            s.state.timer_running = true;
                            s.state.next_poll_ms = ctx.clock.now_ms() + poll.repeat_ms;
                            s.state.polling_valid = true;
                        }
                    }
                }
            }

            // Sampling: run sensors one at a time, in table order.
            if g.state.processing && !g.state.settling {
                groups_currently_active += 1;

                for s in &mut g.sensors {
                    if !s.state.configured {
                        continue;
                    }
                    if op_mode == OpMode::TestSensor && !s.state.being_tested {
                        continue;
                    }

                    if !s.state.processing && !s.state.completed {
                        s.state.processing = true;
                        if s.state.being_tested {
                            info!("now testing {}", s.config.name);
                        }
                        s.state.last_settled = ctx.clock.now();
                        s.state.settling = true;
                        if s.config.settling_seconds != 0 {
                            debug!(
                                "begin {} settling for {}s",
                                s.config.name, s.config.settling_seconds
                            );
                        }
                    }

                    if s.state.processing && s.state.settling {
                        if s.config.settling_seconds != 0
                            && !clock::fire(
                                ctx.clock,
                                &mut s.state.last_settled,
                                s.config.settling_seconds,
                            )
                        {
                            break;
                        }
                        s.state.settling = false;
                        s.driver.done_settling();
                        debug!("measuring {}", s.config.name);
                    }

                    // Measure until the driver reports completion.
                    if s.state.processing && !s.state.completed && !s.state.settling {
                        if s.driver.measure() == MeasureOutcome::Completed {
                            s.state.completed = true;
                            s.state.polling_valid = false;
                            debug!("{} measurement completed", s.config.name);
                        }
                    }

                    // Don't move past a sensor that is mid-flight.
                    if s.state.processing && !s.state.completed {
                        break;
                    }
                }
            }

            // Anything left to do in this group?
            if g.state.processing {
                let mut pending = 0;
                for s in &g.sensors {
                    if s.state.configured
                        && !s.state.completed
                        && (op_mode != OpMode::TestSensor || s.state.being_tested)
                    {
                        pending += 1;
                    }
                }

                if pending == 0 {
                    // Wind the round down: timers, term handlers, UART,
                    // power, deconfiguration requests.
                    if let Some(poll) = g.config.poll {
                        if !poll.continuously {
                            g.state.timer_running = false;
                            g.state.polling_valid = false;
                        }
                    }
                    for s in &mut g.sensors {
                        if !s.state.configured {
                            continue;
                        }
                        if let Some(poll) = s.config.poll {
                            if !poll.continuously {
                                s.state.timer_running = false;
                                s.state.polling_valid = false;
                            }
                        }
                    }

                    for s in &mut g.sensors {
                        if !s.state.configured {
                            continue;
                        }
                        if !s.driver.term_power() {
                            s.state.term_failures += 1;
                        } else {
                            s.state.term_failures = 0;
                        }
                    }

                    if g.config.uart_required.is_some() {
                        ctx.uart.select(None);
                    }
                    if ctx.uart_switching_allowed && g.config.uart_requested.is_some() {
                        ctx.uart.select(None);
                    }

                    if let Some(pin) = g.config.power_pin {
                        ctx.power.set(pin, false);
                        g.state.powered_on = false;
                        debug!("{} power OFF", g.config.name);
                    }

                    g.state.processing = false;

                    let mut configured_sensors = 0;
                    for s in &mut g.sensors {
                        if s.state.configured {
                            if s.state.requesting_deconfiguration {
                                s.state.configured = false;
                            } else {
                                configured_sensors += 1;
                            }
                        }
                    }
                    if configured_sensors == 0 {
                        g.state.requesting_deconfiguration = true;
                    }
                    if g.state.requesting_deconfiguration {
                        g.state.configured = false;
                    }

                    debug!("{} completed", g.config.name);
                }
            }
        }

        // Test mode waits for every group to go quiet before engaging.
        if self.test_mode_requested {
            if groups_currently_active == 0 {
                self.test_mode_requested = false;
                self.op_mode = OpMode::TestSensor;
                info!("sensor test mode now active");
            } else {
                info!(
                    "sensor test mode waiting for {} groups to complete",
                    groups_currently_active
                );
            }
        }
    }

    // ==================== Operator CLI ====================

    /// Compact status line: each group with its gating conditions.
    pub fn show_state(&mut self, ctx: &SensorCtx) {
        if !self.init_done {
            info!("sensors not yet initialized");
            return;
        }
        let battery = self.battery.status(self.op_mode);
        let mut line = String::new();
        for g in &self.groups {
            line.push_str(g.config.name);
            line.push('[');
            if !g.state.configured {
                line.push_str("X] ");
                continue;
            }
            if g.state.processing {
                line.push(if g.state.settling { 's' } else { 'm' });
            }
            if !battery.intersects(g.config.active_battery_status) {
                line.push('B');
            }
            if g.config.power_exclusive && self.any_exclusive_powered_on() {
                line.push('P');
            }
            if g.config.uart_required.is_some() && ctx.uart.current().is_some() {
                line.push('U');
            }
            if g.state.being_tested {
                line.push('T');
            }
            line.push_str("] ");
            for s in &g.sensors {
                line.push_str(s.config.name);
                line.push('(');
                if !s.state.configured {
                    line.push('X');
                } else if s.state.processing {
                    line.push(if s.state.settling { 's' } else { 'm' });
                } else if s.driver.upload_needed() {
                    line.push('u');
                } else {
                    line.push('w');
                }
                line.push_str(") ");
            }
        }
        info!("{}", line.trim_end());
    }
}

impl Default for SensorScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SensorMask, Store, PRODUCT_SOLARCAST};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Observable driver state shared with the test body.
    #[derive(Default)]
    struct Probe {
        init_once: u32,
        init_power: u32,
        term_power: u32,
        measures: u32,
        polls: u32,
        complete_after: u32,
        upload_pending: bool,
        fail_init_power: bool,
    }

    struct ProbeDriver(Rc<RefCell<Probe>>);

    impl SensorDriver for ProbeDriver {
        fn init_once(&mut self) -> bool {
            self.0.borrow_mut().init_once += 1;
            true
        }

        fn init_power(&mut self) -> bool {
            let mut p = self.0.borrow_mut();
            p.init_power += 1;
            !p.fail_init_power
        }

        fn term_power(&mut self) -> bool {
            self.0.borrow_mut().term_power += 1;
            true
        }

        fn measure(&mut self) -> MeasureOutcome {
            let mut p = self.0.borrow_mut();
            p.measures += 1;
            if p.measures >= p.complete_after.max(1) {
                MeasureOutcome::Completed
            } else {
                MeasureOutcome::Sampling
            }
        }

        fn upload_needed(&self) -> bool {
            self.0.borrow().upload_pending
        }

        fn poll(&mut self) {
            self.0.borrow_mut().polls += 1;
        }
    }

    struct RecordingPower {
        events: Vec<(u16, bool)>,
    }

    impl PowerSwitch for RecordingPower {
        fn set(&mut self, pin: u16, enable: bool) {
            self.events.push((pin, enable));
        }
    }

    struct Rig {
        sched: SensorScheduler,
        store: Store,
        clock: Clock,
        uart: UartMux,
        power: RecordingPower,
        gps_status: GpsStatus,
        in_motion: bool,
    }

    macro_rules! sctx {
        ($rig:expr) => {
            SensorCtx {
                clock: &$rig.clock,
                storage: &$rig.store.data,
                uart: &mut $rig.uart,
                power: &mut $rig.power,
                comm_mode: CommModeSet::NONE,
                uart_switching_allowed: true,
                gps_status: $rig.gps_status,
                in_motion: $rig.in_motion,
            }
        };
    }

    impl Rig {
        fn new() -> Self {
            let mut rig = Self {
                sched: SensorScheduler::new(),
                store: Store::in_memory(),
                clock: Clock::new(),
                uart: UartMux::new(),
                power: RecordingPower { events: Vec::new() },
                gps_status: GpsStatus::Full,
                in_motion: false,
            };
            rig.clock.advance(60);
            rig
        }

        fn poll(&mut self) {
            let mut ctx = sctx!(self);
            self.sched.poll(&mut ctx);
        }

        fn group_state(&self, name: &str) -> &GroupState {
            &self
                .sched
                .groups()
                .iter()
                .find(|g| g.config.name == name)
                .unwrap()
                .state
        }
    }

    fn probe() -> Rc<RefCell<Probe>> {
        Rc::new(RefCell::new(Probe::default()))
    }

    fn simple_group(name: &'static str, p: &Rc<RefCell<Probe>>) -> Group {
        let mut config = GroupConfig::new(name, PRODUCT_SOLARCAST);
        config.sense_at_boot = true;
        config.repeat = vec![RepeatEntry {
            battery: BatteryStatus::all(),
            seconds: 300,
        }];
        let sensor = Sensor::new(
            SensorConfig::new("s", SensorMask::GEIGER0),
            Box::new(ProbeDriver(p.clone())),
        );
        Group::new(config, vec![sensor])
    }

    // ==================== Basic lifecycle ====================

    #[test]
    fn test_group_runs_and_completes() {
        let mut rig = Rig::new();
        let p = probe();
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        assert_eq!(p.borrow().init_once, 1);
        assert_eq!(p.borrow().init_power, 1);
        assert_eq!(p.borrow().measures, 1);
        assert_eq!(p.borrow().term_power, 1);
        let gs = rig.group_state("g-test");
        assert!(!gs.processing);
        assert!(gs.configured);
    }

    #[test]
    fn test_repeat_interval_gates_reruns() {
        let mut rig = Rig::new();
        let p = probe();
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        assert_eq!(p.borrow().measures, 1);
        // Too soon: nothing new happens.
        rig.poll();
        assert_eq!(p.borrow().measures, 1);
        // One repeat interval later the group runs again.
        rig.clock.advance(301);
        rig.poll();
        assert_eq!(p.borrow().measures, 2);
    }

    #[test]
    fn test_settling_delays_measurement() {
        let mut rig = Rig::new();
        let p = probe();
        let mut group = simple_group("g-test", &p);
        group.config.settling_seconds = 30;
        rig.sched.add_group(group);

        rig.poll();
        // Powered and settling, but not yet measuring.
        assert!(rig.group_state("g-test").settling);
        assert_eq!(p.borrow().measures, 0);

        rig.clock.advance(10);
        rig.poll();
        assert_eq!(p.borrow().measures, 0);

        rig.clock.advance(21);
        rig.poll();
        assert_eq!(p.borrow().measures, 1);
        assert!(!rig.group_state("g-test").processing);
    }

    #[test]
    fn test_multi_pass_measurement() {
        let mut rig = Rig::new();
        let p = probe();
        p.borrow_mut().complete_after = 3;
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        assert_eq!(p.borrow().measures, 1);
        assert!(rig.group_state("g-test").processing);
        rig.poll();
        rig.poll();
        assert_eq!(p.borrow().measures, 3);
        assert!(!rig.group_state("g-test").processing);
    }

    // ==================== Eligibility gating ====================

    #[test]
    fn test_battery_band_skips_group() {
        let mut rig = Rig::new();
        let p = probe();
        let mut group = simple_group("g-test", &p);
        group.config.active_battery_status = BatteryStatus::FULL | BatteryStatus::NORMAL;
        rig.sched.add_group(group);
        // 50% SOC reads LOW, outside the group's bands.
        rig.sched.battery.set_soc(50.0);
        rig.poll();
        assert_eq!(p.borrow().measures, 0);
        assert!(!rig.group_state("g-test").processing);

        // Back above 60%: NORMAL, so the group runs.
        rig.sched.battery.set_soc(75.0);
        rig.poll();
        assert_eq!(p.borrow().measures, 1);
    }

    #[test]
    fn test_power_exclusive_groups_never_overlap() {
        let mut rig = Rig::new();
        let p1 = probe();
        let p2 = probe();
        let mut g1 = simple_group("g-one", &p1);
        g1.config.power_pin = Some(11);
        g1.config.power_exclusive = true;
        g1.config.settling_seconds = 30;
        let mut g2 = simple_group("g-two", &p2);
        g2.config.power_pin = Some(12);
        g2.config.power_exclusive = true;
        g2.config.settling_seconds = 30;
        rig.sched.add_group(g1);
        rig.sched.add_group(g2);

        rig.poll();
        assert!(rig.group_state("g-one").powered_on);
        assert!(!rig.group_state("g-two").powered_on);

        // While g-one settles, g-two stays off.
        rig.clock.advance(10);
        rig.poll();
        assert!(rig.group_state("g-one").powered_on);
        assert!(!rig.group_state("g-two").powered_on);

        // After g-one finishes, g-two gets its turn; never both.
        rig.clock.advance(25);
        rig.poll();
        assert!(!rig.group_state("g-one").powered_on);
        assert!(rig.group_state("g-two").powered_on);
    }

    #[test]
    fn test_uart_required_group_waits_for_uart() {
        let mut rig = Rig::new();
        let p = probe();
        let mut group = simple_group("g-test", &p);
        group.config.uart_required = Some(UartDevice::Pms);
        rig.sched.add_group(group);

        rig.uart.select(Some(UartDevice::Fona));
        rig.poll();
        assert_eq!(p.borrow().measures, 0);

        rig.uart.select(None);
        rig.poll();
        assert_eq!(p.borrow().measures, 1);
        // The UART was released at the end of the round.
        assert_eq!(rig.uart.current(), None);
    }

    #[test]
    fn test_all_uploads_pending_skips_group() {
        let mut rig = Rig::new();
        let p = probe();
        p.borrow_mut().upload_pending = true;
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        assert_eq!(p.borrow().measures, 0);
    }

    #[test]
    fn test_gps_wait_holds_sampling() {
        let mut rig = Rig::new();
        let p = probe();
        rig.sched.add_group(simple_group("g-test", &p));
        rig.gps_status = GpsStatus::NoLocation;
        rig.poll();
        assert_eq!(p.borrow().measures, 0);
        rig.gps_status = GpsStatus::Full;
        rig.poll();
        assert_eq!(p.borrow().measures, 1);
    }

    // ==================== Uploads and motion ====================

    #[test]
    fn test_upload_needed_and_motion_gate() {
        let mut rig = Rig::new();
        let p = probe();
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        assert!(!rig.sched.any_upload_needed(false));
        p.borrow_mut().upload_pending = true;
        assert!(rig.sched.any_upload_needed(false));
        // In motion: hold the upload for now.
        assert!(!rig.sched.any_upload_needed(true));
        // Burn-in mode ignores motion.
        rig.sched.set_op_mode(OpMode::TestBurn, &rig.store.data);
        assert!(rig.sched.any_upload_needed(true));
    }

    // ==================== Deconfiguration ====================

    #[test]
    fn test_unconfigure_takes_effect_after_round() {
        let mut rig = Rig::new();
        let p = probe();
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        rig.sched.unconfigure("s");
        // The next round enacts the request and drops the group too
        // (its only sensor is gone).
        rig.clock.advance(301);
        rig.poll();
        rig.clock.advance(301);
        rig.poll();
        assert!(!rig.group_state("g-test").configured);
    }

    #[test]
    fn test_burn_mode_only_logs_deconfiguration() {
        let mut rig = Rig::new();
        let p = probe();
        rig.sched.add_group(simple_group("g-test", &p));
        rig.sched.set_op_mode(OpMode::TestBurn, &rig.store.data);
        rig.poll();
        rig.sched.unconfigure("s");
        rig.clock.advance(301);
        rig.poll();
        assert!(rig.group_state("g-test").configured);
    }

    #[test]
    fn test_init_power_failures_accumulate() {
        let mut rig = Rig::new();
        let p = probe();
        p.borrow_mut().fail_init_power = true;
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        let g = &rig.sched.groups()[0];
        assert_eq!(g.sensors[0].state.init_failures, 1);
        // A later good round clears the count.
        p.borrow_mut().fail_init_power = false;
        rig.clock.advance(301);
        rig.poll();
        let g = &rig.sched.groups()[0];
        assert_eq!(g.sensors[0].state.init_failures, 0);
    }

    // ==================== Parameter overrides ====================

    #[test]
    fn test_sensor_params_override_repeat() {
        let mut rig = Rig::new();
        let p = probe();
        rig.store.data.sensor_params = "g-other.r=99/g-test.r=5".to_string();
        rig.sched.add_group(simple_group("g-test", &p));
        rig.poll();
        assert_eq!(rig.group_state("g-test").repeat_seconds_override, 5 * 60);
        assert_eq!(p.borrow().measures, 1);
        // 300s (the table value) is no longer the gate; 5 minutes is.
        rig.clock.advance(301);
        rig.poll();
        assert_eq!(p.borrow().measures, 2);
    }

    #[test]
    fn test_product_and_mask_filter_configuration() {
        let mut rig = Rig::new();
        let p1 = probe();
        let p2 = probe();
        let mut other_product = simple_group("g-other", &p1);
        other_product.config.product = 77;
        rig.sched.add_group(other_product);
        let mut masked = simple_group("g-masked", &p2);
        masked.sensors[0].config.storage_sensor_mask = SensorMask::OPC;
        rig.store.data.sensors = SensorMask::GEIGER0;
        rig.sched.add_group(masked);
        rig.poll();
        assert!(!rig.group_state("g-other").configured);
        // All sensors masked out: the group deconfigures itself.
        assert!(!rig.group_state("g-masked").configured);
    }

    // ==================== Test mode ====================

    #[test]
    fn test_sensor_test_mode_pins_to_one_sensor() {
        let mut rig = Rig::new();
        let p1 = probe();
        let p2 = probe();
        p1.borrow_mut().upload_pending = false;
        let mut g1 = simple_group("g-one", &p1);
        g1.sensors[0].config.name = "alpha";
        let mut g2 = simple_group("g-two", &p2);
        g2.sensors[0].config.name = "beta";
        rig.sched.add_group(g1);
        rig.sched.add_group(g2);
        // Initialize the table first.
        rig.poll();

        rig.sched.test_sensor("beta");
        // Nothing active: mode engages on the next pass.
        rig.poll();
        assert_eq!(rig.sched.op_mode(), OpMode::TestSensor);

        // Only beta runs now, repeatedly, ignoring intervals.
        let before = p2.borrow().measures;
        rig.poll();
        rig.poll();
        assert!(p2.borrow().measures > before);
        assert_eq!(p1.borrow().measures, 1);
    }

    // ==================== Poll timers ====================

    #[test]
    fn test_continuous_poller_fires() {
        let mut rig = Rig::new();
        let p = probe();
        let mut group = simple_group("g-test", &p);
        group.sensors[0].config.poll = Some(PollConfig {
            repeat_ms: 1000,
            continuously: true,
            during_settling: false,
        });
        rig.sched.add_group(group);
        rig.poll(); // init
        rig.clock.advance(2);
        rig.sched.poll_timers(&rig.clock);
        assert!(p.borrow().polls >= 1);
    }
}
