//! Comm supervisor: the top of the transport layer.
//!
//! Owns both transports and decides which (if either) is selected,
//! runs the oneshot duty cycle that powers the modem only long enough
//! to drain pending uploads, arbitrates buffered-versus-immediate
//! sends, schedules the service-update priority ladder, fans in the
//! GPS sources, and tracks connect-latency statistics.
//!
//! The supervisor never blocks: `poll()` is called on a fixed cadence
//! and everything else rides on completion events dispatched by the
//! node event loop.

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::gps::{GpsFix, GpsStatus, GPS_ABORT_MINUTES};
use crate::node::{UartDevice, UartMux};
use crate::sensor::battery::BatteryStatus;
use crate::storage::{DfuStatus, StorageFlags, Store, WanMode};
use crate::transport::fona::Fona;
use crate::transport::lora::Lora;
use crate::transport::{
    Action, Bus, Indicator, ModemPort, ReplyType, StatKind, Transport,
    BOOT_DELAY_UNTIL_INIT_SECONDS,
};

/// Oneshot cadence while the battery is full (we can afford it).
pub const ONESHOT_FAST_MINUTES: u32 = 5;

/// Give up on a oneshot whose transport never finished initializing.
pub const ONESHOT_ABORT_SECONDS: u32 = 300;

/// Longest a oneshot window stays powered once the service is
/// reachable.
pub const ONESHOT_UPDATE_SECONDS: u32 = 120;

/// Cadence of the configuration/stats ladder.
pub const SERVICE_UPDATE_MINUTES: u32 = 360;

/// Cadence of optional keep-alive pings.
pub const PING_SERVICE_SECONDS: u32 = 600;

/// In failover, restart periodically to re-test the primary backhaul.
pub const FAILOVER_RESTART_MINUTES: u32 = 120;

/// Suppress service traffic for a moment after boot.
pub const FAST_DEVICE_UPDATE_BEGIN_SECONDS: u32 = 30;

/// Slots in the worst-connect-time ring.
const SELECT_TRACK_TIMES: usize = 10;

bitflags! {
    /// Comm modes as a mask so sensor groups can enable themselves for
    /// several (or no) transports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommModeSet: u16 {
        const NONE = 0x0001;
        const LORA = 0x0002;
        const FONA = 0x0004;
    }
}

/// The currently selected transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    None,
    Lora,
    Fona,
}

impl CommMode {
    pub fn as_set(self) -> CommModeSet {
        match self {
            CommMode::None => CommModeSet::NONE,
            CommMode::Lora => CommModeSet::LORA,
            CommMode::Fona => CommModeSet::FONA,
        }
    }
}

/// Phase of WAN-mode `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutowanMode {
    GpsWait,
    Normal,
    Failover,
}

/// Which GPS hardware this build carries.
#[derive(Debug, Clone, Copy)]
pub struct GpsConfig {
    /// The cellular modem's integrated receiver.
    pub fona_gps: bool,
    /// I²C-attached u-blox.
    pub twi_ublox: bool,
    /// External u-blox on the shared UART.
    pub ext_ublox: bool,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            fona_gps: true,
            twi_ublox: false,
            ext_ublox: false,
        }
    }
}

/// Snapshot of an externally driven GPS source (the u-blox drivers
/// live outside the core and report in).
pub struct ExternalGps {
    configured: bool,
    status: GpsStatus,
    fix: GpsFix,
    shutdown_requested: bool,
}

impl ExternalGps {
    fn new(configured: bool) -> Self {
        Self {
            configured,
            status: if configured {
                GpsStatus::NoData
            } else {
                GpsStatus::NotConfigured
            },
            fix: GpsFix::default(),
            shutdown_requested: false,
        }
    }

    /// Driver callback: report the source's current knowledge.
    pub fn report(&mut self, status: GpsStatus, fix: GpsFix) {
        if self.configured {
            self.status = status;
            self.fix = fix;
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    fn get(&self) -> (GpsStatus, GpsFix) {
        (self.status, self.fix)
    }

    fn shutdown(&mut self) {
        if self.configured && !self.shutdown_requested {
            self.shutdown_requested = true;
        }
    }
}

/// One entry of the service-update priority ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Pending sensor readings.
    Normal,
    Stats,
    StatsVersion,
    StatsConfigDev,
    StatsConfigGps,
    StatsConfigSvc,
    StatsConfigTtn,
    StatsConfigSen,
    StatsDfu,
    StatsCell1,
    StatsCell2,
    StatsMtuTest,
}

/// Handle the publisher uses to push one update through the active
/// transport.
pub struct Uplink<'a, 'b> {
    transport: Option<&'a mut dyn Transport>,
    pub bus: Bus<'b>,
}

impl Uplink<'_, '_> {
    /// Transmit a marshalled payload. With no transport selected this
    /// reports success, which keeps no-comms bench setups useful.
    pub fn send(&mut self, payload: &[u8], reply: ReplyType) -> bool {
        match self.transport.as_mut() {
            Some(t) => t.send_to_service(payload, reply, &mut self.bus),
            None => true,
        }
    }

    pub fn mtu(&self) -> u16 {
        self.transport.as_ref().map(|t| t.mtu()).unwrap_or(0)
    }
}

/// The send subsystem: marshals updates into Telecast payloads and
/// pushes them through the uplink. Out of core scope; the supervisor
/// only depends on this contract.
pub trait UpdatePublisher {
    /// Build and transmit one update. True when it was accepted for
    /// transmission.
    fn send_update(&mut self, kind: UpdateKind, uplink: &mut Uplink) -> bool;

    /// Fire-and-forget keep-alive.
    fn send_ping(&mut self, uplink: &mut Uplink);
}

/// Everything the supervisor needs from the rest of the node for one
/// call.
pub struct CommCtx<'a> {
    pub clock: &'a Clock,
    pub store: &'a mut Store,
    pub port: &'a mut dyn ModemPort,
    pub actions: &'a mut Vec<Action>,
    pub publisher: &'a mut dyn UpdatePublisher,
    pub uart: &'a mut UartMux,
    pub battery: BatteryStatus,
    pub any_upload_needed: bool,
    pub any_exclusive_powered_on: bool,
    pub sensor_test_mode: bool,
    /// Fine-grained wall-clock time is available (required before
    /// uploads may be buffered, or they would all carry one date).
    pub fine_timestamp_available: bool,
}

/// Counters fed from transport [`StatKind`] events.
#[derive(Debug, Clone, Default)]
pub struct CommStats {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub resets: u32,
    pub errors: u32,
    pub oneshots: u32,
    pub gps_acquisitions: u32,
}

impl CommStats {
    pub fn apply(&mut self, kind: StatKind) {
        match kind {
            StatKind::Sent(n) => self.sent_bytes += n as u64,
            StatKind::Received(n) => self.received_bytes += n as u64,
            StatKind::Reset => self.resets += 1,
            StatKind::Error => self.errors += 1,
            StatKind::Oneshot => self.oneshots += 1,
            StatKind::GpsAcquisition => self.gps_acquisitions += 1,
        }
    }
}

/// Ring of the worst connect latencies, purged daily, plus the
/// absolute worst and a running average.
struct SelectStats {
    worst: [u16; SELECT_TRACK_TIMES],
    absolute_worst: u16,
    average: u32,
    last_purge: u32,
    last_select: u32,
}

impl SelectStats {
    fn new() -> Self {
        Self {
            worst: [0; SELECT_TRACK_TIMES],
            absolute_worst: 0,
            average: 0,
            last_purge: 0,
            last_select: 0,
        }
    }

    fn best_index(&self) -> usize {
        let mut best = 0;
        for (i, &v) in self.worst.iter().enumerate() {
            if v < self.worst[best] {
                best = i;
            }
        }
        best
    }

    fn worst_index(&self) -> usize {
        let mut worst = 0;
        for (i, &v) in self.worst.iter().enumerate() {
            if v > self.worst[worst] {
                worst = i;
            }
        }
        worst
    }

    fn log_longest(&mut self, seconds: u32, clock: &Clock) {
        let seconds16 = seconds.min(u16::MAX as u32) as u16;
        if seconds16 > self.absolute_worst {
            self.absolute_worst = seconds16;
        }

        // Once a day, forget the worst half so ancient outliers fade.
        if clock::fire(clock, &mut self.last_purge, 24 * 60 * 60) {
            for _ in 0..SELECT_TRACK_TIMES / 2 {
                let i = self.worst_index();
                self.worst[i] = 0;
            }
        }

        let i = self.best_index();
        if seconds16 > self.worst[i] {
            self.worst[i] = seconds16;
        }

        let mut sum: u32 = 0;
        let mut count: u32 = 0;
        for &v in self.worst.iter() {
            if v != 0 {
                count += 1;
                sum += v as u32;
            }
        }
        if count != 0 {
            self.average = sum / count;
        }
        info!("{}s to connect (worst {}s)", seconds, self.absolute_worst);
    }
}

/// Tracking for the service-update priority ladder; true = already
/// sent this interval.
struct UpdateLadder {
    dev: bool,
    gps: bool,
    svc: bool,
    ttn: bool,
    sen: bool,
    dfu: bool,
    cell1: bool,
    cell2: bool,
}

impl UpdateLadder {
    fn all_sent() -> Self {
        Self {
            dev: true,
            gps: true,
            svc: true,
            ttn: true,
            sen: true,
            dfu: true,
            cell1: true,
            cell2: true,
        }
    }

    fn complete(&self) -> bool {
        self.dev
            && self.gps
            && self.svc
            && self.ttn
            && self.sen
            && self.dfu
            && self.cell1
            && self.cell2
    }
}

/// The communications supervisor.
pub struct CommSupervisor {
    pub fona: Fona,
    pub lora: Lora,
    pub twi_gps: ExternalGps,
    pub ugps: ExternalGps,
    pub stats: CommStats,
    gps_config: GpsConfig,
    active_mode: CommMode,
    currently_deselected: bool,
    initialized: bool,
    ever_initialized: bool,
    waiting_for_first_select: bool,
    force_cell: bool,
    restart_after_failover: bool,
    failover_time: u32,
    /// False when a full stats round (starting with Version) is owed.
    sent_full_stats: bool,
    ladder: UpdateLadder,
    flush_buffers: bool,
    override_with_lkg: bool,
    displayed_lkg: bool,
    displayed_static: bool,
    last_service_ping: u32,
    oneshot_completed: bool,
    last_oneshot: u32,
    oneshot_powered_up: u32,
    oneshot_disabled: bool,
    last_service_update: u32,
    mtu_test: bool,
    select_stats: SelectStats,
}

impl CommSupervisor {
    pub fn new(gps_config: GpsConfig) -> Self {
        Self {
            fona: Fona::new(),
            lora: Lora::new(),
            twi_gps: ExternalGps::new(gps_config.twi_ublox),
            ugps: ExternalGps::new(gps_config.ext_ublox),
            stats: CommStats::default(),
            gps_config,
            active_mode: CommMode::None,
            currently_deselected: true,
            initialized: false,
            ever_initialized: false,
            waiting_for_first_select: false,
            force_cell: false,
            restart_after_failover: false,
            failover_time: 0,
            sent_full_stats: true,
            ladder: UpdateLadder::all_sent(),
            flush_buffers: false,
            override_with_lkg: false,
            displayed_lkg: false,
            displayed_static: false,
            last_service_ping: 0,
            oneshot_completed: false,
            last_oneshot: 0,
            oneshot_powered_up: 0,
            oneshot_disabled: false,
            last_service_update: 0,
            mtu_test: false,
            select_stats: SelectStats::new(),
        }
    }

    /// Initialize the whole comm package; called once at boot (and
    /// again on an explicit re-init).
    pub fn init(&mut self, ctx: &mut CommCtx) {
        self.select(CommMode::None, "init", ctx);

        // Stagger the first oneshot away from the sensor tempo.
        let interval = self.get_oneshot_interval(ctx.battery, ctx.store);
        self.last_oneshot = ctx.clock.now() + (2 * interval / 3);

        self.initialized = true;
        self.ever_initialized = true;
        self.waiting_for_first_select = true;
    }

    pub fn reinit(&mut self, ctx: &mut CommCtx) {
        if self.ever_initialized {
            self.init(ctx);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn mode(&self) -> CommMode {
        if !self.ever_initialized {
            return CommMode::None;
        }
        self.active_mode
    }

    pub fn is_deselected(&self) -> bool {
        self.currently_deselected
    }

    /// Restart the first-select decision (used after GPS acquisition).
    pub fn repeat_initial_select(&mut self) {
        self.waiting_for_first_select = true;
    }

    /// A transmission finished; the oneshot window may close.
    pub fn note_oneshot_completed(&mut self) {
        self.oneshot_completed = true;
        debug!("oneshot marked completed");
    }

    /// The network is down behind the gateway: lock onto cellular.
    pub fn force_cell(&mut self) {
        self.force_cell = true;
        warn!("network down, forcing cellular comms");
    }

    pub fn set_mtu_test(&mut self, in_progress: bool) {
        self.mtu_test = in_progress;
    }

    pub fn disable_oneshot_mode(&mut self) {
        self.oneshot_disabled = true;
    }

    pub fn connect_latency_average(&self) -> u32 {
        self.select_stats.average
    }

    // ==================== Selection ====================

    /// Select a specific transport (or none), switching the UART and
    /// initializing its state machine.
    pub fn select(&mut self, which: CommMode, reason: &str, ctx: &mut CommCtx) {
        if ctx.sensor_test_mode && which != CommMode::None {
            return;
        }
        debug!("select {:?}: {}", which, reason);
        if which == CommMode::None {
            ctx.uart.select(None);
            self.select_stats.last_select = 0;
        } else {
            self.select_stats.last_select = ctx.clock.now();
        }
        let mut bus = Bus {
            clock: ctx.clock,
            store: &mut *ctx.store,
            port: &mut *ctx.port,
            actions: &mut *ctx.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        match which {
            CommMode::Lora => {
                ctx.uart.select(Some(UartDevice::Lora));
                self.lora.init(&mut bus);
            }
            CommMode::Fona => {
                ctx.uart.select(Some(UartDevice::Fona));
                self.fona.init(&mut bus);
            }
            CommMode::None => {}
        }
        self.fona.selected = which == CommMode::Fona;
        self.active_mode = which;
        self.currently_deselected = which == CommMode::None;
    }

    /// Power down the selected transport without forgetting which it
    /// was.
    pub fn deselect(&mut self, ctx: &mut CommCtx) {
        if self.currently_deselected {
            return;
        }
        debug!("deselect {:?}", self.active_mode);
        self.currently_deselected = true;
        self.oneshot_completed = true;
        self.fona.selected = false;
        ctx.uart.select(None);
        ctx.actions.push(Action::Indicate(Indicator::CommsUnknown));
        match self.active_mode {
            CommMode::Lora => self.lora.term(),
            CommMode::Fona => self.fona.term(),
            CommMode::None => {}
        }
    }

    /// Re-enable the previously selected transport.
    pub fn reselect(&mut self, ctx: &mut CommCtx) {
        if self.currently_deselected {
            self.select(self.active_mode, "reselect", ctx);
        }
        self.oneshot_completed = false;
    }

    /// The selected transport reports it is online.
    pub fn select_completed(&mut self, clock: &Clock) {
        if self.select_stats.last_select != 0 {
            let now = clock.now();
            if now > self.select_stats.last_select {
                let elapsed = now - self.select_stats.last_select;
                self.select_stats.log_longest(elapsed, clock);
            }
            self.select_stats.last_select = 0;
        }
    }

    // ==================== Policy predicates ====================

    pub fn autowan_mode(&mut self, ctx: &mut CommCtx) -> AutowanMode {
        if self.gps_get(ctx).0 != GpsStatus::Full {
            return AutowanMode::GpsWait;
        }
        if ctx.store.data.wan != WanMode::Auto {
            return AutowanMode::Normal;
        }
        if !self.force_cell {
            return AutowanMode::Normal;
        }
        AutowanMode::Failover
    }

    /// Whether the UART may be switched between comms and sensors.
    pub fn uart_switching_allowed(&mut self, ctx: &mut CommCtx) -> bool {
        // Manual override holds unless failover needs oneshots.
        if self.oneshot_disabled && self.autowan_mode(ctx) != AutowanMode::Failover {
            return false;
        }
        // A zero interval means the UART permanently belongs to comms.
        if ctx.store.data.oneshot_minutes == 0 {
            return false;
        }
        true
    }

    pub fn oneshot_currently_enabled(&mut self, ctx: &mut CommCtx) -> bool {
        // Without GPS we stay in continuous mode to acquire it.
        if self.gps_get(ctx).0 != GpsStatus::Full {
            return false;
        }
        // A pending firmware download needs continuous comms.
        if ctx.store.data.dfu_status == DfuStatus::Pending {
            return false;
        }
        if self.mtu_test {
            return false;
        }
        self.uart_switching_allowed(ctx)
    }

    /// Battery-governed oneshot cadence.
    pub fn get_oneshot_interval(&self, battery: BatteryStatus, store: &Store) -> u32 {
        // A starving battery slows the uploader, which in turn slows
        // re-sampling; that is the point.
        if battery == BatteryStatus::DEAD {
            24 * 60 * 60
        } else if battery == BatteryStatus::EMERGENCY {
            6 * 60 * 60
        } else if battery == BatteryStatus::WARNING {
            30 * 60
        } else if battery == BatteryStatus::FULL {
            ONESHOT_FAST_MINUTES * 60
        } else if battery == BatteryStatus::TEST {
            5 * 60
        } else {
            store.data.oneshot_minutes as u32 * 60
        }
    }

    pub fn get_oneshot_cell_interval(&self, battery: BatteryStatus, store: &Store) -> u32 {
        if battery == BatteryStatus::TEST {
            return 10 * 60;
        }
        store.data.oneshot_cell_minutes as u32 * 60
    }

    pub fn get_service_update_interval(&self, battery: BatteryStatus) -> u32 {
        if battery == BatteryStatus::TEST {
            return 25 * 60;
        }
        SERVICE_UPDATE_MINUTES * 60
    }

    /// Would a send right now be parked in flash rather than
    /// transmitted immediately?
    pub fn would_be_buffered(&self, ctx: &CommCtx) -> bool {
        // Only a deselected cellular transport buffers.
        let mut buffered =
            self.currently_deselected && self.active_mode == CommMode::Fona;

        if buffered && self.get_oneshot_cell_interval(ctx.battery, ctx.store) == 0 {
            return false;
        }

        // Without fine-grained time every buffered upload would carry
        // the same date, so buffering is off.
        if buffered && !ctx.fine_timestamp_available {
            buffered = false;
        }

        if buffered && self.flush_buffers {
            buffered = false;
        }

        // Not when a cell drain is due.
        if buffered
            && clock::would_fire(
                ctx.clock,
                self.oneshot_powered_up,
                self.get_oneshot_cell_interval(ctx.battery, ctx.store),
            )
        {
            buffered = false;
        }

        // Not when the stats ladder is due.
        if buffered
            && clock::would_fire(
                ctx.clock,
                self.last_service_update,
                self.get_service_update_interval(ctx.battery),
            )
        {
            buffered = false;
        }

        buffered
    }

    pub fn can_send_to_service(&self, ctx: &CommCtx) -> bool {
        if self.currently_deselected {
            return self.would_be_buffered(ctx);
        }
        // With no transport, claiming "yes" keeps no-comms bench
        // setups usable.
        if self.active_mode == CommMode::None {
            return true;
        }
        if ctx.clock.now() < FAST_DEVICE_UPDATE_BEGIN_SECONDS {
            return false;
        }
        match self.active_mode {
            CommMode::Lora => self.lora.can_send_to_service(),
            CommMode::Fona => self.fona.can_send_to_service(),
            CommMode::None => false,
        }
    }

    pub fn is_busy(&mut self, ctx: &CommCtx) -> bool {
        if !self.can_send_to_service(ctx) {
            return true;
        }
        match self.active_mode {
            CommMode::Lora => self.lora.is_busy(ctx.clock),
            CommMode::Fona => self.fona.is_busy(ctx.clock),
            CommMode::None => false,
        }
    }

    // ==================== GPS fan-in ====================

    /// Force a re-acquisition next time the modem initializes.
    pub fn gps_update(&mut self) {
        self.fona.gps_update();
        self.stats.apply(StatKind::GpsAcquisition);
    }

    fn gps_abort(&mut self, store: &Store) {
        if !self.override_with_lkg && !self.displayed_lkg {
            self.displayed_lkg = true;
            info!(
                "GPS using last known good: {} {}",
                store.data.lkg_gps_latitude, store.data.lkg_gps_longitude
            );
        }
        self.override_with_lkg = true;
    }

    /// Fan in every location source by precedence, with the side
    /// effects the first full fix carries (source shutdown, LKG
    /// override after timeout).
    pub fn gps_get(&mut self, ctx: &mut CommCtx) -> (GpsStatus, GpsFix) {
        let mut result = GpsStatus::NotConfigured;
        let mut fix = GpsFix::default();

        // Static configuration wins outright.
        let s = &ctx.store.data;
        if s.gps_latitude != 0.0 && s.gps_longitude != 0.0 {
            fix = GpsFix {
                latitude: s.gps_latitude,
                longitude: s.gps_longitude,
                altitude: s.gps_altitude,
            };
            result = GpsStatus::Full;
            if !self.displayed_static {
                self.displayed_static = true;
                info!("GPS: using statically-configured location");
            }
        }

        if self.gps_config.twi_ublox && result != GpsStatus::Full {
            let (status, twi_fix) = self.twi_gps.get();
            result = status;
            fix = twi_fix;
        }

        if self.gps_config.fona_gps && result != GpsStatus::Full {
            let improved = self.fona.gps_status();
            if result == GpsStatus::NotConfigured
                || improved == GpsStatus::Full
                || improved == GpsStatus::Partial
            {
                result = improved;
                fix = self.fona.gps_fix().unwrap_or_default();
            }
        }

        if self.gps_config.ext_ublox && result != GpsStatus::Full {
            let (improved, ugps_fix) = self.ugps.get();
            if result == GpsStatus::NotConfigured
                || improved == GpsStatus::Full
                || improved == GpsStatus::Partial
            {
                result = improved;
                fix = ugps_fix;
            }
        }

        if result != GpsStatus::Full && result != GpsStatus::Partial {
            // Don't block booting forever on a cold receiver.
            if ctx.clock.now() > GPS_ABORT_MINUTES * 60 {
                self.gps_abort(ctx.store);
            }
            if self.override_with_lkg {
                let s = &ctx.store.data;
                if s.lkg_gps_latitude != 0.0 && s.lkg_gps_longitude != 0.0 {
                    fix = GpsFix {
                        latitude: s.lkg_gps_latitude,
                        longitude: s.lkg_gps_longitude,
                        altitude: s.lkg_gps_altitude,
                    };
                    result = GpsStatus::Full;
                }
            }
        }

        // First full fix: every source can stop drawing power.
        if result == GpsStatus::Full {
            self.twi_gps.shutdown();
            self.ugps.shutdown();
            let mut bus = Bus {
                clock: ctx.clock,
                store: &mut *ctx.store,
                port: &mut *ctx.port,
                actions: &mut *ctx.actions,
                deselected: self.currently_deselected,
                oneshot_enabled: false,
            };
            self.fona.gps_shutdown(&mut bus);
            ctx.actions.push(Action::Indicate(Indicator::GpsConnected));
        }

        (result, fix)
    }

    // ==================== Polling ====================

    /// Primary poller, on a fixed cadence from the node timer.
    pub fn poll(&mut self, ctx: &mut CommCtx) {
        if !self.ever_initialized {
            return;
        }

        // First select happens only once the UART is free and boot has
        // settled.
        if self.waiting_for_first_select {
            if ctx.uart.current().is_some() {
                return;
            }
            if ctx.clock.now() < BOOT_DELAY_UNTIL_INIT_SECONDS {
                return;
            }
            self.first_select(ctx);
            self.waiting_for_first_select = false;
            return;
        }

        // Failover: promote to cellular once, then restart on a timer
        // so the primary backhaul gets retested.
        if self.autowan_mode(ctx) == AutowanMode::Failover && self.mode() != CommMode::Fona {
            self.failover_time = ctx.clock.now();
            self.restart_after_failover = true;
            self.select(CommMode::Fona, "failover", ctx);
            return;
        }
        if self.restart_after_failover
            && clock::fire(
                ctx.clock,
                &mut self.failover_time,
                FAILOVER_RESTART_MINUTES * 60,
            )
        {
            ctx.actions.push(Action::RequestRestart);
            return;
        }

        if self.mtu_test {
            self.reselect(ctx);
            self.publish(ctx, UpdateKind::StatsMtuTest);
        }

        let oneshot_enabled = self.oneshot_currently_enabled(ctx);
        if oneshot_enabled {
            if !self.currently_deselected {
                // Hung in init: abort rather than drain the battery.
                if !self.can_send_to_service(ctx) && self.oneshot_powered_up != 0 {
                    if clock::fire(ctx.clock, &mut self.oneshot_powered_up, ONESHOT_ABORT_SECONDS)
                    {
                        self.deselect(ctx);
                        debug!("deselecting comms (oneshot aborted)");
                    }
                    return;
                }

                // Transaction done: keep going until nothing is left.
                if self.oneshot_completed && !self.is_busy(ctx) {
                    self.oneshot_completed = false;
                    if !self.oneshot_service_update(ctx) {
                        self.deselect(ctx);
                        debug!("deselecting comms (no work)");
                        if self.oneshot_powered_up == 0 {
                            self.oneshot_powered_up = ctx.clock.now();
                        }
                    }
                    return;
                }

                // Cap the powered window; one last update gets through
                // first if due.
                if self.can_send_to_service(ctx)
                    && !self.is_busy(ctx)
                    && clock::fire(ctx.clock, &mut self.oneshot_powered_up, ONESHOT_UPDATE_SECONDS)
                {
                    if !self.oneshot_service_update(ctx) {
                        self.deselect(ctx);
                        debug!("deselecting comms (oneshot window over)");
                    }
                    return;
                }
            }

            // Time to power up? Only with the UART free, nothing
            // power-hungry running, and uploads actually pending.
            if self.currently_deselected
                && ctx.uart.current().is_none()
                && (!self.can_send_to_service(ctx) || self.would_be_buffered(ctx))
                && !ctx.any_exclusive_powered_on
                && ctx.any_upload_needed
            {
                let interval = self.get_oneshot_interval(ctx.battery, ctx.store);
                if interval != 0
                    && clock::fire_aligned(ctx.clock, &mut self.last_oneshot, interval)
                {
                    self.stats.apply(StatKind::Oneshot);
                    if self.would_be_buffered(ctx) {
                        // Buffered: drain into flash right now.
                        let mut updates = 0;
                        while self.oneshot_service_update(ctx) {
                            updates += 1;
                        }
                        if updates > 1 {
                            info!("{} oneshots buffered", updates);
                        }
                    } else {
                        // Reselect; the actual update runs on the next
                        // poll once the transport is up.
                        debug!("reselecting comms");
                        self.oneshot_powered_up = ctx.clock.now();
                        self.flush_buffers = false;
                        self.reselect(ctx);
                    }
                }
            }
        }

        // Transport health.
        if !self.currently_deselected {
            let mut bus = Bus {
                clock: ctx.clock,
                store: &mut *ctx.store,
                port: &mut *ctx.port,
                actions: &mut *ctx.actions,
                deselected: self.currently_deselected,
                oneshot_enabled,
            };
            match self.active_mode {
                CommMode::Lora => {
                    if self.lora.needed_to_be_reset(&mut bus) {
                        debug!("lora needed to be reset");
                        return;
                    }
                }
                CommMode::Fona => {
                    if self.fona.needed_to_be_reset(&mut bus) {
                        debug!("fona needed to be reset");
                        return;
                    }
                }
                CommMode::None => return,
            }
        }

        // Optional keep-alive pings.
        if ctx.store.data.flags.contains(StorageFlags::PING)
            && clock::fire(ctx.clock, &mut self.last_service_ping, PING_SERVICE_SECONDS)
        {
            info!("ping");
            self.ping(ctx);
            return;
        }

        // Periodic updates, unless buffering wants tighter timing
        // control.
        if !self.would_be_buffered(ctx) {
            self.oneshot_service_update(ctx);
        }
    }

    /// The boot-time transport choice, given WAN mode and GPS state.
    fn first_select(&mut self, ctx: &mut CommCtx) {
        let mut wan = ctx.store.data.wan;
        if ctx.store.data.dfu_status == DfuStatus::Pending {
            wan = WanMode::Fona;
            info!("DFU {}", ctx.store.data.dfu_filename);
        }

        let gps_full = self.gps_get(ctx).0 == GpsStatus::Full;

        match wan {
            WanMode::None => self.select(CommMode::None, "no comms configured", ctx),

            w if w.is_lora_family() => {
                if self.gps_config.fona_gps && !gps_full {
                    self.select(CommMode::Fona, "lora desired, no GPS yet", ctx);
                } else if self.gps_config.ext_ublox && !gps_full {
                    self.select(CommMode::None, "lora desired, no GPS yet", ctx);
                } else {
                    self.select(CommMode::Lora, "lora desired", ctx);
                }
            }

            WanMode::Fona => {
                if self.gps_config.ext_ublox && !gps_full {
                    self.select(CommMode::None, "fona desired, no GPS yet", ctx);
                } else {
                    self.select(CommMode::Fona, "fona desired", ctx);
                }
            }

            WanMode::Auto => {
                if self.gps_config.fona_gps && !gps_full {
                    self.select(CommMode::Fona, "auto desired, no GPS yet", ctx);
                } else if self.gps_config.ext_ublox && !gps_full {
                    self.select(CommMode::None, "auto desired, no GPS yet", ctx);
                } else {
                    self.select(CommMode::Lora, "auto desired", ctx);
                }
            }

            _ => self.select(CommMode::Lora, "lora desired", ctx),
        }
    }

    // ==================== Service updates ====================

    /// Force a flush: the next sends go out unbuffered.
    pub fn request_flush(&mut self) {
        self.flush_buffers = true;
    }

    /// Schedule a stats update at the next opportunity; `full` owes
    /// the whole ladder starting with the version report.
    pub fn service_update(&mut self, full: bool, ctx: &mut CommCtx) {
        if full {
            self.sent_full_stats = false;
        }
        if self.oneshot_currently_enabled(ctx) {
            self.last_service_update = 0;
        } else {
            self.publish(ctx, UpdateKind::Stats);
        }
        self.request_flush();
    }

    /// One transaction with the service, highest-priority update
    /// first. Returns true when something was accepted for send.
    pub fn oneshot_service_update(&mut self, ctx: &mut CommCtx) -> bool {
        if !self.would_be_buffered(ctx) && self.can_send_to_service(ctx) {
            let interval = self.get_service_update_interval(ctx.battery);
            if clock::fire(ctx.clock, &mut self.last_service_update, interval) {
                // Starting a full round: work out which snapshots exist
                // to send at all.
                if !self.sent_full_stats {
                    let s = &ctx.store.data;
                    self.ladder.dev = s.device_params_as_string().is_none();
                    self.ladder.svc = s.service_params_as_string().is_none();
                    self.ladder.ttn = s.ttn_params_as_string().is_none();
                    self.ladder.gps = s.gps_params_as_string().is_none();
                    self.ladder.sen = s.sensor_params_as_string().is_none();
                    self.ladder.dfu = s.dfu_state_as_string().is_none();
                    let cellular = self.mode() == CommMode::Fona;
                    self.ladder.cell1 = !cellular;
                    self.ladder.cell2 = !cellular;
                }

                let mut sent_stats = false;
                let sent_something;
                if !self.sent_full_stats {
                    self.sent_full_stats = self.publish(ctx, UpdateKind::StatsVersion);
                    sent_something = self.sent_full_stats;
                } else if !self.ladder.dev {
                    self.ladder.dev = self.publish(ctx, UpdateKind::StatsConfigDev);
                    sent_something = self.ladder.dev;
                } else if !self.ladder.gps {
                    self.ladder.gps = self.publish(ctx, UpdateKind::StatsConfigGps);
                    sent_something = self.ladder.gps;
                } else if !self.ladder.svc {
                    self.ladder.svc = self.publish(ctx, UpdateKind::StatsConfigSvc);
                    sent_something = self.ladder.svc;
                } else if !self.ladder.ttn {
                    self.ladder.ttn = self.publish(ctx, UpdateKind::StatsConfigTtn);
                    sent_something = self.ladder.ttn;
                } else if !self.ladder.sen {
                    self.ladder.sen = self.publish(ctx, UpdateKind::StatsConfigSen);
                    sent_something = self.ladder.sen;
                } else if !self.ladder.dfu {
                    self.ladder.dfu = self.publish(ctx, UpdateKind::StatsDfu);
                    sent_something = self.ladder.dfu;
                } else if !self.ladder.cell1 {
                    self.ladder.cell1 = self.publish(ctx, UpdateKind::StatsCell1);
                    sent_something = self.ladder.cell1;
                } else if !self.ladder.cell2 {
                    self.ladder.cell2 = self.publish(ctx, UpdateKind::StatsCell2);
                    sent_something = self.ladder.cell2;
                } else {
                    sent_stats = self.publish(ctx, UpdateKind::Stats);
                    sent_something = sent_stats;
                }

                // Anything still owed: come straight back, unbuffered.
                if !self.sent_full_stats || !self.ladder.complete() || !sent_stats {
                    self.last_service_update = 0;
                    self.request_flush();
                }
                return sent_something;
            }
        }

        // No ladder work due: flush pending sensor readings.
        self.publish(ctx, UpdateKind::Normal)
    }

    fn publish(&mut self, ctx: &mut CommCtx, kind: UpdateKind) -> bool {
        let bus = Bus {
            clock: ctx.clock,
            store: &mut *ctx.store,
            port: &mut *ctx.port,
            actions: &mut *ctx.actions,
            deselected: self.currently_deselected,
            oneshot_enabled: false,
        };
        let transport: Option<&mut dyn Transport> = match self.active_mode {
            CommMode::Lora => Some(&mut self.lora),
            CommMode::Fona => Some(&mut self.fona),
            CommMode::None => None,
        };
        let mut uplink = Uplink { transport, bus };
        ctx.publisher.send_update(kind, &mut uplink)
    }

    fn ping(&mut self, ctx: &mut CommCtx) {
        let bus = Bus {
            clock: ctx.clock,
            store: &mut *ctx.store,
            port: &mut *ctx.port,
            actions: &mut *ctx.actions,
            deselected: self.currently_deselected,
            oneshot_enabled: false,
        };
        let transport: Option<&mut dyn Transport> = match self.active_mode {
            CommMode::Lora => Some(&mut self.lora),
            CommMode::Fona => Some(&mut self.fona),
            CommMode::None => None,
        };
        let mut uplink = Uplink { transport, bus };
        ctx.publisher.send_ping(&mut uplink);
    }

    // ==================== Operator CLI ====================

    /// One-screen summary of the comm state.
    pub fn show_state(&mut self, ctx: &mut CommCtx) {
        if !self.oneshot_currently_enabled(ctx) {
            info!("oneshot disabled");
            return;
        }
        if !self.currently_deselected {
            info!("oneshot ({:?}) currently selected", self.active_mode);
            return;
        }
        let interval = self.get_oneshot_interval(ctx.battery, ctx.store);
        let now = ctx.clock.now();
        let elapsed = now.saturating_sub(self.last_oneshot);
        info!(
            "oneshot ({:?}) deselected; next ({}m) in {}s",
            self.active_mode,
            interval / 60,
            interval.saturating_sub(elapsed)
        );
        info!(
            "  uart {}, svc {}, {}, {} uploads",
            if ctx.uart.current().is_none() { "avail" } else { "busy" },
            if self.can_send_to_service(ctx) { "avail" } else { "unavail" },
            if self.would_be_buffered(ctx) { "buffered" } else { "unbuffered" },
            if ctx.any_upload_needed { "pending" } else { "no" },
        );
    }

    /// Dump and probe the selected transport.
    pub fn request_state(&mut self, ctx: &mut CommCtx) {
        let mut bus = Bus {
            clock: ctx.clock,
            store: &mut *ctx.store,
            port: &mut *ctx.port,
            actions: &mut *ctx.actions,
            deselected: self.currently_deselected,
            oneshot_enabled: false,
        };
        match self.active_mode {
            CommMode::Lora => self.lora.request_state(&mut bus),
            CommMode::Fona => self.fona.request_state(&mut bus),
            CommMode::None => info!("no comms selected"),
        }
    }
}
