//! Cellular transport state machine (SIM5320-class modem).
//!
//! A large table-driven automaton: one-way bring-up gated on the
//! recognized replies of each AT command, a carrier-search loop on
//! `AT+CPSI`, deferred UDP/HTTP sends that stream their payload on the
//! modem's `>` prompt, and a firmware-download subflow. Suspension is
//! explicit: `process()` returns when it needs more bytes and the
//! next completion event resumes at the current state. Nested state
//! entry (`Flow::Goto`) is a loop, bounded by the number of states.

use log::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::cmdbuf::{CmdBuf, Stream};
use crate::event::EventQueue;
use crate::gps::{degrees_from_ddmm, GpsFix, GpsStatus, GPS_ABORT_MINUTES};
use crate::storage::{DfuError, DfuStatus, WanMode};
use crate::telecast::{self, InboundClass};

use super::shared::{
    Action, Bus, Indicator, ModemPort, ReplyType, StatKind, Transport,
    BOOT_DELAY_UNTIL_INIT_SECONDS, CELL_WATCHDOG_SECONDS, DFU_WATCHDOG_SECONDS, STATE_COMPLETE,
    STATE_IDLE,
};

/// Capacity of the deferred I/O buffer (outbound payloads and the
/// accumulated HTTP reply body).
pub const DEFERRED_CAPACITY: usize = 600;

/// Local port for the UDP socket open.
const UDP_LOCAL_PORT: u16 = 9000;

/// FTP control port for firmware downloads.
const DFU_FTP_PORT: u16 = 8083;

/// FTP password for firmware downloads.
const DFU_FTP_PASSWORD: &str = "device-firmware";

/// Download progress is logged every this many bytes.
const DFU_PROGRESS_BYTES: u32 = 25_000;

/// SIM ICCID prefix to carrier APN.
const ICCID_APN_MAP: &[(&str, &str)] = &[
    ("890126", "wireless.twilio.com"),
    ("891030", "openroamer.com"),
    ("890117", "m2m.com.attz"),
];

/// States of the cellular automaton. `Idle`/`Complete` are the shared
/// sentinels; the rest are device-specific reply states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FonaState {
    Idle = 0,
    Complete = 1,
    EchoRpl = 100,
    InitCompleted = 101,
    ResetReq = 102,
    CresetRpl = 103,
    CpsiRpl = 104,
    CgsockcontRpl = 105,
    CsocksetpnRpl = 106,
    CipmodeRpl = 107,
    NetopenRpl = 108,
    CipopenRpl = 109,
    ChttpsStartRpl = 110,
    ChttpsOpseRpl = 111,
    ChttpsSendRpl = 112,
    ChttpsSend2Rpl = 113,
    ChttpsRecvRpl = 114,
    ChttpsClseRpl = 115,
    CgfuncRpl1 = 116,
    CgfuncRpl2 = 117,
    CgpsInfo3Rpl = 118,
    IfcRpl2 = 119,
    CgpsRpl = 120,
    CgpsInfoRpl = 121,
    CpinRpl = 122,
    CgpsInfo2Rpl = 123,
    MiscRpl = 124,
    StartRpl = 125,
    EchoRpl2 = 126,
    CiccidRpl = 127,
    Cpsi0Rpl = 128,
    CdnsgipRpl = 129,
    DfuBegin = 130,
    DfuRpl0 = 131,
    DfuRpl1 = 132,
    DfuRpl2 = 133,
    DfuRpl3 = 134,
    DfuRpl4 = 135,
    DfuRpl5 = 136,
    DfuRpl6 = 137,
    DfuRpl7 = 138,
    DfuRpl8 = 139,
    DfuRpl9 = 140,
    DfuValidate = 141,
    DfuPrepare = 142,
}

impl FonaState {
    pub fn from_tag(tag: u16) -> FonaState {
        use FonaState::*;
        match tag {
            1 => Complete,
            100 => EchoRpl,
            101 => InitCompleted,
            102 => ResetReq,
            103 => CresetRpl,
            104 => CpsiRpl,
            105 => CgsockcontRpl,
            106 => CsocksetpnRpl,
            107 => CipmodeRpl,
            108 => NetopenRpl,
            109 => CipopenRpl,
            110 => ChttpsStartRpl,
            111 => ChttpsOpseRpl,
            112 => ChttpsSendRpl,
            113 => ChttpsSend2Rpl,
            114 => ChttpsRecvRpl,
            115 => ChttpsClseRpl,
            116 => CgfuncRpl1,
            117 => CgfuncRpl2,
            118 => CgpsInfo3Rpl,
            119 => IfcRpl2,
            120 => CgpsRpl,
            121 => CgpsInfoRpl,
            122 => CpinRpl,
            123 => CgpsInfo2Rpl,
            124 => MiscRpl,
            125 => StartRpl,
            126 => EchoRpl2,
            127 => CiccidRpl,
            128 => Cpsi0Rpl,
            129 => CdnsgipRpl,
            130 => DfuBegin,
            131 => DfuRpl0,
            132 => DfuRpl1,
            133 => DfuRpl2,
            134 => DfuRpl3,
            135 => DfuRpl4,
            136 => DfuRpl5,
            137 => DfuRpl6,
            138 => DfuRpl7,
            139 => DfuRpl8,
            140 => DfuRpl9,
            141 => DfuValidate,
            142 => DfuPrepare,
            _ => Idle,
        }
    }
}

// Confirm the sentinels line up with the shared tags.
const _: () = assert!(FonaState::Idle as u16 == STATE_IDLE);
const _: () = assert!(FonaState::Complete as u16 == STATE_COMPLETE);

/// What a state handler wants next: wait for more bytes, or enter a
/// new state synchronously within this invocation.
enum Flow {
    Stay,
    Goto(FonaState),
}

/// Outcome of the universal-reply check.
enum Common {
    No,
    Handled,
    Goto(FonaState),
}

#[derive(Default)]
struct Deferred {
    active: bool,
    done_after_callback: bool,
    callback_requested: bool,
    buf: Vec<u8>,
    request_type: Option<ReplyType>,
    /// The HTTP reply outgrew the buffer; discard instead of decoding
    /// a truncated body.
    truncated: bool,
}

#[derive(Default)]
struct FonaGpsState {
    shutdown: bool,
    send_shutdown_when_idle: bool,
    have_location: bool,
    update_location: bool,
    data_parsed: bool,
    fix: GpsFix,
}

/// The cellular transport.
pub struct Fona {
    cmd: CmdBuf,
    apn: String,
    service_ipv4: String,
    gps: FonaGpsState,
    first_reset_after_init: bool,
    /// Once the carrier is reached, never fall back to LoRa on a
    /// transient failure.
    lock: bool,
    hardware_flow_control: bool,
    watchdog_set_time: u32,
    watchdog_extend: bool,
    init_completed: bool,
    init_in_progress: bool,
    init_last_initiated: u32,
    dfu_in_progress: bool,
    validate_download: bool,
    no_network: bool,
    received_since_powerup: u32,
    deferred: Deferred,
    awaiting_service_reply: bool,
    dfu_total_packets: u32,
    dfu_total_length: u32,
    dfu_last_logged_length: u32,
    /// SIM ICCID, once read, for the Cell1 stats update.
    pub sim_iccid: Option<String>,
    /// Carrier registration summary, for the Cell2 stats update.
    pub carrier_info: Option<String>,
    /// Maintained by the supervisor: we are the selected transport and
    /// own the UART.
    pub(crate) selected: bool,
}

impl Fona {
    pub fn new() -> Self {
        Self {
            cmd: CmdBuf::new(Stream::Fona),
            apn: String::new(),
            service_ipv4: String::new(),
            gps: FonaGpsState::default(),
            first_reset_after_init: true,
            lock: false,
            hardware_flow_control: false,
            watchdog_set_time: 0,
            watchdog_extend: false,
            init_completed: false,
            init_in_progress: false,
            init_last_initiated: 0,
            dfu_in_progress: false,
            validate_download: false,
            no_network: false,
            received_since_powerup: 0,
            deferred: Deferred::default(),
            awaiting_service_reply: false,
            dfu_total_packets: 0,
            dfu_total_length: 0,
            dfu_last_logged_length: 0,
            sim_iccid: None,
            carrier_info: None,
            selected: false,
        }
    }

    /// Bench shortcut to an online, idle transport.
    #[cfg(test)]
    pub(crate) fn force_online(&mut self, ipv4: &str) {
        self.init_completed = true;
        self.init_in_progress = false;
        self.service_ipv4 = ipv4.to_string();
        self.cmd.set_state(FonaState::Idle as u16);
    }

    /// Bench shortcut to a cached location.
    #[cfg(test)]
    pub(crate) fn set_gps_fix(&mut self, fix: GpsFix) {
        self.gps.fix = fix;
        self.gps.have_location = true;
        self.gps.data_parsed = true;
    }

    pub fn state(&self) -> FonaState {
        FonaState::from_tag(self.cmd.state())
    }

    pub fn no_network(&self) -> bool {
        self.no_network
    }

    pub fn is_locked(&self) -> bool {
        self.lock
    }

    /// Force GPS re-acquisition at the next initialization.
    pub fn gps_update(&mut self) {
        self.gps.update_location = true;
        self.gps.shutdown = false;
    }

    fn set_state(&mut self, state: FonaState, clock: &Clock) {
        if self.cmd.set_state(state as u16) {
            self.watchdog_reset(clock.now());
        }
    }

    /// Enter a state and run its handler synchronously, following any
    /// further nested transitions. Bounded: the chain can visit each
    /// state at most once per trigger.
    fn run_state(&mut self, state: FonaState, bus: &mut Bus) {
        let mut flow = Flow::Goto(state);
        while let Flow::Goto(next) = flow {
            self.set_state(next, bus.clock);
            flow = self.dispatch(bus);
        }
    }

    /// Handle replies that mean the same thing in every state.
    fn common_reply(&mut self, bus: &mut Bus) -> Common {
        // Any state that needs special handling of "error" does so
        // before calling here.
        if self.cmd.this_arg_is("error") {
            debug!("ERROR({:?})", self.state());
            return Common::Goto(FonaState::ResetReq);
        }

        // Spontaneous reset banner, typically from a power dip.
        if self.cmd.this_arg_is("start") {
            warn!("spontaneous modem reset in state {:?}", self.state());
            bus.actions.push(Action::Stat(StatKind::Error));
            return Common::Goto(FonaState::StartRpl);
        }

        if self.cmd.this_arg_is("+ciperror:") {
            self.cmd.next_arg();
            debug!("CIPERROR({:?}) {}", self.state(), self.cmd.rest());
            return Common::Goto(FonaState::ResetReq);
        }

        if self.cmd.this_arg_is("+cme") {
            self.cmd.next_arg();
            if self.cmd.this_arg_is("error:") {
                self.cmd.next_arg();
                let detail = self.cmd.rest().to_string();
                if detail.starts_with("SIM failure") {
                    self.no_network = true;
                } else if detail.starts_with("SIM busy") {
                    // Transient while the SIM settles after reset.
                } else {
                    debug!("CME ERROR({:?}) '{}'", self.state(), detail);
                }
            }
            return Common::Handled;
        }

        // Map the SIM's ICCID prefix to a carrier APN.
        if self.cmd.this_arg_is("+iccid:") {
            self.cmd.next_arg();
            let iccid = self.cmd.rest().to_string();
            self.sim_iccid = Some(iccid.clone());
            for (prefix, apn) in ICCID_APN_MAP {
                if iccid.starts_with(prefix) {
                    self.apn = apn.to_string();
                }
            }
            if self.apn.is_empty() {
                warn!("can't set APN; unrecognized SIM ICCID: '{}'", iccid);
            }
            return Common::Handled;
        }

        // Unsolicited GPS reports arrive in any state once enabled.
        if self.cmd.this_arg_is("+cgpsinfo:*") {
            bus.actions.push(Action::Indicate(Indicator::GpsConnecting));
            self.gps.data_parsed = true;
            self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let lat = self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let lat_ns = self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let lon = self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let lon_ew = self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let _utc_date = self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let _utc_time = self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let alt = self.cmd.next_arg();
            if !lat.is_empty() && !lon.is_empty() && !alt.is_empty() {
                if let (Some(latitude), Some(longitude)) = (
                    degrees_from_ddmm(&lat, &lat_ns),
                    degrees_from_ddmm(&lon, &lon_ew),
                ) {
                    let mut altitude: f64 = alt.parse().unwrap_or(0.0);
                    // The receiver reports negative altitude even well
                    // above sea level.
                    if altitude < 0.0 {
                        altitude = -altitude;
                    }
                    let fix = GpsFix {
                        latitude,
                        longitude,
                        altitude,
                    };
                    // Save last-known-good on the first acquisition only.
                    if !self.gps.have_location || self.gps.update_location {
                        bus.store.data.lkg_gps_latitude = fix.latitude;
                        bus.store.data.lkg_gps_longitude = fix.longitude;
                        bus.store.data.lkg_gps_altitude = fix.altitude;
                        bus.store.save();
                    }
                    self.gps.fix = fix;
                    self.gps.have_location = true;
                    self.gps.update_location = false;
                }
            }
            // The fan-in shuts every GPS source down once one is full.
            bus.actions.push(Action::GpsCheck);
            return Common::Handled;
        }

        Common::No
    }

    fn dfu_terminate(&mut self, error: DfuError, bus: &mut Bus) {
        if self.dfu_in_progress {
            bus.store.data.dfu_status = DfuStatus::Idle;
            bus.store.data.dfu_error = error;
            if error == DfuError::None {
                bus.store.data.dfu_count += 1;
                info!(
                    "DFU ({}/{}) completed successfully",
                    self.dfu_total_packets, self.dfu_total_length
                );
            } else {
                warn!(
                    "DFU ({}/{}) error: {:?}",
                    self.dfu_total_packets, self.dfu_total_length, error
                );
            }
            bus.store.save();
            bus.actions.push(Action::RequestRestart);
            self.dfu_in_progress = false;
        }
        self.set_state(FonaState::Idle, bus.clock);
    }

    /// Request shutdown, transferring control as configured.
    fn transfer_control(&mut self, bus: &mut Bus) {
        if bus.store.data.wan == WanMode::Fona {
            bus.actions.push(Action::SelectNone);
        } else {
            bus.actions.push(Action::SelectLora);
        }
    }

    // ==================== Deferred I/O ====================

    /// Build the HTTP POST and queue it behind a `>` prompt, once the
    /// HTTPS session is open.
    fn http_start_send(&mut self, bus: &mut Bus) {
        let hexified_length = self.deferred.buf.len() * 2;
        let header = format!(
            "POST /send HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: TTRELAY\r\nContent-Length: {}\r\n\r\n",
            self.service_ipv4, bus.store.data.service_http_port, hexified_length
        );
        let mut body = header.into_bytes();
        for &byte in self.deferred.buf.iter() {
            if body.len() + 2 > DEFERRED_CAPACITY - 2 {
                break;
            }
            let (hi, lo) = telecast::hex_chars(byte);
            body.push(hi);
            body.push(lo);
        }
        bus.actions
            .push(Action::Stat(StatKind::Sent(body.len() as u32)));
        self.deferred.buf = body;
        self.deferred.callback_requested = true;
        let command = format!("at+chttpssend={}", self.deferred.buf.len());
        bus.port.send_line(&command);
    }

    fn http_start_receive(&mut self, bus: &mut Bus) {
        self.deferred.buf.clear();
        self.deferred.truncated = false;
        bus.port
            .send_line(&format!("at+chttpsrecv={}", DEFERRED_CAPACITY));
    }

    /// Accumulate a reply line if and only if it looks like hex data,
    /// the shortcut that skips real HTTP header parsing.
    fn http_append_received(&mut self, line: &str) {
        if !telecast::is_hex_payload(line) {
            return;
        }
        for &byte in line.as_bytes() {
            if byte <= b' ' {
                continue;
            }
            if self.deferred.buf.len() >= DEFERRED_CAPACITY {
                self.deferred.truncated = true;
                return;
            }
            self.deferred.buf.push(byte);
        }
    }

    fn http_process_received(&mut self, bus: &mut Bus) {
        // One receive window only, for power reasons; anything we miss
        // arrives with the next request.
        self.awaiting_service_reply = false;

        if self.deferred.truncated {
            warn!(
                "service reply exceeded {} bytes, discarded",
                DEFERRED_CAPACITY
            );
            bus.actions.push(Action::Stat(StatKind::Error));
        } else if !self.deferred.buf.is_empty() {
            bus.actions.push(Action::Stat(StatKind::Received(
                self.deferred.buf.len() as u32,
            )));
            let text = String::from_utf8_lossy(&self.deferred.buf).into_owned();
            let (class, message) =
                telecast::decode_received_message(&text, bus.store.data.device_id, "");
            match (class, message) {
                (InboundClass::ReplyTtserve, Some(message)) => {
                    let body = message.message.unwrap_or_default();
                    bus.actions.push(Action::ReceivedFromService(body));
                }
                _ => {
                    // Typically an HTTP error page in the body.
                    debug!("?: {}", text);
                }
            }
        }

        self.deferred.active = false;
        bus.actions.push(Action::OneshotCompleted);
    }

    /// True while a request awaiting a service reply is in flight.
    pub fn awaiting_service_reply(&self) -> bool {
        self.awaiting_service_reply
    }

    /// Stream the queued payload after the modem's `>` prompt.
    pub fn process_deferred(&mut self, bus: &mut Bus) {
        debug!(
            "deferred {} bytes ({:?})",
            self.deferred.buf.len(),
            self.deferred.request_type
        );
        for i in 0..self.deferred.buf.len() {
            bus.port.send_byte(self.deferred.buf[i]);
        }
        self.deferred.callback_requested = false;
        if self.deferred.done_after_callback {
            self.deferred.active = false;
            bus.actions.push(Action::OneshotCompleted);
        }
    }

    // ==================== State dispatch ====================

    fn dispatch(&mut self, bus: &mut Bus) -> Flow {
        use FonaState::*;
        match self.state() {
            // ----- Initialization -----
            ResetReq => {
                if bus.deselected {
                    self.reset(true, bus);
                    return Flow::Stay;
                }
                if !self.first_reset_after_init {
                    bus.actions.push(Action::Stat(StatKind::Reset));
                    info!("cell initializing (reset)");
                } else {
                    info!("cell initializing");
                }
                self.watchdog_reset(bus.clock.now());
                self.no_network = false;
                self.init_completed = false;
                self.init_in_progress = true;
                self.init_last_initiated = bus.clock.now();
                self.gps.send_shutdown_when_idle = false;
                self.deferred = Deferred::default();
                self.awaiting_service_reply = false;
                if self.apn.is_empty() {
                    self.apn = bus.store.data.carrier_apn.clone();
                }
                bus.actions
                    .push(Action::Indicate(Indicator::CellInitializing));
                // A full chip reset is needed before the first GPS
                // enable will stick; skip it only when the location is
                // already cached (oneshot fast path) or a DFU boot
                // wants to get online quickly.
                if self.dfu_in_progress
                    || (self.first_reset_after_init
                        && self.gps.have_location
                        && !self.gps.update_location)
                {
                    self.first_reset_after_init = false;
                    bus.port.send_line("ate0");
                    self.set_state(EchoRpl2, bus.clock);
                } else {
                    // Flow control must be disabled before the reset so
                    // the chip comes out of it reachable; the setting
                    // persists across resets.
                    bus.port.send_line("at+cgfunc=11,0");
                    self.set_state(CgfuncRpl1, bus.clock);
                }
                Flow::Stay
            }

            CgfuncRpl1 => {
                if self.cmd.this_arg_is("ok") {
                    bus.port.send_line("at+creset");
                    self.set_state(CresetRpl, bus.clock);
                }
                Flow::Stay
            }

            CresetRpl => {
                // "start" must be taken here, ahead of the universal
                // handler, or the reset banner would restart us.
                if self.cmd.this_arg_is("start") {
                    self.cmd.seen(0x01);
                } else if self.cmd.this_arg_is("+cpin: ready") {
                    self.cmd.seen(0x02);
                } else if self.cmd.this_arg_is("pb done") {
                    // The SIM needs about a second after PB DONE or the
                    // next command draws "+CME ERROR: SIM busy".
                    self.cmd.seen(0x04);
                } else {
                    match self.common_reply(bus) {
                        Common::No => {}
                        Common::Handled => return Flow::Stay,
                        Common::Goto(next) => return Flow::Goto(next),
                    }
                }
                if self.cmd.all_seen(0x07) {
                    bus.port.send_line("ate0");
                    self.set_state(EchoRpl, bus.clock);
                }
                Flow::Stay
            }

            StartRpl => {
                bus.port.send_line("ate0");
                self.set_state(EchoRpl, bus.clock);
                Flow::Stay
            }

            EchoRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    if self.hardware_flow_control {
                        bus.port.send_line("at+cgfunc=11,1");
                    } else {
                        bus.port.send_line("at+cgfunc=11,0");
                    }
                    self.set_state(CgfuncRpl2, bus.clock);
                }
                Flow::Stay
            }

            CgfuncRpl2 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    if self.hardware_flow_control {
                        bus.port.send_line("at+ifc=2,2");
                        self.set_state(IfcRpl2, bus.clock);
                    } else {
                        // No at+ifc without cgfunc=11,1; this OK stands
                        // in for the one IfcRpl2 would have waited on.
                        return self.after_flow_control(bus);
                    }
                }
                Flow::Stay
            }

            IfcRpl2 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    return self.after_flow_control(bus);
                }
                Flow::Stay
            }

            CgpsRpl => {
                // ERROR is tolerated: GPS may already be enabled via
                // autostart.
                if self.cmd.this_arg_is("error") || self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                } else {
                    match self.common_reply(bus) {
                        Common::No => {}
                        Common::Handled => return Flow::Stay,
                        Common::Goto(next) => return Flow::Goto(next),
                    }
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+cgpsinfo=10");
                    self.set_state(CgpsInfoRpl, bus.clock);
                }
                Flow::Stay
            }

            CgpsInfoRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    // This path is only taken on first power-on init;
                    // oneshot re-inits take the cached-location fast
                    // path. Decide whether the network is wanted.
                    match bus.store.data.wan {
                        // Explicit cellular must connect.
                        WanMode::Fona => {}
                        // Auto starts on cellular only until GPS locks;
                        // failover brings us back later.
                        WanMode::Auto => self.no_network = true,
                        // Every other mode drops cellular once GPS locks.
                        _ => self.no_network = true,
                    }
                    if self.no_network {
                        return Flow::Goto(InitCompleted);
                    }
                    bus.port.send_line("at+cpin?");
                    self.set_state(CpinRpl, bus.clock);
                }
                Flow::Stay
            }

            CgpsInfo2Rpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+cgpsinfocfg=0");
                    self.set_state(CgpsInfo3Rpl, bus.clock);
                }
                Flow::Stay
            }

            CgpsInfo3Rpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+cgps=0");
                    self.set_state(MiscRpl, bus.clock);
                }
                Flow::Stay
            }

            CpinRpl => {
                // The universal handler picks up "+CME ERROR" when no
                // SIM is present.
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => {
                        if self.no_network {
                            return Flow::Goto(InitCompleted);
                        }
                        return Flow::Stay;
                    }
                    Common::Goto(next) => {
                        if self.no_network {
                            return Flow::Goto(InitCompleted);
                        }
                        return Flow::Goto(next);
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    bus.port.send_line("at+cpsi=5");
                    self.set_state(CpsiRpl, bus.clock);
                }
                Flow::Stay
            }

            // Fast-path entry when re-initializing with a cached fix.
            EchoRpl2 => {
                bus.port.send_line("at+cpsi=5");
                self.set_state(CpsiRpl, bus.clock);
                Flow::Stay
            }

            // The carrier-search loop; we stay here until online.
            CpsiRpl => {
                let mut retry = false;
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.no_network {
                    return Flow::Goto(InitCompleted);
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                } else if self.cmd.this_arg_is("+cpsi:") {
                    self.cmd.next_arg();
                    if self.cmd.this_arg_is("no service") {
                        bus.actions.push(Action::Indicate(Indicator::CellNoService));
                        info!("cell looking for service");
                        retry = true;
                    } else {
                        self.cmd.this_arg_is("*");
                        let sysmode = self.cmd.next_arg();
                        if self.cmd.this_arg_is("online") {
                            self.cmd.seen(0x02);
                            self.cmd.this_arg_is("*");
                            self.cmd.next_arg();
                            self.cmd.this_arg_is("*");
                            let mcc = self.cmd.next_arg();
                            self.cmd.this_arg_is("*");
                            let mnc = self.cmd.next_arg();
                            self.cmd.this_arg_is("*");
                            let lac = self.cmd.next_arg();
                            self.cmd.this_arg_is("*");
                            let cellid = self.cmd.next_arg();
                            self.carrier_info =
                                Some(format!("{},{},{},{},{}", sysmode, mcc, mnc, lac, cellid));
                        } else {
                            retry = true;
                        }
                    }
                }
                if self.cmd.all_seen(0x03) {
                    bus.actions
                        .push(Action::Indicate(Indicator::CellInitializing));
                    bus.port.send_line("at+cpsi=0");
                    self.set_state(Cpsi0Rpl, bus.clock);
                } else if retry {
                    if bus.deselected {
                        self.reset(true, bus);
                    } else {
                        self.watchdog_reset(bus.clock.now());
                    }
                }
                Flow::Stay
            }

            Cpsi0Rpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    if !self.apn.is_empty() {
                        return Flow::Goto(CiccidRpl);
                    }
                    bus.port.send_line("at+ciccid");
                    self.set_state(CiccidRpl, bus.clock);
                }
                Flow::Stay
            }

            CiccidRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.apn.is_empty() {
                    return Flow::Stay;
                }
                let command = format!("at+cgsockcont=1,\"IP\",\"{}\"", self.apn);
                bus.port.send_line(&command);
                self.set_state(CgsockcontRpl, bus.clock);
                Flow::Stay
            }

            CgsockcontRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+csocksetpn=1");
                    self.set_state(CsocksetpnRpl, bus.clock);
                }
                Flow::Stay
            }

            CsocksetpnRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+cipmode=0");
                    self.set_state(CipmodeRpl, bus.clock);
                }
                Flow::Stay
            }

            CipmodeRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+netopen");
                    self.set_state(NetopenRpl, bus.clock);
                }
                Flow::Stay
            }

            NetopenRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.this_arg_is("+netopen: 0") {
                    self.cmd.seen(0x02);
                }
                // APN accepted but no data service yet: loop back to
                // the carrier search.
                if self.cmd.this_arg_is("+netopen: 1") {
                    bus.actions.push(Action::Indicate(Indicator::CellNoService));
                    info!("waiting for data service");
                    bus.port.send_line("at+cpsi=5");
                    self.set_state(CpsiRpl, bus.clock);
                    return Flow::Stay;
                }
                if self.cmd.all_seen(0x03) {
                    self.service_ipv4 = bus.store.data.service_addr.clone();
                    let command = format!("at+cdnsgip=\"{}\"", self.service_ipv4);
                    bus.port.send_line(&command);
                    self.set_state(CdnsgipRpl, bus.clock);
                }
                Flow::Stay
            }

            CdnsgipRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                } else if self.cmd.this_arg_is("+cdnsgip: *") {
                    self.cmd.next_arg();
                    self.cmd.this_arg_is("*");
                    let err = self.cmd.next_arg();
                    self.cmd.this_arg_is("*");
                    let _host = self.cmd.next_arg();
                    self.cmd.this_arg_is("*");
                    let resolved = self.cmd.next_arg();
                    if err.trim() == "1" {
                        self.service_ipv4 = resolved
                            .chars()
                            .filter(|&c| c != '"')
                            .take(31)
                            .collect();
                    }
                }
                if self.cmd.all_seen(0x01) {
                    bus.port
                        .send_line(&format!("at+cipopen=0,\"UDP\",,,{}", UDP_LOCAL_PORT));
                    self.set_state(CipopenRpl, bus.clock);
                }
                Flow::Stay
            }

            CipopenRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+chttpsstart");
                    self.set_state(ChttpsStartRpl, bus.clock);
                }
                Flow::Stay
            }

            ChttpsStartRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    return Flow::Goto(InitCompleted);
                }
                Flow::Stay
            }

            InitCompleted => {
                self.init_in_progress = false;
                self.init_completed = true;
                self.set_state(Idle, bus.clock);
                if self.dfu_in_progress {
                    if self.no_network {
                        self.dfu_terminate(DfuError::NoNetwork, bus);
                        return Flow::Stay;
                    }
                    return Flow::Goto(DfuBegin);
                }
                if !self.no_network {
                    bus.actions.push(Action::Indicate(Indicator::CellConnected));
                    info!("cell online");
                    // Never fall back to LoRa once the carrier worked.
                    self.lock = true;
                    bus.actions.push(Action::SelectCompleted);
                    bus.actions.push(Action::RequestServiceUpdate);
                } else {
                    info!("cell waiting for GPS");
                }
                Flow::Stay
            }

            // ----- HTTP request/reply -----
            ChttpsOpseRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    self.http_start_send(bus);
                    self.set_state(ChttpsSendRpl, bus.clock);
                }
                Flow::Stay
            }

            ChttpsSendRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line("at+chttpssend");
                    self.set_state(ChttpsSend2Rpl, bus.clock);
                }
                Flow::Stay
            }

            ChttpsSend2Rpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                } else if self.cmd.this_arg_is("+chttps: recv event") {
                    self.cmd.seen(0x02);
                }
                if self.cmd.all_seen(0x03) {
                    self.http_start_receive(bus);
                    self.set_state(ChttpsRecvRpl, bus.clock);
                }
                Flow::Stay
            }

            ChttpsRecvRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    return Flow::Stay;
                }
                if self.cmd.this_arg_is("+chttpsrecv: 0") {
                    self.http_process_received(bus);
                    bus.port.send_line("at+chttpsclse");
                    self.set_state(ChttpsClseRpl, bus.clock);
                } else if self.cmd.this_arg_is("+chttpsrecv: data") {
                    // Length announcement; the data follows.
                } else {
                    let line = self.cmd.line().to_string();
                    self.http_append_received(&line);
                }
                Flow::Stay
            }

            ChttpsClseRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    self.set_state(Idle, bus.clock);
                }
                Flow::Stay
            }

            // ----- Firmware download -----
            DfuBegin => {
                // Remove any stale buttonless-DFU marker.
                bus.port.send_line("at+fsdel=\"dfu.zip\"");
                self.set_state(DfuRpl0, bus.clock);
                Flow::Stay
            }

            DfuRpl0 => {
                // ERROR is the expected reply (the marker should not
                // exist), so no universal handling here.
                bus.port.send_line(&format!(
                    "at+cftpserv=\"{}\"",
                    bus.store.data.service_addr
                ));
                self.set_state(DfuRpl1, bus.clock);
                Flow::Stay
            }

            DfuRpl1 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Basic, bus);
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line(&format!("at+cftpport={}", DFU_FTP_PORT));
                    self.set_state(DfuRpl2, bus.clock);
                }
                Flow::Stay
            }

            DfuRpl2 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Basic, bus);
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port
                        .send_line(&format!("at+cftpun=\"{}\"", bus.store.data.device_id));
                    self.set_state(DfuRpl3, bus.clock);
                }
                Flow::Stay
            }

            DfuRpl3 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Basic, bus);
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port
                        .send_line(&format!("at+cftppw=\"{}\"", DFU_FTP_PASSWORD));
                    self.set_state(DfuRpl4, bus.clock);
                }
                Flow::Stay
            }

            DfuRpl4 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Basic, bus);
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line(&format!(
                        "at+cfsdel=\"{}\"",
                        bus.store.data.dfu_filename
                    ));
                    self.set_state(DfuRpl5, bus.clock);
                }
                Flow::Stay
            }

            DfuRpl5 => {
                // The delete hopefully failed (file not present), so any
                // reply moves us on.
                info!("DFU downloading {}", bus.store.data.dfu_filename);
                bus.port.send_line(&format!(
                    "at+cftpgetfile=\"/{}\",0",
                    bus.store.data.dfu_filename
                ));
                self.set_state(DfuRpl6, bus.clock);
                // Fetching the file takes far longer than the normal
                // watchdog allows.
                self.watchdog_extend = true;
                Flow::Stay
            }

            DfuRpl6 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Basic, bus);
                        self.watchdog_extend = false;
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("+cftpgetfile:") {
                    if self.cmd.this_arg_is("+cftpgetfile: 0") {
                        self.cmd.seen(0x02);
                        info!("DFU downloaded {} successfully", bus.store.data.dfu_filename);
                    } else {
                        self.watchdog_extend = false;
                        self.dfu_terminate(DfuError::GetFile, bus);
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x03) {
                    self.watchdog_extend = false;
                    return Flow::Goto(DfuValidate);
                }
                Flow::Stay
            }

            DfuValidate => {
                if self.validate_download {
                    info!("DFU validating download");
                    // Route the at+cftrantx transfer to the UART.
                    bus.port.send_line("at+catr=1");
                    self.set_state(DfuRpl7, bus.clock);
                    return Flow::Stay;
                }
                Flow::Goto(DfuPrepare)
            }

            DfuRpl7 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Basic, bus);
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    bus.port.send_line(&format!(
                        "at+cftrantx=\"c:/{}\"",
                        bus.store.data.dfu_filename
                    ));
                    self.set_state(DfuRpl8, bus.clock);
                    self.watchdog_extend = true;
                }
                Flow::Stay
            }

            DfuRpl8 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Transfer, bus);
                        self.watchdog_extend = false;
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("+cftrantx:") {
                    if self.cmd.this_arg_is("+cftrantx: 0") {
                        self.cmd.seen(0x02);
                    } else if self.cmd.this_arg_is("+cftrantx: data") {
                        self.cmd.next_arg();
                        self.cmd.this_arg_is("*");
                        let len: u32 = self.cmd.next_arg().trim().parse().unwrap_or(0);
                        self.dfu_total_length += len;
                        self.dfu_total_packets += 1;
                        if self.dfu_total_length - self.dfu_last_logged_length > DFU_PROGRESS_BYTES
                        {
                            info!("{}", self.dfu_total_length);
                            self.dfu_last_logged_length = self.dfu_total_length;
                        }
                        self.watchdog_reset(bus.clock.now());
                    } else {
                        self.dfu_terminate(DfuError::Transfer, bus);
                        self.watchdog_extend = false;
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x03) {
                    info!("DFU download is valid");
                    self.watchdog_extend = false;
                    return Flow::Goto(DfuPrepare);
                }
                Flow::Stay
            }

            DfuPrepare => {
                info!("DFU marking for buttonless update");
                bus.port.send_line(&format!(
                    "at+fscopy=\"{}\",\"dfu.zip\"",
                    bus.store.data.dfu_filename
                ));
                self.set_state(DfuRpl9, bus.clock);
                Flow::Stay
            }

            DfuRpl9 => {
                match self.common_reply(bus) {
                    Common::No => {}
                    _ => {
                        self.dfu_terminate(DfuError::Prepare, bus);
                        return Flow::Stay;
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    self.dfu_terminate(DfuError::None, bus);
                }
                Flow::Stay
            }

            // ----- Steady state -----
            MiscRpl => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                if self.cmd.this_arg_is("ok") {
                    self.cmd.seen(0x01);
                }
                if self.cmd.all_seen(0x01) {
                    self.set_state(Idle, bus.clock);
                }
                Flow::Stay
            }

            Idle | Complete => {
                match self.common_reply(bus) {
                    Common::No => {}
                    Common::Handled => return Flow::Stay,
                    Common::Goto(next) => return Flow::Goto(next),
                }
                self.set_state(Idle, bus.clock);
                Flow::Stay
            }
        }
    }

    /// Flow control is settled; fetch GPS if we still need it,
    /// otherwise go straight to verifying carrier connectivity.
    fn after_flow_control(&mut self, bus: &mut Bus) -> Flow {
        if !self.gps.have_location || self.gps.update_location {
            bus.port.send_line("at+cgps=1");
            self.set_state(FonaState::CgpsRpl, bus.clock);
        } else {
            bus.port.send_line("at+cpsi=5");
            self.set_state(FonaState::CpsiRpl, bus.clock);
        }
        Flow::Stay
    }
}

impl Default for Fona {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Fona {
    fn init(&mut self, bus: &mut Bus) {
        self.cmd = CmdBuf::new(Stream::Fona);
        self.cmd.set_state(FonaState::Idle as u16);
        self.awaiting_service_reply = false;
        self.init_in_progress = false;
        self.init_completed = false;
        self.first_reset_after_init = true;
        self.received_since_powerup = 0;
        self.dfu_in_progress = bus.store.data.dfu_status == DfuStatus::Pending;
    }

    fn term(&mut self) {
        self.init_completed = false;
        self.init_in_progress = false;
        self.cmd.set_state(FonaState::Idle as u16);
        self.deferred = Deferred::default();
        self.gps.send_shutdown_when_idle = false;
    }

    fn reset(&mut self, force: bool, bus: &mut Bus) {
        // A forced (watchdog) reset during DFU terminates the update.
        if force {
            self.dfu_terminate(DfuError::Reset, bus);
        }

        // With power off, just force an idle state.
        if bus.deselected {
            self.init_completed = true;
            self.init_in_progress = false;
            bus.actions.push(Action::Indicate(Indicator::CommsUnknown));
            self.set_state(FonaState::Idle, bus.clock);
            return;
        }

        if !force && self.init_in_progress {
            return;
        }

        self.run_state(FonaState::ResetReq, bus);
    }

    fn can_send_to_service(&self) -> bool {
        self.init_completed
    }

    fn is_busy(&mut self, clock: &Clock) -> bool {
        // A transmit may already be mid-flight; two senders share this
        // transport.
        if self.state() != FonaState::Idle {
            return true;
        }

        if self.gps.send_shutdown_when_idle {
            return true;
        }

        // Waiting on a location refresh; give up after a while.
        if self.gps.update_location {
            if !clock::fire(clock, &mut self.init_last_initiated, GPS_ABORT_MINUTES * 60) {
                return true;
            }
            self.gps.update_location = false;
        }

        if self.no_network {
            return true;
        }

        false
    }

    fn send_to_service(&mut self, payload: &[u8], reply: ReplyType, bus: &mut Bus) -> bool {
        if !self.init_completed {
            return false;
        }
        if self.is_busy(bus.clock) {
            return false;
        }
        if self.deferred.active {
            return false;
        }
        if payload.len() > DEFERRED_CAPACITY {
            return false;
        }

        self.awaiting_service_reply = reply != ReplyType::None;
        self.deferred.active = true;
        self.deferred.buf = payload.to_vec();
        self.deferred.request_type = Some(reply);
        self.deferred.truncated = false;

        if reply == ReplyType::None {
            bus.actions
                .push(Action::Stat(StatKind::Sent(payload.len() as u32)));
            self.deferred.callback_requested = true;
            self.deferred.done_after_callback = true;
            let command = format!(
                "at+cipsend=0,{},\"{}\",{}",
                self.deferred.buf.len(),
                self.service_ipv4,
                bus.store.data.service_udp_port
            );
            bus.port.send_line(&command);
            self.set_state(FonaState::MiscRpl, bus.clock);
        } else {
            self.deferred.done_after_callback = false;
            let command = format!(
                "at+chttpsopse=\"{}\",{},1",
                self.service_ipv4, bus.store.data.service_http_port
            );
            bus.port.send_line(&command);
            self.set_state(FonaState::ChttpsOpseRpl, bus.clock);
        }
        true
    }

    fn watchdog_reset(&mut self, now: u32) {
        self.watchdog_set_time = now;
    }

    fn needed_to_be_reset(&mut self, bus: &mut Bus) -> bool {
        let now = bus.clock.now();

        // A deferred GPS shutdown runs as soon as the FSM is idle.
        if self.gps.send_shutdown_when_idle && self.state() == FonaState::Idle {
            self.gps.send_shutdown_when_idle = false;
            bus.port.send_line("at+cgpsinfo=0");
            self.set_state(FonaState::CgpsInfo2Rpl, bus.clock);
            return true;
        }

        // A modem that has never produced a byte is missing or off.
        if self.received_since_powerup == 0
            && now > BOOT_DELAY_UNTIL_INIT_SECONDS
            && !self.lock
            && !self.init_completed
            && self.init_in_progress
        {
            warn!("cell modem is non-responsive");
            self.no_network = true;
            self.gps_shutdown(bus);
            self.transfer_control(bus);
            return true;
        }

        // Start bring-up once the chip has had time to stabilize.
        if !self.init_completed && !self.init_in_progress && now > BOOT_DELAY_UNTIL_INIT_SECONDS {
            self.reset(false, bus);
            return true;
        }

        // Clock-wrap guard.
        if self.watchdog_set_time > now {
            self.watchdog_reset(now);
        }

        // Only non-idle devices are watchdogged; resetting an idle
        // modem would be pure churn.
        if now >= CELL_WATCHDOG_SECONDS {
            let watchdog_seconds = if self.watchdog_extend {
                DFU_WATCHDOG_SECONDS
            } else {
                CELL_WATCHDOG_SECONDS
            };
            if now - self.watchdog_set_time > watchdog_seconds
                && self.state() != FonaState::Idle
            {
                warn!("watchdog: cell stuck, {}", self.cmd.describe());
                if !bus.oneshot_enabled {
                    self.reset(true, bus);
                } else {
                    // In oneshot mode use the bigger stick so the UART
                    // switch lands back in a known state.
                    bus.actions.push(Action::DeselectReselect);
                }
                bus.actions.push(Action::Stat(StatKind::Error));
                return true;
            }
        }

        false
    }

    fn gps_status(&self) -> GpsStatus {
        if !self.gps.have_location {
            if self.gps.data_parsed {
                GpsStatus::NoLocation
            } else {
                GpsStatus::NoData
            }
        } else {
            GpsStatus::Full
        }
    }

    fn gps_fix(&self) -> Option<GpsFix> {
        if self.gps.have_location {
            Some(self.gps.fix)
        } else {
            None
        }
    }

    fn gps_shutdown(&mut self, bus: &mut Bus) {
        if self.gps.shutdown {
            return;
        }
        self.gps.shutdown = true;
        self.gps.have_location = true;
        self.gps.update_location = false;
        info!("GPS acquired");
        // This can arrive while another transport owns the UART; only
        // queue modem commands when we are the active selection.
        if self.selected && !bus.deselected {
            self.gps.send_shutdown_when_idle = true;
            // If we were only online to find GPS, hand over now.
            if !self.lock && self.no_network {
                self.transfer_control(bus);
            }
        }
    }

    fn process(&mut self, bus: &mut Bus) {
        if !self.cmd.is_complete() {
            return;
        }

        // Traffic before init is an artifact of a previous life.
        if self.state() != FonaState::ResetReq && !self.init_in_progress && !self.init_completed {
            self.set_state(FonaState::Idle, bus.clock);
            return;
        }

        debug!("<{:?} {}", self.state(), self.cmd.line());

        let mut flow = self.dispatch(bus);
        while let Flow::Goto(next) = flow {
            self.set_state(next, bus.clock);
            flow = self.dispatch(bus);
        }

        // Ready for the next line; a drain that surfaces one schedules
        // another pass.
        if self.cmd.reset() {
            bus.actions.push(Action::Enqueue(Stream::Fona));
        }
    }

    fn received_byte(&mut self, byte: u8, events: &mut EventQueue) {
        self.received_since_powerup += 1;
        if self.deferred.callback_requested && byte == b'>' {
            events.enqueue(Stream::FonaDeferred);
        } else if self.cmd.append(byte) {
            events.enqueue(Stream::Fona);
        }
    }

    fn mtu(&self) -> u16 {
        // Half the deferred buffer hex-encodes into it with headroom
        // for the HTTP header.
        (DEFERRED_CAPACITY / 2 - 32) as u16
    }

    fn request_state(&mut self, bus: &mut Bus) {
        info!(
            "fona {}: {}",
            if bus.deselected { "disconnected" } else { "connected" },
            self.cmd.describe()
        );
        bus.port.send_line("at");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::telecast::{encode_hex_body, DeviceType, Telecast};
    use prost::Message;

    /// Everything a Fona needs to run on the bench.
    struct Rig {
        fona: Fona,
        store: Store,
        clock: Clock,
        port: crate::transport::RecordingPort,
        actions: Vec<Action>,
        events: EventQueue,
        deselected: bool,
        oneshot_enabled: bool,
    }

    impl Rig {
        fn new() -> Self {
            let mut rig = Self {
                fona: Fona::new(),
                store: Store::in_memory(),
                clock: Clock::new(),
                port: crate::transport::RecordingPort::new(),
                actions: Vec::new(),
                events: EventQueue::new(),
                deselected: false,
                oneshot_enabled: false,
            };
            let mut bus = Bus {
                clock: &rig.clock,
                store: &mut rig.store,
                port: &mut rig.port,
                actions: &mut rig.actions,
                deselected: false,
                oneshot_enabled: false,
            };
            rig.fona.init(&mut bus);
            rig
        }

        fn poll(&mut self) -> bool {
            let mut bus = Bus {
                clock: &self.clock,
                store: &mut self.store,
                port: &mut self.port,
                actions: &mut self.actions,
                deselected: self.deselected,
                oneshot_enabled: self.oneshot_enabled,
            };
            self.fona.needed_to_be_reset(&mut bus)
        }

        fn feed(&mut self, line: &str) {
            for b in line.bytes() {
                self.fona.received_byte(b, &mut self.events);
            }
            self.fona.received_byte(b'\n', &mut self.events);
            self.drain();
        }

        fn feed_byte(&mut self, byte: u8) {
            self.fona.received_byte(byte, &mut self.events);
            self.drain();
        }

        fn drain(&mut self) {
            while let Some(stream) = self.events.dequeue() {
                let mut bus = Bus {
                    clock: &self.clock,
                    store: &mut self.store,
                    port: &mut self.port,
                    actions: &mut self.actions,
                    deselected: self.deselected,
                    oneshot_enabled: self.oneshot_enabled,
                };
                match stream {
                    Stream::Fona => self.fona.process(&mut bus),
                    Stream::FonaDeferred => self.fona.process_deferred(&mut bus),
                    _ => {}
                }
                // Re-enqueue requests surface as actions.
                let requeues: Vec<_> = self
                    .actions
                    .iter()
                    .filter_map(|a| match a {
                        Action::Enqueue(s) => Some(*s),
                        _ => None,
                    })
                    .collect();
                self.actions.retain(|a| !matches!(a, Action::Enqueue(_)));
                for s in requeues {
                    self.events.enqueue(s);
                }
            }
        }

        /// Boot until the first command goes out.
        fn begin_init(&mut self) {
            self.clock.advance(BOOT_DELAY_UNTIL_INIT_SECONDS + 1);
            assert!(self.poll());
        }

        /// Shortcut to an online, idle transport.
        fn force_online(&mut self) {
            self.fona.force_online("10.0.0.9");
            self.port.clear();
        }

        fn sent(&mut self) -> Vec<String> {
            self.port.take_lines()
        }

        fn has_action(&self, wanted: &Action) -> bool {
            self.actions.iter().any(|a| a == wanted)
        }
    }

    fn drive_gps_fix(rig: &mut Rig) {
        rig.feed("+CGPSINFO:4233.991317,N,07047.040000,W,080120,100500.0,12.0,0.0,0.0");
    }

    // ==================== Bring-up ====================

    #[test]
    fn test_full_init_sequence_to_online() {
        let mut rig = Rig::new();
        rig.store.data.wan = WanMode::Fona;
        rig.begin_init();
        assert_eq!(rig.sent(), vec!["at+cgfunc=11,0"]);

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+creset"]);

        rig.feed("START");
        rig.feed("+CPIN: READY");
        rig.feed("PB DONE");
        assert_eq!(rig.sent(), vec!["ate0"]);

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cgfunc=11,0"]);

        // No hardware flow control: this OK settles flow-control setup
        // and, lacking a location, starts the GPS.
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cgps=1"]);

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cgpsinfo=10"]);

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cpin?"]);

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cpsi=5"]);

        rig.feed("+CPSI: WCDMA,Online,460,01,0F9A,B3EF,154");
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cpsi=0"]);
        assert_eq!(
            rig.fona.carrier_info.as_deref(),
            Some("WCDMA,460,01,0F9A,B3EF")
        );

        // APN arrives via ICCID since storage has none configured.
        rig.feed("+ICCID: 8901260712345678");
        rig.feed("OK");
        assert_eq!(
            rig.sent(),
            vec!["at+cgsockcont=1,\"IP\",\"wireless.twilio.com\""]
        );

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+csocksetpn=1"]);
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cipmode=0"]);
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+netopen"]);

        rig.feed("OK");
        rig.feed("+NETOPEN: 0");
        assert_eq!(rig.sent(), vec!["at+cdnsgip=\"ingest.telecast.io\""]);

        rig.feed("+CDNSGIP: 1,\"ingest.telecast.io\",\"10.0.0.9\"");
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cipopen=0,\"UDP\",,,9000"]);
        assert_eq!(rig.fona.service_ipv4, "10.0.0.9");

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+chttpsstart"]);

        rig.feed("OK");
        assert!(rig.fona.can_send_to_service());
        assert!(rig.fona.is_locked());
        assert!(rig.has_action(&Action::SelectCompleted));
        assert!(rig.has_action(&Action::RequestServiceUpdate));
        assert_eq!(rig.fona.state(), FonaState::Idle);
    }

    #[test]
    fn test_gps_only_wan_shuts_down_after_fix() {
        let mut rig = Rig::new();
        // LoRa is the configured WAN; cellular only sources GPS.
        rig.store.data.wan = WanMode::LoraThenLorawan;
        rig.begin_init();
        rig.feed("OK"); // cgfunc
        rig.feed("START");
        rig.feed("+CPIN: READY");
        rig.feed("PB DONE");
        rig.feed("OK"); // ate0
        rig.feed("OK"); // cgfunc 2
        rig.feed("OK"); // cgps=1
        rig.feed("OK"); // cgpsinfo=10 -> non-Fona WAN: init completes offline
        assert!(rig.fona.no_network());
        assert!(rig.fona.can_send_to_service());
    }

    #[test]
    fn test_no_service_loops_on_cpsi() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.fona.init_completed = false;
        rig.fona.init_in_progress = true;
        rig.fona.cmd.set_state(FonaState::CpsiRpl as u16);
        let wd_before = rig.fona.watchdog_set_time;
        rig.clock.advance(30);
        rig.feed("+CPSI: NO SERVICE");
        // Still in the search loop, watchdog fed so we keep waiting.
        assert_eq!(rig.fona.state(), FonaState::CpsiRpl);
        assert!(rig.fona.watchdog_set_time > wd_before);
    }

    // ==================== Universal replies ====================

    #[test]
    fn test_iccid_maps_to_apn() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.feed("+ICCID: 8901260712345678901");
        assert_eq!(rig.fona.apn, "wireless.twilio.com");
        assert_eq!(
            rig.fona.sim_iccid.as_deref(),
            Some("8901260712345678901")
        );

        let mut rig = Rig::new();
        rig.force_online();
        rig.feed("+ICCID: 8910300000000000000");
        assert_eq!(rig.fona.apn, "openroamer.com");

        let mut rig = Rig::new();
        rig.force_online();
        rig.feed("+ICCID: 8901170000000000000");
        assert_eq!(rig.fona.apn, "m2m.com.attz");
    }

    #[test]
    fn test_unrecognized_iccid_leaves_storage_apn() {
        let mut rig = Rig::new();
        rig.store.data.carrier_apn = "custom.apn".to_string();
        rig.force_online();
        rig.feed("+ICCID: 9999990000000000000");
        // Unknown prefix: nothing set here; reset picks up storage.
        assert_eq!(rig.fona.apn, "");
    }

    #[test]
    fn test_error_triggers_full_reset() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.fona.cmd.set_state(FonaState::CipmodeRpl as u16);
        rig.fona.init_in_progress = true;
        rig.fona.init_completed = false;
        rig.feed("ERROR");
        // Reset sequence restarts from the flow-control disable.
        assert!(rig.sent().contains(&"at+cgfunc=11,0".to_string()));
    }

    #[test]
    fn test_sim_failure_latches_no_network() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.feed("+CME ERROR: SIM failure");
        assert!(rig.fona.no_network());
        // SIM busy is transient and ignored.
        let mut rig = Rig::new();
        rig.force_online();
        rig.feed("+CME ERROR: SIM busy");
        assert!(!rig.fona.no_network());
    }

    #[test]
    fn test_gps_report_parses_and_saves_lkg() {
        let mut rig = Rig::new();
        rig.force_online();
        drive_gps_fix(&mut rig);
        assert_eq!(rig.fona.gps_status(), GpsStatus::Full);
        let fix = rig.fona.gps_fix().unwrap();
        assert!((fix.latitude - 42.5665).abs() < 0.01);
        assert!((fix.longitude + 70.784).abs() < 0.01);
        assert!(fix.altitude > 0.0);
        // Last-known-good persisted on first acquisition.
        assert!((rig.store.data.lkg_gps_latitude - fix.latitude).abs() < 1e-9);
        assert!(rig.has_action(&Action::GpsCheck));
    }

    #[test]
    fn test_gps_report_without_fix_reports_no_location() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.feed("+CGPSINFO:,,,,,,,,");
        assert_eq!(rig.fona.gps_status(), GpsStatus::NoLocation);
    }

    // ==================== Watchdog ====================

    #[test]
    fn test_watchdog_resets_stuck_state() {
        let mut rig = Rig::new();
        rig.fona.received_since_powerup = 1;
        rig.fona.init_in_progress = true;
        rig.fona.cmd.set_state(FonaState::NetopenRpl as u16);
        rig.fona.watchdog_reset(rig.clock.now());
        rig.clock.advance(CELL_WATCHDOG_SECONDS + rig.fona.watchdog_set_time + 1);
        assert!(rig.poll());
        // Full reset restarted bring-up.
        assert!(rig.port.lines().contains(&"at+cgfunc=11,0".to_string()));
    }

    #[test]
    fn test_watchdog_in_oneshot_mode_reselects() {
        let mut rig = Rig::new();
        rig.oneshot_enabled = true;
        rig.fona.received_since_powerup = 1;
        rig.fona.init_in_progress = true;
        rig.fona.cmd.set_state(FonaState::NetopenRpl as u16);
        rig.fona.watchdog_reset(rig.clock.now());
        rig.clock.advance(CELL_WATCHDOG_SECONDS * 2 + 1);
        assert!(rig.poll());
        assert!(rig.has_action(&Action::DeselectReselect));
    }

    #[test]
    fn test_idle_state_is_not_watchdogged() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.clock.advance(CELL_WATCHDOG_SECONDS * 10);
        assert!(!rig.poll());
    }

    #[test]
    fn test_dfu_extends_watchdog() {
        let mut rig = Rig::new();
        rig.fona.received_since_powerup = 1;
        rig.fona.init_in_progress = true;
        rig.fona.watchdog_extend = true;
        rig.fona.cmd.set_state(FonaState::DfuRpl6 as u16);
        rig.fona.watchdog_reset(rig.clock.now());
        let base = rig.fona.watchdog_set_time;
        rig.clock.advance(base + CELL_WATCHDOG_SECONDS + 30);
        assert!(!rig.poll());
        rig.clock.advance(DFU_WATCHDOG_SECONDS);
        assert!(rig.poll());
    }

    // ==================== Sending ====================

    #[test]
    fn test_udp_send_streams_on_prompt() {
        let mut rig = Rig::new();
        rig.force_online();
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(rig
            .fona
            .send_to_service(b"payload", ReplyType::None, &mut bus));
        assert_eq!(
            rig.sent(),
            vec!["at+cipsend=0,7,\"10.0.0.9\",8081"]
        );

        // The '>' prompt releases the raw payload.
        rig.feed_byte(b'>');
        assert!(rig.port.raw().ends_with(b"payload"));
        assert!(rig.has_action(&Action::OneshotCompleted));

        // Final OK returns the machine to idle.
        rig.feed("OK");
        assert_eq!(rig.fona.state(), FonaState::Idle);
    }

    #[test]
    fn test_send_rejected_while_busy_or_pending() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.fona.cmd.set_state(FonaState::MiscRpl as u16);
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(!rig.fona.send_to_service(b"x", ReplyType::None, &mut bus));

        rig.fona.cmd.set_state(FonaState::Idle as u16);
        rig.fona.deferred.active = true;
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(!rig.fona.send_to_service(b"x", ReplyType::None, &mut bus));

        rig.fona.deferred.active = false;
        let big = vec![0u8; DEFERRED_CAPACITY + 1];
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(!rig.fona.send_to_service(&big, ReplyType::None, &mut bus));
    }

    #[test]
    fn test_http_roundtrip_delivers_service_reply() {
        let mut rig = Rig::new();
        rig.store.data.device_id = 777;
        rig.force_online();
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(rig
            .fona
            .send_to_service(&[0x01, 0x02, 0x03], ReplyType::Ttserve, &mut bus));
        assert_eq!(rig.sent(), vec!["at+chttpsopse=\"10.0.0.9\",8080,1"]);

        // Session open: the POST is built and queued for the prompt.
        rig.feed("OK");
        let lines = rig.sent();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("at+chttpssend="));

        rig.feed_byte(b'>');
        let streamed = String::from_utf8_lossy(rig.port.raw()).into_owned();
        assert!(streamed.contains("POST /send HTTP/1.1"));
        assert!(streamed.contains("Content-Length: 6"));
        assert!(streamed.ends_with("010203"));

        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+chttpssend"]);

        rig.feed("OK");
        rig.feed("+CHTTPS: RECV EVENT");
        assert_eq!(rig.sent(), vec![format!("at+chttpsrecv={}", DEFERRED_CAPACITY)]);

        // Response body: a Telecast reply addressed to us.
        let reply = Telecast {
            device_type: Some(DeviceType::Ttserve as i32),
            device_id: Some(777),
            message: Some("cmd ping".to_string()),
        };
        let hex = encode_hex_body(&reply.encode_to_vec());
        rig.feed("+CHTTPSRECV: DATA,64");
        rig.feed(&hex);
        rig.feed("+CHTTPSRECV: 0");
        assert_eq!(rig.sent(), vec!["at+chttpsclse"]);

        let delivered: Vec<_> = rig
            .actions
            .iter()
            .filter(|a| matches!(a, Action::ReceivedFromService(m) if m == "cmd ping"))
            .collect();
        assert_eq!(delivered.len(), 1);
        assert!(rig.has_action(&Action::OneshotCompleted));

        rig.feed("OK");
        assert_eq!(rig.fona.state(), FonaState::Idle);
    }

    #[test]
    fn test_http_error_page_is_ignored() {
        let mut rig = Rig::new();
        rig.force_online();
        rig.fona.deferred.active = true;
        rig.fona.cmd.set_state(FonaState::ChttpsRecvRpl as u16);
        rig.feed("HTTP/1.1 500 Internal Server Error");
        rig.feed("+CHTTPSRECV: 0");
        assert!(!rig
            .actions
            .iter()
            .any(|a| matches!(a, Action::ReceivedFromService(_))));
        assert!(rig.has_action(&Action::OneshotCompleted));
    }

    // ==================== DFU ====================

    #[test]
    fn test_dfu_happy_path() {
        let mut rig = Rig::new();
        rig.store.data.dfu_status = DfuStatus::Pending;
        rig.store.data.dfu_filename = "fw.zip".to_string();
        rig.store.data.device_id = 42;
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        rig.fona.init(&mut bus);
        assert!(rig.fona.dfu_in_progress);
        rig.fona.init_in_progress = true;
        rig.fona.run_state(FonaState::InitCompleted, &mut bus);
        assert_eq!(rig.sent(), vec!["at+fsdel=\"dfu.zip\""]);

        rig.feed("ERROR"); // marker did not exist
        assert_eq!(rig.sent(), vec!["at+cftpserv=\"ingest.telecast.io\""]);
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cftpport=8083"]);
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cftpun=\"42\""]);
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cftppw=\"device-firmware\""]);
        rig.feed("OK");
        assert_eq!(rig.sent(), vec!["at+cfsdel=\"fw.zip\""]);
        rig.feed("ERROR"); // no prior copy
        assert_eq!(rig.sent(), vec!["at+cftpgetfile=\"/fw.zip\",0"]);
        assert!(rig.fona.watchdog_extend);

        rig.feed("+CFTPGETFILE: 0");
        rig.feed("OK");
        assert!(!rig.fona.watchdog_extend);
        // Validation disabled: straight to the buttonless marker copy.
        assert_eq!(rig.sent(), vec!["at+fscopy=\"fw.zip\",\"dfu.zip\""]);

        rig.feed("OK");
        assert_eq!(rig.store.data.dfu_status, DfuStatus::Idle);
        assert_eq!(rig.store.data.dfu_error, DfuError::None);
        assert_eq!(rig.store.data.dfu_count, 1);
        assert!(rig.has_action(&Action::RequestRestart));
        assert_eq!(rig.fona.state(), FonaState::Idle);
    }

    #[test]
    fn test_dfu_download_failure_persists_error_and_restarts() {
        let mut rig = Rig::new();
        rig.store.data.dfu_status = DfuStatus::Pending;
        rig.store.data.dfu_filename = "fw.zip".to_string();
        rig.fona.dfu_in_progress = true;
        rig.fona.init_in_progress = true;
        rig.fona.cmd.set_state(FonaState::DfuRpl6 as u16);
        rig.feed("+CFTPGETFILE: 4");
        assert_eq!(rig.store.data.dfu_status, DfuStatus::Idle);
        assert_eq!(rig.store.data.dfu_error, DfuError::GetFile);
        assert_eq!(rig.store.data.dfu_count, 0);
        assert!(rig.has_action(&Action::RequestRestart));
    }
}
