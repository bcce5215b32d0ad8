//! LPWAN (LoRa) transport state machine.
//!
//! A compact AT-style automaton over the same contract as the cellular
//! transport: reset the radio, pause the MAC, disable the radio
//! watchdog, then send hex-encoded frames and wait for the transmit
//! confirmation. Join/ADR/MAC-layer policy lives below this contract
//! and does not concern the supervisor.

use log::{debug, info, warn};

use crate::clock::Clock;
use crate::cmdbuf::{CmdBuf, Stream};
use crate::event::EventQueue;
use crate::gps::{GpsFix, GpsStatus};
use crate::telecast;

use super::shared::{
    Action, Bus, Indicator, ModemPort, ReplyType, StatKind, Transport,
    BOOT_DELAY_UNTIL_INIT_SECONDS, LORA_WATCHDOG_SECONDS, STATE_COMPLETE, STATE_IDLE,
};

/// Largest frame the radio accepts from us.
pub const LORA_MTU: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LoraState {
    Idle = 0,
    Complete = 1,
    ResetReq = 100,
    SysVerRpl = 101,
    MacPauseRpl = 102,
    RadioWdtRpl = 103,
    InitCompleted = 104,
    TxRpl = 105,
    TxWaitRpl = 106,
}

impl LoraState {
    pub fn from_tag(tag: u16) -> LoraState {
        use LoraState::*;
        match tag {
            1 => Complete,
            100 => ResetReq,
            101 => SysVerRpl,
            102 => MacPauseRpl,
            103 => RadioWdtRpl,
            104 => InitCompleted,
            105 => TxRpl,
            106 => TxWaitRpl,
            _ => Idle,
        }
    }
}

const _: () = assert!(LoraState::Idle as u16 == STATE_IDLE);
const _: () = assert!(LoraState::Complete as u16 == STATE_COMPLETE);

enum Flow {
    Stay,
    Goto(LoraState),
}

/// The LPWAN transport.
pub struct Lora {
    cmd: CmdBuf,
    init_completed: bool,
    init_in_progress: bool,
    watchdog_set_time: u32,
    received_since_powerup: u32,
    sending: bool,
}

impl Lora {
    pub fn new() -> Self {
        Self {
            cmd: CmdBuf::new(Stream::Lora),
            init_completed: false,
            init_in_progress: false,
            watchdog_set_time: 0,
            received_since_powerup: 0,
            sending: false,
        }
    }

    pub fn state(&self) -> LoraState {
        LoraState::from_tag(self.cmd.state())
    }

    fn set_state(&mut self, state: LoraState, clock: &Clock) {
        if self.cmd.set_state(state as u16) {
            self.watchdog_reset(clock.now());
        }
    }

    fn run_state(&mut self, state: LoraState, bus: &mut Bus) {
        let mut flow = Flow::Goto(state);
        while let Flow::Goto(next) = flow {
            self.set_state(next, bus.clock);
            flow = self.dispatch(bus);
        }
    }

    fn dispatch(&mut self, bus: &mut Bus) -> Flow {
        use LoraState::*;
        match self.state() {
            ResetReq => {
                info!("lora initializing");
                self.watchdog_reset(bus.clock.now());
                self.init_completed = false;
                self.init_in_progress = true;
                self.sending = false;
                bus.port.send_line("sys reset");
                self.set_state(SysVerRpl, bus.clock);
                Flow::Stay
            }

            // The reset banner is the firmware version line; anything
            // readable counts.
            SysVerRpl => {
                if !self.cmd.is_empty() {
                    debug!("radio: {}", self.cmd.line());
                    bus.port.send_line("mac pause");
                    self.set_state(MacPauseRpl, bus.clock);
                }
                Flow::Stay
            }

            // "mac pause" answers with the pause duration in ms.
            MacPauseRpl => {
                if self.cmd.this_arg_is("invalid_param") {
                    return Flow::Goto(ResetReq);
                }
                if !self.cmd.is_empty() {
                    bus.port.send_line("radio set wdt 0");
                    self.set_state(RadioWdtRpl, bus.clock);
                }
                Flow::Stay
            }

            RadioWdtRpl => {
                if self.cmd.this_arg_is("invalid_param") {
                    return Flow::Goto(ResetReq);
                }
                if self.cmd.this_arg_is("ok") {
                    return Flow::Goto(InitCompleted);
                }
                Flow::Stay
            }

            InitCompleted => {
                self.init_in_progress = false;
                self.init_completed = true;
                self.set_state(Idle, bus.clock);
                info!("lora online");
                bus.actions.push(Action::Indicate(Indicator::CellConnected));
                bus.actions.push(Action::SelectCompleted);
                bus.actions.push(Action::RequestServiceUpdate);
                Flow::Stay
            }

            TxRpl => {
                if self.cmd.this_arg_is("ok") {
                    self.set_state(TxWaitRpl, bus.clock);
                } else if self.cmd.this_arg_is("invalid_param")
                    || self.cmd.this_arg_is("busy")
                {
                    warn!("radio rejected transmit: {}", self.cmd.line());
                    self.sending = false;
                    bus.actions.push(Action::Stat(StatKind::Error));
                    self.set_state(Idle, bus.clock);
                    bus.actions.push(Action::OneshotCompleted);
                }
                Flow::Stay
            }

            TxWaitRpl => {
                if self.cmd.this_arg_is("radio_tx_ok") {
                    self.sending = false;
                    self.set_state(Idle, bus.clock);
                    bus.actions.push(Action::OneshotCompleted);
                } else if self.cmd.this_arg_is("radio_err") {
                    self.sending = false;
                    bus.actions.push(Action::Stat(StatKind::Error));
                    return Flow::Goto(ResetReq);
                }
                Flow::Stay
            }

            Idle | Complete => {
                self.set_state(Idle, bus.clock);
                Flow::Stay
            }
        }
    }
}

impl Default for Lora {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Lora {
    fn init(&mut self, _bus: &mut Bus) {
        self.cmd = CmdBuf::new(Stream::Lora);
        self.cmd.set_state(LoraState::Idle as u16);
        self.init_completed = false;
        self.init_in_progress = false;
        self.received_since_powerup = 0;
        self.sending = false;
    }

    fn term(&mut self) {
        self.init_completed = false;
        self.init_in_progress = false;
        self.sending = false;
        self.cmd.set_state(LoraState::Idle as u16);
    }

    fn reset(&mut self, force: bool, bus: &mut Bus) {
        if bus.deselected {
            self.init_completed = true;
            self.init_in_progress = false;
            self.set_state(LoraState::Idle, bus.clock);
            return;
        }
        if !force && self.init_in_progress {
            return;
        }
        self.run_state(LoraState::ResetReq, bus);
    }

    fn can_send_to_service(&self) -> bool {
        self.init_completed
    }

    fn is_busy(&mut self, _clock: &Clock) -> bool {
        self.state() != LoraState::Idle || self.sending
    }

    fn send_to_service(&mut self, payload: &[u8], _reply: ReplyType, bus: &mut Bus) -> bool {
        if !self.init_completed {
            return false;
        }
        if self.state() != LoraState::Idle || self.sending {
            return false;
        }
        if payload.len() > LORA_MTU as usize {
            return false;
        }
        self.sending = true;
        bus.actions
            .push(Action::Stat(StatKind::Sent(payload.len() as u32)));
        let command = format!("radio tx {}", telecast::encode_hex_body(payload));
        bus.port.send_line(&command);
        self.set_state(LoraState::TxRpl, bus.clock);
        true
    }

    fn watchdog_reset(&mut self, now: u32) {
        self.watchdog_set_time = now;
    }

    fn needed_to_be_reset(&mut self, bus: &mut Bus) -> bool {
        let now = bus.clock.now();

        if !self.init_completed && !self.init_in_progress && now > BOOT_DELAY_UNTIL_INIT_SECONDS {
            self.reset(false, bus);
            return true;
        }

        if self.watchdog_set_time > now {
            self.watchdog_reset(now);
        }

        if now >= LORA_WATCHDOG_SECONDS
            && now - self.watchdog_set_time > LORA_WATCHDOG_SECONDS
            && self.state() != LoraState::Idle
        {
            warn!("watchdog: lora stuck, {}", self.cmd.describe());
            if !bus.oneshot_enabled {
                self.reset(true, bus);
            } else {
                bus.actions.push(Action::DeselectReselect);
            }
            bus.actions.push(Action::Stat(StatKind::Error));
            return true;
        }

        false
    }

    fn gps_status(&self) -> GpsStatus {
        GpsStatus::NotConfigured
    }

    fn gps_fix(&self) -> Option<GpsFix> {
        None
    }

    fn gps_shutdown(&mut self, _bus: &mut Bus) {}

    fn process(&mut self, bus: &mut Bus) {
        if !self.cmd.is_complete() {
            return;
        }
        if self.state() != LoraState::ResetReq && !self.init_in_progress && !self.init_completed {
            self.set_state(LoraState::Idle, bus.clock);
            return;
        }
        debug!("<{:?} {}", self.state(), self.cmd.line());
        let mut flow = self.dispatch(bus);
        while let Flow::Goto(next) = flow {
            self.set_state(next, bus.clock);
            flow = self.dispatch(bus);
        }
        if self.cmd.reset() {
            bus.actions.push(Action::Enqueue(Stream::Lora));
        }
    }

    fn received_byte(&mut self, byte: u8, events: &mut EventQueue) {
        self.received_since_powerup += 1;
        if self.cmd.append(byte) {
            events.enqueue(Stream::Lora);
        }
    }

    fn mtu(&self) -> u16 {
        LORA_MTU
    }

    fn request_state(&mut self, bus: &mut Bus) {
        info!(
            "lora {}: {} ({} bytes since powerup)",
            if bus.deselected { "disconnected" } else { "connected" },
            self.cmd.describe(),
            self.received_since_powerup
        );
        bus.port.send_line("sys get ver");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::transport::RecordingPort;

    struct Rig {
        lora: Lora,
        store: Store,
        clock: Clock,
        port: RecordingPort,
        actions: Vec<Action>,
        events: EventQueue,
    }

    impl Rig {
        fn new() -> Self {
            let mut rig = Self {
                lora: Lora::new(),
                store: Store::in_memory(),
                clock: Clock::new(),
                port: RecordingPort::new(),
                actions: Vec::new(),
                events: EventQueue::new(),
            };
            let mut bus = Bus {
                clock: &rig.clock,
                store: &mut rig.store,
                port: &mut rig.port,
                actions: &mut rig.actions,
                deselected: false,
                oneshot_enabled: false,
            };
            rig.lora.init(&mut bus);
            rig
        }

        fn feed(&mut self, line: &str) {
            for b in line.bytes() {
                self.lora.received_byte(b, &mut self.events);
            }
            self.lora.received_byte(b'\n', &mut self.events);
            while let Some(stream) = self.events.dequeue() {
                let mut bus = Bus {
                    clock: &self.clock,
                    store: &mut self.store,
                    port: &mut self.port,
                    actions: &mut self.actions,
                    deselected: false,
                    oneshot_enabled: false,
                };
                if stream == Stream::Lora {
                    self.lora.process(&mut bus);
                }
                self.actions.retain(|a| !matches!(a, Action::Enqueue(_)));
            }
        }

        fn bring_online(&mut self) {
            self.clock.advance(BOOT_DELAY_UNTIL_INIT_SECONDS + 1);
            let mut bus = Bus {
                clock: &self.clock,
                store: &mut self.store,
                port: &mut self.port,
                actions: &mut self.actions,
                deselected: false,
                oneshot_enabled: false,
            };
            assert!(self.lora.needed_to_be_reset(&mut bus));
            self.feed("RN2903 1.0.3 Aug  8 2017 15:11:09");
            self.feed("4294967245");
            self.feed("ok");
            assert!(self.lora.can_send_to_service());
            self.port.clear();
            self.actions.clear();
        }
    }

    #[test]
    fn test_init_sequence() {
        let mut rig = Rig::new();
        rig.clock.advance(BOOT_DELAY_UNTIL_INIT_SECONDS + 1);
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(rig.lora.needed_to_be_reset(&mut bus));
        assert_eq!(rig.port.take_lines(), vec!["sys reset"]);

        rig.feed("RN2903 1.0.3 Aug  8 2017 15:11:09");
        assert_eq!(rig.port.take_lines(), vec!["mac pause"]);

        rig.feed("4294967245");
        assert_eq!(rig.port.take_lines(), vec!["radio set wdt 0"]);

        rig.feed("ok");
        assert!(rig.lora.can_send_to_service());
        assert!(rig.actions.contains(&Action::SelectCompleted));
        assert!(rig.actions.contains(&Action::RequestServiceUpdate));
    }

    #[test]
    fn test_send_and_confirm() {
        let mut rig = Rig::new();
        rig.bring_online();
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(rig
            .lora
            .send_to_service(&[0xde, 0xad], ReplyType::None, &mut bus));
        assert_eq!(rig.port.take_lines(), vec!["radio tx DEAD"]);

        rig.feed("ok");
        rig.feed("radio_tx_ok");
        assert!(rig.actions.contains(&Action::OneshotCompleted));
        assert_eq!(rig.lora.state(), LoraState::Idle);
    }

    #[test]
    fn test_radio_error_resets() {
        let mut rig = Rig::new();
        rig.bring_online();
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(rig.lora.send_to_service(&[0x01], ReplyType::None, &mut bus));
        rig.feed("ok");
        rig.feed("radio_err");
        // The reset sequence went back out.
        assert!(rig.port.take_lines().contains(&"sys reset".to_string()));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut rig = Rig::new();
        rig.bring_online();
        let big = vec![0u8; LORA_MTU as usize + 1];
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(!rig.lora.send_to_service(&big, ReplyType::None, &mut bus));
    }

    #[test]
    fn test_watchdog_resets_stuck_radio() {
        let mut rig = Rig::new();
        rig.bring_online();
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        rig.lora.send_to_service(&[0x01], ReplyType::None, &mut bus);
        rig.clock.advance(LORA_WATCHDOG_SECONDS * 2 + 1);
        let mut bus = Bus {
            clock: &rig.clock,
            store: &mut rig.store,
            port: &mut rig.port,
            actions: &mut rig.actions,
            deselected: false,
            oneshot_enabled: false,
        };
        assert!(rig.lora.needed_to_be_reset(&mut bus));
    }
}
