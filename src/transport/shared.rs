//! Shared transport contract: state tags, the serial port seam, and
//! the actions state machines queue for the supervisor.

use crate::clock::Clock;
use crate::cmdbuf::Stream;
use crate::event::EventQueue;
use crate::gps::{GpsFix, GpsStatus};
use crate::storage::Store;

/// State tag shared by every transport: nothing in flight.
pub const STATE_IDLE: u16 = 0;

/// State tag shared by every transport: operation finished.
pub const STATE_COMPLETE: u16 = 1;

/// First tag available for device-specific states.
pub const DEVICE_STATE_BASE: u16 = 100;

/// Seconds a transport may sit in a non-idle state without a state
/// transition before the watchdog resets it.
pub const CELL_WATCHDOG_SECONDS: u32 = 120;

/// Extended watchdog for known long operations (firmware download).
pub const DFU_WATCHDOG_SECONDS: u32 = 300;

pub const LORA_WATCHDOG_SECONDS: u32 = 120;

/// Grace period after boot before transports are initialized, giving
/// the modem hardware time to stabilize.
pub const BOOT_DELAY_UNTIL_INIT_SECONDS: u32 = 10;

/// What kind of reply a service transmission expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    /// Fire-and-forget; sent as a UDP datagram.
    None,
    /// Request/reply via HTTP POST; the response is decoded.
    Ttserve,
}

/// Operator-visible indicator events (LED patterns on hardware).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    CellInitializing,
    CellNoService,
    CellConnected,
    GpsConnecting,
    GpsConnected,
    CommsUnknown,
}

/// Statistics increments emitted from the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Sent(u32),
    Received(u32),
    Reset,
    Error,
    Oneshot,
    GpsAcquisition,
}

/// Effects a state machine asks the event loop to perform once the
/// current `process()` pass is over.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A transmission (and any reply window) finished.
    OneshotCompleted,
    /// The transport came online; stop the connect-latency timer.
    SelectCompleted,
    /// Shut down all comms.
    SelectNone,
    /// Hand control to the LoRa transport.
    SelectLora,
    /// Watchdog fired in oneshot mode: deselect then reselect.
    DeselectReselect,
    /// Ask the outer shell to restart the device.
    RequestRestart,
    /// Attempt a service update at the next opportunity.
    RequestServiceUpdate,
    /// A GPS source may have become full; run the fan-in side effects.
    GpsCheck,
    /// A decoded service reply, for the receive subsystem.
    ReceivedFromService(String),
    Indicate(Indicator),
    Stat(StatKind),
    /// Re-enqueue a completion (busy-buffer drain produced a line).
    Enqueue(Stream),
}

/// Byte sink toward a modem. Commands are lines terminated with `\r`;
/// deferred payloads are raw bytes.
pub trait ModemPort {
    fn send_byte(&mut self, byte: u8);

    /// Send a command line with the terminating carriage return.
    fn send_line(&mut self, line: &str) {
        log::debug!("> {}", line);
        for b in line.bytes() {
            self.send_byte(b);
        }
        self.send_byte(b'\r');
    }
}

/// A port that records what was sent, for tests and host simulation.
pub struct RecordingPort {
    raw: Vec<u8>,
    lines: Vec<String>,
    partial: Vec<u8>,
}

impl RecordingPort {
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            lines: Vec::new(),
            partial: Vec::new(),
        }
    }

    /// Every byte sent, in order.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Completed `\r`-terminated lines.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Drain the recorded lines.
    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.lines.clear();
        self.partial.clear();
    }
}

impl Default for RecordingPort {
    fn default() -> Self {
        Self::new()
    }
}

impl ModemPort for RecordingPort {
    fn send_byte(&mut self, byte: u8) {
        self.raw.push(byte);
        if byte == b'\r' {
            self.lines
                .push(String::from_utf8_lossy(&self.partial).into_owned());
            self.partial.clear();
        } else {
            self.partial.push(byte);
        }
    }
}

/// Everything a transport state machine may touch while processing.
pub struct Bus<'a> {
    pub clock: &'a Clock,
    pub store: &'a mut Store,
    pub port: &'a mut dyn ModemPort,
    pub actions: &'a mut Vec<Action>,
    /// Snapshot of the supervisor's deselected flag.
    pub deselected: bool,
    /// Snapshot of whether oneshot duty-cycling is currently enabled.
    pub oneshot_enabled: bool,
}

/// The contract between the supervisor and each transport.
pub trait Transport {
    /// Prepare the state machine for a freshly powered modem.
    fn init(&mut self, bus: &mut Bus);

    /// Power-off bookkeeping when the supervisor deselects.
    fn term(&mut self);

    /// Reinitialize; `force` also tears down in-flight work.
    fn reset(&mut self, force: bool, bus: &mut Bus);

    /// True once bring-up finished and the service is reachable.
    fn can_send_to_service(&self) -> bool;

    /// True when transmitting would be pointless right now.
    fn is_busy(&mut self, clock: &Clock) -> bool;

    /// Queue a payload toward the service. False when rejected.
    fn send_to_service(&mut self, payload: &[u8], reply: ReplyType, bus: &mut Bus) -> bool;

    /// Note forward progress for the watchdog.
    fn watchdog_reset(&mut self, now: u32);

    /// Periodic health check; true when a reset (or deferred work)
    /// consumed this poll.
    fn needed_to_be_reset(&mut self, bus: &mut Bus) -> bool;

    /// Location knowledge of this transport's GPS source.
    fn gps_status(&self) -> GpsStatus;

    fn gps_fix(&self) -> Option<GpsFix>;

    /// Told by the fan-in that a full fix exists somewhere.
    fn gps_shutdown(&mut self, bus: &mut Bus);

    /// Step the state machine on a completed line.
    fn process(&mut self, bus: &mut Bus);

    /// Feed one received byte; completions land on `events`.
    fn received_byte(&mut self, byte: u8, events: &mut EventQueue);

    /// Largest service payload this transport accepts.
    fn mtu(&self) -> u16;

    /// Log state for the operator CLI and probe the modem.
    fn request_state(&mut self, bus: &mut Bus);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_port_splits_lines() {
        let mut port = RecordingPort::new();
        port.send_line("at+creset");
        port.send_line("ate0");
        assert_eq!(port.lines(), &["at+creset".to_string(), "ate0".to_string()]);
        assert!(port.raw().ends_with(b"ate0\r"));
    }

    #[test]
    fn test_take_lines_drains() {
        let mut port = RecordingPort::new();
        port.send_line("at");
        assert_eq!(port.take_lines().len(), 1);
        assert!(port.lines().is_empty());
    }
}
