//! Node event loop: the cooperative scheduler tying everything
//! together.
//!
//! Two event sources exist. Byte arrivals are handed in (from
//! interrupt context on hardware) via [`Node::feed_byte`], which
//! enqueues a small completion tag; [`Node::dispatch_pending`] runs
//! the matching state machine at task level. Timer ticks arrive via
//! [`Node::tick`], which polls the comm supervisor and the sensor
//! scheduler. Suspension is explicit everywhere: a state machine that
//! needs more bytes simply returns and resumes on its next completion.
//!
//! Effects queued by the state machines ([`Action`]s) are applied here,
//! between dispatches, so no component ever calls back into another
//! mid-step.

use log::{debug, info};

use crate::clock::Clock;
use crate::cmdbuf::Stream;
use crate::comm::{CommCtx, CommMode, CommSupervisor, GpsConfig, UpdatePublisher};
use crate::event::EventQueue;
use crate::sensor::{OpMode, PowerSwitch, SensorCtx, SensorScheduler};
use crate::storage::{FlashPage, Store};
use crate::transport::{Action, Bus, ModemPort, Transport};

/// Devices that can own the shared UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartDevice {
    Lora,
    Fona,
    Pms,
    Bgeigie,
    Ugps,
}

/// The single-selector UART switch. Comms claims it on select; UART
/// sensor groups claim it for the duration of a sampling round.
pub struct UartMux {
    current: Option<UartDevice>,
}

impl UartMux {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn current(&self) -> Option<UartDevice> {
        self.current
    }

    pub fn select(&mut self, device: Option<UartDevice>) {
        if self.current != device {
            debug!("uart: {:?} -> {:?}", self.current, device);
            self.current = device;
        }
    }
}

impl Default for UartMux {
    fn default() -> Self {
        Self::new()
    }
}

/// Power-rail control that only logs; hardware supplies a GPIO-backed
/// implementation.
pub struct LogPower;

impl PowerSwitch for LogPower {
    fn set(&mut self, pin: u16, enable: bool) {
        debug!("power pin {} {}", pin, if enable { "ON" } else { "OFF" });
    }
}

macro_rules! comm_ctx {
    ($node:ident, $battery:ident, $upload:ident, $excl:ident, $test:ident) => {
        CommCtx {
            clock: &$node.clock,
            store: &mut $node.store,
            port: &mut *$node.port,
            actions: &mut $node.actions,
            publisher: &mut *$node.publisher,
            uart: &mut $node.uart,
            battery: $battery,
            any_upload_needed: $upload,
            any_exclusive_powered_on: $excl,
            sensor_test_mode: $test,
            fine_timestamp_available: $node.fine_timestamp_available,
        }
    };
}

/// The assembled node.
pub struct Node {
    pub clock: Clock,
    pub store: Store,
    pub comm: CommSupervisor,
    pub sensors: SensorScheduler,
    pub events: EventQueue,
    pub uart: UartMux,
    port: Box<dyn ModemPort>,
    power: Box<dyn PowerSwitch>,
    publisher: Box<dyn UpdatePublisher>,
    actions: Vec<Action>,
    restart_requested: bool,
    in_motion: bool,
    fine_timestamp_available: bool,
    service_messages: Vec<String>,
}

impl Node {
    pub fn new(
        flash: Box<dyn FlashPage>,
        gps_config: GpsConfig,
        port: Box<dyn ModemPort>,
        power: Box<dyn PowerSwitch>,
        publisher: Box<dyn UpdatePublisher>,
    ) -> Self {
        Self {
            clock: Clock::new(),
            store: Store::init(flash),
            comm: CommSupervisor::new(gps_config),
            sensors: SensorScheduler::new(),
            events: EventQueue::new(),
            uart: UartMux::new(),
            port,
            power,
            publisher,
            actions: Vec::new(),
            restart_requested: false,
            in_motion: false,
            fine_timestamp_available: false,
            service_messages: Vec::new(),
        }
    }

    /// Boot-time initialization of the comm package.
    pub fn init(&mut self) {
        let battery = self.sensors.battery_status();
        let upload = self.sensors.any_upload_needed(self.in_motion);
        let excl = self.sensors.any_exclusive_powered_on();
        let test = self.sensors.test_mode();
        let mut ctx = comm_ctx!(self, battery, upload, excl, test);
        self.comm.init(&mut ctx);
        self.apply_actions();
        info!("node initialized, device {}", self.store.data.device_id);
    }

    /// The outer shell asked us whether to reboot.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    /// Motion signal from the accelerometer driver.
    pub fn set_motion(&mut self, in_motion: bool) {
        self.in_motion = in_motion;
    }

    /// Whether wall-clock time has been acquired (enables buffering).
    pub fn set_fine_timestamp_available(&mut self, available: bool) {
        self.fine_timestamp_available = available;
    }

    /// Decoded replies from the service, for the receive subsystem.
    pub fn take_service_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.service_messages)
    }

    /// Change operating mode from the CLI. Mobile mode also asks the
    /// GPS to refine its fix.
    pub fn set_op_mode(&mut self, mode: OpMode) -> bool {
        let ok = self.sensors.set_op_mode(mode, &self.store.data);
        if ok && mode == OpMode::Mobile {
            self.comm.gps_update();
        }
        ok
    }

    // ==================== Byte ingress ====================

    /// Called for every received byte (from interrupt context on
    /// hardware). Enqueues at most one completion event.
    pub fn feed_byte(&mut self, stream: Stream, byte: u8) {
        match stream {
            Stream::Fona | Stream::FonaDeferred => {
                self.comm.fona.received_byte(byte, &mut self.events)
            }
            Stream::Lora => self.comm.lora.received_byte(byte, &mut self.events),
            // bGeigie and phone streams belong to the outer shell.
            Stream::Bgeigie | Stream::Phone => {}
        }
    }

    /// Drain the completion queue, dispatching each tag to its state
    /// machine.
    pub fn dispatch_pending(&mut self) {
        while let Some(stream) = self.events.dequeue() {
            let deselected = self.comm.is_deselected();
            let mut bus = Bus {
                clock: &self.clock,
                store: &mut self.store,
                port: &mut *self.port,
                actions: &mut self.actions,
                deselected,
                oneshot_enabled: false,
            };
            match stream {
                // LoRa completions run even when deselected, for the
                // post-deselect save-state exchange.
                Stream::Lora => self.comm.lora.process(&mut bus),
                Stream::Fona => {
                    if !deselected {
                        self.comm.fona.process(&mut bus);
                    }
                }
                Stream::FonaDeferred => {
                    if !deselected {
                        self.comm.fona.process_deferred(&mut bus);
                    }
                }
                Stream::Bgeigie | Stream::Phone => {}
            }
            self.apply_actions();
        }
    }

    // ==================== Timer tick ====================

    /// Fixed-cadence poll: comm supervision, then the sensor pass and
    /// its timers.
    pub fn tick(&mut self) {
        let battery = self.sensors.battery_status();
        let upload = self.sensors.any_upload_needed(self.in_motion);
        let excl = self.sensors.any_exclusive_powered_on();
        let test = self.sensors.test_mode();

        {
            let mut ctx = comm_ctx!(self, battery, upload, excl, test);
            self.comm.poll(&mut ctx);
        }
        self.apply_actions();

        // The sensor pass needs comm's view of the world.
        let (gps_status, uart_switching_allowed) = {
            let mut ctx = comm_ctx!(self, battery, upload, excl, test);
            let gps = self.comm.gps_get(&mut ctx).0;
            let allowed = self.comm.uart_switching_allowed(&mut ctx);
            (gps, allowed)
        };
        self.apply_actions();

        {
            let comm_mode = self.comm.mode().as_set();
            let mut sctx = SensorCtx {
                clock: &self.clock,
                storage: &self.store.data,
                uart: &mut self.uart,
                power: &mut *self.power,
                comm_mode,
                uart_switching_allowed,
                gps_status,
                in_motion: self.in_motion,
            };
            self.sensors.poll(&mut sctx);
        }
        self.sensors.poll_timers(&self.clock);
    }

    // ==================== Effects ====================

    /// Apply every queued action, including any that applying produces.
    fn apply_actions(&mut self) {
        while !self.actions.is_empty() {
            let batch: Vec<Action> = self.actions.drain(..).collect();
            let battery = self.sensors.battery_status();
            let upload = self.sensors.any_upload_needed(self.in_motion);
            let excl = self.sensors.any_exclusive_powered_on();
            let test = self.sensors.test_mode();

            for action in batch {
                match action {
                    Action::OneshotCompleted => self.comm.note_oneshot_completed(),
                    Action::SelectCompleted => self.comm.select_completed(&self.clock),
                    Action::SelectNone => {
                        let mut ctx = comm_ctx!(self, battery, upload, excl, test);
                        self.comm.select(CommMode::None, "transport request", &mut ctx);
                    }
                    Action::SelectLora => {
                        let mut ctx = comm_ctx!(self, battery, upload, excl, test);
                        self.comm.select(CommMode::Lora, "transport handoff", &mut ctx);
                    }
                    Action::DeselectReselect => {
                        let mut ctx = comm_ctx!(self, battery, upload, excl, test);
                        self.comm.deselect(&mut ctx);
                        self.comm.reselect(&mut ctx);
                    }
                    Action::RequestRestart => self.restart_requested = true,
                    Action::RequestServiceUpdate => {
                        let mut ctx = comm_ctx!(self, battery, upload, excl, test);
                        self.comm.oneshot_service_update(&mut ctx);
                    }
                    Action::GpsCheck => {
                        let mut ctx = comm_ctx!(self, battery, upload, excl, test);
                        self.comm.gps_get(&mut ctx);
                    }
                    Action::ReceivedFromService(message) => {
                        info!("service: {}", message);
                        self.service_messages.push(message);
                    }
                    Action::Indicate(indicator) => debug!("indicate {:?}", indicator),
                    Action::Stat(kind) => self.comm.stats.apply(kind),
                    Action::Enqueue(stream) => self.events.enqueue(stream),
                }
            }
        }
    }

    /// Operator CLI: dump comm and sensor state.
    pub fn show_state(&mut self) {
        let battery = self.sensors.battery_status();
        let upload = self.sensors.any_upload_needed(self.in_motion);
        let excl = self.sensors.any_exclusive_powered_on();
        let test = self.sensors.test_mode();
        {
            let mut ctx = comm_ctx!(self, battery, upload, excl, test);
            self.comm.show_state(&mut ctx);
        }
        self.apply_actions();
        let comm_mode = self.comm.mode().as_set();
        let sctx = SensorCtx {
            clock: &self.clock,
            storage: &self.store.data,
            uart: &mut self.uart,
            power: &mut *self.power,
            comm_mode,
            uart_switching_allowed: false,
            gps_status: crate::gps::GpsStatus::NoData,
            in_motion: self.in_motion,
        };
        self.sensors.show_state(&sctx);
    }
}
