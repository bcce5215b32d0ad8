//! Solarcast telemetry node firmware core.
//!
//! A cooperative, single-threaded event-driven supervisor for an
//! embedded telemetry device: a communications subsystem that selects
//! between LPWAN (LoRa) and cellular transports, each a large
//! AT-command state machine, and a sensor scheduler that
//! time-multiplexes heterogeneous sensors over shared UART, I²C and
//! power resources, with battery-aware duty cycling and
//! priority-ordered service updates.
//!
//! Hardware specifics (chip drivers, serial byte I/O, flash wear
//! levelling, the BLE phone channel) live outside this crate behind
//! small traits: [`transport::ModemPort`], [`storage::FlashPage`],
//! [`sensor::SensorDriver`], [`sensor::PowerSwitch`]. Everything here
//! is host-testable.

pub mod clock;
pub mod cmdbuf;
pub mod comm;
pub mod event;
pub mod gps;
pub mod node;
pub mod sensor;
pub mod storage;
pub mod telecast;
pub mod transport;

// Re-export the commonly used types.
pub use clock::Clock;
pub use cmdbuf::{CmdBuf, Stream};
pub use comm::{CommMode, CommSupervisor, GpsConfig, UpdateKind, UpdatePublisher, Uplink};
pub use event::EventQueue;
pub use gps::{GpsFix, GpsStatus};
pub use node::{LogPower, Node, UartDevice, UartMux};
pub use sensor::{BatteryStatus, OpMode, SensorScheduler};
pub use storage::{Storage, Store};
pub use telecast::{DeviceType, Telecast};
pub use transport::{Action, ModemPort, ReplyType, Transport};
