//! Transport layer: the contract every WAN state machine honors, the
//! serial seam to the modem hardware, and the effect actions state
//! machines hand back to the supervisor.
//!
//! This module contains:
//! - [`fona`]: the cellular (SIM5320-class) AT state machine
//! - [`lora`]: the LPWAN AT state machine
//!
//! Both are table-driven automatons stepped by `process()` when their
//! command buffer completes a line. A `process()` that needs more
//! bytes simply returns; the next completion event resumes it at the
//! current state. Neither talks to the supervisor directly; effects
//! (handoff, restart, oneshot completion, statistics) are queued as
//! [`Action`]s and applied by the event loop after the call returns.

mod shared;

pub mod fona;
pub mod lora;

pub use shared::{
    Action, Bus, Indicator, ModemPort, RecordingPort, ReplyType, StatKind, Transport,
    BOOT_DELAY_UNTIL_INIT_SECONDS, CELL_WATCHDOG_SECONDS, DEVICE_STATE_BASE,
    DFU_WATCHDOG_SECONDS, LORA_WATCHDOG_SECONDS, STATE_COMPLETE, STATE_IDLE,
};
