//! Host bring-up demo: runs the node event loop against a scripted
//! cellular modem, from boot through carrier attach to a first upload.
//!
//! ```text
//! RUST_LOG=debug cargo run --bin host-node
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use log::info;
use prost::Message;

use solarcast_node::comm::{UpdateKind, Uplink};
use solarcast_node::storage::{FlashPage, MemFlash};
use solarcast_node::telecast::{encode_hex_body, DeviceType, Telecast};
use solarcast_node::{
    GpsConfig, LogPower, ModemPort, Node, ReplyType, Storage, Stream, UpdatePublisher,
};

/// Captures outbound command lines for the scripted modem.
#[derive(Clone, Default)]
struct SimPort {
    lines: Rc<RefCell<Vec<String>>>,
    partial: Rc<RefCell<Vec<u8>>>,
}

impl ModemPort for SimPort {
    fn send_byte(&mut self, byte: u8) {
        if byte == b'\r' {
            let line = String::from_utf8_lossy(&self.partial.borrow()).into_owned();
            self.partial.borrow_mut().clear();
            self.lines.borrow_mut().push(line);
        } else {
            self.partial.borrow_mut().push(byte);
        }
    }
}

/// Marshals a minimal Telecast payload per update.
struct TelecastPublisher {
    device_id: u32,
}

impl UpdatePublisher for TelecastPublisher {
    fn send_update(&mut self, kind: UpdateKind, uplink: &mut Uplink) -> bool {
        let message = Telecast {
            device_type: Some(DeviceType::Solarcast as i32),
            device_id: Some(self.device_id),
            message: Some(format!("{:?}", kind)),
        };
        let payload = message.encode_to_vec();
        let sent = uplink.send(&payload, ReplyType::None);
        info!("update {:?}: {}", kind, if sent { "sent" } else { "deferred" });
        sent
    }

    fn send_ping(&mut self, uplink: &mut Uplink) {
        let _ = uplink.send(b"ping", ReplyType::None);
    }
}

/// Scripted replies for one modem command.
fn replies_for(command: &str) -> Vec<String> {
    if let Some(rest) = command.strip_prefix("at+cdnsgip=") {
        let host = rest.trim_matches('"');
        return vec![
            format!("+CDNSGIP: 1,{},\"203.0.113.10\"", host),
            "OK".to_string(),
        ];
    }
    match command {
        "at+creset" => vec![
            "START".to_string(),
            "+CPIN: READY".to_string(),
            "PB DONE".to_string(),
        ],
        "at+cpsi=5" => vec![
            "+CPSI: WCDMA,Online,310,410,1F2A,0C3D,99".to_string(),
            "OK".to_string(),
        ],
        "at+ciccid" => vec!["+ICCID: 8901260712345678901".to_string(), "OK".to_string()],
        "at+netopen" => vec!["OK".to_string(), "+NETOPEN: 0".to_string()],
        "at" => vec!["OK".to_string()],
        _ => vec!["OK".to_string()],
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut storage = Storage::default();
    storage.wan = solarcast_node::storage::WanMode::Fona;
    storage.device_id = 31415;
    let mut flash = MemFlash::new();
    flash
        .store(&storage.to_page().expect("serializable defaults"))
        .expect("in-memory flash");

    let port = SimPort::default();
    let captured = port.lines.clone();
    let mut node = Node::new(
        Box::new(flash),
        GpsConfig::default(),
        Box::new(port),
        Box::new(LogPower),
        Box::new(TelecastPublisher { device_id: 31415 }),
    );
    node.init();

    let mut gps_reported = false;
    for step in 0..400 {
        node.clock.advance(1);
        node.tick();
        node.dispatch_pending();

        // Answer whatever the firmware sent this step.
        let commands: Vec<String> = captured.borrow_mut().drain(..).collect();
        for command in commands {
            if command.starts_with("at+cipsend=") {
                // UDP send path: prompt for the payload.
                node.feed_byte(Stream::Fona, b'>');
                node.dispatch_pending();
                for b in "OK\r\n".bytes() {
                    node.feed_byte(Stream::Fona, b);
                }
                node.dispatch_pending();
                continue;
            }
            for reply in replies_for(&command) {
                for b in reply.bytes() {
                    node.feed_byte(Stream::Fona, b);
                }
                node.feed_byte(Stream::Fona, b'\n');
            }
            node.dispatch_pending();

            // Once GPS reporting is on, deliver a fix.
            if command == "at+cgpsinfo=10" && !gps_reported {
                gps_reported = true;
                let fix = "+CGPSINFO:4233.991317,N,07047.040000,W,080120,100500.0,12.0,0.0,0.0";
                for b in fix.bytes() {
                    node.feed_byte(Stream::Fona, b);
                }
                node.feed_byte(Stream::Fona, b'\n');
                node.dispatch_pending();
            }
        }

        if node.restart_requested() {
            info!("restart requested at step {}", step);
            break;
        }
    }

    for message in node.take_service_messages() {
        info!("service said: {}", message);
    }
    info!(
        "done: {} bytes sent, {} resets, {} oneshots",
        node.comm.stats.sent_bytes, node.comm.stats.resets, node.comm.stats.oneshots
    );
    // Show what a decoded inbound reply would look like.
    let example = Telecast {
        device_type: Some(DeviceType::Ttserve as i32),
        device_id: Some(31415),
        message: Some("cmd ping".to_string()),
    };
    info!("example reply body: {}", encode_hex_body(&example.encode_to_vec()));
}
