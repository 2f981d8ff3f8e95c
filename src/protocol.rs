/// JSON message protocol between the watch and its companion app.
///
/// All messages are newline-delimited JSON (NDJSON).
/// Uses `heapless` types for no_std/no-alloc operation. Numbers on the wire
/// are integers (milli-g, milliseconds) so the companion never has to
/// round-trip floats.
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::card::CardLabel;

/// Messages sent from the device to the companion app
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// A completed tap
    #[serde(rename = "tap")]
    Tap {
        /// "short" or "long"
        kind: &'static str,
        /// Tap duration in milliseconds
        dur: u32,
        /// Uptime in milliseconds when the tap closed
        ts: u32,
    },
    /// Decoder progress after a tap
    #[serde(rename = "gesture")]
    Gesture {
        /// "suit", "number", "suit_decoded", "card" or a reset reason
        outcome: &'static str,
        count: u8,
        ts: u32,
    },
    /// A decoded card, about to be broadcast
    #[serde(rename = "card")]
    Card {
        suit: &'static str,
        rank: u8,
        /// Short label, e.g. "K♥"
        name: &'a CardLabel,
        ts: u32,
    },
    /// A finished beacon burst
    #[serde(rename = "burst")]
    Burst {
        card: &'a CardLabel,
        sent: u16,
        failed: u16,
        ts: u32,
    },
    /// Device status report
    #[serde(rename = "status")]
    Status {
        /// Whether the tap detector is sampling
        running: bool,
        /// Uptime in seconds
        uptime: u32,
        /// Decoder state name
        decoder: &'static str,
        /// Number of connected BLE clients
        ble_clients: u8,
        /// Board identifier
        board: &'static str,
        /// Firmware version
        version: &'static str,
    },
    /// Current tunables
    #[serde(rename = "config")]
    Config {
        onset_mg: u32,
        cooldown_ms: u32,
        long_ms: u32,
        pause_ms: u32,
        interval_ms: u32,
        repeat: u16,
    },
}

/// Commands sent from the companion app to the device.
///
/// Deserialized manually via [`RawCommand`] in `comm::parse_command()` because
/// `serde_json_core` does not support internally tagged enums (`deserialize_any`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Start tap sampling
    Start,
    /// Stop tap sampling
    Stop,
    /// Request current status
    GetStatus,
    /// Drop the card being entered
    Reset,
    /// Request current tunables
    GetConfig,
    /// Onset threshold in milli-g
    SetOnset { mg: u32 },
    /// Quiet time between taps
    SetCooldown { ms: u32 },
    /// Long-tap duration
    SetLong { ms: u32 },
    /// Gap that closes a phase
    SetPause { ms: u32 },
    /// Delay between beacon frames
    SetInterval { ms: u32 },
    /// Frames per burst
    SetRepeat { count: u16 },
}

/// Wire format for host commands: flat struct that `serde_json_core` can
/// deserialize without `deserialize_any`. Converted to [`HostCommand`] in
/// `comm::parse_command()`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: String<16>,
    #[serde(default)]
    pub mg: Option<u32>,
    #[serde(default)]
    pub ms: Option<u32>,
    #[serde(default)]
    pub count: Option<u16>,
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json<'b>(msg: &DeviceMessage, buf: &'b mut [u8]) -> &'b str {
        let len = serde_json_core::to_slice(msg, buf).unwrap();
        core::str::from_utf8(&buf[..len]).unwrap()
    }

    #[test]
    fn serialize_gesture_message() {
        let msg = DeviceMessage::Gesture {
            outcome: "suit_overflow",
            count: 5,
            ts: 3100,
        };
        let mut buf = [0u8; 128];
        assert_eq!(
            to_json(&msg, &mut buf),
            r#"{"type":"gesture","outcome":"suit_overflow","count":5,"ts":3100}"#
        );
    }

    #[test]
    fn serialize_burst_message() {
        let card = CardLabel::try_from("10♠").unwrap();
        let msg = DeviceMessage::Burst {
            card: &card,
            sent: 48,
            failed: 2,
            ts: 15000,
        };
        let mut buf = [0u8; 128];
        assert_eq!(
            to_json(&msg, &mut buf),
            r#"{"type":"burst","card":"10♠","sent":48,"failed":2,"ts":15000}"#
        );
    }

    #[test]
    fn status_message_carries_decoder_and_version() {
        let msg = DeviceMessage::Status {
            running: false,
            uptime: 7,
            decoder: "counting_number",
            ble_clients: 0,
            board: "s3_amoled_watch",
            version: VERSION,
        };
        let mut buf = [0u8; MAX_MSG_LEN];
        let json = to_json(&msg, &mut buf);
        assert!(json.starts_with(r#"{"type":"status","running":false,"uptime":7"#));
        assert!(json.contains(r#""decoder":"counting_number""#));
        assert!(json.contains(VERSION));
        assert!(!json.contains('\n'));
    }

    #[test]
    fn serialize_tap_message() {
        let msg = DeviceMessage::Tap {
            kind: "long",
            dur: 2140,
            ts: 9000,
        };
        let mut buf = [0u8; 128];
        assert_eq!(
            to_json(&msg, &mut buf),
            r#"{"type":"tap","kind":"long","dur":2140,"ts":9000}"#
        );
    }

    #[test]
    fn serialize_card_message_keeps_suit_symbol() {
        let name = CardLabel::try_from("Q♦").unwrap();
        let msg = DeviceMessage::Card {
            suit: "diamonds",
            rank: 12,
            name: &name,
            ts: 42,
        };
        let mut buf = [0u8; 128];
        let json = to_json(&msg, &mut buf);
        assert!(json.contains(r#""type":"card""#));
        assert!(json.contains(r#""suit":"diamonds""#));
        assert!(json.contains(r#""rank":12"#));
        assert!(json.contains(r#""name":"Q♦""#));
    }

    #[test]
    fn serialize_config_message() {
        let msg = DeviceMessage::Config {
            onset_mg: 1500,
            cooldown_ms: 200,
            long_ms: 2000,
            pause_ms: 2500,
            interval_ms: 100,
            repeat: 50,
        };
        let mut buf = [0u8; 256];
        let json = to_json(&msg, &mut buf);
        assert!(json.starts_with(r#"{"type":"config","onset_mg":1500"#));
        assert!(json.contains(r#""repeat":50"#));
    }
}
