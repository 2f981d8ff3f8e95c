/// Communication layer: NDJSON framing shared by the BLE and serial transports.
///
/// The device streams tap, gesture and card events as newline-delimited JSON
/// over both BLE notifications and serial. Commands can be received from
/// either transport. The GATT server itself lives in the firmware binaries;
/// this module holds everything that is transport-agnostic.
use crate::card::{format_card, Card, CardLabel};
use crate::config::{Config, ConfigError};
use crate::decoder::FeedOutcome;
use crate::detector::TapEvent;
use crate::protocol::{DeviceMessage, HostCommand, MsgBuffer, RawCommand, MAX_MSG_LEN};

/// BLE GATT UUIDs (Nordic UART Service layout).
///
/// The firmware `#[gatt_service]` attributes repeat these as literals;
/// proc macros cannot take constants.
#[allow(dead_code)]
pub mod ble_uuids {
    /// Primary service
    pub const SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
    /// RX characteristic: commands, write
    pub const RX_CHAR: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
    /// TX characteristic: events, notify
    pub const TX_CHAR: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
}

/// BLE advertising name
pub const BLE_ADV_NAME: &str = "S3Watch";

/// Serial baud rate
pub const SERIAL_BAUD: u32 = 115200;

/// Maximum BLE notification payload (MTU-3)
pub const BLE_MAX_NOTIFY: usize = 20;

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a DeviceMessage to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &DeviceMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // Append newline for NDJSON
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Serialize into a fresh, right-sized [`MsgBuffer`].
pub fn encode_message(msg: &DeviceMessage) -> Option<MsgBuffer> {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok()?;
    let len = serialize_message(msg, &mut buf)?;
    buf.truncate(len);
    Some(buf)
}

/// Uptime in milliseconds as carried in `ts` fields (wraps after ~49 days).
pub fn timestamp(now_ms: u64) -> u32 {
    (now_ms & 0xFFFF_FFFF) as u32
}

pub fn tap_message(tap: &TapEvent, now_ms: u64) -> DeviceMessage<'static> {
    DeviceMessage::Tap {
        kind: tap.kind.as_str(),
        dur: tap.duration_ms.min(u32::MAX as u64) as u32,
        ts: timestamp(now_ms),
    }
}

/// Wire name and count for a decoder outcome.
pub fn outcome_fields(outcome: &FeedOutcome) -> (&'static str, u8) {
    match *outcome {
        FeedOutcome::Counting { phase, count } => (phase.as_str(), count),
        FeedOutcome::SuitDecoded(suit) => ("suit_decoded", suit.count()),
        FeedOutcome::Completed(card) => ("card", card.rank()),
        FeedOutcome::Reset(reason) => (reason.as_str(), 0),
    }
}

pub fn gesture_message(outcome: &FeedOutcome, now_ms: u64) -> DeviceMessage<'static> {
    let (outcome, count) = outcome_fields(outcome);
    DeviceMessage::Gesture {
        outcome,
        count,
        ts: timestamp(now_ms),
    }
}

/// `label` must outlive the message; fill it with [`format_card`] first.
pub fn card_message<'a>(card: &Card, label: &'a CardLabel, now_ms: u64) -> DeviceMessage<'a> {
    DeviceMessage::Card {
        suit: card.suit().as_str(),
        rank: card.rank(),
        name: label,
        ts: timestamp(now_ms),
    }
}

/// Label for a card, as used in `card` and `burst` messages.
pub fn card_label(card: &Card) -> CardLabel {
    let mut label = CardLabel::new();
    format_card(card, &mut label);
    label
}

pub fn config_message(config: &Config) -> DeviceMessage<'static> {
    let clamp = |v: u64| v.min(u32::MAX as u64) as u32;
    DeviceMessage::Config {
        onset_mg: config.detector.onset_threshold_mg as u32,
        cooldown_ms: clamp(config.detector.cooldown_ms),
        long_ms: clamp(config.detector.long_tap_duration_ms),
        pause_ms: clamp(config.decoder.pause_duration_ms),
        interval_ms: clamp(config.beacon.interval_ms),
        repeat: config.beacon.repeat_count,
    }
}

// ── Command handling ───────────────────────────────────────────────────

/// Deserialize a HostCommand from a JSON byte slice.
///
/// Parses into the flat [`RawCommand`] first, then maps the `cmd` string
/// and its parameter to a typed command. Unknown commands and missing
/// parameters yield `None`.
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    // Strip trailing newline/whitespace
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed).ok()?;
    let cmd = match raw.cmd.as_str() {
        "start" => HostCommand::Start,
        "stop" => HostCommand::Stop,
        "status" => HostCommand::GetStatus,
        "reset" => HostCommand::Reset,
        "config" => HostCommand::GetConfig,
        "set_onset" => HostCommand::SetOnset { mg: raw.mg? },
        "set_cooldown" => HostCommand::SetCooldown { ms: raw.ms? },
        "set_long" => HostCommand::SetLong { ms: raw.ms? },
        "set_pause" => HostCommand::SetPause { ms: raw.ms? },
        "set_interval" => HostCommand::SetInterval { ms: raw.ms? },
        "set_repeat" => HostCommand::SetRepeat { count: raw.count? },
        other => {
            log::warn!("Unknown command: {}", other);
            return None;
        }
    };
    Some(cmd)
}

/// What the caller should do after [`handle_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    /// State already updated in place
    None,
    /// Reply with a live status message
    SendStatus,
    /// Reply with the current tunables
    SendConfig,
    /// Drop the decoder's in-progress card
    ResetDecoder,
    /// Tunables changed; push them into the pipeline and echo them back
    ConfigChanged,
    /// The new value would break an invariant and was not applied
    Rejected(ConfigError),
}

/// Process a received host command and update state accordingly.
///
/// Setters are applied to a copy and validated first, so `config` is never
/// left holding a value the pipeline cannot run with.
pub fn handle_command(cmd: &HostCommand, config: &mut Config, running: &mut bool) -> CommandEffect {
    let mut next = *config;
    match *cmd {
        HostCommand::Start => {
            *running = true;
            log::info!("Tap sampling started by host command");
            return CommandEffect::None;
        }
        HostCommand::Stop => {
            *running = false;
            log::info!("Tap sampling stopped by host command");
            return CommandEffect::None;
        }
        HostCommand::GetStatus => return CommandEffect::SendStatus,
        HostCommand::GetConfig => return CommandEffect::SendConfig,
        HostCommand::Reset => return CommandEffect::ResetDecoder,
        HostCommand::SetOnset { mg } => next.detector.onset_threshold_mg = mg as f64,
        HostCommand::SetCooldown { ms } => next.detector.cooldown_ms = ms as u64,
        HostCommand::SetLong { ms } => next.detector.long_tap_duration_ms = ms as u64,
        HostCommand::SetPause { ms } => next.decoder.pause_duration_ms = ms as u64,
        HostCommand::SetInterval { ms } => next.beacon.interval_ms = ms as u64,
        HostCommand::SetRepeat { count } => next.beacon.repeat_count = count,
    }

    if let Err(e) = next.validate() {
        log::warn!("Rejected {:?}: {}", cmd, e);
        return CommandEffect::Rejected(e);
    }
    *config = next;
    log::info!("Config updated: {:?}", cmd);
    CommandEffect::ConfigChanged
}

// ── Serial NDJSON reader ───────────────────────────────────────────────

/// Serial NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
    overflowed: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
            overflowed: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected. An over-long line is dropped whole.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            let len = self.pos;
            let overflowed = self.overflowed;
            self.pos = 0;
            self.overflowed = false;
            if len > 0 && !overflowed {
                Some(&self.buf[..len])
            } else {
                None
            }
        } else if self.overflowed {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            log::warn!("Command line exceeds {} bytes, dropped", MAX_MSG_LEN);
            self.overflowed = true;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && data[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Suit;
    use crate::decoder::{Phase, ResetReason};
    use crate::detector::TapKind;

    fn as_str(buf: &MsgBuffer) -> &str {
        core::str::from_utf8(buf).unwrap()
    }

    // ── parse_command ───────────────────────────────────────────────

    #[test]
    fn parse_simple_commands() {
        assert_eq!(parse_command(br#"{"cmd":"start"}"#), Some(HostCommand::Start));
        assert_eq!(parse_command(br#"{"cmd":"stop"}"#), Some(HostCommand::Stop));
        assert_eq!(parse_command(br#"{"cmd":"status"}"#), Some(HostCommand::GetStatus));
        assert_eq!(parse_command(br#"{"cmd":"reset"}"#), Some(HostCommand::Reset));
        assert_eq!(parse_command(br#"{"cmd":"config"}"#), Some(HostCommand::GetConfig));
    }

    #[test]
    fn parse_setters() {
        assert_eq!(
            parse_command(br#"{"cmd":"set_onset","mg":1800}"#),
            Some(HostCommand::SetOnset { mg: 1800 })
        );
        assert_eq!(
            parse_command(br#"{"cmd":"set_pause","ms":3000}"#),
            Some(HostCommand::SetPause { ms: 3000 })
        );
        assert_eq!(
            parse_command(br#"{"cmd":"set_repeat","count":20}"#),
            Some(HostCommand::SetRepeat { count: 20 })
        );
    }

    #[test]
    fn parse_strips_trailing_newline() {
        assert_eq!(
            parse_command(b"{\"cmd\":\"set_long\",\"ms\":1500}\r\n"),
            Some(HostCommand::SetLong { ms: 1500 })
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(parse_command(b""), None);
        assert_eq!(parse_command(b"not json"), None);
        assert_eq!(parse_command(br#"{"cmd":"explode"}"#), None);
        // setter without its parameter
        assert_eq!(parse_command(br#"{"cmd":"set_onset"}"#), None);
        assert_eq!(parse_command(br#"{"cmd":"set_repeat","count":-1}"#), None);
    }

    // ── handle_command ──────────────────────────────────────────────

    #[test]
    fn start_stop_toggle_running() {
        let mut config = Config::new();
        let mut running = false;
        assert_eq!(
            handle_command(&HostCommand::Start, &mut config, &mut running),
            CommandEffect::None
        );
        assert!(running);
        handle_command(&HostCommand::Stop, &mut config, &mut running);
        assert!(!running);
    }

    #[test]
    fn queries_request_replies() {
        let mut config = Config::new();
        let mut running = true;
        assert_eq!(
            handle_command(&HostCommand::GetStatus, &mut config, &mut running),
            CommandEffect::SendStatus
        );
        assert_eq!(
            handle_command(&HostCommand::GetConfig, &mut config, &mut running),
            CommandEffect::SendConfig
        );
        assert_eq!(
            handle_command(&HostCommand::Reset, &mut config, &mut running),
            CommandEffect::ResetDecoder
        );
    }

    #[test]
    fn setters_update_config() {
        let mut config = Config::new();
        let mut running = true;
        let cmds = [
            HostCommand::SetOnset { mg: 1800 },
            HostCommand::SetCooldown { ms: 300 },
            HostCommand::SetLong { ms: 1500 },
            HostCommand::SetPause { ms: 3000 },
            HostCommand::SetInterval { ms: 50 },
            HostCommand::SetRepeat { count: 20 },
        ];
        for cmd in &cmds {
            assert_eq!(
                handle_command(cmd, &mut config, &mut running),
                CommandEffect::ConfigChanged
            );
        }
        assert_eq!(config.detector.onset_threshold_mg, 1800.0);
        assert_eq!(config.detector.cooldown_ms, 300);
        assert_eq!(config.detector.long_tap_duration_ms, 1500);
        assert_eq!(config.decoder.pause_duration_ms, 3000);
        assert_eq!(config.beacon.interval_ms, 50);
        assert_eq!(config.beacon.repeat_count, 20);
    }

    #[test]
    fn invalid_values_are_rejected_and_not_applied() {
        let mut config = Config::new();
        let mut running = true;
        let effect = handle_command(&HostCommand::SetRepeat { count: 0 }, &mut config, &mut running);
        assert_eq!(
            effect,
            CommandEffect::Rejected(ConfigError::NonPositive("repeat_count"))
        );
        assert_eq!(config, Config::new());

        let effect = handle_command(&HostCommand::SetOnset { mg: 0 }, &mut config, &mut running);
        assert!(matches!(effect, CommandEffect::Rejected(_)));
        assert_eq!(config.detector.onset_threshold_mg, 1500.0);
    }

    // ── Message builders ────────────────────────────────────────────

    #[test]
    fn encode_appends_newline() {
        let tap = TapEvent {
            kind: TapKind::Short,
            duration_ms: 80,
        };
        let buf = encode_message(&tap_message(&tap, 1234)).unwrap();
        assert_eq!(
            as_str(&buf),
            "{\"type\":\"tap\",\"kind\":\"short\",\"dur\":80,\"ts\":1234}\n"
        );
    }

    #[test]
    fn gesture_outcomes_on_the_wire() {
        let counting = FeedOutcome::Counting {
            phase: Phase::Number,
            count: 7,
        };
        assert_eq!(outcome_fields(&counting), ("number", 7));
        assert_eq!(
            outcome_fields(&FeedOutcome::SuitDecoded(Suit::Clubs)),
            ("suit_decoded", 3)
        );
        assert_eq!(
            outcome_fields(&FeedOutcome::Reset(ResetReason::NumberOverflow)),
            ("number_overflow", 0)
        );

        let buf = encode_message(&gesture_message(&counting, 5)).unwrap();
        assert!(as_str(&buf).contains(r#""outcome":"number","count":7"#));
    }

    #[test]
    fn card_message_carries_label() {
        let card = Card::new(Suit::Hearts, 13).unwrap();
        let label = card_label(&card);
        let buf = encode_message(&card_message(&card, &label, 77)).unwrap();
        let json = as_str(&buf);
        assert!(json.contains(r#""suit":"hearts""#));
        assert!(json.contains(r#""rank":13"#));
        assert!(json.contains(r#""name":"K♥""#));
    }

    #[test]
    fn config_message_reports_integers() {
        let buf = encode_message(&config_message(&Config::new())).unwrap();
        assert_eq!(
            as_str(&buf),
            "{\"type\":\"config\",\"onset_mg\":1500,\"cooldown_ms\":200,\"long_ms\":2000,\
             \"pause_ms\":2500,\"interval_ms\":100,\"repeat\":50}\n"
        );
    }

    #[test]
    fn timestamp_wraps() {
        assert_eq!(timestamp(0x1_0000_0005), 5);
    }

    // ── LineReader ──────────────────────────────────────────────────

    #[test]
    fn line_reader_yields_lines() {
        let mut reader = LineReader::new();
        let mut lines: Vec<Vec<u8>> = Vec::new();
        for &b in b"{\"cmd\":\"start\"}\n\n{\"cmd\":\"stop\"}\r\n" {
            if let Some(line) = reader.feed(b) {
                lines.push(line.to_vec());
            }
        }
        assert_eq!(lines.len(), 2);
        assert_eq!(parse_command(&lines[0]), Some(HostCommand::Start));
        assert_eq!(parse_command(&lines[1]), Some(HostCommand::Stop));
    }

    #[test]
    fn line_reader_drops_overlong_line() {
        let mut reader = LineReader::new();
        for _ in 0..MAX_MSG_LEN + 10 {
            assert!(reader.feed(b'x').is_none());
        }
        assert!(reader.feed(b'\n').is_none());
        for &b in b"{\"cmd\":\"reset\"}" {
            reader.feed(b);
        }
        let line = reader.feed(b'\n').unwrap();
        assert_eq!(parse_command(line), Some(HostCommand::Reset));
    }
}
