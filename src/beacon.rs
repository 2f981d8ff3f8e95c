/// Covert beacon transmitter.
///
/// Turns a decoded card into an encoded advertised name and repeats it as a
/// burst of identical 802.11 beacon frames. The burst is best-effort: a
/// frame the radio refuses is logged and skipped, and the burst carries on
/// to the next slot. Nothing is acknowledged and nothing is retried.
///
/// The library never touches the radio. Firmware supplies a [`FrameSink`]
/// that wraps the name with [`build_beacon_frame`] and hands the bytes to
/// its raw-TX API, plus a wait function for the inter-frame gap.
use core::fmt;

use heapless::Vec;

use ieee80211::match_frames;
use ieee80211::mgmt_frame::BeaconFrame;

use crate::card::Card;
use crate::config::{BeaconConfig, MarkerSet};
use crate::defaults::{BEACON_CHANNEL, FRAME_BEACON_INTERVAL_TU, MAX_SSID_LEN};
use crate::stego::{self, EncodedName};

// ── Frame layout ─────────────────────────────────────────────────────

/// 24-byte management header + timestamp, interval, capabilities.
pub const BEACON_FIXED_LEN: usize = 36;

/// Largest frame `build_beacon_frame` produces.
pub const MAX_BEACON_LEN: usize = 128;

/// Buffer for one beacon frame.
pub type BeaconFrameBuf = Vec<u8, MAX_BEACON_LEN>;

/// Frame control: management type, beacon subtype.
const FC_BEACON: [u8; 2] = [0x80, 0x00];
/// ESS + short slot time.
const CAPABILITY_INFO: u16 = 0x0401;
/// 1, 2, 5.5, 11 Mbit/s, all basic.
const SUPPORTED_RATES: [u8; 4] = [0x82, 0x84, 0x8B, 0x96];

const ELEMENT_SSID: u8 = 0;
const ELEMENT_SUPPORTED_RATES: u8 = 1;
const ELEMENT_DS_PARAMETER_SET: u8 = 3;

/// Build a broadcast beacon advertising `ssid` from `mac`.
///
/// Sequence number and timestamp are left zero; the radio driver fills
/// them in when it transmits. Returns `None` if `ssid` exceeds 32 bytes.
pub fn build_beacon_frame(ssid: &[u8], mac: &[u8; 6]) -> Option<BeaconFrameBuf> {
    if ssid.len() > MAX_SSID_LEN {
        return None;
    }
    let mut frame = BeaconFrameBuf::new();

    frame.extend_from_slice(&FC_BEACON).ok()?;
    frame.extend_from_slice(&[0x00, 0x00]).ok()?; // duration
    frame.extend_from_slice(&[0xFF; 6]).ok()?; // DA: broadcast
    frame.extend_from_slice(mac).ok()?; // SA
    frame.extend_from_slice(mac).ok()?; // BSSID
    frame.extend_from_slice(&[0x00, 0x00]).ok()?; // sequence control
    frame.extend_from_slice(&[0x00; 8]).ok()?; // timestamp
    frame
        .extend_from_slice(&FRAME_BEACON_INTERVAL_TU.to_le_bytes())
        .ok()?;
    frame.extend_from_slice(&CAPABILITY_INFO.to_le_bytes()).ok()?;

    frame.push(ELEMENT_SSID).ok()?;
    frame.push(ssid.len() as u8).ok()?;
    frame.extend_from_slice(ssid).ok()?;

    frame.push(ELEMENT_SUPPORTED_RATES).ok()?;
    frame.push(SUPPORTED_RATES.len() as u8).ok()?;
    frame.extend_from_slice(&SUPPORTED_RATES).ok()?;

    frame.push(ELEMENT_DS_PARAMETER_SET).ok()?;
    frame.push(1).ok()?;
    frame.push(BEACON_CHANNEL).ok()?;

    Some(frame)
}

/// Decode the card carried by a captured beacon frame.
///
/// Non-beacon frames, beacons without an SSID, and ordinary network names
/// all yield `None`.
pub fn parse_card_beacon(frame: &[u8], prefix: &str, markers: &MarkerSet) -> Option<Card> {
    let card = match_frames! {
        frame,
        beacon = BeaconFrame<'_> => {
            beacon
                .body
                .ssid()
                .and_then(|ssid| stego::decode_name(ssid, prefix, markers))
        }
    };
    card.ok().flatten()
}

// ── Radio seam ───────────────────────────────────────────────────────

/// Why a single frame was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// The radio is occupied; try the next slot.
    Busy,
    /// The radio has not been started.
    NotStarted,
    /// The frame could not be built or was rejected as malformed.
    InvalidFrame,
    /// Driver error code.
    Driver(i32),
}

/// Driver return codes understood by [`RadioError::check_tx`].
pub const TX_OK: i32 = 0;
pub const TX_ERR_NO_MEM: i32 = 0x101;
pub const TX_ERR_WIFI_NOT_STARTED: i32 = 0x3002;

impl RadioError {
    /// Map a raw-TX driver return code.
    pub fn check_tx(code: i32) -> Result<(), RadioError> {
        match code {
            TX_OK => Ok(()),
            TX_ERR_NO_MEM => Err(RadioError::Busy),
            TX_ERR_WIFI_NOT_STARTED => Err(RadioError::NotStarted),
            code => Err(RadioError::Driver(code)),
        }
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioError::Busy => write!(f, "radio busy"),
            RadioError::NotStarted => write!(f, "radio not started"),
            RadioError::InvalidFrame => write!(f, "invalid frame"),
            RadioError::Driver(code) => write!(f, "driver error {code}"),
        }
    }
}

/// Broadcasts one advertisement carrying `name` per call.
pub trait FrameSink {
    fn broadcast_frame(&mut self, name: &[u8]) -> Result<(), RadioError>;
}

impl<F: FnMut(&[u8]) -> Result<(), RadioError>> FrameSink for F {
    fn broadcast_frame(&mut self, name: &[u8]) -> Result<(), RadioError> {
        self(name)
    }
}

// ── Burst ────────────────────────────────────────────────────────────

/// Outcome of one burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstReport {
    pub card: Card,
    pub sent: u16,
    pub failed: u16,
}

/// One card's worth of repeated broadcasts.
///
/// Stepped by the caller so it fits both blocking threads and async tasks:
///
/// ```ignore
/// while let Some(name) = burst.next_payload() {
///     let result = sink.broadcast_frame(name);
///     burst.record(result);
///     sleep(burst.interval_ms());
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Burst {
    card: Card,
    name: EncodedName,
    interval_ms: u64,
    total: u16,
    remaining: u16,
    sent: u16,
    failed: u16,
}

impl Burst {
    /// Encode `card` and plan `config.repeat_count` frames.
    pub fn new(card: Card, config: &BeaconConfig) -> Option<Self> {
        let name = stego::encode_name(&card, config.prefix, &config.markers)?;
        Some(Self {
            card,
            name,
            interval_ms: config.interval_ms,
            total: config.repeat_count,
            remaining: config.repeat_count,
            sent: 0,
            failed: 0,
        })
    }

    pub fn card(&self) -> Card {
        self.card
    }

    /// The encoded name every frame in this burst carries.
    pub fn name(&self) -> &EncodedName {
        &self.name
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Frames not yet handed out.
    pub fn remaining(&self) -> u16 {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Claim the next slot. Returns the payload, identical on every call.
    pub fn next_payload(&mut self) -> Option<&[u8]> {
        if self.remaining == 0 {
            return None;
        }
        if self.remaining == self.total {
            log::info!(
                "Beacon burst: {} as {:?} ({} frames, {} ms apart)",
                self.card,
                self.name.as_str(),
                self.total,
                self.interval_ms
            );
        }
        self.remaining -= 1;
        Some(self.name.as_bytes())
    }

    /// Record the result of the frame handed out by `next_payload`.
    pub fn record(&mut self, result: Result<(), RadioError>) {
        match result {
            Ok(()) => self.sent = self.sent.saturating_add(1),
            Err(e) => {
                self.failed = self.failed.saturating_add(1);
                log::warn!("Beacon frame failed: {}", e);
            }
        }
        if self.remaining == 0 {
            log::info!(
                "Beacon burst done: {} sent, {} failed",
                self.sent,
                self.failed
            );
        }
    }

    pub fn report(&self) -> BurstReport {
        BurstReport {
            card: self.card,
            sent: self.sent,
            failed: self.failed,
        }
    }
}

/// Drive a burst to completion on the calling thread.
///
/// `wait` is called with the interval between consecutive frames (not
/// after the last one).
pub fn run_burst<S, W>(sink: &mut S, mut burst: Burst, mut wait: W) -> BurstReport
where
    S: FrameSink + ?Sized,
    W: FnMut(u64),
{
    while let Some(name) = burst.next_payload() {
        let result = sink.broadcast_frame(name);
        burst.record(result);
        if !burst.is_done() {
            wait(burst.interval_ms());
        }
    }
    burst.report()
}

// ── Mailbox ──────────────────────────────────────────────────────────

/// Single-slot, latest-wins handoff from decoder to transmitter.
///
/// The decoder posts without blocking; the transmitter takes the card when
/// its current burst has finished. If a second card arrives before the
/// first was taken, the older one is dropped. A running burst is never
/// interrupted.
#[derive(Debug, Default)]
pub struct CardMailbox {
    slot: Option<Card>,
    dropped: u32,
}

impl CardMailbox {
    pub const fn new() -> Self {
        Self {
            slot: None,
            dropped: 0,
        }
    }

    /// Post a card, returning any older card it displaced.
    pub fn post(&mut self, card: Card) -> Option<Card> {
        let displaced = self.slot.replace(card);
        if let Some(old) = displaced {
            self.dropped = self.dropped.saturating_add(1);
            log::warn!("Card {} superseded by {} before transmission", old, card);
        }
        displaced
    }

    pub fn take(&mut self) -> Option<Card> {
        self.slot.take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    /// Cards replaced before they were transmitted.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}
