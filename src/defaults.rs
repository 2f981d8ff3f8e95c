/// Compiled-in defaults for tap detection, decoding, and beacon transmission.
///
/// Tuned for a QMI8658 sampled at 50 Hz on the wrist. Timings and
/// thresholds can be overridden at runtime through
/// [`crate::config::Config`]; the prefix and markers are fixed per build.

// ── Tap detector ─────────────────────────────────────────────────────

/// Sampling period of the detector loop (50 Hz).
pub const SAMPLE_PERIOD_MS: u64 = 20;

/// Resting magnitude with one axis aligned to gravity.
pub const GRAVITY_BASELINE_MG: f64 = 1000.0;

/// Excursion from the gravity baseline that opens a tap.
pub const ONSET_THRESHOLD_MG: f64 = 1500.0;

/// The tap closes once the excursion drops below `ONSET_THRESHOLD_MG * ratio`.
pub const OFFSET_HYSTERESIS_RATIO: f64 = 0.5;

/// Quiet time required after a tap closes before a new onset counts.
pub const COOLDOWN_MS: u64 = 200;

/// Taps lasting at least this long are classified as long.
pub const LONG_TAP_DURATION_MS: u64 = 2000;

// ── Card decoder ─────────────────────────────────────────────────────

/// Gap between taps that closes the current counting phase.
pub const PAUSE_DURATION_MS: u64 = 2500;

// ── Beacon transmitter ───────────────────────────────────────────────

/// Delay between repeated beacon frames.
pub const BEACON_INTERVAL_MS: u64 = 100;

/// Frames per burst (50 × 100 ms ≈ 5 s on air).
pub const BEACON_REPEAT_COUNT: u16 = 50;

/// Visible SSID prefix that marks a card beacon.
pub const BEACON_PREFIX: &str = "CARD_";

/// Suit markers, indexed by `Suit::index()`.
///
/// Hearts also doubles as the separator between suit and rank.
pub const SUIT_MARKERS: [char; 4] = [
    '\u{200B}', // ZERO WIDTH SPACE
    '\u{200C}', // ZERO WIDTH NON-JOINER
    '\u{200D}', // ZERO WIDTH JOINER
    '\u{200E}', // LEFT-TO-RIGHT MARK
];

/// Rank bit marker for 0.
pub const BIT_ZERO_MARKER: char = '\u{2060}'; // WORD JOINER

/// Rank bit marker for 1.
pub const BIT_ONE_MARKER: char = '\u{FEFF}'; // ZERO WIDTH NO-BREAK SPACE

/// Number of marker characters appended after the prefix
/// (suit + separator + 4 rank bits).
pub const MARKER_COUNT: usize = 6;

/// Number of rank bits, most significant first.
pub const RANK_BITS: u8 = 4;

/// 802.11 SSID element limit; the encoded name must fit.
pub const MAX_SSID_LEN: usize = 32;

/// Beacon interval advertised in the frame body (time units of 1024 µs).
pub const FRAME_BEACON_INTERVAL_TU: u16 = 100;

/// Channel the beacons are transmitted on.
pub const BEACON_CHANNEL: u8 = 1;
