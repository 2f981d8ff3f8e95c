/// Runtime configuration for the tap → card → beacon pipeline.
///
/// Starts from the compiled-in [`defaults`](crate::defaults) and can be
/// adjusted by the companion app without reflashing. All structs are `Copy`
/// so firmware can keep them in a `Cell` and hand snapshots to tasks.
use core::fmt;

use crate::defaults;

/// Tap detector thresholds and timings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Resting magnitude subtracted from every sample (mg).
    pub gravity_baseline_mg: f64,
    /// Excursion above which a tap begins (mg).
    pub onset_threshold_mg: f64,
    /// Fraction of the onset threshold below which a tap ends.
    pub offset_hysteresis_ratio: f64,
    /// Minimum quiet time between the end of one tap and the next onset.
    pub cooldown_ms: u64,
    /// Tap duration at or above which a tap is `Long`.
    pub long_tap_duration_ms: u64,
}

impl DetectorConfig {
    pub const fn new() -> Self {
        Self {
            gravity_baseline_mg: defaults::GRAVITY_BASELINE_MG,
            onset_threshold_mg: defaults::ONSET_THRESHOLD_MG,
            offset_hysteresis_ratio: defaults::OFFSET_HYSTERESIS_RATIO,
            cooldown_ms: defaults::COOLDOWN_MS,
            long_tap_duration_ms: defaults::LONG_TAP_DURATION_MS,
        }
    }

    /// Excursion below which an in-progress tap closes.
    pub fn offset_threshold_mg(&self) -> f64 {
        self.onset_threshold_mg * self.offset_hysteresis_ratio
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Card decoder timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Tap gap that closes the current phase.
    pub pause_duration_ms: u64,
}

impl DecoderConfig {
    pub const fn new() -> Self {
        Self {
            pause_duration_ms: defaults::PAUSE_DURATION_MS,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The six invisible code points that carry a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerSet {
    /// Suit markers indexed by `Suit::index()`. `suits[0]` is also the separator.
    pub suits: [char; 4],
    pub bit_zero: char,
    pub bit_one: char,
}

impl MarkerSet {
    pub const fn new() -> Self {
        Self {
            suits: defaults::SUIT_MARKERS,
            bit_zero: defaults::BIT_ZERO_MARKER,
            bit_one: defaults::BIT_ONE_MARKER,
        }
    }

    /// Separator between the suit and rank fields.
    pub const fn separator(&self) -> char {
        self.suits[0]
    }

    /// All six markers, suits first.
    pub fn all(&self) -> [char; 6] {
        [
            self.suits[0],
            self.suits[1],
            self.suits[2],
            self.suits[3],
            self.bit_zero,
            self.bit_one,
        ]
    }

    /// True when no two markers share a code point.
    pub fn is_distinct(&self) -> bool {
        let all = self.all();
        all.iter()
            .enumerate()
            .all(|(i, a)| all[i + 1..].iter().all(|b| a != b))
    }

    /// UTF-8 length of the six-marker payload.
    ///
    /// The separator repeats `suits[0]`, and the rank bits are a mix of the
    /// two bit markers, so the widest of each is used.
    pub fn max_payload_len(&self) -> usize {
        let widest_suit = self.suits.iter().map(|c| c.len_utf8()).max().unwrap_or(0);
        let widest_bit = self.bit_zero.len_utf8().max(self.bit_one.len_utf8());
        widest_suit + self.separator().len_utf8() + widest_bit * defaults::RANK_BITS as usize
    }
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Beacon burst shape and payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconConfig {
    /// Delay between frames in one burst.
    pub interval_ms: u64,
    /// Frames per burst.
    pub repeat_count: u16,
    /// Visible ASCII prefix of every encoded name.
    pub prefix: &'static str,
    pub markers: MarkerSet,
}

impl BeaconConfig {
    pub const fn new() -> Self {
        Self {
            interval_ms: defaults::BEACON_INTERVAL_MS,
            repeat_count: defaults::BEACON_REPEAT_COUNT,
            prefix: defaults::BEACON_PREFIX,
            markers: MarkerSet::new(),
        }
    }

    /// Worst-case byte length of an encoded name.
    pub fn max_name_len(&self) -> usize {
        self.prefix.len() + self.markers.max_payload_len()
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub detector: DetectorConfig,
    pub decoder: DecoderConfig,
    pub beacon: BeaconConfig,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            detector: DetectorConfig::new(),
            decoder: DecoderConfig::new(),
            beacon: BeaconConfig::new(),
        }
    }

    /// Check every invariant the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if !(d.onset_threshold_mg > 0.0) {
            return Err(ConfigError::NonPositive("onset_threshold_mg"));
        }
        if !(d.offset_hysteresis_ratio > 0.0 && d.offset_hysteresis_ratio <= 1.0) {
            return Err(ConfigError::HysteresisOutOfRange);
        }
        if d.long_tap_duration_ms == 0 {
            return Err(ConfigError::NonPositive("long_tap_duration_ms"));
        }
        if self.decoder.pause_duration_ms == 0 {
            return Err(ConfigError::NonPositive("pause_duration_ms"));
        }
        let b = &self.beacon;
        if b.interval_ms == 0 {
            return Err(ConfigError::NonPositive("interval_ms"));
        }
        if b.repeat_count == 0 {
            return Err(ConfigError::NonPositive("repeat_count"));
        }
        if !b.prefix.is_ascii() {
            return Err(ConfigError::PrefixNotAscii);
        }
        if !b.markers.is_distinct() {
            return Err(ConfigError::MarkersNotDistinct);
        }
        let len = b.max_name_len();
        if len > defaults::MAX_SSID_LEN {
            return Err(ConfigError::NameTooLong(len));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Reasons a configuration is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A threshold, duration, or count that must be positive is not.
    NonPositive(&'static str),
    /// Offset hysteresis ratio outside (0, 1].
    HysteresisOutOfRange,
    /// The visible prefix contains non-ASCII bytes.
    PrefixNotAscii,
    /// Two of the six markers share a code point.
    MarkersNotDistinct,
    /// Encoded name would exceed the 32-byte SSID limit.
    NameTooLong(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NonPositive(field) => write!(f, "{field} must be positive"),
            ConfigError::HysteresisOutOfRange => {
                write!(f, "offset hysteresis ratio must be in (0, 1]")
            }
            ConfigError::PrefixNotAscii => write!(f, "beacon prefix must be ASCII"),
            ConfigError::MarkersNotDistinct => write!(f, "marker code points must be distinct"),
            ConfigError::NameTooLong(len) => {
                write!(f, "encoded name is {len} bytes, SSID limit is 32")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::new().validate(), Ok(()));
        assert_eq!(Config::default(), Config::new());
    }

    #[test]
    fn default_offset_threshold_is_half_onset() {
        assert_eq!(DetectorConfig::new().offset_threshold_mg(), 750.0);
    }

    #[test]
    fn default_name_fits_ssid() {
        // "CARD_" + six 3-byte markers
        assert_eq!(BeaconConfig::new().max_name_len(), 23);
    }

    #[test]
    fn rejects_duplicate_markers() {
        let mut config = Config::new();
        config.beacon.markers.bit_zero = config.beacon.markers.suits[0];
        assert_eq!(config.validate(), Err(ConfigError::MarkersNotDistinct));
    }

    #[test]
    fn rejects_long_prefix() {
        let mut config = Config::new();
        config.beacon.prefix = "A_VERY_LONG_VISIBLE_PREFIX_";
        assert!(matches!(config.validate(), Err(ConfigError::NameTooLong(_))));
    }

    #[test]
    fn rejects_zero_repeat_and_bad_ratio() {
        let mut config = Config::new();
        config.beacon.repeat_count = 0;
        assert_eq!(config.validate(), Err(ConfigError::NonPositive("repeat_count")));

        let mut config = Config::new();
        config.detector.offset_hysteresis_ratio = 1.5;
        assert_eq!(config.validate(), Err(ConfigError::HysteresisOutOfRange));
    }

    #[test]
    fn rejects_non_ascii_prefix() {
        let mut config = Config::new();
        config.beacon.prefix = "CARTA_Ñ";
        assert_eq!(config.validate(), Err(ConfigError::PrefixNotAscii));
    }
}
