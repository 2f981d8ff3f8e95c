/// Card decoder: pause-segmented tap counting.
///
/// A card is entered as two bursts of taps separated by a pause: first the
/// suit (1–4 taps), then the rank (1–13 taps). The pause that closes a phase
/// is only noticed when the *next* tap arrives, so the decoder is driven
/// purely by taps and needs no timer of its own:
///
/// ```text
///   Idle ──tap──▶ CountingSuit ──tap after pause──▶ CountingNumber
///    ▲               │ >4 taps                        │ >13 taps
///    └───────────────┴────────────────────────────────┤
///    └──────────── tap after pause: emit Card ◀───────┘
/// ```
///
/// Short and long taps count alike; the kind is passed through so the
/// application can special-case it if it wants to.
use crate::card::{Card, Suit, MAX_RANK};
use crate::config::DecoderConfig;
use crate::detector::TapEvent;

/// Largest suit tap count.
const MAX_SUIT_TAPS: u8 = 4;

/// Receiver for completed cards.
pub trait CardObserver {
    fn on_card(&mut self, card: Card);
}

impl<F: FnMut(Card)> CardObserver for F {
    fn on_card(&mut self, card: Card) {
        self(card)
    }
}

/// Which field is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Suit,
    Number,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Suit => "suit",
            Phase::Number => "number",
        }
    }
}

/// Decoder state. Counting states carry their own count and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    CountingSuit { count: u8, last_tap_ms: u64 },
    CountingNumber { suit: Suit, count: u8, last_tap_ms: u64 },
}

impl DecoderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderState::Idle => "idle",
            DecoderState::CountingSuit { .. } => "counting_suit",
            DecoderState::CountingNumber { .. } => "counting_number",
        }
    }

    fn last_tap_ms(&self) -> Option<u64> {
        match *self {
            DecoderState::Idle => None,
            DecoderState::CountingSuit { last_tap_ms, .. }
            | DecoderState::CountingNumber { last_tap_ms, .. } => Some(last_tap_ms),
        }
    }
}

/// Why an in-progress card was thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// More than four suit taps.
    SuitOverflow,
    /// More than thirteen number taps.
    NumberOverflow,
    /// The suit count closed outside 1–4.
    InvalidSuit,
    /// The number count closed outside 1–13.
    InvalidRank,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::SuitOverflow => "suit_overflow",
            ResetReason::NumberOverflow => "number_overflow",
            ResetReason::InvalidSuit => "invalid_suit",
            ResetReason::InvalidRank => "invalid_rank",
        }
    }
}

/// What a single tap did to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Tap counted within the current phase.
    Counting { phase: Phase, count: u8 },
    /// A pause closed the suit phase; this tap is the first number tap.
    SuitDecoded(Suit),
    /// A pause closed the number phase and the card was delivered.
    Completed(Card),
    /// The in-progress card was discarded.
    Reset(ResetReason),
}

/// Tap-count state machine producing [`Card`]s.
#[derive(Debug, Clone)]
pub struct CardDecoder {
    config: DecoderConfig,
    state: DecoderState,
}

impl CardDecoder {
    pub const fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            state: DecoderState::Idle,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: DecoderConfig) {
        self.config = config;
    }

    /// Drop any in-progress card.
    pub fn reset(&mut self) {
        if self.state != DecoderState::Idle {
            log::info!("Decoder reset from {}", self.state.as_str());
        }
        self.state = DecoderState::Idle;
    }

    /// Time since the last counted tap, or `None` when idle.
    ///
    /// The decoder never times out on its own; callers that want an idle
    /// reset poll this and call [`reset`](Self::reset).
    pub fn idle_for(&self, now_ms: u64) -> Option<u64> {
        self.state
            .last_tap_ms()
            .map(|last| now_ms.saturating_sub(last))
    }

    /// Feed one tap observed at `now_ms`.
    ///
    /// A completed card is handed to `observer` before the decoder returns
    /// to idle. Resets are reported only through the returned outcome.
    pub fn feed_tap<O>(&mut self, tap: TapEvent, now_ms: u64, observer: &mut O) -> FeedOutcome
    where
        O: CardObserver + ?Sized,
    {
        log::debug!(
            "Tap {} in {} (gap {:?} ms)",
            tap.kind.as_str(),
            self.state.as_str(),
            self.idle_for(now_ms)
        );

        match self.state {
            DecoderState::Idle => {
                self.state = DecoderState::CountingSuit {
                    count: 1,
                    last_tap_ms: now_ms,
                };
                FeedOutcome::Counting {
                    phase: Phase::Suit,
                    count: 1,
                }
            }
            DecoderState::CountingSuit { count, last_tap_ms } => {
                if self.is_pause(last_tap_ms, now_ms) {
                    let Some(suit) = Suit::from_count(count) else {
                        return self.abort(ResetReason::InvalidSuit, count);
                    };
                    log::info!("Suit decoded: {} ({} taps)", suit.as_str(), count);
                    self.state = DecoderState::CountingNumber {
                        suit,
                        count: 1,
                        last_tap_ms: now_ms,
                    };
                    return FeedOutcome::SuitDecoded(suit);
                }
                let count = count.saturating_add(1);
                if count > MAX_SUIT_TAPS {
                    return self.abort(ResetReason::SuitOverflow, count);
                }
                self.state = DecoderState::CountingSuit {
                    count,
                    last_tap_ms: now_ms,
                };
                FeedOutcome::Counting {
                    phase: Phase::Suit,
                    count,
                }
            }
            DecoderState::CountingNumber {
                suit,
                count,
                last_tap_ms,
            } => {
                if self.is_pause(last_tap_ms, now_ms) {
                    let Some(card) = Card::new(suit, count) else {
                        return self.abort(ResetReason::InvalidRank, count);
                    };
                    log::info!("Card decoded: {}", card);
                    observer.on_card(card);
                    self.state = DecoderState::Idle;
                    return FeedOutcome::Completed(card);
                }
                let count = count.saturating_add(1);
                if count > MAX_RANK {
                    return self.abort(ResetReason::NumberOverflow, count);
                }
                self.state = DecoderState::CountingNumber {
                    suit,
                    count,
                    last_tap_ms: now_ms,
                };
                FeedOutcome::Counting {
                    phase: Phase::Number,
                    count,
                }
            }
        }
    }

    fn is_pause(&self, last_tap_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(last_tap_ms) > self.config.pause_duration_ms
    }

    fn abort(&mut self, reason: ResetReason, count: u8) -> FeedOutcome {
        log::warn!("Gesture discarded: {} ({} taps)", reason.as_str(), count);
        self.state = DecoderState::Idle;
        FeedOutcome::Reset(reason)
    }
}

impl Default for CardDecoder {
    fn default() -> Self {
        Self::new(DecoderConfig::new())
    }
}
