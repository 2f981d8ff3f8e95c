/// Sampling-side composition of the tap detector and card decoder.
///
/// Firmware runs one `Pipeline` on its sampling task: every tick reads the
/// sensor, and each completed tap goes straight into the decoder. Finished
/// cards reach the [`CardObserver`], which on hardware posts them to the
/// beacon mailbox and returns immediately.
use crate::config::Config;
use crate::decoder::{CardDecoder, CardObserver, DecoderState, FeedOutcome};
use crate::detector::{MagnitudeSource, TapDetector, TapEvent};

/// One tap and what it did to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub tap: TapEvent,
    pub outcome: FeedOutcome,
}

pub struct Pipeline {
    detector: TapDetector,
    decoder: CardDecoder,
}

impl Pipeline {
    /// Build a stopped pipeline from `config`.
    pub const fn new(config: &Config) -> Self {
        Self {
            detector: TapDetector::new(config.detector),
            decoder: CardDecoder::new(config.decoder),
        }
    }

    pub fn start(&mut self) {
        self.detector.start();
    }

    /// Stop sampling. A half-entered card is kept; use [`reset`](Self::reset)
    /// to drop it.
    pub fn stop(&mut self) {
        self.detector.stop();
    }

    pub fn is_running(&self) -> bool {
        self.detector.is_running()
    }

    /// Discard the card being entered.
    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    pub fn decoder_state(&self) -> DecoderState {
        self.decoder.state()
    }

    pub fn detector(&self) -> &TapDetector {
        &self.detector
    }

    pub fn decoder(&self) -> &CardDecoder {
        &self.decoder
    }

    /// Push new thresholds and timings into both stages.
    pub fn apply_config(&mut self, config: &Config) {
        self.detector.set_config(config.detector);
        self.decoder.set_config(config.decoder);
    }

    /// One sampling tick against a live sensor.
    pub fn tick<S, O>(&mut self, source: &mut S, now_ms: u64, cards: &mut O) -> Option<Step>
    where
        S: MagnitudeSource + ?Sized,
        O: CardObserver + ?Sized,
    {
        let tap = self.detector.tick(source, now_ms, &mut |_: TapEvent| {})?;
        Some(self.feed(tap, now_ms, cards))
    }

    /// One sampling tick with an already-read magnitude.
    pub fn process<O>(&mut self, magnitude_mg: f64, now_ms: u64, cards: &mut O) -> Option<Step>
    where
        O: CardObserver + ?Sized,
    {
        let tap = self.detector.process(magnitude_mg, now_ms)?;
        Some(self.feed(tap, now_ms, cards))
    }

    fn feed<O>(&mut self, tap: TapEvent, now_ms: u64, cards: &mut O) -> Step
    where
        O: CardObserver + ?Sized,
    {
        let outcome = self.decoder.feed_tap(tap, now_ms, cards);
        Step { tap, outcome }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(&Config::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::CardMailbox;
    use crate::card::{Card, Suit};
    use crate::config::MarkerSet;
    use crate::decoder::{Phase, ResetReason};
    use crate::defaults::{BEACON_PREFIX, SAMPLE_PERIOD_MS};
    use crate::stego;

    const REST: f64 = 1000.0;
    const SPIKE: f64 = 2800.0;

    /// Drives a pipeline at the sampling cadence and records what it emits.
    struct Wrist {
        pipeline: Pipeline,
        now: u64,
        steps: Vec<Step>,
        cards: Vec<Card>,
    }

    impl Wrist {
        fn new() -> Self {
            let mut pipeline = Pipeline::default();
            pipeline.start();
            Self {
                pipeline,
                now: 0,
                steps: Vec::new(),
                cards: Vec::new(),
            }
        }

        fn sample(&mut self, magnitude: f64) {
            self.now += SAMPLE_PERIOD_MS;
            let cards = &mut self.cards;
            if let Some(step) = self
                .pipeline
                .process(magnitude, self.now, &mut |c: Card| cards.push(c))
            {
                self.steps.push(step);
            }
        }

        fn rest(&mut self, ms: u64) {
            for _ in 0..ms / SAMPLE_PERIOD_MS {
                self.sample(REST);
            }
        }

        fn tap(&mut self) {
            self.sample(SPIKE);
            self.sample(SPIKE);
            self.sample(REST);
        }

        fn taps(&mut self, n: u8) {
            for _ in 0..n {
                self.tap();
                self.rest(400);
            }
        }

        fn pause(&mut self) {
            self.rest(3000);
        }
    }

    #[test]
    fn king_of_hearts_end_to_end() {
        let mut w = Wrist::new();
        w.taps(1);
        w.pause();
        w.taps(13);
        w.pause();
        w.tap();

        let king = Card::new(Suit::Hearts, 13).unwrap();
        assert_eq!(w.cards, vec![king]);
        assert_eq!(w.steps.len(), 15);
        assert_eq!(w.steps[1].outcome, FeedOutcome::SuitDecoded(Suit::Hearts));
        assert_eq!(w.steps[14].outcome, FeedOutcome::Completed(king));
        assert_eq!(w.pipeline.decoder_state(), DecoderState::Idle);

        let m = MarkerSet::new();
        let name = stego::encode_name(&king, BEACON_PREFIX, &m).unwrap();
        let bits: Vec<char> = name.chars().skip(BEACON_PREFIX.len() + 2).collect();
        assert_eq!(bits, vec![m.bit_one, m.bit_one, m.bit_zero, m.bit_one]);
    }

    #[test]
    fn three_of_hearts_posts_to_mailbox() {
        let mut pipeline = Pipeline::default();
        pipeline.start();
        let mut mailbox = CardMailbox::new();
        let mut now = 0;
        let mut tap_at = |pipeline: &mut Pipeline, mailbox: &mut CardMailbox, gap: u64| {
            now += gap;
            pipeline.process(SPIKE, now, &mut |c: Card| {
                mailbox.post(c);
            });
            now += SAMPLE_PERIOD_MS;
            pipeline.process(REST, now, &mut |c: Card| {
                mailbox.post(c);
            })
        };

        tap_at(&mut pipeline, &mut mailbox, 0);
        tap_at(&mut pipeline, &mut mailbox, 3000);
        tap_at(&mut pipeline, &mut mailbox, 400);
        let step = tap_at(&mut pipeline, &mut mailbox, 400).unwrap();
        assert_eq!(
            step.outcome,
            FeedOutcome::Counting {
                phase: Phase::Number,
                count: 3
            }
        );
        assert!(mailbox.is_empty());
        tap_at(&mut pipeline, &mut mailbox, 3000);
        assert_eq!(mailbox.take(), Some(Card::new(Suit::Hearts, 3).unwrap()));
    }

    #[test]
    fn five_suit_taps_emit_nothing() {
        let mut w = Wrist::new();
        w.taps(5);
        w.pause();
        assert!(w.cards.is_empty());
        assert_eq!(
            w.steps.last().map(|s| s.outcome),
            Some(FeedOutcome::Reset(ResetReason::SuitOverflow))
        );
        assert_eq!(w.pipeline.decoder_state(), DecoderState::Idle);
    }

    #[test]
    fn stopped_pipeline_ignores_taps_and_keeps_progress() {
        let mut w = Wrist::new();
        w.taps(2);
        w.pipeline.stop();
        w.taps(3);
        assert_eq!(w.steps.len(), 2);
        assert!(matches!(
            w.pipeline.decoder_state(),
            DecoderState::CountingSuit { count: 2, .. }
        ));
        w.pipeline.reset();
        assert_eq!(w.pipeline.decoder_state(), DecoderState::Idle);
    }

    #[test]
    fn apply_config_reaches_both_stages() {
        let mut config = Config::new();
        config.detector.onset_threshold_mg = 2500.0;
        config.decoder.pause_duration_ms = 1000;
        let mut pipeline = Pipeline::default();
        pipeline.apply_config(&config);
        assert_eq!(pipeline.detector().config().onset_threshold_mg, 2500.0);
        assert_eq!(pipeline.decoder().config().pause_duration_ms, 1000);
    }
}
