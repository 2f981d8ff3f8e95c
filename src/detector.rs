/// Tap detector: turns a stream of acceleration magnitudes into discrete taps.
///
/// A tap opens when the excursion from the gravity baseline crosses the onset
/// threshold and closes once it falls below the hysteresis floor. Only closed
/// taps are reported: a spike that never settles (stuck sensor, freefall)
/// never produces an event. Onsets within the cooldown after the previous
/// tap closed are ignored.
///
/// The detector owns no clock. Callers pass a monotonic millisecond timestamp
/// with every sample, which keeps it testable on the host and lets firmware
/// use whichever time source its runtime provides.
use crate::accel::SensorError;
use crate::config::DetectorConfig;

/// Tap classification by duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapKind {
    Short,
    Long,
}

impl TapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TapKind::Short => "short",
            TapKind::Long => "long",
        }
    }
}

/// One completed tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapEvent {
    pub kind: TapKind,
    /// Time between onset and offset.
    pub duration_ms: u64,
}

/// Anything that can produce one magnitude reading per detector tick.
pub trait MagnitudeSource {
    fn read_magnitude(&mut self) -> Result<f64, SensorError>;
}

/// Receiver for completed taps.
pub trait TapObserver {
    fn on_tap(&mut self, tap: TapEvent);
}

impl<F: FnMut(TapEvent)> TapObserver for F {
    fn on_tap(&mut self, tap: TapEvent) {
        self(tap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Quiet,
    InTap { start_ms: u64 },
}

/// Threshold/hysteresis tap detector.
#[derive(Debug, Clone)]
pub struct TapDetector {
    config: DetectorConfig,
    running: bool,
    phase: Phase,
    /// End of the previous tap, for cooldown. `None` until the first tap.
    last_tap_end_ms: Option<u64>,
}

impl TapDetector {
    /// Create a stopped detector.
    pub const fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            running: false,
            phase: Phase::Quiet,
            last_tap_end_ms: None,
        }
    }

    pub fn start(&mut self) {
        if !self.running {
            log::info!("Tap detector started");
        }
        self.running = true;
    }

    /// Stop sampling. A tap in progress is abandoned.
    pub fn stop(&mut self) {
        if self.running {
            log::info!("Tap detector stopped");
        }
        self.running = false;
        self.phase = Phase::Quiet;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True while a tap has opened but not yet closed.
    pub fn in_tap(&self) -> bool {
        matches!(self.phase, Phase::InTap { .. })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Replace thresholds. Takes effect on the next sample.
    pub fn set_config(&mut self, config: DetectorConfig) {
        self.config = config;
    }

    /// Run one sampling tick: read the source and feed the result.
    ///
    /// Read errors skip the tick without touching detector state. A
    /// completed tap is delivered to `observer` and also returned.
    pub fn tick<S, O>(&mut self, source: &mut S, now_ms: u64, observer: &mut O) -> Option<TapEvent>
    where
        S: MagnitudeSource + ?Sized,
        O: TapObserver + ?Sized,
    {
        if !self.running {
            return None;
        }
        let magnitude = match source.read_magnitude() {
            Ok(m) => m,
            Err(e) => {
                log::debug!("Sensor read skipped: {}", e);
                return None;
            }
        };
        let tap = self.process(magnitude, now_ms)?;
        observer.on_tap(tap);
        Some(tap)
    }

    /// Feed one magnitude sample taken at `now_ms`.
    pub fn process(&mut self, magnitude_mg: f64, now_ms: u64) -> Option<TapEvent> {
        if !self.running {
            return None;
        }
        let excursion = abs_diff(magnitude_mg, self.config.gravity_baseline_mg);

        match self.phase {
            Phase::Quiet => {
                if excursion > self.config.onset_threshold_mg && self.cooled_down(now_ms) {
                    log::debug!("Tap onset: excursion={:.0} mg", excursion);
                    self.phase = Phase::InTap { start_ms: now_ms };
                }
                None
            }
            Phase::InTap { start_ms } => {
                if excursion >= self.config.offset_threshold_mg() {
                    return None;
                }
                let duration_ms = now_ms.saturating_sub(start_ms);
                let kind = if duration_ms < self.config.long_tap_duration_ms {
                    TapKind::Short
                } else {
                    TapKind::Long
                };
                self.phase = Phase::Quiet;
                self.last_tap_end_ms = Some(now_ms);
                log::info!("Tap completed: {} ({} ms)", kind.as_str(), duration_ms);
                Some(TapEvent { kind, duration_ms })
            }
        }
    }

    fn cooled_down(&self, now_ms: u64) -> bool {
        match self.last_tap_end_ms {
            Some(end) => now_ms.saturating_sub(end) >= self.config.cooldown_ms,
            None => true,
        }
    }
}

fn abs_diff(a: f64, b: f64) -> f64 {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

impl Default for TapDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::SAMPLE_PERIOD_MS;

    const REST: f64 = 1000.0;
    const SPIKE: f64 = 3000.0;

    /// Plays back a fixed list of readings, then rests forever.
    struct Script {
        readings: std::vec::IntoIter<Result<f64, SensorError>>,
    }

    impl Script {
        fn new(readings: Vec<Result<f64, SensorError>>) -> Self {
            Self {
                readings: readings.into_iter(),
            }
        }
    }

    impl MagnitudeSource for Script {
        fn read_magnitude(&mut self) -> Result<f64, SensorError> {
            self.readings.next().unwrap_or(Ok(REST))
        }
    }

    fn running() -> TapDetector {
        let mut d = TapDetector::default();
        d.start();
        d
    }

    /// Feed `samples` at the 50 Hz cadence starting at `t0`, collecting taps.
    fn feed(d: &mut TapDetector, t0: u64, samples: &[f64]) -> Vec<TapEvent> {
        samples
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| d.process(m, t0 + i as u64 * SAMPLE_PERIOD_MS))
            .collect()
    }

    #[test]
    fn sub_threshold_noise_never_taps() {
        let mut d = running();
        let noise: Vec<f64> = (0..500)
            .map(|i| REST + if i % 2 == 0 { 1400.0 } else { -1400.0 })
            .collect();
        assert!(feed(&mut d, 0, &noise).is_empty());
        assert!(!d.in_tap());
    }

    #[test]
    fn short_tap_emits_once_on_offset() {
        let mut d = running();
        assert_eq!(d.process(SPIKE, 0), None);
        assert!(d.in_tap());
        assert_eq!(d.process(SPIKE, 20), None);
        let tap = d.process(REST, 40).expect("tap closes");
        assert_eq!(tap, TapEvent { kind: TapKind::Short, duration_ms: 40 });
        assert_eq!(d.process(REST, 60), None);
    }

    #[test]
    fn thresholds_are_strict() {
        let mut d = running();
        // Excursion exactly at the onset threshold.
        assert_eq!(d.process(2500.0, 0), None);
        assert!(!d.in_tap());
        assert_eq!(d.process(2500.1, 20), None);
        assert!(d.in_tap());

        // Excursion exactly at the hysteresis floor.
        assert_eq!(d.process(1750.0, 40), None);
        assert!(d.in_tap());
        let tap = d.process(1749.9, 60).expect("below floor closes");
        assert_eq!(tap.duration_ms, 40);
        assert!(!d.in_tap());
    }

    #[test]
    fn long_tap_boundary() {
        let mut d = running();
        d.process(SPIKE, 1000);
        let tap = d.process(REST, 2999).unwrap();
        assert_eq!(tap.kind, TapKind::Short);

        d.process(SPIKE, 5000);
        let tap = d.process(REST, 7000).unwrap();
        assert_eq!(tap.kind, TapKind::Long);
        assert_eq!(tap.duration_ms, 2000);
    }

    #[test]
    fn hysteresis_keeps_tap_open_between_thresholds() {
        let mut d = running();
        d.process(SPIKE, 0);
        // excursion 1000 mg: below onset, above the 750 mg floor
        assert_eq!(d.process(2000.0, 20), None);
        assert!(d.in_tap());
        assert!(d.process(1700.0, 40).is_some());
    }

    #[test]
    fn negative_excursion_counts() {
        let mut d = running();
        // sensor inverted hard enough to swing 1600 mg below the baseline
        d.process(-600.0, 0);
        assert!(d.in_tap());
        assert!(d.process(REST, 20).is_some());
    }

    #[test]
    fn stuck_tap_never_emits() {
        let mut d = running();
        let stuck = vec![SPIKE; 1000];
        assert!(feed(&mut d, 0, &stuck).is_empty());
        assert!(d.in_tap());
    }

    #[test]
    fn cooldown_suppresses_close_onset() {
        let mut d = running();
        d.process(SPIKE, 0);
        assert!(d.process(REST, 20).is_some());
        // 100 ms after the first tap closed
        assert_eq!(d.process(SPIKE, 120), None);
        assert!(!d.in_tap());
        assert_eq!(d.process(REST, 140), None);
    }

    #[test]
    fn onset_allowed_once_cooldown_elapsed() {
        let mut d = running();
        d.process(SPIKE, 0);
        d.process(REST, 20);
        d.process(SPIKE, 220);
        assert!(d.in_tap());
        assert!(d.process(REST, 240).is_some());
    }

    #[test]
    fn sensor_errors_are_skipped() {
        let mut d = running();
        let mut taps = Vec::new();
        let mut source = Script::new(vec![
            Ok(SPIKE),
            Err(SensorError::Bus),
            Err(SensorError::Bus),
            Ok(REST),
        ]);
        let mut observer = |t: TapEvent| taps.push(t);
        let mut emitted = 0;
        for i in 0..4u64 {
            if d.tick(&mut source, i * 20, &mut observer).is_some() {
                emitted += 1;
            }
            if i == 1 {
                assert!(d.in_tap(), "error tick must not close the tap");
            }
        }
        assert_eq!(emitted, 1);
        assert_eq!(taps.len(), 1);
        assert_eq!(taps[0].duration_ms, 60);
    }

    #[test]
    fn stopped_detector_is_silent() {
        let mut d = TapDetector::default();
        assert_eq!(d.process(SPIKE, 0), None);
        assert!(!d.in_tap());

        let mut source = Script::new(vec![Ok(SPIKE), Ok(REST)]);
        let mut count = 0;
        let mut observer = |_t: TapEvent| count += 1;
        d.tick(&mut source, 0, &mut observer);
        d.tick(&mut source, 20, &mut observer);
        assert_eq!(count, 0);
    }

    #[test]
    fn stop_abandons_tap_in_progress() {
        let mut d = running();
        d.process(SPIKE, 0);
        d.stop();
        d.start();
        assert_eq!(d.process(REST, 20), None);
    }

    #[test]
    fn config_change_applies_to_next_sample() {
        let mut d = running();
        let mut cfg = *d.config();
        cfg.onset_threshold_mg = 3000.0;
        d.set_config(cfg);
        assert_eq!(d.process(SPIKE, 0), None);
        assert!(!d.in_tap());
    }
}
