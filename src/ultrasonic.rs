//! Ultrasonic presence pattern: waveform generation, audio sinks, and the
//! countdown-gated playback scheduler.
//!
//! The pattern is two seconds long: one second of a full-amplitude
//! [`TONE_FREQUENCY`] sine followed by one second of silence.  Peripherals
//! listen for it and report the outcome through the ultrasonic characteristic.
//!
//! Playback is driven by a countdown:
//!
//! * [`PatternScheduler::start_or_extend`] sets the countdown to the cycle
//!   budget.  If nothing is playing it also starts the playback loop, so every
//!   newly connected peripheral gets a full budget of cycles without any
//!   per-peripheral timer.
//! * The playback loop writes one cycle, then decrements.  It exits once the
//!   countdown drops below zero.
//! * [`PatternScheduler::stop`] sets the countdown to [`IDLE`] and flushes the
//!   sink so buffered audio is discarded immediately.
//!
//! The countdown and the "loop is running" flag share one mutex; the sink write
//! happens outside it so `stop()` never waits for a cycle to finish.  Every
//! `stop()` also bumps a generation number.  A cycle whose write began before
//! a stop it did not see is flushed as soon as the write returns.

use std::f64::consts::PI;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Output sample rate in Hz.
pub const SAMPLE_RATE: u32 = 44_100;

/// Tone frequency in Hz.  Just above the audible range of most adults, and
/// still below the Nyquist limit of [`SAMPLE_RATE`].
pub const TONE_FREQUENCY: f64 = 20_000.0;

/// Number of countdown steps granted by each `start_or_extend()`.
///
/// The loop writes one cycle per step including step 0, so an undisturbed run
/// plays `CYCLE_BUDGET + 1` cycles (≈ 62 s).
pub const CYCLE_BUDGET: i32 = 30;

/// Countdown sentinel meaning "not playing".
pub const IDLE: i32 = -1;

// ── Waveform ──────────────────────────────────────────────────────────────────

/// One cycle of the presence pattern as mono signed 16-bit PCM.
///
/// Cheap to clone; the samples are shared.
#[derive(Debug, Clone)]
pub struct Waveform {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl Waveform {
    /// Build the two-second pattern: `tone_hz` sine at full scale for the
    /// first `sample_rate` samples, silence for the next `sample_rate`.
    pub fn generate(sample_rate: u32, tone_hz: f64) -> Self {
        let rate = sample_rate as usize;
        let angular = 2.0 * PI * tone_hz;
        let samples: Arc<[i16]> = (0..2 * rate)
            .map(|i| {
                if i < rate {
                    let t = i as f64 / sample_rate as f64;
                    ((angular * t).sin() * i16::MAX as f64) as i16
                } else {
                    0
                }
            })
            .collect();
        Self {
            samples,
            sample_rate,
        }
    }

    /// The pattern at [`SAMPLE_RATE`] / [`TONE_FREQUENCY`].
    pub fn ultrasonic() -> Self {
        Self::generate(SAMPLE_RATE, TONE_FREQUENCY)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Real-time duration of one cycle.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

// ── Seams ─────────────────────────────────────────────────────────────────────

/// An audio output device accepting mono 16-bit PCM.
///
/// `write` may block until the device has room, like a streaming audio track.
/// `flush` discards anything written but not yet emitted and must not block.
pub trait AudioSink: Send + Sync {
    fn play(&self) -> Result<()>;
    fn write(&self, pcm: &[i16]) -> Result<()>;
    fn flush(&self);
}

/// The two commands the peripheral repository issues to the pattern player.
pub trait PatternScheduler: Send + Sync {
    fn start_or_extend(&self);
    fn stop(&self);
}

impl<T: PatternScheduler + ?Sized> PatternScheduler for Arc<T> {
    fn start_or_extend(&self) {
        (**self).start_or_extend()
    }

    fn stop(&self) {
        (**self).stop()
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

struct Playback {
    countdown: i32,
    /// A playback thread exists and has not yet observed `countdown < 0`.
    looping: bool,
    /// Number of `stop()` calls so far.
    generation: u64,
}

struct Shared {
    playback: Mutex<Playback>,
    sink: Arc<dyn AudioSink>,
    waveform: Waveform,
    budget: i32,
}

/// Plays the presence pattern on an [`AudioSink`] for a bounded, extendable
/// number of cycles.
///
/// Dropping the scheduler stops playback.
pub struct UltrasonicScheduler {
    shared: Arc<Shared>,
}

impl UltrasonicScheduler {
    /// Scheduler for the standard pattern with a [`CYCLE_BUDGET`] budget.
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self::with_budget(sink, Waveform::ultrasonic(), CYCLE_BUDGET)
    }

    pub fn with_budget(sink: Arc<dyn AudioSink>, waveform: Waveform, budget: i32) -> Self {
        Self {
            shared: Arc::new(Shared {
                playback: Mutex::new(Playback {
                    countdown: IDLE,
                    looping: false,
                    generation: 0,
                }),
                sink,
                waveform,
                budget: budget.max(0),
            }),
        }
    }

    /// Current countdown value; [`IDLE`] when not playing.
    pub fn countdown(&self) -> i32 {
        self.shared.playback.lock().countdown
    }

    pub fn is_playing(&self) -> bool {
        self.countdown() >= 0
    }
}

impl PatternScheduler for UltrasonicScheduler {
    fn start_or_extend(&self) {
        let mut playback = self.shared.playback.lock();
        let was_idle = playback.countdown < 0;

        if was_idle {
            if let Err(e) = self.shared.sink.play() {
                warn!("ultrasonic: sink refused to start: {e}");
                return;
            }
        }
        playback.countdown = self.shared.budget;

        if playback.looping {
            debug!("ultrasonic: countdown reset to {}", self.shared.budget);
            return;
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("ultrasonic-playback".into())
            .spawn(move || playback_loop(shared))
        {
            Ok(_) => {
                playback.looping = true;
                info!(
                    "ultrasonic: playback started ({} cycles budget)",
                    self.shared.budget
                );
            }
            Err(e) => {
                warn!("ultrasonic: could not spawn playback thread: {e}");
                playback.countdown = IDLE;
            }
        }
    }

    fn stop(&self) {
        let mut playback = self.shared.playback.lock();
        let was_playing = playback.countdown >= 0;
        playback.countdown = IDLE;
        playback.generation += 1;
        self.shared.sink.flush();
        if was_playing {
            info!("ultrasonic: playback stopped");
        }
    }
}

impl Drop for UltrasonicScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the playback thread.
///
/// Only this function decrements the countdown.  A stop that lands while a
/// cycle is being written, or between the countdown check and the write, is
/// honoured right after that write returns: the cycle is flushed and not
/// counted.
fn playback_loop(shared: Arc<Shared>) {
    let mut cycles: u64 = 0;
    loop {
        let generation = {
            let mut playback = shared.playback.lock();
            if playback.countdown < 0 {
                playback.looping = false;
                break;
            }
            playback.generation
        };

        if let Err(e) = shared.sink.write(shared.waveform.samples()) {
            warn!("ultrasonic: sink write failed after {cycles} cycle(s): {e}");
            let mut playback = shared.playback.lock();
            playback.countdown = IDLE;
            playback.looping = false;
            break;
        }
        cycles += 1;

        let mut playback = shared.playback.lock();
        if playback.generation != generation {
            // The stop's own flush may have run before this cycle reached the sink.
            shared.sink.flush();
        } else if playback.countdown >= 0 {
            playback.countdown -= 1;
        }
    }
    debug!("ultrasonic: playback loop exited after {cycles} cycle(s)");
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// A virtual output device that emits nothing but blocks each `write` for the
/// buffer's real-time duration, like a streaming track would.
///
/// `flush` wakes a blocked writer immediately.
pub struct PacedSink {
    sample_rate: u32,
    /// Bumped by every flush; a waiting writer returns when it changes.
    generation: Mutex<u64>,
    wake: Condvar,
}

impl PacedSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            generation: Mutex::new(0),
            wake: Condvar::new(),
        }
    }
}

impl AudioSink for PacedSink {
    fn play(&self) -> Result<()> {
        Ok(())
    }

    fn write(&self, pcm: &[i16]) -> Result<()> {
        if self.sample_rate == 0 {
            return Ok(());
        }
        let length = Duration::from_secs_f64(pcm.len() as f64 / self.sample_rate as f64);
        let deadline = Instant::now() + length;
        let mut generation = self.generation.lock();
        let started = *generation;
        while *generation == started {
            if self.wake.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
        Ok(())
    }

    fn flush(&self) {
        *self.generation.lock() += 1;
        self.wake.notify_all();
    }
}

/// Streams raw signed 16-bit little-endian PCM into any writer, e.g. stdout
/// piped into `aplay -f S16_LE -r 44100 -c 1`.
///
/// Bytes already handed to the writer cannot be recalled, so `flush` only
/// forwards to [`Write::flush`].  A writer that never pushes back, such as a
/// file, should use [`RawPcmSink::paced`] so that `stop()` still cuts the
/// output short.
pub struct RawPcmSink<W: Write + Send> {
    out: Mutex<W>,
    pace: Option<PacedSink>,
}

impl<W: Write + Send> RawPcmSink<W> {
    /// Write as fast as `out` accepts.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            pace: None,
        }
    }

    /// After each write, wait for the buffer's real-time duration at
    /// `sample_rate`, or until the next flush.
    pub fn paced(out: W, sample_rate: u32) -> Self {
        Self {
            out: Mutex::new(out),
            pace: Some(PacedSink::new(sample_rate)),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> AudioSink for RawPcmSink<W> {
    fn play(&self) -> Result<()> {
        Ok(())
    }

    fn write(&self, pcm: &[i16]) -> Result<()> {
        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.out.lock().write_all(&bytes)?;
        match &self.pace {
            Some(pace) => pace.write(pcm),
            None => Ok(()),
        }
    }

    fn flush(&self) {
        if let Some(pace) = &self.pace {
            pace.flush();
        }
        // A writer mid-cycle holds the lock; skip rather than block.
        let Some(mut out) = self.out.try_lock() else {
            return;
        };
        if let Err(e) = out.flush() {
            debug!("raw pcm sink: flush failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sink whose `write` blocks until the test opens the gate.
    #[derive(Default)]
    struct GateSink {
        plays: AtomicUsize,
        writes: AtomicUsize,
        flushes: AtomicUsize,
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl GateSink {
        fn open(&self) {
            *self.open.lock() = true;
            self.opened.notify_all();
        }
    }

    impl AudioSink for GateSink {
        fn play(&self) -> Result<()> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn write(&self, _pcm: &[i16]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
            Ok(())
        }

        fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Sink that accepts every write immediately.
    #[derive(Default)]
    struct CountingSink {
        writes: AtomicUsize,
        samples: AtomicUsize,
    }

    impl AudioSink for CountingSink {
        fn play(&self) -> Result<()> {
            Ok(())
        }

        fn write(&self, pcm: &[i16]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.samples.store(pcm.len(), Ordering::SeqCst);
            Ok(())
        }

        fn flush(&self) {}
    }

    /// Sink that counts writes not yet discarded by a later flush.
    #[derive(Default)]
    struct UnflushedSink {
        unflushed: Mutex<usize>,
    }

    impl AudioSink for UnflushedSink {
        fn play(&self) -> Result<()> {
            Ok(())
        }

        fn write(&self, _pcm: &[i16]) -> Result<()> {
            *self.unflushed.lock() += 1;
            Ok(())
        }

        fn flush(&self) {
            *self.unflushed.lock() = 0;
        }
    }

    struct FailingSink;

    impl AudioSink for FailingSink {
        fn play(&self) -> Result<()> {
            Ok(())
        }

        fn write(&self, _pcm: &[i16]) -> Result<()> {
            anyhow::bail!("device unplugged")
        }

        fn flush(&self) {}
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn small_waveform() -> Waveform {
        Waveform::generate(100, 20.0)
    }

    #[test]
    fn waveform_is_one_second_tone_then_silence() {
        let wave = Waveform::ultrasonic();
        let rate = SAMPLE_RATE as usize;
        assert_eq!(wave.samples().len(), 2 * rate);
        assert_eq!(wave.duration(), Duration::from_secs(2));

        assert_eq!(wave.samples()[0], 0);
        assert!(wave.samples()[..rate].iter().any(|&s| s > i16::MAX / 2));
        assert!(wave.samples()[..rate].iter().any(|&s| s < i16::MIN / 2));
        assert!(wave.samples()[rate..].iter().all(|&s| s == 0));
    }

    #[test]
    fn waveform_is_deterministic() {
        let a = Waveform::generate(8_000, 1_000.0);
        let b = Waveform::generate(8_000, 1_000.0);
        assert_eq!(a.samples(), b.samples());
        // 1 kHz at 8 kHz: sample 2 is a quarter period → full positive scale.
        assert_eq!(a.samples()[2], i16::MAX);
    }

    #[test]
    fn starts_idle() {
        let scheduler = UltrasonicScheduler::new(Arc::new(CountingSink::default()));
        assert_eq!(scheduler.countdown(), IDLE);
        assert!(!scheduler.is_playing());
    }

    #[test]
    fn repeated_extend_resets_instead_of_accumulating() {
        let sink = Arc::new(GateSink::default());
        let scheduler = UltrasonicScheduler::with_budget(sink.clone(), small_waveform(), CYCLE_BUDGET);

        scheduler.start_or_extend();
        assert!(wait_until(|| sink.writes.load(Ordering::SeqCst) == 1));
        for _ in 0..5 {
            scheduler.start_or_extend();
        }
        assert_eq!(scheduler.countdown(), CYCLE_BUDGET);
        assert_eq!(sink.plays.load(Ordering::SeqCst), 1);

        scheduler.stop();
        sink.open();
        assert!(wait_until(|| !scheduler.shared.playback.lock().looping));
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_extends_leave_exactly_one_budget() {
        let sink = Arc::new(GateSink::default());
        let scheduler = Arc::new(UltrasonicScheduler::with_budget(
            sink.clone(),
            small_waveform(),
            CYCLE_BUDGET,
        ));
        scheduler.start_or_extend();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&scheduler);
                thread::spawn(move || s.start_or_extend())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(scheduler.countdown(), CYCLE_BUDGET);

        scheduler.stop();
        sink.open();
    }

    #[test]
    fn stop_flushes_and_goes_idle() {
        let sink = Arc::new(GateSink::default());
        let scheduler = UltrasonicScheduler::with_budget(sink.clone(), small_waveform(), 10);

        scheduler.start_or_extend();
        scheduler.stop();
        assert_eq!(scheduler.countdown(), IDLE);
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);

        sink.open();
        assert!(wait_until(|| !scheduler.shared.playback.lock().looping));
        // The in-flight cycle is not followed by another one.
        assert!(sink.writes.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn no_cycle_survives_a_stop() {
        let sink = Arc::new(UnflushedSink::default());
        let scheduler = UltrasonicScheduler::with_budget(sink.clone(), small_waveform(), i32::MAX);

        for run in 0..200 {
            scheduler.start_or_extend();
            thread::sleep(Duration::from_millis(1));
            scheduler.stop();
            assert!(wait_until(|| !scheduler.shared.playback.lock().looping));
            assert_eq!(*sink.unflushed.lock(), 0, "audio left over after stop in run {run}");
        }
    }

    #[test]
    fn undisturbed_run_plays_budget_plus_one_cycles() {
        let sink = Arc::new(CountingSink::default());
        let wave = small_waveform();
        let scheduler = UltrasonicScheduler::with_budget(sink.clone(), wave.clone(), 3);

        scheduler.start_or_extend();
        assert!(wait_until(|| !scheduler.is_playing()
            && !scheduler.shared.playback.lock().looping));
        assert_eq!(sink.writes.load(Ordering::SeqCst), 4);
        assert_eq!(sink.samples.load(Ordering::SeqCst), wave.samples().len());
    }

    #[test]
    fn start_after_stop_plays_again() {
        let sink = Arc::new(GateSink::default());
        let scheduler = UltrasonicScheduler::with_budget(sink.clone(), small_waveform(), 5);

        scheduler.start_or_extend();
        scheduler.stop();
        scheduler.start_or_extend();

        assert_eq!(scheduler.countdown(), 5);
        assert_eq!(sink.plays.load(Ordering::SeqCst), 2);

        scheduler.stop();
        sink.open();
        assert!(wait_until(|| !scheduler.shared.playback.lock().looping));
    }

    #[test]
    fn sink_failure_ends_playback() {
        let scheduler = UltrasonicScheduler::with_budget(Arc::new(FailingSink), small_waveform(), 5);
        scheduler.start_or_extend();
        assert!(wait_until(|| !scheduler.is_playing()));
    }

    #[test]
    fn paced_sink_returns_early_on_flush() {
        let sink = Arc::new(PacedSink::new(10));
        let writer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                let started = Instant::now();
                // 100 samples at 10 Hz = 10 s unless flushed.
                sink.write(&[0; 100]).unwrap();
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(50));
        sink.flush();
        let waited = writer.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn paced_raw_sink_holds_each_write_until_flushed() {
        // 100 samples at 10 Hz = 10 s unless flushed.
        let sink = Arc::new(RawPcmSink::paced(Vec::new(), 10));
        let writer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                let started = Instant::now();
                sink.write(&[7; 100]).unwrap();
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        sink.flush();
        assert!(writer.join().unwrap() < Duration::from_secs(5));

        let sink = Arc::into_inner(sink).unwrap();
        assert_eq!(sink.into_inner().len(), 200);
    }

    #[test]
    fn raw_pcm_sink_writes_little_endian() {
        let sink = RawPcmSink::new(Vec::new());
        sink.write(&[1, -2, 0x1234]).unwrap();
        assert_eq!(
            sink.into_inner(),
            vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]
        );
    }
}
