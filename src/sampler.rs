//! Timed sensor samplers.
//!
//! A sampler collects a sequence of timestamped samples while a region of
//! the tracee executes. Starting a sampler yields a [`RunningSampler`]
//! handle, the promise the tracer awaits at region exit: periodic samplers
//! run in a background thread until joined, the short sampler has already
//! taken its start sample and takes the end sample on join.
//!
//! Cancellation is cooperative. The controller raises the finished flag and
//! posts the signaler; the worker observes both on every wake, takes a final
//! sample and returns everything it accumulated.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::nrg::{EnergyReader, Error, Sample, TimedExecution, TimedSample, Timestamp};

/// Default cadence of periodic samplers.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(30);

/// Extra bounded-buffer capacity beyond the configured sample count.
const BOUNDED_SLACK: usize = 2;

/// Initial capacity of the unbounded periodic buffer.
const UNBOUNDED_INITIAL: usize = 128;

/// A failed sampling run: the error plus everything collected before it.
pub struct SamplerFailure {
    pub error: Error,
    pub partial: TimedExecution,
}

impl fmt::Debug for SamplerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerFailure")
            .field("error", &self.error)
            .field("partial_len", &self.partial.len())
            .finish()
    }
}

pub type SamplerResult = Result<TimedExecution, SamplerFailure>;

/// One-shot wake primitive shared between the controller and a sampler
/// thread.
struct Signaler {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signaler {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut signaled = self.state.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Sleeps up to `timeout` and reports whether the signal was posted.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.state.lock().unwrap();
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(signaled, deadline - now)
                .unwrap();
            signaled = guard;
            if result.timed_out() {
                break;
            }
        }
        *signaled
    }
}

/// Takes one timed sample: the monotonic timestamp is captured immediately
/// before the sensors are read.
fn take_timed_sample(reader: &dyn EnergyReader) -> Result<TimedSample, Error> {
    let timestamp = Timestamp::now();
    let mut sample = Sample::new();
    reader.read_all(&mut sample)?;
    Ok(TimedSample::new(timestamp, sample))
}

/// Sampler factory selected by the region resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerSpec {
    /// Start and end sample only.
    Short,
    /// Periodic with a pre-sized, never-reallocating buffer.
    BoundedPeriodic { period: Duration, samples: usize },
    /// Periodic with a growable buffer.
    UnboundedPeriodic { period: Duration },
    /// No reader available; produces an empty sequence.
    Null,
}

impl SamplerSpec {
    /// Starts sampling and returns the promise handle. Without a reader the
    /// null sampler runs and yields an empty sequence.
    pub fn spawn(&self, reader: Option<Arc<dyn EnergyReader>>) -> RunningSampler {
        let Some(reader) = reader else {
            return RunningSampler::Null;
        };
        match *self {
            SamplerSpec::Short => RunningSampler::Short {
                start: take_timed_sample(reader.as_ref()),
                reader,
            },
            SamplerSpec::BoundedPeriodic { period, samples } => {
                RunningSampler::Periodic(PeriodicHandle::spawn(reader, period, Some(samples)))
            }
            SamplerSpec::UnboundedPeriodic { period } => {
                RunningSampler::Periodic(PeriodicHandle::spawn(reader, period, None))
            }
            SamplerSpec::Null => RunningSampler::Null,
        }
    }
}

/// The promise side of a started sampler.
pub enum RunningSampler {
    Short {
        reader: Arc<dyn EnergyReader>,
        start: Result<TimedSample, Error>,
    },
    Periodic(PeriodicHandle),
    Null,
}

impl RunningSampler {
    /// Awaits the sampler and returns its timed samples.
    pub fn join(self) -> SamplerResult {
        match self {
            RunningSampler::Short { reader, start } => {
                let start = start.map_err(|error| SamplerFailure {
                    error,
                    partial: Vec::new(),
                })?;
                match take_timed_sample(reader.as_ref()) {
                    Ok(end) => Ok(vec![start, end]),
                    Err(error) => Err(SamplerFailure {
                        error,
                        partial: vec![start],
                    }),
                }
            }
            RunningSampler::Periodic(handle) => handle.join(),
            RunningSampler::Null => Ok(Vec::new()),
        }
    }
}

/// Handle of a periodic sampler's background thread.
pub struct PeriodicHandle {
    signaler: Arc<Signaler>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<SamplerResult>>,
}

impl PeriodicHandle {
    fn spawn(
        reader: Arc<dyn EnergyReader>,
        period: Duration,
        bound: Option<usize>,
    ) -> Self {
        let signaler = Arc::new(Signaler::new());
        let finished = Arc::new(AtomicBool::new(false));

        let worker_signaler = Arc::clone(&signaler);
        let worker_finished = Arc::clone(&finished);
        let handle = std::thread::spawn(move || {
            periodic_worker(reader, worker_signaler, worker_finished, period, bound)
        });

        Self {
            signaler,
            finished,
            handle: Some(handle),
        }
    }

    fn join(mut self) -> SamplerResult {
        self.signal();
        let handle = self.handle.take().expect("periodic sampler joined twice");
        handle.join().expect("sampler thread panicked")
    }

    fn signal(&self) {
        self.finished.store(true, Ordering::Release);
        self.signaler.post();
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        // never leave a detached sampler thread behind
        if let Some(handle) = self.handle.take() {
            warn!("sampler dropped without join; cancelling");
            self.signal();
            let _ = handle.join();
        }
    }
}

fn periodic_worker(
    reader: Arc<dyn EnergyReader>,
    signaler: Arc<Signaler>,
    finished: Arc<AtomicBool>,
    period: Duration,
    bound: Option<usize>,
) -> SamplerResult {
    let mut samples: TimedExecution = match bound {
        Some(n) => Vec::with_capacity(n + BOUNDED_SLACK),
        None => Vec::with_capacity(UNBOUNDED_INITIAL),
    };

    let mut push = |samples: &mut TimedExecution| -> Result<(), SamplerFailure> {
        match take_timed_sample(reader.as_ref()) {
            Ok(s) => {
                samples.push(s);
                Ok(())
            }
            Err(error) => Err(SamplerFailure {
                error,
                partial: samples.drain(..).collect(),
            }),
        }
    };

    push(&mut samples)?;
    loop {
        let signaled = signaler.wait_timeout(period);
        if signaled || finished.load(Ordering::Acquire) {
            // final sample, then hand everything back
            push(&mut samples)?;
            break;
        }
        // a full bounded buffer keeps its cadence but stops recording;
        // the final sample above still fits the pre-reserved slack
        if bound.is_some_and(|n| samples.len() >= n) {
            continue;
        }
        push(&mut samples)?;
    }

    debug!("periodic sampler collected {} samples", samples.len());
    Ok(samples)
}

/// Synchronous sampler: brackets a callable run on the calling thread with
/// a start and an end sample.
pub fn sync_sample(reader: &dyn EnergyReader, work: impl FnOnce()) -> SamplerResult {
    let start = match take_timed_sample(reader) {
        Ok(s) => s,
        Err(error) => {
            return Err(SamplerFailure {
                error,
                partial: Vec::new(),
            })
        }
    };
    work();
    match take_timed_sample(reader) {
        Ok(end) => Ok(vec![start, end]),
        Err(error) => Err(SamplerFailure {
            error,
            partial: vec![start],
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::nrg::Result as NrgResult;

    /// Counts reads; optionally fails from the n-th read on.
    struct FakeReader {
        calls: AtomicUsize,
        fail_from: Option<usize>,
    }

    impl FakeReader {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_from: None,
            }
        }

        fn failing_from(n: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_from: Some(n),
            }
        }
    }

    impl EnergyReader for FakeReader {
        fn read_all(&self, sample: &mut Sample) -> NrgResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_from.is_some_and(|limit| n >= limit) {
                return Err(Error::ReadingsNotValid);
            }
            sample.set_value(0, n as u64);
            Ok(())
        }

        fn read_one(&self, sample: &mut Sample, _idx: usize) -> NrgResult<()> {
            self.read_all(sample)
        }

        fn num_events(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_short_sampler() {
        let reader = Arc::new(FakeReader::new());
        let running = SamplerSpec::Short.spawn(Some(reader));
        std::thread::sleep(Duration::from_millis(5));
        let samples = running.join().unwrap();

        assert_eq!(samples.len(), 2);
        assert!(samples[1].timestamp > samples[0].timestamp);
        assert_eq!(samples[0].sample.value(0), 1);
        assert_eq!(samples[1].sample.value(0), 2);
    }

    #[test]
    fn test_null_sampler() {
        let reader = Arc::new(FakeReader::new());
        assert!(SamplerSpec::Null.spawn(Some(reader)).join().unwrap().is_empty());
    }

    #[test]
    fn test_sync_sampler() {
        let reader = FakeReader::new();
        let mut ran = false;
        let samples = sync_sample(&reader, || ran = true).unwrap();
        assert!(ran);
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_bounded_periodic_cadence() {
        let spec = SamplerSpec::BoundedPeriodic {
            period: Duration::from_millis(10),
            samples: 10,
        };
        let running = spec.spawn(Some(Arc::new(FakeReader::new())));
        std::thread::sleep(Duration::from_millis(105));
        let samples = running.join().unwrap();

        assert!(samples.len() >= 2, "got {} samples", samples.len());
        assert!(samples.len() <= 11, "got {} samples", samples.len());
        for pair in samples.windows(2) {
            let delta = pair[1].timestamp - pair[0].timestamp;
            assert!(delta >= 9_000_000, "period underrun: {} ns", delta);
        }
    }

    #[test]
    fn test_bounded_periodic_stops_recording_when_full() {
        let spec = SamplerSpec::BoundedPeriodic {
            period: Duration::from_millis(1),
            samples: 5,
        };
        let running = spec.spawn(Some(Arc::new(FakeReader::new())));
        std::thread::sleep(Duration::from_millis(100));
        let samples = running.join().unwrap();

        assert!(samples.len() <= 6, "got {} samples", samples.len());
    }

    #[test]
    fn test_unbounded_periodic_grows() {
        let spec = SamplerSpec::UnboundedPeriodic {
            period: Duration::from_millis(1),
        };
        let running = spec.spawn(Some(Arc::new(FakeReader::new())));
        std::thread::sleep(Duration::from_millis(50));
        let samples = running.join().unwrap();

        assert!(samples.len() > 2);
    }

    #[test]
    fn test_cancellation_is_prompt() {
        let spec = SamplerSpec::UnboundedPeriodic {
            period: Duration::from_secs(10),
        };
        let running = spec.spawn(Some(Arc::new(FakeReader::new())));
        std::thread::sleep(Duration::from_millis(20));

        let begin = Instant::now();
        let samples = running.join().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(2));
        // initial sample plus the final one taken on cancellation
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_read_error_returns_partial() {
        let spec = SamplerSpec::BoundedPeriodic {
            period: Duration::from_millis(5),
            samples: 100,
        };
        let running = spec.spawn(Some(Arc::new(FakeReader::failing_from(4))));
        std::thread::sleep(Duration::from_millis(100));
        let failure = running.join().unwrap_err();

        assert!(matches!(failure.error, Error::ReadingsNotValid));
        assert_eq!(failure.partial.len(), 3);
    }

    #[test]
    fn test_short_sampler_failed_start() {
        let running = SamplerSpec::Short.spawn(Some(Arc::new(FakeReader::failing_from(1))));
        let failure = running.join().unwrap_err();
        assert!(failure.partial.is_empty());
    }
}
