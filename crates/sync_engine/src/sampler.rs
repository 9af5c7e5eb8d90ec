//! Process CPU load sampling.
//!
//! A background thread snapshots the process's cumulative user+system CPU
//! time every `period`, divides the delta by wall time and host parallelism,
//! and keeps an EWMA of the result. Readers get the last smoothed value
//! without blocking. If the OS stops reporting usage, the last value stays.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sync_core::host_parallelism;
use sync_logging::sync_warn;

/// Anything the governor can read a 0..=100 load percentage from.
pub trait LoadSource: Send + Sync {
    fn sample(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub period_ms: u64,
    /// Weight of the newest reading in the moving average, 0..=1.
    pub ewma_alpha: f64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            period_ms: 50,
            ewma_alpha: 0.3,
        }
    }
}

impl SamplerSettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

/// Smoothed CPU utilisation of this process.
pub struct ProcessCpuSampler {
    reading: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ProcessCpuSampler {
    pub fn start(settings: SamplerSettings) -> Self {
        let reading = Arc::new(AtomicU64::new(0f64.to_bits()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let reading = reading.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("load-sampler".into())
                .spawn(move || sample_loop(settings, &reading, &stop))
        };
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                sync_warn!("load sampler thread not started, load stays at 0: {}", err);
                None
            }
        };
        Self {
            reading,
            stop,
            thread,
        }
    }
}

impl LoadSource for ProcessCpuSampler {
    fn sample(&self) -> f64 {
        f64::from_bits(self.reading.load(Ordering::Relaxed))
    }
}

impl Drop for ProcessCpuSampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn sample_loop(settings: SamplerSettings, reading: &AtomicU64, stop: &AtomicBool) {
    let cores = host_parallelism() as f64;
    let alpha = settings.ewma_alpha.clamp(0.0, 1.0);
    let mut previous = process_cpu_time().map(|cpu| (Instant::now(), cpu));
    let mut smoothed: Option<f64> = None;

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(settings.period());
        let Some(cpu) = process_cpu_time() else {
            continue;
        };
        let now = Instant::now();
        if let Some((then, cpu_then)) = previous {
            let wall = now.duration_since(then).as_secs_f64();
            if wall > f64::EPSILON {
                let busy = cpu.saturating_sub(cpu_then).as_secs_f64();
                let raw = (busy / (wall * cores) * 100.0).clamp(0.0, 100.0);
                let next = smoothed.map_or(raw, |prior| alpha.mul_add(raw, (1.0 - alpha) * prior));
                smoothed = Some(next);
                reading.store(next.to_bits(), Ordering::Relaxed);
            }
        }
        previous = Some((now, cpu));
    }
}

/// Cumulative user + system CPU time of this process.
#[cfg(unix)]
fn process_cpu_time() -> Option<Duration> {
    // SAFETY: zeroed rusage is valid, and the return code is checked.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }
        usage
    };
    Some(timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime))
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<Duration> {
    None
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = if tv.tv_sec < 0 { 0 } else { tv.tv_sec as u64 };
    let usec = tv.tv_usec.clamp(0, 999_999) as u64;
    Duration::from_secs(secs) + Duration::from_micros(usec)
}

/// Constant load, for dry runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f64);

impl LoadSource for FixedLoad {
    fn sample(&self) -> f64 {
        self.0.clamp(0.0, 100.0)
    }
}

/// Replays a fixed script of readings, then repeats the last one.
#[derive(Debug)]
pub struct ScriptedLoad {
    readings: Vec<f64>,
    cursor: Mutex<usize>,
}

impl ScriptedLoad {
    pub fn new(readings: Vec<f64>) -> Self {
        Self {
            readings,
            cursor: Mutex::new(0),
        }
    }
}

impl LoadSource for ScriptedLoad {
    fn sample(&self) -> f64 {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(last) = self.readings.len().checked_sub(1) else {
            return 0.0;
        };
        let value = self.readings[(*cursor).min(last)];
        *cursor = cursor.saturating_add(1);
        value
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{LoadSource, ProcessCpuSampler, SamplerSettings, ScriptedLoad};

    #[test]
    fn scripted_load_repeats_last_reading() {
        let load = ScriptedLoad::new(vec![10.0, 90.0]);
        assert_eq!(load.sample(), 10.0);
        assert_eq!(load.sample(), 90.0);
        assert_eq!(load.sample(), 90.0);
        assert_eq!(ScriptedLoad::new(Vec::new()).sample(), 0.0);
    }

    #[test]
    fn busy_process_reports_nonzero_bounded_load() {
        let sampler = ProcessCpuSampler::start(SamplerSettings {
            period_ms: 50,
            ewma_alpha: 1.0,
        });
        let deadline = Instant::now() + Duration::from_millis(500);
        let mut spin = 0u64;
        while Instant::now() < deadline {
            spin = spin.wrapping_add(1);
        }
        std::hint::black_box(spin);
        let load = sampler.sample();
        assert!((0.0..=100.0).contains(&load));
        #[cfg(unix)]
        assert!(load > 0.0, "expected some CPU use, got {load}");
    }
}
