//! CPU quota watchdog
//!
//! A guest stuck in a tight loop cannot be interrupted by microtasks; the
//! only correctness primitive is disposing the whole program. The watchdog
//! thread samples accumulated guest busy time every `checkout_ms` and
//! disposes the program when the delta between two samples exceeds
//! `max_busy_ns`. It holds only a weak reference, so normal disposal never
//! waits on the watchdog.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use roomscript_protocol::QuotaConfig;

use crate::program::ProgramInner;

/// Monotonic meter of time spent executing guest code.
///
/// The isolate thread brackets every guest execution section with
/// [`ExecMeter::enter`]; a section still running contributes its in-flight
/// span to [`ExecMeter::sample`], so a guest that never yields is still
/// observable. Host-side waits inside a section (source fetches) are
/// excluded with [`ExecMeter::pause`].
pub(crate) struct ExecMeter {
    started: Instant,
    busy_ns: AtomicU64,
    /// Nanoseconds since `started` when the current outermost section began;
    /// zero when idle.
    busy_since_ns: AtomicU64,
    depth: AtomicUsize,
}

impl ExecMeter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            busy_ns: AtomicU64::new(0),
            busy_since_ns: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    /// Begin a guest execution section. Sections nest.
    pub fn enter(&self) -> MeterGuard<'_> {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.busy_since_ns.store(self.now_ns().max(1), Ordering::SeqCst);
        }
        MeterGuard { meter: self }
    }

    /// Exclude a host-side wait from the running section.
    pub fn pause(&self) -> PauseGuard<'_> {
        let was_busy = self.depth.load(Ordering::SeqCst) > 0;
        if was_busy {
            let since = self.busy_since_ns.swap(0, Ordering::SeqCst);
            if since > 0 {
                self.busy_ns
                    .fetch_add(self.now_ns().saturating_sub(since), Ordering::SeqCst);
            }
        }
        PauseGuard {
            meter: self,
            resume: was_busy,
        }
    }

    /// Total guest busy time, including the in-flight section.
    pub fn sample(&self) -> u64 {
        let mut total = self.busy_ns.load(Ordering::SeqCst);
        let since = self.busy_since_ns.load(Ordering::SeqCst);
        if self.depth.load(Ordering::SeqCst) > 0 && since > 0 {
            total += self.now_ns().saturating_sub(since);
        }
        total
    }
}

pub(crate) struct MeterGuard<'a> {
    meter: &'a ExecMeter,
}

impl Drop for MeterGuard<'_> {
    fn drop(&mut self) {
        if self.meter.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            let since = self.meter.busy_since_ns.swap(0, Ordering::SeqCst);
            if since > 0 {
                self.meter
                    .busy_ns
                    .fetch_add(self.meter.now_ns().saturating_sub(since), Ordering::SeqCst);
            }
        }
    }
}

pub(crate) struct PauseGuard<'a> {
    meter: &'a ExecMeter,
    resume: bool,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if self.resume {
            self.meter
                .busy_since_ns
                .store(self.meter.now_ns().max(1), Ordering::SeqCst);
        }
    }
}

/// Start the watchdog thread for a program.
pub(crate) fn spawn(program: Weak<ProgramInner>, quota: QuotaConfig) {
    std::thread::Builder::new()
        .name("roomscript-watchdog".to_string())
        .spawn(move || run(program, quota))
        .ok();
}

fn run(program: Weak<ProgramInner>, quota: QuotaConfig) {
    let interval = Duration::from_millis(quota.checkout_ms.max(1));
    let mut previous = 0u64;
    loop {
        std::thread::sleep(interval);
        let Some(inner) = program.upgrade() else {
            return;
        };
        if inner.shared.is_disposed() {
            return;
        }
        let sampled = inner.shared.meter.sample();
        let delta = sampled.saturating_sub(previous);
        previous = sampled;
        if delta > quota.max_busy_ns {
            tracing::warn!(
                target: "roomscript::watchdog",
                busy_ns = delta,
                limit_ns = quota.max_busy_ns,
                "guest exceeded CPU quota; disposing program"
            );
            inner.dispose();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_counts_closed_sections() {
        let meter = ExecMeter::new();
        {
            let _g = meter.enter();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(meter.sample() >= 5_000_000);
    }

    #[test]
    fn meter_sees_inflight_section() {
        let meter = ExecMeter::new();
        let _g = meter.enter();
        std::thread::sleep(Duration::from_millis(10));
        // Section has not closed, the time must still be visible.
        assert!(meter.sample() >= 5_000_000);
    }

    #[test]
    fn pause_excludes_host_waits() {
        let meter = ExecMeter::new();
        let _g = meter.enter();
        {
            let _p = meter.pause();
            std::thread::sleep(Duration::from_millis(50));
        }
        let sampled = meter.sample();
        assert!(sampled < 40_000_000, "paused time leaked into sample: {sampled}");
    }

    #[test]
    fn idle_meter_stays_flat() {
        let meter = ExecMeter::new();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(meter.sample(), 0);
    }
}
