//! The acquisition engine: one background tokio task per running device.
//!
//! The worker snapshots the primary program at each cycle boundary, walks its
//! rows point by point, drives the swept output variable, samples the gas
//! mixture, and pushes tagged samples into the program's queues. It never
//! talks to the foreground directly; all coordination goes through atomic
//! flags and the shared queues.
//!
//! Cancellation is cooperative at two granularities: an abort request is
//! honored before every point, a graceful stop only between cycles. The
//! worker body is wrapped in a panic catch so the cached output variables are
//! restored and the device returns to idle no matter how acquisition ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use rand_distr::Normal;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::device::{AcqParams, ScanState, SharedState};
use crate::scan::{lock, Detector, Sample, ScanInput, ScanPlan, ScanRegistry, REPORT_TIME};

/// Reference dwell for noise scaling: the configured noise amplitude applies
/// at this dwell, and longer integration shrinks it proportionally.
pub const NOISE_DWELL_REF_MS: u64 = 100;

/// Chained-scan recursion limit.
const MAX_CHAIN_DEPTH: usize = 8;

/// How often a paused worker re-checks its flags.
const PAUSE_POLL: Duration = Duration::from_millis(5);

/// Stop flags shared between the device façade and the worker task.
#[derive(Debug, Default)]
struct EngineControl {
    abort: AtomicBool,
    graceful: AtomicBool,
}

/// Foreground handle to a spawned worker.
#[derive(Debug)]
pub struct EngineHandle {
    pub(crate) task: JoinHandle<()>,
    control: Arc<EngineControl>,
}

impl EngineHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the worker to stop at the next cycle boundary.
    pub fn request_graceful(&self) {
        self.control.graceful.store(true, Ordering::SeqCst);
    }

    /// Ask the worker to stop before the next point.
    pub fn request_abort(&self) {
        self.control.abort.store(true, Ordering::SeqCst);
    }
}

/// How a single pass over a plan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Completed,
    Aborted,
    Tripped(u8),
}

/// Spawn the worker for `primary` and hand back its control handle.
pub fn spawn(
    shared: Arc<SharedState>,
    registry: Arc<Mutex<ScanRegistry>>,
    primary: String,
) -> EngineHandle {
    let control = Arc::new(EngineControl::default());
    let worker = Worker {
        shared,
        registry,
        control: Arc::clone(&control),
    };
    let task = tokio::spawn(async move { worker.run(primary).await });
    EngineHandle { task, control }
}

struct Worker {
    shared: Arc<SharedState>,
    registry: Arc<Mutex<ScanRegistry>>,
    control: Arc<EngineControl>,
}

impl Worker {
    async fn run(self, primary: String) {
        info!(scan = %primary, "acquisition started");
        // The sweep clobbers the foreground's output variables; put them back
        // exactly as found, whatever happens in between.
        let cached = self.shared.beam_snapshot();

        let result = std::panic::AssertUnwindSafe(self.acquire(&primary))
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(scan = %primary, "acquisition worker panicked; recovering");
        }

        self.shared.restore_beam(cached);
        self.shared.set_scan_state(ScanState::Idle);
        info!(scan = %primary, "acquisition finished");
    }

    async fn acquire(&self, primary: &str) {
        let params = self.shared.params_snapshot();
        let started = Instant::now();
        let mut cycle = 0u32;

        'cycles: loop {
            if self.control.abort.load(Ordering::SeqCst) {
                break;
            }
            while self.shared.is_paused() {
                if self.control.abort.load(Ordering::SeqCst)
                    || self.control.graceful.load(Ordering::SeqCst)
                {
                    break 'cycles;
                }
                self.shared.set_scan_state(ScanState::Paused);
                sleep(PAUSE_POLL).await;
            }
            self.shared.set_scan_state(ScanState::Running);

            let Some(plan) = lock(&self.registry).plan(primary) else {
                error!(scan = %primary, "primary scan vanished from the registry");
                break;
            };

            let mut stack = Vec::new();
            match self.run_plan(&plan, &params, started, &mut stack).await {
                ScanOutcome::Completed => {}
                ScanOutcome::Aborted => break,
                ScanOutcome::Tripped(code) => {
                    info!(scan = %primary, code, "acquisition ended by trip");
                    break;
                }
            }

            cycle += 1;
            if params.cycles != 0 && cycle >= params.cycles {
                break;
            }
            // A graceful stop lets the cycle in flight finish; it is only
            // honored here, at the boundary.
            if self.control.graceful.load(Ordering::SeqCst) {
                debug!(scan = %primary, cycle, "graceful stop honored at cycle boundary");
                break;
            }
            if params.interval_ms > 0 {
                sleep(Duration::from_millis(params.interval_ms)).await;
            }
        }
    }

    /// One full pass over a plan's rows. Boxed because chained inputs recurse.
    fn run_plan<'a>(
        &'a self,
        plan: &'a ScanPlan,
        params: &'a AcqParams,
        started: Instant,
        stack: &'a mut Vec<String>,
    ) -> BoxFuture<'a, ScanOutcome> {
        Box::pin(async move {
            for row in &plan.rows {
                if plan.report_mask & REPORT_TIME != 0 {
                    plan.queues.push_time(started.elapsed().as_millis() as u64);
                }
                for i in 0..row.point_count() {
                    if self.control.abort.load(Ordering::SeqCst) {
                        return ScanOutcome::Aborted;
                    }

                    // A chained input runs the referenced program in full as
                    // a side effect of this point. The point still emits its
                    // own sample below.
                    if let ScanInput::Chained(name) = &plan.input {
                        if *name == plan.name
                            || stack.iter().any(|n| n == name)
                            || stack.len() >= MAX_CHAIN_DEPTH
                        {
                            error!(
                                scan = %plan.name,
                                chained = %name,
                                "chained scan would recurse; skipping"
                            );
                        } else {
                            // Take the snapshot in its own statement so the
                            // registry guard is gone before the await below.
                            let sub = lock(&self.registry).plan(name);
                            if let Some(sub) = sub {
                                stack.push(plan.name.clone());
                                let outcome = self.run_plan(&sub, params, started, stack).await;
                                stack.pop();
                                if outcome != ScanOutcome::Completed {
                                    return outcome;
                                }
                            } else {
                                error!(chained = %name, "chained scan does not exist; skipping");
                            }
                        }
                    }

                    let point = row.point(i);
                    sleep(Duration::from_millis(params.settle_ms() + params.dwell_ms())).await;
                    self.shared.drive_output(plan.output, point);

                    if let Some(code) = self.shared.first_trip() {
                        plan.queues.push_sample(Sample::Trip { point, code });
                        self.shared.set_scan_state(ScanState::Aborting);
                        return ScanOutcome::Tripped(code);
                    }
                    let value = match plan.input {
                        ScanInput::Detector(detector) => {
                            let beam = self.shared.beam_snapshot();
                            self.shared.signal(beam.mass, beam.energy)
                                + noise_term(params.noise, params.dwell_ms(), detector)
                        }
                        // Nothing to read on a chained channel.
                        ScanInput::Chained(_) => 0.0,
                    };
                    plan.queues.push_sample(Sample::Reading { point, value });
                    plan.queues.push_point(point);
                }
            }
            ScanOutcome::Completed
        })
    }
}

/// Detector noise for one reading.
///
/// Skewed low: the distribution is centred at `-magnitude` with a matching
/// spread, so readings hover just under the clean signal the way a real
/// electrometer baseline does. Longer dwell integrates noise away; the SEM
/// detector halves it again.
fn noise_term(noise: f64, dwell_ms: u64, detector: Detector) -> f64 {
    if noise == 0.0 {
        return 0.0;
    }
    let mut magnitude = noise * NOISE_DWELL_REF_MS as f64 / dwell_ms.max(1) as f64;
    if detector == Detector::Sem {
        magnitude /= 2.0;
    }
    // thread_rng is created and dropped here, between await points; it must
    // not be held across one.
    match Normal::new(-magnitude, magnitude) {
        Ok(distribution) => rand::thread_rng().sample(distribution),
        Err(_) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_zero_amplitude_is_exactly_zero() {
        assert_eq!(noise_term(0.0, 100, Detector::Faraday), 0.0);
    }

    #[test]
    fn noise_scales_down_with_dwell() {
        // With mean -m and std m, samples land within [-5m, 3m] essentially
        // always; bound the magnitude rather than the exact draw.
        for _ in 0..50 {
            let short = noise_term(1e-9, 10, Detector::Faraday);
            assert!(short.abs() < 1e-9 * 10.0 * 6.0);
            let long = noise_term(1e-9, 1000, Detector::Faraday);
            assert!(long.abs() < 1e-9 * 0.1 * 6.0);
        }
    }

    #[test]
    fn zero_dwell_clamps_to_one_millisecond() {
        for _ in 0..50 {
            let sample = noise_term(1e-9, 0, Detector::Faraday);
            assert!(sample.abs() < 1e-9 * 100.0 * 6.0);
        }
    }
}
