//  Copyright 2025 JCacheX Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default wall-clock tick.
pub(crate) const DEFAULT_TICK: Duration = Duration::from_millis(1);

/// Ticks between periodic stats publication.
const PUBLISH_EVERY: u64 = 1024;

/// Consecutive failures after which a task is disabled for good.
const MAX_FAILURES: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MaintenanceTask {
    Drain,
    AgeSketch,
    Sweep,
    Evict,
    PublishStats,
    Stop,
}

impl MaintenanceTask {
    fn slot(self) -> usize {
        match self {
            Self::Drain => 0,
            Self::AgeSketch => 1,
            Self::Sweep => 2,
            Self::Evict => 3,
            Self::PublishStats => 4,
            Self::Stop => unreachable!("stop is not a runnable task"),
        }
    }
}

/// Work surface the maintenance thread drives. Implemented by the cache
/// core; kept as a trait so the loop is testable in isolation.
pub(crate) trait MaintenanceTarget: Send + Sync + 'static {
    fn drain(&self);
    fn age_sketch(&self);
    fn sweep(&self);
    fn evict(&self);
    fn publish_stats(&self);
    /// A task failed past the retry cap; the cache runs degraded.
    fn on_task_disabled(&self);
}

#[derive(Default, Clone, Copy)]
struct TaskState {
    failures: u32,
    resume_tick: u64,
    disabled: bool,
}

/// Handle to the maintenance thread. Stop is idempotent; the thread joins
/// on drop.
pub(crate) struct SchedulerHandle {
    tx: flume::Sender<MaintenanceTask>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Best-effort threshold signal; a full queue means a tick is already
    /// pending, so losing the nudge costs nothing.
    pub fn nudge(&self, task: MaintenanceTask) {
        let _ = self.tx.try_send(task);
    }

    pub fn request_stop(&self) {
        let _ = self.tx.send(MaintenanceTask::Stop);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Single cooperative maintenance thread.
///
/// Runs the drain/sweep/evict cycle on every wall-clock tick and on demand
/// when a threshold signal arrives. Every task runs under panic isolation:
/// a failing task backs off exponentially and is disabled entirely after
/// [`MAX_FAILURES`] consecutive failures, leaving the rest of the cycle
/// running.
pub(crate) fn spawn<T: MaintenanceTarget>(
    target: Arc<T>,
    tick: Duration,
    tx: flume::Sender<MaintenanceTask>,
    rx: flume::Receiver<MaintenanceTask>,
) -> SchedulerHandle {
    let handle = std::thread::Builder::new()
        .name("jcachex-maintenance".to_string())
        .spawn(move || run_loop(target, tick, rx))
        .expect("spawn maintenance thread");
    SchedulerHandle {
        tx,
        handle: Some(handle),
    }
}

fn run_loop<T: MaintenanceTarget>(
    target: Arc<T>,
    tick: Duration,
    rx: flume::Receiver<MaintenanceTask>,
) {
    let mut states = [TaskState::default(); 5];
    let mut tick_no: u64 = 0;

    loop {
        match rx.recv_timeout(tick) {
            Ok(MaintenanceTask::Stop) | Err(flume::RecvTimeoutError::Disconnected) => break,
            Ok(task) => {
                // Nudges advance the logical clock too, so backoff windows
                // expire under demand-driven traffic.
                tick_no += 1;
                run_task(&target, task, &mut states, tick_no);
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                tick_no += 1;
                run_task(&target, MaintenanceTask::Drain, &mut states, tick_no);
                run_task(&target, MaintenanceTask::Sweep, &mut states, tick_no);
                run_task(&target, MaintenanceTask::Evict, &mut states, tick_no);
                if tick_no % 64 == 0 {
                    run_task(&target, MaintenanceTask::AgeSketch, &mut states, tick_no);
                }
                if tick_no % PUBLISH_EVERY == 0 {
                    run_task(&target, MaintenanceTask::PublishStats, &mut states, tick_no);
                }
            }
        }
    }

    // Final drain so buffered records are not lost on an orderly shutdown.
    run_task(&target, MaintenanceTask::Drain, &mut states, tick_no + 1);
}

fn run_task<T: MaintenanceTarget>(
    target: &Arc<T>,
    task: MaintenanceTask,
    states: &mut [TaskState; 5],
    tick_no: u64,
) {
    let state = &mut states[task.slot()];
    if state.disabled || tick_no < state.resume_tick {
        return;
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| match task {
        MaintenanceTask::Drain => target.drain(),
        MaintenanceTask::AgeSketch => target.age_sketch(),
        MaintenanceTask::Sweep => target.sweep(),
        MaintenanceTask::Evict => target.evict(),
        MaintenanceTask::PublishStats => target.publish_stats(),
        MaintenanceTask::Stop => {}
    }));

    match outcome {
        Ok(()) => {
            state.failures = 0;
        }
        Err(_) => {
            state.failures += 1;
            if state.failures >= MAX_FAILURES {
                state.disabled = true;
                target.on_task_disabled();
                tracing::error!(?task, "maintenance task disabled after repeated failures");
            } else {
                state.resume_tick = tick_no + (1 << state.failures);
                tracing::warn!(
                    ?task,
                    failures = state.failures,
                    "maintenance task failed, backing off"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;

    #[derive(Default)]
    struct Probe {
        drains: AtomicUsize,
        sweeps: AtomicUsize,
        panics: AtomicBool,
        disabled: AtomicBool,
    }

    impl MaintenanceTarget for Probe {
        fn drain(&self) {
            self.drains.fetch_add(1, Ordering::Relaxed);
            if self.panics.load(Ordering::Relaxed) {
                panic!("task bug");
            }
        }
        fn age_sketch(&self) {}
        fn sweep(&self) {
            self.sweeps.fetch_add(1, Ordering::Relaxed);
        }
        fn evict(&self) {}
        fn publish_stats(&self) {}
        fn on_task_disabled(&self) {
            self.disabled.store(true, Ordering::Relaxed);
        }
    }

    fn spawn_probe(probe: Arc<Probe>, tick: Duration) -> SchedulerHandle {
        let (tx, rx) = flume::bounded(64);
        spawn(probe, tick, tx, rx)
    }

    #[test]
    fn test_tick_runs_cycle() {
        let probe = Arc::new(Probe::default());
        let handle = spawn_probe(probe.clone(), Duration::from_millis(1));

        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.drains.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(handle);

        assert!(probe.drains.load(Ordering::Relaxed) >= 3);
        assert!(probe.sweeps.load(Ordering::Relaxed) >= 3);
        assert!(!probe.disabled.load(Ordering::Relaxed));
    }

    #[test]
    fn test_nudge_runs_task() {
        let probe = Arc::new(Probe::default());
        // A very long tick; only nudges drive the loop.
        let handle = spawn_probe(probe.clone(), Duration::from_secs(30));

        handle.nudge(MaintenanceTask::Sweep);
        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.sweeps.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(probe.sweeps.load(Ordering::Relaxed) >= 1);
        handle.request_stop();
    }

    #[test_log::test]
    fn test_repeated_failures_disable_task() {
        let probe = Arc::new(Probe::default());
        probe.panics.store(true, Ordering::Relaxed);
        let handle = spawn_probe(probe.clone(), Duration::from_secs(30));

        // Nudged tasks bypass the tick, so failures accumulate quickly.
        for _ in 0..super::MAX_FAILURES + 2 {
            handle.nudge(MaintenanceTask::Drain);
            std::thread::sleep(Duration::from_millis(10));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while !probe.disabled.load(Ordering::Relaxed) && Instant::now() < deadline {
            handle.nudge(MaintenanceTask::Drain);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(probe.disabled.load(Ordering::Relaxed));

        // Sweeping still works after the drain task was disabled.
        handle.nudge(MaintenanceTask::Sweep);
        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.sweeps.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(probe.sweeps.load(Ordering::Relaxed) >= 1);
    }
}
