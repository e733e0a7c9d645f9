// Progress drivers
//
// The engine never makes progress on its own; something has to call tick() at a steady rate. A ProgressDriver
// decides *when* the next tick is due, and the Ticker owns the single background thread which waits that long and
// then ticks. One thread means ticks can never overlap, whichever driver is active.
//
// Two pacing strategies:
//
// - TimerDriver: absolute deadlines, one period apart, like a periodic hardware timer. If the thread falls behind by
//   more than the tolerance window it stops trying to catch up and restarts the schedule from now.
// - DaemonDriver: sleep one period after every pass. Simpler, and drifts by however long each tick took.
//
// The driver can be switched at run time. The thread keeps running; only the pacing changes.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{DriverMode, TickRate};
use crate::error::{RcuError, Result};
use crate::rcu::{Engine, TickOutcome};

const THREAD_NAME: &str = "rcud";

pub trait ProgressDriver: Send {
    fn mode(&self) -> DriverMode;

    /// How long to wait, from `now`, before the next tick.
    fn next_wait(&mut self, rate: TickRate, now: Instant) -> Duration;
}

impl DriverMode {
    pub fn into_driver(self) -> Box<dyn ProgressDriver> {
        match self {
            DriverMode::Timer => Box::new(TimerDriver::new()),
            DriverMode::Daemon => Box::new(DaemonDriver),
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerDriver {
    deadline: Option<Instant>,
}

impl TimerDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressDriver for TimerDriver {
    fn mode(&self) -> DriverMode {
        DriverMode::Timer
    }

    fn next_wait(&mut self, rate: TickRate, now: Instant) -> Duration {
        let next = match self.deadline {
            None => now + rate.period,
            Some(previous) => {
                let next = previous + rate.period;
                if now > next + rate.tolerance {
                    // Overran: forward the timer from now instead of firing a burst of late ticks
                    log::trace!(
                        "timer overran by {:?}, re-synchronising",
                        now.saturating_duration_since(next)
                    );
                    now + rate.period
                } else {
                    next
                }
            }
        };
        self.deadline = Some(next);
        next.saturating_duration_since(now)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DaemonDriver;

impl ProgressDriver for DaemonDriver {
    fn mode(&self) -> DriverMode {
        DriverMode::Daemon
    }

    // The lower bound of the sleep range. The OS is free to wake us up to `tolerance` later.
    fn next_wait(&mut self, rate: TickRate, _now: Instant) -> Duration {
        rate.period
    }
}

enum Control {
    Switch(DriverMode),
    Stop,
}

/// Owns the thread which drives an engine. Dropping the ticker stops the thread.
#[derive(Debug)]
pub struct Ticker {
    engine: Arc<Engine>,
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Starts ticking `engine` with the given driver, then activates it. If the thread can't be spawned the engine is
    /// left as it was.
    pub fn spawn(engine: Arc<Engine>, mode: DriverMode) -> Result<Self> {
        Self::spawn_with(engine, mode, |body| {
            thread::Builder::new().name(THREAD_NAME.to_string()).spawn(body)
        })
    }

    fn spawn_with<S>(engine: Arc<Engine>, mode: DriverMode, spawn: S) -> Result<Self>
    where
        S: FnOnce(Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>,
    {
        let (control, rx) = mpsc::channel();

        engine.set_driver(Some(mode));

        let thread_engine = engine.clone();
        let handle = spawn(Box::new(move || run(thread_engine, mode.into_driver(), rx))).map_err(|err| {
            engine.set_driver(None);
            RcuError::Spawn(err)
        })?;

        // Only once something is ticking: an active engine with no driver would block every synchronize() for good
        engine.activate();

        Ok(Self {
            engine,
            control,
            handle: Some(handle),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn mode(&self) -> Option<DriverMode> {
        self.engine.driver()
    }

    /// Changes the pacing strategy from the next tick onwards.
    pub fn switch_mode(&self, mode: DriverMode) -> Result<()> {
        self.control
            .send(Control::Switch(mode))
            .map_err(|_| RcuError::DriverStopped)
    }

    /// Stops the driver thread and waits for it to exit. The engine stays active, but nothing ticks it any more.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // The thread may already be gone if a callback panicked; that is reported by join below
        let _ = self.control.send(Control::Stop);
        if handle.join().is_err() {
            log::error!("driver thread panicked, most likely inside a callback");
            self.engine.set_driver(None);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Engine {
    /// Starts the driver this engine was configured with.
    pub fn start(self: &Arc<Self>) -> Result<Ticker> {
        Ticker::spawn(self.clone(), self.start_mode())
    }
}

fn run(engine: Arc<Engine>, mut driver: Box<dyn ProgressDriver>, control: mpsc::Receiver<Control>) {
    log::info!(
        "{} driver started, will operate at ~{} Hz",
        driver.mode().name(),
        engine.tunables().hz()
    );

    loop {
        let wait = driver.next_wait(engine.tunables().rate(), Instant::now());

        match control.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                if engine.tick() == TickOutcome::Busy {
                    // Someone is calling tick() by hand alongside us. Harmless, but worth knowing about.
                    log::debug!("tick skipped, another orchestrator is running");
                }
            }
            Ok(Control::Switch(mode)) => {
                if mode != driver.mode() {
                    log::info!(
                        "switching from {} driver to {} driver",
                        driver.mode().name(),
                        mode.name()
                    );
                    driver = mode.into_driver();
                    engine.set_driver(Some(mode));
                }
            }
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    engine.set_driver(None);
    log::info!("{} driver exiting", driver.mode().name());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_ms(period: u64, tolerance: u64) -> TickRate {
        TickRate {
            period: Duration::from_millis(period),
            tolerance: Duration::from_millis(tolerance),
        }
    }

    #[test]
    fn timer_keeps_absolute_schedule() {
        let mut timer = TimerDriver::new();
        let rate = rate_ms(50, 5);
        let t0 = Instant::now();

        assert_eq!(timer.next_wait(rate, t0), Duration::from_millis(50));

        // Woke 3ms late: the next deadline is still t0 + 100ms
        let woke = t0 + Duration::from_millis(53);
        assert_eq!(timer.next_wait(rate, woke), Duration::from_millis(47));
    }

    #[test]
    fn timer_resyncs_after_overrun() {
        let mut timer = TimerDriver::new();
        let rate = rate_ms(50, 5);
        let t0 = Instant::now();
        timer.next_wait(rate, t0);

        // Way past the next deadline (t0 + 100ms) plus tolerance: start over from now
        let woke = t0 + Duration::from_millis(180);
        assert_eq!(timer.next_wait(rate, woke), Duration::from_millis(50));

        // Within tolerance of a missed deadline: fire straight away rather than skipping it
        let woke = t0 + Duration::from_millis(180 + 50 + 52);
        assert_eq!(timer.next_wait(rate, woke), Duration::ZERO);
    }

    #[test]
    fn daemon_sleeps_one_period() {
        let mut daemon = DaemonDriver;
        let rate = rate_ms(50, 5);
        assert_eq!(daemon.next_wait(rate, Instant::now()), Duration::from_millis(50));
        assert_eq!(daemon.mode(), DriverMode::Daemon);
    }

    #[test]
    fn failed_spawn_leaves_engine_inactive() {
        let engine = Engine::new(crate::config::Config::default()).unwrap();

        let result = Ticker::spawn_with(engine.clone(), DriverMode::Timer, |_body| {
            Err(io::Error::other("out of threads"))
        });

        assert!(matches!(result, Err(RcuError::Spawn(_))));
        assert!(!engine.is_active());
        assert_eq!(engine.driver(), None);

        // synchronize() still returns straight away rather than waiting on a driver that never started
        let worker = engine.register().unwrap();
        worker.synchronize();
        assert_eq!(engine.stats().barriers, 0);
    }

    #[test]
    fn mode_builds_matching_driver() {
        assert_eq!(DriverMode::Timer.into_driver().mode(), DriverMode::Timer);
        assert_eq!(DriverMode::Daemon.into_driver().mode(), DriverMode::Daemon);
    }
}
