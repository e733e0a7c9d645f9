// Process-wide instance
//
// Most callers want one engine for the whole process and don't want to pass worker handles around. The engine lives
// in a OnceLock; every thread registers lazily on first use and keeps its Worker in a thread local, which releases
// the slot when the thread exits.
//
// init() also starts the configured driver. The Ticker is parked in the same static, so it lives (and ticks) for
// the rest of the process.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::driver::Ticker;
use crate::error::{RcuError, Result};
use crate::rcu::{Engine, Worker};

struct Global {
    engine: Arc<Engine>,
    _ticker: Ticker,
}

static GLOBAL: OnceLock<Global> = OnceLock::new();

thread_local! {
    static LOCAL: RefCell<Option<Worker>> = const { RefCell::new(None) };
}

/// Creates the process-wide engine and starts its driver. Fails if it already exists.
pub fn init(config: Config) -> Result<Arc<Engine>> {
    if GLOBAL.get().is_some() {
        return Err(RcuError::AlreadyInitialized);
    }

    let engine = Engine::new(config)?;
    let ticker = engine.start()?;

    // Two threads can race past the check above. The loser's ticker and engine are dropped here, which stops its
    // driver thread again.
    GLOBAL
        .set(Global {
            engine: engine.clone(),
            _ticker: ticker,
        })
        .map_err(|_| RcuError::AlreadyInitialized)?;

    log::debug!("global engine initialised");
    Ok(engine)
}

pub fn get() -> Result<Arc<Engine>> {
    GLOBAL
        .get()
        .map(|global| global.engine.clone())
        .ok_or(RcuError::NotInitialized)
}

// Runs `f` with this thread's worker, registering it first if needed. The worker is taken out of the cell while `f`
// runs so a callback-queueing closure that re-enters here doesn't trip the RefCell.
fn with_worker<R>(f: impl FnOnce(&Worker) -> R) -> Result<R> {
    let taken = LOCAL.with(|local| local.borrow_mut().take());
    let worker = match taken {
        Some(worker) => worker,
        None => {
            let global = GLOBAL.get().ok_or(RcuError::NotInitialized)?;
            global.engine.register()?
        }
    };

    let out = f(&worker);

    LOCAL.with(|local| {
        // A nested call may have registered a second handle in the meantime; keep ours, the other one drops here
        *local.borrow_mut() = Some(worker);
    });
    Ok(out)
}

/// Queues `f` on the calling thread's worker.
pub fn call_rcu<F>(f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    with_worker(|worker| worker.submit(f))
}

pub fn synchronize() -> Result<()> {
    with_worker(Worker::synchronize)
}

pub fn barrier() -> Result<()> {
    with_worker(Worker::barrier)
}

/// Announces a quiescent point for the calling thread.
pub fn quiescent() -> Result<()> {
    with_worker(Worker::quiesce)
}

/// Gives the calling thread's slot back. Anything it queued still runs. The next call registers again.
pub fn release_thread() {
    let worker = LOCAL.with(|local| local.borrow_mut().take());
    drop(worker);
}
