// Configuration
//
// Config is the start-up description of an engine: how many worker slots to carve out, how fast the progress
// driver ticks, how long a batch may stay open before it is forced, and which driver runs the ticks.
//
// Once the engine is running only the tick rate can change. That knob lives in Tunables, which the driver re-reads
// on every pass, so a new rate takes effect from the next tick onwards.

use std::time::Duration;

use mem::sync::{AtomicU32, AtomicU64, Ordering};

use crate::error::ConfigError;

pub const MIN_HZ: u32 = 2;
pub const MAX_HZ: u32 = 1000;
pub const DEFAULT_HZ: u32 = 20;

const USEC_PER_SEC: u64 = 1_000_000;

// Slack a sleeping thread gets from a 100 Hz scheduler tick: 1s / (100 * 3 / 2)
pub const DEFAULT_TOLERANCE: Duration = Duration::from_micros(USEC_PER_SEC / 150);
pub const DEFAULT_FORCE_AFTER: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_WORKERS: usize = 64;

// Longest accepted setting token, matching the fixed token buffer of the control file this knob replaces.
const MAX_TOKEN_LEN: usize = 31;

/// Which [`ProgressDriver`](crate::driver::ProgressDriver) paces the ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverMode {
    /// Absolute deadlines, period after period, like a periodic hardware timer.
    #[default]
    Timer,
    /// A background daemon which sleeps one period after every pass.
    Daemon,
}

impl DriverMode {
    pub fn name(self) -> &'static str {
        match self {
            DriverMode::Timer => "timer",
            DriverMode::Daemon => "daemon",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker slots. Fixed for the life of the engine.
    pub max_workers: usize,
    /// Target tick rate.
    pub hz: u32,
    /// How late a tick may fire before the timer driver gives up on catching up and re-synchronises.
    pub tolerance: Duration,
    /// A batch open for longer than this is ended even if some worker still objects.
    pub force_after: Duration,
    pub driver: DriverMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            hz: DEFAULT_HZ,
            tolerance: DEFAULT_TOLERANCE,
            force_after: DEFAULT_FORCE_AFTER,
            driver: DriverMode::default(),
        }
    }
}

impl Config {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_force_after(mut self, force_after: Duration) -> Self {
        self.force_after = force_after;
        self
    }

    pub fn with_driver(mut self, driver: DriverMode) -> Self {
        self.driver = driver;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.force_after.is_zero() {
            return Err(ConfigError::ZeroCeiling);
        }
        check_hz(self.hz)?;
        Ok(())
    }
}

#[inline]
fn check_hz(hz: u32) -> Result<u32, ConfigError> {
    if (MIN_HZ..=MAX_HZ).contains(&hz) {
        Ok(hz)
    } else {
        Err(ConfigError::HzOutOfRange(hz))
    }
}

/// The pacing a driver should follow for its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate {
    pub period: Duration,
    pub tolerance: Duration,
}

impl TickRate {
    pub fn from_hz(hz: u32, tolerance: Duration) -> Self {
        Self {
            period: Duration::from_micros(USEC_PER_SEC / u64::from(hz.max(1))),
            tolerance,
        }
    }
}

/// Runtime knobs. Readable from anywhere, written only through [`Tunables::set_hz`] or [`Tunables::apply`].
#[derive(Debug)]
pub struct Tunables {
    hz: AtomicU32,
    tolerance_us: AtomicU64,
}

impl Tunables {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            hz: AtomicU32::new(config.hz),
            tolerance_us: AtomicU64::new(config.tolerance.as_micros() as u64),
        }
    }

    #[inline]
    pub fn hz(&self) -> u32 {
        self.hz.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tolerance(&self) -> Duration {
        Duration::from_micros(self.tolerance_us.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn rate(&self) -> TickRate {
        TickRate::from_hz(self.hz(), self.tolerance())
    }

    pub fn set_hz(&self, hz: u32) -> Result<(), ConfigError> {
        let hz = check_hz(hz)?;
        let old = self.hz.swap(hz, Ordering::Relaxed);
        if old != hz {
            log::info!("tick rate changed from {old} Hz to {hz} Hz");
        }
        Ok(())
    }

    /// Applies a textual setting. Only the first whitespace-separated token is looked at; blank input is a no-op.
    ///
    /// The one recognised setting is `hz=<n>` with `n` in `2..=1000`.
    pub fn apply(&self, input: &str) -> Result<(), ConfigError> {
        let Some(token) = input.split_whitespace().next() else {
            return Ok(());
        };

        if token.len() > MAX_TOKEN_LEN {
            return Err(ConfigError::TokenTooLong(token.to_string()));
        }

        match token.split_once('=') {
            Some(("hz", value)) => {
                let hz = value.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                    key: "hz",
                    value: value.to_string(),
                })?;
                self.set_hz(hz)
            }
            _ => Err(ConfigError::UnknownSetting(token.to_string())),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.hz, 20);
        assert_eq!(config.force_after, Duration::from_secs(3));
        assert_eq!(config.driver, DriverMode::Timer);
        assert_eq!(TickRate::from_hz(config.hz, config.tolerance).period, Duration::from_millis(50));
    }

    #[test]
    fn rejects_bad_config() {
        assert_eq!(
            Config::default().with_max_workers(0).validate(),
            Err(ConfigError::NoWorkers)
        );
        assert_eq!(
            Config::default().with_hz(1).validate(),
            Err(ConfigError::HzOutOfRange(1))
        );
        assert_eq!(
            Config::default().with_hz(1001).validate(),
            Err(ConfigError::HzOutOfRange(1001))
        );
        assert_eq!(
            Config::default().with_force_after(Duration::ZERO).validate(),
            Err(ConfigError::ZeroCeiling)
        );
    }

    #[test]
    fn set_hz_bounds() {
        let tunables = Tunables::new(&Config::default());

        tunables.set_hz(2).unwrap();
        assert_eq!(tunables.hz(), 2);
        assert_eq!(tunables.rate().period, Duration::from_millis(500));

        tunables.set_hz(1000).unwrap();
        assert_eq!(tunables.rate().period, Duration::from_millis(1));

        assert_eq!(tunables.set_hz(0), Err(ConfigError::HzOutOfRange(0)));
        assert_eq!(tunables.set_hz(5000), Err(ConfigError::HzOutOfRange(5000)));
        // A rejected value leaves the old rate in place
        assert_eq!(tunables.hz(), 1000);
    }

    #[test]
    fn apply_settings() {
        let tunables = Tunables::new(&Config::default());

        tunables.apply("hz=50").unwrap();
        assert_eq!(tunables.hz(), 50);

        // Leading whitespace is skipped and only the first token counts
        tunables.apply("   hz=100 hz=7").unwrap();
        assert_eq!(tunables.hz(), 100);

        // Blank input does nothing
        tunables.apply("").unwrap();
        tunables.apply(" \n\t").unwrap();
        assert_eq!(tunables.hz(), 100);

        assert_eq!(
            tunables.apply("hz=1"),
            Err(ConfigError::HzOutOfRange(1))
        );
        assert_eq!(
            tunables.apply("hz=fast"),
            Err(ConfigError::InvalidValue {
                key: "hz",
                value: "fast".to_string()
            })
        );
        assert_eq!(
            tunables.apply("rate=10"),
            Err(ConfigError::UnknownSetting("rate=10".to_string()))
        );
        assert!(matches!(
            tunables.apply("hz=00000000000000000000000000000050"),
            Err(ConfigError::TokenTooLong(_))
        ));
        assert_eq!(tunables.hz(), 100);
    }
}
