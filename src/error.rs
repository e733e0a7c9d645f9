use thiserror::Error;

use crate::config::{MAX_HZ, MIN_HZ};

pub type Result<T, E = RcuError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RcuError {
    #[error("all {capacity} worker slots are claimed")]
    NoFreeSlot { capacity: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn the progress driver thread")]
    Spawn(#[source] std::io::Error),

    #[error("the progress driver has already stopped")]
    DriverStopped,

    #[error("the global engine has already been initialised")]
    AlreadyInitialized,

    #[error("the global engine has not been initialised")]
    NotInitialized,
}

// Config errors are split out so the tunables can hand them back without dragging the whole engine error along.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tick rate {0} Hz is outside {min}..={max} Hz", min = MIN_HZ, max = MAX_HZ)]
    HzOutOfRange(u32),

    #[error("worker capacity must be at least one")]
    NoWorkers,

    #[error("force-end ceiling must be non-zero")]
    ZeroCeiling,

    #[error("setting token `{0}` is too long")]
    TokenTooLong(String),

    #[error("unknown setting `{0}`")]
    UnknownSetting(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: &'static str, value: String },
}
