use std::fmt::{Display, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub mod channels;
pub mod config;
pub mod fixtures;
pub mod kernel;
pub mod links;
pub mod positions;
pub mod reconcile;

pub use channels::{
    format_channels, parse_channels, parse_channels_with_diagnostics, ParsedChannels,
    RejectedToken,
};
pub use config::{KernelConfig, ReconcileOptions};
pub use fixtures::{FixtureRecord, FixtureRepository, ParsedRow, Population, UploadResult};
pub use kernel::{FixtureKernel, SharedKernel};
pub use links::{FixtureAggregate, LinkIndex, WorkNoteFixtureLink};
pub use positions::{
    fingerprint, InMemoryPositionOrderStore, PositionOrder, PositionOrderService,
    PositionOrderStore, UpdateKind, UpdateResult,
};
pub use reconcile::{
    ReconcileCounts, ReconcileEngine, RowError, SourceRow, Stamp, TrackedRecord,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical 26-character ULID form.
            ///
            /// # Errors
            /// Returns [`KernelError::Validation`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, KernelError> {
                Ulid::from_string(raw)
                    .map(Self)
                    .map_err(|err| KernelError::Validation(format!("invalid ULID {raw}: {err}")))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(ProductionId);
ulid_id!(FixtureId);
ulid_id!(WorkNoteId);

/// Source of "now" for every timestamp the kernel stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to. Useful for deterministic callers and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Encode/decode timestamps for a persistence collaborator.
pub trait TimestampCodec {
    /// # Errors
    /// Returns [`KernelError::Timestamp`] when the value cannot be represented.
    fn encode(&self, value: OffsetDateTime) -> Result<String, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Timestamp`] when `raw` is not a valid encoded timestamp.
    fn decode(&self, raw: &str) -> Result<OffsetDateTime, KernelError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc3339Codec;

impl TimestampCodec for Rfc3339Codec {
    fn encode(&self, value: OffsetDateTime) -> Result<String, KernelError> {
        value
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|err| KernelError::Timestamp(format!("failed to format RFC3339: {err}")))
    }

    fn decode(&self, raw: &str) -> Result<OffsetDateTime, KernelError> {
        OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
            .map_err(|err| KernelError::Timestamp(format!("invalid RFC3339 timestamp {raw}: {err}")))
    }
}
