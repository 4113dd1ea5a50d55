use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/// Number of nanoseconds in a second.
pub(crate) const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// An instant on the UTC timeline, measured from the Unix epoch.
///
/// `nanos` is always normalized to `0..1_000_000_000`, so the derived ordering of
/// `(epoch_seconds, nanos)` is the ordering of the timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawTimestamp")]
pub struct Timestamp {
    epoch_seconds: i64,
    nanos: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTimestamp {
    epoch_seconds: i64,
    nanos: i64,
}

impl TryFrom<RawTimestamp> for Timestamp {
    type Error = Error;

    fn try_from(raw: RawTimestamp) -> Result<Self, Self::Error> {
        let nanos = u32::try_from(raw.nanos)
            .map_err(|_| Error::InvalidTimestamp(raw.epoch_seconds, raw.nanos))?;
        Self::new(raw.epoch_seconds, nanos)
    }
}

impl Timestamp {
    /// Create a new [Timestamp], rejecting a nanosecond adjustment of one second or more.
    pub fn new(epoch_seconds: i64, nanos: u32) -> Result<Self, Error> {
        if nanos >= NANOS_PER_SECOND {
            return Err(Error::InvalidTimestamp(epoch_seconds, nanos.into()));
        }
        Ok(Self {
            epoch_seconds,
            nanos,
        })
    }

    /// Create a [Timestamp] at a whole second.
    pub const fn from_epoch_seconds(epoch_seconds: i64) -> Self {
        Self {
            epoch_seconds,
            nanos: 0,
        }
    }

    /// Read the current time from the system clock.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn epoch_seconds(&self) -> i64 {
        self.epoch_seconds
    }

    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Returns the exact (signed) number of nanoseconds from `earlier` to `self`.
    pub fn nanos_since(&self, earlier: &Timestamp) -> i128 {
        let seconds = self.epoch_seconds as i128 - earlier.epoch_seconds as i128;
        seconds * NANOS_PER_SECOND as i128 + (self.nanos as i128 - earlier.nanos as i128)
    }

    /// Returns the [Timestamp] `nanos` after `self`.
    ///
    /// # Panics
    ///
    /// Panics if the result does not fit in the range of a [Timestamp].
    pub fn plus_nanos(&self, nanos: u64) -> Self {
        self.offset(nanos as i128)
    }

    /// Returns the [Timestamp] `nanos` before `self`.
    ///
    /// # Panics
    ///
    /// Panics if the result does not fit in the range of a [Timestamp].
    pub fn minus_nanos(&self, nanos: u64) -> Self {
        self.offset(-(nanos as i128))
    }

    fn offset(&self, delta: i128) -> Self {
        let total = self.epoch_seconds as i128 * NANOS_PER_SECOND as i128
            + self.nanos as i128
            + delta;
        let epoch_seconds = total.div_euclid(NANOS_PER_SECOND as i128);
        let nanos = total.rem_euclid(NANOS_PER_SECOND as i128);
        Self {
            epoch_seconds: i64::try_from(epoch_seconds).expect("timestamp overflow"),
            nanos: nanos as u32,
        }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Self {
                epoch_seconds: since.as_secs() as i64,
                nanos: since.subsec_nanos(),
            },
            Err(err) => {
                // Before the epoch
                let before = err.duration();
                let nanos = u64::try_from(before.as_nanos()).unwrap_or(u64::MAX);
                Self::from_epoch_seconds(0).minus_nanos(nanos)
            }
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.epoch_seconds, self.nanos)
    }
}
