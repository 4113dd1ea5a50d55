use crate::{Error, Timestamp};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// An immutable view of the usage of a [crate::DeterministicThrottle].
///
/// Restoring a snapshot into a throttle of the same capacity (with
/// [crate::DeterministicThrottle::reset_usage_to]) reproduces every future decision of the
/// throttle the snapshot was taken from.
///
/// # Format
///
/// Besides its `serde` form (`{"used": .., "lastDecisionTime": {"epochSeconds": .., "nanos": ..}}`),
/// a snapshot has a fixed-size binary encoding (big-endian):
///
/// ```text
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
/// | 0 | 1 |    ...    | 7 | 8 | 9 |    ...    |16 |17 |18 |19 |20 |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
/// |      Used (u64)       | P |  Epoch Seconds (i64)  |  Nanos (u32)  |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
///
/// P = 1 if a decision was made (otherwise 0, with zeroed seconds and nanos)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    used: u64,
    last_decision_time: Option<Timestamp>,
}

impl UsageSnapshot {
    /// Length of the binary encoding of a snapshot.
    pub const SIZE: usize = 8 + 1 + 8 + 4;

    pub fn new(used: u64, last_decision_time: Option<Timestamp>) -> Self {
        Self {
            used,
            last_decision_time,
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn last_decision_time(&self) -> Option<Timestamp> {
        self.last_decision_time
    }

    /// Encode the snapshot into `buf`.
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.used);
        match self.last_decision_time {
            Some(time) => {
                buf.put_u8(1);
                buf.put_i64(time.epoch_seconds());
                buf.put_u32(time.nanos());
            }
            None => {
                buf.put_u8(0);
                buf.put_i64(0);
                buf.put_u32(0);
            }
        }
    }

    /// Decode a snapshot from `buf`, consuming [UsageSnapshot::SIZE] bytes.
    pub fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::InvalidSnapshot("buffer too short"));
        }
        let used = buf.get_u64();
        let present = buf.get_u8();
        let epoch_seconds = buf.get_i64();
        let nanos = buf.get_u32();
        let last_decision_time = match present {
            0 => {
                if epoch_seconds != 0 || nanos != 0 {
                    return Err(Error::InvalidSnapshot("time set without decision"));
                }
                None
            }
            1 => Some(Timestamp::new(epoch_seconds, nanos)?),
            _ => return Err(Error::InvalidSnapshot("invalid decision flag")),
        };
        Ok(Self {
            used,
            last_decision_time,
        })
    }

    /// Encode the snapshot into a new buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write(&mut buf);
        buf
    }

    /// Decode a snapshot, requiring `buf` to hold exactly one encoded snapshot.
    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        let snapshot = Self::read(&mut buf)?;
        if !buf.is_empty() {
            return Err(Error::InvalidSnapshot("trailing bytes"));
        }
        Ok(snapshot)
    }
}
