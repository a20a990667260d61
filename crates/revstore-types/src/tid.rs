use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

/// 100-nanosecond ticks between the Gregorian epoch (1582-10-15) and the
/// UNIX epoch.
const GREGORIAN_OFFSET: u64 = 0x01B2_1DD2_1381_4000;

/// Length of the canonical hyphenated form.
pub const TID_LEN: usize = 36;

/// Highest tick count handed out by [`Tid::issue`] in this process.
static LAST_TICKS: AtomicU64 = AtomicU64::new(0);

/// Time-ordered render identifier.
///
/// A `Tid` is a version-1 UUID: 60 bits of 100 ns ticks since the Gregorian
/// epoch, followed by a random clock sequence and node. Ordering follows the
/// embedded timestamp, with the raw bytes as tie-breaker, so sorting tids
/// sorts renders by creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tid(Uuid);

impl Tid {
    /// Issue a fresh render id for the current wall-clock time.
    pub fn now() -> Self {
        Self::issue(Utc::now())
    }

    /// Issue a fresh render id for `instant`.
    ///
    /// Tick counts are strictly increasing within the process, so two ids
    /// issued for the same instant still order deterministically.
    pub fn issue(instant: DateTime<Utc>) -> Self {
        let candidate = ticks_of(instant);
        let mut last = LAST_TICKS.load(AtomicOrdering::Relaxed);
        loop {
            let next = candidate.max(last + 1);
            match LAST_TICKS.compare_exchange_weak(
                last,
                next,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return Self::from_ticks(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Build a render id carrying exactly the timestamp of `instant`.
    ///
    /// Unlike [`Tid::issue`] this does not consult the process-wide tick
    /// counter; two calls with the same instant differ only in their random
    /// tail.
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self::from_ticks(ticks_of(instant))
    }

    fn from_ticks(ticks: u64) -> Self {
        let time_low = (ticks & 0xffff_ffff) as u32;
        let time_mid = ((ticks >> 32) & 0xffff) as u16;
        let time_hi = ((ticks >> 48) & 0x0fff) as u16 | 0x1000;
        let mut tail: [u8; 8] = rand::random();
        // RFC 4122 variant, and the multicast bit marks a random node id.
        tail[0] = (tail[0] & 0x3f) | 0x80;
        tail[2] |= 0x01;
        Self(Uuid::from_fields(time_low, time_mid, time_hi, &tail))
    }

    /// Wrap an existing UUID. Fails unless it is a version-1 (time-based) id.
    pub fn from_uuid(uuid: Uuid) -> Result<Self, TypeError> {
        if uuid.get_version_num() != 1 {
            return Err(TypeError::InvalidRenderId(uuid.to_string()));
        }
        Ok(Self(uuid))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// 100 ns ticks since the Gregorian epoch.
    pub fn ticks(&self) -> u64 {
        let (low, mid, hi, _) = self.0.as_fields();
        (u64::from(hi & 0x0fff) << 48) | (u64::from(mid) << 32) | u64::from(low)
    }

    /// The creation time embedded in the id, at millisecond precision.
    pub fn date(&self) -> DateTime<Utc> {
        let unix_ticks = self.ticks().saturating_sub(GREGORIAN_OFFSET);
        let millis = (unix_ticks / 10_000) as i64;
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    /// Short representation (first 8 characters).
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

fn ticks_of(instant: DateTime<Utc>) -> u64 {
    let nanos = instant.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    nanos / 100 + GREGORIAN_OFFSET
}

/// Returns `true` if `s` has the 8-4-4-4-12 hexadecimal UUID layout.
pub fn has_uuid_shape(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == TID_LEN
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

/// Parse a render id from untrusted input.
///
/// Accepts only the canonical hyphenated form of a version-1 UUID, in either
/// letter case.
pub fn validate_render_id(input: &str) -> Result<Tid, TypeError> {
    if !has_uuid_shape(input) || input.as_bytes()[14] != b'1' {
        return Err(TypeError::InvalidRenderId(input.to_string()));
    }
    let uuid = Uuid::parse_str(input).map_err(|_| TypeError::InvalidRenderId(input.to_string()))?;
    Tid::from_uuid(uuid)
}

impl PartialOrd for Tid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ticks()
            .cmp(&other.ticks())
            .then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl FromStr for Tid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_render_id(s)
    }
}

impl TryFrom<String> for Tid {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_render_id(&value)
    }
}

impl From<Tid> for String {
    fn from(tid: Tid) -> Self {
        tid.to_string()
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn issued_ids_are_version_one() {
        let tid = Tid::now();
        assert_eq!(tid.as_uuid().get_version_num(), 1);
        assert!(validate_render_id(&tid.to_string()).is_ok());
    }

    #[test]
    fn issued_ids_strictly_increase() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let a = Tid::issue(instant);
        let b = Tid::issue(instant);
        let c = Tid::now();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn date_round_trips_at_millisecond_precision() {
        let instant = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let tid = Tid::at(instant);
        assert_eq!(tid.date(), instant);
    }

    #[test]
    fn ordering_follows_timestamp_not_string() {
        let early = Tid::at(Utc.timestamp_millis_opt(1_000).unwrap());
        let late = Tid::at(Utc.timestamp_millis_opt(4_294_967_296_000).unwrap());
        assert!(early < late);
    }

    #[test]
    fn parses_known_v1_uuid() {
        let tid: Tid = "fc7a4b20-1c06-11e5-8d44-25e8a62b0e8b".parse().unwrap();
        assert_eq!(tid.to_string(), "fc7a4b20-1c06-11e5-8d44-25e8a62b0e8b");
        assert_eq!(tid.date().timestamp_millis(), 1_435_325_203_592);
    }

    #[test]
    fn uppercase_is_accepted_and_normalized() {
        let tid = validate_render_id("FC7A4B20-1C06-11E5-8D44-25E8A62B0E8B").unwrap();
        assert_eq!(tid.to_string(), "fc7a4b20-1c06-11e5-8d44-25e8a62b0e8b");
    }

    #[test]
    fn rejects_non_canonical_forms() {
        for bad in [
            "",
            "not-a-tid",
            "fc7a4b201c0611e58d4425e8a62b0e8b",
            "{fc7a4b20-1c06-11e5-8d44-25e8a62b0e8b}",
            "fc7a4b20-1c06-41e5-8d44-25e8a62b0e8b",
            "fc7a4b20-1c06-11e5-8d44-25e8a62b0e8bx",
            "gc7a4b20-1c06-11e5-8d44-25e8a62b0e8b",
        ] {
            assert!(validate_render_id(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let tid = Tid::now();
        let json = serde_json::to_string(&tid).unwrap();
        assert_eq!(json, format!("\"{tid}\""));
        let back: Tid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tid);
        assert!(serde_json::from_str::<Tid>("\"bogus\"").is_err());
    }
}
