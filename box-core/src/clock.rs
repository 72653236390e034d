//! Monotonic and wall-clock time used across the box.
//!
//! The scheduler never reads a hardware timer directly. Callers hand it an
//! [`Instant`] through a [`MonotonicClock`], and the [`WallClock`] turns those
//! instants into Unix time once the host computer has sent a `T` sync message.

use core::{fmt, ops::Add, time::Duration};

/// Monotonic timestamp with microsecond resolution.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Instant {
    micros: u64,
}

impl Instant {
    /// Timestamp at the origin of the monotonic timeline.
    pub const ZERO: Self = Self { micros: 0 };

    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis.saturating_mul(1_000),
        }
    }

    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.micros
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.micros / 1_000
    }

    /// Returns the saturating duration from `earlier` to `self`.
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(earlier.micros))
    }

    /// Milliseconds elapsed since `earlier`, truncated to the 32-bit field
    /// width used on the wire.
    #[must_use]
    pub fn millis_since(self, earlier: Self) -> u32 {
        let millis = self.micros.saturating_sub(earlier.micros) / 1_000;
        u32::try_from(millis).unwrap_or(u32::MAX)
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Self {
            micros: self.micros.saturating_add(micros),
        }
    }
}

/// Source of monotonic time.
pub trait MonotonicClock {
    fn now(&self) -> Instant;
}

impl<C: MonotonicClock + ?Sized> MonotonicClock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Day of week, Sunday first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Weekday {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    #[must_use]
    pub const fn index(self) -> u64 {
        match self {
            Weekday::Sunday => 0,
            Weekday::Monday => 1,
            Weekday::Tuesday => 2,
            Weekday::Wednesday => 3,
            Weekday::Thursday => 4,
            Weekday::Friday => 5,
            Weekday::Saturday => 6,
        }
    }

    #[must_use]
    pub const fn from_index(index: u64) -> Self {
        match index % 7 {
            0 => Weekday::Sunday,
            1 => Weekday::Monday,
            2 => Weekday::Tuesday,
            3 => Weekday::Wednesday,
            4 => Weekday::Thursday,
            5 => Weekday::Friday,
            _ => Weekday::Saturday,
        }
    }
}

pub const SECONDS_PER_DAY: u64 = 86_400;
pub const SECONDS_PER_WEEK: u64 = 7 * SECONDS_PER_DAY;

/// Broken-down calendar time (UTC).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CivilTime {
    pub year: i64,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub weekday: Weekday,
}

impl CivilTime {
    /// Converts Unix seconds into a calendar date and time of day.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn from_unix(seconds: u64) -> Self {
        let days = seconds / SECONDS_PER_DAY;
        let secs_of_day = seconds % SECONDS_PER_DAY;

        // Civil-from-days over 400-year eras.
        let z = days as i64 + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z - era * 146_097;
        let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = doy - (153 * mp + 2) / 5 + 1;
        let month = if mp < 10 { mp + 3 } else { mp - 9 };
        let year = yoe + era * 400 + i64::from(month <= 2);

        Self {
            year,
            month: month as u8,
            day: day as u8,
            hour: (secs_of_day / 3_600) as u8,
            minute: ((secs_of_day % 3_600) / 60) as u8,
            second: (secs_of_day % 60) as u8,
            // 1970-01-01 was a Thursday.
            weekday: Weekday::from_index(days + 4),
        }
    }

    #[must_use]
    pub fn seconds_of_day(&self) -> u32 {
        u32::from(self.hour) * 3_600 + u32::from(self.minute) * 60 + u32::from(self.second)
    }
}

impl fmt::Display for CivilTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Date: {}-{}-{} , Time: {}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Wall clock anchored to a monotonic instant at the last sync.
///
/// Before the first sync the clock counts up from the Unix epoch, which keeps
/// report timestamps monotonic while the box waits for the host.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct WallClock {
    base_unix: u64,
    base_at: Instant,
    synced: bool,
}

impl WallClock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base_unix: 0,
            base_at: Instant::ZERO,
            synced: false,
        }
    }

    /// Anchors Unix time `unix_seconds` at monotonic instant `now`.
    pub fn sync(&mut self, unix_seconds: u64, now: Instant) {
        self.base_unix = unix_seconds;
        self.base_at = now;
        self.synced = true;
    }

    #[must_use]
    pub const fn is_synced(&self) -> bool {
        self.synced
    }

    #[must_use]
    pub fn unix_seconds(&self, now: Instant) -> u64 {
        self.base_unix + now.saturating_duration_since(self.base_at).as_secs()
    }

    /// Unix epoch in milliseconds.
    #[must_use]
    pub fn epoch_millis(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.base_at);
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.base_unix.saturating_mul(1_000).saturating_add(millis)
    }

    #[must_use]
    pub fn civil(&self, now: Instant) -> CivilTime {
        CivilTime::from_unix(self.unix_seconds(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_time_matches_known_epoch() {
        // 2017-09-24 23:15:00 UTC, a Sunday.
        let civil = CivilTime::from_unix(1_506_294_900);
        assert_eq!(civil.year, 2017);
        assert_eq!(civil.month, 9);
        assert_eq!(civil.day, 24);
        assert_eq!(civil.hour, 23);
        assert_eq!(civil.minute, 15);
        assert_eq!(civil.second, 0);
        assert_eq!(civil.weekday, Weekday::Sunday);
    }

    #[test]
    fn civil_time_renders_clock_echo() {
        let civil = CivilTime::from_unix(1_506_298_500);
        let mut text: heapless::String<64> = heapless::String::new();
        core::fmt::write(&mut text, format_args!("{civil}")).expect("format clock echo");
        assert_eq!(text.as_str(), "Date: 2017-9-25 , Time: 0:15:00");
    }

    #[test]
    fn wall_clock_advances_from_sync_point() {
        let mut clock = WallClock::new();
        assert!(!clock.is_synced());

        clock.sync(1_000, Instant::from_millis(500));
        assert!(clock.is_synced());
        assert_eq!(clock.unix_seconds(Instant::from_millis(2_600)), 1_002);
        assert_eq!(clock.epoch_millis(Instant::from_millis(2_600)), 1_002_100);
    }

    #[test]
    fn instant_addition_saturates() {
        let end = Instant::from_micros(u64::MAX - 1) + Duration::from_secs(5);
        assert_eq!(end.as_micros(), u64::MAX);
        assert_eq!(
            Instant::from_millis(5).millis_since(Instant::from_millis(7)),
            0
        );
    }
}
