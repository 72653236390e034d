//! Wall-clock alarms that reshape the running session.
//!
//! Alarms are registered once at setup, in a fixed table indexed by insertion
//! order. They stay disarmed until the host syncs the wall clock, after which
//! each alarm fires once per day or once per week.

use core::fmt;

use heapless::Vec;

use crate::clock::{SECONDS_PER_DAY, SECONDS_PER_WEEK, Weekday};
use crate::protocol::StateId;
use crate::telemetry::{Diagnostic, SerialSink, emit_diagnostic};

/// Capacity of the alarm table.
pub const MAX_ALARMS: usize = 20;

/// How a fired alarm changes the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmKind {
    /// Opens a session of the alarm's protocol at its current stage.
    Training,
    /// Opens a session that runs the alarm's special machine.
    Special,
    /// Runs a short machine immediately, then resumes.
    Utility,
    /// Ends the session and falls back to the non-session machine.
    Disable,
    /// Unused slot.
    Void,
}

/// Time of day an alarm fires at.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct AlarmTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl AlarmTime {
    #[must_use]
    pub const fn new(hour: u8, minute: u8, second: u8) -> Self {
        Self {
            hour,
            minute,
            second,
        }
    }

    #[must_use]
    pub const fn hm(hour: u8, minute: u8) -> Self {
        Self::new(hour, minute, 0)
    }

    #[must_use]
    pub fn seconds_of_day(self) -> u64 {
        u64::from(self.hour) * 3_600 + u64::from(self.minute) * 60 + u64::from(self.second)
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmRepeat {
    Daily,
    Weekly(Weekday),
}

/// One registered alarm.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AlarmRecord {
    pub id: u8,
    pub kind: AlarmKind,
    /// Target protocol; `None` keeps the current one.
    pub protocol: Option<u8>,
    pub start: StateId,
    pub end: StateId,
    pub special: StateId,
    pub time: AlarmTime,
    pub repeat: AlarmRepeat,
}

impl AlarmRecord {
    /// Zero-value sentinel for unused slots.
    pub const VOID: Self = Self {
        id: 0,
        kind: AlarmKind::Void,
        protocol: None,
        start: StateId::DoNothing,
        end: StateId::DoNothing,
        special: StateId::DoNothing,
        time: AlarmTime::new(0, 0, 0),
        repeat: AlarmRepeat::Daily,
    };

    /// Unix time of the first firing strictly after `unix_now`.
    #[must_use]
    pub fn next_after(&self, unix_now: u64) -> u64 {
        let tod = self.time.seconds_of_day();
        match self.repeat {
            AlarmRepeat::Daily => {
                let midnight = unix_now - unix_now % SECONDS_PER_DAY;
                let candidate = midnight + tod;
                if candidate > unix_now {
                    candidate
                } else {
                    candidate + SECONDS_PER_DAY
                }
            }
            AlarmRepeat::Weekly(weekday) => {
                let days = unix_now / SECONDS_PER_DAY;
                // 1970-01-01 was a Thursday, four days after a Sunday.
                let sunday = (days - (days + 4) % 7) * SECONDS_PER_DAY;
                let candidate = sunday + weekday.index() * SECONDS_PER_DAY + tod;
                if candidate > unix_now {
                    candidate
                } else {
                    candidate + SECONDS_PER_WEEK
                }
            }
        }
    }
}

/// Alarm registration errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmError {
    TableFull,
}

impl AlarmError {
    /// Lines emitted when registration fails.
    #[must_use]
    pub const fn diagnostics(self) -> [Diagnostic; 2] {
        match self {
            AlarmError::TableFull => [Diagnostic::AlarmTableFull, Diagnostic::AlarmCapacityHint],
        }
    }
}

impl fmt::Display for AlarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmError::TableFull => f.write_str("alarm table full"),
        }
    }
}

/// House-light alarm times used to pick the light state at startup.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HouseLightSchedule {
    first: Option<(AlarmTime, StateId)>,
    second: Option<(AlarmTime, StateId)>,
    latest: Option<(AlarmTime, StateId)>,
}

impl HouseLightSchedule {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            first: None,
            second: None,
            latest: None,
        }
    }

    /// Records a light alarm. The first entry is held back; each later entry
    /// is paired with it in time order.
    pub fn record(&mut self, time: AlarmTime, state: StateId) {
        let Some(held) = self.latest else {
            self.latest = Some((time, state));
            return;
        };
        if time.seconds_of_day() > held.0.seconds_of_day() {
            self.first = Some(held);
            self.second = Some((time, state));
        } else {
            self.first = Some((time, state));
            self.second = Some(held);
        }
    }

    /// Light machine that should be in effect at `seconds_of_day`: the
    /// earlier entry when the time falls strictly between the two, else the
    /// later entry.
    #[must_use]
    pub fn initial_state(&self, seconds_of_day: u64) -> Option<StateId> {
        let (first, second) = (self.first?, self.second?);
        let t = i64::try_from(seconds_of_day).ok()?;
        let t1 = i64::try_from(first.0.seconds_of_day()).ok()?;
        let t2 = i64::try_from(second.0.seconds_of_day()).ok()?;
        if (t - t1) * (t - t2) < 0 {
            Some(first.1)
        } else {
            Some(second.1)
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct ScheduledAlarm {
    record: AlarmRecord,
    next_fire: Option<u64>,
}

/// Fixed-capacity alarm table.
pub struct AlarmTable<const N: usize = MAX_ALARMS> {
    alarms: Vec<ScheduledAlarm, N>,
    lights: HouseLightSchedule,
    last_fired: Option<u8>,
}

impl<const N: usize> AlarmTable<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alarms: Vec::new(),
            lights: HouseLightSchedule::new(),
            last_fired: None,
        }
    }

    pub fn set_daily(
        &mut self,
        time: AlarmTime,
        kind: AlarmKind,
        protocol: Option<u8>,
        start: StateId,
        end: StateId,
        special: StateId,
    ) -> Result<u8, AlarmError> {
        if kind == AlarmKind::Utility
            && matches!(start, StateId::HouseLightsOn | StateId::HouseLightsOff)
        {
            self.lights.record(time, start);
        }
        self.insert(AlarmRecord {
            id: 0,
            kind,
            protocol,
            start,
            end,
            special,
            time,
            repeat: AlarmRepeat::Daily,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_weekly(
        &mut self,
        weekday: Weekday,
        time: AlarmTime,
        kind: AlarmKind,
        protocol: Option<u8>,
        start: StateId,
        end: StateId,
        special: StateId,
    ) -> Result<u8, AlarmError> {
        self.insert(AlarmRecord {
            id: 0,
            kind,
            protocol,
            start,
            end,
            special,
            time,
            repeat: AlarmRepeat::Weekly(weekday),
        })
    }

    fn insert(&mut self, mut record: AlarmRecord) -> Result<u8, AlarmError> {
        let id = u8::try_from(self.alarms.len()).map_err(|_| AlarmError::TableFull)?;
        record.id = id;
        self.alarms
            .push(ScheduledAlarm {
                record,
                next_fire: None,
            })
            .map_err(|_| AlarmError::TableFull)?;
        Ok(id)
    }

    /// Computes the next firing of every alarm relative to `unix_now`.
    pub fn arm(&mut self, unix_now: u64) {
        for alarm in &mut self.alarms {
            alarm.next_fire = Some(alarm.record.next_after(unix_now));
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.alarms.iter().any(|alarm| alarm.next_fire.is_some())
    }

    /// Returns the first due alarm in registration order and reschedules it.
    pub fn poll_due(&mut self, unix_now: u64) -> Option<AlarmRecord> {
        let alarm = self
            .alarms
            .iter_mut()
            .find(|alarm| alarm.next_fire.is_some_and(|at| at <= unix_now))?;
        alarm.next_fire = Some(alarm.record.next_after(unix_now));
        self.last_fired = Some(alarm.record.id);
        Some(alarm.record)
    }

    #[must_use]
    pub fn get(&self, id: u8) -> Option<&AlarmRecord> {
        self.alarms.get(usize::from(id)).map(|alarm| &alarm.record)
    }

    #[must_use]
    pub const fn last_fired(&self) -> Option<u8> {
        self.last_fired
    }

    /// The alarm registered right after the last one that fired.
    #[must_use]
    pub fn upcoming(&self) -> Option<&AlarmRecord> {
        let next = self.last_fired?.checked_add(1)?;
        self.get(next)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmRecord> {
        self.alarms.iter().map(|alarm| &alarm.record)
    }

    #[must_use]
    pub const fn house_lights(&self) -> &HouseLightSchedule {
        &self.lights
    }
}

impl<const N: usize> Default for AlarmTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Emits the capacity diagnostics when `result` is a registration failure.
pub fn report_registration<S: SerialSink + ?Sized>(sink: &S, result: Result<u8, AlarmError>) {
    if let Err(err) = result {
        for diagnostic in err.diagnostics() {
            emit_diagnostic(sink, &diagnostic);
        }
    }
}

/// Registers the standard daily light cycle, three training sessions with
/// their disable alarms, and the daily and weekly water sessions.
pub fn install_default_alarms<const N: usize, S>(table: &mut AlarmTable<N>, sink: &S)
where
    S: SerialSink + ?Sized,
{
    use AlarmKind::{Disable, Special, Training, Utility};
    use StateId::{
        BlinkLightsToneWater, DailyWater, DoNothing, HouseLightsOff, HouseLightsOn,
        HouseLightsOnToneWater, WeeklyWater,
    };

    let daily = [
        (AlarmTime::hm(6, 0), Utility, None, HouseLightsOn, DoNothing, DoNothing),
        (AlarmTime::hm(18, 0), Utility, None, HouseLightsOff, DoNothing, DoNothing),
        (AlarmTime::hm(19, 0), Training, Some(0), BlinkLightsToneWater, HouseLightsOff, DoNothing),
        (AlarmTime::hm(19, 40), Disable, None, HouseLightsOff, DoNothing, DoNothing),
        (AlarmTime::hm(23, 0), Training, Some(0), BlinkLightsToneWater, HouseLightsOff, DoNothing),
        (AlarmTime::hm(23, 40), Disable, None, HouseLightsOff, DoNothing, DoNothing),
        (AlarmTime::hm(3, 0), Training, Some(0), BlinkLightsToneWater, HouseLightsOff, DoNothing),
        (AlarmTime::hm(3, 40), Disable, None, HouseLightsOff, DoNothing, DoNothing),
        (AlarmTime::hm(5, 0), Special, None, HouseLightsOnToneWater, HouseLightsOff, DailyWater),
        (AlarmTime::hm(5, 30), Disable, None, DoNothing, DoNothing, DoNothing),
    ];
    for (time, kind, protocol, start, end, special) in daily {
        report_registration(sink, table.set_daily(time, kind, protocol, start, end, special));
    }

    report_registration(
        sink,
        table.set_weekly(
            Weekday::Monday,
            AlarmTime::hm(4, 0),
            Special,
            None,
            HouseLightsOnToneWater,
            HouseLightsOff,
            WeeklyWater,
        ),
    );
    report_registration(
        sink,
        table.set_weekly(
            Weekday::Monday,
            AlarmTime::hm(5, 0),
            Disable,
            None,
            DoNothing,
            DoNothing,
            DoNothing,
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NullSink;

    // 2017-09-24 23:15:00 UTC, a Sunday.
    const SUNDAY_2315: u64 = 1_506_294_900;

    #[test]
    fn daily_alarm_fires_next_occurrence() {
        let record = AlarmRecord {
            time: AlarmTime::hm(23, 40),
            ..AlarmRecord::VOID
        };
        assert_eq!(record.next_after(SUNDAY_2315), SUNDAY_2315 + 25 * 60);

        let record = AlarmRecord {
            time: AlarmTime::hm(6, 0),
            ..AlarmRecord::VOID
        };
        assert_eq!(
            record.next_after(SUNDAY_2315),
            SUNDAY_2315 + 45 * 60 + 6 * 3_600
        );
    }

    #[test]
    fn weekly_alarm_targets_weekday() {
        let record = AlarmRecord {
            time: AlarmTime::hm(4, 0),
            repeat: AlarmRepeat::Weekly(Weekday::Monday),
            ..AlarmRecord::VOID
        };
        let monday_0400 = SUNDAY_2315 + 45 * 60 + 4 * 3_600;
        assert_eq!(record.next_after(SUNDAY_2315), monday_0400);
        assert_eq!(record.next_after(monday_0400), monday_0400 + SECONDS_PER_WEEK);
    }

    #[test]
    fn table_rejects_twenty_first_alarm() {
        let mut table: AlarmTable = AlarmTable::new();
        for minute in 0..20 {
            table
                .set_daily(
                    AlarmTime::hm(1, minute),
                    AlarmKind::Disable,
                    None,
                    StateId::DoNothing,
                    StateId::DoNothing,
                    StateId::DoNothing,
                )
                .expect("room for alarm");
        }
        assert_eq!(
            table.set_daily(
                AlarmTime::hm(2, 0),
                AlarmKind::Disable,
                None,
                StateId::DoNothing,
                StateId::DoNothing,
                StateId::DoNothing,
            ),
            Err(AlarmError::TableFull)
        );
        assert_eq!(table.len(), 20);
    }

    #[test]
    fn due_alarms_fire_in_registration_order_once() {
        let mut table: AlarmTable = AlarmTable::new();
        install_default_alarms(&mut table, &NullSink);
        assert_eq!(table.len(), 12);
        assert!(!table.is_armed());
        assert_eq!(table.poll_due(u64::MAX / 2), None);

        table.arm(SUNDAY_2315);
        let disable_2340 = SUNDAY_2315 + 25 * 60;
        assert_eq!(table.poll_due(disable_2340 - 1), None);

        let fired = table.poll_due(disable_2340).expect("23:40 disable due");
        assert_eq!(fired.kind, AlarmKind::Disable);
        assert_eq!(fired.time, AlarmTime::hm(23, 40));
        assert_eq!(table.last_fired(), Some(5));
        assert_eq!(table.upcoming().map(|a| a.kind), Some(AlarmKind::Training));
        assert_eq!(table.poll_due(disable_2340), None);
    }

    #[test]
    fn house_light_schedule_picks_state_by_time_of_day() {
        let mut table: AlarmTable = AlarmTable::new();
        install_default_alarms(&mut table, &NullSink);
        let lights = table.house_lights();

        assert_eq!(lights.initial_state(12 * 3_600), Some(StateId::HouseLightsOn));
        assert_eq!(lights.initial_state(23 * 3_600), Some(StateId::HouseLightsOff));
        assert_eq!(lights.initial_state(2 * 3_600), Some(StateId::HouseLightsOff));
        assert_eq!(HouseLightSchedule::new().initial_state(0), None);
    }
}
