//! Classifier run once per fired alarm.

use crate::alarms::{AlarmKind, AlarmRecord};
use crate::protocol::StateId;
use crate::telemetry::{ReportEvent, SerialSink};

use super::{SchedulerContext, Slot};

/// What the runner must do after an alarm was classified.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// A transition was staged and a stop requested.
    Staged,
    /// Nothing changed.
    Ignored,
    /// Run this machine now, then restart the interrupted one.
    RunUtility(StateId),
}

/// Applies `alarm` to the scheduler registers.
///
/// Training and Special alarms stage a session and request a stop. Disable
/// alarms retarget `next` to a non-session machine unless that machine is
/// already running. Utility alarms swap `current` to their machine and leave
/// running it to the caller.
pub fn dispatch_alarm<S, const RQ: usize, const TQ: usize>(
    ctx: &mut SchedulerContext<S, RQ, TQ>,
    alarm: &AlarmRecord,
) -> Dispatch
where
    S: SerialSink + Clone,
{
    match alarm.kind {
        AlarmKind::Training => {
            let protocol = alarm.protocol.unwrap_or(ctx.registers.current_protocol);
            if !ctx.check_array_size(
                "trainingProtocol",
                ctx.table.protocol_count(),
                usize::from(protocol),
            ) {
                return Dispatch::Ignored;
            }
            ctx.report(ReportEvent::TrainingAlarm, 1);
            ctx.request_stop();
            ctx.registers.previous_protocol = Some(ctx.registers.current_protocol);
            ctx.registers.previous_state = ctx.registers.current_state;
            ctx.registers.next_protocol = Some(protocol);
            ctx.registers.next_state = ctx.table.session(protocol, ctx.stages.get(protocol));
            ctx.set_slot(Slot::Start, alarm.start);
            ctx.set_slot(Slot::End, alarm.end);
            ctx.reset_session();
            Dispatch::Staged
        }
        AlarmKind::Special => {
            ctx.request_stop();
            ctx.registers.previous_protocol = Some(ctx.registers.current_protocol);
            ctx.registers.previous_state = ctx.registers.current_state;
            ctx.registers.next_state = alarm.special;
            ctx.registers.next_protocol = Some(ctx.registers.current_protocol);
            ctx.set_slot(Slot::Start, alarm.start);
            ctx.set_slot(Slot::End, alarm.end);
            ctx.reset_session();
            Dispatch::Staged
        }
        AlarmKind::Utility => {
            ctx.begin_injection(alarm.start);
            Dispatch::RunUtility(alarm.start)
        }
        AlarmKind::Disable => {
            let current_protocol = ctx.registers.current_protocol;
            let non_session = ctx
                .table
                .non_session(current_protocol, ctx.stages.get(current_protocol));
            if ctx.registers.current_state == non_session {
                return Dispatch::Ignored;
            }
            ctx.request_stop();
            let protocol = alarm.protocol.unwrap_or(current_protocol);
            ctx.registers.previous_protocol = Some(current_protocol);
            ctx.registers.next_protocol = Some(protocol);
            ctx.registers.previous_state = ctx.registers.current_state;
            ctx.registers.next_state = ctx.table.non_session(protocol, ctx.stages.get(protocol));
            Dispatch::Staged
        }
        AlarmKind::Void => Dispatch::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::{AlarmRepeat, AlarmTime};
    use crate::config::BoxConfig;
    use crate::telemetry::NullSink;

    fn alarm(kind: AlarmKind, protocol: Option<u8>) -> AlarmRecord {
        AlarmRecord {
            id: 0,
            kind,
            protocol,
            start: StateId::BlinkLightsToneWater,
            end: StateId::HouseLightsOff,
            special: StateId::DailyWater,
            time: AlarmTime::hm(19, 0),
            repeat: AlarmRepeat::Daily,
        }
    }

    fn context() -> SchedulerContext<NullSink, 32, 8> {
        SchedulerContext::new(BoxConfig::default(), NullSink, 3)
    }

    #[test]
    fn training_stages_session_entry() {
        let mut ctx = context();
        let outcome = dispatch_alarm(&mut ctx, &alarm(AlarmKind::Training, Some(0)));

        assert_eq!(outcome, Dispatch::Staged);
        assert!(ctx.stop_requested());
        assert_eq!(ctx.registers.next_state, StateId::NosepokeImpure);
        assert_eq!(ctx.registers.next_protocol, Some(0));
        assert_eq!(ctx.registers.previous_state, StateId::DoNothing);
        assert_eq!(ctx.slot(Slot::Start), StateId::BlinkLightsToneWater);
        assert_eq!(ctx.slot(Slot::End), StateId::HouseLightsOff);
        assert_eq!(ctx.pending_reports(), 1);
    }

    #[test]
    fn training_for_unknown_protocol_is_skipped() {
        let mut ctx = context();
        let outcome = dispatch_alarm(&mut ctx, &alarm(AlarmKind::Training, Some(4)));
        assert_eq!(outcome, Dispatch::Ignored);
        assert!(!ctx.stop_requested());
    }

    #[test]
    fn special_targets_its_own_machine() {
        let mut ctx = context();
        dispatch_alarm(&mut ctx, &alarm(AlarmKind::Special, None));
        assert!(ctx.stop_requested());
        assert_eq!(ctx.registers.next_state, StateId::DailyWater);
        assert_eq!(ctx.registers.next_protocol, Some(0));
    }

    #[test]
    fn disable_is_a_no_op_on_the_non_session_machine() {
        let mut ctx = context();
        assert_eq!(ctx.registers.current_state, StateId::DoNothing);
        let outcome = dispatch_alarm(&mut ctx, &alarm(AlarmKind::Disable, None));
        assert_eq!(outcome, Dispatch::Ignored);
        assert!(!ctx.stop_requested());
    }

    #[test]
    fn disable_stops_a_running_session() {
        let mut ctx = context();
        ctx.registers.current_state = StateId::NosepokeImpure;
        let outcome = dispatch_alarm(&mut ctx, &alarm(AlarmKind::Disable, None));
        assert_eq!(outcome, Dispatch::Staged);
        assert!(ctx.stop_requested());
        assert_eq!(ctx.registers.next_state, StateId::DoNothing);
        assert_eq!(ctx.registers.previous_state, StateId::NosepokeImpure);
    }

    #[test]
    fn utility_swaps_current() {
        let mut ctx = context();
        let mut record = alarm(AlarmKind::Utility, None);
        record.start = StateId::HouseLightsOn;
        assert_eq!(
            dispatch_alarm(&mut ctx, &record),
            Dispatch::RunUtility(StateId::HouseLightsOn)
        );
        assert_eq!(ctx.registers.current_state, StateId::HouseLightsOn);
        assert_eq!(ctx.registers.previous_state, StateId::DoNothing);
        assert!(!ctx.stop_requested());
    }
}
