//! Asks the host for the persisted protocol, stage and intake.

use crate::hardware::BoxIo;
use crate::scheduler::SchedulerContext;
use crate::telemetry::{SESSION_PARAMS_REQUEST, SerialSink};

use super::{BodyStep, SessionBody, Timer};

/// How long to wait for the host's `S` reply.
pub const REPLY_TIMEOUT_MS: u64 = 5_000;

/// Writes the `S` request, then waits for the host to restore the session.
/// Either way it moves on to the non-session machine of the (possibly
/// restored) protocol and stage.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadSessionParams {
    reply: Timer,
}

impl ReadSessionParams {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reply: Timer::millis(REPLY_TIMEOUT_MS),
        }
    }
}

impl Default for ReadSessionParams {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBody for ReadSessionParams {
    fn open<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        _io: &mut IO,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        // a stale reply must not satisfy this request
        ctx.take_params_restored();
        ctx.write_line(SESSION_PARAMS_REQUEST);
        self.reply = Timer::millis(REPLY_TIMEOUT_MS);
    }

    fn run<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        _io: &mut IO,
    ) -> BodyStep
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        if ctx.stop_requested() {
            return BodyStep::Stopped;
        }
        if ctx.take_params_restored() || self.reply.closed(ctx.now()) {
            ctx.stage_current_non_session();
            ctx.end_current_machine();
            return BodyStep::Ended;
        }
        BodyStep::Continue
    }
}
