//! Short machines that only move lights, the tone and the valve. They run as
//! the idle machine or inside start/end slots and utility alarms.

use crate::digital::OutputLine;
use crate::hardware::BoxIo;
use crate::scheduler::SchedulerContext;
use crate::telemetry::SerialSink;

use super::{StateMachine, Timer, TransitionRequest, set_cameras};

/// Day or night lighting: house RGB on with the IR flood off, or the reverse.
/// Camera lights are always switched off.
pub fn apply_house_lights<S, IO, const RQ: usize, const TQ: usize>(
    ctx: &mut SchedulerContext<S, RQ, TQ>,
    io: &mut IO,
    on: bool,
) where
    S: SerialSink + Clone,
    IO: BoxIo + ?Sized,
{
    ctx.set_outputs(io, &OutputLine::HOUSE_LIGHTS, on);
    ctx.set_output(io, OutputLine::IrLight, !on);
    set_cameras(ctx, io, false);
}

/// Initializes, then idles until asked to stop.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DoNothing {
    initialized: bool,
}

impl DoNothing {
    #[must_use]
    pub const fn new() -> Self {
        Self { initialized: false }
    }
}

impl StateMachine for DoNothing {
    fn step<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> TransitionRequest
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        if !self.initialized {
            self.initialized = true;
            ctx.initialize_machine(io);
            return TransitionRequest::Continue;
        }
        if ctx.stop_requested() {
            ctx.end_current_machine();
            ctx.end_current_protocol();
            return TransitionRequest::Finished;
        }
        TransitionRequest::Continue
    }
}

/// Switches the house lights in a single step.
///
/// The first run at boot only sets the outputs. Later runs are full machine
/// runs with the initialize and end reports around the switch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HouseLights {
    on: bool,
}

impl HouseLights {
    #[must_use]
    pub const fn new(on: bool) -> Self {
        Self { on }
    }
}

impl StateMachine for HouseLights {
    fn step<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> TransitionRequest
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        let applied = ctx.lights_applied();
        if applied {
            ctx.initialize_machine(io);
        }
        apply_house_lights(ctx, io, self.on);
        if applied {
            ctx.end_current_machine();
        }
        ctx.mark_lights_applied();
        TransitionRequest::Finished
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ToneWaterPhase {
    Begin,
    ToneHold(Timer),
    Settle(Timer),
    Done,
}

/// Lights on, tone with a two-pulse reward, then silence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LightsOnToneWater {
    phase: ToneWaterPhase,
}

impl LightsOnToneWater {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: ToneWaterPhase::Begin,
        }
    }
}

impl Default for LightsOnToneWater {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for LightsOnToneWater {
    fn step<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> TransitionRequest
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        let now = ctx.now();
        match &mut self.phase {
            ToneWaterPhase::Begin => {
                ctx.initialize_machine(io);
                ctx.set_outputs(io, &OutputLine::HOUSE_LIGHTS, true);
                ctx.tone_on(io);
                ctx.give_reward(io, 2);
                self.phase = ToneWaterPhase::ToneHold(Timer::millis(170));
            }
            ToneWaterPhase::ToneHold(timer) => {
                if timer.expired(now) {
                    ctx.tone_off(io);
                    self.phase = ToneWaterPhase::Settle(Timer::millis(1_000));
                }
            }
            ToneWaterPhase::Settle(timer) => {
                if timer.expired(now) {
                    ctx.set_output(io, OutputLine::IrLight, false);
                    set_cameras(ctx, io, false);
                    ctx.end_current_machine();
                    self.phase = ToneWaterPhase::Done;
                    return TransitionRequest::Finished;
                }
            }
            ToneWaterPhase::Done => return TransitionRequest::Finished,
        }
        TransitionRequest::Continue
    }
}

const BLINK_CYCLES: u8 = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BlinkPhase {
    Begin,
    Tone { cycle: u8, timer: Timer },
    Lit { cycle: u8, timer: Timer },
    Dark { cycle: u8, timer: Timer },
    Ending,
    Done,
}

/// Five light and tone blinks, then lights and cameras on with one reward.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlinkLightsToneWater {
    phase: BlinkPhase,
}

impl BlinkLightsToneWater {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: BlinkPhase::Begin,
        }
    }

    fn start_cycle<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
        cycle: u8,
    ) where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        ctx.set_outputs(io, &OutputLine::HOUSE_LIGHTS, true);
        ctx.tone_on(io);
        self.phase = BlinkPhase::Tone {
            cycle,
            timer: Timer::millis(250),
        };
    }
}

impl Default for BlinkLightsToneWater {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for BlinkLightsToneWater {
    fn step<S, IO, const RQ: usize, const TQ: usize>(
        &mut self,
        ctx: &mut SchedulerContext<S, RQ, TQ>,
        io: &mut IO,
    ) -> TransitionRequest
    where
        S: SerialSink + Clone,
        IO: BoxIo + ?Sized,
    {
        let now = ctx.now();
        match self.phase {
            BlinkPhase::Begin => {
                ctx.initialize_machine(io);
                self.start_cycle(ctx, io, 0);
            }
            BlinkPhase::Tone { cycle, mut timer } => {
                if timer.expired(now) {
                    ctx.tone_off(io);
                    self.phase = BlinkPhase::Lit {
                        cycle,
                        timer: Timer::millis(1_000),
                    };
                } else {
                    self.phase = BlinkPhase::Tone { cycle, timer };
                }
            }
            BlinkPhase::Lit { cycle, mut timer } => {
                if timer.expired(now) {
                    ctx.set_outputs(io, &OutputLine::HOUSE_LIGHTS, false);
                    self.phase = BlinkPhase::Dark {
                        cycle,
                        timer: Timer::millis(1_000),
                    };
                } else {
                    self.phase = BlinkPhase::Lit { cycle, timer };
                }
            }
            BlinkPhase::Dark { cycle, mut timer } => {
                if !timer.expired(now) {
                    self.phase = BlinkPhase::Dark { cycle, timer };
                } else if cycle + 1 < BLINK_CYCLES {
                    self.start_cycle(ctx, io, cycle + 1);
                } else {
                    ctx.set_outputs(io, &OutputLine::HOUSE_LIGHTS, true);
                    set_cameras(ctx, io, true);
                    ctx.set_output(io, OutputLine::IrLight, false);
                    ctx.give_reward(io, 1);
                    self.phase = BlinkPhase::Ending;
                }
            }
            BlinkPhase::Ending => {
                ctx.end_current_machine();
                self.phase = BlinkPhase::Done;
                return TransitionRequest::Finished;
            }
            BlinkPhase::Done => return TransitionRequest::Finished,
        }
        TransitionRequest::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedIo;
    use crate::machines::testing::{Lines, context, run_until};
    use crate::protocol::StateId;

    #[test]
    fn first_house_lights_run_is_silent() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();

        let mut lights = HouseLights::new(true);
        assert_eq!(lights.step(&mut ctx, &mut io), TransitionRequest::Finished);
        assert!(ctx.lights_applied());
        // house lines are active low
        assert!(!io.output_level(OutputLine::HouseRed));
        // 3 house lines, IR, 2 cameras; no 61 or 62
        assert_eq!(ctx.pending_reports(), 6);

        let mut lights = HouseLights::new(false);
        ctx.registers.next_state = StateId::DoNothing;
        lights.step(&mut ctx, &mut io);
        assert_eq!(ctx.pending_reports(), 6 + 8);
        assert!(io.output_level(OutputLine::HouseRed));
    }

    #[test]
    fn do_nothing_ends_machine_and_protocol_on_stop() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();
        let mut idle = DoNothing::new();

        assert_eq!(idle.step(&mut ctx, &mut io), TransitionRequest::Continue);
        assert_eq!(idle.step(&mut ctx, &mut io), TransitionRequest::Continue);
        ctx.request_stop();
        assert_eq!(idle.step(&mut ctx, &mut io), TransitionRequest::Finished);

        let mut idle = DoNothing::new();
        idle.step(&mut ctx, &mut io);
        assert!(!ctx.stop_requested());
    }

    #[test]
    fn blink_runs_five_cycles_then_rewards() {
        let sink = Lines::default();
        let mut ctx = context(&sink);
        let mut io = SimulatedIo::new();
        let mut blink = BlinkLightsToneWater::new();

        let last = run_until(
            &mut blink,
            &mut ctx,
            &mut io,
            20_000,
            |_, _, request| request == TransitionRequest::Finished,
            |_, _| {},
        );
        assert_eq!(last, TransitionRequest::Finished);
        // one tone on and one tone off per cycle
        assert_eq!(
            sink.events(ctx.config.tone_code),
            2 * usize::from(BLINK_CYCLES)
        );
        assert_eq!(sink.events(51), 1);
        assert_eq!(sink.events(52), 1);
        assert_eq!(sink.events(62), 1);
        assert!(!io.output_level(OutputLine::CamLeft));
        assert_eq!(ctx.daily_intake(), 1);
    }
}
