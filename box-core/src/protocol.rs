//! State identifiers and the training protocol table.

use core::fmt;

/// Number of training protocols in the table.
pub const NUM_TRAINING_PROTOCOLS: usize = 1;
/// Stages per training protocol.
pub const MAX_STAGES: usize = 7;

/// Every behavioral routine the scheduler can run.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StateId {
    DailyWater,
    WeeklyWater,
    HouseLightsOn,
    HouseLightsOff,
    HouseLightsOnToneWater,
    BlinkLightsToneWater,
    NosepokeNonSession,
    LickTest,
    LickTrain,
    NosepokeRewardNonSession,
    Nosepoke1sound,
    NosepokeProb70,
    NosepokeProb40,
    NosepokeImpure,
    ReadSessionParams,
    DoNothing,
}

impl StateId {
    pub const ALL: [StateId; 16] = [
        StateId::DailyWater,
        StateId::WeeklyWater,
        StateId::HouseLightsOn,
        StateId::HouseLightsOff,
        StateId::HouseLightsOnToneWater,
        StateId::BlinkLightsToneWater,
        StateId::NosepokeNonSession,
        StateId::LickTest,
        StateId::LickTrain,
        StateId::NosepokeRewardNonSession,
        StateId::Nosepoke1sound,
        StateId::NosepokeProb70,
        StateId::NosepokeProb40,
        StateId::NosepokeImpure,
        StateId::ReadSessionParams,
        StateId::DoNothing,
    ];

    /// Stable wire index of the state.
    #[must_use]
    pub const fn as_index(self) -> u8 {
        match self {
            StateId::DailyWater => 0,
            StateId::WeeklyWater => 1,
            StateId::HouseLightsOn => 2,
            StateId::HouseLightsOff => 3,
            StateId::HouseLightsOnToneWater => 4,
            StateId::BlinkLightsToneWater => 5,
            StateId::NosepokeNonSession => 6,
            StateId::LickTest => 7,
            StateId::LickTrain => 8,
            StateId::NosepokeRewardNonSession => 9,
            StateId::Nosepoke1sound => 10,
            StateId::NosepokeProb70 => 11,
            StateId::NosepokeProb40 => 12,
            StateId::NosepokeImpure => 13,
            StateId::ReadSessionParams => 14,
            StateId::DoNothing => 15,
        }
    }

    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            StateId::DailyWater => "DailyWater",
            StateId::WeeklyWater => "WeeklyWater",
            StateId::HouseLightsOn => "HouseLightsOn",
            StateId::HouseLightsOff => "HouseLightsOff",
            StateId::HouseLightsOnToneWater => "HouseLightsOnToneWater",
            StateId::BlinkLightsToneWater => "BlinkLightsToneWater",
            StateId::NosepokeNonSession => "NosepokeNonSession",
            StateId::LickTest => "LickTest",
            StateId::LickTrain => "LickTrain",
            StateId::NosepokeRewardNonSession => "NosepokeRewardNonSession",
            StateId::Nosepoke1sound => "Nosepoke1sound",
            StateId::NosepokeProb70 => "NosepokeProb70",
            StateId::NosepokeProb40 => "NosepokeProb40",
            StateId::NosepokeImpure => "NosepokeImpure",
            StateId::ReadSessionParams => "ReadSessionParams",
            StateId::DoNothing => "DoNothing",
        }
    }

    #[must_use]
    pub const fn is_no_op(self) -> bool {
        matches!(self, StateId::DoNothing)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session and non-session machines for one stage.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StageEntry {
    /// Machine run when a training alarm opens a session.
    pub session: StateId,
    /// Machine run between sessions.
    pub non_session: StateId,
}

impl StageEntry {
    pub const UNUSED: Self = Self::new(StateId::DoNothing, StateId::DoNothing);

    #[must_use]
    pub const fn new(session: StateId, non_session: StateId) -> Self {
        Self {
            session,
            non_session,
        }
    }
}

/// `protocol[protocol_id][stage] -> (session, non_session)` lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProtocolTable<const P: usize = NUM_TRAINING_PROTOCOLS, const S: usize = MAX_STAGES> {
    stages: [[StageEntry; S]; P],
}

impl<const P: usize, const S: usize> ProtocolTable<P, S> {
    /// Table with every stage unused.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            stages: [[StageEntry::UNUSED; S]; P],
        }
    }

    /// Returns a copy of the table with one stage replaced. Out-of-range
    /// coordinates leave the table unchanged.
    #[must_use]
    pub const fn with_stage(mut self, protocol: usize, stage: usize, entry: StageEntry) -> Self {
        if protocol < P && stage < S {
            self.stages[protocol][stage] = entry;
        }
        self
    }

    #[must_use]
    pub fn entry(&self, protocol: u8, stage: u8) -> Option<StageEntry> {
        self.stages
            .get(usize::from(protocol))
            .and_then(|row| row.get(usize::from(stage)))
            .copied()
    }

    /// Session machine at `(protocol, stage)`, or the no-op when out of range.
    #[must_use]
    pub fn session(&self, protocol: u8, stage: u8) -> StateId {
        self.entry(protocol, stage)
            .map_or(StateId::DoNothing, |entry| entry.session)
    }

    /// Non-session machine at `(protocol, stage)`, or the no-op when out of range.
    #[must_use]
    pub fn non_session(&self, protocol: u8, stage: u8) -> StateId {
        self.entry(protocol, stage)
            .map_or(StateId::DoNothing, |entry| entry.non_session)
    }

    #[must_use]
    pub const fn protocol_count(&self) -> usize {
        P
    }

    #[must_use]
    pub const fn stage_count(&self) -> usize {
        S
    }
}

impl ProtocolTable {
    /// Protocol 0 runs the block/trial nosepoke task at stage 0.
    #[must_use]
    pub const fn standard() -> Self {
        Self::empty().with_stage(
            0,
            0,
            StageEntry::new(StateId::NosepokeImpure, StateId::DoNothing),
        )
    }
}

impl Default for ProtocolTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Per-protocol stage counters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StageCounters<const P: usize = NUM_TRAINING_PROTOCOLS> {
    stages: [u8; P],
}

impl<const P: usize> StageCounters<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self { stages: [0; P] }
    }

    #[must_use]
    pub fn get(&self, protocol: u8) -> u8 {
        self.stages.get(usize::from(protocol)).copied().unwrap_or(0)
    }

    /// Sets the stage of `protocol`; returns `false` when the protocol index
    /// is out of range.
    pub fn set(&mut self, protocol: u8, stage: u8) -> bool {
        match self.stages.get_mut(usize::from(protocol)) {
            Some(slot) => {
                *slot = stage;
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.stages = [0; P];
    }
}

impl<const P: usize> Default for StageCounters<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_stable_and_invertible() {
        for (index, state) in StateId::ALL.iter().enumerate() {
            let index = u8::try_from(index).expect("index fits");
            assert_eq!(state.as_index(), index);
            assert_eq!(StateId::from_index(index), Some(*state));
        }
        assert_eq!(StateId::from_index(16), None);
        assert!(StateId::DoNothing.is_no_op());
    }

    #[test]
    fn standard_table_has_single_configured_stage() {
        let table = ProtocolTable::standard();
        assert_eq!(table.session(0, 0), StateId::NosepokeImpure);
        assert_eq!(table.non_session(0, 0), StateId::DoNothing);
        for stage in 1..7 {
            assert_eq!(table.entry(0, stage), Some(StageEntry::UNUSED));
        }
        assert_eq!(table.entry(0, 7), None);
        assert_eq!(table.session(1, 0), StateId::DoNothing);
    }

    #[test]
    fn stage_counters_reject_unknown_protocol() {
        let mut stages: StageCounters = StageCounters::new();
        assert!(stages.set(0, 3));
        assert_eq!(stages.get(0), 3);
        assert!(!stages.set(1, 2));
        stages.reset();
        assert_eq!(stages.get(0), 0);
    }
}
