//! Pairing of reagent and sample channels for the initial line wash.
//!
//! The lowest sample channel is the waste line. Reagent and sample channels
//! are sorted and paired index by index; whichever side is longer gets its
//! leftovers paired with the lowest reagent channel (extra samples) or with
//! waste (extra reagents). A wash only aspirates back out when its
//! sample channel is not waste.

use std::fmt;
use ulab_core::{Result, UlabError};

/// Which side of the pairing has more channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WashStrategy {
    /// Fewer reagents than samples.
    FewerReagents,
    /// One reagent per sample.
    Balanced,
    /// More reagents than samples.
    MoreReagents,
}

impl fmt::Display for WashStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WashStrategy::FewerReagents => "fewer reagents than samples",
            WashStrategy::Balanced => "equal reagents and samples",
            WashStrategy::MoreReagents => "more reagents than samples",
        };
        write!(f, "{}", label)
    }
}

/// How a pair came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
    /// Reagent and sample at the same sorted index.
    Direct,
    /// Extra sample line washed with the lowest reagent.
    SampleLeftover,
    /// Extra reagent line flushed to waste.
    ReagentLeftover,
}

/// One wash cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WashStep {
    /// Valve channel the wash draws from.
    pub reagent_channel: u8,
    /// Valve channel the wash fills.
    pub sample_channel: u8,
    /// How this pair was formed.
    pub kind: PairKind,
    /// Pump the line back out after filling it.
    pub aspirate: bool,
}

/// Ordered wash cycles for every configured line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WashPlan {
    /// Shape of the pairing.
    pub strategy: WashStrategy,
    /// Lowest sample channel.
    pub waste_channel: u8,
    /// Cycles in execution order.
    pub steps: Vec<WashStep>,
}

impl WashPlan {
    /// Pair `reagents` with `samples`. Duplicate channels are washed once.
    pub fn build(
        reagents: impl IntoIterator<Item = u8>,
        samples: impl IntoIterator<Item = u8>,
    ) -> Result<Self> {
        let mut reagents: Vec<u8> = reagents.into_iter().collect();
        let mut samples: Vec<u8> = samples.into_iter().collect();
        reagents.sort_unstable();
        reagents.dedup();
        samples.sort_unstable();
        samples.dedup();

        let (Some(&lowest_reagent), Some(&waste_channel)) = (reagents.first(), samples.first()) else {
            return Err(UlabError::Config(
                "initial wash needs at least one reagent and one sample channel".into(),
            ));
        };

        let strategy = match reagents.len().cmp(&samples.len()) {
            std::cmp::Ordering::Less => WashStrategy::FewerReagents,
            std::cmp::Ordering::Equal => WashStrategy::Balanced,
            std::cmp::Ordering::Greater => WashStrategy::MoreReagents,
        };

        let step = |reagent_channel: u8, sample_channel: u8, kind: PairKind| WashStep {
            reagent_channel,
            sample_channel,
            kind,
            aspirate: sample_channel != waste_channel,
        };

        let mut steps: Vec<WashStep> = reagents
            .iter()
            .zip(&samples)
            .map(|(&r, &s)| step(r, s, PairKind::Direct))
            .collect();
        let paired = steps.len();
        steps.extend(
            samples[paired..]
                .iter()
                .map(|&s| step(lowest_reagent, s, PairKind::SampleLeftover)),
        );
        steps.extend(
            reagents[paired..]
                .iter()
                .map(|&r| step(r, waste_channel, PairKind::ReagentLeftover)),
        );

        Ok(Self {
            strategy,
            waste_channel,
            steps,
        })
    }

    /// Number of cycles that aspirate back out.
    pub fn aspirations(&self) -> usize {
        self.steps.iter().filter(|s| s.aspirate).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(plan: &WashPlan) -> Vec<(u8, u8, bool)> {
        plan.steps
            .iter()
            .map(|s| (s.reagent_channel, s.sample_channel, s.aspirate))
            .collect()
    }

    #[test]
    fn test_more_reagents_flush_to_waste() {
        let plan = WashPlan::build(1..=6, [1]).unwrap();
        assert_eq!(plan.strategy, WashStrategy::MoreReagents);
        assert_eq!(plan.waste_channel, 1);
        assert_eq!(plan.steps.len(), 6);
        assert_eq!(plan.steps[0].kind, PairKind::Direct);
        assert!(plan.steps[1..]
            .iter()
            .all(|s| s.kind == PairKind::ReagentLeftover && s.sample_channel == 1));
        assert_eq!(plan.aspirations(), 0);
    }

    #[test]
    fn test_fewer_reagents_reuse_lowest_reagent() {
        let plan = WashPlan::build([1], [4, 2, 1, 3]).unwrap();
        assert_eq!(plan.strategy, WashStrategy::FewerReagents);
        assert_eq!(
            pairs(&plan),
            vec![(1, 1, false), (1, 2, true), (1, 3, true), (1, 4, true)]
        );
        assert_eq!(plan.aspirations(), 3);
    }

    #[test]
    fn test_sample_leftovers_use_lowest_reagent() {
        let plan = WashPlan::build([2, 3], [1, 4, 5, 6]).unwrap();
        assert_eq!(
            pairs(&plan),
            vec![(2, 1, false), (3, 4, true), (2, 5, true), (2, 6, true)]
        );
    }

    #[test]
    fn test_balanced_pairs_by_index() {
        let plan = WashPlan::build([3, 1, 2], [2, 3, 1]).unwrap();
        assert_eq!(plan.strategy, WashStrategy::Balanced);
        assert_eq!(pairs(&plan), vec![(1, 1, false), (2, 2, true), (3, 3, true)]);
    }

    #[test]
    fn test_duplicates_are_washed_once() {
        let plan = WashPlan::build([2, 2, 5], [1, 1]).unwrap();
        assert_eq!(pairs(&plan), vec![(2, 1, false), (5, 1, false)]);
    }

    #[test]
    fn test_empty_side_is_rejected() {
        assert!(matches!(
            WashPlan::build(Vec::new(), [1]),
            Err(UlabError::Config(_))
        ));
        assert!(WashPlan::build([1], Vec::new()).is_err());
    }
}
