//! Choke/unchoke selection.
//!
//! Every round the fastest interested peers are unchoked and everyone else
//! is choked. Every few rounds one extra peer, picked uniformly at random
//! and regardless of interest, is unchoked optimistically so that new peers
//! get a chance to prove their rate.

use std::net::SocketAddr;

use rand::Rng;

use crate::config::SessionConfig;

/// Observed state of one peer at the start of a choke round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRateSample {
    pub addr: SocketAddr,
    pub rate_kbps: u32,
    pub interested: bool,
    pub am_choking: bool,
}

/// Messages to send after a choke round, as indices into the sample slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChokeDecision {
    pub unchoke: Vec<usize>,
    pub choke: Vec<usize>,
    pub optimistic: Option<usize>,
}

impl ChokeDecision {
    pub fn is_empty(&self) -> bool {
        self.unchoke.is_empty() && self.choke.is_empty()
    }
}

/// Ranks interested peers by rate into `slots` positions.
///
/// Peers are inserted in order; a peer takes the first slot that is empty or
/// holds a strictly slower peer, pushing later entries down. Equal rates keep
/// the earlier peer ahead.
pub fn select_top_peers(samples: &[PeerRateSample], slots: usize) -> Vec<usize> {
    let mut ranked: Vec<usize> = Vec::with_capacity(slots + 1);

    for (index, sample) in samples.iter().enumerate() {
        if !sample.interested {
            continue;
        }
        let position = ranked
            .iter()
            .position(|&held| samples[held].rate_kbps < sample.rate_kbps)
            .unwrap_or(ranked.len());
        if position < slots {
            ranked.insert(position, index);
            ranked.truncate(slots);
        }
    }

    ranked
}

/// Periodic choke algorithm state.
#[derive(Debug, Clone)]
pub struct ChokeAlgorithm {
    slots: usize,
    optimistic_rounds: u32,
    round: u32,
}

impl ChokeAlgorithm {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            slots: config.unchoke_slots,
            optimistic_rounds: config.optimistic_unchoke_rounds.max(1),
            round: 0,
        }
    }

    /// Runs one round using the thread-local RNG.
    pub fn run_round(&mut self, samples: &[PeerRateSample]) -> ChokeDecision {
        self.run_round_with(samples, &mut rand::rng())
    }

    /// Runs one round with the given RNG for the optimistic pick.
    pub fn run_round_with<R: Rng>(
        &mut self,
        samples: &[PeerRateSample],
        rng: &mut R,
    ) -> ChokeDecision {
        self.round = self.round.wrapping_add(1);

        let mut keep = select_top_peers(samples, self.slots);

        let optimistic = if self.round % self.optimistic_rounds == 0 && !samples.is_empty() {
            let pick = rng.random_range(0..samples.len());
            if !keep.contains(&pick) {
                keep.push(pick);
            }
            Some(pick)
        } else {
            None
        };

        let mut decision = ChokeDecision {
            optimistic,
            ..Default::default()
        };
        for (index, sample) in samples.iter().enumerate() {
            let should_unchoke = keep.contains(&index);
            if should_unchoke && sample.am_choking {
                decision.unchoke.push(index);
            } else if !should_unchoke && !sample.am_choking {
                decision.choke.push(index);
            }
        }

        tracing::debug!(
            "Choke round {}: unchoking {:?}, choking {:?}, optimistic {:?}",
            self.round,
            decision.unchoke,
            decision.choke,
            decision.optimistic
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn samples(rates: &[u32]) -> Vec<PeerRateSample> {
        rates
            .iter()
            .enumerate()
            .map(|(i, &rate_kbps)| PeerRateSample {
                addr: SocketAddr::from(([10, 0, 0, i as u8 + 1], 6881)),
                rate_kbps,
                interested: true,
                am_choking: true,
            })
            .collect()
    }

    #[test]
    fn test_top_four_by_rate() {
        let samples = samples(&[10, 50, 5, 80, 20, 80]);
        assert_eq!(select_top_peers(&samples, 4), vec![3, 5, 1, 4]);
    }

    #[test]
    fn test_uninterested_peers_are_not_ranked() {
        let mut samples = samples(&[100, 1, 2]);
        samples[0].interested = false;
        assert_eq!(select_top_peers(&samples, 4), vec![2, 1]);
    }

    #[test]
    fn test_ties_keep_earlier_peer() {
        let samples = samples(&[7, 7, 7, 7, 7]);
        assert_eq!(select_top_peers(&samples, 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_round_chokes_and_unchokes() {
        let mut algorithm = ChokeAlgorithm::new(&SessionConfig::default());
        let mut samples = samples(&[10, 50, 5, 80, 20, 80]);
        // Peer 2 is currently unchoked but not in the top set
        samples[2].am_choking = false;
        // Peer 3 is already unchoked and stays so
        samples[3].am_choking = false;

        let mut rng = StdRng::seed_from_u64(7);
        let decision = algorithm.run_round_with(&samples, &mut rng);
        assert_eq!(decision.unchoke, vec![1, 4, 5]);
        assert_eq!(decision.choke, vec![2]);
        assert_eq!(decision.optimistic, None);
    }

    #[test]
    fn test_optimistic_unchoke_every_third_round() {
        let mut algorithm = ChokeAlgorithm::new(&SessionConfig::default());
        let mut samples = samples(&[10, 20, 30]);
        for sample in &mut samples {
            sample.interested = false;
        }

        let mut rng = StdRng::seed_from_u64(1);
        assert!(algorithm.run_round_with(&samples, &mut rng).is_empty());
        assert!(algorithm.run_round_with(&samples, &mut rng).is_empty());

        let decision = algorithm.run_round_with(&samples, &mut rng);
        let pick = decision.optimistic.unwrap();
        assert!(pick < samples.len());
        assert_eq!(decision.unchoke, vec![pick]);
        assert!(decision.choke.is_empty());
    }

    #[test]
    fn test_empty_roster() {
        let mut algorithm = ChokeAlgorithm::new(&SessionConfig::default());
        for _ in 0..3 {
            assert_eq!(algorithm.run_round(&[]), ChokeDecision::default());
        }
    }
}
