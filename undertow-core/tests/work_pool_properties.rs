//! Property tests for the shared work pool.
//!
//! Several simulated peers with random piece availability claim, release
//! and complete pieces in random order. After every step each index must
//! live in exactly one place: the pool, one peer's claims, or the completed
//! set.

use std::collections::BTreeSet;

use proptest::prelude::*;
use undertow_core::torrent::{Bitfield, PieceIndex, WorkPool};

#[derive(Debug, Clone, Copy)]
enum Action {
    Claim,
    Release(usize),
    Complete(usize),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => Just(Action::Claim),
        1 => any::<usize>().prop_map(Action::Release),
        2 => any::<usize>().prop_map(Action::Complete),
    ]
}

struct SimulatedPeer {
    remote: Bitfield,
    claims: Vec<PieceIndex>,
}

fn check_partition(
    pool: &WorkPool,
    peers: &[SimulatedPeer],
    completed: &BTreeSet<u32>,
    piece_count: u32,
) -> Result<(), TestCaseError> {
    let mut seen = vec![0u32; piece_count as usize];
    for index in pool.snapshot() {
        seen[index.as_u32() as usize] += 1;
    }
    for peer in peers {
        for index in &peer.claims {
            seen[index.as_u32() as usize] += 1;
        }
    }
    for &index in completed {
        seen[index as usize] += 1;
    }

    for (index, count) in seen.iter().enumerate() {
        prop_assert_eq!(*count, 1, "piece {} found in {} places", index, count);
    }
    Ok(())
}

proptest! {
    #[test]
    fn test_every_index_lives_in_exactly_one_place(
        piece_count in 1u32..40,
        availability in prop::collection::vec(prop::collection::vec(any::<bool>(), 40), 1..6),
        steps in prop::collection::vec((any::<usize>(), action()), 1..200),
    ) {
        let pool = WorkPool::seeded(&Bitfield::new(piece_count));
        let mut completed = BTreeSet::new();
        let mut peers: Vec<SimulatedPeer> = availability
            .iter()
            .map(|bits| {
                let mut remote = Bitfield::new(piece_count);
                for index in 0..piece_count {
                    if bits[index as usize] {
                        remote.set(PieceIndex::new(index));
                    }
                }
                SimulatedPeer { remote, claims: Vec::new() }
            })
            .collect();

        check_partition(&pool, &peers, &completed, piece_count)?;

        for (who, action) in steps {
            let peer_count = peers.len();
            let peer = &mut peers[who % peer_count];
            match action {
                Action::Claim => {
                    if let Some(index) = pool.try_claim(&peer.remote) {
                        prop_assert!(peer.remote.has(index));
                        peer.claims.push(index);
                    }
                }
                Action::Release(pick) if !peer.claims.is_empty() => {
                    let index = peer.claims.swap_remove(pick % peer.claims.len());
                    pool.release(index);
                }
                Action::Complete(pick) if !peer.claims.is_empty() => {
                    let index = peer.claims.swap_remove(pick % peer.claims.len());
                    completed.insert(index.as_u32());
                }
                _ => {}
            }
            check_partition(&pool, &peers, &completed, piece_count)?;
        }
    }

    #[test]
    fn test_seeded_pool_holds_exactly_the_missing_pieces(
        have in prop::collection::vec(any::<bool>(), 1..64),
    ) {
        let piece_count = have.len() as u32;
        let mut local = Bitfield::new(piece_count);
        for (index, present) in have.iter().enumerate() {
            if *present {
                local.set(PieceIndex::new(index as u32));
            }
        }

        let pool = WorkPool::seeded(&local);
        let pending: Vec<u32> = pool.snapshot().iter().map(|index| index.as_u32()).collect();
        let missing: Vec<u32> = (0..piece_count)
            .filter(|index| !have[*index as usize])
            .collect();
        prop_assert_eq!(pending, missing);
    }
}
