//! Randomized boundary probing of a deployed verifier.
//!
//! Each trial moves both minute components near the true cell's edges: half
//! of the time exactly onto an edge, otherwise uniformly inside a neighbouring
//! bucket. Latitude and longitude are sampled independently.

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

use crate::{
    coordinate::{minute_anchor, GridCoordinate, GRID_MINUTES},
    ledger::VerifierBinding,
    orchestrator::{ProofOrchestrator, ProofRecord, VerificationOutcome},
};

pub const DEFAULT_TRIALS: usize = 1000;

const LAST_ANCHOR: i64 = 60 - GRID_MINUTES;
const LAST_MINUTE: i64 = 59;

/// Minute near the bucket that contains `true_minute`. Always a real minute:
/// the last bucket's exclusive upper edge (60) is sampled as 59 instead.
pub fn sample_minute<R: Rng + ?Sized>(rng: &mut R, true_minute: i64) -> i64 {
    let anchor = minute_anchor(true_minute);
    if rng.gen_bool(0.5) {
        // Inclusive lower edge or exclusive upper edge.
        if rng.gen_bool(0.5) {
            anchor
        } else {
            (anchor + GRID_MINUTES).min(LAST_MINUTE)
        }
    } else {
        let neighbours: Vec<i64> = [anchor - GRID_MINUTES, anchor + GRID_MINUTES]
            .into_iter()
            .filter(|a| (0..=LAST_ANCHOR).contains(a))
            .collect();
        let bucket = neighbours[rng.gen_range(0..neighbours.len())];
        rng.gen_range(bucket..bucket + GRID_MINUTES)
    }
}

/// Query coordinate for one trial; degrees stay on the true cell.
pub fn sample_query<R: Rng + ?Sized>(rng: &mut R, truth: &GridCoordinate) -> GridCoordinate {
    GridCoordinate::new(
        truth.lat_deg,
        sample_minute(rng, truth.lat_min),
        truth.lon_deg,
        sample_minute(rng, truth.lon_min),
    )
}

#[derive(Debug, Default)]
pub struct FuzzReport {
    pub outcomes: Vec<VerificationOutcome>,
}

impl FuzzReport {
    pub fn records(&self) -> impl Iterator<Item = &ProofRecord> {
        self.outcomes.iter().filter_map(VerificationOutcome::record)
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.record().is_none()).count()
    }

    pub fn accepted(&self) -> usize {
        self.records().filter(|r| r.accepted).count()
    }

    /// Completed trials whose signal disagrees with the closed-open grid predicate.
    pub fn mismatches<'a>(&'a self, truth: &'a GridCoordinate) -> impl Iterator<Item = &'a ProofRecord> {
        self.records().filter(move |r| {
            let expected = r.queried.is_grid_aligned() && r.queried.in_cell_of(truth);
            (r.public_signal == 1) != expected
        })
    }

    /// Completed trials where verifier acceptance and signal diverge.
    pub fn inconsistent(&self) -> impl Iterator<Item = &ProofRecord> {
        self.records().filter(|r| !r.is_consistent())
    }
}

pub struct FuzzHarness<'a> {
    orchestrator: &'a ProofOrchestrator,
    rng: StdRng,
}

impl<'a> FuzzHarness<'a> {
    pub fn new(orchestrator: &'a ProofOrchestrator) -> Self {
        Self {
            orchestrator,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible trial sequence.
    pub fn with_seed(orchestrator: &'a ProofOrchestrator, seed: u64) -> Self {
        Self {
            orchestrator,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub async fn fuzz(
        &mut self,
        binding: &VerifierBinding,
        truth: &GridCoordinate,
        trials: usize,
    ) -> FuzzReport {
        let mut report = FuzzReport {
            outcomes: Vec::with_capacity(trials),
        };
        for _ in 0..trials {
            let query = sample_query(&mut self.rng, truth);
            report
                .outcomes
                .push(self.orchestrator.verify(binding, &query).await);
        }
        info!(
            id = %binding.contribution_id,
            trials,
            accepted = report.accepted(),
            failures = report.failures(),
            mismatches = report.mismatches(truth).count(),
            "Fuzzing finished"
        );
        report
    }
}
