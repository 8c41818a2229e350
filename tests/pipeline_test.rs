mod common;

use common::{wallet, Fixture, SCENARIO};
use ethers::signers::Signer;
use geogrid_zkp::{
    error::{LedgerError, LifecycleError, LinkError, ToolchainError, VerificationError},
    fuzz::DEFAULT_TRIALS,
    ledger::{all_events, EventKind},
    pipeline::ContributionOutcome,
    ContentStore, ContributionStatus, CoordinateBook, FuzzHarness, GridCoordinate, Ledger,
    ReviewResult, TrustedSetup, VerificationOutcome,
};
use geogrid_zkp::setup::PROOFS_DIR;

#[tokio::test]
async fn test_scenario_queries_against_deployed_verifier() {
    let fx = Fixture::new();
    let participant = wallet();
    let truth = GridCoordinate::parse(SCENARIO).unwrap();
    let contribution = fx.reviewed(&participant, ReviewResult::Approved).await;
    let keys = fx.keys_for(&contribution, &truth).await;

    let binding = fx
        .lifecycle()
        .deploy_and_link(&keys, &contribution, &participant)
        .await
        .unwrap();
    assert_eq!(binding.contribution_id, contribution.id);
    assert_eq!(binding.participant, participant.address());
    assert_eq!(
        fx.ledger.contribution(contribution.id).unwrap().status,
        ContributionStatus::VerifierLinked
    );

    let orchestrator = fx.orchestrator();
    let inside = orchestrator
        .verify(&binding, &GridCoordinate::new(-23, 6, 18, 18))
        .await;
    assert_eq!(inside.public_signal(), 1);
    assert!(inside.accepted());
    assert_eq!(
        fx.ledger.contribution(contribution.id).unwrap().status,
        ContributionStatus::Verified
    );

    for query in [GridCoordinate::new(-23, 12, 18, 18), GridCoordinate::new(-22, 6, 18, 18)] {
        let outcome = orchestrator.verify(&binding, &query).await;
        assert_eq!(outcome.public_signal(), 0, "{query}");
        assert!(!outcome.accepted(), "{query}");
        assert!(outcome.record().unwrap().is_consistent());
    }
}

#[tokio::test]
async fn test_second_link_is_rejected_and_first_binding_kept() {
    let fx = Fixture::new();
    let participant = wallet();
    let truth = GridCoordinate::parse(SCENARIO).unwrap();
    let contribution = fx.reviewed(&participant, ReviewResult::Approved).await;
    let keys = fx.keys_for(&contribution, &truth).await;
    let lifecycle = fx.lifecycle();

    let first = lifecycle
        .deploy_and_link(&keys, &contribution, &participant)
        .await
        .unwrap();
    let err = lifecycle
        .deploy_and_link(&keys, &contribution, &participant)
        .await
        .unwrap_err();
    match err {
        LifecycleError::Link {
            orphaned: None,
            source: LinkError::AlreadyBound { existing, .. },
        } => assert_eq!(existing, first.verifier),
        other => panic!("unexpected error: {other}"),
    }

    let bindings: Vec<_> = fx
        .ledger
        .events(EventKind::VerifierUpdated)
        .await
        .unwrap()
        .iter()
        .filter_map(|e| e.binding())
        .collect();
    assert_eq!(bindings, vec![first]);
}

#[tokio::test]
async fn test_non_owner_is_rejected_before_deploy() {
    let fx = Fixture::new();
    let participant = wallet();
    let contribution = fx.reviewed(&participant, ReviewResult::Approved).await;
    let keys = fx
        .keys_for(&contribution, &GridCoordinate::parse(SCENARIO).unwrap())
        .await;

    let err = fx
        .lifecycle()
        .deploy_and_link(&keys, &contribution, &wallet())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Link {
            orphaned: None,
            source: LinkError::NotOwner { .. }
        }
    ));
    assert!(fx.ledger.verifier_circuit(ethers::utils::get_contract_address(fx.deployer.address(), 0u64)).is_err());
}

#[tokio::test]
async fn test_unreviewed_link_leaves_orphaned_verifier() {
    let fx = Fixture::new();
    let participant = wallet();
    let contribution = fx.submitted(&participant).await;
    let keys = fx
        .keys_for(&contribution, &GridCoordinate::parse(SCENARIO).unwrap())
        .await;

    let err = fx
        .lifecycle()
        .deploy_and_link(&keys, &contribution, &participant)
        .await
        .unwrap_err();
    let LifecycleError::Link {
        orphaned: Some(verifier),
        source: LinkError::Rejected { source, .. },
    } = err
    else {
        panic!("unexpected error: {err}");
    };
    assert!(matches!(source, LedgerError::InvalidStatus { .. }));
    assert_eq!(fx.ledger.verifier_circuit(verifier).unwrap(), keys.id);
    assert_eq!(
        fx.ledger.contribution(contribution.id).unwrap().status,
        ContributionStatus::CoordinatesUpdated
    );
}

#[tokio::test]
async fn test_failures_do_not_halt_verify_all() {
    let fx = Fixture::new();
    let lifecycle = fx.lifecycle();
    let mut bindings = Vec::new();
    // Distinct cells, so every circuit publishes its own witness generator.
    for i in 0..3 {
        let participant = wallet();
        let contribution = fx.reviewed(&participant, ReviewResult::Approved).await;
        let keys = fx
            .keys_for(&contribution, &GridCoordinate::new(-23 + i, 11, 18, 22))
            .await;
        bindings.push(
            lifecycle
                .deploy_and_link(&keys, &contribution, &participant)
                .await
                .unwrap(),
        );
    }

    // The middle contribution's witness generator disappears from the content store.
    let record = fx
        .store
        .record(&geogrid_zkp::CircuitId::from_content_url(&bindings[1].image_url).unwrap())
        .unwrap()
        .unwrap();
    assert!(fx.content.evict(record.witness_cid.as_deref().unwrap()).await);

    let outcomes = fx
        .orchestrator()
        .verify_all(&GridCoordinate::new(-23, 6, 18, 18))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    let signals: Vec<i8> = outcomes.iter().map(|(_, o)| o.public_signal()).collect();
    assert_eq!(signals, vec![1, -1, 0]);
    assert!(outcomes[0].1.accepted());
    assert!(outcomes[2].1.record().unwrap().is_consistent());
    assert!(matches!(
        &outcomes[1].1,
        VerificationOutcome::Failed {
            error: VerificationError::ContentUnavailable(_),
            ..
        }
    ));

    // Out of the declared signal range: every verifier fails, none panic.
    let outcomes = fx
        .orchestrator()
        .verify_all(&GridCoordinate::new(-40000, 0, 18, 18))
        .await
        .unwrap();
    assert!(outcomes.iter().all(|(_, o)| o.public_signal() == -1 && !o.accepted()));
}

#[tokio::test]
async fn test_seeded_fuzz_matches_grid_predicate() {
    let fx = Fixture::new();
    let participant = wallet();
    let truth = GridCoordinate::parse(SCENARIO).unwrap();
    let contribution = fx.reviewed(&participant, ReviewResult::Approved).await;
    let keys = fx.keys_for(&contribution, &truth).await;
    let binding = fx
        .lifecycle()
        .deploy_and_link(&keys, &contribution, &participant)
        .await
        .unwrap();

    let orchestrator = fx.orchestrator();
    let report = FuzzHarness::with_seed(&orchestrator, 11)
        .fuzz(&binding, &truth, DEFAULT_TRIALS)
        .await;
    assert_eq!(report.outcomes.len(), DEFAULT_TRIALS);
    assert_eq!(report.failures(), 0);
    assert_eq!(report.mismatches(&truth).count(), 0);
    assert_eq!(report.inconsistent().count(), 0);
    assert!(report.accepted() > 0);
    assert!(report.accepted() < DEFAULT_TRIALS);
}

#[tokio::test]
async fn test_pipeline_report() {
    let fx = Fixture::new();
    let truth = GridCoordinate::parse(SCENARIO).unwrap();
    let bound_owner = wallet();
    let unknown_owner = wallet();
    let rejected_owner = wallet();
    let missing_coordinate_owner = wallet();

    let bound = fx.reviewed(&bound_owner, ReviewResult::Approved).await;
    let unsigned = fx.reviewed(&unknown_owner, ReviewResult::Approved).await;
    let rejected = fx.reviewed(&rejected_owner, ReviewResult::Rejected).await;
    let uncharted = fx.reviewed(&missing_coordinate_owner, ReviewResult::Approved).await;

    let mut book = CoordinateBook::new();
    book.insert(bound.image_url.clone(), truth);
    book.insert(unsigned.image_url.clone(), truth);
    book.insert(rejected.image_url.clone(), truth);

    let report = fx
        .pipeline()
        .run(
            &book,
            &[bound_owner, rejected_owner, missing_coordinate_owner],
            &GridCoordinate::new(-23, 6, 18, 18),
        )
        .await
        .unwrap();

    assert_eq!(report.contributions.len(), 3);
    assert!(matches!(report.contributions[&bound.id], ContributionOutcome::Bound(_)));
    assert!(matches!(report.contributions[&unsigned.id], ContributionOutcome::Skipped(_)));
    assert!(matches!(report.contributions[&uncharted.id], ContributionOutcome::Skipped(_)));
    assert!(!report.contributions.contains_key(&rejected.id));
    assert_eq!(report.bound(), 1);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.verifications.len(), 1);
    assert_eq!(report.accepted(), 1);

    let events = all_events(fx.ledger.as_ref()).await.unwrap();
    assert_eq!(events.iter().filter(|e| e.kind() == EventKind::VerifierUpdated).count(), 1);
}

#[tokio::test]
async fn test_pipeline_rerun_reuses_artifacts_and_keeps_bindings() {
    let fx = Fixture::new();
    let owner = wallet();
    let truth = GridCoordinate::parse(SCENARIO).unwrap();
    let contribution = fx.reviewed(&owner, ReviewResult::Approved).await;
    let mut book = CoordinateBook::new();
    book.insert(contribution.image_url.clone(), truth);

    let pipeline = fx.pipeline();
    let query = GridCoordinate::new(-23, 6, 18, 18);
    let first = pipeline.run(&book, &[owner.clone()], &query).await.unwrap();
    assert_eq!(first.bound(), 1);

    let second = pipeline.run(&book, &[owner], &query).await.unwrap();
    assert!(matches!(
        second.contributions[&contribution.id],
        ContributionOutcome::LinkFailed(LifecycleError::Link {
            orphaned: None,
            source: LinkError::AlreadyBound { .. }
        })
    ));
    assert_eq!(second.verifications.len(), 1);
    assert!(second.verifications[0].1.accepted());
}

#[tokio::test]
async fn test_changed_book_cannot_rekey_deployed_circuit() {
    let fx = Fixture::new();
    let owner = wallet();
    let contribution = fx.reviewed(&owner, ReviewResult::Approved).await;
    let pipeline = fx.pipeline();
    let inside = GridCoordinate::new(-23, 6, 18, 18);

    let mut book = CoordinateBook::new();
    book.insert(contribution.image_url.clone(), GridCoordinate::parse(SCENARIO).unwrap());
    let first = pipeline.run(&book, &[owner.clone()], &inside).await.unwrap();
    assert_eq!(first.bound(), 1);

    let moved = GridCoordinate::new(-23, 30, 18, 30);
    book.insert(contribution.image_url.clone(), moved);
    let second = pipeline.run(&book, &[owner], &inside).await.unwrap();
    assert!(matches!(
        second.contributions[&contribution.id],
        ContributionOutcome::PrepareFailed(ToolchainError::AlreadyDeployed { .. })
    ));

    // The deployed verifier still answers for the original cell.
    let (binding, outcome) = &second.verifications[0];
    assert_eq!(outcome.public_signal(), 1);
    assert!(outcome.accepted());
    assert!(outcome.record().unwrap().is_consistent());

    let moved_query = fx.orchestrator().verify(binding, &moved).await;
    assert_eq!(moved_query.public_signal(), 0);
    assert!(!moved_query.accepted());
}

#[tokio::test]
async fn test_verifications_leave_no_proof_files() {
    let fx = Fixture::new();
    let participant = wallet();
    let truth = GridCoordinate::parse(SCENARIO).unwrap();
    let contribution = fx.reviewed(&participant, ReviewResult::Approved).await;
    let keys = fx.keys_for(&contribution, &truth).await;
    let binding = fx
        .lifecycle()
        .deploy_and_link(&keys, &contribution, &participant)
        .await
        .unwrap();

    let orchestrator = fx.orchestrator();
    for query in [
        GridCoordinate::new(-23, 6, 18, 18),
        GridCoordinate::new(-23, 12, 18, 18),
        GridCoordinate::new(-40000, 0, 18, 18),
    ] {
        orchestrator.verify(&binding, &query).await;
    }

    let attempts = fx.store.root().join(PROOFS_DIR).join(keys.id.as_str());
    assert_eq!(std::fs::read_dir(attempts).unwrap().count(), 0);
}

#[test]
fn test_missing_trusted_setup_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let err = TrustedSetup::load(dir.path().join("pot14_final.ptau")).unwrap_err();
    assert!(matches!(err, ToolchainError::SetupMissing(_)));
}

#[tokio::test]
async fn test_witness_generator_is_published() {
    let fx = Fixture::new();
    let contribution = fx.reviewed(&wallet(), ReviewResult::Approved).await;
    let keys = fx
        .keys_for(&contribution, &GridCoordinate::parse(SCENARIO).unwrap())
        .await;
    let record = fx.store.record(&keys.id).unwrap().unwrap();
    let cid = record.witness_cid.unwrap();
    let published = fx.content.cat(&cid).await.unwrap();
    assert_eq!(published, std::fs::read(&keys.witness_generator).unwrap());
}
