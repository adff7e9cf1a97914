//! Lifecycle and failure tests for DataConstructor.
//!
//! Tests cover:
//! - Configuration and dataset errors reported before any thread starts
//! - Cooperative stop (between epochs, with blocked producers, via Drop)
//! - Construction failures surfacing to both consumer sides
//! - Completion-order delivery of training batches

mod common;
use common::{
    materialized, positive_pairs, random_dataset, small_config, FailingSampler, JitterSampler,
    LookupFailsSampler, PanickingSampler, TEST_SEED,
};
use ncf_pipeline::{
    pipeline::ConstructorConfig, DataConstructor, InteractionSet, RecommendationDataset,
};

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn config() -> ConstructorConfig {
    ConstructorConfig {
        max_epochs: 2,
        train_batch_size: Some(10),
        num_train_negatives: 2,
        eval_batch_size: Some(8),
        num_eval_negatives: 3,
        ..small_config()
    }
}

// ============================================================================
// 1. Fail-fast validation
// ============================================================================

#[test]
fn test_indivisible_eval_batch_size_is_rejected() -> Result<()> {
    let config = ConstructorConfig {
        eval_batch_size: Some(10),
        num_eval_negatives: 3,
        ..config()
    };
    let err = DataConstructor::new(random_dataset(4, 8, 2, TEST_SEED)?, config, materialized())
        .err()
        .expect("configuration should be rejected");
    assert!(format!("{:#}", err).contains("Eval batch size 10 is not divisible by 4"));
    Ok(())
}

#[test]
fn test_catalogue_too_large_for_table_is_rejected() -> Result<()> {
    let num_items = u16::MAX as usize;
    let dataset = RecommendationDataset::new(
        1,
        num_items,
        InteractionSet::from_pairs([(0, 0)]),
        InteractionSet::from_pairs([(0, 1)]),
    )?;
    let err = DataConstructor::new(dataset, config(), materialized())
        .err()
        .expect("catalogue should be rejected");
    assert!(format!("{:#}", err).contains("materialized sampler rejected the dataset"));
    Ok(())
}

#[test]
fn test_user_without_negatives_is_rejected_at_load_time() {
    let train = InteractionSet::from_pairs([(0, 0), (0, 1), (0, 2), (1, 0)]);
    let eval = InteractionSet::from_pairs([(0, 0), (1, 1)]);
    let err = RecommendationDataset::new(2, 3, train, eval).unwrap_err();
    assert!(err.to_string().contains("User 0 has interacted with all 3 items"));
}

// ============================================================================
// 2. Stop behavior
// ============================================================================

#[test]
fn test_stop_between_epochs_ends_construction() -> Result<()> {
    let config = ConstructorConfig {
        max_epochs: 1_000,
        handoff_capacity: Some(2),
        ..config()
    };
    let mut constructor =
        DataConstructor::new(random_dataset(10, 12, 2, TEST_SEED)?, config, materialized())?;
    let per_epoch = constructor.train_batches_per_epoch();
    constructor.start()?;

    assert_eq!(constructor.training_batches()?.count(), per_epoch);
    constructor.stop();
    assert!(constructor.is_stopped());
    constructor.join()?;

    // Only what was already queued remains, then the queue reports the end.
    let mut drained = 0;
    let mut ended_with_error = false;
    for batch in constructor.training_batches()? {
        match batch {
            Ok(_) => drained += 1,
            Err(_) => ended_with_error = true,
        }
    }
    assert!(drained <= 2, "drained {} batches after stop", drained);
    assert!(ended_with_error);
    Ok(())
}

#[test]
fn test_stop_before_eval_reports_missing_eval() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = ConstructorConfig {
        num_workers: 1,
        handoff_capacity: Some(1),
        ..config()
    };
    let mut constructor = DataConstructor::new(
        random_dataset(20, 12, 3, TEST_SEED)?,
        config,
        Box::new(JitterSampler::new(calls.clone())),
    )?;
    constructor.start()?;

    // Nothing is consumed, so the first epoch cannot finish before stop.
    thread::sleep(Duration::from_millis(20));
    constructor.stop();
    constructor.join()?;
    assert!(constructor.eval_batches().is_err());
    Ok(())
}

#[test]
fn test_drop_stops_running_construction() -> Result<()> {
    let config = ConstructorConfig {
        max_epochs: 1_000,
        handoff_capacity: Some(1),
        ..config()
    };
    let mut constructor =
        DataConstructor::new(random_dataset(10, 12, 2, TEST_SEED)?, config, materialized())?;
    constructor.start()?;
    thread::sleep(Duration::from_millis(20));
    // Must not hang even though producers are blocked on a full queue.
    drop(constructor);
    Ok(())
}

// ============================================================================
// 3. Failure surfacing
// ============================================================================

#[test]
fn test_sampling_failure_reaches_both_consumers() -> Result<()> {
    let mut constructor = DataConstructor::new(
        random_dataset(6, 10, 2, TEST_SEED)?,
        config(),
        Box::new(FailingSampler),
    )?;
    constructor.start()?;

    let results: Vec<_> = constructor.training_batches()?.collect();
    let err = results
        .into_iter()
        .find_map(Result::err)
        .expect("training consumer should see the failure");
    assert!(format!("{:#}", err).contains("negative pool exhausted"));

    let eval_err = constructor.eval_batches().unwrap_err();
    assert!(format!("{:#}", eval_err).contains("negative pool exhausted"));

    let join_err = constructor.join().unwrap_err();
    assert!(format!("{:#}", join_err).contains("negative pool exhausted"));
    Ok(())
}

#[test]
fn test_worker_panic_reaches_both_consumers() -> Result<()> {
    let mut constructor = DataConstructor::new(
        random_dataset(6, 10, 2, TEST_SEED)?,
        config(),
        Box::new(PanickingSampler),
    )?;
    constructor.start()?;

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let training_error = constructor
            .training_batches()
            .ok()
            .and_then(|mut batches| batches.find_map(Result::err))
            .map(|err| format!("{:#}", err));
        let eval_failed = constructor.eval_batches().is_err();
        let join_failed = constructor.join().is_err();
        let _ = done_tx.send((training_error, eval_failed, join_failed));
    });

    let (training_error, eval_failed, join_failed) = done_rx
        .recv_timeout(Duration::from_secs(10))
        .context("consumers still blocked after a worker panic")?;
    let training_error = training_error.expect("training consumer should see the failure");
    assert!(training_error.contains("panicked"));
    assert!(training_error.contains("negative table corrupted"));
    assert!(eval_failed);
    assert!(join_failed);
    Ok(())
}

#[test]
fn test_lookup_failure_reaches_training_consumer() -> Result<()> {
    let mut constructor = DataConstructor::new(
        random_dataset(6, 10, 2, TEST_SEED)?,
        config(),
        Box::new(LookupFailsSampler),
    )?;
    constructor.start()?;

    let mut batches = constructor.training_batches()?;
    let err = batches
        .next()
        .expect("iterator should yield the failure")
        .unwrap_err();
    assert!(format!("{:#}", err).contains("lookup storage unavailable"));
    assert!(batches.next().is_none());
    assert!(constructor.eval_batches().is_err());
    Ok(())
}

#[test]
fn test_consumers_before_start_fail() -> Result<()> {
    let constructor =
        DataConstructor::new(random_dataset(6, 10, 2, TEST_SEED)?, config(), materialized())?;
    assert!(constructor.training_batches().is_err());
    assert!(constructor.eval_batches().is_err());
    Ok(())
}

// ============================================================================
// 4. Delivery order
// ============================================================================

/// Training batches are handed over in worker completion order, not batch
/// index order. Consumers only rely on each epoch's contents, which this
/// checks regardless of arrival order.
#[test]
fn test_training_batches_arrive_in_completion_order() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let dataset = random_dataset(16, 20, 3, TEST_SEED)?;
    let mut expected: Vec<_> = positive_pairs(&dataset).into_iter().collect();
    expected.sort_unstable();

    let config = ConstructorConfig {
        max_epochs: 2,
        // 48 positives x 3 = 144 indices, 12 per batch.
        train_batch_size: Some(12),
        num_workers: 4,
        ..config()
    };
    let mut constructor =
        DataConstructor::new(dataset, config, Box::new(JitterSampler::new(calls.clone())))?;
    assert_eq!(constructor.train_batches_per_epoch(), 12);
    constructor.start()?;

    for _ in 0..2 {
        let mut seen: Vec<_> = Vec::new();
        for batch in constructor.training_batches()? {
            seen.extend(
                batch?
                    .examples()
                    .filter(|&(_, _, label)| label == 1)
                    .map(|(user, item, _)| (user, item)),
            );
        }
        seen.sort_unstable();
        assert_eq!(seen, expected);
    }
    assert!(calls.load(Ordering::SeqCst) > 0);
    constructor.join()?;
    Ok(())
}

#[test]
fn test_summary_reports_sizing() -> Result<()> {
    let constructor =
        DataConstructor::new(random_dataset(5, 10, 2, TEST_SEED)?, config(), materialized())?;
    let summary = constructor.summary();
    assert_eq!(summary.num_users, 5);
    assert_eq!(summary.train_positive_count, 10);
    // 30 indices in batches of 10.
    assert_eq!(summary.train_batches_per_epoch, 3);
    // 5 eval users, 2 per batch.
    assert_eq!(summary.eval_batches_per_epoch, 3);
    assert!(constructor.to_string().contains("Positive count:          10"));
    Ok(())
}
