use std::time::Duration;

use crate::support::{
    helpers::{
        assert_is_contiguous, counter_version, fast_config, init_tracing, wait_until,
        wait_until_async,
    },
    memory_chain::MemoryChain,
    recording_store::RecordingStore,
};
use anyhow::{Context, Result};
use forkwatch::{
    BlockVelocity, IndexState, IndexingStatus, NotInitializedError, SetupTarget, Watcher,
};
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(5);

fn sum_to(n: u64) -> u64 {
    n * (n + 1) / 2
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn indexes_the_whole_chain_and_runs_effects() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(12);
    chain.set_last_irreversible(12);
    let store = RecordingStore::default();
    let (version, effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    assert_eq!(watcher.status(), IndexingStatus::Initial);
    assert!(watcher.start());
    assert!(!watcher.start(), "second start must be rejected");

    wait_until("all blocks applied", TIMEOUT, || store.applied_numbers().len() == 12).await?;
    assert_is_contiguous(&store.applied_numbers(), 1, 12);
    assert_eq!(store.lock().total, sum_to(12));
    assert_eq!(store.cursor().block_hash, "a-12");
    assert_eq!(store.cursor().last_irreversible_block_number, 12);

    wait_until("every effect ran", TIMEOUT, || effects.lock().unwrap().len() == 12).await?;
    let mut ran = effects.lock().unwrap().clone();
    ran.sort_unstable();
    assert_is_contiguous(&ran, 1, 12);

    assert_eq!(watcher.status(), IndexingStatus::Indexing);
    assert_eq!(watcher.telemetry().processed_blocks(), 12);

    let info = watcher.info().await;
    assert_eq!(info.reader.head_block_number, 12);
    assert_eq!(info.handler.last_processed_block_number, 12);
    assert_eq!(info.watcher.indexing_status, IndexingStatus::Indexing);
    let json = serde_json::to_value(&info)?;
    assert_eq!(json["watcher"]["indexingStatus"], "indexing");
    assert!(json["watcher"].get("currentBlockVelocity").is_some());
    assert!(json["watcher"].get("error").is_none());

    watcher.stop().await?;
    assert_ne!(watcher.status(), IndexingStatus::Indexing);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rolls_back_and_follows_a_fork() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(10);
    chain.set_last_irreversible(3);
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    watcher.start();
    wait_until("original chain applied", TIMEOUT, || store.applied_numbers().len() == 10).await?;

    chain.fork_from(7, 5, "b");
    wait_until("forked chain applied", TIMEOUT, || {
        store.applied_hash(12).as_deref() == Some("b-12")
    })
    .await?;

    assert_is_contiguous(&store.applied_numbers(), 1, 12);
    for number in 1..=7 {
        assert_eq!(store.applied_hash(number), Some(format!("a-{number}")));
    }
    for number in 8..=12 {
        assert_eq!(store.applied_hash(number), Some(format!("b-{number}")));
    }
    assert_eq!(store.rollbacks(), vec![7]);
    assert_eq!(store.lock().total, sum_to(12));
    assert_eq!(watcher.telemetry().rollbacks(), 1);

    watcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_holds_indexing_until_restarted() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(5);
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    assert!(!watcher.pause(), "pause needs a running watcher");
    watcher.start();
    wait_until("first blocks applied", TIMEOUT, || store.applied_numbers().len() == 5).await?;

    assert!(watcher.pause());
    wait_until("watcher paused", TIMEOUT, || watcher.status() == IndexingStatus::Paused).await?;
    assert!(!watcher.pause());

    chain.extend(3, "a");
    sleep(Duration::from_millis(150)).await;
    assert_eq!(store.applied_numbers().len(), 5, "paused watcher must not index");

    assert!(watcher.start());
    wait_until("new blocks applied", TIMEOUT, || store.applied_numbers().len() == 8).await?;
    assert_is_contiguous(&store.applied_numbers(), 1, 8);

    watcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_resume_recovers_from_failed_cycles() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(6);
    chain.fail_setups(2);
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    watcher.start();
    wait_until("blocks applied after retries", TIMEOUT, || store.applied_numbers().len() == 6).await?;

    assert_eq!(watcher.telemetry().snapshot().cycle_errors, 2);
    assert!(watcher.error().is_none(), "a successful cycle clears the error");
    assert_eq!(watcher.status(), IndexingStatus::Indexing);

    chain.fail_requests(1);
    chain.extend(2, "a");
    wait_until("blocks applied after a request failure", TIMEOUT, || {
        store.applied_numbers().len() == 8
    })
    .await?;
    assert_eq!(watcher.telemetry().snapshot().cycle_errors, 3);

    watcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_cycle_stops_without_auto_resume() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(4);
    chain.fail_setups(1);
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();
    let config = fast_config().auto_resume(false).build()?;

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], config)?;
    watcher.start();
    wait_until("watcher stopped", TIMEOUT, || watcher.status() == IndexingStatus::Stopped).await?;

    let error = watcher.error().expect("stopped watcher keeps its error");
    let not_initialized = error
        .downcast_ref::<NotInitializedError>()
        .expect("setup failure should be wrapped");
    assert_eq!(not_initialized.target(), SetupTarget::Reader);
    assert!(store.applied_numbers().is_empty());

    let info = watcher.info().await;
    let message = info.watcher.error.expect("info reports the error");
    assert!(message.contains("chain endpoint unreachable"), "{message}");

    assert!(watcher.start(), "a stopped watcher can be restarted");
    wait_until("blocks applied after restart", TIMEOUT, || store.applied_numbers().len() == 4).await?;
    assert!(watcher.error().is_none());

    watcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resumes_from_persisted_cursor() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(10);
    let store = RecordingStore::resuming_from(IndexState {
        block_number: 5,
        block_hash: chain.hash_of(5).unwrap_or_default(),
        ..IndexState::default()
    });
    let (version, _effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    watcher.start();
    wait_until("remaining blocks applied", TIMEOUT, || {
        store.applied_numbers().last() == Some(&10)
    })
    .await?;

    assert_is_contiguous(&store.applied_numbers(), 6, 10);
    assert_eq!(watcher.telemetry().snapshot().seeks, 1);
    assert!(store.rollbacks().is_empty());

    watcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_applies_updaters_but_skips_effects_for_the_first_cycle() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(5);
    let store = RecordingStore::default();
    let (version, effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    assert!(watcher.replay());
    assert!(!watcher.replay());
    wait_until("replayed blocks applied", TIMEOUT, || store.applied_numbers().len() == 5).await?;
    assert!(store.cursor().is_replay);
    assert_eq!(store.rollbacks(), vec![0], "replay from the earliest block rolls back first");

    chain.extend(2, "a");
    wait_until("live blocks applied", TIMEOUT, || store.applied_numbers().len() == 7).await?;
    wait_until("live effects ran", TIMEOUT, || effects.lock().unwrap().len() == 2).await?;

    let mut ran = effects.lock().unwrap().clone();
    ran.sort_unstable();
    assert_eq!(ran, vec![6, 7]);
    assert!(!store.cursor().is_replay);

    watcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_joins_the_polling_task_and_allows_restart() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(3);
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    watcher.start();
    wait_until("blocks applied", TIMEOUT, || store.applied_numbers().len() == 3).await?;

    watcher.stop().await?;
    assert_eq!(watcher.status(), IndexingStatus::Paused);
    watcher.stop().await?;

    chain.extend(2, "a");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(store.applied_numbers().len(), 3, "stopped watcher must not index");

    assert!(watcher.start());
    let restarted = &watcher;
    wait_until_async("reader caught up", TIMEOUT, || async move {
        restarted.reader().lock().await.current_block_number() == 5
    })
    .await?;
    wait_until("restarted watcher applied new blocks", TIMEOUT, || {
        store.applied_numbers().len() == 5
    })
    .await?;

    watcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_interrupts_a_long_catch_up() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(10_000);
    chain.set_block_delay(Duration::from_millis(5));
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    watcher.start();
    wait_until("catch-up under way", TIMEOUT, || store.applied_numbers().len() >= 5).await?;

    let started = std::time::Instant::now();
    timeout(Duration::from_secs(2), watcher.stop())
        .await
        .context("stop should not wait for the reader to reach head")??;
    assert!(started.elapsed() < Duration::from_secs(2));

    let applied = store.applied_numbers();
    assert!(applied.len() < 10_000, "catch-up must be abandoned");
    assert_is_contiguous(&applied, 1, applied.len() as u64);
    assert_eq!(watcher.status(), IndexingStatus::Paused);
    assert!(watcher.error().is_none(), "shutdown is not a cycle failure");
    assert_eq!(watcher.telemetry().snapshot().cycle_errors, 0);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.applied_numbers().len(), applied.len(), "no blocks after stop");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_during_catch_up_drops_velocity_samples() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(10_000);
    chain.set_block_delay(Duration::from_millis(2));
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let watcher = Watcher::from_parts(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    watcher.start();
    wait_until("velocity sampled", TIMEOUT, || {
        store.applied_numbers().len() >= 5 && watcher.velocity().max_block_velocity > 0.0
    })
    .await?;

    assert!(watcher.pause());
    wait_until("watcher paused", TIMEOUT, || watcher.status() == IndexingStatus::Paused).await?;
    assert!(store.applied_numbers().len() < 10_000, "pause must land mid catch-up");
    assert_eq!(watcher.velocity(), BlockVelocity::default());
    assert_eq!(watcher.info().await.watcher.velocity, BlockVelocity::default());

    watcher.stop().await?;
    Ok(())
}
