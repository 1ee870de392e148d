use std::time::Duration;

use crate::support::{
    helpers::{assert_is_contiguous, counter_version, fast_config, init_tracing, wait_until},
    memory_chain::MemoryChain,
    recording_store::RecordingStore,
};
use anyhow::{Context, Result};
use forkwatch::{IndexingStatus, Runner};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_exits_when_its_token_is_cancelled() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(8);
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let mut runner = Runner::new(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    let token = runner.cancellation_token();
    let observed = store.clone();
    let canceller = tokio::spawn(async move {
        let caught_up = wait_until("runner indexed the chain", Duration::from_secs(5), || {
            observed.applied_numbers().len() == 8
        })
        .await;
        token.cancel();
        caught_up
    });

    timeout(Duration::from_secs(10), runner.run_until_ctrl_c())
        .await
        .context("runner should stop once its token is cancelled")??;
    canceller.await??;

    assert_is_contiguous(&store.applied_numbers(), 1, 8);
    assert_eq!(runner.watcher().status(), IndexingStatus::Paused);
    assert!(
        !runner.cancellation_token().is_cancelled(),
        "a fresh token is installed after shutdown"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_can_be_restarted_after_stop() -> Result<()> {
    init_tracing();
    let chain = MemoryChain::new(3);
    let store = RecordingStore::default();
    let (version, _effects) = counter_version();

    let mut runner = Runner::new(chain.clone(), store.clone(), vec![version], fast_config().build()?)?;
    runner.start()?;
    runner.start()?;
    wait_until("first blocks applied", Duration::from_secs(5), || {
        store.applied_numbers().len() == 3
    })
    .await?;

    runner.stop().await?;
    runner.stop().await?;

    chain.extend(2, "a");
    runner.start()?;
    wait_until("restarted runner applied new blocks", Duration::from_secs(5), || {
        store.applied_numbers().len() == 5
    })
    .await?;
    assert_eq!(runner.watcher().status(), IndexingStatus::Indexing);

    runner.stop().await?;
    Ok(())
}
