use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use seine::log::discard;
use seine::prelude::{
    EngineFlags, Entity, EthereumAdapter, LoggerFactory, ProviderError, Store, SyncOp,
};
use seine::util::queue::PendingQueue;
use seine_mock::{MockEthereumAdapter, MockStore, RecordingProcessor};

use crate::engine::{Engine, EngineOptions};
use crate::fetcher::{fetch_range, txs_from_range, BlockRequest, FetchContext};
use crate::ingestor::BlockIngestor;
use crate::migrations::{Migration, MigrationsIndex};
use crate::staging::StagingCache;

const CHAIN: u64 = 1;

struct Harness {
    adapter: Arc<MockEthereumAdapter>,
    store: Arc<MockStore>,
    processor: Arc<RecordingProcessor>,
    engine: Arc<Engine>,
    staging: Arc<StagingCache>,
    ingestor: Arc<BlockIngestor>,
    _dir: tempfile::TempDir,
}

fn harness(start_block: u64, migrations: Vec<Migration>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockEthereumAdapter::new(CHAIN));
    let store = Arc::new(MockStore::new());
    let processor = Arc::new(RecordingProcessor::new());

    let flags = EngineFlags {
        collect_tx_receipts: true,
        ..EngineFlags::default()
    };
    let engine = Arc::new(Engine::new(
        discard(),
        store.clone() as Arc<dyn Store>,
        EngineOptions {
            flags: flags.clone(),
            syncs: vec![SyncOp {
                id: "transfers".to_owned(),
                chain_id: CHAIN,
                start_block,
            }],
            start_blocks: HashMap::from([(CHAIN, start_block)]),
            concurrency: 4,
            block_timeout: Duration::from_millis(300),
            queue_poll_interval: Duration::from_millis(10),
        },
    ));
    let staging = Arc::new(
        StagingCache::new(discard(), dir.path().to_path_buf(), flags).unwrap(),
    );
    let ingestor = Arc::new(BlockIngestor::new(
        &LoggerFactory::new(discard()),
        engine.clone(),
        staging.clone(),
        Arc::new(MigrationsIndex::index(migrations)),
        processor.clone(),
        vec![adapter.clone() as Arc<dyn EthereumAdapter>],
    ));

    Harness {
        adapter,
        store,
        processor,
        engine,
        staging,
        ingestor,
        _dir: dir,
    }
}

fn spawn_run(harness: &Harness) -> tokio::task::JoinHandle<Result<(), anyhow::Error>> {
    let ingestor = harness.ingestor.clone();
    tokio::spawn(async move { ingestor.run().await })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn blocks_are_processed_in_order_and_the_cursor_advances() {
    let harness = harness(100, Vec::new());
    for number in 100..=102 {
        harness.adapter.add_block(number, 2);
    }

    let run = spawn_run(&harness);

    harness.adapter.announce_block(100);
    harness.adapter.announce_block(101);
    harness.adapter.announce_block(102);

    wait_until(|| harness.processor.processed_numbers(CHAIN) == vec![100, 101, 102]).await;
    wait_until(|| harness.engine.latest_block(CHAIN) == Some(102)).await;

    // The valid sync ops were handed to the processor.
    assert_eq!(harness.processor.syncs_seen(102), Some(1));

    harness.adapter.end_subscription();
    run.await.unwrap().unwrap();

    // Nothing left in flight and the cursor was persisted unlocked.
    let cursor = harness.store.entity("__meta__", "chain_1").unwrap();
    assert_eq!(cursor.get("number"), Some(&json!(102)));
    assert_eq!(cursor.get("locked"), Some(&json!(false)));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_leap_in_block_numbers_is_gap_filled_in_order() {
    let harness = harness(100, Vec::new());
    for number in 100..=105 {
        harness.adapter.add_block(number, 1);
    }

    let run = spawn_run(&harness);

    harness.adapter.announce_block(100);
    harness.adapter.announce_block(105);

    wait_until(|| {
        harness.processor.processed_numbers(CHAIN) == vec![100, 101, 102, 103, 104, 105]
    })
    .await;

    harness.adapter.end_subscription();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failing_handler_restacks_the_block_ahead_of_its_successors() {
    let harness = harness(200, Vec::new());
    harness.adapter.add_block(200, 1);
    harness.adapter.add_block(201, 1);
    harness.processor.fail_block(200, 1);

    let run = spawn_run(&harness);

    harness.adapter.announce_block(200);
    harness.adapter.announce_block(201);

    // 200 fails once, is retried before 201, and both succeed.
    wait_until(|| harness.processor.processed_numbers(CHAIN) == vec![200, 201]).await;

    harness.adapter.end_subscription();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_provider_faults_are_retried_while_staging() {
    let harness = harness(100, Vec::new());
    harness.adapter.add_block(100, 1);
    harness.adapter.fail_block_fetches(100, 2);

    let run = spawn_run(&harness);
    harness.adapter.announce_block(100);

    wait_until(|| harness.processor.processed_numbers(CHAIN) == vec![100]).await;
    assert!(harness.adapter.block_fetch_count() >= 3);

    harness.adapter.end_subscription();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_slow_handler_is_cancelled_and_the_block_reattempted_first() {
    let harness = harness(100, Vec::new());
    harness.adapter.add_block(100, 1);
    harness.adapter.add_block(101, 1);

    // Well past the 300ms block timeout. The handler is not aborted, so the
    // first run still completes and records before the restack.
    harness.processor.delay_block(100, Duration::from_millis(800));

    let run = spawn_run(&harness);

    harness.adapter.announce_block(100);
    harness.adapter.announce_block(101);

    wait_until(|| harness.processor.processed_numbers(CHAIN) == vec![100, 100, 101]).await;

    harness.adapter.end_subscription();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_provider_errors_detach_and_release_the_chain_lock() {
    let harness = harness(100, Vec::new());
    harness.adapter.add_block(100, 1);

    let run = spawn_run(&harness);

    harness.adapter.announce_block(100);
    wait_until(|| harness.processor.processed_numbers(CHAIN) == vec![100]).await;

    harness
        .adapter
        .announce_error(ProviderError::Network("connection reset".to_owned()));

    let result = run.await.unwrap();
    assert!(result.is_err());

    let cursor = harness.store.entity("__meta__", "chain_1").unwrap();
    assert_eq!(cursor.get("locked"), Some(&json!(false)));
    assert_eq!(cursor.get("number"), Some(&json!(100)));
}

#[tokio::test(flavor = "multi_thread")]
async fn blocks_before_the_start_block_are_skipped() {
    let harness = harness(100, Vec::new());
    harness.adapter.add_block(98, 1);
    harness.adapter.add_block(100, 1);

    let run = spawn_run(&harness);

    harness.adapter.announce_block(98);
    harness.adapter.announce_block(100);

    wait_until(|| harness.processor.processed_numbers(CHAIN) == vec![100]).await;
    assert!(!harness.processor.processed_numbers(CHAIN).contains(&98));

    harness.adapter.end_subscription();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_entity_snapshots_are_preloaded() {
    let migration = Migration {
        name: "rebalance".to_owned(),
        chain_id: CHAIN,
        block: 101,
        entity: "balances".to_owned(),
    };
    let harness = harness(100, vec![migration]);
    harness.adapter.add_block(100, 1);
    harness.adapter.add_block(101, 1);

    harness.store.seed(
        "balances",
        Entity::try_from(json!({"id": "acct1", "amount": 7})).unwrap(),
    );
    harness.store.seed(
        "balances",
        Entity::try_from(json!({"id": "acct2", "amount": 9})).unwrap(),
    );

    let run = spawn_run(&harness);

    harness.adapter.announce_block(100);
    harness.adapter.announce_block(101);

    wait_until(|| harness.processor.processed_numbers(CHAIN) == vec![100, 101]).await;

    assert!(harness.processor.migration_entities_seen(100).is_empty());
    assert_eq!(
        harness.processor.migration_entities_seen(101).get("balances"),
        Some(&2)
    );

    harness.adapter.end_subscription();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_locked_cursor_refuses_a_second_ingestor() {
    let harness = harness(100, Vec::new());
    harness.store.seed(
        "__meta__",
        Entity::try_from(json!({
            "id": "chain_1", "chain_id": 1, "number": 99, "locked": true
        }))
        .unwrap(),
    );

    let result = harness.ingestor.run().await;
    assert!(result.unwrap_err().to_string().contains("locked"));
}

#[tokio::test]
async fn staging_writes_all_artefacts_and_reads_them_back() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockEthereumAdapter::new(CHAIN));
    adapter.add_block(7, 2);

    let staging = StagingCache::new(
        discard(),
        dir.path().to_path_buf(),
        EngineFlags {
            collect_tx_receipts: true,
            ..EngineFlags::default()
        },
    )
    .unwrap();

    let adapter = adapter as Arc<dyn EthereumAdapter>;
    let written = staging
        .save_block_and_receipts(&adapter, CHAIN, 7, 4)
        .await
        .unwrap();
    assert_eq!(written.receipts.len(), 2);

    let read = staging.read_block_and_receipts(CHAIN, 7).await.unwrap();
    assert_eq!(read.number(), Some(7));
    assert_eq!(read.receipts.len(), 2);

    assert!(dir.path().join("blocks/1-7.json").exists());
    assert!(dir.path().join("blockAndReceipts/1-7.json").exists());
    assert_eq!(
        std::fs::read_dir(dir.path().join("transactions"))
            .unwrap()
            .count(),
        2
    );
}

#[tokio::test]
async fn cleanup_mode_stages_only_the_combined_artefact() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockEthereumAdapter::new(CHAIN));
    adapter.add_block(7, 2);

    let staging = StagingCache::new(
        discard(),
        dir.path().to_path_buf(),
        EngineFlags {
            cleanup: true,
            collect_tx_receipts: true,
            ..EngineFlags::default()
        },
    )
    .unwrap();

    let adapter = adapter as Arc<dyn EthereumAdapter>;
    staging
        .save_block_and_receipts(&adapter, CHAIN, 7, 4)
        .await
        .unwrap();

    assert!(!dir.path().join("blocks/1-7.json").exists());
    assert_eq!(
        std::fs::read_dir(dir.path().join("transactions"))
            .unwrap()
            .count(),
        0
    );
    assert!(dir.path().join("blockAndReceipts/1-7.json").exists());

    staging.remove(CHAIN, 7).await;
    assert!(!dir.path().join("blockAndReceipts/1-7.json").exists());
}

#[tokio::test]
async fn unreadable_staged_blocks_are_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let staging = StagingCache::new(
        discard(),
        dir.path().to_path_buf(),
        EngineFlags::default(),
    )
    .unwrap();

    assert!(staging.read_block_and_receipts(CHAIN, 404).await.is_err());

    // A torn artefact parses as an error too, never as a partial block.
    std::fs::write(dir.path().join("blockAndReceipts/1-405.json"), b"{\"blo").unwrap();
    assert!(staging.read_block_and_receipts(CHAIN, 405).await.is_err());
}

#[tokio::test]
async fn range_fetches_prefer_the_staging_area() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockEthereumAdapter::new(CHAIN));
    for number in 10..=12 {
        adapter.add_block(number, 1);
    }

    let staging = Arc::new(
        StagingCache::new(
            discard(),
            dir.path().to_path_buf(),
            EngineFlags {
                collect_tx_receipts: true,
                ..EngineFlags::default()
            },
        )
        .unwrap(),
    );

    // Pre-stage the whole range, then drain the request stack without
    // receipts: the network must stay untouched.
    let dyn_adapter = adapter.clone() as Arc<dyn EthereumAdapter>;
    for number in 10..=12 {
        staging
            .save_block_and_receipts(&dyn_adapter, CHAIN, number, 2)
            .await
            .unwrap();
    }
    let fetches_after_staging = adapter.block_fetch_count();

    let ctx = FetchContext {
        logger: discard(),
        adapter: dyn_adapter,
        staging,
        chain_id: CHAIN,
        silent: true,
        collect_blocks: false,
    };
    let req_stack = PendingQueue::<BlockRequest>::new();
    let results = tokio::sync::Mutex::new(std::collections::BTreeMap::new());

    txs_from_range(&ctx, 10, 12, false, &req_stack, &results).await;

    let results = results.into_inner();
    assert_eq!(
        results.keys().copied().collect::<Vec<_>>(),
        vec![10, 11, 12]
    );
    assert_eq!(adapter.block_fetch_count(), fetches_after_staging);
}

#[tokio::test]
async fn whole_intervals_are_fetched_across_sub_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockEthereumAdapter::new(CHAIN));
    for number in 0..25 {
        adapter.add_block(number, 1);
    }
    adapter.fail_block_fetches(13, 1);

    let staging = Arc::new(
        StagingCache::new(discard(), dir.path().to_path_buf(), EngineFlags::default()).unwrap(),
    );

    let ctx = FetchContext {
        logger: discard(),
        adapter: adapter.clone() as Arc<dyn EthereumAdapter>,
        staging,
        chain_id: CHAIN,
        silent: true,
        collect_blocks: false,
    };

    let fetched = fetch_range(&ctx, 0, 24, false, 4).await;
    assert_eq!(fetched.len(), 25);
    assert_eq!(fetched.keys().copied().collect::<Vec<_>>(), (0..25).collect::<Vec<_>>());
}

#[tokio::test]
async fn failed_range_fetches_go_back_on_the_request_stack() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockEthereumAdapter::new(CHAIN));
    adapter.add_block(20, 1);
    adapter.fail_block_fetches(20, 2);

    let staging = Arc::new(
        StagingCache::new(discard(), dir.path().to_path_buf(), EngineFlags::default()).unwrap(),
    );

    let ctx = FetchContext {
        logger: discard(),
        adapter: adapter.clone() as Arc<dyn EthereumAdapter>,
        staging,
        chain_id: CHAIN,
        silent: true,
        collect_blocks: false,
    };
    let req_stack = PendingQueue::<BlockRequest>::new();
    let results = tokio::sync::Mutex::new(std::collections::BTreeMap::new());

    txs_from_range(&ctx, 20, 20, true, &req_stack, &results).await;

    let results = results.into_inner();
    assert_eq!(results.len(), 1);
    assert_eq!(results[&20].receipts.len(), 1);
    // Two injected failures, one success.
    assert_eq!(adapter.block_fetch_count(), 3);
}
