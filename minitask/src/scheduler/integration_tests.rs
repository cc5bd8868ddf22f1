//! Integration tests for scheduled runs: ordering, caching and completion.

use super::*;
use crate::cache::FingerprintMethod;
use crate::pipeline::PipelineOutcome;
use crate::stages::Stage;
use crate::testing::{
    assert_file_contents, assert_file_missing, counting_stage, delayed_text_stage, failing_stage,
    CacheFixture, SharedBuffer,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

fn upper() -> Stage {
    Stage::map_text("upper", str::to_uppercase)
}

fn cached_options(fixture: &CacheFixture) -> RunOptions {
    RunOptions::new().with_cache(fixture.cache_dir(), FingerprintMethod::Md5)
}

fn tagged(path: &Path, stages: &[Stage]) -> WorkItem {
    Pipeline::from_file(path, stages).with_task_fingerprint("upper-v1").into()
}

/// Sleeps for the number of milliseconds in its input, then echoes it.
fn sleepy() -> Stage {
    Stage::async_fn("sleepy", |input| async move {
        let millis: u64 = String::from_utf8(input)?.trim().parse()?;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok::<_, anyhow::Error>(format!("[{millis}]").into_bytes())
    })
}

fn sleepy_items(inputs: &[PathBuf]) -> Vec<WorkItem> {
    let stages = [sleepy()];
    inputs
        .iter()
        .map(|input| {
            Pipeline::from_file(input, &stages)
                .with_task_fingerprint("sleepy-v1")
                .into()
        })
        .collect()
}

fn write_delays(fixture: &CacheFixture, delays: &[&str]) -> Vec<PathBuf> {
    delays
        .iter()
        .enumerate()
        .map(|(i, delay)| fixture.write_input(&format!("f{i}.txt"), delay))
        .collect()
}

#[tokio::test]
async fn test_output_follows_item_order_not_completion_order() {
    let items: Vec<WorkItem> = (0..6_u64)
        .map(|i| {
            let stage = delayed_text_stage("delay", Duration::from_millis((6 - i) * 15), "|");
            Pipeline::new(&[stage]).input(i.to_string()).into()
        })
        .collect();
    let mut sink = SharedBuffer::new();

    let report = Scheduler::new(RunOptions::new().with_concurrency_limit(3))
        .run(items, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.text(), "0|1|2|3|4|5|");
    assert_eq!(report.executed, 6);
    assert_eq!(report.hits, 0);
    assert_eq!(report.misses, 0);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let stage = {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        Stage::async_fn("gauge", move |input| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(input)
            }
        })
    };
    let stages = [stage];
    let items: Vec<WorkItem> = (0..8)
        .map(|_| Pipeline::new(&stages).input("x").into())
        .collect();
    let mut sink = SharedBuffer::new();

    Scheduler::new(RunOptions::new().with_concurrency_limit(2))
        .run(items, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.text(), "x".repeat(8));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_cache_hit_skips_execution() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "hello");
    let registry = Arc::new(CacheRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut first = SharedBuffer::new();
    let report = Scheduler::new(cached_options(&fixture))
        .with_registry(Arc::clone(&registry))
        .run(
            vec![tagged(&input, &[counting_stage("count", Arc::clone(&runs)), upper()])],
            &mut first,
        )
        .await
        .unwrap();
    assert_eq!(first.text(), "HELLO");
    assert_eq!((report.hits, report.misses, report.executed), (0, 1, 1));

    // the sentinel fails if the pipeline executes instead of replaying
    let mut second = SharedBuffer::new();
    let report = Scheduler::new(cached_options(&fixture))
        .with_registry(registry)
        .run(vec![tagged(&input, &[failing_stage("sentinel")])], &mut second)
        .await
        .unwrap();
    assert_eq!(second.text(), "HELLO");
    assert_eq!((report.hits, report.misses, report.executed), (1, 0, 0));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cache_survives_a_fresh_registry() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "persist");

    Scheduler::new(cached_options(&fixture))
        .run(vec![tagged(&input, &[upper()])], &mut SharedBuffer::new())
        .await
        .unwrap();

    let mut sink = SharedBuffer::new();
    let report = Scheduler::new(cached_options(&fixture))
        .run(vec![tagged(&input, &[failing_stage("sentinel")])], &mut sink)
        .await
        .unwrap();

    assert_eq!(report.hits, 1);
    assert_eq!(sink.text(), "PERSIST");
}

#[tokio::test]
async fn test_modified_input_is_recomputed() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "before");
    let registry = Arc::new(CacheRegistry::new());
    let scheduler = Scheduler::new(cached_options(&fixture)).with_registry(Arc::clone(&registry));

    scheduler
        .run(vec![tagged(&input, &[upper()])], &mut SharedBuffer::new())
        .await
        .unwrap();
    let store = registry
        .store(fixture.cache_dir(), FingerprintMethod::Md5)
        .unwrap();
    let old_result = store
        .record(&input)
        .unwrap()
        .path(&["upper-v1"])
        .unwrap()
        .unwrap();

    fixture.modify(&input, "after");

    let mut sink = SharedBuffer::new();
    let report = scheduler
        .run(vec![tagged(&input, &[upper()])], &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.text(), "AFTER");
    assert_eq!(report.misses, 1);
    assert_file_missing(&old_result);
}

#[tokio::test]
async fn test_task_fingerprints_are_independent() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "abc");
    let scheduler = Scheduler::new(cached_options(&fixture));

    let items = vec![
        Pipeline::from_file(&input, &[upper()]).with_task_fingerprint("upper").into(),
        WorkItem::text(" "),
        Pipeline::from_file(&input, &[Stage::map_text("rev", |s| s.chars().rev().collect())])
            .with_task_fingerprint("reverse")
            .into(),
    ];
    let mut sink = SharedBuffer::new();
    let report = scheduler.run(items, &mut sink).await.unwrap();

    assert_eq!(sink.text(), "ABC cba");
    assert_eq!(report.misses, 2);
}

#[tokio::test]
async fn test_tagged_pipeline_without_cache_config_fails_fast() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "x");
    let runs = Arc::new(AtomicUsize::new(0));

    let items = vec![
        Pipeline::new(&[counting_stage("untagged", Arc::clone(&runs))])
            .input("y")
            .into(),
        tagged(&input, &[upper()]),
    ];
    let err = Scheduler::new(RunOptions::new())
        .run(items, &mut SharedBuffer::new())
        .await
        .unwrap_err();

    assert!(err.is_config());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_hooks_are_written_in_position() {
    let items = vec![
        WorkItem::text("<header>"),
        Pipeline::new(&[delayed_text_stage("slow", Duration::from_millis(20), "!")])
            .input("body")
            .into(),
        WorkItem::write_with(|buf| buf.extend_from_slice(b"<footer>")),
    ];
    let mut sink = SharedBuffer::new();

    let report = Scheduler::new(RunOptions::new())
        .run(items, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.text(), "<header>body!<footer>");
    assert_eq!(report.items, 3);
    assert_eq!(report.executed, 1);
}

#[tokio::test]
async fn test_final_output_closed_only_on_request() {
    let mut open = SharedBuffer::new();
    Scheduler::new(RunOptions::new())
        .run(vec![WorkItem::text("a")], &mut open)
        .await
        .unwrap();
    assert_eq!(open.shutdowns(), 0);

    let mut closed = SharedBuffer::new();
    Scheduler::new(RunOptions::new().with_close_output(true))
        .run(vec![WorkItem::text("a")], &mut closed)
        .await
        .unwrap();
    assert_eq!(closed.shutdowns(), 1);
}

#[tokio::test]
async fn test_on_complete_fires_once_per_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let scheduler = Scheduler::new(RunOptions::new()).on_complete(move |report| {
        assert_eq!(report.items, 1);
        calls_clone.fetch_add(1, Ordering::SeqCst);
    });

    for run in 1..=3 {
        scheduler
            .run(vec![WorkItem::text("x")], &mut SharedBuffer::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), run);
    }

    let failed = scheduler
        .run(
            vec![Pipeline::new(&[failing_stage("broken")]).input("x").into()],
            &mut SharedBuffer::new(),
        )
        .await;
    assert!(failed.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_disabled_cache_always_executes() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "twice");
    let runs = Arc::new(AtomicUsize::new(0));
    let stages = [counting_stage("count", Arc::clone(&runs)), upper()];
    let scheduler = Scheduler::new(cached_options(&fixture).with_cache_enabled(false));

    for _ in 0..2 {
        let mut sink = SharedBuffer::new();
        let report = scheduler.run(vec![tagged(&input, &stages)], &mut sink).await.unwrap();
        assert_eq!(sink.text(), "TWICE");
        assert_eq!((report.hits, report.misses, report.executed), (0, 0, 1));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let leftovers: Vec<_> = std::fs::read_dir(fixture.cache_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".minitask-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_item_with_own_output_bypasses_final_output() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "mine");
    let (tx, rx) = mpsc::channel();
    let registry = Arc::new(CacheRegistry::new());

    for _ in 0..2 {
        let tx = tx.clone();
        let items = vec![
            WorkItem::text("shared"),
            Pipeline::from_file(&input, &[upper()])
                .with_task_fingerprint("own")
                .output(Output::callback(move |bytes| tx.send(bytes).unwrap()))
                .into(),
        ];
        let mut sink = SharedBuffer::new();
        Scheduler::new(cached_options(&fixture))
            .with_registry(Arc::clone(&registry))
            .run(items, &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.text(), "shared");
    }

    assert_eq!(rx.recv().unwrap(), b"MINE".to_vec());
    assert_eq!(rx.recv().unwrap(), b"MINE".to_vec());
}

#[tokio::test]
async fn test_hit_reports_cached_outcome() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "done");
    let registry = Arc::new(CacheRegistry::new());
    let scheduler = Scheduler::new(cached_options(&fixture)).with_registry(registry);

    scheduler
        .run(vec![tagged(&input, &[upper()])], &mut SharedBuffer::new())
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let item: WorkItem = Pipeline::from_file(&input, &[upper()])
        .with_task_fingerprint("upper-v1")
        .on_done(move |outcome| tx.send(outcome).unwrap())
        .into();
    scheduler.run(vec![item], &mut SharedBuffer::new()).await.unwrap();

    assert!(matches!(rx.recv().unwrap(), PipelineOutcome::Cached(path) if path.is_file()));
}

#[tokio::test]
async fn test_failure_fails_run_and_records_nothing() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "data");
    let registry = Arc::new(CacheRegistry::new());
    let scheduler = Scheduler::new(cached_options(&fixture)).with_registry(Arc::clone(&registry));

    let err = scheduler
        .run(vec![tagged(&input, &[failing_stage("broken")])], &mut SharedBuffer::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MinitaskError::StageFailed { .. }));

    let store = registry
        .store(fixture.cache_dir(), FingerprintMethod::Md5)
        .unwrap();
    assert_eq!(store.record(&input).unwrap().path(&["upper-v1"]).unwrap(), None);

    let report = scheduler
        .run(vec![tagged(&input, &[upper()])], &mut SharedBuffer::new())
        .await
        .unwrap();
    assert_eq!(report.misses, 1);
}

#[tokio::test]
async fn test_pipeline_timeout() {
    let items = vec![Pipeline::new(&[delayed_text_stage("stuck", Duration::from_secs(5), "")])
        .input("x")
        .into()];

    let err = Scheduler::new(RunOptions::new().with_pipeline_timeout(Duration::from_millis(30)))
        .run(items, &mut SharedBuffer::new())
        .await
        .unwrap_err();

    assert!(matches!(err, MinitaskError::Timeout { .. }));
}

#[tokio::test]
async fn test_tagged_misses_are_recorded_and_replayed_in_item_order() {
    let fixture = CacheFixture::new();
    let delays = ["60", "10", "45", "5", "30", "0"];
    let inputs = write_delays(&fixture, &delays);
    let registry = Arc::new(CacheRegistry::new());
    let scheduler = Scheduler::new(cached_options(&fixture).with_concurrency_limit(3))
        .with_registry(Arc::clone(&registry));

    let mut sink = SharedBuffer::new();
    let report = scheduler.run(sleepy_items(&inputs), &mut sink).await.unwrap();

    assert_eq!(sink.text(), "[60][10][45][5][30][0]");
    assert_eq!((report.hits, report.misses, report.executed), (0, 6, 6));

    let store = registry
        .store(fixture.cache_dir(), FingerprintMethod::Md5)
        .unwrap();
    for (input, delay) in inputs.iter().zip(delays) {
        let result = store
            .record(input)
            .unwrap()
            .path(&["sleepy-v1"])
            .unwrap()
            .unwrap();
        assert_file_contents(&result, &format!("[{delay}]"));
    }
}

#[tokio::test]
async fn test_mixed_hits_and_misses_keep_item_order() {
    let fixture = CacheFixture::new();
    let inputs = write_delays(&fixture, &["40", "5", "25", "0"]);
    let scheduler = Scheduler::new(cached_options(&fixture).with_concurrency_limit(2));

    scheduler
        .run(sleepy_items(&inputs), &mut SharedBuffer::new())
        .await
        .unwrap();

    fixture.modify(&inputs[1], "30");
    fixture.modify(&inputs[3], "15");

    let mut sink = SharedBuffer::new();
    let report = scheduler.run(sleepy_items(&inputs), &mut sink).await.unwrap();

    assert_eq!(sink.text(), "[40][30][25][15]");
    assert_eq!((report.hits, report.misses, report.executed), (2, 2, 2));
}

#[tokio::test]
async fn test_identical_items_execute_once() {
    let fixture = CacheFixture::new();
    let input = fixture.write_input("a.txt", "twin");
    let registry = Arc::new(CacheRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let stages = [counting_stage("count", Arc::clone(&runs)), upper()];
    let items = vec![
        tagged(&input, &stages),
        WorkItem::text("+"),
        tagged(&input, &stages),
    ];

    let mut sink = SharedBuffer::new();
    let report = Scheduler::new(cached_options(&fixture))
        .with_registry(Arc::clone(&registry))
        .run(items, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.text(), "TWIN+TWIN");
    assert_eq!((report.hits, report.misses, report.executed), (1, 1, 1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    registry
        .store(fixture.cache_dir(), FingerprintMethod::Md5)
        .unwrap()
        .clear()
        .unwrap();
    let remaining: Vec<String> = std::fs::read_dir(fixture.cache_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining, vec!["meta-md5.json".to_string()]);
}

#[tokio::test(flavor = "current_thread")]
async fn test_cache_work_leaves_the_runtime_responsive() {
    const SIZE: usize = 32 * 1024 * 1024;
    let fixture = CacheFixture::new();
    let input = fixture.write_input("big.txt", &"x".repeat(SIZE));

    let stop = Arc::new(AtomicBool::new(false));
    let ticker = tokio::spawn({
        let stop = Arc::clone(&stop);
        async move {
            let mut widest = Duration::ZERO;
            let mut last = Instant::now();
            while !stop.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
                widest = widest.max(last.elapsed());
                last = Instant::now();
            }
            widest
        }
    });

    let stages = [Stage::sync("len", |bytes| Ok(bytes.len().to_string().into_bytes()))];
    let mut sink = SharedBuffer::new();
    let report = Scheduler::new(cached_options(&fixture))
        .run(vec![tagged(&input, &stages)], &mut sink)
        .await
        .unwrap();
    stop.store(true, Ordering::SeqCst);
    let widest = ticker.await.unwrap();

    assert_eq!(sink.text(), SIZE.to_string());
    assert_eq!(report.misses, 1);
    assert!(widest < Duration::from_millis(250), "runtime stalled for {widest:?}");
}
