#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]
#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use epgcache_store::{
    Generation, GenerationStore, ImportError, ImportOutcome, Lookup, ProgramRecord, QueryEngine,
    QueryError, Store, encode,
};

fn open_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(Some(&dir.path().to_path_buf()), false).unwrap();
    (store, dir)
}

fn ok(records: Vec<ProgramRecord>) -> Vec<Result<ProgramRecord, ImportError>> {
    records.into_iter().map(Ok).collect()
}

fn titles(lookup: Lookup<Vec<ProgramRecord>>) -> Vec<String> {
    lookup
        .found()
        .unwrap()
        .into_iter()
        .map(|r| r.title)
        .collect()
}

/// Ten-second program number `i` on channel 7.
fn slot(i: i64, title: &str) -> ProgramRecord {
    let start = i.saturating_mul(10);
    ProgramRecord::new("7", start, start.saturating_add(10), title)
}

/// Full contents of `channels` as seen by range queries.
fn snapshot(engine: &QueryEngine, channels: &[&str]) -> Vec<Lookup<Vec<ProgramRecord>>> {
    channels
        .iter()
        .map(|c| engine.range(c, i64::MIN, i64::MAX).unwrap())
        .collect()
}

#[test]
fn test_end_to_end_single_channel() {
    // Arrange
    let (store, _dir) = open_store();
    let importer = store.importer().build();
    importer
        .import_records(ok(vec![
            ProgramRecord::new("7", 1000, 2000, "A"),
            ProgramRecord::new("7", 2000, 3000, "B"),
            ProgramRecord::new("7", 3000, 4000, "C"),
        ]))
        .unwrap();
    let engine = store.query();

    // Act
    let range = titles(engine.range("7", 1500, 3500).unwrap());
    let point = engine.point("7", 2500).unwrap().found().unwrap();
    let triplet = engine.triplet("7", 2500).unwrap().found().unwrap();
    let early = engine.point("7", 500).unwrap();

    // Assert
    assert_eq!(range, vec!["A", "B", "C"]);
    assert_eq!(point.title, "B");
    assert_eq!(triplet.previous.unwrap().title, "A");
    assert_eq!(triplet.current.unwrap().title, "B");
    assert_eq!(triplet.next.unwrap().title, "C");
    assert_eq!(early, Lookup::NotFound);
}

#[test]
fn test_failure_mid_feed_keeps_previous_generation() {
    // Arrange
    let (store, _dir) = open_store();
    let importer = store.importer().build();
    let channels = ["1", "2", "3", "4"];
    let initial = (0..400_i64)
        .map(|i| {
            let channel = channels[usize::try_from(i.rem_euclid(4)).unwrap()];
            let start = i.saturating_mul(60);
            ProgramRecord::new(channel, start, start.saturating_add(60), format!("old {i}"))
        })
        .collect();
    importer.import_records(ok(initial)).unwrap();
    let engine = store.query();
    let before = snapshot(&engine, &channels);
    let info_before = store.generations().generation_info().unwrap();

    let broken = (0..60_000_i64).map(|i| {
        if i == 50_000 {
            return Err(ImportError::Parse(String::from("unexpected end of element")));
        }
        let channel = channels[usize::try_from(i.rem_euclid(4)).unwrap()];
        let start = i.saturating_mul(60);
        Ok(ProgramRecord::new(
            channel,
            start,
            start.saturating_add(60),
            format!("new {i}"),
        ))
    });

    // Act
    let result = importer.import_records(broken);

    // Assert
    assert!(matches!(result, Err(ImportError::Parse(_))));
    assert_eq!(store.generations().generation_info().unwrap(), info_before);
    assert_eq!(snapshot(&engine, &channels), before);
}

#[test]
fn test_reimport_is_idempotent() {
    // Arrange
    let (store, _dir) = open_store();
    let importer = store.importer().batch_size(3).build();
    let feed = vec![
        ProgramRecord::new("7", 1000, 2000, "A"),
        ProgramRecord::new("7", 2000, 3000, "B"),
        ProgramRecord::new("8", 1500, 2500, "X"),
        ProgramRecord::new("8", 2500, 3500, "Y"),
    ];
    let engine = store.query();

    // Act
    importer.import_records(ok(feed.clone())).unwrap();
    let first = (
        snapshot(&engine, &["7", "8"]),
        engine.short_guide(None, 2200).unwrap().channels,
    );
    importer.import_records(ok(feed)).unwrap();
    let second = (
        snapshot(&engine, &["7", "8"]),
        engine.short_guide(None, 2200).unwrap().channels,
    );

    // Assert
    assert_eq!(first, second);
    assert_eq!(
        store.generations().active_label().unwrap(),
        Some(Generation::B)
    );
}

#[test]
fn test_readers_see_old_or_new_generation_only() {
    // Arrange
    let (store, _dir) = open_store();
    let old: Vec<ProgramRecord> = (0..200_i64).map(|i| slot(i, "old")).collect();
    let new: Vec<ProgramRecord> = (0..200_i64).map(|i| slot(i, "new")).collect();
    store.importer().build().import_records(ok(old)).unwrap();

    let (mid_build_tx, mid_build_rx) = mpsc::channel::<()>();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let done = Arc::new(AtomicBool::new(false));
    let background = {
        let done = Arc::clone(&done);
        let engine = store.query();
        thread::spawn(move || {
            let mut reads = 0_usize;
            while !done.load(Ordering::SeqCst) {
                let records = engine.range("7", 0, 5000).unwrap().found().unwrap();
                let mut kinds: Vec<String> = records.iter().map(|r| r.title.clone()).collect();
                kinds.dedup();
                assert_eq!(records.len(), 200);
                assert_eq!(kinds.len(), 1, "mixed generations in one response");
                reads = reads.saturating_add(1);
            }
            reads
        })
    };
    let import = {
        let importer = store.importer().batch_size(7).build();
        thread::spawn(move || {
            // Pauses after 100 records, so 14 batches of the new
            // generation are already committed.
            let records = new.into_iter().enumerate().map(move |(i, record)| {
                if i == 100 {
                    mid_build_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                }
                Ok(record)
            });
            importer.import_records(records).unwrap()
        })
    };

    // Act
    mid_build_rx.recv().unwrap();
    let engine = store.query();
    let during: Vec<Vec<String>> = (0..5)
        .map(|_| {
            engine
                .range("7", 0, 5000)
                .unwrap()
                .found()
                .unwrap()
                .into_iter()
                .map(|r| r.title)
                .collect()
        })
        .collect();
    resume_tx.send(()).unwrap();
    let outcome = import.join().unwrap();
    let after = titles(engine.range("7", 0, 5000).unwrap());
    done.store(true, Ordering::SeqCst);
    let background_reads = background.join().unwrap();

    // Assert
    assert!(matches!(outcome, ImportOutcome::Completed(_)));
    for seen in &during {
        assert_eq!(seen.len(), 200);
        assert!(seen.iter().all(|t| t == "old"));
    }
    assert_eq!(after.len(), 200);
    assert!(after.iter().all(|t| t == "new"));
    assert!(background_reads > 0);
}

#[test]
fn test_import_from_second_handle_is_coalesced_during_build() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let first = Store::open(Some(&dir.path().to_path_buf()), false).unwrap();
    let second = Store::open(Some(&dir.path().to_path_buf()), false).unwrap();
    let mut nested = None;
    let records = (0..10_i64).map(|i| {
        if i == 5 {
            let other: Vec<ProgramRecord> = (100..104_i64).map(|j| slot(j, "other")).collect();
            nested = Some(
                second
                    .importer()
                    .batch_size(2)
                    .build()
                    .import_records(ok(other))
                    .unwrap(),
            );
        }
        Ok(slot(i, "full"))
    });

    // Act
    let outcome = first
        .importer()
        .batch_size(2)
        .build()
        .import_records(records)
        .unwrap();

    // Assert
    assert_eq!(nested, Some(ImportOutcome::Coalesced));
    let report = outcome.report().unwrap();
    assert_eq!(report.written, 10);
    let served = titles(second.query().range("7", i64::MIN, i64::MAX).unwrap());
    assert_eq!(served.len(), 10);
    assert!(served.iter().all(|t| t == "full"));
    assert_eq!(second.status().unwrap().entries, 10);
}

#[test]
fn test_queries_before_first_import_report_warming_up() {
    // Arrange
    let (store, _dir) = open_store();
    let engine = store.query();

    // Act
    let range = engine.range("7", 0, 100);
    let point = engine.point("7", 0);

    // Assert
    assert!(matches!(range, Err(QueryError::NoActiveGeneration)));
    assert!(matches!(point, Err(QueryError::NoActiveGeneration)));
}

#[test]
fn test_corrupt_record_is_skipped_in_range() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let generations = GenerationStore::open_in(Some(&dir.path().to_path_buf())).unwrap();
    let a = ProgramRecord::new("7", 1000, 2000, "A");
    let c = ProgramRecord::new("7", 3000, 4000, "C");
    let mut build = generations.begin_build(Generation::A, 10).unwrap();
    build.put("7", a.time_key(), encode(&a).unwrap()).unwrap();
    build
        .put("7", epgcache_store::time_key(2000), b"{not json".to_vec())
        .unwrap();
    build.put("7", c.time_key(), encode(&c).unwrap()).unwrap();
    build.promote().unwrap();
    let store = Store::new(generations, None);

    // Act
    let range = titles(store.query().range("7", 1500, 3500).unwrap());
    let point = store.query().point("7", 2500).unwrap();

    // Assert
    assert_eq!(range, vec!["A", "C"]);
    assert_eq!(point, Lookup::NotFound);
}
