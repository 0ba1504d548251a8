use std::time::Duration;

use assert_matches::assert_matches;

use molid::domain::{CompoundRecord, ProcessedArchiveRecord};
use molid::error::MolidError;
use molid::store::{CompoundColumn, MasterStore, WriterLock};

fn record(key: &str, cid: i64, smiles: &str) -> CompoundRecord {
    let mut record = CompoundRecord::new(key.parse().unwrap());
    record.cid = Some(cid);
    record.smiles = Some(smiles.to_string());
    record.formula = Some("C9H8O4".to_string());
    record
}

#[test]
fn create_then_open_persists_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("master.db");
    let mut store = MasterStore::create(&path).unwrap();
    store
        .insert_batch(&[record("BSYNRYMUTXBXSQ-UHFFFAOYSA-N", 2244, "CC(=O)OC1=CC=CC=C1C(=O)O")])
        .unwrap();
    drop(store);

    let store = MasterStore::open(&path, "test").unwrap();
    let found = store
        .lookup_full(&"BSYNRYMUTXBXSQ-UHFFFAOYSA-N".parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(found.cid, Some(2244));
    assert_eq!(store.stats().unwrap().compounds, 1);
}

#[test]
fn open_missing_store_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = MasterStore::open(&dir.path().join("absent.db"), "offline-basic").unwrap_err();
    assert_matches!(err, MolidError::MissingStore { required_by, .. } if required_by == "offline-basic");
}

#[test]
fn first_write_wins_on_duplicate_key() {
    let mut store = MasterStore::in_memory().unwrap();
    let first = store
        .insert_batch(&[record("BSYNRYMUTXBXSQ-UHFFFAOYSA-N", 2244, "first")])
        .unwrap();
    let second = store
        .insert_batch(&[
            record("BSYNRYMUTXBXSQ-UHFFFAOYSA-N", 2244, "second"),
            record("BSYNRYMUTXBXSQ-UHFFFAOYSA-M", 517044, "anion"),
        ])
        .unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 1);

    let found = store
        .lookup_full(&"BSYNRYMUTXBXSQ-UHFFFAOYSA-N".parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(found.smiles.as_deref(), Some("first"));
}

#[test]
fn prefix_results_share_connectivity_block() {
    let mut store = MasterStore::in_memory().unwrap();
    store
        .insert_batch(&[
            record("BSYNRYMUTXBXSQ-UHFFFAOYSA-N", 2244, "a"),
            record("BSYNRYMUTXBXSQ-UHFFFAOYSA-M", 517044, "b"),
            record("UHOVQNZJYSORNB-UHFFFAOYSA-N", 241, "c"),
        ])
        .unwrap();
    let found = store.lookup_prefix("BSYNRYMUTXBXSQ").unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|record| record.inchikey14() == "BSYNRYMUTXBXSQ"));
    assert!(store.lookup_prefix("AAAAAAAAAAAAAA").unwrap().is_empty());
}

#[test]
fn filtered_lookup_is_a_conjunction() {
    let mut store = MasterStore::in_memory().unwrap();
    store
        .insert_batch(&[
            record("BSYNRYMUTXBXSQ-UHFFFAOYSA-N", 2244, "a"),
            record("BSYNRYMUTXBXSQ-UHFFFAOYSA-M", 517044, "b"),
        ])
        .unwrap();

    let both = store
        .lookup_filtered(&[(CompoundColumn::Formula, "C9H8O4".to_string())])
        .unwrap();
    assert_eq!(both.len(), 2);

    let one = store
        .lookup_filtered(&[
            (CompoundColumn::Formula, "C9H8O4".to_string()),
            (CompoundColumn::Cid, "517044".to_string()),
        ])
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].smiles.as_deref(), Some("b"));
    assert_eq!("formula".parse::<CompoundColumn>().unwrap(), CompoundColumn::Formula);
    assert_matches!("mass".parse::<CompoundColumn>(), Err(MolidError::InvalidQuery(_)));
}

#[test]
fn processed_markers_and_reset() {
    let mut store = MasterStore::in_memory().unwrap();
    store
        .mark_archive_processed(&ProcessedArchiveRecord::now("a.sdf.gz", 10))
        .unwrap();
    store
        .mark_archive_processed(&ProcessedArchiveRecord::now("b.sdf.gz", 20))
        .unwrap();
    assert!(store.is_archive_processed("a.sdf.gz").unwrap());
    assert!(!store.is_archive_processed("c.sdf.gz").unwrap());

    // Markers are never rewritten.
    store
        .mark_archive_processed(&ProcessedArchiveRecord::now("a.sdf.gz", 99))
        .unwrap();
    let processed = store.processed_archives().unwrap();
    assert_eq!(processed.len(), 2);
    assert_eq!(processed[0].row_count, 10);

    assert_eq!(store.reset_processed(Some("a.sdf.gz")).unwrap(), 1);
    assert!(!store.is_archive_processed("a.sdf.gz").unwrap());
    assert_eq!(store.reset_processed(None).unwrap(), 1);
    assert_eq!(store.stats().unwrap().processed_archives, 0);
}

#[test]
fn writer_lock_is_exclusive_until_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master.db");
    let lock = WriterLock::acquire(&path).unwrap();
    assert!(lock.path().ends_with("master.db.lock"));
    assert_matches!(WriterLock::acquire(&path), Err(MolidError::StoreLocked(_)));
    drop(lock);
    WriterLock::acquire(&path).unwrap();
}

#[test]
fn write_blocked_by_another_connection_is_a_store_write_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master.db");
    let mut store = MasterStore::create(&path).unwrap();
    store.set_busy_timeout(Duration::from_millis(50)).unwrap();

    let other = rusqlite::Connection::open(&path).unwrap();
    other.execute_batch("BEGIN EXCLUSIVE").unwrap();
    let err = store
        .insert_batch(&[record("BSYNRYMUTXBXSQ-UHFFFAOYSA-N", 2244, "CC(=O)OC1=CC=CC=C1C(=O)O")])
        .unwrap_err();
    assert_matches!(err, MolidError::StoreWrite(_));
    assert!(err.skips_archive());

    other.execute_batch("ROLLBACK").unwrap();
    assert_eq!(
        store
            .insert_batch(&[record("BSYNRYMUTXBXSQ-UHFFFAOYSA-N", 2244, "CC(=O)OC1=CC=CC=C1C(=O)O")])
            .unwrap(),
        1
    );
}
