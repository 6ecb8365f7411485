//! On-disk tests for the per-user transaction log: rotation, truncation,
//! version upgrades, checkpoints, root persistence, and enumeration.

use std::path::Path;
use std::sync::Arc;

use upspin_core::entry::{Attribute, DirEntry, Packing};
use upspin_core::errors::Kind;
use upspin_core::store::Store;
use upspin_dirlog::{
    has_log, list_users, list_users_with_suffix, LogEntry, Op, UserLog, MAX_LOG_SIZE_DEFAULT,
};
use upspin_store_memory::MemoryStore;

const BOB: &str = "bob@example.com";

fn store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new("store"))
}

fn record(seq: i64) -> LogEntry {
    let mut entry = DirEntry::new(&format!("{BOB}/file"), Packing::Plain, BOB);
    entry.sequence = seq;
    entry.time = 1_700_000_000;
    LogEntry::new(Op::Put, entry)
}

fn open_log(dir: &Path, max: u64) -> UserLog {
    UserLog::open(BOB, dir, store(), max).unwrap()
}

#[test]
fn append_then_read_back_byte_equal() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), MAX_LOG_SIZE_DEFAULT);

    let mut offsets = Vec::new();
    for seq in 1..=5 {
        offsets.push(log.append(&record(seq)).unwrap());
    }

    let reader = log.new_reader();
    for (i, &offset) in offsets.iter().enumerate() {
        let (entry, next) = reader.read_at(offset).unwrap();
        let entry = entry.expect("record at returned offset");
        assert_eq!(entry, record(i as i64 + 1));
        assert!(next > offset);
        if i + 1 < offsets.len() {
            assert_eq!(next, offsets[i + 1]);
        }
    }

    // Reading at the append offset is a clean EOF, not an error.
    let end = log.append_offset();
    let (none, next) = reader.read_at(end).unwrap();
    assert!(none.is_none());
    assert_eq!(next, end);
}

#[test]
fn rotation_produces_increasing_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 100);

    let record_len = record(1).encode().unwrap().len() as i64;
    let per_file = (100 + record_len - 1) / record_len; // appends before size >= 100

    for seq in 1..=10 {
        log.append(&record(seq)).unwrap();
    }
    assert_eq!(log.append_offset(), 10 * record_len);

    let seg_dir = tmp.path().join(format!("d.tree.log.{BOB}"));
    let mut starts: Vec<i64> = std::fs::read_dir(&seg_dir)
        .unwrap()
        .map(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            name.strip_suffix(".1").unwrap().parse().unwrap()
        })
        .collect();
    starts.sort();

    let expected_files = (10 + per_file - 1) / per_file;
    assert_eq!(starts.len() as i64, expected_files);
    for (i, &start) in starts.iter().enumerate() {
        assert_eq!(start, i as i64 * per_file * record_len);
    }

    // Every record is still readable across the file boundaries.
    let reader = log.new_reader();
    let mut offset = 0;
    let mut seen = 0;
    loop {
        let (entry, next) = reader.read_at(offset).unwrap();
        match entry {
            Some(e) => {
                seen += 1;
                assert_eq!(e.entry.sequence, seen);
            }
            None => break,
        }
        offset = next;
    }
    assert_eq!(seen, 10);
}

#[test]
fn truncate_drops_later_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 100);

    let record_len = record(1).encode().unwrap().len() as i64;
    let mut offsets = Vec::new();
    for seq in 1..=10 {
        offsets.push(log.append(&record(seq)).unwrap());
    }

    // Cut in the middle of the log, at a record boundary.
    let cut = offsets[5];
    log.truncate(cut).unwrap();
    assert!(log.append_offset() <= cut);
    assert_eq!(log.append_offset(), 5 * record_len);

    let seg_dir = tmp.path().join(format!("d.tree.log.{BOB}"));
    for e in std::fs::read_dir(&seg_dir).unwrap() {
        let name = e.unwrap().file_name().into_string().unwrap();
        let start: i64 = name.strip_suffix(".1").unwrap().parse().unwrap();
        assert!(start < cut, "segment {name} survived truncation at {cut}");
    }

    // The index forgets truncated records.
    assert_eq!(log.offset_of(6), -1);
    assert_eq!(log.offset_of(5), offsets[4]);

    // Reading at the first kept offset still yields a record.
    let reader = log.new_reader();
    let (entry, next) = reader.read_at(offsets[4]).unwrap();
    assert_eq!(entry.unwrap().entry.sequence, 5);
    assert!(next > offsets[4]);

    // Appends continue from the cut.
    let off = log.append(&record(6)).unwrap();
    assert_eq!(off, cut);
}

#[test]
fn offset_of_maps_sequences() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 100);

    let mut offsets = Vec::new();
    for seq in 1..=8 {
        offsets.push(log.append(&record(seq)).unwrap());
    }
    assert_eq!(log.offset_of(0), 0);
    for (i, &off) in offsets.iter().enumerate() {
        assert_eq!(log.offset_of(i as i64 + 1), off);
    }
    assert_eq!(log.offset_of(99), -1);
}

#[test]
fn index_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let offsets: Vec<i64> = {
        let log = open_log(tmp.path(), 100);
        (1..=6).map(|seq| log.append(&record(seq)).unwrap()).collect()
    };

    let log = open_log(tmp.path(), 100);
    for (i, &off) in offsets.iter().enumerate() {
        assert_eq!(log.offset_of(i as i64 + 1), off);
    }
    assert_eq!(log.append_offset(), offsets[5] + record(6).encode().unwrap().len() as i64);
}

#[test]
fn v0_sequences_are_masked_and_upgraded() {
    let tmp = tempfile::tempdir().unwrap();
    let start = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    // Prepare a version-0 segment by hand: real counters in the low 23
    // bits, garbage above.
    let seg_dir = tmp.path().join(format!("d.tree.log.{BOB}"));
    std::fs::create_dir_all(&seg_dir).unwrap();
    let mut v0_bytes = Vec::new();
    for seq in 1..=3i64 {
        let noisy = (0x1d5b << 23) | seq;
        v0_bytes.extend(record(noisy).encode().unwrap());
    }
    std::fs::write(seg_dir.join("0"), &v0_bytes).unwrap();

    let log = open_log(tmp.path(), MAX_LOG_SIZE_DEFAULT);

    // Reads mask down to the stored low bits.
    let reader = log.new_reader();
    let (entry, next) = reader.read_at(0).unwrap();
    assert_eq!(entry.unwrap().entry.sequence, 1);
    let (entry, _) = reader.read_at(next).unwrap();
    assert_eq!(entry.unwrap().entry.sequence, 2);

    // So does the offset index.
    assert_eq!(log.offset_of(2), next);

    // The next segment is version 1, starting where the v0 file ends.
    let v1_name = format!("{}.1", v0_bytes.len());
    assert!(seg_dir.join(&v1_name).exists(), "missing {v1_name}");
    assert_eq!(log.append_offset(), v0_bytes.len() as i64);
    assert!(log.v1_transition() >= start);

    // New appends carry full-width sequences.
    let wide = 1i64 << 40;
    let off = log.append(&record(wide)).unwrap();
    let (entry, _) = reader.read_at(off).unwrap();
    assert_eq!(entry.unwrap().entry.sequence, wide);
}

#[test]
fn legacy_single_file_log_is_migrated() {
    let tmp = tempfile::tempdir().unwrap();
    let mut bytes = Vec::new();
    for seq in 1..=2 {
        bytes.extend(record(seq).encode().unwrap());
    }
    std::fs::write(tmp.path().join(format!("tree.log.{BOB}")), &bytes).unwrap();

    let log = open_log(tmp.path(), MAX_LOG_SIZE_DEFAULT);
    assert!(!tmp.path().join(format!("tree.log.{BOB}")).exists());
    // The old file became version-0 segment 0.
    assert!(tmp
        .path()
        .join(format!("d.tree.log.{BOB}"))
        .join("0")
        .exists());
    let (entry, _) = log.new_reader().read_at(0).unwrap();
    assert_eq!(entry.unwrap().entry.sequence, 1);
}

#[test]
fn checkpoint_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), MAX_LOG_SIZE_DEFAULT);

    let err = log.read_offset().unwrap_err();
    assert!(err.is(Kind::NotExist));

    log.save_offset(0).unwrap();
    assert_eq!(log.read_offset().unwrap(), 0);
    log.save_offset(7_777_777).unwrap();
    assert_eq!(log.read_offset().unwrap(), 7_777_777);

    assert!(log.save_offset(-1).is_err());
}

#[test]
fn concurrent_reader_sees_complete_records() {
    let tmp = tempfile::tempdir().unwrap();
    let log = Arc::new(open_log(tmp.path(), 200));
    let reader = log.new_reader();

    let writer = {
        let log = log.clone();
        std::thread::spawn(move || {
            for seq in 1..=50 {
                log.append(&record(seq)).unwrap();
            }
        })
    };

    // Chase the tail: every record observed must be complete and in
    // append order.
    let mut offset = 0;
    let mut last_seq = 0;
    while last_seq < 50 {
        let (entry, next) = reader.read_at(offset).unwrap();
        match entry {
            Some(e) => {
                assert_eq!(e.entry.sequence, last_seq + 1);
                last_seq = e.entry.sequence;
                offset = next;
            }
            None => std::thread::yield_now(),
        }
    }
    writer.join().unwrap();
}

#[tokio::test]
async fn root_round_trip_with_legacy_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), MAX_LOG_SIZE_DEFAULT);

    let err = log.root().await.unwrap_err();
    assert!(err.is(Kind::NotExist));

    let mut root = DirEntry::new(&format!("{BOB}/"), Packing::Plain, BOB);
    root.attr = Attribute::Directory;
    root.sequence = 3;
    log.save_root(&root).await.unwrap();
    assert_eq!(log.root().await.unwrap(), root);

    // Same sequence: the write is skipped (and would be a no-op anyway).
    log.save_root(&root).await.unwrap();

    log.delete_root().await.unwrap();
    assert!(log.root().await.is_err());

    // A root written by an old installation lives as a plain file.
    let legacy = tmp.path().join(format!("tree.root.{BOB}"));
    std::fs::write(&legacy, root.to_vec().unwrap()).unwrap();
    assert_eq!(log.root().await.unwrap(), root);

    log.delete_root().await.unwrap();
    assert!(!legacy.exists());
}

#[tokio::test]
async fn delete_logs_removes_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path(), 100);
    for seq in 1..=4 {
        log.append(&record(seq)).unwrap();
    }
    log.save_offset(10).unwrap();
    let mut root = DirEntry::new(&format!("{BOB}/"), Packing::Plain, BOB);
    root.attr = Attribute::Directory;
    log.save_root(&root).await.unwrap();

    assert!(has_log(BOB, tmp.path()));
    log.delete_logs().await.unwrap();
    assert!(!has_log(BOB, tmp.path()));
    assert!(log.read_offset().is_err());
    assert!(log.root().await.is_err());

    // Deleting twice is fine; everything is already gone.
    log.delete_logs().await.unwrap();
}

#[test]
fn user_enumeration() {
    let tmp = tempfile::tempdir().unwrap();
    for user in [
        "ann@example.com",
        "bob@example.com",
        "bob+camera@example.com",
        "carol+backup@other.org",
    ] {
        let log = UserLog::open(user, tmp.path(), store(), 100).unwrap();
        log.save_offset(0).unwrap();
    }

    assert_eq!(
        list_users("*", tmp.path()).unwrap(),
        vec![
            "ann@example.com",
            "bob+camera@example.com",
            "bob@example.com",
            "carol+backup@other.org",
        ]
    );
    assert_eq!(
        list_users("*@example.com", tmp.path()).unwrap(),
        vec!["ann@example.com", "bob+camera@example.com", "bob@example.com"]
    );
    assert_eq!(
        list_users_with_suffix("camera", tmp.path()).unwrap(),
        vec!["bob+camera@example.com"]
    );
    assert_eq!(
        list_users_with_suffix("*", tmp.path()).unwrap(),
        vec!["bob+camera@example.com", "carol+backup@other.org"]
    );
}

#[test]
fn corrupt_record_surfaces_as_io() {
    let tmp = tempfile::tempdir().unwrap();
    let offset = {
        let log = open_log(tmp.path(), MAX_LOG_SIZE_DEFAULT);
        let off = log.append(&record(1)).unwrap();
        log.append(&record(2)).unwrap();
        off
    };

    // Flip one byte of the first record on disk.
    let seg = tmp.path().join(format!("d.tree.log.{BOB}")).join("0.1");
    let mut bytes = std::fs::read(&seg).unwrap();
    bytes[(offset + 10) as usize] ^= 0xff;
    std::fs::write(&seg, &bytes).unwrap();

    // Rebuilding the offset index at open reports the damage.
    let err = UserLog::open(BOB, tmp.path(), store(), MAX_LOG_SIZE_DEFAULT).unwrap_err();
    assert!(err.is(Kind::IO));
}
