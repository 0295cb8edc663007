//! # comprehensive storage tests
//!
//! why: a node that restarts must come back with exactly the term, vote and log it acknowledged
//! relations: tests raft-storage crate against raft-core's log types
//! what: hard state persistence, jsonl log, truncation, crash recovery, delta flushing

use raft_core::{HardState, Log, LogDelta, LogEntry};
use raft_storage::{FileStorage, InMemoryStorage, Storage, StorageError};
use std::fs;
use tempfile::tempdir;

fn hard(term: u64, voted_for: Option<u64>, commit_index: u64) -> HardState {
    HardState { term, voted_for, commit_index }
}

fn entries(terms: &[u64]) -> Vec<LogEntry> {
    terms
        .iter()
        .enumerate()
        .map(|(i, &term)| LogEntry::new(term, i as u64 + 1, format!("cmd{}", i + 1).into_bytes()))
        .collect()
}

fn indices(log: &[LogEntry]) -> Vec<u64> {
    log.iter().map(|e| e.index).collect()
}

// =============================================================================
// SECTION 1: HARD STATE
// =============================================================================

mod hard_state {
    use super::*;

    #[test]
    fn new_storage_starts_zeroed() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.load_hard_state().unwrap(), HardState::default());

        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_hard_state().unwrap(), HardState::default());
    }

    #[test]
    fn latest_save_wins() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_hard_state(&hard(1, Some(1), 0)).unwrap();
        storage.save_hard_state(&hard(4, None, 2)).unwrap();

        assert_eq!(storage.load_hard_state().unwrap(), hard(4, None, 2));
    }

    #[test]
    fn vote_of_none_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_hard_state(&hard(9, None, 0)).unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.load_hard_state().unwrap().voted_for, None);
    }

    #[test]
    fn extreme_values_survive() {
        let mut storage = InMemoryStorage::new();
        storage.save_hard_state(&hard(u64::MAX, Some(u64::MAX), u64::MAX)).unwrap();
        assert_eq!(storage.load_hard_state().unwrap().term, u64::MAX);
    }
}

// =============================================================================
// SECTION 2: LOG APPEND AND TRUNCATION
// =============================================================================

mod log_operations {
    use super::*;

    #[test]
    fn appends_accumulate_across_batches() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let all = entries(&[1, 1, 2]);

        storage.append_entries(&all[..1]).unwrap();
        storage.append_entries(&all[1..]).unwrap();

        assert_eq!(storage.load_log().unwrap(), all);
    }

    #[test]
    fn empty_append_does_not_create_log_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&[]).unwrap();

        assert!(!dir.path().join("log.jsonl").exists());
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn truncate_drops_index_and_suffix() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(&[1, 1, 1, 2, 2])).unwrap();

        storage.truncate_log_from(3).unwrap();

        assert_eq!(indices(&storage.load_log().unwrap()), vec![1, 2]);
    }

    #[test]
    fn truncate_from_first_index_empties_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1])).unwrap();

        storage.truncate_log_from(1).unwrap();

        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn truncate_past_end_is_noop() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1])).unwrap();

        storage.truncate_log_from(10).unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 2);
    }

    #[test]
    fn append_after_truncate_replaces_suffix() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1, 1])).unwrap();

        storage.truncate_log_from(2).unwrap();
        storage.append_entries(&[LogEntry::new(3, 2, b"replacement".to_vec())]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(indices(&log), vec![1, 2]);
        assert_eq!(log[1].term, 3);
        assert_eq!(log[1].command, b"replacement".to_vec());
    }

    #[test]
    fn binary_and_noop_commands_survive() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let written = vec![
            LogEntry::new(1, 1, Vec::new()),
            LogEntry::new(1, 2, vec![0x00, 0xFF, 0x0A, 0x80]),
            LogEntry::new(1, 3, "put 键 值".as_bytes().to_vec()),
        ];

        storage.append_entries(&written).unwrap();

        let log = storage.load_log().unwrap();
        assert!(log[0].is_noop());
        assert_eq!(log, written);
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn state_survives_multiple_restarts() {
        let dir = tempdir().unwrap();

        for term in 1..=3u64 {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let before = storage.load_log().unwrap().len() as u64;
            assert_eq!(before, term - 1);

            storage.save_hard_state(&hard(term, Some(term), before)).unwrap();
            storage
                .append_entries(&[LogEntry::new(term, before + 1, vec![term as u8])])
                .unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_hard_state().unwrap(), hard(3, Some(3), 2));
        assert_eq!(indices(&storage.load_log().unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn restored_log_matches_what_was_flushed() {
        let dir = tempdir().unwrap();
        let mut log = Log::new();
        log.append(1, b"a".to_vec());
        log.append(1, b"b".to_vec());
        log.commit_to(1);

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.apply_delta(&log.take_unstable()).unwrap();
            storage.save_hard_state(&hard(1, Some(1), log.commit_index())).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        let state = storage.load_hard_state().unwrap();
        let restored = Log::restore(storage.load_log().unwrap(), state.commit_index);

        assert_eq!(restored.last_index(), 2);
        assert_eq!(restored.commit_index(), 1);
        assert_eq!(restored.get(2).unwrap().command, b"b".to_vec());
    }

    #[test]
    fn clear_resets_to_new_node() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_hard_state(&hard(7, Some(2), 1)).unwrap();
        storage.append_entries(&entries(&[7])).unwrap();

        storage.clear().unwrap();
        // clearing twice is harmless
        storage.clear().unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.load_hard_state().unwrap(), HardState::default());
        assert!(reopened.load_log().unwrap().is_empty());
    }

    #[test]
    fn corrupt_meta_reports_codec_error() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(dir.path().join("meta.json"), b"{ not json").unwrap();

        let err = storage.load_hard_state().unwrap_err();
        assert!(matches!(err, StorageError::Codec(_)));
    }

    #[test]
    fn torn_final_entry_is_dropped_and_file_repaired() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(&[1, 1])).unwrap();

        // crash halfway through appending entry 3
        let log_path = dir.path().join("log.jsonl");
        let mut bytes = fs::read(&log_path).unwrap();
        bytes.extend_from_slice(br#"{"term":1,"ind"#);
        fs::write(&log_path, bytes).unwrap();

        let mut reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(indices(&reopened.load_log().unwrap()), vec![1, 2]);

        // the next append must land on its own line
        reopened.append_entries(&[LogEntry::new(2, 3, b"c".to_vec())]).unwrap();
        let log = FileStorage::new(dir.path()).unwrap().load_log().unwrap();
        assert_eq!(indices(&log), vec![1, 2, 3]);
        assert_eq!(log[2].term, 2);
    }

    #[test]
    fn complete_entry_missing_newline_is_kept() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let mut bytes = Vec::new();
        for entry in entries(&[1, 2]) {
            bytes.extend(serde_json::to_vec(&entry).unwrap());
            bytes.push(b'\n');
        }
        bytes.pop();
        fs::write(dir.path().join("log.jsonl"), bytes).unwrap();

        assert_eq!(indices(&storage.load_log().unwrap()), vec![1, 2]);
        let on_disk = fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        assert!(on_disk.ends_with('\n'));
    }

    #[test]
    fn corrupt_entry_before_the_tail_is_an_error() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let good = serde_json::to_string(&LogEntry::new(1, 2, vec![2])).unwrap();
        fs::write(dir.path().join("log.jsonl"), format!("{{ broken\n{good}\n")).unwrap();

        let err = storage.load_log().unwrap_err();
        assert!(matches!(err, StorageError::Codec(_)));
    }
}

// =============================================================================
// SECTION 4: ON-DISK FORMAT
// =============================================================================

mod on_disk_format {
    use super::*;

    #[test]
    fn meta_file_is_json_object() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_hard_state(&hard(5, Some(2), 3)).unwrap();

        let contents = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        assert_eq!(value["term"], 5);
        assert_eq!(value["voted_for"], 2);
        assert_eq!(value["commit_index"], 3);
    }

    #[test]
    fn log_file_holds_one_entry_per_line() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&entries(&[1, 2, 2])).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let entry: LogEntry = serde_json::from_str(line).expect("valid JSON line");
            assert_eq!(entry.index, i as u64 + 1);
        }
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_hard_state(&hard(5, Some(2), 0)).unwrap();
        storage.append_entries(&entries(&[1, 1])).unwrap();
        storage.truncate_log_from(2).unwrap();

        assert!(!dir.path().join("meta.tmp").exists());
        assert!(!dir.path().join("log.tmp").exists());
    }

    #[test]
    fn nested_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("cluster").join("node-3");

        let storage = FileStorage::new(&nested).unwrap();

        assert!(nested.is_dir());
        assert_eq!(storage.dir(), nested.as_path());
    }
}

// =============================================================================
// SECTION 5: DELTA FLUSHING THROUGH THE TRAIT
// =============================================================================

mod delta_flushing {
    use super::*;

    /// replays a leader overwrite of a follower's uncommitted suffix
    fn overwrite_scenario<S: Storage>(storage: &mut S) {
        let mut log = Log::new();
        for _ in 0..4 {
            log.append(1, b"old".to_vec());
        }
        storage.apply_delta(&log.take_unstable()).unwrap();

        log.splice(vec![LogEntry::new(2, 3, b"new3".to_vec()), LogEntry::new(2, 4, b"new4".to_vec())])
            .unwrap();
        storage.apply_delta(&log.take_unstable()).unwrap();

        let persisted = storage.load_log().unwrap();
        let in_memory: Vec<LogEntry> = log.iter().cloned().collect();
        assert_eq!(persisted, in_memory);
        assert_eq!(persisted[2].term, 2);
    }

    #[test]
    fn in_memory_tracks_overwrite() {
        overwrite_scenario(&mut InMemoryStorage::new());
    }

    #[test]
    fn file_storage_tracks_overwrite() {
        let dir = tempdir().unwrap();
        overwrite_scenario(&mut FileStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn empty_delta_changes_nothing() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(&[1])).unwrap();

        storage.apply_delta(&LogDelta::default()).unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 1);
    }

    #[test]
    fn storage_is_usable_as_trait_object() {
        let dir = tempdir().unwrap();
        let backends: Vec<Box<dyn Storage>> =
            vec![Box::new(InMemoryStorage::new()), Box::new(FileStorage::new(dir.path()).unwrap())];

        for mut storage in backends {
            storage.save_hard_state(&hard(2, Some(1), 0)).unwrap();
            storage.append_entries(&entries(&[2])).unwrap();
            assert_eq!(storage.load_hard_state().unwrap().term, 2);
            assert_eq!(storage.load_log().unwrap().len(), 1);
        }
    }
}
