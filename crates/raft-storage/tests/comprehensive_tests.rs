//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate against raft-core state types
//! what: persistence, crash recovery, snapshots, atomic writes, edge cases

use raft_core::{HardState, Log, LogEntry, PersistentState, Snapshot};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use std::fs;
use tempfile::tempdir;

fn hard(term: u64, voted_for: Option<u64>) -> HardState {
    HardState { current_term: term, voted_for }
}

fn log_of<C: AsRef<[u8]>>(commands: &[C], term: u64) -> Log {
    let mut log = Log::new();
    for (i, command) in commands.iter().enumerate() {
        log.append(LogEntry::new(term, i as u64 + 1, command.as_ref().to_vec()));
    }
    log
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory_basic {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let storage = InMemoryStorage::new();
        let state = storage.load().unwrap();

        assert_eq!(state.hard_state.current_term, 0);
        assert_eq!(state.hard_state.voted_for, None);
        assert!(state.log.is_empty());
        assert!(state.snapshot.is_none());
    }

    #[test]
    fn save_and_load_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_state(&hard(5, Some(2)), &Log::new()).unwrap();

        assert_eq!(storage.load().unwrap().hard_state, hard(5, Some(2)));
    }

    #[test]
    fn save_voted_for_none() {
        let mut storage = InMemoryStorage::new();

        storage.save_state(&hard(3, None), &Log::new()).unwrap();

        assert_eq!(storage.load().unwrap().hard_state.voted_for, None);
    }

    #[test]
    fn overwrite_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_state(&hard(1, Some(1)), &Log::new()).unwrap();
        storage.save_state(&hard(2, Some(3)), &Log::new()).unwrap();

        assert_eq!(storage.load().unwrap().hard_state, hard(2, Some(3)));
    }
}

mod in_memory_log {
    use super::*;

    #[test]
    fn save_replaces_whole_log() {
        let mut storage = InMemoryStorage::new();

        storage.save_state(&hard(1, None), &log_of(&[b"a", b"b", b"c"], 1)).unwrap();
        storage.save_state(&hard(1, None), &log_of(&[b"a"], 1)).unwrap();

        let log = storage.load().unwrap().log;
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn clear_resets_all_state() {
        let mut storage = InMemoryStorage::new();
        storage.save_state(&hard(5, Some(2)), &log_of(&[b"x"], 5)).unwrap();
        storage
            .save_snapshot(&Snapshot { last_included_index: 1, last_included_term: 5, data: vec![1] })
            .unwrap();

        storage.clear().unwrap();

        assert_eq!(storage.load().unwrap(), PersistentState::default());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage_basic {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        let storage = FileStorage::new(&nested).unwrap();

        assert!(nested.is_dir());
        assert_eq!(storage.dir(), nested.as_path());
    }

    #[test]
    fn new_storage_has_default_values() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.load().unwrap(), PersistentState::default());
    }

    #[test]
    fn save_creates_meta_and_log_files() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_state(&hard(1, Some(1)), &log_of(&[b"cmd"], 1)).unwrap();

        assert!(dir.path().join("meta.json").exists());
        assert!(dir.path().join("log.json").exists());
        assert!(!dir.path().join("snapshot.json").exists());
    }

    #[test]
    fn save_and_load_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        let log = log_of(&[b"set key1 value1", b"set key2 value2"], 1);
        storage.save_state(&hard(1, None), &log).unwrap();

        let loaded = storage.load().unwrap().log;
        assert_eq!(loaded, log);
        assert_eq!(loaded.get(1).unwrap().command, b"set key1 value1".to_vec());
    }

    #[test]
    fn timestep_is_preserved() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let mut log = Log::new();
        log.append(LogEntry::with_timestep(2, 1, b"move".to_vec(), 41));

        storage.save_state(&hard(2, None), &log).unwrap();

        assert_eq!(storage.load().unwrap().log.get(1).unwrap().timestep, 41);
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn state_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_state(&hard(10, Some(1)), &log_of(&[b"command"], 10)).unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let state = storage.load().unwrap();

            assert_eq!(state.hard_state, hard(10, Some(1)));
            assert_eq!(state.log.len(), 1);
        }
    }

    #[test]
    fn multiple_restarts_preserve_latest_state() {
        let dir = tempdir().unwrap();

        for term in 1..=3u64 {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let mut log = storage.load().unwrap().log;
            log.append(LogEntry::new(term, log.last_index() + 1, vec![term as u8]));
            storage.save_state(&hard(term, Some(term)), &log).unwrap();
        }

        let state = FileStorage::new(dir.path()).unwrap().load().unwrap();
        assert_eq!(state.hard_state, hard(3, Some(3)));
        assert_eq!(state.log.last_index(), 3);
        assert_eq!(state.log.last_term(), 3);
    }

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot { last_included_index: 2, last_included_term: 1, data: b"board".to_vec() };

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let mut log = log_of(&[b"a", b"b", b"c"], 1);
            log.truncate_before(3);
            log.set_watermark(2, 1);
            storage.save_snapshot(&snapshot).unwrap();
            storage.save_state(&hard(1, None), &log).unwrap();
        }

        let state = FileStorage::new(dir.path()).unwrap().load().unwrap();
        assert_eq!(state.snapshot, Some(snapshot));
        assert_eq!(state.log.last_included_index(), 2);
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log.get(3).unwrap().command, b"c".to_vec());
    }

    #[test]
    fn crash_between_snapshot_and_log_write_favors_snapshot() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_state(&hard(1, None), &log_of(&[b"a", b"b", b"c", b"d"], 1)).unwrap();
            // log.json never rewritten after this
            storage
                .save_snapshot(&Snapshot { last_included_index: 3, last_included_term: 1, data: vec![] })
                .unwrap();
        }

        let state = FileStorage::new(dir.path()).unwrap().load().unwrap();
        assert_eq!(state.log.last_included_index(), 3);
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log.last_index(), 4);
    }

    #[test]
    fn clear_removes_all_files() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_state(&hard(1, Some(1)), &log_of(&[b"x"], 1)).unwrap();
        storage
            .save_snapshot(&Snapshot { last_included_index: 1, last_included_term: 1, data: vec![] })
            .unwrap();

        storage.clear().unwrap();

        assert!(!dir.path().join("meta.json").exists());
        assert!(!dir.path().join("log.json").exists());
        assert!(!dir.path().join("snapshot.json").exists());
        assert_eq!(storage.load().unwrap(), PersistentState::default());
    }

    #[test]
    fn corrupt_meta_file_is_reported() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(dir.path().join("meta.json"), "{ not json").unwrap();

        let err = storage.load().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn meta_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_state(&hard(5, Some(2)), &Log::new()).unwrap();

        let contents = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        assert_eq!(value["current_term"], 5);
    }

    #[test]
    fn log_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_state(&hard(1, None), &log_of(&[b"cmd"], 1)).unwrap();

        let contents = fs::read_to_string(dir.path().join("log.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        assert_eq!(value["entries"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_state(&hard(5, Some(2)), &log_of(&[b"cmd"], 1)).unwrap();
        storage
            .save_snapshot(&Snapshot { last_included_index: 1, last_included_term: 1, data: vec![] })
            .unwrap();

        // temp files should be cleaned up
        assert!(!dir.path().join("meta.tmp").exists());
        assert!(!dir.path().join("log.tmp").exists());
        assert!(!dir.path().join("snapshot.tmp").exists());
    }
}

// =============================================================================
// SECTION 5: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_log_entry() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        // 1MB command
        let large_command = vec![0u8; 1024 * 1024];
        storage.save_state(&hard(1, None), &log_of(&[&large_command], 1)).unwrap();

        let log = storage.load().unwrap().log;
        assert_eq!(log.get(1).unwrap().command.len(), 1024 * 1024);
    }

    #[test]
    fn many_log_entries() {
        let mut storage = InMemoryStorage::new();
        let mut log = Log::new();
        for i in 1..=1000 {
            log.append(LogEntry::new(1, i, vec![(i % 256) as u8]));
        }

        storage.save_state(&hard(1, None), &log).unwrap();

        assert_eq!(storage.load().unwrap().log.len(), 1000);
    }

    #[test]
    fn binary_command_data() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let binary: Vec<u8> = (0..=255).collect();

        storage.save_state(&hard(1, None), &log_of(&[&binary], 1)).unwrap();

        assert_eq!(storage.load().unwrap().log.get(1).unwrap().command, binary);
    }

    #[test]
    fn very_high_term_number() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_state(&hard(u64::MAX, Some(u64::MAX)), &Log::new()).unwrap();

        assert_eq!(storage.load().unwrap().hard_state, hard(u64::MAX, Some(u64::MAX)));
    }

    #[test]
    fn high_watermark_with_empty_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let mut log = Log::new();
        log.reset_to_snapshot(1_000_000, 7);

        storage.save_state(&hard(7, None), &log).unwrap();

        let loaded = storage.load().unwrap().log;
        assert!(loaded.is_empty());
        assert_eq!(loaded.last_index(), 1_000_000);
        assert_eq!(loaded.last_term(), 7);
    }
}

// =============================================================================
// SECTION 6: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn test_storage_impl<S: Storage>(storage: &mut S) {
        // save and load term
        storage.save_state(&hard(5, Some(2)), &Log::new()).unwrap();
        assert_eq!(storage.load().unwrap().hard_state, hard(5, Some(2)));

        // save and load log
        storage.save_state(&hard(5, Some(2)), &log_of(&[b"cmd"], 5)).unwrap();
        assert_eq!(storage.load().unwrap().log.len(), 1);

        // snapshot
        let snapshot = Snapshot { last_included_index: 1, last_included_term: 5, data: b"s".to_vec() };
        storage.save_snapshot(&snapshot).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.snapshot, Some(snapshot));
        assert_eq!(state.log.last_included_index(), 1);

        // clear
        storage.clear().unwrap();
        assert_eq!(storage.load().unwrap().hard_state.current_term, 0);
    }

    #[test]
    fn in_memory_implements_trait() {
        let mut storage = InMemoryStorage::new();
        test_storage_impl(&mut storage);
    }

    #[test]
    fn file_storage_implements_trait() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        test_storage_impl(&mut storage);
    }

    #[test]
    fn boxed_storage_is_usable_as_trait_object() {
        let mut storage: Box<dyn Storage + Send> = Box::new(InMemoryStorage::new());
        storage.save_state(&hard(2, Some(1)), &Log::new()).unwrap();
        assert_eq!(storage.load().unwrap().hard_state.current_term, 2);
    }
}
