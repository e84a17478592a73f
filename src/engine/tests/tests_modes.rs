#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::tests::helpers::{test_entry, test_options};
    use crate::engine::{Engine, EngineError};
    use crate::memtable::MEM_FILE_EXT;

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let opts = test_options(&dir);

        {
            let engine = Engine::open(opts.clone()).unwrap();
            engine
                .send_to_write_ch(vec![test_entry(1)])
                .unwrap()
                .wait()
                .unwrap();
            engine.close().unwrap();
        }

        let mut ro_opts = opts;
        ro_opts.read_only = true;
        let engine = Engine::open(ro_opts).unwrap();

        // Existing data is readable...
        let entry = test_entry(1);
        assert_eq!(engine.get(&entry.key).unwrap().value, entry.value);

        // ...but mutation is refused.
        assert!(matches!(
            engine.send_to_write_ch(vec![test_entry(2)]),
            Err(EngineError::ReadOnly)
        ));

        engine.close().unwrap();
    }

    #[test]
    fn test_read_only_leaves_files_untouched() {
        let dir = TempDir::new().unwrap();
        let opts = test_options(&dir);

        {
            let engine = Engine::open(opts.clone()).unwrap();
            engine
                .send_to_write_ch(vec![test_entry(1)])
                .unwrap()
                .wait()
                .unwrap();
            engine.close().unwrap();
        }
        let mut files_before: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.file_name()))
            .collect();
        files_before.sort();

        let mut ro_opts = opts;
        ro_opts.read_only = true;
        let engine = Engine::open(ro_opts).unwrap();
        engine.close().unwrap();

        let mut files_after: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.file_name()))
            .collect();
        files_after.sort();
        assert_eq!(files_before, files_after);
    }

    #[test]
    fn test_in_memory_creates_no_files() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(&dir);
        opts.in_memory = true;

        let engine = Engine::open(opts).unwrap();
        let entry = test_entry(1);
        engine
            .send_to_write_ch(vec![entry.clone()])
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(engine.get(&entry.key).unwrap().value, entry.value);
        engine.close().unwrap();

        let mem_files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.ends_with(MEM_FILE_EXT))
            })
            .count();
        assert_eq!(mem_files, 0);
    }

    #[test]
    fn test_in_memory_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(&dir);
        opts.in_memory = true;

        {
            let engine = Engine::open(opts.clone()).unwrap();
            engine
                .send_to_write_ch(vec![test_entry(1)])
                .unwrap()
                .wait()
                .unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(opts).unwrap();
        assert!(engine.get(&test_entry(1).key).unwrap().is_empty());
        engine.close().unwrap();
    }

    #[test]
    fn test_missing_dir_fails_open() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(&dir);
        opts.dir = dir
            .path()
            .join("does-not-exist")
            .to_str()
            .unwrap()
            .to_owned();

        assert!(matches!(Engine::open(opts), Err(EngineError::Io(_))));
    }

    #[test]
    fn test_sync_writes_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut opts = test_options(&dir);
        opts.sync_writes = true;

        {
            let engine = Engine::open(opts.clone()).unwrap();
            engine
                .send_to_write_ch(vec![test_entry(7)])
                .unwrap()
                .wait()
                .unwrap();
            engine.close().unwrap();
        }

        opts.sync_writes = false;
        let engine = Engine::open(opts).unwrap();
        let entry = test_entry(7);
        assert_eq!(engine.get(&entry.key).unwrap().value, entry.value);
        engine.close().unwrap();
    }
}
