//! End-to-end tests driving the engine through its public surface.

use tempfile::TempDir;
use tenaxdb::engine::{Engine, Options};
use tenaxdb::EngineError;

fn open(dir: &TempDir) -> Engine {
    Engine::open(options(dir)).unwrap()
}

fn options(dir: &TempDir) -> Options {
    let mut opts = Options::new(dir.path().to_str().unwrap());
    opts.memtable_size = 1 << 20;
    opts
}

#[test]
fn lifecycle_write_read_close_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open(&dir);
        let mut txn = engine.new_transaction();
        for i in 0..500u32 {
            txn.set(
                format!("key-{i:04}").into_bytes(),
                format!("val-{i:04}").into_bytes(),
            )
            .unwrap();
        }
        txn.commit().unwrap();
        engine.close().unwrap();
    }

    let engine = open(&dir);
    let txn = engine.new_transaction();
    for i in 0..500u32 {
        let item = txn.get(format!("key-{i:04}").as_bytes()).unwrap();
        assert_eq!(item.value(), format!("val-{i:04}").as_bytes());
    }
    engine.close().unwrap();
}

#[test]
fn concurrent_transactions() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let mut workers = Vec::new();
    for w in 0..4 {
        let engine = engine.clone();
        workers.push(std::thread::spawn(move || {
            for i in 0..100u32 {
                let mut txn = engine.new_transaction();
                txn.set(
                    format!("w{w}-{i:04}").into_bytes(),
                    format!("{w}:{i}").into_bytes(),
                )
                .unwrap();
                txn.commit().unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let txn = engine.new_transaction();
    for w in 0..4 {
        for i in 0..100u32 {
            let item = txn.get(format!("w{w}-{i:04}").as_bytes()).unwrap();
            assert_eq!(item.value(), format!("{w}:{i}").as_bytes());
        }
    }
    engine.close().unwrap();
}

#[test]
fn overwrites_read_latest() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    for round in 0..10u32 {
        let mut txn = engine.new_transaction();
        txn.set(b"counter".to_vec(), round.to_string().into_bytes())
            .unwrap();
        txn.commit().unwrap();
    }

    let txn = engine.new_transaction();
    assert_eq!(txn.get(b"counter").unwrap().value(), b"9");
    engine.close().unwrap();
}

#[test]
fn delete_then_recover_stays_deleted() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open(&dir);
        let mut txn = engine.new_transaction();
        txn.set(b"gone".to_vec(), b"v".to_vec()).unwrap();
        txn.set(b"kept".to_vec(), b"v".to_vec()).unwrap();
        txn.commit().unwrap();

        let mut txn = engine.new_transaction();
        txn.delete(b"gone".to_vec()).unwrap();
        txn.commit().unwrap();
        engine.close().unwrap();
    }

    let engine = open(&dir);
    let txn = engine.new_transaction();
    assert!(matches!(txn.get(b"gone"), Err(EngineError::KeyNotFound)));
    assert_eq!(txn.get(b"kept").unwrap().value(), b"v");
    engine.close().unwrap();
}

#[test]
fn sync_writes_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let mut opts = options(&dir);
        opts.sync_writes = true;
        let engine = Engine::open(opts).unwrap();
        let mut txn = engine.new_transaction();
        txn.set(b"durable".to_vec(), b"yes".to_vec()).unwrap();
        txn.commit().unwrap();
        engine.close().unwrap();
    }

    let engine = open(&dir);
    let txn = engine.new_transaction();
    assert_eq!(txn.get(b"durable").unwrap().value(), b"yes");
    engine.close().unwrap();
}
