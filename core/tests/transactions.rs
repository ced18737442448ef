use ember_core::{Db, EmberError, SetOptions, index_int, index_string};
use pretty_assertions::assert_eq;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Debug, PartialEq)]
struct Snapshot {
    items: Vec<(String, String, Option<bool>)>,
    indexes: Vec<(String, Vec<String>)>,
}

/// Everything observable through a read transaction.
fn snapshot(db: &Db) -> Snapshot {
    db.view(|tx| {
        let mut items = Vec::new();
        tx.ascend("", |key, value| {
            items.push((key.to_string(), value.to_string(), None));
            true
        })?;
        for item in &mut items {
            item.2 = Some(tx.ttl(&item.0)?.is_some());
        }

        let mut indexes = Vec::new();
        for name in tx.indexes()? {
            let mut keys = Vec::new();
            tx.ascend(&name, |key, _| {
                keys.push(key.to_string());
                true
            })?;
            indexes.push((name, keys));
        }
        Ok::<_, EmberError>(Snapshot { items, indexes })
    })
    .unwrap()
}

fn seeded() -> Db {
    let db = Db::open(":memory:").unwrap();
    db.update(|tx| {
        tx.create_index("names", "user:*", vec![index_string()])?;
        tx.create_index("ages", "age:*", vec![index_int()])?;
        tx.set("user:1", "Tom", None)?;
        tx.set("user:2", "alice", Some(SetOptions::with_ttl(Duration::from_secs(300))))?;
        tx.set("age:1", "30", None)?;
        tx.set("age:2", "7", None)?;
        Ok::<_, EmberError>(())
    })
    .unwrap();
    db
}

#[test]
fn test_rollback_restores_exact_state() {
    let db = seeded();
    let before = snapshot(&db);

    let tx = db.begin(true).unwrap();
    tx.set("user:1", "Zed", Some(SetOptions::with_ttl(Duration::from_secs(5)))).unwrap();
    tx.set("user:3", "bob", None).unwrap();
    tx.delete("user:2").unwrap();
    tx.set("age:1", "99", None).unwrap();
    tx.delete("age:2").unwrap();
    tx.set("age:2", "1", None).unwrap();
    tx.rollback().unwrap();

    assert_eq!(snapshot(&db), before);
}

#[test]
fn test_update_rolls_back_on_error() {
    let db = seeded();
    let before = snapshot(&db);

    let result = db.update(|tx| {
        tx.delete_all()?;
        tx.drop_index("ages")?;
        tx.set("x", "1", None)?;
        tx.get("missing")
    });
    assert!(matches!(result, Err(EmberError::NotFound)));
    assert_eq!(snapshot(&db), before);
}

#[test]
fn test_managed_transactions_refuse_manual_completion() {
    let db = seeded();
    let result = db.update(|tx| tx.commit());
    assert!(matches!(result, Err(EmberError::InvalidOperation)));
    let result = db.view(|tx| tx.rollback());
    assert!(matches!(result, Err(EmberError::InvalidOperation)));
}

#[test]
fn test_closed_transaction() {
    let db = seeded();
    let tx = db.begin(true).unwrap();
    tx.set("k", "v", None).unwrap();
    tx.commit().unwrap();

    assert!(matches!(tx.get("k"), Err(EmberError::TxClosed)));
    assert!(matches!(tx.set("k", "w", None), Err(EmberError::TxClosed)));
    assert!(matches!(tx.commit(), Err(EmberError::TxClosed)));
    assert!(matches!(tx.ascend("", |_, _| true), Err(EmberError::TxClosed)));
    drop(tx);

    db.view(|tx| {
        assert_eq!(tx.get("k")?, "v");
        Ok::<_, EmberError>(())
    })
    .unwrap();
}

#[test]
fn test_view_cannot_write() {
    let db = seeded();
    let result = db.view(|tx| tx.set("k", "v", None));
    assert!(matches!(result, Err(EmberError::TxNotWritable)));
}

#[test]
fn test_closed_database() {
    let db = seeded();
    db.close().unwrap();
    assert!(matches!(db.begin(true), Err(EmberError::DatabaseClosed)));
    assert!(matches!(
        db.view(|tx| tx.len()),
        Err(EmberError::DatabaseClosed)
    ));
    assert!(matches!(db.load(&b""[..]), Err(EmberError::DatabaseClosed)));
    assert!(matches!(db.close(), Err(EmberError::DatabaseClosed)));
}

#[test]
fn test_reader_sees_one_snapshot() {
    let db = seeded();
    let (started, wait_started) = mpsc::channel();

    thread::scope(|scope| {
        let reader = db.begin(false).unwrap();
        assert_eq!(reader.get("user:1").unwrap(), "Tom");

        let writer = scope.spawn(|| {
            started.send(()).unwrap();
            db.update(|tx| tx.set("user:1", "Ann", None).map(|_| ()))
                .unwrap();
        });

        wait_started.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        // The writer is blocked behind the open reader.
        assert!(!writer.is_finished());
        assert_eq!(reader.get("user:1").unwrap(), "Tom");
        reader.rollback().unwrap();

        writer.join().unwrap();
    });

    db.view(|tx| {
        assert_eq!(tx.get("user:1")?, "Ann");
        Ok::<_, EmberError>(())
    })
    .unwrap();
}

#[test]
fn test_concurrent_readers() {
    let db = seeded();
    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    db.view(|tx| {
                        let mut count = 0;
                        tx.ascend("names", |_, _| {
                            count += 1;
                            true
                        })?;
                        Ok::<_, EmberError>(count)
                    })
                    .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 2);
        }
    });
}
