use ember_core::{Config, Db, EmberError, SetOptions, Tx};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn fast_config() -> Config {
    Config {
        maintenance_interval: Duration::from_millis(20),
        ..Config::default()
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_expired_keys_are_hidden_before_the_sweep() {
    let db = Db::open_with_config(
        ":memory:",
        Config {
            maintenance_interval: Duration::from_secs(3600),
            ..Config::default()
        },
    )
    .unwrap();
    db.update(|tx| {
        tx.set("k", "v", Some(SetOptions::with_ttl(Duration::from_millis(50))))
            .map(|_| ())
    })
    .unwrap();
    thread::sleep(Duration::from_millis(80));

    db.view(|tx| {
        assert!(matches!(tx.get("k"), Err(EmberError::NotFound)));
        assert!(matches!(tx.ttl("k"), Err(EmberError::NotFound)));
        assert_eq!(tx.get_with("k", true)?, "v");
        // Still counted until swept.
        assert_eq!(tx.len()?, 1);

        let mut visited = 0;
        tx.ascend("", |_, _| {
            visited += 1;
            true
        })?;
        assert_eq!(visited, 0);
        Ok::<_, EmberError>(())
    })
    .unwrap();
}

#[test]
fn test_background_sweep_removes_and_reports() {
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let db = Db::open_with_config(
        ":memory:",
        Config {
            on_expired: Some(Arc::new(move |keys: Vec<String>| sink.lock().extend(keys))),
            ..fast_config()
        },
    )
    .unwrap();

    db.update(|tx| {
        for i in 0..3 {
            tx.set(
                &format!("session:{i}"),
                "x",
                Some(SetOptions::with_ttl(Duration::from_millis(30))),
            )?;
        }
        tx.set("keep", "y", None).map(|_| ())
    })
    .unwrap();

    wait_for("sweep", || reported.lock().len() == 3);
    let mut keys = reported.lock().clone();
    keys.sort();
    assert_eq!(keys, vec!["session:0", "session:1", "session:2"]);

    db.view(|tx| {
        assert_eq!(tx.len()?, 1);
        assert!(matches!(tx.get_with("session:0", true), Err(EmberError::NotFound)));
        Ok::<_, EmberError>(())
    })
    .unwrap();
}

#[test]
fn test_sync_callback_veto_is_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let db = Db::open_with_config(
        ":memory:",
        Config {
            on_expired_sync: Some(Arc::new(move |_key: &str, _value: &str, _tx: &Tx<'_>| {
                // Refuse the first two attempts.
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EmberError::InvalidOperation)
                } else {
                    Ok(())
                }
            })),
            ..fast_config()
        },
    )
    .unwrap();

    db.update(|tx| {
        tx.set("k", "v", Some(SetOptions::with_ttl(Duration::ZERO)))
            .map(|_| ())
    })
    .unwrap();

    wait_for("expiration", || {
        db.view(|tx| tx.len()).unwrap() == 0
    });
    assert!(attempts.load(Ordering::SeqCst) >= 3);
}

#[test]
fn test_sweep_deletes_are_logged() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");
    {
        let db = Db::open_with_config(&path, fast_config()).unwrap();
        db.update(|tx| {
            tx.set("k", "v", Some(SetOptions::with_ttl(Duration::from_millis(10))))
                .map(|_| ())
        })
        .unwrap();
        wait_for("sweep", || db.view(|tx| tx.len()).unwrap() == 0);
    }

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.ends_with("*2\r\n$3\r\ndel\r\n$1\r\nk\r\n"));
}

#[test]
fn test_set_config_takes_effect() {
    let db = Db::open(":memory:").unwrap();
    let mut config = db.read_config().unwrap();
    assert_eq!(config.maintenance_interval, Duration::from_secs(1));
    config.auto_shrink_disabled = true;
    config.sync_policy = "always".parse().unwrap();
    db.set_config(config).unwrap();

    let config = db.read_config().unwrap();
    assert!(config.auto_shrink_disabled);
    assert_eq!(config.sync_policy.to_string(), "always");
}
