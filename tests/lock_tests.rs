//! Lock Tests
//!
//! Contention and crash-recovery behavior of the lock marker files.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use archstage::lock::{FileLock, LockOptions};
use archstage::ArchError;

fn quick() -> LockOptions {
    LockOptions::default()
        .with_timeout(Duration::from_millis(200))
        .with_retry_interval(Duration::from_millis(10))
}

#[test]
fn test_second_holder_times_out() {
    let temp = TempDir::new().unwrap();
    let resource = temp.path().join("manifest.json");

    let mut first = FileLock::new(&resource);
    first.acquire(&quick()).unwrap();

    let mut second = FileLock::new(&resource);
    let start = Instant::now();
    let result = second.acquire(&quick());

    assert!(matches!(result, Err(ArchError::LockTimeout { .. })));
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(!second.is_acquired());

    first.release().unwrap();
    second.acquire(&quick()).unwrap();
    assert!(second.is_acquired());
}

#[test]
fn test_waiter_acquires_after_release() {
    let temp = TempDir::new().unwrap();
    let resource = temp.path().join("layer.json");
    let barrier = Arc::new(Barrier::new(2));

    let holder = {
        let resource = resource.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut lock = FileLock::new(&resource);
            lock.acquire(&LockOptions::default()).unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(150));
            lock.release().unwrap();
        })
    };

    barrier.wait();
    let mut waiter = FileLock::new(&resource);
    let start = Instant::now();
    waiter
        .acquire(&LockOptions::default().with_timeout(Duration::from_secs(2)))
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
    holder.join().unwrap();
}

#[test]
fn test_critical_sections_never_overlap() {
    let temp = TempDir::new().unwrap();
    let resource = Arc::new(temp.path().join("shared.json"));
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let resource = Arc::clone(&resource);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                for _ in 0..5 {
                    FileLock::new(resource.as_path())
                        .with_lock(&LockOptions::default(), || {
                            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(!FileLock::exists(&resource));
}

#[test]
fn test_abandoned_lock_is_recovered() {
    let temp = TempDir::new().unwrap();
    let resource = temp.path().join("manifest.json");

    // Simulate a crashed holder: a marker nobody will release.
    fs::write(
        FileLock::lock_path_for(&resource),
        r#"{"pid":999999,"acquiredAt":"2020-01-01T00:00:00Z"}"#,
    )
    .unwrap();
    thread::sleep(Duration::from_millis(60));

    let options = quick().with_stale_lock_threshold(Duration::from_millis(20));
    let mut lock = FileLock::new(&resource);
    lock.acquire(&options).unwrap();

    let holder = FileLock::holder(&resource).unwrap();
    assert_eq!(holder.pid, std::process::id());
    lock.release().unwrap();
}

#[test]
fn test_old_holder_release_keeps_new_holders_marker() {
    let temp = TempDir::new().unwrap();
    let resource = temp.path().join("manifest.json");

    let mut old = FileLock::new(&resource);
    old.acquire(&quick()).unwrap();

    // An operator clears the marker and another holder takes the lock.
    FileLock::force_remove(&resource).unwrap();
    let mut current = FileLock::new(&resource);
    current.acquire(&quick()).unwrap();
    let current_token = FileLock::holder(&resource).unwrap().token;

    let result = old.release();
    assert!(matches!(result, Err(ArchError::LockReleaseFailed { .. })));
    assert_eq!(FileLock::holder(&resource).unwrap().token, current_token);

    let mut third = FileLock::new(&resource);
    let result = third.acquire(&quick().with_stale_detection(false));
    assert!(matches!(result, Err(ArchError::LockTimeout { .. })));

    current.release().unwrap();
    assert!(!FileLock::exists(&resource));
}

#[test]
fn test_slow_live_holder_is_not_displaced() {
    let temp = TempDir::new().unwrap();
    let resource = temp.path().join("manifest.json");

    let mut slow = FileLock::new(&resource);
    slow.acquire(&quick()).unwrap();
    let token = FileLock::holder(&resource).unwrap().token;
    thread::sleep(Duration::from_millis(60));

    let options = quick().with_stale_lock_threshold(Duration::from_millis(20));
    let result = FileLock::new(&resource).acquire(&options);

    assert!(matches!(result, Err(ArchError::LockTimeout { .. })));
    assert_eq!(FileLock::holder(&resource).unwrap().token, token);
    slow.release().unwrap();
}

#[test]
fn test_stale_detection_can_be_disabled() {
    let temp = TempDir::new().unwrap();
    let resource = temp.path().join("manifest.json");
    fs::write(FileLock::lock_path_for(&resource), "{}").unwrap();
    thread::sleep(Duration::from_millis(60));

    let options = quick()
        .with_stale_lock_threshold(Duration::from_millis(20))
        .with_stale_detection(false);
    let result = FileLock::new(&resource).acquire(&options);

    assert!(matches!(result, Err(ArchError::LockTimeout { .. })));
    assert!(FileLock::exists(&resource));
}
