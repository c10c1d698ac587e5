use std::panic;
use std::sync::Mutex;

lazy_static! {
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

/// Force some tests to be executed serially, e.g. tests that mutate
/// process-wide environment variables.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test panics, the lock is poisoned. We just ignore the poison and
    // run the next test; the panicked test already reported its failure.
    let _lock = SERIAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    f();
}

/// Always execute a cleanup closure no matter whether the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}
