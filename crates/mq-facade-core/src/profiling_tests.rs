use super::*;

fn enabled() -> Profiler {
    Profiler::new(&ProfilingConfig { enabled: true })
}

#[test]
fn test_start_stop_reports_elapsed() {
    let profiler = enabled();

    assert!(profiler.start("load"));
    std::thread::sleep(Duration::from_millis(20));
    let elapsed = profiler.stop("load");

    assert!(elapsed.unwrap() >= Duration::from_millis(20));
}

/// Verify that a second start keeps the original start time.
#[test]
fn test_duplicate_start_is_ignored() {
    let profiler = enabled();

    let first = profiler.start("parse");
    std::thread::sleep(Duration::from_millis(20));
    let second = profiler.start("parse");
    let elapsed = profiler.stop("parse").unwrap();

    assert!(first);
    assert!(!second);
    assert!(elapsed >= Duration::from_millis(20));
}

#[test]
fn test_stop_without_start() {
    let profiler = enabled();

    assert_eq!(profiler.stop("never"), None);
    assert!(profiler.start("never"));
    assert!(profiler.stop("never").is_some());
    assert_eq!(profiler.stop("never"), None);
}

/// Verify that timers on different threads do not collide.
#[test]
fn test_timers_are_per_thread() {
    let profiler = enabled();
    profiler.start("shared-tag");

    let from_other_thread = std::thread::scope(|scope| {
        scope
            .spawn(|| (profiler.start("shared-tag"), profiler.stop("shared-tag").is_some()))
            .join()
            .unwrap()
    });

    assert_eq!(from_other_thread, (true, true));
    assert!(profiler.stop("shared-tag").is_some());
}

#[test]
fn test_disabled_and_unconfigured_are_noops() {
    let disabled = Profiler::new(&ProfilingConfig::default());
    let unconfigured = Profiler::unconfigured();

    assert!(!disabled.is_enabled());
    assert!(!disabled.start("x"));
    assert_eq!(disabled.stop("x"), None);
    assert!(!unconfigured.is_enabled());
    assert!(!unconfigured.start("x"));
    assert!(!unconfigured.start("x"));
    assert_eq!(unconfigured.stop("x"), None);
}

#[test]
fn test_profile_returns_operation_result() {
    let profiler = enabled();

    let value = profiler.profile("sum", || (1..=4).sum::<i32>());

    assert_eq!(value, 10);
    assert_eq!(profiler.stop("sum"), None);
}

#[test]
fn test_profile_async_returns_future_output() {
    let profiler = enabled();

    let value = tokio_test::block_on(profiler.profile_async("fetch", async { "done" }));

    assert_eq!(value, "done");
    assert_eq!(profiler.stop("fetch"), None);
}
