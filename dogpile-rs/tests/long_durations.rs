//! Runs against the real clock, as the mocked one used by the unit tests never overflows.
use std::time::Duration;

use dogpile::cache::ExpiringCache;
use dogpile::guard::StampedeGuard;
use dogpile::limiter::{Admission, RateLimiter};

#[test]
fn entries_with_an_unrepresentable_ttl_never_expire() {
    let cache = ExpiringCache::new(4, Duration::from_secs(60));
    cache.put_with_ttl("forever".to_owned(), 1, Duration::MAX);
    assert_eq!(cache.get("forever"), Some(1));

    cache.set_ttl(Duration::MAX);
    cache.put("also-forever".to_owned(), 2);
    assert_eq!(cache.get("also-forever"), Some(2));

    assert_eq!(cache.purge_expired(), 0);
    assert_eq!(cache.len(), 2);
}

#[test]
fn guards_accept_an_unrepresentable_ttl() {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async {
            let guard: StampedeGuard<String, String> =
                StampedeGuard::with_ttl("forever", Duration::MAX);

            let value = guard
                .get_or_compute("look-1".to_owned(), || async { Ok("denim".to_owned()) })
                .await
                .unwrap();
            assert_eq!(value, "denim");
            assert_eq!(guard.peek(&"look-1".to_owned()).as_deref(), Some("denim"));
        });
}

#[test]
fn an_unrepresentable_window_denies_without_panicking() {
    let limiter = RateLimiter::new(1, Duration::MAX);
    assert!(limiter.allow("id-1"));

    match limiter.check("id-1") {
        Admission::Denied { retry_after } => {
            assert!(retry_after > Duration::from_secs(365 * 24 * 60 * 60))
        }
        Admission::Allowed { .. } => panic!("Expected the request to be denied"),
    }

    assert_eq!(limiter.sweep_idle(Duration::ZERO), 0);
}
