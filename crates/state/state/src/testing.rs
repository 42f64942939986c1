//! Conformance tests shared by rate-store backends.
//!
//! Call [`run_rate_store_conformance_tests`] from a backend's test module
//! with a fresh store instance. The suite only exercises behavior every
//! backend must share; refill timing is backend-specific and tested where
//! the clock can be controlled.

use crate::error::StateError;
use crate::key::RateKey;
use crate::store::{RateDecision, RateLimit, RateStore};

/// Run the rate-store conformance suite against a fresh store.
pub async fn run_rate_store_conformance_tests(store: &dyn RateStore) -> Result<(), StateError> {
    test_burst_is_honored(store).await?;
    test_deny_reports_retry_after(store).await?;
    test_keys_are_independent(store).await?;
    Ok(())
}

async fn test_burst_is_honored(store: &dyn RateStore) -> Result<(), StateError> {
    let key = RateKey::new("/conformance/burst", "user:a");
    let limit = RateLimit::new(1, 3);
    for i in 0..3 {
        let decision = store.take(&key, limit).await?;
        assert!(decision.is_allowed(), "take {i} within burst should pass");
    }
    let decision = store.take(&key, limit).await?;
    assert!(!decision.is_allowed(), "take beyond burst should be denied");
    Ok(())
}

async fn test_deny_reports_retry_after(store: &dyn RateStore) -> Result<(), StateError> {
    let key = RateKey::new("/conformance/retry", "user:b");
    let limit = RateLimit::new(2, 1);
    assert!(store.take(&key, limit).await?.is_allowed());
    match store.take(&key, limit).await? {
        RateDecision::Denied { retry_after } => {
            assert!(
                !retry_after.is_zero(),
                "denied take should report a non-zero retry_after"
            );
        }
        RateDecision::Allowed => panic!("empty bucket should deny"),
    }
    Ok(())
}

async fn test_keys_are_independent(store: &dyn RateStore) -> Result<(), StateError> {
    let limit = RateLimit::new(1, 1);
    let a = RateKey::new("/conformance/indep", "user:a");
    let b = RateKey::new("/conformance/indep", "user:b");
    assert!(store.take(&a, limit).await?.is_allowed());
    assert!(
        store.take(&b, limit).await?.is_allowed(),
        "draining one identity must not affect another"
    );
    assert!(!store.take(&a, limit).await?.is_allowed());
    Ok(())
}
