//! src/services/url_signer.rs
//!
//! Stateless authentication of delivery URLs. A URL carries
//! `md5(physical_key ++ midnight_millis ++ secret)` for the day it was
//! created (or `md5(physical_key ++ secret)` when it never expires), so the
//! server needs no token storage to check it.

use crate::services::storage_service::{StorageError, StorageResult};
use chrono::{NaiveDate, NaiveTime, TimeDelta, Utc};
use std::sync::Arc;

/// Daily hashes are accepted this many days before and after today.
const VALIDITY_WINDOW_DAYS: i64 = 2;

#[derive(Clone)]
pub struct UrlSigner {
    secret: Arc<str>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    /// Creates a signer for the configured shared secret.
    ///
    /// A missing or blank secret is a configuration error.
    pub fn new(secret: Option<String>) -> StorageResult<Self> {
        match secret.map(|s| s.trim().to_string()) {
            Some(secret) if !secret.is_empty() => Ok(Self {
                secret: Arc::from(secret),
            }),
            _ => Err(StorageError::Configuration(
                "no shared secret configured for signing storage URLs".into(),
            )),
        }
    }

    /// Hash for the day `offset_days` away from today (UTC).
    pub fn compute_hash(&self, key: &str, offset_days: i64) -> String {
        self.compute_hash_for_day(key, today() + TimeDelta::days(offset_days))
    }

    pub fn compute_hash_for_day(&self, key: &str, day: NaiveDate) -> String {
        let midnight = day.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        format!("{:x}", md5::compute(format!("{key}{midnight}{}", self.secret)))
    }

    pub fn compute_eternal_hash(&self, key: &str) -> String {
        format!("{:x}", md5::compute(format!("{key}{}", self.secret)))
    }

    /// Accepts today's hash, the eternal hash, or a hash of up to two days
    /// before or after today.
    pub fn verify_hash(&self, key: &str, hash: &str) -> bool {
        self.verify_hash_on(key, hash, today())
    }

    pub fn verify_hash_on(&self, key: &str, hash: &str, today: NaiveDate) -> bool {
        if hash == self.compute_hash_for_day(key, today) || hash == self.compute_eternal_hash(key) {
            return true;
        }

        (1..=VALIDITY_WINDOW_DAYS).any(|offset| {
            hash == self.compute_hash_for_day(key, today - TimeDelta::days(offset))
                || hash == self.compute_hash_for_day(key, today + TimeDelta::days(offset))
        })
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
