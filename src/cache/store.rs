//! Tier Store Port
//!
//! Uniform async capability implemented by every storage tier. The
//! coordinator only ever talks to tiers through this trait.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::entry::TierKind;
use crate::error::{Error, Result};

/// Storage tier backend
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Which tier this store serves
    fn kind(&self) -> TierKind;

    /// Insert or replace `key`, expiring after `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Fetch `key` if present and unexpired
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove `key`; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every entry this store owns
    async fn clear(&self) -> Result<()>;

    /// Connectivity check used by readiness probes
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// A single tier's failure during a fan-out operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: TierKind,
    pub reason: String,
}

impl TierFailure {
    pub fn new(tier: TierKind, err: &Error) -> Self {
        let reason = match err {
            Error::TierUnavailable { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Self { tier, reason }
    }
}

/// Outcome of a write, delete or clear applied to every configured tier.
///
/// Partial success is not an error by itself; callers that need all tiers
/// to agree call [`FanOutReport::into_result`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    succeeded: Vec<TierKind>,
    failures: Vec<TierFailure>,
}

impl FanOutReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, tier: TierKind) {
        if !self.succeeded.contains(&tier) {
            self.succeeded.push(tier);
        }
    }

    pub fn record_failure(&mut self, tier: TierKind, err: &Error) {
        self.failures.push(TierFailure::new(tier, err));
    }

    /// Fold another report into this one (used by the multi-key operations)
    pub fn merge(&mut self, other: FanOutReport) {
        for tier in other.succeeded {
            self.record_success(tier);
        }
        self.failures.extend(other.failures);
    }

    /// Tiers where at least one operation succeeded
    pub fn succeeded(&self) -> &[TierKind] {
        &self.succeeded
    }

    pub fn failures(&self) -> &[TierFailure] {
        &self.failures
    }

    /// Tiers with at least one failure, deduplicated
    pub fn failed_tiers(&self) -> Vec<TierKind> {
        let mut tiers: Vec<_> = self.failures.iter().map(|f| f.tier).collect();
        tiers.sort();
        tiers.dedup();
        tiers
    }

    /// No tier failed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Convert any failure into `Error::PartialFailure`
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialFailure {
                failures: self.failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_report_complete() {
        let mut report = FanOutReport::new();
        report.record_success(TierKind::Memory);
        report.record_success(TierKind::Memory);
        assert!(report.is_complete());
        assert_eq!(report.succeeded(), &[TierKind::Memory]);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_report_partial() {
        let mut report = FanOutReport::new();
        report.record_success(TierKind::Memory);
        report.record_failure(
            TierKind::Networked,
            &Error::tier(TierKind::Networked, "connection refused"),
        );
        assert!(!report.is_complete());
        assert_eq!(report.failures()[0].reason, "connection refused");
        assert_matches!(
            report.into_result(),
            Err(Error::PartialFailure { failures }) if failures.len() == 1
        );
    }

    #[test]
    fn test_report_merge() {
        let mut first = FanOutReport::new();
        first.record_success(TierKind::Memory);
        first.record_failure(TierKind::Durable, &Error::tier(TierKind::Durable, "down"));

        let mut second = FanOutReport::new();
        second.record_success(TierKind::Memory);
        second.record_failure(TierKind::Durable, &Error::tier(TierKind::Durable, "down"));

        first.merge(second);
        assert_eq!(first.succeeded(), &[TierKind::Memory]);
        assert_eq!(first.failures().len(), 2);
        assert_eq!(first.failed_tiers(), vec![TierKind::Durable]);
    }
}
