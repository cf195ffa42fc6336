//! License Management
//!
//! The entitlement store: issues, evaluates, and meters per-user, per-module
//! licenses. Authorization for every dispatch goes through [`LicenseStore::authorize`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use wisp_common::{Clock, ModuleId, SystemClock, UserId};

/// Preview licenses are valid for this many days.
pub const PREVIEW_DAYS: i64 = 7;
/// Execution ceiling on a preview license.
pub const PREVIEW_MAX_EXECUTIONS: u32 = 100;
/// Lease licenses run for this many days and are renewable.
pub const LEASE_DAYS: i64 = 30;

/// How a module is sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseKind {
    /// Time- and count-bounded trial.
    Preview,
    /// Renewable monthly subscription.
    Lease,
    /// One-time buy, never expires.
    Purchase,
}

/// A grant of permission for one user to run one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: Uuid,
    pub user_id: UserId,
    pub module_id: ModuleId,
    pub kind: LicenseKind,
    pub starts_at: DateTime<Utc>,
    /// `None` means the license never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// `None` means unlimited executions.
    pub max_executions: Option<u32>,
    pub execution_count: u32,
    pub transaction_ref: Option<String>,
    pub amount_paid: Decimal,
    pub is_active: bool,
    /// License this one explicitly replaced for the same (user, module) pair.
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Why an authorization check refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoLicense,
    Deactivated,
    Expired,
    LimitReached,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoLicense => write!(f, "no license"),
            Self::Deactivated => write!(f, "deactivated"),
            Self::Expired => write!(f, "expired"),
            Self::LimitReached => write!(f, "limit reached"),
        }
    }
}

/// Outcome of an authorization check. Denial is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// The named license covers the run.
    Granted { license_id: Uuid },
    /// Refused with a reason the caller can surface verbatim.
    Denied { reason: DenialReason },
}

impl Access {
    /// True when the check passed.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// License store errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LicenseError {
    #[error("user already holds a license for this module")]
    AlreadyLicensed,
    #[error("license not found")]
    NotFound,
    #[error("only lease licenses can be renewed")]
    NotALease,
    #[error("only preview licenses can be upgraded")]
    NotAPreview,
    #[error("execution ceiling already reached")]
    LimitReached,
}

/// Thread-safe entitlement store.
///
/// Authority per (user, module) pair is tracked with an explicit
/// current-license index: issuing a lease or purchase moves the pointer and
/// records the superseded license id, so evaluation never has to infer which
/// of several historical licenses wins. Licenses are never physically
/// deleted.
pub struct LicenseStore {
    licenses: RwLock<HashMap<Uuid, License>>,
    current: RwLock<HashMap<(UserId, ModuleId), Uuid>>,
    clock: Arc<dyn Clock>,
}

impl LicenseStore {
    /// Store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store with an injected clock (deterministic expiry tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            licenses: RwLock::new(HashMap::new()),
            current: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Grant a 7-day trial with a fixed execution ceiling.
    ///
    /// One preview per (user, module) pair: fails if the pair already has
    /// any current entitlement, previewed or paid.
    pub fn issue_preview(&self, user: UserId, module: &str) -> Result<License, LicenseError> {
        let mut current = self.current.write();
        let key = (user, module.to_owned());
        if current.contains_key(&key) {
            return Err(LicenseError::AlreadyLicensed);
        }

        let now = self.clock.now();
        let license = License {
            id: Uuid::new_v4(),
            user_id: user,
            module_id: module.to_owned(),
            kind: LicenseKind::Preview,
            starts_at: now,
            expires_at: Some(now + Duration::days(PREVIEW_DAYS)),
            max_executions: Some(PREVIEW_MAX_EXECUTIONS),
            execution_count: 0,
            transaction_ref: None,
            amount_paid: Decimal::ZERO,
            is_active: true,
            supersedes: None,
            created_at: now,
        };

        current.insert(key, license.id);
        self.licenses.write().insert(license.id, license.clone());
        tracing::info!(user = %user, module, license = %license.id, "preview license issued");
        Ok(license)
    }

    /// Grant a monthly subscription. Supersedes any current license.
    pub fn issue_lease(
        &self,
        user: UserId,
        module: &str,
        tx_ref: &str,
        amount: Decimal,
    ) -> License {
        let now = self.clock.now();
        self.issue_paid(
            user,
            module,
            LicenseKind::Lease,
            Some(now + Duration::days(LEASE_DAYS)),
            tx_ref,
            amount,
        )
    }

    /// Grant permanent access. Supersedes any current license.
    pub fn issue_purchase(
        &self,
        user: UserId,
        module: &str,
        tx_ref: &str,
        amount: Decimal,
    ) -> License {
        self.issue_paid(user, module, LicenseKind::Purchase, None, tx_ref, amount)
    }

    fn issue_paid(
        &self,
        user: UserId,
        module: &str,
        kind: LicenseKind,
        expires_at: Option<DateTime<Utc>>,
        tx_ref: &str,
        amount: Decimal,
    ) -> License {
        let now = self.clock.now();
        let mut current = self.current.write();
        let key = (user, module.to_owned());
        let superseded = current.get(&key).copied();

        let license = License {
            id: Uuid::new_v4(),
            user_id: user,
            module_id: module.to_owned(),
            kind,
            starts_at: now,
            expires_at,
            max_executions: None,
            execution_count: 0,
            transaction_ref: Some(tx_ref.to_owned()),
            amount_paid: amount,
            is_active: true,
            supersedes: superseded,
            created_at: now,
        };

        current.insert(key, license.id);
        self.licenses.write().insert(license.id, license.clone());
        tracing::info!(
            user = %user,
            module,
            license = %license.id,
            kind = ?kind,
            superseded = ?superseded,
            "license issued"
        );
        license
    }

    /// Fetch a license by id.
    pub fn get(&self, id: Uuid) -> Option<License> {
        self.licenses.read().get(&id).cloned()
    }

    /// The authoritative license for a (user, module) pair, if any.
    pub fn current_license(&self, user: UserId, module: &str) -> Option<License> {
        let id = *self.current.read().get(&(user, module.to_owned()))?;
        self.get(id)
    }

    /// All licenses ever issued to a user, newest first.
    pub fn licenses_for_user(&self, user: UserId) -> Vec<License> {
        let mut out: Vec<License> = self
            .licenses
            .read()
            .values()
            .filter(|l| l.user_id == user)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// The sole authorization gate. Checks short-circuit in a fixed order:
    /// existence, active flag, expiry, then the preview execution ceiling.
    pub fn authorize(&self, user: UserId, module: &str) -> Access {
        let Some(license) = self.current_license(user, module) else {
            return Access::Denied {
                reason: DenialReason::NoLicense,
            };
        };

        if !license.is_active {
            return Access::Denied {
                reason: DenialReason::Deactivated,
            };
        }

        if let Some(expires_at) = license.expires_at {
            if self.clock.now() > expires_at {
                return Access::Denied {
                    reason: DenialReason::Expired,
                };
            }
        }

        // Only previews are count-limited.
        if license.kind == LicenseKind::Preview {
            if let Some(max) = license.max_executions {
                if license.execution_count >= max {
                    return Access::Denied {
                        reason: DenialReason::LimitReached,
                    };
                }
            }
        }

        Access::Granted {
            license_id: license.id,
        }
    }

    /// Charge one execution against a license.
    ///
    /// A single conditional mutation under the write lock, so concurrent
    /// dispatches of the same license cannot lose updates or pass a present
    /// ceiling. Returns the new count.
    pub fn record_execution(&self, id: Uuid) -> Result<u32, LicenseError> {
        let mut licenses = self.licenses.write();
        let license = licenses.get_mut(&id).ok_or(LicenseError::NotFound)?;
        if let Some(max) = license.max_executions {
            if license.execution_count >= max {
                return Err(LicenseError::LimitReached);
            }
        }
        license.execution_count += 1;
        Ok(license.execution_count)
    }

    /// Extend a lease by another month from `max(now, current expiry)` and
    /// reactivate it if it was deactivated.
    pub fn renew(&self, id: Uuid, tx_ref: &str, amount: Decimal) -> Result<License, LicenseError> {
        let now = self.clock.now();
        let mut licenses = self.licenses.write();
        let license = licenses.get_mut(&id).ok_or(LicenseError::NotFound)?;
        if license.kind != LicenseKind::Lease {
            return Err(LicenseError::NotALease);
        }

        let base = match license.expires_at {
            Some(expiry) if expiry > now => expiry,
            _ => now,
        };
        license.expires_at = Some(base + Duration::days(LEASE_DAYS));
        license.transaction_ref = Some(tx_ref.to_owned());
        license.amount_paid += amount;
        license.is_active = true;
        tracing::info!(license = %id, until = %license.expires_at.unwrap(), "lease renewed");
        Ok(license.clone())
    }

    /// Disable a license (refunds, violations). The record is kept.
    pub fn deactivate(&self, id: Uuid) -> Result<(), LicenseError> {
        let mut licenses = self.licenses.write();
        let license = licenses.get_mut(&id).ok_or(LicenseError::NotFound)?;
        license.is_active = false;
        tracing::info!(license = %id, "license deactivated");
        Ok(())
    }

    /// Convert a preview into a permanent license, clearing both bounds.
    pub fn upgrade_to_purchase(
        &self,
        id: Uuid,
        tx_ref: &str,
        amount: Decimal,
    ) -> Result<License, LicenseError> {
        let mut licenses = self.licenses.write();
        let license = licenses.get_mut(&id).ok_or(LicenseError::NotFound)?;
        if license.kind != LicenseKind::Preview {
            return Err(LicenseError::NotAPreview);
        }
        license.kind = LicenseKind::Purchase;
        license.expires_at = None;
        license.max_executions = None;
        license.transaction_ref = Some(tx_ref.to_owned());
        license.amount_paid = amount;
        tracing::info!(license = %id, "preview upgraded to purchase");
        Ok(license.clone())
    }
}

impl Default for LicenseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn fixed_clock() -> Arc<wisp_common::ManualClock> {
        Arc::new(wisp_common::ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn store_with_clock() -> (LicenseStore, Arc<wisp_common::ManualClock>) {
        let clock = fixed_clock();
        (LicenseStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_preview_grants_access() {
        let (store, _) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_preview(user, "network-audit").unwrap();

        assert_eq!(license.kind, LicenseKind::Preview);
        assert_eq!(license.max_executions, Some(PREVIEW_MAX_EXECUTIONS));
        assert!(license.expires_at.is_some());
        assert!(store.authorize(user, "network-audit").is_granted());
    }

    #[test]
    fn test_one_preview_per_pair() {
        let (store, _) = store_with_clock();
        let user = Uuid::new_v4();
        store.issue_preview(user, "network-audit").unwrap();

        let err = store.issue_preview(user, "network-audit").unwrap_err();
        assert_eq!(err, LicenseError::AlreadyLicensed);

        // A different module is a different pair.
        assert!(store.issue_preview(user, "cap-planner").is_ok());
    }

    #[test]
    fn test_preview_expires() {
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        store.issue_preview(user, "network-audit").unwrap();

        clock.advance(Duration::days(PREVIEW_DAYS) + Duration::hours(1));
        assert_eq!(
            store.authorize(user, "network-audit"),
            Access::Denied {
                reason: DenialReason::Expired
            }
        );
    }

    #[test]
    fn test_expired_beats_quota() {
        // Expiry is checked before the ceiling, regardless of quota state.
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_preview(user, "network-audit").unwrap();
        for _ in 0..PREVIEW_MAX_EXECUTIONS {
            store.record_execution(license.id).unwrap();
        }

        clock.advance(Duration::days(PREVIEW_DAYS + 1));
        assert_eq!(
            store.authorize(user, "network-audit"),
            Access::Denied {
                reason: DenialReason::Expired
            }
        );
    }

    #[test]
    fn test_preview_limit_reached() {
        let (store, _) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_preview(user, "network-audit").unwrap();

        for i in 1..=PREVIEW_MAX_EXECUTIONS {
            assert_eq!(store.record_execution(license.id).unwrap(), i);
        }
        assert_eq!(
            store.authorize(user, "network-audit"),
            Access::Denied {
                reason: DenialReason::LimitReached
            }
        );

        // The ceiling is enforced at the increment itself.
        assert_eq!(
            store.record_execution(license.id).unwrap_err(),
            LicenseError::LimitReached
        );
        assert_eq!(
            store.get(license.id).unwrap().execution_count,
            PREVIEW_MAX_EXECUTIONS
        );
    }

    #[test]
    fn test_purchase_never_expires() {
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        store.issue_purchase(user, "network-audit", "tx-1", dec!(499.00));

        clock.advance(Duration::days(3650));
        assert!(store.authorize(user, "network-audit").is_granted());
    }

    #[test]
    fn test_purchase_not_count_limited() {
        let (store, _) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_purchase(user, "network-audit", "tx-1", dec!(499.00));

        for _ in 0..(PREVIEW_MAX_EXECUTIONS * 2) {
            store.record_execution(license.id).unwrap();
        }
        assert!(store.authorize(user, "network-audit").is_granted());
    }

    #[test]
    fn test_lease_renewal_extends_from_expiry() {
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_lease(user, "network-audit", "tx-1", dec!(29.00));
        let first_expiry = license.expires_at.unwrap();

        // Renewing mid-term stacks onto the current expiry, not onto now.
        clock.advance(Duration::days(10));
        let renewed = store.renew(license.id, "tx-2", dec!(29.00)).unwrap();
        assert_eq!(
            renewed.expires_at.unwrap(),
            first_expiry + Duration::days(LEASE_DAYS)
        );
        assert_eq!(renewed.amount_paid, dec!(58.00));
    }

    #[test]
    fn test_lease_renewal_after_lapse_starts_from_now() {
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_lease(user, "network-audit", "tx-1", dec!(29.00));

        clock.advance(Duration::days(LEASE_DAYS + 15));
        store.deactivate(license.id).unwrap();
        let renewed = store.renew(license.id, "tx-2", dec!(29.00)).unwrap();

        assert!(renewed.is_active);
        assert_eq!(
            renewed.expires_at.unwrap(),
            clock.now() + Duration::days(LEASE_DAYS)
        );
        assert!(store.authorize(user, "network-audit").is_granted());
    }

    #[test]
    fn test_renew_rejects_non_lease() {
        let (store, _) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_preview(user, "network-audit").unwrap();
        assert_eq!(
            store.renew(license.id, "tx-1", dec!(29.00)).unwrap_err(),
            LicenseError::NotALease
        );
    }

    #[test]
    fn test_deactivated_license_denied() {
        let (store, _) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_purchase(user, "network-audit", "tx-1", dec!(499.00));
        store.deactivate(license.id).unwrap();

        assert_eq!(
            store.authorize(user, "network-audit"),
            Access::Denied {
                reason: DenialReason::Deactivated
            }
        );
    }

    #[test]
    fn test_upgrade_clears_bounds() {
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        let license = store.issue_preview(user, "network-audit").unwrap();
        store
            .upgrade_to_purchase(license.id, "tx-1", dec!(499.00))
            .unwrap();

        let upgraded = store.get(license.id).unwrap();
        assert_eq!(upgraded.kind, LicenseKind::Purchase);
        assert_eq!(upgraded.expires_at, None);
        assert_eq!(upgraded.max_executions, None);

        clock.advance(Duration::days(3650));
        assert!(store.authorize(user, "network-audit").is_granted());
    }

    #[test]
    fn test_purchase_supersedes_expired_preview() {
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        let preview = store.issue_preview(user, "network-audit").unwrap();

        clock.advance(Duration::days(PREVIEW_DAYS + 1));
        assert!(!store.authorize(user, "network-audit").is_granted());

        let purchase = store.issue_purchase(user, "network-audit", "tx-1", dec!(499.00));
        assert_eq!(purchase.supersedes, Some(preview.id));
        assert!(store.authorize(user, "network-audit").is_granted());

        // The superseded record is kept, untouched.
        assert!(store.get(preview.id).is_some());
    }

    #[test]
    fn test_licenses_for_user_newest_first() {
        let (store, clock) = store_with_clock();
        let user = Uuid::new_v4();
        store.issue_preview(user, "network-audit").unwrap();
        clock.advance(Duration::hours(1));
        store.issue_purchase(user, "network-audit", "tx-1", dec!(499.00));

        let all = store.licenses_for_user(user);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, LicenseKind::Purchase);
        assert_eq!(all[1].kind, LicenseKind::Preview);
    }
}
