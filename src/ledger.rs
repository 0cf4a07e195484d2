//! Per-user storage accounting.
//!
//! The ledger never reads a counter and writes it back. Credits and debits
//! are delegated to the store's atomic increment/decrement primitives, so two
//! workers finishing Images of the same user at the same instant both land.
//!
//! ```text
//!   worker (image ready) ──credit(output bytes)──┐
//!                                                ├──► users.storage_used
//!   resource deletion  ──debit(footprint)───────┘
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::store::Store;

/// Usage ratio at which a user is warned their quota is filling up.
pub const WARNING_THRESHOLD_PERCENT: f64 = 80.0;

/// Usage ratio at which the warning becomes critical.
pub const CRITICAL_THRESHOLD_PERCENT: f64 = 90.0;

// =============================================================================
// Usage
// =============================================================================

/// Severity of a user's quota consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWarning {
    None,
    Above80,
    Above90,
}

/// Snapshot of one user's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub used: u64,
    pub quota: u64,
}

impl Usage {
    pub fn remaining(&self) -> u64 {
        self.quota.saturating_sub(self.used)
    }

    /// Percentage of the quota consumed. A zero quota counts as full.
    pub fn percent_used(&self) -> f64 {
        if self.quota == 0 {
            return 100.0;
        }
        self.used as f64 / self.quota as f64 * 100.0
    }

    pub fn warning(&self) -> UsageWarning {
        let percent = self.percent_used();
        if percent >= CRITICAL_THRESHOLD_PERCENT {
            UsageWarning::Above90
        } else if percent >= WARNING_THRESHOLD_PERCENT {
            UsageWarning::Above80
        } else {
            UsageWarning::None
        }
    }
}

/// Render a byte count with a binary unit, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

// =============================================================================
// QuotaLedger
// =============================================================================

/// Atomic per-user storage counters.
pub struct QuotaLedger {
    store: Arc<dyn Store>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Add `bytes` to the user's usage. Returns the new total.
    pub async fn credit(&self, user_id: &str, bytes: u64) -> Result<u64, LedgerError> {
        let used = self
            .store
            .increment_storage_used(user_id, bytes)
            .await?
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;

        debug!(user_id, bytes, used, "Ledger credited");
        Ok(used)
    }

    /// Release `bytes` from the user's usage, never going below zero.
    /// Returns the new total.
    pub async fn debit(&self, user_id: &str, bytes: u64) -> Result<u64, LedgerError> {
        let used = self
            .store
            .decrement_storage_used(user_id, bytes)
            .await?
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;

        debug!(user_id, bytes, used, "Ledger debited");
        Ok(used)
    }

    pub async fn usage(&self, user_id: &str) -> Result<Usage, LedgerError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;

        Ok(Usage {
            used: user.storage_used,
            quota: user.storage_quota,
        })
    }

    /// Check that `bytes` more would fit in the user's remaining quota.
    ///
    /// This is an admission check for callers that are about to accept an
    /// upload; it does not reserve anything.
    pub async fn admit(&self, user_id: &str, bytes: u64) -> Result<Usage, LedgerError> {
        let usage = self.usage(user_id).await?;
        if bytes > usage.remaining() {
            info!(
                user_id,
                requested = %format_bytes(bytes),
                remaining = %format_bytes(usage.remaining()),
                "Upload refused: quota exceeded"
            );
            return Err(LedgerError::QuotaExceeded {
                user_id: user_id.to_string(),
                requested: bytes,
                remaining: usage.remaining(),
            });
        }

        let after = Usage {
            used: usage.used.saturating_add(bytes),
            quota: usage.quota,
        };
        if after.warning() != UsageWarning::None {
            warn!(
                user_id,
                percent = %format!("{:.1}", after.percent_used()),
                "Storage usage approaching quota"
            );
        }
        Ok(usage)
    }
}

// =============================================================================
// Tests
// =============================================================================
