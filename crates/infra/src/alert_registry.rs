//! Alert registry: the lifecycle-scoped store of alert rows.
//!
//! The engine computes which conditions should be active; this registry owns
//! the rows, raises and auto-resolves them, and handles explicit staff
//! resolution. A resolved alert is never reopened; if its condition holds
//! again later, a fresh alert is created.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use rxledger_alerts::{Alert, AlertDelta, AlertId, AlertStatus, ConditionKey};
use rxledger_catalog::MedicineId;
use rxledger_core::{ActorId, AggregateId, DomainError, DomainResult};

/// Raised / auto-resolved alerts from one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertChanges {
    pub raised: Vec<Alert>,
    pub auto_resolved: Vec<Alert>,
}

impl AlertChanges {
    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.auto_resolved.is_empty()
    }
}

/// Process-wide alert table.
#[derive(Debug, Default)]
pub struct AlertRegistry {
    alerts: RwLock<BTreeMap<AlertId, Alert>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alert_id: &AlertId) -> Option<Alert> {
        self.alerts
            .read()
            .ok()
            .and_then(|map| map.get(alert_id).cloned())
    }

    /// All alerts, optionally only the active ones, ordered by id
    /// (creation order, since ids are time-ordered).
    pub fn list(&self, active_only: bool) -> Vec<Alert> {
        match self.alerts.read() {
            Ok(map) => map
                .values()
                .filter(|a| !active_only || a.is_active())
                .cloned()
                .collect(),
            Err(_) => vec![],
        }
    }

    pub fn list_for_medicine(&self, medicine_id: MedicineId, active_only: bool) -> Vec<Alert> {
        self.list(active_only)
            .into_iter()
            .filter(|a| a.medicine_id == medicine_id)
            .collect()
    }

    /// Condition keys of the currently active alerts for one medicine.
    pub fn active_conditions(&self, medicine_id: MedicineId) -> BTreeSet<ConditionKey> {
        self.list_for_medicine(medicine_id, true)
            .iter()
            .map(Alert::condition_key)
            .collect()
    }

    /// Apply one evaluation delta: raise fresh conditions, auto-resolve
    /// cleared ones. Raising an already-active condition is a no-op, so the
    /// pass is idempotent.
    pub fn apply_delta(&self, delta: &AlertDelta, now: DateTime<Utc>) -> AlertChanges {
        let mut changes = AlertChanges::default();
        let Ok(mut map) = self.alerts.write() else {
            return changes;
        };

        for key in &delta.raise {
            let already_active = map
                .values()
                .any(|a| a.is_active() && a.condition_key() == *key);
            if already_active {
                continue;
            }

            let alert = Alert {
                id: AlertId::new(AggregateId::new()),
                kind: key.kind,
                medicine_id: key.medicine_id,
                batch_id: key.batch_id,
                status: AlertStatus::Active,
                created_at: now,
                resolved_at: None,
                resolved_by: None,
                notes: None,
            };
            map.insert(alert.id, alert.clone());
            changes.raised.push(alert);
        }

        for key in &delta.resolve {
            let resolved: Vec<AlertId> = map
                .values()
                .filter(|a| a.is_active() && a.condition_key() == *key)
                .map(|a| a.id)
                .collect();
            for id in resolved {
                if let Some(alert) = map.get_mut(&id) {
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_at = Some(now);
                    changes.auto_resolved.push(alert.clone());
                }
            }
        }

        changes
    }

    /// Explicit staff resolution.
    pub fn resolve(
        &self,
        alert_id: AlertId,
        resolved_by: ActorId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Alert> {
        let mut map = self
            .alerts
            .write()
            .map_err(|_| DomainError::invariant("alert registry lock poisoned"))?;

        let alert = map.get_mut(&alert_id).ok_or(DomainError::NotFound)?;
        if alert.status == AlertStatus::Resolved {
            return Err(DomainError::conflict(format!(
                "alert {alert_id} is already resolved"
            )));
        }

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.resolved_by = Some(resolved_by);
        alert.notes = notes;
        Ok(alert.clone())
    }
}
