//! Reconciliation snapshot cache.
//!
//! A TTL-bound gencode -> order-snapshot map used as the fast path for
//! webhook matching. Best-effort only: the order row stays the single
//! source of truth, and a lost or expired entry merely forces the durable
//! fallback lookup. Expiry is checked lazily on read; there is no
//! background sweep.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::models::{OrderRecord, OrderSnapshot, SnapshotLine};
use crate::services::metrics::SNAPSHOT_CACHE;

pub struct SnapshotCache {
    entries: DashMap<String, OrderSnapshot>,
    ttl: Duration,
}

impl SnapshotCache {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Build and store a snapshot for an order under its gencode.
    /// Returns the stored snapshot.
    pub fn set(&self, order: &OrderRecord, lines: Vec<SnapshotLine>) -> Option<OrderSnapshot> {
        let gencode = order.gencode.clone()?;
        let now = Utc::now();
        let snapshot = OrderSnapshot {
            gencode: gencode.clone(),
            order_id: order.order_id,
            user_id: order.user_id,
            total_amount: order.total_amount,
            status: order.status.clone(),
            payment_type: order.payment_type.clone(),
            lines,
            created_utc: now,
            expires_utc: now + self.ttl,
        };
        self.entries.insert(gencode, snapshot.clone());
        SNAPSHOT_CACHE.with_label_values(&["set"]).inc();
        Some(snapshot)
    }

    /// Look up a snapshot. An expired entry is evicted and reported as a
    /// miss, so callers always fall back to the durable store.
    pub fn get(&self, gencode: &str) -> Option<OrderSnapshot> {
        let now = Utc::now();
        match self.entries.get(gencode) {
            Some(entry) if !entry.is_expired(now) => {
                SNAPSHOT_CACHE.with_label_values(&["hit"]).inc();
                Some(entry.clone())
            }
            Some(entry) => {
                let order_id = entry.order_id;
                drop(entry);
                self.entries.remove(gencode);
                SNAPSHOT_CACHE.with_label_values(&["expired"]).inc();
                debug!(gencode, %order_id, "Snapshot expired, evicted on read");
                None
            }
            None => {
                SNAPSHOT_CACHE.with_label_values(&["miss"]).inc();
                None
            }
        }
    }

    /// Drop a snapshot once it has served its purpose (order settled).
    pub fn remove(&self, gencode: &str) -> Option<Uuid> {
        self.entries.remove(gencode).map(|(_, snapshot)| {
            SNAPSHOT_CACHE.with_label_values(&["remove"]).inc();
            snapshot.order_id
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn order_with_gencode(gencode: Option<&str>) -> OrderRecord {
        let now = Utc::now();
        OrderRecord {
            order_id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
            total_amount: Decimal::from(200),
            status: "pending".to_string(),
            payment_type: "Transfer".to_string(),
            gencode: gencode.map(|g| g.to_string()),
            placed_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = SnapshotCache::new(30);
        let order = order_with_gencode(Some("PAYAB12"));
        cache.set(&order, vec![]).expect("snapshot stored");

        let hit = cache.get("PAYAB12").expect("hit");
        assert_eq!(hit.order_id, order.order_id);
        assert_eq!(hit.total_amount, order.total_amount);
    }

    #[test]
    fn order_without_gencode_is_not_cached() {
        let cache = SnapshotCache::new(30);
        let order = order_with_gencode(None);
        assert!(cache.set(&order, vec![]).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        // Zero TTL makes every entry expired immediately.
        let cache = SnapshotCache::new(0);
        let order = order_with_gencode(Some("PAYZZ99"));
        cache.set(&order, vec![]);

        assert!(cache.get("PAYZZ99").is_none());
        assert!(cache.is_empty(), "expired entry must be evicted");
    }

    #[test]
    fn remove_returns_order_id() {
        let cache = SnapshotCache::new(30);
        let order = order_with_gencode(Some("PAYQQ11"));
        cache.set(&order, vec![]);

        assert_eq!(cache.remove("PAYQQ11"), Some(order.order_id));
        assert!(cache.get("PAYQQ11").is_none());
    }
}
