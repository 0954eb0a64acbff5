//! In-process push notifications.
//!
//! Each user gets an unbounded channel; dispatch never blocks and never
//! fails the operation that triggered it. A payment is settled whether or
//! not anyone is listening.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::Notification;

#[derive(Default)]
pub struct Notifier {
    channels: DashMap<Uuid, mpsc::UnboundedSender<Notification>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a user, replacing any previous one.
    pub fn subscribe(&self, user_id: Uuid) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(user_id, tx);
        rx
    }

    pub fn unsubscribe(&self, user_id: Uuid) {
        self.channels.remove(&user_id);
    }

    /// Fire-and-forget delivery. Anonymous orders and missing or closed
    /// channels drop the notification with a log line.
    pub fn dispatch(&self, user_id: Option<Uuid>, notification: Notification) {
        let Some(user_id) = user_id else {
            debug!(
                order_id = %notification.order_id,
                "No user attached to order, notification dropped"
            );
            return;
        };

        match self.channels.get(&user_id) {
            Some(tx) => {
                if tx.send(notification).is_err() {
                    warn!(user_id = %user_id, "Notification channel closed, dropping");
                    drop(tx);
                    self.channels.remove(&user_id);
                }
            }
            None => {
                debug!(user_id = %user_id, "No notification subscriber for user");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationEvent;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn sample(order_id: Uuid) -> Notification {
        Notification {
            event: NotificationEvent::PaymentConfirmed,
            order_id,
            amount: Decimal::new(150_000, 0),
            gencode: Some("PAYAB234".to_string()),
            lines: vec![],
            sent_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let notifier = Notifier::new();
        let user_id = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let mut rx = notifier.subscribe(user_id);

        notifier.dispatch(Some(user_id), sample(order_id));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.order_id, order_id);
        assert_eq!(got.event, NotificationEvent::PaymentConfirmed);
    }

    #[tokio::test]
    async fn dispatch_without_subscriber_is_silent() {
        let notifier = Notifier::new();
        notifier.dispatch(Some(Uuid::new_v4()), sample(Uuid::new_v4()));
        notifier.dispatch(None, sample(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn closed_channel_is_evicted() {
        let notifier = Notifier::new();
        let user_id = Uuid::new_v4();
        let rx = notifier.subscribe(user_id);
        drop(rx);

        notifier.dispatch(Some(user_id), sample(Uuid::new_v4()));
        assert!(notifier.channels.get(&user_id).is_none());
    }
}
