//! Webhook subscription and delivery store collaborator.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::instrument;

use crate::db::errors::{DbError, Result};
use crate::db::models::webhooks::{DeliveryChain, DeliveryStatus, Webhook, WebhookDelivery};
use crate::types::{DeliveryId, WebhookId, abbrev_uuid};

/// Storage operations the webhook sender relies on.
///
/// Subscriptions are read-only here; deliveries are append-only.
#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn get_webhooks_for_store(&self, store_id: &str) -> Result<Vec<Webhook>>;

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>>;

    async fn add_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>>;

    /// Deliveries of one webhook, oldest first.
    async fn list_deliveries(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>>;

    /// Chains whose newest attempt ended in `HttpError` or `Failed`, oldest failure first.
    ///
    /// Used on startup to put unfinished redelivery ladders back on the scheduler.
    async fn get_failed_delivery_chains(&self) -> Result<Vec<DeliveryChain>>;
}

/// In-memory [`WebhookRepository`] used by the standalone binary and the tests.
#[derive(Default)]
pub struct InMemoryWebhookRepository {
    webhooks: DashMap<WebhookId, Webhook>,
    deliveries: Mutex<Vec<WebhookDelivery>>,
}

impl InMemoryWebhookRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription, as the merchant-facing API would.
    pub fn upsert_webhook(&self, webhook: Webhook) {
        self.webhooks.insert(webhook.id, webhook);
    }

    pub fn set_active(&self, id: WebhookId, active: bool) {
        if let Some(mut webhook) = self.webhooks.get_mut(&id) {
            webhook.active = active;
        }
    }

    /// Blank a stored request body, as the retention job does.
    pub fn prune_delivery(&self, id: DeliveryId) {
        if let Some(delivery) = self.deliveries.lock().iter_mut().find(|d| d.id == id) {
            delivery.request.clear();
            delivery.pruned = true;
        }
    }

    /// All deliveries across webhooks, in insertion order.
    pub fn all_deliveries(&self) -> Vec<WebhookDelivery> {
        self.deliveries.lock().clone()
    }
}

#[async_trait]
impl WebhookRepository for InMemoryWebhookRepository {
    async fn get_webhooks_for_store(&self, store_id: &str) -> Result<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self
            .webhooks
            .iter()
            .filter(|entry| entry.store_id == store_id)
            .map(|entry| entry.value().clone())
            .collect();
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        Ok(self.webhooks.get(&id).map(|entry| entry.value().clone()))
    }

    #[instrument(skip(self, delivery), fields(delivery_id = %abbrev_uuid(&delivery.id), webhook_id = %abbrev_uuid(&delivery.webhook_id)), err)]
    async fn add_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut deliveries = self.deliveries.lock();
        if deliveries.iter().any(|d| d.id == delivery.id) {
            return Err(DbError::Conflict {
                entity_type: "webhook delivery".to_string(),
                entity_id: delivery.id.to_string(),
                reason: "delivery rows are append-only".to_string(),
            });
        }
        deliveries.push(delivery.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        Ok(self.deliveries.lock().iter().find(|d| d.id == id).cloned())
    }

    async fn list_deliveries(&self, webhook_id: WebhookId) -> Result<Vec<WebhookDelivery>> {
        Ok(self
            .deliveries
            .lock()
            .iter()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect())
    }

    async fn get_failed_delivery_chains(&self) -> Result<Vec<DeliveryChain>> {
        let deliveries = self.deliveries.lock();
        let mut chains: HashMap<DeliveryId, DeliveryChain> = HashMap::new();
        // Rows are appended in attempt order, so the last one seen is the newest
        for delivery in deliveries.iter() {
            chains
                .entry(delivery.original_delivery_id)
                .and_modify(|chain| {
                    chain.last = delivery.clone();
                    chain.attempts += 1;
                })
                .or_insert_with(|| DeliveryChain {
                    last: delivery.clone(),
                    attempts: 1,
                });
        }

        let mut failed: Vec<DeliveryChain> = chains
            .into_values()
            .filter(|chain| matches!(chain.last.status, DeliveryStatus::HttpError | DeliveryStatus::Failed))
            .collect();
        failed.sort_by_key(|chain| chain.last.timestamp);
        Ok(failed)
    }
}
