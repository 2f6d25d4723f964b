//! Webhook delivery engine.
//!
//! Invoice events are turned into one delivery per matching subscription. Deliveries for the
//! same subscription go through a [`KeyedQueue`] keyed by webhook id, so a merchant endpoint
//! always sees events in the order they happened. Each attempt writes exactly one
//! [`WebhookDelivery`] row once it finishes.
//!
//! Failed attempts of a subscription with automatic redelivery enabled are retried on the
//! [`DelayedScheduler`] following `webhooks.redelivery_schedule_secs`. Every retry re-reads
//! the subscription and the previous attempt's stored request, so a webhook that was
//! disabled or had its filter changed in the meantime stops the ladder. Ladders interrupted
//! by a restart are rebuilt from the delivery rows by [`WebhookSender::resume_redeliveries`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::db::handlers::webhooks::WebhookRepository;
use crate::db::models::webhooks::{DeliveryStatus, Webhook, WebhookDelivery};
use crate::errors::{Error, Result};
use crate::events::{EventBus, InvoiceEvent, Subscription};
use crate::tasks::{DelayedScheduler, KeyedQueue};
use crate::types::{DeliveryId, WebhookId, abbrev_uuid};

use super::events::{WebhookEvent, WebhookEventData, WebhookEventType, redelivery_body, stored_event_type};
use super::signing::sign_payload;
use super::transport::{WebhookRequest, WebhookTransport};

/// A delivery waiting in its webhook's queue.
#[derive(Debug, Clone)]
struct PendingDelivery {
    id: DeliveryId,
    original_delivery_id: DeliveryId,
    webhook_id: WebhookId,
    body: Vec<u8>,
    /// 1 for the first attempt of an event
    attempt: u32,
    /// Failures enter the automatic redelivery ladder
    automatic: bool,
}

/// Result of one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub status: DeliveryStatus,
    pub http_code: Option<u16>,
    pub error_message: Option<String>,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    fn failed(error: String) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            http_code: None,
            error_message: Some(error),
        }
    }
}

/// Cloneable handle to the delivery engine.
#[derive(Clone)]
pub struct WebhookSender {
    repo: Arc<dyn WebhookRepository>,
    transport: Arc<dyn WebhookTransport>,
    queue: KeyedQueue<WebhookId>,
    scheduler: DelayedScheduler,
    config: Arc<WebhookConfig>,
}

impl WebhookSender {
    pub fn new(
        repo: Arc<dyn WebhookRepository>,
        transport: Arc<dyn WebhookTransport>,
        queue: KeyedQueue<WebhookId>,
        scheduler: DelayedScheduler,
        config: WebhookConfig,
    ) -> Self {
        Self {
            repo,
            transport,
            queue,
            scheduler,
            config: Arc::new(config),
        }
    }

    /// Start reacting to invoice events published on `bus`.
    pub fn subscribe(&self, bus: &EventBus) -> Subscription {
        let sender = self.clone();
        bus.subscribe_async(move |event: InvoiceEvent| {
            let sender = sender.clone();
            async move { sender.handle_invoice_event(event).await.map(|_| ()) }
        })
    }

    /// Enqueue one delivery per active subscription of the invoice's store that accepts the
    /// event. Returns the number of deliveries enqueued.
    #[instrument(skip(self, event), fields(invoice_id = %event.invoice.id, code = %event.code))]
    pub async fn handle_invoice_event(&self, event: InvoiceEvent) -> anyhow::Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let Some(data) = WebhookEventData::from_invoice_event(&event) else {
            return Ok(0);
        };
        let event_type = data.event_type();

        let webhooks = self.repo.get_webhooks_for_store(&event.invoice.store_id).await?;
        let mut enqueued = 0;
        for webhook in webhooks.into_iter().filter(|w| w.accepts_event(event_type)) {
            let delivery_id = Uuid::new_v4();
            let payload = WebhookEvent::new(
                delivery_id,
                webhook.id,
                event.invoice.id.clone(),
                event.invoice.store_id.clone(),
                data.clone(),
            );
            let delivery = PendingDelivery {
                id: delivery_id,
                original_delivery_id: delivery_id,
                webhook_id: webhook.id,
                body: serde_json::to_vec(&payload)?,
                attempt: 1,
                automatic: true,
            };
            if self.enqueue(delivery) {
                enqueued += 1;
            }
        }

        debug!(%event_type, enqueued, "Webhook deliveries enqueued");
        Ok(enqueued)
    }

    fn enqueue(&self, delivery: PendingDelivery) -> bool {
        let sender = self.clone();
        self.queue
            .enqueue(delivery.webhook_id, move |token| async move { sender.deliver(delivery, token).await })
    }

    #[instrument(skip_all, fields(delivery_id = %abbrev_uuid(&delivery.id), webhook_id = %abbrev_uuid(&delivery.webhook_id), attempt = delivery.attempt))]
    async fn deliver(&self, delivery: PendingDelivery, token: CancellationToken) -> anyhow::Result<()> {
        let Some(webhook) = self.repo.get_webhook(delivery.webhook_id).await? else {
            warn!("Webhook no longer exists, dropping delivery");
            return Ok(());
        };

        let outcome = self.send(&webhook, delivery.body.clone(), &token).await;
        counter!("paywatch_webhook_deliveries_total", "outcome" => outcome.status.as_str()).increment(1);

        match outcome.status {
            DeliveryStatus::HttpSuccess => debug!(http_code = ?outcome.http_code, "Webhook delivered"),
            DeliveryStatus::Pending => info!("Webhook delivery interrupted by shutdown"),
            DeliveryStatus::HttpError | DeliveryStatus::Failed => warn!(
                http_code = ?outcome.http_code,
                error = outcome.error_message.as_deref().unwrap_or_default(),
                "Webhook delivery failed"
            ),
        }
        let failed = matches!(outcome.status, DeliveryStatus::HttpError | DeliveryStatus::Failed);

        let written = self
            .repo
            .add_delivery(&WebhookDelivery {
                id: delivery.id,
                webhook_id: delivery.webhook_id,
                original_delivery_id: delivery.original_delivery_id,
                timestamp: Utc::now(),
                request: delivery.body.clone(),
                status: outcome.status,
                http_code: outcome.http_code,
                error_message: outcome.error_message,
                pruned: false,
            })
            .await;
        if let Err(e) = &written {
            // The retry below still runs from the in-memory request
            error!(error = %e, "Failed to record webhook delivery");
        }

        if failed && delivery.automatic && webhook.automatic_redelivery {
            self.schedule_redelivery(delivery, Duration::ZERO);
        }
        written?;
        Ok(())
    }

    /// Sign and POST `body`, bounded by the send timeout and `token`.
    async fn send(&self, webhook: &Webhook, body: Vec<u8>, token: &CancellationToken) -> SendOutcome {
        let request = WebhookRequest {
            url: webhook.url.clone(),
            signature: sign_payload(&body, &webhook.secret),
            body,
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => SendOutcome {
                status: DeliveryStatus::Pending,
                http_code: None,
                error_message: Some("Interrupted by shutdown".to_string()),
            },
            result = tokio::time::timeout(self.config.timeout, self.transport.send(request)) => match result {
                Ok(Ok(response)) if response.is_success() => SendOutcome {
                    status: DeliveryStatus::HttpSuccess,
                    http_code: Some(response.status),
                    error_message: None,
                },
                Ok(Ok(response)) => SendOutcome {
                    status: DeliveryStatus::HttpError,
                    http_code: Some(response.status),
                    error_message: Some(format!("HTTP {}", response.status)),
                },
                Ok(Err(e)) => SendOutcome::failed(e.to_string()),
                Err(_) => SendOutcome::failed(format!(
                    "Timed out after {}",
                    humantime::format_duration(self.config.timeout)
                )),
            },
        }
    }

    /// Put the next rung of `failed`'s ladder on the scheduler, `elapsed` after the failure.
    ///
    /// Returns false once the ladder is exhausted or the scheduler is stopped.
    fn schedule_redelivery(&self, failed: PendingDelivery, elapsed: Duration) -> bool {
        let attempt = failed.attempt + 1;
        let Some(delay) = self.config.redelivery_delay(attempt) else {
            info!(attempts = failed.attempt, "Automatic redelivery attempts exhausted");
            return false;
        };
        let delay = delay.saturating_sub(elapsed);

        let sender = self.clone();
        debug!(delay = %humantime::format_duration(delay), attempt, "Scheduling automatic redelivery");

        self.scheduler.schedule(delay, move || async move {
            if let Err(e) = sender.redeliver_automatically(failed, attempt).await {
                warn!(error = %e, "Automatic redelivery could not be started");
            }
        })
    }

    /// Enqueue attempt number `attempt` of the chain `previous` belongs to.
    ///
    /// The stored row wins over `previous.body` so that pruning stops the ladder. The
    /// in-memory body is only used when the row was never written.
    #[instrument(skip(self, previous), fields(previous = %abbrev_uuid(&previous.id), webhook_id = %abbrev_uuid(&previous.webhook_id)))]
    async fn redeliver_automatically(&self, previous: PendingDelivery, attempt: u32) -> anyhow::Result<()> {
        let request = match self.repo.get_delivery(previous.id).await {
            Ok(Some(stored)) if stored.pruned || stored.request.is_empty() => {
                info!("Stored request was pruned, stopping redelivery");
                return Ok(());
            }
            Ok(Some(stored)) => stored.request,
            Ok(None) => {
                warn!("Previous delivery row missing, retrying with the request held in memory");
                previous.body
            }
            Err(e) => {
                warn!(error = %e, "Could not read previous delivery, retrying with the request held in memory");
                previous.body
            }
        };

        let webhook = self.repo.get_webhook(previous.webhook_id).await?;
        let still_wanted = match (&webhook, stored_event_type(&request)) {
            (Some(webhook), Some(event_type)) => webhook.automatic_redelivery && webhook.accepts_event(event_type),
            _ => false,
        };
        if !still_wanted {
            info!("Webhook no longer wants this event, stopping redelivery");
            return Ok(());
        }

        let id = Uuid::new_v4();
        self.enqueue(PendingDelivery {
            id,
            original_delivery_id: previous.original_delivery_id,
            webhook_id: previous.webhook_id,
            body: redelivery_body(&request, id)?,
            attempt,
            automatic: true,
        });
        Ok(())
    }

    /// Rebuild the automatic redelivery ladders a previous run left unfinished.
    ///
    /// Each chain whose newest attempt failed gets its next rung scheduled, counting the time
    /// already spent since that attempt. Returns the number of ladders resumed.
    #[instrument(skip(self))]
    pub async fn resume_redeliveries(&self) -> anyhow::Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }

        let now = Utc::now();
        let mut resumed = 0;
        for chain in self.repo.get_failed_delivery_chains().await? {
            let last = chain.last;
            if last.pruned || chain.attempts >= self.config.max_attempts {
                continue;
            }
            match self.repo.get_webhook(last.webhook_id).await? {
                Some(webhook) if webhook.automatic_redelivery => {}
                _ => continue,
            }

            let elapsed = (now - last.timestamp).to_std().unwrap_or_default();
            let failed = PendingDelivery {
                id: last.id,
                original_delivery_id: last.original_delivery_id,
                webhook_id: last.webhook_id,
                body: last.request,
                attempt: chain.attempts,
                automatic: true,
            };
            if self.schedule_redelivery(failed, elapsed) {
                resumed += 1;
            }
        }

        if resumed > 0 {
            info!(resumed, "Automatic redeliveries resumed");
        }
        Ok(resumed)
    }

    /// Send a past delivery again under a new id. Single attempt, no automatic retries.
    #[instrument(skip(self), fields(delivery_id = %abbrev_uuid(&delivery_id)), err)]
    pub async fn redeliver(&self, delivery_id: DeliveryId) -> Result<DeliveryId> {
        let stored = self.repo.get_delivery(delivery_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Webhook delivery".to_string(),
            id: delivery_id.to_string(),
        })?;
        if stored.pruned || stored.request.is_empty() {
            return Err(Error::BadRequest {
                message: "The request body of this delivery has been pruned".to_string(),
            });
        }
        if self.repo.get_webhook(stored.webhook_id).await?.is_none() {
            return Err(Error::NotFound {
                resource: "Webhook".to_string(),
                id: stored.webhook_id.to_string(),
            });
        }

        let id = Uuid::new_v4();
        let delivery = PendingDelivery {
            id,
            original_delivery_id: stored.original_delivery_id,
            webhook_id: stored.webhook_id,
            body: redelivery_body(&stored.request, id)?,
            attempt: 1,
            automatic: false,
        };
        if !self.enqueue(delivery) {
            return Err(Error::Internal {
                operation: "enqueue redelivery: delivery queue is shut down".to_string(),
            });
        }
        info!(new_delivery_id = %abbrev_uuid(&id), "Redelivery enqueued");
        Ok(id)
    }

    /// Send a placeholder event to a webhook and report the outcome. Nothing is persisted.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&webhook_id)), err)]
    pub async fn test_webhook(&self, webhook_id: WebhookId, event_type: WebhookEventType) -> Result<SendOutcome> {
        let webhook = self.repo.get_webhook(webhook_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        })?;

        let payload = WebhookEvent::new(
            Uuid::new_v4(),
            webhook.id,
            format!("__test__{}__test__", Uuid::new_v4()),
            webhook.store_id.clone(),
            WebhookEventData::sample(event_type),
        );
        let body = serde_json::to_vec(&payload).map_err(anyhow::Error::from)?;

        Ok(self.send(&webhook, body, &self.queue.shutdown_token()).await)
    }
}
