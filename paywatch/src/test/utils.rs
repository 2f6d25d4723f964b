//! Test utilities for end-to-end engine tests
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::Config;
use crate::db::handlers::{InMemoryInvoiceRepository, InMemoryWebhookRepository};
use crate::db::models::invoices::{Invoice, InvoiceStatus, PaymentMethod, PaymentMethodId};
use crate::db::models::webhooks::{AuthorizedWebhookEvents, Webhook, WebhookDelivery};
use crate::events::{NewOnChainTransactionEvent, TransactionData, TransactionOutput};
use crate::webhooks::transport::{TransportError, WebhookRequest, WebhookResponse, WebhookTransport};
use crate::{Collaborators, Engine};

pub const SECRET: &str = "merchant-secret";

pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.webhooks.timeout = Duration::from_secs(5);
    config.webhooks.shutdown_timeout = Duration::from_secs(2);
    config.watcher.retry_delay = Duration::from_millis(200);
    config
}

/// A BTC invoice for 100 USD at 10000 USD/BTC, so 0.01 BTC is due.
pub fn btc_invoice(id: &str, store_id: &str, address: &str, expires_in: chrono::Duration) -> Invoice {
    Invoice::builder()
        .id(id)
        .store_id(store_id)
        .price(dec!(100))
        .expiration_time(Utc::now() + expires_in)
        .monitoring_expiration(Utc::now() + expires_in + chrono::Duration::hours(1))
        .payment_methods(vec![PaymentMethod {
            id: PaymentMethodId::on_chain("BTC"),
            rate: dec!(10000),
            divisibility: 8,
            network_fee: dec!(0),
            destination: address.to_string(),
        }])
        .build()
}

pub fn btc_transaction(tx_id: &str, address: &str, value: Decimal, confirmations: u32) -> NewOnChainTransactionEvent {
    NewOnChainTransactionEvent {
        crypto_code: "BTC".to_string(),
        derivation_strategy: "xpub-test".to_string(),
        transaction: TransactionData {
            tx_id: tx_id.to_string(),
            confirmations,
            replaceable: false,
            replacing: Vec::new(),
        },
        outputs: vec![TransactionOutput {
            address: address.to_string(),
            value,
            index: 0,
        }],
    }
}

pub fn create_test_webhook(store_id: &str, url: &str, events: AuthorizedWebhookEvents) -> Webhook {
    Webhook {
        id: Uuid::new_v4(),
        store_id: store_id.to_string(),
        url: url.to_string(),
        secret: SECRET.to_string(),
        active: true,
        authorized_events: events,
        automatic_redelivery: true,
        created_at: Utc::now(),
    }
}

/// Fake merchant endpoint: answers 200 unless told otherwise, and can hold requests for a URL
/// until released.
#[derive(Default)]
pub struct FakeMerchant {
    statuses: Mutex<HashMap<String, u16>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    requests: Mutex<Vec<WebhookRequest>>,
}

impl FakeMerchant {
    pub fn respond(&self, url: &str, status: u16) {
        self.statuses.lock().insert(url.to_string(), status);
    }

    /// Block every request to `url` until a matching [`FakeMerchant::release`].
    pub fn hold(&self, url: &str) {
        self.gates.lock().insert(url.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, url: &str, requests: usize) {
        if let Some(gate) = self.gates.lock().get(url) {
            gate.add_permits(requests);
        }
    }

    pub fn requests_to(&self, url: &str) -> Vec<WebhookRequest> {
        self.requests.lock().iter().filter(|r| r.url == url).cloned().collect()
    }
}

#[async_trait]
impl WebhookTransport for FakeMerchant {
    async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse, TransportError> {
        let url = request.url.clone();
        self.requests.lock().push(request);

        let gate = self.gates.lock().get(&url).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|e| TransportError::Request(e.to_string()))?.forget();
        }
        let status = self.statuses.lock().get(&url).copied().unwrap_or(200);
        Ok(WebhookResponse { status })
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub invoices: Arc<InMemoryInvoiceRepository>,
    pub webhooks: Arc<InMemoryWebhookRepository>,
}

pub fn start_test_engine(transport: Arc<dyn WebhookTransport>) -> TestEngine {
    start_test_engine_with(
        create_test_config(),
        Arc::new(InMemoryInvoiceRepository::new()),
        Arc::new(InMemoryWebhookRepository::new()),
        transport,
    )
}

pub fn start_test_engine_with(
    config: Config,
    invoices: Arc<InMemoryInvoiceRepository>,
    webhooks: Arc<InMemoryWebhookRepository>,
    transport: Arc<dyn WebhookTransport>,
) -> TestEngine {
    let collaborators = Collaborators::builder()
        .invoices(invoices.clone())
        .webhooks(webhooks.clone())
        .transport(transport)
        .build();
    TestEngine {
        engine: Engine::start(config, collaborators),
        invoices,
        webhooks,
    }
}

/// Poll until `webhook_id` has at least `count` delivery rows.
pub async fn wait_for_deliveries(repo: &InMemoryWebhookRepository, webhook_id: Uuid, count: usize) -> Vec<WebhookDelivery> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let rows: Vec<_> = repo.all_deliveries().into_iter().filter(|d| d.webhook_id == webhook_id).collect();
            if rows.len() >= count {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for deliveries")
}

pub async fn wait_for_status(repo: &InMemoryInvoiceRepository, id: &str, status: InvoiceStatus) -> Invoice {
    use crate::db::handlers::InvoiceRepository;

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(invoice) = repo.get_invoice(id).await.unwrap()
                && invoice.status == status
            {
                return invoice;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for invoice status")
}

/// Block until every watch request sent before this call has been processed.
pub async fn settle(test: &TestEngine) {
    let sentinel = format!("sentinel-{}", Uuid::new_v4());
    let mut marker = btc_invoice(&sentinel, "sentinel-store", "", chrono::Duration::minutes(-1));
    marker.payment_methods.clear();
    test.invoices.insert(marker);
    test.engine.watcher().watch(sentinel.clone());
    wait_for_status(&test.invoices, &sentinel, InvoiceStatus::Expired).await;
}

pub fn body_json(request: &WebhookRequest) -> serde_json::Value {
    serde_json::from_slice(&request.body).expect("webhook body is JSON")
}
