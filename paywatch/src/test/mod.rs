pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use utils::{
    FakeMerchant, SECRET, TestEngine, body_json, btc_invoice, btc_transaction, create_test_config, create_test_webhook, settle,
    start_test_engine, start_test_engine_with, wait_for_deliveries, wait_for_status,
};

use crate::db::handlers::{InvoiceRepository, WebhookRepository};
use crate::db::models::invoices::{InvoiceExceptionStatus, InvoiceStatus};
use crate::db::models::webhooks::{AuthorizedWebhookEvents, DeliveryStatus};
use crate::events::{
    EventBus, InvoiceCreatedEvent, InvoiceEvent, InvoiceEventCode, NewBlockEvent, NewOnChainTransactionEvent, Subscription,
};
use crate::webhooks::{ReqwestTransport, WebhookEventType, verify_signature};

/// Record `(invoice id, event code)` for every invoice event on the bus.
fn record_events(bus: &EventBus) -> (Arc<Mutex<Vec<(String, InvoiceEventCode)>>>, Subscription) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let subscription = {
        let log = log.clone();
        bus.subscribe(move |e: &InvoiceEvent| {
            log.lock().push((e.invoice.id.clone(), e.code));
            Ok(())
        })
    };
    (log, subscription)
}

fn codes_for(log: &Mutex<Vec<(String, InvoiceEventCode)>>, invoice_id: &str) -> Vec<InvoiceEventCode> {
    log.lock().iter().filter(|(id, _)| id == invoice_id).map(|(_, code)| *code).collect()
}

async fn wait_for_event(bus: &EventBus, invoice_id: &str, code: InvoiceEventCode, trigger: impl FnOnce()) -> InvoiceEvent {
    let invoice_id = invoice_id.to_string();
    let next = bus.wait_next(move |e: &InvoiceEvent| e.invoice.id == invoice_id && e.code == code, CancellationToken::new());
    trigger();
    tokio::time::timeout(Duration::from_secs(10), next)
        .await
        .expect("timed out waiting for invoice event")
        .expect("wait cancelled")
}

/// Full payment before expiration: the invoice becomes Paid with exactly one PaidInFull event
#[test_log::test(tokio::test)]
async fn test_exact_payment_marks_invoice_paid() {
    let test = start_test_engine(Arc::new(FakeMerchant::default()));
    let (log, _subscription) = record_events(test.engine.bus());
    test.invoices
        .insert(btc_invoice("inv-1", "store-1", "addr-1", chrono::Duration::minutes(15)));

    wait_for_event(test.engine.bus(), "inv-1", InvoiceEventCode::PaidInFull, || {
        test.engine.bus().publish(btc_transaction("tx1", "addr-1", dec!(0.01), 0));
    })
    .await;
    settle(&test).await;

    let invoice = test.invoices.get_invoice("inv-1").await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.exception_status, InvoiceExceptionStatus::None);
    assert_eq!(
        codes_for(&log, "inv-1"),
        [InvoiceEventCode::ReceivedPayment, InvoiceEventCode::PaidInFull]
    );
    assert!(test.engine.shutdown().await);
}

#[test_log::test(tokio::test)]
async fn test_overpayment_is_flagged() {
    let test = start_test_engine(Arc::new(FakeMerchant::default()));
    test.invoices
        .insert(btc_invoice("inv-1", "store-1", "addr-1", chrono::Duration::minutes(15)));

    test.engine.bus().publish(btc_transaction("tx1", "addr-1", dec!(0.012), 0));
    let invoice = wait_for_status(&test.invoices, "inv-1", InvoiceStatus::Paid).await;

    assert_eq!(invoice.exception_status, InvoiceExceptionStatus::PaidOver);
    assert!(test.engine.shutdown().await);
}

/// An unpaid invoice past its expiration expires, frees its address and notifies the merchant
#[test_log::test(tokio::test)]
async fn test_unpaid_invoice_expires() {
    let merchant = Arc::new(FakeMerchant::default());
    let test = start_test_engine(merchant.clone());
    let (log, _subscription) = record_events(test.engine.bus());
    let hook = create_test_webhook("store-1", "https://merchant.test/hook", AuthorizedWebhookEvents::everything());
    test.webhooks.upsert_webhook(hook.clone());

    let invoice = btc_invoice("inv-1", "store-1", "addr-1", chrono::Duration::minutes(-1));
    test.invoices.insert(invoice.clone());
    test.engine.bus().publish(InvoiceCreatedEvent { invoice });

    wait_for_status(&test.invoices, "inv-1", InvoiceStatus::Expired).await;
    settle(&test).await;

    assert!(test.invoices.is_address_released("inv-1"));
    assert_eq!(codes_for(&log, "inv-1"), [InvoiceEventCode::Created, InvoiceEventCode::Expired]);

    let rows = wait_for_deliveries(&test.webhooks, hook.id, 2).await;
    assert!(rows.iter().all(|r| r.status == DeliveryStatus::HttpSuccess));
    let bodies: Vec<_> = merchant.requests_to(&hook.url).iter().map(body_json).collect();
    assert_eq!(bodies[0]["type"], "InvoiceCreated");
    assert_eq!(bodies[1]["type"], "InvoiceExpired");
    assert_eq!(bodies[1]["partiallyPaid"], false);
    assert_eq!(bodies[1]["invoiceId"], "inv-1");
    assert!(test.engine.shutdown().await);
}

/// A subscription filtered on InvoiceSettled gets exactly one signed POST as the invoice goes
/// New -> Paid -> Confirmed
#[test_log::test(tokio::test)]
async fn test_settled_webhook_is_delivered_once_over_http() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/btcpay"))
        .respond_with(wiremock::ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(5)).unwrap());
    let test = start_test_engine(transport);
    let hook = create_test_webhook(
        "store-1",
        &format!("{}/btcpay", server.uri()),
        AuthorizedWebhookEvents::only([WebhookEventType::InvoiceSettled]),
    );
    test.webhooks.upsert_webhook(hook.clone());
    test.invoices
        .insert(btc_invoice("inv-1", "store-1", "addr-1", chrono::Duration::minutes(15)));

    wait_for_event(test.engine.bus(), "inv-1", InvoiceEventCode::PaidInFull, || {
        test.engine.bus().publish(btc_transaction("tx1", "addr-1", dec!(0.01), 0));
    })
    .await;
    wait_for_event(test.engine.bus(), "inv-1", InvoiceEventCode::Confirmed, || {
        test.engine.bus().publish(btc_transaction("tx1", "addr-1", dec!(0.01), 1));
    })
    .await;

    let rows = wait_for_deliveries(&test.webhooks, hook.id, 1).await;
    assert_eq!(rows[0].status, DeliveryStatus::HttpSuccess);
    assert_eq!(rows[0].http_code, Some(200));
    settle(&test).await;
    assert!(test.engine.shutdown().await);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let request = &received[0];
    let signature = request.headers.get("btcpay-sig").unwrap().to_str().unwrap();
    assert!(verify_signature(&request.body, signature, SECRET));
    assert_eq!(request.body, rows[0].request);

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["type"], "InvoiceSettled");
    assert_eq!(body["manuallyMarked"], false);
    assert_eq!(body["isRedelivery"], false);
}

/// Deliveries to different subscriptions do not wait for each other; deliveries to the same
/// subscription keep their order
#[test_log::test(tokio::test)]
async fn test_subscriptions_deliver_independently() {
    let merchant = Arc::new(FakeMerchant::default());
    let test = start_test_engine(merchant.clone());
    let slow = create_test_webhook("store-a", "https://slow.test/hook", AuthorizedWebhookEvents::everything());
    let fast = create_test_webhook("store-b", "https://fast.test/hook", AuthorizedWebhookEvents::everything());
    test.webhooks.upsert_webhook(slow.clone());
    test.webhooks.upsert_webhook(fast.clone());
    merchant.hold(&slow.url);

    let expired = btc_invoice("inv-a", "store-a", "addr-a", chrono::Duration::minutes(-1));
    let open = btc_invoice("inv-b", "store-b", "addr-b", chrono::Duration::minutes(15));
    for invoice in [expired, open] {
        test.invoices.insert(invoice.clone());
        test.engine.bus().publish(InvoiceCreatedEvent { invoice });
    }

    // The fast endpoint completes while the slow one is still holding its first request
    let fast_rows = wait_for_deliveries(&test.webhooks, fast.id, 1).await;
    assert_eq!(fast_rows[0].status, DeliveryStatus::HttpSuccess);
    wait_for_status(&test.invoices, "inv-a", InvoiceStatus::Expired).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(merchant.requests_to(&slow.url).len(), 1);
    assert!(test.webhooks.list_deliveries(slow.id).await.unwrap().is_empty());

    merchant.release(&slow.url, 2);
    wait_for_deliveries(&test.webhooks, slow.id, 2).await;
    let types: Vec<_> = merchant
        .requests_to(&slow.url)
        .iter()
        .map(|r| body_json(r)["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(types, ["InvoiceCreated", "InvoiceExpired"]);
    assert!(test.engine.shutdown().await);
}

/// Re-watching an invoice whose state is already persisted publishes nothing new
#[test_log::test(tokio::test)]
async fn test_restart_does_not_replay_events() {
    let merchant = Arc::new(FakeMerchant::default());
    let first = start_test_engine(merchant.clone());
    let hook = create_test_webhook("store-1", "https://merchant.test/hook", AuthorizedWebhookEvents::everything());
    first.webhooks.upsert_webhook(hook.clone());
    first
        .invoices
        .insert(btc_invoice("inv-1", "store-1", "addr-1", chrono::Duration::minutes(15)));

    wait_for_event(first.engine.bus(), "inv-1", InvoiceEventCode::PaidInFull, || {
        first.engine.bus().publish(btc_transaction("tx1", "addr-1", dec!(0.01), 0));
    })
    .await;
    settle(&first).await;
    let rows_before = wait_for_deliveries(&first.webhooks, hook.id, 2).await.len();
    let writes_before = first.invoices.status_writes();
    let TestEngine { engine, invoices, webhooks } = first;
    assert!(engine.shutdown().await);

    let second = start_test_engine_with(create_test_config(), invoices, webhooks, merchant.clone());
    let (log, _subscription) = record_events(second.engine.bus());
    let resumed = second.engine.rehydrate().await.unwrap();
    assert!(resumed.invoices >= 1);
    assert_eq!(resumed.redeliveries, 0);
    second.engine.bus().publish(NewBlockEvent {
        crypto_code: "BTC".to_string(),
    });
    settle(&second).await;

    assert!(codes_for(&log, "inv-1").is_empty());
    // One extra write for the sentinel only
    assert_eq!(second.invoices.status_writes(), writes_before + 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second.webhooks.list_deliveries(hook.id).await.unwrap().len(), rows_before);
    assert!(second.engine.shutdown().await);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_unsubscribes_everything() {
    let test = start_test_engine(Arc::new(FakeMerchant::default()));
    let bus = test.engine.bus().clone();
    assert_eq!(bus.listener_count::<NewOnChainTransactionEvent>(), 1);
    assert_eq!(bus.listener_count::<NewBlockEvent>(), 1);
    assert_eq!(bus.listener_count::<InvoiceCreatedEvent>(), 1);
    // Watcher and webhook sender
    assert_eq!(bus.listener_count::<InvoiceEvent>(), 2);

    assert!(test.engine.shutdown().await);
    assert_eq!(bus.listener_count::<NewOnChainTransactionEvent>(), 0);
    assert_eq!(bus.listener_count::<InvoiceEvent>(), 0);
}

#[test_log::test(tokio::test)]
async fn test_disabled_webhooks_are_not_subscribed() {
    let mut config = create_test_config();
    config.webhooks.enabled = false;
    let test = start_test_engine_with(
        config,
        Arc::new(Default::default()),
        Arc::new(Default::default()),
        Arc::new(FakeMerchant::default()),
    );
    assert_eq!(test.engine.bus().listener_count::<InvoiceEvent>(), 1);
    assert!(test.engine.shutdown().await);
}

/// Shutdown drops redeliveries that are not yet due
#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_redeliveries() {
    let merchant = Arc::new(FakeMerchant::default());
    let test = start_test_engine(merchant.clone());
    let hook = create_test_webhook("store-1", "https://down.test/hook", AuthorizedWebhookEvents::everything());
    merchant.respond(&hook.url, 500);
    test.webhooks.upsert_webhook(hook.clone());

    let mut invoice = btc_invoice("inv-1", "store-1", "addr-1", chrono::Duration::minutes(15));
    invoice.status = InvoiceStatus::Complete;
    test.invoices.insert(invoice.clone());
    test.engine.bus().publish(InvoiceCreatedEvent { invoice });

    let rows = wait_for_deliveries(&test.webhooks, hook.id, 1).await;
    assert_eq!(rows[0].status, DeliveryStatus::HttpError);
    assert_eq!(rows[0].http_code, Some(500));

    let webhooks = test.webhooks.clone();
    assert!(test.engine.shutdown().await);
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(webhooks.list_deliveries(hook.id).await.unwrap().len(), 1);
    assert_eq!(merchant.requests_to(&hook.url).len(), 1);
}

/// A ladder cut short by a restart picks up where it left off
#[tokio::test(start_paused = true)]
async fn test_redelivery_ladder_resumes_after_restart() {
    let merchant = Arc::new(FakeMerchant::default());
    let first = start_test_engine(merchant.clone());
    let hook = create_test_webhook("store-1", "https://down.test/hook", AuthorizedWebhookEvents::everything());
    merchant.respond(&hook.url, 500);
    first.webhooks.upsert_webhook(hook.clone());

    let mut invoice = btc_invoice("inv-1", "store-1", "addr-1", chrono::Duration::minutes(15));
    invoice.status = InvoiceStatus::Complete;
    first.invoices.insert(invoice.clone());
    first.engine.bus().publish(InvoiceCreatedEvent { invoice });

    let rows = wait_for_deliveries(&first.webhooks, hook.id, 1).await;
    assert_eq!(rows.len(), 1);
    let TestEngine { engine, invoices, webhooks } = first;
    assert!(engine.shutdown().await);

    let second = start_test_engine_with(create_test_config(), invoices, webhooks, merchant.clone());
    let resumed = second.engine.rehydrate().await.unwrap();
    assert_eq!(resumed.redeliveries, 1);

    tokio::time::sleep(Duration::from_secs(4 * 3600)).await;
    let rows = second.webhooks.list_deliveries(hook.id).await.unwrap();
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r.original_delivery_id == rows[0].id));
    assert_eq!(merchant.requests_to(&hook.url).len(), 8);

    // Nothing left to resume once the ladder is exhausted
    assert_eq!(second.engine.sender().resume_redeliveries().await.unwrap(), 0);
    assert!(second.engine.shutdown().await);
}
