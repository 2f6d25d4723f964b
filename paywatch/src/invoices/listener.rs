//! Turns chain-indexer events into invoice payments and watch requests.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::db::handlers::invoices::{InvoiceRepository, PaymentUpsert};
use crate::db::models::invoices::{Payment, PaymentMethodId};
use crate::events::{EventBus, InvoiceEvent, InvoiceEventCode, NewBlockEvent, NewOnChainTransactionEvent, Subscription};

use super::watcher::WatcherHandle;

#[derive(Clone)]
pub struct PaymentListener {
    repo: Arc<dyn InvoiceRepository>,
    bus: EventBus,
    watcher: WatcherHandle,
}

impl PaymentListener {
    pub fn new(repo: Arc<dyn InvoiceRepository>, bus: EventBus, watcher: WatcherHandle) -> Self {
        Self { repo, bus, watcher }
    }

    pub fn subscribe(&self, bus: &EventBus) -> Vec<Subscription> {
        let transactions = {
            let listener = self.clone();
            bus.subscribe_async(move |event: NewOnChainTransactionEvent| {
                let listener = listener.clone();
                async move { listener.handle_transaction(event).await }
            })
        };
        let blocks = {
            let watcher = self.watcher.clone();
            bus.subscribe(move |event: &NewBlockEvent| {
                debug!(crypto_code = %event.crypto_code, "New block, watching pending invoices");
                watcher.watch_pending();
                Ok(())
            })
        };
        vec![transactions, blocks]
    }

    /// Record the outputs of `event` that pay a watched invoice.
    #[instrument(skip(self, event), fields(tx_id = %event.transaction.tx_id, crypto_code = %event.crypto_code))]
    pub async fn handle_transaction(&self, event: NewOnChainTransactionEvent) -> anyhow::Result<()> {
        let tx = &event.transaction;

        for replaced in &tx.replacing {
            for invoice_id in self.repo.unaccount_transaction(replaced).await? {
                info!(%invoice_id, replaced_tx = %replaced, "Payment replaced, no longer accounted");
                self.watcher.watch(invoice_id);
            }
        }

        let now = Utc::now();
        for output in &event.outputs {
            let Some(invoice_id) = self.repo.find_invoice_by_destination(&output.address).await? else {
                continue;
            };
            let Some(mut invoice) = self.repo.get_invoice(&invoice_id).await? else {
                continue;
            };
            if invoice.is_finished(now) {
                debug!(%invoice_id, "Ignoring payment to a finished invoice");
                continue;
            }

            let payment_id = format!("{}:{}", tx.tx_id, output.index);
            let known = invoice.payments.iter().find(|p| p.id == payment_id);
            let payment = Payment {
                payment_method_id: PaymentMethodId::on_chain(event.crypto_code.as_str()),
                value: output.value,
                accounted: known.is_none_or(|p| p.accounted),
                confirmations: tx.confirmations,
                replaceable: tx.replaceable,
                destination: output.address.clone(),
                received_at: known.map_or(now, |p| p.received_at),
                id: payment_id,
            };
            let policy = invoice.speed_policy;

            match self.repo.upsert_payment(&invoice_id, payment.clone()).await? {
                PaymentUpsert::Added => {
                    info!(%invoice_id, payment_id = %payment.id, value = %payment.value, "Received payment");
                    invoice.payments.push(payment.clone());
                    let settled = payment.is_confirmed(policy);
                    self.bus.publish(InvoiceEvent::with_payment(
                        invoice.clone(),
                        InvoiceEventCode::ReceivedPayment,
                        payment.clone(),
                    ));
                    if settled {
                        self.bus
                            .publish(InvoiceEvent::with_payment(invoice, InvoiceEventCode::PaymentSettled, payment));
                    }
                }
                PaymentUpsert::Updated { previous } => {
                    debug!(%invoice_id, payment_id = %payment.id, confirmations = payment.confirmations, "Payment updated");
                    if let Some(slot) = invoice.payments.iter_mut().find(|p| p.id == payment.id) {
                        *slot = payment.clone();
                    }
                    if payment.is_confirmed(policy) && !previous.is_confirmed(policy) {
                        self.bus
                            .publish(InvoiceEvent::with_payment(invoice, InvoiceEventCode::PaymentSettled, payment));
                    }
                    self.watcher.watch(invoice_id);
                }
                PaymentUpsert::Unchanged => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatcherConfig;
    use crate::db::handlers::invoices::InMemoryInvoiceRepository;
    use crate::db::models::invoices::{Invoice, InvoiceStatus, PaymentMethod, SpeedPolicy};
    use crate::events::{TransactionData, TransactionOutput};
    use crate::invoices::watcher::{InvoiceWatcher, WatcherMessage};
    use crate::tasks::DelayedScheduler;
    use chrono::Duration;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct Harness {
        repo: Arc<InMemoryInvoiceRepository>,
        bus: EventBus,
        listener: PaymentListener,
        // Kept alive so the handle's mailbox stays open; messages are inspected directly
        watcher: InvoiceWatcher,
        events: Arc<Mutex<Vec<(InvoiceEventCode, String)>>>,
        _subscription: Subscription,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryInvoiceRepository::new());
        let bus = EventBus::new();
        let (watcher, handle) = InvoiceWatcher::new(repo.clone(), bus.clone(), DelayedScheduler::new(), WatcherConfig::default());
        let listener = PaymentListener::new(repo.clone(), bus.clone(), handle);

        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let events = events.clone();
            bus.subscribe(move |e: &InvoiceEvent| {
                let payment_id = e.payment.as_ref().map(|p| p.id.clone()).unwrap_or_default();
                events.lock().push((e.code, payment_id));
                Ok(())
            })
        };
        Harness {
            repo,
            bus,
            listener,
            watcher,
            events,
            _subscription: subscription,
        }
    }

    fn invoice(id: &str, address: &str, policy: SpeedPolicy) -> Invoice {
        Invoice::builder()
            .id(id)
            .store_id("store-1")
            .price(dec!(100))
            .expiration_time(Utc::now() + Duration::minutes(15))
            .monitoring_expiration(Utc::now() + Duration::hours(1))
            .speed_policy(policy)
            .payment_methods(vec![PaymentMethod {
                id: PaymentMethodId::on_chain("BTC"),
                rate: dec!(10000),
                divisibility: 8,
                network_fee: dec!(0),
                destination: address.to_string(),
            }])
            .build()
    }

    fn tx_event(tx_id: &str, confirmations: u32, replaceable: bool, outputs: &[(&str, u32)]) -> NewOnChainTransactionEvent {
        NewOnChainTransactionEvent {
            crypto_code: "BTC".to_string(),
            derivation_strategy: "xpub-test".to_string(),
            transaction: TransactionData {
                tx_id: tx_id.to_string(),
                confirmations,
                replaceable,
                replacing: Vec::new(),
            },
            outputs: outputs
                .iter()
                .map(|(address, index)| TransactionOutput {
                    address: address.to_string(),
                    value: dec!(0.01),
                    index: *index,
                })
                .collect(),
        }
    }

    fn drain_watch_requests(watcher: &mut InvoiceWatcher) -> Vec<String> {
        let mut watched = Vec::new();
        while let Ok(message) = watcher.rx_for_tests().try_recv() {
            match message {
                WatcherMessage::Watch(id) => watched.push(id),
                WatcherMessage::WatchPending => watched.push("*".to_string()),
                WatcherMessage::Created(invoice) => watched.push(format!("created:{}", invoice.id)),
            }
        }
        watched
    }

    #[tokio::test]
    async fn test_new_payment_is_recorded_and_announced() {
        let mut h = harness();
        h.repo.insert(invoice("inv-1", "addr-1", SpeedPolicy::MediumSpeed));

        h.listener
            .handle_transaction(tx_event("tx1", 0, false, &[("addr-1", 0), ("unrelated", 1)]))
            .await
            .unwrap();

        let stored = h.repo.get_invoice("inv-1").await.unwrap().unwrap();
        assert_eq!(stored.payments.len(), 1);
        assert_eq!(stored.payments[0].id, "tx1:0");
        assert!(stored.payments[0].accounted);
        assert_eq!(
            h.events.lock().clone(),
            vec![(InvoiceEventCode::ReceivedPayment, "tx1:0".to_string())]
        );
        // The watcher reacts to ReceivedPayment through its own bus listener
        assert!(drain_watch_requests(&mut h.watcher).is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_update_settles_payment_once() {
        let mut h = harness();
        h.repo.insert(invoice("inv-1", "addr-1", SpeedPolicy::LowMediumSpeed));

        h.listener.handle_transaction(tx_event("tx1", 0, false, &[("addr-1", 0)])).await.unwrap();
        let received_at = h.repo.get_invoice("inv-1").await.unwrap().unwrap().payments[0].received_at;

        h.listener.handle_transaction(tx_event("tx1", 1, false, &[("addr-1", 0)])).await.unwrap();
        h.listener.handle_transaction(tx_event("tx1", 2, false, &[("addr-1", 0)])).await.unwrap();
        h.listener.handle_transaction(tx_event("tx1", 3, false, &[("addr-1", 0)])).await.unwrap();
        // Same data again
        h.listener.handle_transaction(tx_event("tx1", 3, false, &[("addr-1", 0)])).await.unwrap();

        let codes: Vec<InvoiceEventCode> = h.events.lock().iter().map(|(code, _)| *code).collect();
        assert_eq!(codes, [InvoiceEventCode::ReceivedPayment, InvoiceEventCode::PaymentSettled]);

        let stored = h.repo.get_invoice("inv-1").await.unwrap().unwrap();
        assert_eq!(stored.payments[0].confirmations, 3);
        assert_eq!(stored.payments[0].received_at, received_at);
        assert_eq!(drain_watch_requests(&mut h.watcher), ["inv-1", "inv-1", "inv-1"]);
    }

    #[tokio::test]
    async fn test_already_confirmed_first_sighting_settles_immediately() {
        let h = harness();
        h.repo.insert(invoice("inv-1", "addr-1", SpeedPolicy::HighSpeed));

        h.listener.handle_transaction(tx_event("tx1", 0, false, &[("addr-1", 0)])).await.unwrap();

        let codes: Vec<InvoiceEventCode> = h.events.lock().iter().map(|(code, _)| *code).collect();
        assert_eq!(codes, [InvoiceEventCode::ReceivedPayment, InvoiceEventCode::PaymentSettled]);
    }

    #[tokio::test]
    async fn test_replacement_unaccounts_previous_transaction() {
        let mut h = harness();
        h.repo.insert(invoice("inv-1", "addr-1", SpeedPolicy::MediumSpeed));
        h.listener.handle_transaction(tx_event("tx1", 0, true, &[("addr-1", 0)])).await.unwrap();

        let mut replacement = tx_event("tx2", 0, false, &[("addr-1", 0)]);
        replacement.transaction.replacing = vec!["tx1".to_string()];
        h.listener.handle_transaction(replacement).await.unwrap();

        let stored = h.repo.get_invoice("inv-1").await.unwrap().unwrap();
        let tx1 = stored.payments.iter().find(|p| p.id == "tx1:0").unwrap();
        let tx2 = stored.payments.iter().find(|p| p.id == "tx2:0").unwrap();
        assert!(!tx1.accounted);
        assert!(tx2.accounted);
        assert_eq!(drain_watch_requests(&mut h.watcher), ["inv-1"]);

        // A late re-broadcast of the replaced transaction stays unaccounted
        h.listener.handle_transaction(tx_event("tx1", 1, true, &[("addr-1", 0)])).await.unwrap();
        let stored = h.repo.get_invoice("inv-1").await.unwrap().unwrap();
        assert!(!stored.payments.iter().find(|p| p.id == "tx1:0").unwrap().accounted);
    }

    #[tokio::test]
    async fn test_finished_invoice_ignores_payments() {
        let h = harness();
        let mut done = invoice("inv-1", "addr-1", SpeedPolicy::MediumSpeed);
        done.status = InvoiceStatus::Complete;
        h.repo.insert(done);

        h.listener.handle_transaction(tx_event("tx1", 0, false, &[("addr-1", 0)])).await.unwrap();

        assert!(h.repo.get_invoice("inv-1").await.unwrap().unwrap().payments.is_empty());
        assert!(h.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_new_block_watches_pending() {
        let mut h = harness();
        let _subscriptions = h.listener.subscribe(&h.bus);

        h.bus.publish(NewBlockEvent {
            crypto_code: "BTC".to_string(),
        });
        assert_eq!(drain_watch_requests(&mut h.watcher), ["*"]);
    }
}
