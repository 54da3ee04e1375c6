//! Integration tests for the full pipeline.
//!
//! Tests: Service → UnitOfWork → EventStore → EventBus
//!
//! Verifies:
//! - Invoices, payments and reviews keep orders and invoices consistent
//! - Concurrent writers never double-bill an order or overpay an invoice
//! - Webhook processing is idempotent

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use podledger_auth::Principal;
    use podledger_core::{AggregateId, DomainError, LineId, UserId};
    use podledger_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use podledger_invoicing::{
        DiscountCode, Invoice, InvoiceStatus, PaymentKind, PaymentMethod, completed_net,
    };
    use podledger_orders::{LineStatus, NewLine, Order, OrderId, OrderStatus};
    use podledger_requests::{Decision, RequestId, RequestStatus};
    use serde_json::Value as JsonValue;

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::config::AppConfig;
    use crate::event_store::InMemoryEventStore;
    use crate::external::{
        HostedCheckoutGateway, InMemoryDiscountCatalog, InMemoryNotifier, StaticShipmentTracker,
    };
    use crate::services::{
        AdHocInvoice, Collaborators, ManualPayment, NewOrder, NewRefund, NewReprint,
        OrderSelection, ProcessOutcome, Services,
    };
    use crate::webhook::signature::sign;
    use crate::webhook::{
        InMemoryWebhookLogStore, ProcessingState, WebhookError, WebhookLogStore, WebhookSource,
    };

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    const SECRET: &str = "test-webhook-secret";

    struct Harness {
        services: Services<InMemoryEventStore, Bus>,
        bus: Bus,
        notifier: Arc<InMemoryNotifier>,
        logs: Arc<InMemoryWebhookLogStore>,
        staff: Principal,
        seller: Principal,
    }

    fn setup() -> Harness {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = Arc::new(CommandDispatcher::new(InMemoryEventStore::new(), bus.clone()));

        let discounts = Arc::new(InMemoryDiscountCatalog::new());
        discounts.insert(DiscountCode::percentage("SAVE10", 10, 100_000));
        let notifier = Arc::new(InMemoryNotifier::new());
        let logs = Arc::new(InMemoryWebhookLogStore::new());

        let config = AppConfig {
            payos_secret: SECRET.to_string(),
            sepay_secret: SECRET.to_string(),
            ..AppConfig::default()
        };

        let services = Services::new(
            dispatcher,
            Collaborators {
                shipments: Arc::new(StaticShipmentTracker::new()),
                notifier: notifier.clone(),
                discounts,
                gateway: Arc::new(HostedCheckoutGateway::new("https://pay.example.test")),
                webhook_logs: logs.clone(),
            },
            &config,
        );

        Harness {
            services,
            bus,
            notifier,
            logs,
            staff: Principal::manager(UserId::new()),
            seller: Principal::seller(UserId::new()),
        }
    }

    impl Harness {
        fn order(&self, code: &str, unit_price: u64) -> Order {
            self.services
                .orders
                .create_order(
                    &self.seller,
                    NewOrder {
                        seller_id: self.seller.user_id,
                        code: code.to_string(),
                        customer_ref: "customer".to_string(),
                        lines: vec![NewLine {
                            line_id: LineId::new(),
                            variant_sku: "HOODIE-L".to_string(),
                            product_name: "Hoodie".to_string(),
                            quantity: 1,
                            unit_price,
                        }],
                    },
                )
                .unwrap()
        }

        fn advance(&self, order_id: OrderId, path: &[OrderStatus]) -> Order {
            let mut order = None;
            for target in path {
                order = Some(
                    self.services
                        .orders
                        .transition(&self.staff, order_id, *target)
                        .unwrap(),
                );
            }
            order.unwrap()
        }

        fn shipped_order(&self, code: &str, unit_price: u64) -> Order {
            let order = self.order(code, unit_price);
            self.advance(
                order.id_typed(),
                &[
                    OrderStatus::ReadyProduction,
                    OrderStatus::InProduction,
                    OrderStatus::QcPending,
                    OrderStatus::QcApproved,
                    OrderStatus::Confirmed,
                    OrderStatus::Shipped,
                ],
            )
        }

        fn invoice_for(&self, orders: &[&Order], discount: Option<&str>) -> Invoice {
            self.services
                .invoices
                .create_ad_hoc_invoice(
                    &self.staff,
                    AdHocInvoice {
                        seller_id: self.seller.user_id,
                        selection: OrderSelection::OrderIds(
                            orders.iter().map(|o| o.id_typed()).collect(),
                        ),
                        notes: None,
                        discount_code: discount.map(str::to_string),
                    },
                )
                .unwrap()
        }

        fn pay(&self, invoice: &Invoice, amount: u64) -> Result<Invoice, DispatchError> {
            self.services
                .payments
                .record_payment(
                    &self.staff,
                    invoice.id_typed(),
                    ManualPayment {
                        amount,
                        method: PaymentMethod::Manual,
                        gateway_reference: None,
                    },
                )
                .map(|o| o.invoice)
        }

        fn reload_order(&self, order: &Order) -> Order {
            self.services
                .orders
                .get_order(&self.staff, order.id_typed())
                .unwrap()
        }

        fn reload_invoice(&self, invoice: &Invoice) -> Invoice {
            self.services
                .invoices
                .get_invoice(&self.staff, invoice.id_typed())
                .unwrap()
        }
    }

    #[test]
    fn invoice_links_orders_and_publishes_events() {
        let h = setup();
        let sub = h.bus.subscribe();
        let a = h.shipped_order("ORD-1", 300_000);
        let b = h.shipped_order("ORD-2", 200_000);
        sub.drain();

        let invoice = h.invoice_for(&[&a, &b], None);
        assert_eq!(invoice.total_amount(), 500_000);
        assert_eq!(invoice.status(), InvoiceStatus::Unpaid);
        assert!(invoice.number().starts_with("INV-"));
        assert!(invoice.due_date().is_some());

        assert_eq!(h.reload_order(&a).invoice_id(), Some(invoice.id_typed().0));
        assert_eq!(h.reload_order(&b).invoice_id(), Some(invoice.id_typed().0));

        let types: Vec<String> = sub
            .drain()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect();
        assert_eq!(types.iter().filter(|t| *t == "orders.order.invoiced").count(), 2);
        assert!(types.contains(&"invoicing.invoice.issued".to_string()));
    }

    #[test]
    fn unshipped_or_invoiced_orders_are_not_eligible() {
        let h = setup();
        let draft = h.order("ORD-3", 100_000);
        let err = h
            .services
            .invoices
            .create_ad_hoc_invoice(
                &h.staff,
                AdHocInvoice {
                    seller_id: h.seller.user_id,
                    selection: OrderSelection::OrderIds(vec![draft.id_typed()]),
                    notes: None,
                    discount_code: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::NoEligibleOrders)));

        let shipped = h.shipped_order("ORD-4", 100_000);
        h.invoice_for(&[&shipped], None);
        let err = h
            .services
            .invoices
            .create_ad_hoc_invoice(
                &h.staff,
                AdHocInvoice {
                    seller_id: h.seller.user_id,
                    selection: OrderSelection::OrderIds(vec![shipped.id_typed()]),
                    notes: None,
                    discount_code: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::NoEligibleOrders)));
    }

    #[test]
    fn discount_and_full_payment_settle_invoice() {
        let h = setup();
        let order = h.shipped_order("ORD-5", 500_000);
        let invoice = h.invoice_for(&[&order], Some("save10"));

        assert_eq!(invoice.discount_amount(), 50_000);
        assert_eq!(invoice.payable_amount(), 450_000);

        let paid = h.pay(&invoice, 450_000).unwrap();
        assert_eq!(paid.status(), InvoiceStatus::Paid);
        assert_eq!(paid.amount_paid(), 450_000);
    }

    #[test]
    fn unknown_discount_code_is_rejected() {
        let h = setup();
        let order = h.shipped_order("ORD-6", 500_000);
        let err = h
            .services
            .invoices
            .create_ad_hoc_invoice(
                &h.staff,
                AdHocInvoice {
                    seller_id: h.seller.user_id,
                    selection: OrderSelection::OrderIds(vec![order.id_typed()]),
                    notes: None,
                    discount_code: Some("NOPE".to_string()),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::InvalidDiscount(_))));
        assert!(h.reload_order(&order).invoice_id().is_none());
    }

    #[test]
    fn partial_payments_then_overpayment_rejected() {
        let h = setup();
        let order = h.shipped_order("ORD-7", 1_000_000);
        let invoice = h.invoice_for(&[&order], None);

        let partial = h.pay(&invoice, 400_000).unwrap();
        assert_eq!(partial.status(), InvoiceStatus::Partial);

        let err = h.pay(&invoice, 700_000).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Domain(DomainError::AmountExceedsBalance {
                amount: 700_000,
                balance: 600_000
            })
        ));
        assert_eq!(h.reload_invoice(&invoice).amount_paid(), 400_000);
    }

    #[test]
    fn monthly_invoice_twice_is_nothing_to_invoice() {
        let h = setup();
        let order = h.shipped_order("ORD-8", 250_000);
        let shipped_at = h.reload_order(&order).shipped_at().unwrap();
        let (year, month) = {
            use chrono::Datelike;
            (shipped_at.year(), shipped_at.month())
        };

        let invoice = h
            .services
            .invoices
            .create_monthly_invoice(&h.staff, h.seller.user_id, year, month)
            .unwrap();
        assert!(invoice.contains_order(order.id_typed()));

        let err = h
            .services
            .invoices
            .create_monthly_invoice(&h.staff, h.seller.user_id, year, month)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::NothingToInvoice)));
    }

    #[test]
    fn cancelled_invoice_releases_orders_for_reinvoicing() {
        let h = setup();
        let order = h.shipped_order("ORD-9", 300_000);
        let first = h.invoice_for(&[&order], None);

        let cancelled = h
            .services
            .invoices
            .cancel_invoice(&h.staff, first.id_typed(), "wrong customer".to_string())
            .unwrap();
        assert!(cancelled.is_cancelled());
        assert!(h.reload_order(&order).invoice_id().is_none());

        let second = h.invoice_for(&[&order], None);
        assert_ne!(second.id_typed(), first.id_typed());
        assert_eq!(h.reload_order(&order).invoice_id(), Some(second.id_typed().0));
    }

    #[test]
    fn paid_invoice_cannot_be_cancelled() {
        let h = setup();
        let order = h.shipped_order("ORD-10", 300_000);
        let invoice = h.invoice_for(&[&order], None);
        h.pay(&invoice, 100_000).unwrap();

        let err = h
            .services
            .invoices
            .cancel_invoice(&h.staff, invoice.id_typed(), "oops".to_string())
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::Conflict(_))));
        assert_eq!(h.reload_order(&order).invoice_id(), Some(invoice.id_typed().0));
    }

    #[test]
    fn concurrent_invoice_creation_bills_each_order_once() {
        let h = setup();
        let a = h.shipped_order("ORD-11", 100_000);
        let b = h.shipped_order("ORD-12", 100_000);
        let barrier = Barrier::new(4);

        let results: Vec<Result<Invoice, DispatchError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        h.services.invoices.create_ad_hoc_invoice(
                            &h.staff,
                            AdHocInvoice {
                                seller_id: h.seller.user_id,
                                selection: OrderSelection::OrderIds(vec![
                                    a.id_typed(),
                                    b.id_typed(),
                                ]),
                                notes: None,
                                discount_code: None,
                            },
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        let created: Vec<&Invoice> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].items().len(), 2);
        for r in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(
                r,
                Err(DispatchError::Domain(DomainError::NoEligibleOrders))
            ));
        }

        let invoices = h
            .services
            .invoices
            .list_invoices(&h.staff, h.seller.user_id)
            .unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(h.reload_order(&a).invoice_id(), Some(created[0].id_typed().0));
    }

    #[test]
    fn concurrent_payments_never_exceed_total() {
        let h = setup();
        let order = h.shipped_order("ORD-13", 1_000_000);
        let invoice = h.invoice_for(&[&order], None);
        let barrier = Barrier::new(2);

        let results: Vec<Result<Invoice, DispatchError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        h.pay(&invoice, 600_000)
                    })
                })
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(DispatchError::Domain(DomainError::AmountExceedsBalance { .. }))
        )));

        let invoice = h.reload_invoice(&invoice);
        assert_eq!(invoice.amount_paid(), 600_000);
        assert_eq!(invoice.amount_paid(), completed_net(invoice.payments()));
        assert_eq!(invoice.status(), InvoiceStatus::Partial);
    }

    #[test]
    fn payment_link_completed_by_signed_webhook_once() {
        let h = setup();
        let order = h.shipped_order("ORD-14", 800_000);
        let invoice = h.invoice_for(&[&order], None);

        let link = h
            .services
            .payments
            .create_payment_link(&h.seller, invoice.id_typed(), Some(300_000))
            .unwrap();
        let pending = h.reload_invoice(&invoice);
        assert_eq!(pending.amount_paid(), 0);
        assert!(pending.payment_by_reference(&link.reference).unwrap().is_pending());

        let body = format!(
            r#"{{"code":"00","desc":"success","data":{{"orderCode":{},"amount":300000,"description":"{}"}}}}"#,
            link.reference,
            invoice.number()
        );
        let sig = sign(SECRET, body.as_bytes());

        let (first_log, outcome) = h
            .services
            .reconciler
            .handle("payos", body.as_bytes(), Some(&sig))
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        // Provider redelivery of the same notification.
        let (_, outcome) = h
            .services
            .reconciler
            .handle("payos", body.as_bytes(), Some(&sig))
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Duplicate);

        // Processing the same log again is a no-op.
        assert_eq!(
            h.services.reconciler.process(first_log).unwrap(),
            ProcessOutcome::AlreadyHandled
        );

        let settled = h.reload_invoice(&invoice);
        assert_eq!(settled.amount_paid(), 300_000);
        assert_eq!(settled.status(), InvoiceStatus::Partial);
        assert_eq!(h.logs.get(first_log).unwrap().unwrap().1, ProcessingState::Processed);
    }

    #[test]
    fn failed_gateway_payment_leaves_balance_open() {
        let h = setup();
        let order = h.shipped_order("ORD-20", 200_000);
        let invoice = h.invoice_for(&[&order], None);
        let link = h
            .services
            .payments
            .create_payment_link(&h.seller, invoice.id_typed(), None)
            .unwrap();
        assert!(link.checkout_url.contains(&link.reference));

        let body = format!(
            r#"{{"code":"01","desc":"cancelled by buyer","data":{{"orderCode":"{}","amount":200000}}}}"#,
            link.reference
        );
        let (_, outcome) = h
            .services
            .reconciler
            .handle("payos", body.as_bytes(), Some(&sign(SECRET, body.as_bytes())))
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let invoice = h.reload_invoice(&invoice);
        assert_eq!(invoice.amount_paid(), 0);
        assert_eq!(invoice.status(), InvoiceStatus::Unpaid);
        assert!(!invoice.payment_by_reference(&link.reference).unwrap().is_pending());

        // A late success for the same reference cannot resurrect it.
        let late = format!(
            r#"{{"code":"00","desc":"success","data":{{"orderCode":"{}","amount":200000}}}}"#,
            link.reference
        );
        let (_, outcome) = h
            .services
            .reconciler
            .handle("payos", late.as_bytes(), Some(&sign(SECRET, late.as_bytes())))
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
        assert_eq!(h.reload_invoice(&invoice).amount_paid(), 0);
    }

    #[test]
    fn payment_link_rules() {
        let h = setup();
        let order = h.shipped_order("ORD-21", 200_000);
        let invoice = h.invoice_for(&[&order], None);

        let err = h
            .services
            .payments
            .create_payment_link(&h.seller, invoice.id_typed(), Some(250_000))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Domain(DomainError::AmountExceedsBalance { .. })
        ));

        let stranger = Principal::seller(UserId::new());
        let err = h
            .services
            .payments
            .create_payment_link(&stranger, invoice.id_typed(), None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::Unauthorized(_))));

        h.services
            .invoices
            .cancel_invoice(&h.staff, invoice.id_typed(), "reissue".into())
            .unwrap();
        let err = h
            .services
            .payments
            .create_payment_link(&h.seller, invoice.id_typed(), None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::Conflict(_))));
    }

    #[test]
    fn bank_transfer_matched_by_invoice_number() {
        let h = setup();
        let order = h.shipped_order("ORD-15", 450_000);
        let invoice = h.invoice_for(&[&order], None);

        let body = format!(
            r#"{{"id":501,"gateway":"VCB","transferType":"in","transferAmount":450000,"content":"CK {}","referenceCode":"FT25001"}}"#,
            invoice.number().replace('-', " ")
        );
        let sig = sign(SECRET, body.as_bytes());

        let (_, outcome) = h
            .services
            .reconciler
            .handle("sepay", body.as_bytes(), Some(&sig))
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let (_, again) = h
            .services
            .reconciler
            .handle("sepay", body.as_bytes(), Some(&sig))
            .unwrap();
        assert_eq!(again, ProcessOutcome::Duplicate);

        let paid = h.reload_invoice(&invoice);
        assert_eq!(paid.status(), InvoiceStatus::Paid);
        assert_eq!(paid.payments().len(), 1);
        assert_eq!(paid.payments()[0].method, PaymentMethod::BankTransfer);
    }

    #[test]
    fn webhook_rejections_never_allocate() {
        let h = setup();
        let order = h.shipped_order("ORD-16", 100_000);
        let invoice = h.invoice_for(&[&order], None);
        let body = format!(
            r#"{{"id":7,"transferType":"in","transferAmount":100000,"content":"{}","referenceCode":"FT7"}}"#,
            invoice.number()
        );

        let err = h
            .services
            .reconciler
            .handle("sepay", body.as_bytes(), Some("deadbeef"))
            .unwrap_err();
        assert_eq!(err, WebhookError::Signature);

        let err = h
            .services
            .reconciler
            .handle("sepay", body.as_bytes(), None)
            .unwrap_err();
        assert_eq!(err, WebhookError::Signature);

        let garbage = b"{not json";
        let err = h
            .services
            .reconciler
            .handle("sepay", garbage, Some(&sign(SECRET, garbage)))
            .unwrap_err();
        assert!(matches!(err, WebhookError::Malformed(_)));

        let err = h
            .services
            .reconciler
            .handle("stripe", body.as_bytes(), None)
            .unwrap_err();
        assert!(matches!(err, WebhookError::UnknownSource(_)));

        assert_eq!(h.reload_invoice(&invoice).amount_paid(), 0);
    }

    #[test]
    fn overpaying_webhook_is_acknowledged_but_failed() {
        let h = setup();
        let order = h.shipped_order("ORD-17", 100_000);
        let invoice = h.invoice_for(&[&order], None);
        let body = format!(
            r#"{{"id":8,"transferType":"in","transferAmount":150000,"content":"{}","referenceCode":"FT8"}}"#,
            invoice.number()
        );
        let sig = sign(SECRET, body.as_bytes());

        let (log_id, outcome) = h
            .services
            .reconciler
            .handle("sepay", body.as_bytes(), Some(&sig))
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
        assert!(matches!(
            h.logs.get(log_id).unwrap().unwrap().1,
            ProcessingState::Failed(_)
        ));
        assert_eq!(h.reload_invoice(&invoice).amount_paid(), 0);
    }

    #[test]
    fn ping_is_ignored_and_replay_drains_received_logs() {
        let h = setup();
        let ping = br#"{"code":"00","desc":"success"}"#;
        let sig = sign(SECRET, ping);

        let (_, outcome) = h
            .services
            .reconciler
            .handle("payos", ping, Some(&sig))
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Ignored(_)));

        // Logged but never processed, as after a crash.
        let pending = h
            .services
            .reconciler
            .ingest(WebhookSource::PayOs, ping, Some(&sig))
            .unwrap();
        let replayed = h.services.reconciler.replay_unprocessed().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].0, pending);
        assert!(matches!(replayed[0].1, Ok(ProcessOutcome::Ignored(_))));
        assert!(h.services.reconciler.replay_unprocessed().unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_is_logged_as_failed() {
        let h = setup();
        let garbage = b"{\"transferAmount\":";
        let log_id = h
            .services
            .reconciler
            .ingest(WebhookSource::Sepay, garbage, Some(&sign(SECRET, garbage)))
            .unwrap();

        let err = h.services.reconciler.process(log_id).unwrap_err();
        assert!(matches!(err, WebhookError::Malformed(_)));
        match h.logs.get(log_id).unwrap().unwrap().1 {
            ProcessingState::Failed(reason) => assert!(reason.starts_with("malformed")),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(h.services.reconciler.replay_unprocessed().unwrap().is_empty());
    }

    #[test]
    fn replay_recovers_a_claim_whose_worker_died() {
        let h = setup();
        let order = h.shipped_order("ORD-47", 100_000);
        let invoice = h.invoice_for(&[&order], None);
        let body = format!(
            r#"{{"id":47,"transferType":"in","transferAmount":100000,"content":"{}","referenceCode":"FT47"}}"#,
            invoice.number()
        );
        let log_id = h
            .services
            .reconciler
            .ingest(WebhookSource::Sepay, body.as_bytes(), Some(&sign(SECRET, body.as_bytes())))
            .unwrap();

        // A worker claimed the log ten minutes ago and never finished.
        let claimed_at = chrono::Utc::now() - chrono::Duration::minutes(10);
        assert!(h.logs.claim(log_id, claimed_at, chrono::Duration::minutes(5)).unwrap());
        assert_eq!(h.logs.get(log_id).unwrap().unwrap().1, ProcessingState::Processing);

        let replayed = h.services.reconciler.replay_unprocessed().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].0, log_id);
        assert_eq!(replayed[0].1, Ok(ProcessOutcome::Processed));
        assert_eq!(h.logs.get(log_id).unwrap().unwrap().1, ProcessingState::Processed);
        assert_eq!(h.reload_invoice(&invoice).status(), InvoiceStatus::Paid);
    }

    #[test]
    fn fresh_claims_are_left_to_their_worker() {
        let h = setup();
        let ping = br#"{"code":"00","desc":"success"}"#;
        let log_id = h
            .services
            .reconciler
            .ingest(WebhookSource::PayOs, ping, Some(&sign(SECRET, ping)))
            .unwrap();
        assert!(h.logs.claim(log_id, chrono::Utc::now(), chrono::Duration::minutes(5)).unwrap());

        assert!(h.services.reconciler.replay_unprocessed().unwrap().is_empty());
        assert_eq!(
            h.services.reconciler.process(log_id).unwrap(),
            ProcessOutcome::AlreadyHandled
        );
    }

    #[test]
    fn cancellation_rejection_restores_exact_status() {
        let h = setup();
        let order = h.order("ORD-18", 100_000);
        h.advance(
            order.id_typed(),
            &[OrderStatus::AssignedDesigner, OrderStatus::Designing, OrderStatus::CheckFileDesign],
        );

        let request = h
            .services
            .workflows
            .submit_cancellation(&h.seller, order.id_typed(), "customer changed mind".into(), None)
            .unwrap();
        assert_eq!(h.reload_order(&order).status(), OrderStatus::Hold);

        let err = h
            .services
            .workflows
            .submit_cancellation(&h.seller, order.id_typed(), "again".into(), None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::DuplicateRequest(_))));

        let reviewed = h
            .services
            .workflows
            .review(
                &h.staff,
                request.id_typed(),
                Decision::Rejected {
                    reason: "already printed".into(),
                },
            )
            .unwrap();
        assert_eq!(reviewed.status(), RequestStatus::Rejected);
        assert_eq!(reviewed.rejection_reason(), Some("already printed"));

        let restored = h.reload_order(&order);
        assert_eq!(restored.status(), OrderStatus::CheckFileDesign);
        assert!(restored.provisional().is_none());

        let sent: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.redirect_url.starts_with("/requests/"))
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, h.seller.user_id);
        assert!(sent[0].message.contains("rejected"));
        assert_eq!(h.notifier.sent().len(), 4);
    }

    #[test]
    fn cancellation_approval_cancels_order() {
        let h = setup();
        let order = h.order("ORD-19", 100_000);
        let request = h
            .services
            .workflows
            .submit_cancellation(&h.seller, order.id_typed(), "duplicate order".into(), None)
            .unwrap();

        h.services
            .workflows
            .review(&h.staff, request.id_typed(), Decision::Approved)
            .unwrap();
        let cancelled = h.reload_order(&order);
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);

        let err = h
            .services
            .orders
            .transition(&h.staff, order.id_typed(), OrderStatus::ReadyProduction)
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Domain(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn approved_refund_is_recorded_on_order_and_invoice() {
        let h = setup();
        let order = h.shipped_order("ORD-42", 500_000);
        let invoice = h.invoice_for(&[&order], None);
        h.pay(&invoice, 500_000).unwrap();

        let request = h
            .services
            .workflows
            .submit_refund(
                &h.seller,
                NewRefund {
                    order_id: order.id_typed(),
                    amount: 200_000,
                    reason: "misprint on sleeve".into(),
                    proof: Some("https://img.example.test/1.jpg".into()),
                },
            )
            .unwrap();
        assert_eq!(h.reload_order(&order).status(), OrderStatus::Refund);

        let err = h
            .services
            .workflows
            .submit_refund(
                &h.seller,
                NewRefund {
                    order_id: order.id_typed(),
                    amount: 100_000,
                    reason: "second try".into(),
                    proof: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::DuplicateRequest(_))));

        h.services
            .workflows
            .review(&h.staff, request.id_typed(), Decision::Approved)
            .unwrap();

        let refunded = h.reload_order(&order);
        assert_eq!(refunded.refunded_amount(), 200_000);
        assert_eq!(refunded.refunds().len(), 1);
        assert!(refunded.is_partially_refunded());
        assert_eq!(refunded.status(), OrderStatus::Shipped);

        let invoice = h.reload_invoice(&invoice);
        assert_eq!(invoice.credited_amount(), 200_000);
        assert_eq!(invoice.payable_amount(), 300_000);
        assert_eq!(invoice.amount_paid(), 300_000);
        assert_eq!(invoice.amount_paid(), completed_net(invoice.payments()));
        assert!(invoice
            .payments()
            .iter()
            .any(|p| p.kind == PaymentKind::Refund && p.amount == 200_000));
        assert_eq!(invoice.status(), InvoiceStatus::Paid);
        assert_eq!(invoice.outstanding_amount(), 0);

        let err = h.pay(&invoice, 200_000).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Domain(DomainError::AmountExceedsBalance { balance: 0, .. })
        ));

        let requests = h
            .services
            .workflows
            .list_requests(&h.seller, order.id_typed())
            .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status(), RequestStatus::Approved);
    }

    fn approve_refund(h: &Harness, order: &Order, amount: u64) {
        let request = h
            .services
            .workflows
            .submit_refund(
                &h.seller,
                NewRefund {
                    order_id: order.id_typed(),
                    amount,
                    reason: "faded print".into(),
                    proof: None,
                },
            )
            .unwrap();
        h.services
            .workflows
            .review(&h.staff, request.id_typed(), Decision::Approved)
            .unwrap();
    }

    #[test]
    fn refund_on_unpaid_invoice_lowers_what_is_owed() {
        let h = setup();
        let order = h.shipped_order("ORD-45", 500_000);
        let invoice = h.invoice_for(&[&order], None);

        approve_refund(&h, &order, 200_000);

        let invoice = h.reload_invoice(&invoice);
        assert_eq!(invoice.amount_paid(), 0);
        assert_eq!(invoice.outstanding_amount(), 300_000);
        assert!(invoice.payments().is_empty());

        let settled = h.pay(&invoice, 300_000).unwrap();
        assert_eq!(settled.status(), InvoiceStatus::Paid);
    }

    #[test]
    fn refunded_order_is_billed_at_its_remaining_amount() {
        let h = setup();
        let order = h.shipped_order("ORD-46", 500_000);

        approve_refund(&h, &order, 200_000);
        assert_eq!(h.reload_order(&order).status(), OrderStatus::Shipped);

        let invoice = h.invoice_for(&[&order], None);
        assert_eq!(invoice.total_amount(), 300_000);
        assert_eq!(invoice.items()[0].amount, 300_000);
        assert_eq!(invoice.payable_amount(), 300_000);
    }

    #[test]
    fn refund_above_refundable_amount_is_rejected() {
        let h = setup();
        let order = h.shipped_order("ORD-43", 100_000);
        let err = h
            .services
            .workflows
            .submit_refund(
                &h.seller,
                NewRefund {
                    order_id: order.id_typed(),
                    amount: 150_000,
                    reason: "too much".into(),
                    proof: None,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Domain(DomainError::AmountExceedsBalance { .. })
        ));
        assert_eq!(h.reload_order(&order).status(), OrderStatus::Shipped);
    }

    #[test]
    fn other_sellers_cannot_open_requests() {
        let h = setup();
        let order = h.shipped_order("ORD-44", 100_000);
        let stranger = Principal::seller(UserId::new());

        let err = h
            .services
            .workflows
            .submit_cancellation(&stranger, order.id_typed(), "mine now".into(), None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::Unauthorized(_))));

        let err = h
            .services
            .workflows
            .review(
                &h.seller,
                RequestId::new(AggregateId::new()),
                Decision::Approved,
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::Unauthorized(_))));
    }

    #[test]
    fn approved_reprint_adds_unbilled_line() {
        let h = setup();
        let order = h.order("ORD-45", 180_000);
        let line_id = order.lines()[0].line_id;
        h.services
            .orders
            .set_line_status(&h.staff, order.id_typed(), line_id, LineStatus::ReadyProduction)
            .unwrap();
        h.services
            .orders
            .set_line_status(&h.staff, order.id_typed(), line_id, LineStatus::InProduction)
            .unwrap();

        let request = h
            .services
            .workflows
            .submit_reprint(
                &h.seller,
                NewReprint {
                    order_id: order.id_typed(),
                    line_id,
                    reason: "ink smudge".into(),
                    proof: None,
                },
            )
            .unwrap();
        assert_eq!(
            h.reload_order(&order).line(line_id).unwrap().status,
            LineStatus::ReprintRequested
        );

        h.services
            .workflows
            .review(&h.staff, request.id_typed(), Decision::Approved)
            .unwrap();

        let order = h.reload_order(&order);
        assert_eq!(order.lines().len(), 2);
        assert_eq!(order.line(line_id).unwrap().status, LineStatus::Reprinted);
        let reprint = order
            .lines()
            .iter()
            .find(|l| l.reprint_of == Some(line_id))
            .unwrap();
        assert_eq!(reprint.unit_price, 0);
        assert_eq!(reprint.status, LineStatus::ReadyProduction);
        assert_eq!(order.total_cost(), 180_000);
        assert!(h.notifier.sent()[0].message.contains("approved"));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            /// Property: the persisted invoice agrees with the accepted
            /// payments, and rejected ones leave no trace.
            #[test]
            fn stored_balance_matches_accepted_payments(
                amounts in proptest::collection::vec(1u64..400_000, 1..12)
            ) {
                let h = setup();
                let order = h.shipped_order("ORD-P", 1_000_000);
                let invoice = h.invoice_for(&[&order], None);

                let mut accepted = 0u64;
                for amount in amounts {
                    match h.pay(&invoice, amount) {
                        Ok(_) => accepted += amount,
                        Err(DispatchError::Domain(DomainError::AmountExceedsBalance { balance, .. })) => {
                            prop_assert_eq!(balance, 1_000_000 - accepted);
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {other}"),
                    }
                }

                let stored = h.reload_invoice(&invoice);
                prop_assert_eq!(stored.amount_paid(), accepted);
                prop_assert_eq!(stored.amount_paid(), completed_net(stored.payments()));
                prop_assert!(stored.amount_paid() <= stored.payable_amount());
            }
        }
    }
}
