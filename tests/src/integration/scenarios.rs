//! # End-to-End Scenarios
//!
//! Command round trips and event delivery between the `billing`, `orders`
//! and `shipping` domains.
//!
//! ## Test Categories
//!
//! 1. **Round trip**: a permitted command reaches its handler and the reply
//!    carries the command's reference.
//! 2. **Domain errors**: declared errors arrive with their domain, code and
//!    data; anything else arrives as an internal service error.
//! 3. **Correlation**: concurrent commands whose replies come back out of
//!    order still resolve to their own reply.
//! 4. **Events**: subscribers receive each event once; other domains none.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use ddd_bus::{
        command_handler, BusError, CommandResponse, HandlerError, Message, INTERNAL_SERVICE_ERROR,
    };
    use ddd_telemetry::{encode_metrics, register_metrics};
    use futures::future::join_all;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

    // =========================================================================
    // ROUND TRIP
    // =========================================================================

    #[tokio::test]
    async fn test_permitted_command_returns_response_with_its_reference() {
        let harness = Harness::new();
        let aggregate = uuid::Uuid::new_v4();
        let handler = command_handler(move |cmd: Message<CreateInvoice>| async move {
            assert_eq!(cmd.data.amount, 10);
            Ok::<_, HandlerError>(CommandResponse::new(cmd.reference, Some(aggregate)))
        });
        let billing = harness.billing(handler, &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let command = Message::new(CreateInvoice { amount: 10 });
        let reference = command.reference;
        let response = orders.handle(command, TIMEOUT).await.unwrap().unwrap();

        assert_eq!(response.reference, reference);
        assert_eq!(response.aggregate_ref, Some(aggregate));

        orders.stop().await;
        billing.stop().await;
        assert_eq!(harness.broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_visible_in_metrics() {
        let _metrics = register_metrics().unwrap();
        let harness = Harness::new();
        let billing = harness.billing(invoicing_handler(Arc::default()), &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        orders
            .send(Message::new(CreateInvoice { amount: 0 }), TIMEOUT)
            .await
            .unwrap();

        let exposition = encode_metrics().unwrap();
        assert!(exposition.contains("ddd_bus_messages_published_total"));
        assert!(exposition.contains("ddd_bus_command_duration_seconds"));
        assert!(exposition.contains(r#"role="remote""#));
        assert!(exposition.contains(r#"outcome="ok""#));

        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_own_command_handled_without_broker() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let billing = harness.billing(invoicing_handler(calls.clone()), &[]);
        billing.start().await.unwrap();
        let published = harness.broker.published("billing");

        let command = Message::new(CreateInvoice { amount: 0 });
        let reference = command.reference;
        let response = billing.send(command, TIMEOUT).await.unwrap();

        assert_eq!(response.reference, reference);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.broker.published("billing"), published);
        billing.stop().await;
    }

    // =========================================================================
    // DOMAIN ERRORS
    // =========================================================================

    #[tokio::test]
    async fn test_declared_error_arrives_with_domain_code_and_data() {
        let harness = Harness::new();
        let handler = command_handler(|cmd: Message<CreateInvoice>| async move {
            Err::<CommandResponse, _>(HandlerError::Domain(
                INSUFFICIENT_FUNDS.with_extra([("amount", cmd.data.amount.to_string())]),
            ))
        });
        let billing = harness.billing(handler, &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let command = Message::new(CreateInvoice { amount: 10 });
        let reference = command.reference;
        let err = orders.send(command, TIMEOUT).await.unwrap_err();

        let domain_error = err.domain_error().expect("domain error expected");
        assert!(domain_error.is(&INSUFFICIENT_FUNDS));
        assert_eq!(domain_error.domain.as_deref(), Some("billing"));
        assert_eq!(domain_error.code, "0102");
        assert_eq!(domain_error.extra.get("amount").map(String::as_str), Some("10"));
        assert_eq!(domain_error.reference, reference);
        assert!(!err.is_timeout());

        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_unclassified_failure_arrives_as_internal_error() {
        let harness = Harness::new();
        let handler = command_handler(|_cmd: Message<CreateInvoice>| async move {
            Err::<CommandResponse, _>(HandlerError::Internal(anyhow::anyhow!(
                "ledger connection reset"
            )))
        });
        let billing = harness.billing(handler, &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let command = Message::new(CreateInvoice { amount: 10 });
        let reference = command.reference;
        let err = orders.send(command, TIMEOUT).await.unwrap_err();

        let domain_error = err.domain_error().expect("domain error expected");
        assert!(domain_error.is(&INTERNAL_SERVICE_ERROR));
        assert!(domain_error.is_service());
        assert_eq!(domain_error.domain, None);
        assert_eq!(domain_error.reference, reference);
        assert!(!domain_error.message.contains("ledger"));

        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_arrives_as_internal_error() {
        let harness = Harness::new();
        let handler = command_handler(|cmd: Message<CreateInvoice>| async move {
            if cmd.data.amount > 0 {
                panic!("invoice numbering exhausted");
            }
            Ok::<_, HandlerError>(CommandResponse::new(cmd.reference, None))
        });
        let billing = harness.billing(handler, &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let err = orders
            .send(Message::new(CreateInvoice { amount: 1 }), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(&err, BusError::Domain(e) if e.is(&INTERNAL_SERVICE_ERROR)));

        // The consumer survives the panic.
        let response = orders
            .send(Message::new(CreateInvoice { amount: 0 }), TIMEOUT)
            .await;
        assert!(response.is_ok());

        orders.stop().await;
        billing.stop().await;
    }

    // =========================================================================
    // CORRELATION
    // =========================================================================

    #[tokio::test]
    async fn test_out_of_order_replies_resolve_their_own_commands() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let billing = harness.billing(invoicing_handler(calls.clone()), &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        // Handler delay is the amount in ms, so the first sent replies last.
        let commands: Vec<Message<CreateInvoice>> = [300, 10, 150, 50, 0]
            .into_iter()
            .map(|amount| Message::new(CreateInvoice { amount }))
            .collect();
        let references: Vec<uuid::Uuid> = commands.iter().map(|c| c.reference).collect();

        let responses = join_all(
            commands
                .into_iter()
                .map(|command| orders.send(command, TIMEOUT)),
        )
        .await;

        for (response, reference) in responses.into_iter().zip(references) {
            assert_eq!(response.unwrap().reference, reference);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        orders.stop().await;
        billing.stop().await;
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    #[tokio::test]
    async fn test_event_reaches_subscribers_once_and_no_one_else() {
        let harness = Harness::new();

        let local: Arc<Mutex<Vec<Message<InvoiceCreated>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut billing = harness.billing(invoicing_handler(Arc::default()), &["orders"]);
        billing
            .register_event::<InvoiceCreated>([recording_handler(local.clone())])
            .unwrap();

        let created: Arc<Mutex<Vec<Message<InvoiceCreated>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut orders = harness.billing_client("orders");
        orders
            .register_event::<InvoiceCreated>([recording_handler(created.clone())])
            .unwrap();

        let paid: Arc<Mutex<Vec<Message<InvoicePaid>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut shipping = harness.bus("shipping");
        shipping
            .register_event::<InvoicePaid>([recording_handler(paid.clone())])
            .unwrap();

        billing.start().await.unwrap();
        orders.start().await.unwrap();
        shipping.start().await.unwrap();

        let event = Message::new(InvoiceCreated {
            invoice: 7,
            amount: 10,
        });
        let outcome = billing.handle(event.clone(), None).await.unwrap();
        assert!(outcome.is_none());

        assert!(wait_until(|| created.lock().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = created.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].reference, event.reference);
        assert_eq!(received[0].data, event.data);

        // Own handlers run in-process, once.
        assert_eq!(local.lock().len(), 1);
        assert!(paid.lock().is_empty());
        assert_eq!(
            harness.broker.bindings("billing", "shipping"),
            vec![("events".to_string(), "billing.InvoicePaid".to_string())]
        );

        shipping.stop().await;
        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_event_published_before_subscriber_starts_is_not_replayed() {
        let harness = Harness::new();
        let billing = harness.bus("billing");
        billing.start().await.unwrap();

        billing
            .publish(Message::new(InvoicePaid { invoice: 1 }))
            .await
            .unwrap();

        let paid: Arc<Mutex<Vec<Message<InvoicePaid>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut shipping = harness.bus("shipping");
        shipping
            .register_event::<InvoicePaid>([recording_handler(paid.clone())])
            .unwrap();
        shipping.start().await.unwrap();

        billing
            .publish(Message::new(InvoicePaid { invoice: 2 }))
            .await
            .unwrap();

        assert!(wait_until(|| !paid.lock().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let invoices: Vec<u64> = paid.lock().iter().map(|e| e.data.invoice).collect();
        assert_eq!(invoices, vec![2]);

        shipping.stop().await;
        billing.stop().await;
    }
}
