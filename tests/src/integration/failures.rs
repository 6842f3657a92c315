//! # Failure Paths
//!
//! What a caller observes when a command cannot be answered in time, when
//! the callee refuses it, or when a bus tries to speak for another domain.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use ddd_bus::{BusError, Message};
    use ddd_telemetry::metrics::{COMMAND_TIMEOUTS, PERMISSION_DENIED};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_slow_handler_times_out_at_caller_deadline() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let billing = harness.billing(invoicing_handler(calls.clone()), &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let command = Message::new(CreateInvoice { amount: 2_000 });
        let reference = command.reference;
        let started = Instant::now();
        let err = orders
            .send(command, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        match err {
            BusError::RequestTimeout {
                reference: timed_out,
                timeout,
            } => {
                assert_eq!(timed_out, reference);
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected RequestTimeout, got {other:?}"),
        }
        assert!(still_served(&orders, reference).await);
        assert!(COMMAND_TIMEOUTS.with_label_values(&["billing"]).get() >= 1.0);

        orders.stop().await;
        billing.stop().await;
    }

    /// A fresh command still succeeds after an earlier one timed out.
    async fn still_served(
        orders: &ddd_bus::DomainMessageBus,
        previous: uuid::Uuid,
    ) -> bool {
        let command = Message::new(CreateInvoice { amount: 0 });
        assert_ne!(command.reference, previous);
        orders
            .send(command, Some(Duration::from_secs(2)))
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_default_timeout_applies_when_caller_gives_none() {
        let harness = Harness::new();
        let billing = harness.billing(invoicing_handler(Arc::default()), &["orders"]);
        let mut orders = ddd_bus::DomainMessageBus::new(
            Harness::config("orders").with_default_timeout(Duration::from_millis(100)),
            Arc::new(harness.broker.clone()),
        );
        orders
            .register_command::<CreateInvoice, String>(None, [])
            .unwrap();
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let err = orders
            .send(Message::new(CreateInvoice { amount: 2_000 }), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_caller_without_permission_gets_silence() {
        let harness = Harness::new();
        let billing = harness.billing(invoicing_handler(Arc::default()), &["orders"]);
        let orders = harness.billing_client("orders");
        let shipping = harness.billing_client("shipping");
        billing.start().await.unwrap();
        orders.start().await.unwrap();
        shipping.start().await.unwrap();
        let denied = PERMISSION_DENIED
            .with_label_values(&["billing.RefundInvoice"])
            .get();

        let err = shipping
            .send(
                Message::new(RefundInvoice { amount: 5 }),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.domain_error().is_none());
        assert_eq!(
            PERMISSION_DENIED
                .with_label_values(&["billing.RefundInvoice"])
                .get(),
            denied + 1.0
        );

        // The permitted caller is still served.
        let response = orders
            .send(
                Message::new(RefundInvoice { amount: 5 }),
                Some(Duration::from_secs(2)),
            )
            .await;
        assert!(response.is_ok());

        shipping.stop().await;
        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_denied_command_never_reaches_handler() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let billing = harness.billing(invoicing_handler(calls.clone()), &[]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let err = orders
            .send(
                Message::new(CreateInvoice { amount: 0 }),
                Some(Duration::from_millis(150)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_foreign_event_publish_rejected_without_io() {
        let harness = Harness::new();
        let billing = harness.bus("billing");
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();
        let before = (
            harness.broker.published("billing"),
            harness.broker.published("orders"),
        );

        let err = orders
            .publish(Message::new(InvoiceCreated {
                invoice: 1,
                amount: 10,
            }))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BusError::ForbiddenCrossDomainPublish { ref bus_domain, ref event }
                if bus_domain == "orders" && event == "billing.InvoiceCreated"
        ));
        assert_eq!(
            (
                harness.broker.published("billing"),
                harness.broker.published("orders"),
            ),
            before
        );

        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_command_for_unknown_domain_rejected() {
        let harness = Harness::new();
        let orders = harness.billing_client("orders");
        orders.start().await.unwrap();

        let err = orders
            .send(Message::new(ShipOrder { order: 1 }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnregisteredDomain(ref d) if d == "shipping"));

        orders.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_running() {
        let harness = Harness::new();
        let orders = harness.billing_client("orders");

        let err = orders
            .send(Message::new(CreateInvoice { amount: 0 }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotRunning { .. }));
    }
}
