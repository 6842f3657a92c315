//! # Lifecycle
//!
//! `start()` is all or nothing across the own endpoint and every peer
//! endpoint; `stop()` releases every connection even when one endpoint
//! misbehaves.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use async_trait::async_trait;
    use ddd_bus::{
        BusError, CommandResponse, DefaultEndpointFactory, DomainEndpoint, DomainMessage,
        DomainMessageBus, EndpointContext, EndpointFactory, EndpointState, Message,
        TransportError,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Builds the default endpoints and keeps a handle on each.
    #[derive(Default)]
    struct RecordingFactory {
        built: Mutex<Vec<Arc<dyn DomainEndpoint>>>,
    }

    impl RecordingFactory {
        fn endpoint(&self, domain: &str) -> Arc<dyn DomainEndpoint> {
            self.built
                .lock()
                .iter()
                .find(|endpoint| endpoint.domain() == domain)
                .cloned()
                .unwrap()
        }

        fn record(&self, endpoint: Arc<dyn DomainEndpoint>) -> Arc<dyn DomainEndpoint> {
            self.built.lock().push(Arc::clone(&endpoint));
            endpoint
        }
    }

    impl EndpointFactory for RecordingFactory {
        fn self_endpoint(&self, context: EndpointContext) -> Arc<dyn DomainEndpoint> {
            self.record(DefaultEndpointFactory.self_endpoint(context))
        }

        fn remote_endpoint(&self, context: EndpointContext, peer: &str) -> Arc<dyn DomainEndpoint> {
            self.record(DefaultEndpointFactory.remote_endpoint(context, peer))
        }
    }

    /// Orders bus talking to billing, shipping and inventory, in that order.
    fn orders_with_three_peers(harness: &Harness, factory: Arc<dyn EndpointFactory>) -> DomainMessageBus {
        let mut bus = DomainMessageBus::with_factory(
            Harness::config("orders"),
            Arc::new(harness.broker.clone()),
            factory,
        );
        bus.register_command::<CreateInvoice, String>(None, []).unwrap();
        bus.register_command::<ShipOrder, String>(None, []).unwrap();
        bus.register_command::<ReserveStock, String>(None, []).unwrap();
        bus
    }

    #[tokio::test]
    async fn test_failed_peer_rolls_back_every_endpoint() {
        let harness = Harness::new();
        harness.broker.refuse_vhost("shipping", "vhost not found");
        let factory = Arc::new(RecordingFactory::default());
        let orders = orders_with_three_peers(&harness, factory.clone());
        assert_eq!(orders.peers(), ["billing", "shipping", "inventory"]);

        let err = orders.start().await.unwrap_err();

        match err {
            BusError::Transport(TransportError::ConnectionRefused { vhost, .. }) => {
                assert_eq!(vhost, "shipping");
            }
            other => panic!("expected shipping connection error, got {other:?}"),
        }
        assert_eq!(harness.broker.open_connections(), 0);
        assert!(!orders.is_running());
        assert_eq!(orders.endpoint_state("billing"), None);
        assert_eq!(factory.endpoint("billing").state(), EndpointState::Stopped);
        assert_eq!(factory.endpoint("inventory").state(), EndpointState::Stopped);
        assert_eq!(factory.endpoint("shipping").state(), EndpointState::Stopped);
    }

    #[tokio::test]
    async fn test_first_error_in_registration_order_wins() {
        let harness = Harness::new();
        harness.broker.refuse_vhost("inventory", "vhost not found");
        harness.broker.refuse_vhost("billing", "access refused");
        let orders = orders_with_three_peers(&harness, Arc::new(DefaultEndpointFactory));

        let err = orders.start().await.unwrap_err();

        assert!(matches!(
            err,
            BusError::Transport(TransportError::ConnectionRefused { ref vhost, .. }) if vhost == "billing"
        ));
        assert_eq!(harness.broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_own_vhost_failure_reported_before_peers() {
        let harness = Harness::new();
        harness.broker.refuse_vhost("orders", "vhost not found");
        harness.broker.refuse_vhost("billing", "vhost not found");
        let orders = orders_with_three_peers(&harness, Arc::new(DefaultEndpointFactory));

        let err = orders.start().await.unwrap_err();

        assert!(matches!(
            err,
            BusError::Transport(TransportError::ConnectionRefused { ref vhost, .. }) if vhost == "orders"
        ));
        assert_eq!(harness.broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_start_can_be_retried_after_rollback() {
        let harness = Harness::new();
        harness.broker.refuse_vhost("shipping", "vhost not found");
        let orders = orders_with_three_peers(&harness, Arc::new(DefaultEndpointFactory));
        assert!(orders.start().await.is_err());

        harness.broker.accept_vhost("shipping");
        orders.start().await.unwrap();

        assert!(orders.is_running());
        // One connection for the own domain, one per peer.
        assert_eq!(harness.broker.open_connections(), 4);
        for domain in ["orders", "billing", "shipping", "inventory"] {
            assert_eq!(orders.endpoint_state(domain), Some(EndpointState::Running));
        }

        orders.stop().await;
        assert_eq!(harness.broker.open_connections(), 0);
        assert!(!orders.is_running());
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let harness = Harness::new();
        let orders = harness.billing_client("orders");
        orders.start().await.unwrap();

        assert!(matches!(orders.start().await, Err(BusError::AlreadyStarted)));
        assert_eq!(harness.broker.open_connections(), 2);

        orders.stop().await;
        orders.stop().await;
        assert_eq!(harness.broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop_serves_commands_again() {
        let harness = Harness::new();
        let billing = harness.billing(invoicing_handler(Arc::default()), &["orders"]);
        let orders = harness.billing_client("orders");
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        billing.stop().await;
        billing.start().await.unwrap();

        let response = orders
            .send(
                Message::new(CreateInvoice { amount: 0 }),
                Some(Duration::from_secs(2)),
            )
            .await;
        assert!(response.is_ok());

        orders.stop().await;
        billing.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_commands_still_waiting() {
        let harness = Harness::new();
        let billing = harness.billing(invoicing_handler(Arc::default()), &["orders"]);
        let orders = Arc::new(harness.billing_client("orders"));
        billing.start().await.unwrap();
        orders.start().await.unwrap();

        let waiting = {
            let orders = orders.clone();
            tokio::spawn(async move {
                orders
                    .send(
                        Message::new(CreateInvoice { amount: 5_000 }),
                        Some(Duration::from_secs(10)),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        orders.stop().await;

        let err = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("waiter released by stop")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BusError::NotRunning { ref domain } if domain == "billing"));

        billing.stop().await;
    }

    /// Peer endpoint whose stop always fails.
    struct StubbornEndpoint {
        inner: Arc<dyn DomainEndpoint>,
    }

    #[async_trait]
    impl DomainEndpoint for StubbornEndpoint {
        fn domain(&self) -> &str {
            self.inner.domain()
        }

        fn state(&self) -> EndpointState {
            self.inner.state()
        }

        async fn start(&self) -> Result<(), BusError> {
            self.inner.start().await
        }

        async fn stop(&self) -> Result<(), BusError> {
            Err(BusError::NotRunning {
                domain: self.domain().to_string(),
            })
        }

        async fn handle_command(
            &self,
            command: DomainMessage,
            timeout: Option<Duration>,
        ) -> Result<CommandResponse, BusError> {
            self.inner.handle_command(command, timeout).await
        }

        async fn handle_event(&self, event: DomainMessage) -> Result<(), BusError> {
            self.inner.handle_event(event).await
        }
    }

    struct StubbornPeers;

    impl EndpointFactory for StubbornPeers {
        fn self_endpoint(&self, context: EndpointContext) -> Arc<dyn DomainEndpoint> {
            DefaultEndpointFactory.self_endpoint(context)
        }

        fn remote_endpoint(&self, context: EndpointContext, peer: &str) -> Arc<dyn DomainEndpoint> {
            let inner = DefaultEndpointFactory.remote_endpoint(context, peer);
            if peer == "billing" {
                Arc::new(StubbornEndpoint { inner })
            } else {
                inner
            }
        }
    }

    #[tokio::test]
    async fn test_stop_continues_past_failing_endpoint() {
        let harness = Harness::new();
        let orders = orders_with_three_peers(&harness, Arc::new(StubbornPeers));
        orders.start().await.unwrap();
        assert_eq!(harness.broker.open_connections(), 4);

        orders.stop().await;

        // Only the endpoint that refused to stop keeps its connection.
        assert_eq!(harness.broker.open_connections(), 1);
        assert!(!orders.is_running());
    }
}
