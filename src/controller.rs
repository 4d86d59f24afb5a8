//! The controller ties the registry, the stats ingestion tasks and the dispatcher together.
//!
//! It is the only thing the HTTP layer talks to: nodes come in through
//! [`Controller::register_node`] and requests go out through [`Controller::dispatch`].
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::{HttpClient, HyperClient, PoolConfig, create_hyper_client};
use crate::dispatcher::{ChunkStream, DispatchOptions, Dispatcher};
use crate::errors::ConfigError;
use crate::load_balancer::{LoadBalanceMethod, PowerOfTwoOptions, Scheduler};
use crate::models::{GenerationRequest, NodeInfo};
use crate::registry::NodeRegistry;
use crate::stats::{StatsSocketOptions, ZmqStatsSocket};

/// Everything needed to build a [`Controller`].
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub method: LoadBalanceMethod,
    pub power_of_two: PowerOfTwoOptions,
    pub dispatch: DispatchOptions,
    /// How each node's stats connection is kept alive.
    pub stats: StatsSocketOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            method: LoadBalanceMethod::RoundRobin,
            power_of_two: PowerOfTwoOptions::default(),
            dispatch: DispatchOptions::default(),
            stats: StatsSocketOptions::default(),
        }
    }
}

#[derive(Debug)]
pub struct Controller<T: HttpClient> {
    registry: Arc<NodeRegistry>,
    dispatcher: Dispatcher<T>,
    stats: StatsSocketOptions,
}

impl Controller<HyperClient> {
    /// Create a controller that reaches backends through the pooled hyper client
    pub fn new(config: ControllerConfig, pool: PoolConfig) -> Result<Self, ConfigError> {
        Self::with_client(config, create_hyper_client(pool))
    }
}

impl<T> Controller<T>
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    /// Create a controller with a custom HTTP client (useful for testing)
    pub fn with_client(config: ControllerConfig, http_client: T) -> Result<Self, ConfigError> {
        let scheduler = Scheduler::from_method(config.method, config.power_of_two)?;
        info!(method = %scheduler.method(), "Load balancer ready");

        let registry = Arc::new(NodeRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(scheduler),
            http_client,
            config.dispatch,
        );

        Ok(Self {
            registry,
            dispatcher,
            stats: config.stats,
        })
    }

    /// Adds a node and, if it has a stats port, starts pulling its load reports.
    pub async fn register_node(&self, node: NodeInfo) {
        info!(address = %node.address(), stats_port = node.stats_port, "Registering node");
        let stats_endpoint = node.reports_stats().then(|| node.stats_endpoint());
        self.registry.add_node(node);

        if let Some(endpoint) = stats_endpoint {
            let socket = ZmqStatsSocket::new(endpoint.as_str(), self.stats);
            match self.registry.receive_stats(socket).await {
                Ok(_) => info!(endpoint = %endpoint, "Receiving stats"),
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Failed to start stats ingestion"),
            }
        }
    }

    /// Routes `requests` to backends and returns their bodies as a lazy stream.
    pub fn dispatch(&self, requests: Vec<GenerationRequest>, endpoint: &str) -> ChunkStream {
        self.dispatcher.dispatch(requests, endpoint)
    }

    /// Snapshot of registered nodes, in registration order.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.registry.nodes()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn method(&self) -> LoadBalanceMethod {
        self.dispatcher.scheduler().method()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::TieBreak;
    use crate::models::{GenerateRequest, NodeStats};
    use crate::test_utils::MockHttpClient;
    use axum::http::StatusCode;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn controller(method: LoadBalanceMethod, client: MockHttpClient) -> Controller<MockHttpClient> {
        Controller::with_client(
            ControllerConfig {
                method,
                power_of_two: PowerOfTwoOptions {
                    tie_break: TieBreak::Waiting,
                    distinct: true,
                    seed: Some(3),
                },
                ..Default::default()
            },
            client,
        )
        .unwrap()
    }

    fn request() -> Vec<GenerationRequest> {
        vec![GenerateRequest::default().into()]
    }

    #[test]
    fn test_unsupported_method_is_a_config_error() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let result = Controller::with_client(
            ControllerConfig {
                method: LoadBalanceMethod::ShortestQueue,
                ..Default::default()
            },
            client,
        );

        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedLoadBalanceMethod(LoadBalanceMethod::ShortestQueue))
        ));
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_node_once_then_wraps() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let controller = controller(LoadBalanceMethod::RoundRobin, client.clone());
        for port in [8000, 8001, 8002] {
            controller
                .register_node(NodeInfo::builder().ip("127.0.0.1").port(port).build())
                .await;
        }

        for _ in 0..4 {
            let chunks: Vec<Bytes> = controller.dispatch(request(), "generate").collect().await;
            assert_eq!(chunks.len(), 1);
        }

        let uris: Vec<String> = client.get_requests().into_iter().map(|r| r.uri).collect();
        assert_eq!(
            uris,
            vec![
                "http://127.0.0.1:8000/generate",
                "http://127.0.0.1:8001/generate",
                "http://127.0.0.1:8002/generate",
                "http://127.0.0.1:8000/generate",
            ]
        );
    }

    #[tokio::test]
    async fn test_single_node_is_always_targeted() {
        for method in [LoadBalanceMethod::RoundRobin, LoadBalanceMethod::PowerOf2Choice] {
            let client = MockHttpClient::new(StatusCode::OK, "{}");
            let controller = controller(method, client.clone());
            controller
                .register_node(NodeInfo::builder().ip("127.0.0.1").port(9000).build())
                .await;
            controller
                .registry()
                .update_stats("127.0.0.1:9000", NodeStats::default());

            for _ in 0..5 {
                let _: Vec<Bytes> = controller.dispatch(request(), "generate").collect().await;
            }

            let requests = client.get_requests();
            assert_eq!(requests.len(), 5, "method {method}");
            assert!(
                requests
                    .iter()
                    .all(|r| r.uri == "http://127.0.0.1:9000/generate")
            );
        }
    }

    #[tokio::test]
    async fn test_power_of_two_routes_to_least_waiting_node() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let controller = controller(LoadBalanceMethod::PowerOf2Choice, client.clone());
        for port in [8000, 8001] {
            controller
                .register_node(NodeInfo::builder().ip("127.0.0.1").port(port).build())
                .await;
        }
        controller.registry().update_stats(
            "127.0.0.1:8000",
            NodeStats {
                available_memory: 10,
                num_running: 0,
                num_waiting: 5,
            },
        );
        controller.registry().update_stats(
            "127.0.0.1:8001",
            NodeStats {
                available_memory: 10,
                num_running: 0,
                num_waiting: 2,
            },
        );

        for _ in 0..10 {
            let _: Vec<Bytes> = controller.dispatch(request(), "generate").collect().await;
        }

        assert!(
            client
                .get_requests()
                .iter()
                .all(|r| r.uri == "http://127.0.0.1:8001/generate")
        );
    }

    #[tokio::test]
    async fn test_concurrent_registration_keeps_every_node() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let controller = Arc::new(controller(LoadBalanceMethod::RoundRobin, client));

        let handles: Vec<_> = (0..32u16)
            .map(|i| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller
                        .register_node(NodeInfo::builder().ip("10.1.0.1").port(7000 + i).build())
                        .await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut ports: Vec<u16> = controller.nodes().iter().map(|n| n.port).collect();
        ports.sort_unstable();
        assert_eq!(ports, (7000..7032).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_register_node_with_stats_port_does_not_block() {
        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let controller = controller(LoadBalanceMethod::RoundRobin, client);

        // Nothing listens on the stats port; registration must still return.
        controller
            .register_node(
                NodeInfo::builder()
                    .ip("127.0.0.1")
                    .port(8000)
                    .stats_port(1)
                    .build(),
            )
            .await;

        assert_eq!(controller.nodes().len(), 1);
        assert!(controller.registry().all_stats().is_empty());
    }
}
