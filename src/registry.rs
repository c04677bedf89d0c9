//! Explicit registry of exchange adapters, built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use log::info;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::core::*;
use crate::exchange::{Connector, FrameHandler};


/// Produces a fresh handler for each client built for an adapter.
pub type HandlerFactory<V> = Arc<dyn Fn() -> Arc<dyn FrameHandler<V>> + Send + Sync>;

/// Adapters keyed by identifier, e.g. "binance".
pub struct AdapterRegistry<V> {
    factories: BTreeMap<String, HandlerFactory<V>>,
}

impl<V> Default for AdapterRegistry<V> {
    fn default() -> Self {
        Self { factories: BTreeMap::new() }
    }
}

impl<V: Clone + Send + 'static> AdapterRegistry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same identifier.
    pub fn register<F>(&mut self, id: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn FrameHandler<V>> + Send + Sync + 'static,
    {
        if self.factories.insert(id.to_string(), Arc::new(factory)).is_some() {
            info!("Adapter {} replaced", id);
        }
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered identifiers, in lexicographic order.
    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build a client driven by the adapter `id`.
    ///
    /// # Arguments
    ///
    /// * `id` - Adapter identifier.
    ///
    /// * `connector` - Transport used by the client.
    ///
    /// * `config` - Client settings.
    ///
    /// # Returns
    ///
    /// The client, or [UnknownAdapter](StreamError::UnknownAdapter) if no adapter
    /// is registered under `id`.
    pub fn build_client(&self, id: &str, connector: Arc<dyn Connector>, config: ClientConfig) -> Result<Client<V>> {
        let factory = self.factories.get(id)
            .ok_or_else(|| StreamError::UnknownAdapter(id.to_string()))?;
        Client::new(connector, factory(), config)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::MockConnector;

    struct EchoHandler;

    impl FrameHandler<String> for EchoHandler {
        fn on_frame(&self, client: &Client<String>, url: &str, frame: Frame) {
            if let Frame::Text(text) = frame {
                client.resolve(url, "echo", text);
            }
        }
    }

    fn make_registry() -> AdapterRegistry<String> {
        let mut registry = AdapterRegistry::new();
        registry
            .register("echo", || Arc::new(EchoHandler))
            .register("alpha", || Arc::new(EchoHandler));
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = make_registry();
        assert!(registry.contains("echo"));
        assert!(!registry.contains("missing"));
        assert_eq!(registry.ids(), vec!["alpha", "echo"]);
    }

    #[test]
    fn test_unknown_adapter() {
        let registry = make_registry();
        let (connector, _peers) = MockConnector::new();
        let result = registry.build_client("missing", connector, ClientConfig::default());
        assert!(matches!(result, Err(StreamError::UnknownAdapter(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_built_client_uses_adapter_handler() {
        let registry = make_registry();
        let (connector, mut peers) = MockConnector::new();
        let client = registry.build_client("echo", connector, ClientConfig::default()).unwrap();
        let completion = client.request("wss://echo.test", "echo", None);
        let peer = peers.recv().await.unwrap();
        peer.push_text("hello");
        assert_eq!(completion.await, Ok("hello".to_string()));
    }
}
