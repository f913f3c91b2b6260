//! Shared setup for loom-core integration tests

#![allow(dead_code)]

use loom_core::{Loom, LoomConfig, SqliteStore, Store};
use loom_test_utils::{CountingBackend, DEMO_PROMPT};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub loom: Loom,
    pub backend: Arc<CountingBackend>,
    pub store: Arc<SqliteStore>,
}

pub fn config() -> LoomConfig {
    LoomConfig::new().with_poll_interval(Duration::from_millis(10))
}

pub fn harness(backend: CountingBackend) -> Harness {
    harness_with(backend, config())
}

pub fn harness_with(backend: CountingBackend, config: LoomConfig) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let backend = Arc::new(backend);
    let loom = Loom::new(store.clone(), backend.clone(), config);
    let _dispatch = loom.start();
    Harness { loom, backend, store }
}

impl Harness {
    /// Create the `demo` scene
    pub async fn demo(&self) {
        self.scene(json!({"scene": DEMO_PROMPT, "key": "demo"})).await;
    }

    pub async fn scene(&self, request: serde_json::Value) -> String {
        let reply = self.loom.handle(&request).await.unwrap();
        reply["key"].as_str().unwrap().to_string()
    }

    /// Resolve a key and return its lines
    pub async fn lines(&self, key: &str) -> Vec<String> {
        let reply = self.loom.handle(&json!({"key": key, "username": "ann"})).await.unwrap();
        serde_json::from_value(reply["lines"].clone()).unwrap()
    }

    pub fn stored(&self, key: &str) -> Option<String> {
        self.store.line(key).unwrap().map(|l| l.text)
    }

    /// Forbidden lines sent with the request for `key`
    pub fn forbidden_for(&self, key: &str) -> Vec<String> {
        self.backend
            .requests()
            .into_iter()
            .find(|r| r.key == key)
            .map(|r| r.forbidden)
            .unwrap_or_default()
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
