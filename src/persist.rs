/*
 * Copyright © 2025, the mav_telemetry contributors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License"); you may not
 * use this file except in compliance with the License. You may obtain a copy
 * of the License at http://www.apache.org/licenses/LICENSE-2.0.
 *
 * Unless required by applicable law or agreed to in writing, software distributed under
 * the License is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
 * either express or implied. See the License for the specific language governing permissions
 * and limitations under the License.
 */

//! batched best-effort persistence of dirty state records.
//!
//! The store is an external collaborator behind [`TelemetryStore`]; its failure
//! must never stop ingestion or broadcast, so a failed batch is merged back into
//! the dirty set and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::state::StateEngine;
use crate::DroneState;

pub const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// collaborator contract of the port-keyed telemetry store
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn save(&self, record: &DroneState) -> Result<()>;
    async fn save_all(&self, records: &[DroneState]) -> Result<()>;
    async fn find_by_port(&self, port: u16) -> Result<Option<DroneState>>;
    async fn find_by_gcs_ip(&self, gcs_ip: &str) -> Result<Vec<DroneState>>;
    async fn delete_by_port(&self, port: u16) -> Result<()>;
}

/// in-memory reference store, used by the server binary and the tests
pub struct InMemoryStore {
    records: DashMap<u16, DroneState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore { records: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryStore for InMemoryStore {
    async fn save(&self, record: &DroneState) -> Result<()> {
        self.records.insert(record.port, record.clone());
        Ok(())
    }

    async fn save_all(&self, records: &[DroneState]) -> Result<()> {
        for record in records {
            self.records.insert(record.port, record.clone());
        }
        Ok(())
    }

    async fn find_by_port(&self, port: u16) -> Result<Option<DroneState>> {
        Ok(self.records.get(&port).map(|r| r.clone()))
    }

    async fn find_by_gcs_ip(&self, gcs_ip: &str) -> Result<Vec<DroneState>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.gcs_ip == gcs_ip)
            .map(|r| r.clone())
            .collect())
    }

    async fn delete_by_port(&self, port: u16) -> Result<()> {
        self.records.remove(&port);
        Ok(())
    }
}

/// flushes dirty records to the store at a fixed cadence
pub struct Persister {
    engine: Arc<StateEngine>,
    store: Arc<dyn TelemetryStore>,
}

impl Persister {
    pub fn new(engine: Arc<StateEngine>, store: Arc<dyn TelemetryStore>) -> Self {
        Persister { engine, store }
    }

    /// pop the dirty set and write those records in one batch. On failure the
    /// batch is merged back into the dirty set for the next attempt.
    pub async fn flush(&self) -> Result<usize> {
        let ports = self.engine.drain_dirty();
        if ports.is_empty() {
            return Ok(0);
        }

        let batch = self.engine.snapshot_of(&ports);
        match self.store.save_all(&batch).await {
            Ok(()) => {
                debug!("persisted {} telemetry records", batch.len());
                Ok(batch.len())
            }
            Err(e) => {
                error!("failed to persist batch of {} records: {e}", batch.len());
                self.engine.mark_dirty(&ports);
                Err(e)
            }
        }
    }

    pub fn spawn(persister: Arc<Persister>) -> JoinHandle<()> {
        info!("starting persister");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PERSIST_INTERVAL).await;
                let _ = persister.flush().await; // failures stay on the dirty set
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datetime::EpochMillis;
    use crate::errors::persist_error;
    use mavlink::ardupilotmega::{GLOBAL_POSITION_INT_DATA, MavMessage};
    use mavlink::MavHeader;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyStore {
        inner: InMemoryStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TelemetryStore for FlakyStore {
        async fn save(&self, record: &DroneState) -> Result<()> {
            self.save_all(std::slice::from_ref(record)).await
        }

        async fn save_all(&self, records: &[DroneState]) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(persist_error("store unavailable"));
            }
            self.inner.save_all(records).await
        }

        async fn find_by_port(&self, port: u16) -> Result<Option<DroneState>> {
            self.inner.find_by_port(port).await
        }

        async fn find_by_gcs_ip(&self, gcs_ip: &str) -> Result<Vec<DroneState>> {
            self.inner.find_by_gcs_ip(gcs_ip).await
        }

        async fn delete_by_port(&self, port: u16) -> Result<()> {
            self.inner.delete_by_port(port).await
        }
    }

    fn engine_with_dirty(port: u16) -> Arc<StateEngine> {
        let engine = Arc::new(StateEngine::new(30_000));
        let sender = "10.0.0.5:1".parse().unwrap();
        let header = MavHeader { system_id: 1, component_id: 1, sequence: 0 };
        let msg = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA::default());
        engine.apply_at(port, sender, &header, &msg, EpochMillis::now());
        engine
    }

    #[tokio::test]
    async fn test_flush_clears_dirty_set() {
        let engine = engine_with_dirty(14551);
        let store = Arc::new(InMemoryStore::new());
        let persister = Persister::new(engine.clone(), store.clone());

        assert_eq!(persister.flush().await.unwrap(), 1);
        assert!(store.find_by_port(14551).await.unwrap().is_some());
        assert_eq!(persister.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_retains_batch() {
        let engine = engine_with_dirty(14551);
        let store = Arc::new(FlakyStore { inner: InMemoryStore::new(), fail: AtomicBool::new(true) });
        let persister = Persister::new(engine.clone(), store.clone());

        assert!(persister.flush().await.is_err());
        assert!(store.inner.is_empty());

        // recovery: the retained batch goes through on the next flush
        store.fail.store(false, Ordering::Relaxed);
        assert_eq!(persister.flush().await.unwrap(), 1);
        assert!(store.inner.find_by_port(14551).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_queries() {
        let store = InMemoryStore::new();
        let mut a = DroneState::new(1);
        a.gcs_ip = "10.0.0.5".to_string();
        let mut b = DroneState::new(2);
        b.gcs_ip = "10.0.0.6".to_string();
        store.save_all(&[a, b]).await.unwrap();

        assert_eq!(store.find_by_gcs_ip("10.0.0.5").await.unwrap().len(), 1);
        store.delete_by_port(1).await.unwrap();
        assert!(store.find_by_port(1).await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }
}
