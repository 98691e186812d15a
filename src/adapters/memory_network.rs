//! In-Memory Block Network Adapter
//!
//! Implements the `BlockNetwork` port over a concurrent map. Behaviour can
//! be scripted per key (fail, corrupt, hang) and random loss can be applied
//! to simulate an unreliable network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::domain::ports::{BlockNetwork, NetworkFetchError, NetworkPutError};
use crate::keys::ContentKey;

/// Scripted behaviour for one fetch of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStep {
    /// Return this error
    Fail(NetworkFetchError),
    /// Return the stored data with one byte flipped
    Corrupt,
    /// Never answer
    Hang,
    /// Behave normally
    Deliver,
}

#[derive(Debug)]
struct LossModel {
    fetch_loss: f64,
    put_loss: f64,
    rng: StdRng,
}

/// Block network held entirely in memory.
#[derive(Debug)]
pub struct InMemoryNetwork {
    blocks: DashMap<ContentKey, Bytes>,
    scripts: DashMap<ContentKey, VecDeque<FetchStep>>,
    poisoned: DashMap<ContentKey, FetchStep>,
    versions: DashMap<ContentKey, VecDeque<Bytes>>,
    put_script: Mutex<VecDeque<NetworkPutError>>,
    loss: Mutex<LossModel>,
    latency: Option<Duration>,
    fetches: AtomicU64,
    puts: AtomicU64,
    fetches_by_key: DashMap<ContentKey, u64>,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network whose random loss is reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            blocks: DashMap::new(),
            scripts: DashMap::new(),
            poisoned: DashMap::new(),
            versions: DashMap::new(),
            put_script: Mutex::new(VecDeque::new()),
            loss: Mutex::new(LossModel {
                fetch_loss: 0.0,
                put_loss: 0.0,
                rng,
            }),
            latency: None,
            fetches: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            fetches_by_key: DashMap::new(),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Probability that a fetch reports data-not-found.
    pub fn set_fetch_loss(&self, rate: f64) {
        self.loss.lock().fetch_loss = rate.clamp(0.0, 1.0);
    }

    /// Probability that a put reports route-not-found.
    pub fn set_put_loss(&self, rate: f64) {
        self.loss.lock().put_loss = rate.clamp(0.0, 1.0);
    }

    // =========================================================================
    // Direct store access
    // =========================================================================

    /// Store a block under its CHK without going through `put`.
    pub fn store(&self, data: Bytes) -> ContentKey {
        let key = ContentKey::chk_for(&data);
        self.blocks.insert(key.clone(), data);
        key
    }

    /// Store or overwrite a block under any key.
    pub fn replace(&self, key: &ContentKey, data: Bytes) {
        self.blocks.insert(key.clone(), data);
    }

    /// Drop a block so later fetches miss.
    pub fn remove(&self, key: &ContentKey) -> bool {
        self.blocks.remove(key).is_some()
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.blocks.contains_key(key)
    }

    pub fn get(&self, key: &ContentKey) -> Option<Bytes> {
        self.blocks.get(key).map(|b| b.value().clone())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Queue behaviours for the next fetches of `key`, one per fetch.
    pub fn script_fetch(&self, key: &ContentKey, steps: impl IntoIterator<Item = FetchStep>) {
        self.scripts.entry(key.clone()).or_default().extend(steps);
    }

    /// Apply `step` to every fetch of `key`.
    pub fn poison(&self, key: &ContentKey, step: FetchStep) {
        self.poisoned.insert(key.clone(), step);
    }

    /// Overwrite `key` with the next of `versions` before each delivered
    /// fetch of it, modelling a signed slot that is being republished.
    pub fn script_versions(&self, key: &ContentKey, versions: impl IntoIterator<Item = Bytes>) {
        self.versions.entry(key.clone()).or_default().extend(versions);
    }

    /// Queue errors for the next puts, whatever their key.
    pub fn script_put(&self, errors: impl IntoIterator<Item = NetworkPutError>) {
        self.put_script.lock().extend(errors);
    }

    // =========================================================================
    // Counters
    // =========================================================================

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn fetch_count_for(&self, key: &ContentKey) -> u64 {
        self.fetches_by_key.get(key).map_or(0, |c| *c)
    }

    fn next_step(&self, key: &ContentKey) -> FetchStep {
        if let Some(step) = self.poisoned.get(key) {
            return *step;
        }
        if let Some(mut script) = self.scripts.get_mut(key) {
            if let Some(step) = script.pop_front() {
                return step;
            }
        }
        let mut loss = self.loss.lock();
        let rate = loss.fetch_loss;
        if rate > 0.0 && loss.rng.gen_bool(rate) {
            return FetchStep::Fail(NetworkFetchError::DataNotFound);
        }
        FetchStep::Deliver
    }
}

#[async_trait]
impl BlockNetwork for InMemoryNetwork {
    async fn fetch(&self, key: &ContentKey) -> Result<Bytes, NetworkFetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        *self.fetches_by_key.entry(key.clone()).or_insert(0) += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let step = self.next_step(key);
        trace!(?key, ?step, "In-memory fetch");
        match step {
            FetchStep::Fail(err) => Err(err),
            FetchStep::Hang => futures::future::pending().await,
            FetchStep::Corrupt => {
                let data = self.get(key).ok_or(NetworkFetchError::DataNotFound)?;
                let mut corrupted = data.to_vec();
                match corrupted.first_mut() {
                    Some(byte) => *byte ^= 0xff,
                    None => corrupted.push(0xff),
                }
                Ok(Bytes::from(corrupted))
            }
            FetchStep::Deliver => {
                let next = self
                    .versions
                    .get_mut(key)
                    .and_then(|mut queue| queue.pop_front());
                if let Some(version) = next {
                    self.replace(key, version);
                }
                self.get(key).ok_or(NetworkFetchError::DataNotFound)
            }
        }
    }

    async fn put(
        &self,
        block: Bytes,
        target: Option<&ContentKey>,
    ) -> Result<ContentKey, NetworkPutError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.put_script.lock().pop_front() {
            return Err(err);
        }
        {
            let mut loss = self.loss.lock();
            let rate = loss.put_loss;
            if rate > 0.0 && loss.rng.gen_bool(rate) {
                return Err(NetworkPutError::RouteNotFound);
            }
        }

        let key = match target {
            None => ContentKey::chk_for(&block),
            Some(key) if key.is_chk() && !key.verify(&block) => {
                return Err(NetworkPutError::InternalError);
            }
            Some(key) => key.clone(),
        };
        // A signed slot can only be written once with given content.
        if let Some(existing) = self.blocks.get(&key) {
            if !key.is_chk() && *existing.value() != block {
                return Err(NetworkPutError::Collision);
            }
        }
        self.blocks.insert(key.clone(), block);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_fetch() {
        let network = InMemoryNetwork::new();
        let key = network.put(Bytes::from_static(b"abc"), None).await.unwrap();
        assert_eq!(key, ContentKey::chk_for(b"abc"));
        assert_eq!(network.fetch(&key).await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(network.fetch_count(), 1);
        assert_eq!(network.put_count(), 1);
        assert_eq!(network.fetch_count_for(&key), 1);
    }

    #[tokio::test]
    async fn test_script_consumed_in_order() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"abc"));
        network.script_fetch(
            &key,
            [
                FetchStep::Fail(NetworkFetchError::RouteNotFound),
                FetchStep::Fail(NetworkFetchError::DataNotFound),
            ],
        );
        assert_eq!(network.fetch(&key).await, Err(NetworkFetchError::RouteNotFound));
        assert_eq!(network.fetch(&key).await, Err(NetworkFetchError::DataNotFound));
        assert!(network.fetch(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_poison_is_sticky() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"abc"));
        network.poison(&key, FetchStep::Fail(NetworkFetchError::TransferFailed));
        for _ in 0..3 {
            assert_eq!(network.fetch(&key).await, Err(NetworkFetchError::TransferFailed));
        }
    }

    #[tokio::test]
    async fn test_full_loss() {
        let network = InMemoryNetwork::with_seed(1);
        let key = network.store(Bytes::from_static(b"abc"));
        network.set_fetch_loss(1.0);
        assert_eq!(network.fetch(&key).await, Err(NetworkFetchError::DataNotFound));
        network.set_put_loss(1.0);
        assert_eq!(
            network.put(Bytes::from_static(b"x"), None).await,
            Err(NetworkPutError::RouteNotFound)
        );
    }

    #[tokio::test]
    async fn test_ssk_collision() {
        let network = InMemoryNetwork::new();
        let key = ContentKey::ssk(b"pk", "doc");
        network
            .put(Bytes::from_static(b"one"), Some(&key))
            .await
            .unwrap();
        network
            .put(Bytes::from_static(b"one"), Some(&key))
            .await
            .unwrap();
        assert_eq!(
            network.put(Bytes::from_static(b"two"), Some(&key)).await,
            Err(NetworkPutError::Collision)
        );
    }

    #[tokio::test]
    async fn test_wrong_chk_target_rejected() {
        let network = InMemoryNetwork::new();
        let key = ContentKey::chk_for(b"expected");
        assert_eq!(
            network.put(Bytes::from_static(b"other"), Some(&key)).await,
            Err(NetworkPutError::InternalError)
        );
    }

    #[test]
    fn test_hang_never_answers() {
        let network = InMemoryNetwork::new();
        let key = network.store(Bytes::from_static(b"abc"));
        network.script_fetch(&key, [FetchStep::Hang]);

        let mut hung = tokio_test::task::spawn(network.fetch(&key));
        tokio_test::assert_pending!(hung.poll());
        tokio_test::assert_pending!(hung.poll());
        drop(hung);

        let mut next = tokio_test::task::spawn(network.fetch(&key));
        let result = tokio_test::assert_ready!(next.poll());
        assert_eq!(result, Ok(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_versions_served_in_order() {
        let network = InMemoryNetwork::new();
        let key = ContentKey::ssk(b"pk", "site");
        network.script_versions(&key, [Bytes::from_static(b"v1"), Bytes::from_static(b"v2")]);

        assert_eq!(network.fetch(&key).await, Ok(Bytes::from_static(b"v1")));
        assert_eq!(network.fetch(&key).await, Ok(Bytes::from_static(b"v2")));
        // The last version sticks.
        assert_eq!(network.fetch(&key).await, Ok(Bytes::from_static(b"v2")));
    }
}
