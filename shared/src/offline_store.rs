//! Durable blob format and the bounded offline cache.
//!
//! Every blob written to a [`DurableStore`](crate::capabilities::DurableStore)
//! goes through [`SnapshotCodec`]: CBOR payload, blake3 checksum, versioned
//! envelope, optionally sealed with the device key.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use crate::capabilities::KvError;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::model::{ActionPayload, ChatMessage, LocationSample, SosAlert};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 32 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"HVST";
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },
}

impl StoreError {
    /// Errors that mean the bytes on disk cannot be trusted, as opposed to the
    /// store being unreachable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupted { .. }
                | StoreError::IntegrityCheckFailed { .. }
                | StoreError::Serialization(_)
                | StoreError::StoreTooLarge { .. }
                | StoreError::Crypto(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Binds sealed blobs to one device so a copied database does not open
/// elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContext {
    store_name: String,
    device_id: String,
}

impl StoreContext {
    pub fn new(store_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            device_id: device_id.into(),
        }
    }

    fn to_aad(&self) -> Vec<u8> {
        format!(
            "haven-store:v{}:{}:{}",
            CURRENT_SCHEMA_VERSION, self.store_name, self.device_id
        )
        .into_bytes()
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Clone)]
pub struct SnapshotCodec {
    sealer: Option<(Arc<dyn CryptoProvider>, StoreContext)>,
}

impl std::fmt::Debug for SnapshotCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCodec")
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        Self::plain()
    }
}

impl SnapshotCodec {
    pub fn plain() -> Self {
        Self { sealer: None }
    }

    pub fn sealed(crypto: Arc<dyn CryptoProvider>, ctx: StoreContext) -> Self {
        Self {
            sealer: Some((crypto, ctx)),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealer.is_some()
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        let mut payload = Vec::new();
        ciborium::into_writer(value, &mut payload)?;

        let checksum = blake3::hash(&payload);
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;

        match &self.sealer {
            Some((crypto, ctx)) => Ok(crypto.encrypt(&bytes, &ctx.to_aad())?),
            None => Ok(bytes),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty blob",
            });
        }
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let opened;
        let envelope_bytes = match &self.sealer {
            Some((crypto, ctx)) => {
                opened = crypto.decrypt(bytes, &ctx.to_aad())?;
                &opened[..]
            }
            None => bytes,
        };

        let envelope: StoreEnvelope = ciborium::from_reader(envelope_bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        Ok(ciborium::from_reader(&envelope.payload[..])?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Locations,
    Messages,
    SosAlerts,
}

/// Recently produced payloads kept so the UI can keep showing them while
/// offline. Each category is bounded; inserting into a full category evicts
/// its oldest entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfflineCache {
    capacity: usize,
    locations: VecDeque<LocationSample>,
    messages: VecDeque<ChatMessage>,
    sos_alerts: VecDeque<SosAlert>,
}

impl Default for OfflineCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn push_bounded<T>(list: &mut VecDeque<T>, item: T, capacity: usize) -> Option<T> {
    let evicted = if list.len() >= capacity {
        list.pop_front()
    } else {
        None
    };
    list.push_back(item);
    evicted
}

impl OfflineCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            locations: VecDeque::with_capacity(capacity.min(DEFAULT_CACHE_CAPACITY)),
            messages: VecDeque::new(),
            sos_alerts: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Applies a capacity loaded from config to a cache loaded from disk,
    /// trimming the oldest entries if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.locations.len() > self.capacity {
            self.locations.pop_front();
        }
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
        while self.sos_alerts.len() > self.capacity {
            self.sos_alerts.pop_front();
        }
    }

    pub fn push_location(&mut self, sample: LocationSample) -> Option<LocationSample> {
        push_bounded(&mut self.locations, sample, self.capacity)
    }

    pub fn push_message(&mut self, message: ChatMessage) -> Option<ChatMessage> {
        push_bounded(&mut self.messages, message, self.capacity)
    }

    pub fn push_sos(&mut self, alert: SosAlert) -> Option<SosAlert> {
        push_bounded(&mut self.sos_alerts, alert, self.capacity)
    }

    /// Caches whatever the payload carries. Status changes are not cached.
    /// Returns true when the cache changed.
    pub fn record(&mut self, payload: &ActionPayload) -> bool {
        match payload {
            ActionPayload::Location { sample, .. } => {
                self.push_location(sample.clone());
            }
            ActionPayload::Message { message, .. } => {
                self.push_message(message.clone());
            }
            ActionPayload::SosAlert { alert, .. } => {
                self.push_sos(alert.clone());
            }
            ActionPayload::StatusChange { .. } => return false,
        }
        true
    }

    pub fn len(&self, category: CacheCategory) -> usize {
        match category {
            CacheCategory::Locations => self.locations.len(),
            CacheCategory::Messages => self.messages.len(),
            CacheCategory::SosAlerts => self.sos_alerts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty() && self.messages.is_empty() && self.sos_alerts.is_empty()
    }

    pub fn locations(&self) -> impl Iterator<Item = &LocationSample> {
        self.locations.iter()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn sos_alerts(&self) -> impl Iterator<Item = &SosAlert> {
        self.sos_alerts.iter()
    }

    pub fn latest_location(&self) -> Option<&LocationSample> {
        self.locations.back()
    }

    pub fn clear(&mut self) {
        self.locations.clear();
        self.messages.clear();
        self.sos_alerts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlobSealer;
    use crate::model::{LatLon, UnixTimeMs};
    use proptest::prelude::*;

    fn sample(ts: u64) -> LocationSample {
        LocationSample::new(LatLon::new(48.85, 2.35).unwrap(), 10.0, UnixTimeMs(ts))
    }

    fn sealed_codec(device: &str) -> SnapshotCodec {
        SnapshotCodec::sealed(
            Arc::new(BlobSealer::new(&[3u8; 32]).unwrap()),
            StoreContext::new("queue", device),
        )
    }

    #[test]
    fn plain_codec_roundtrip() {
        let codec = SnapshotCodec::plain();
        let value = vec!["a".to_string(), "b".to_string()];
        let bytes = codec.encode(&value).unwrap();
        let back: Vec<String> = codec.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn sealed_codec_is_bound_to_device() {
        let bytes = sealed_codec("phone-1").encode(&42u32).unwrap();
        assert_eq!(sealed_codec("phone-1").decode::<u32>(&bytes).unwrap(), 42);

        let err = sealed_codec("phone-2").decode::<u32>(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
        assert!(err.is_corruption());
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let mut payload = Vec::new();
        ciborium::into_writer(&7u32, &mut payload).unwrap();
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: [0u8; 32],
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        let err = SnapshotCodec::plain().decode::<u32>(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityCheckFailed { .. }));
    }

    #[test]
    fn future_schema_is_rejected() {
        let mut payload = Vec::new();
        ciborium::into_writer(&7u32, &mut payload).unwrap();
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        let err = SnapshotCodec::plain().decode::<u32>(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::FutureSchema { found: 2, max: 1 }));
        assert!(!err.is_corruption());
    }

    #[test]
    fn garbage_and_empty_blobs_are_corrupt() {
        let codec = SnapshotCodec::plain();
        assert!(codec.decode::<u32>(&[]).unwrap_err().is_corruption());
        assert!(codec.decode::<u32>(b"not cbor at all").unwrap_err().is_corruption());
    }

    #[test]
    fn cache_keeps_newest_hundred_of_150() {
        let mut cache = OfflineCache::default();
        for ts in 0..150 {
            cache.push_location(sample(ts));
        }
        assert_eq!(cache.len(CacheCategory::Locations), 100);
        let stamps: Vec<u64> = cache.locations().map(|s| s.timestamp.0).collect();
        assert_eq!(stamps, (50..150).collect::<Vec<_>>());
        assert_eq!(cache.latest_location().unwrap().timestamp, UnixTimeMs(149));
    }

    #[test]
    fn categories_are_bounded_independently() {
        let mut cache = OfflineCache::new(2);
        for ts in 0..5 {
            cache.push_location(sample(ts));
        }
        cache
            .push_message(ChatMessage::new("kid", "hi", UnixTimeMs(1)).unwrap());
        assert_eq!(cache.len(CacheCategory::Locations), 2);
        assert_eq!(cache.len(CacheCategory::Messages), 1);
        assert_eq!(cache.len(CacheCategory::SosAlerts), 0);
    }

    #[test]
    fn shrinking_capacity_trims_oldest() {
        let mut cache = OfflineCache::new(10);
        for ts in 0..10 {
            cache.push_location(sample(ts));
        }
        cache.set_capacity(3);
        let stamps: Vec<u64> = cache.locations().map(|s| s.timestamp.0).collect();
        assert_eq!(stamps, vec![7, 8, 9]);
    }

    #[test]
    fn cache_survives_codec() {
        let mut cache = OfflineCache::new(5);
        cache.push_location(sample(1));
        cache.push_sos(SosAlert {
            position: None,
            raised_at: UnixTimeMs(2),
            trigger: crate::model::SosTrigger::Gesture,
        });
        let codec = sealed_codec("phone-1");
        let back: OfflineCache = codec.decode(&codec.encode(&cache).unwrap()).unwrap();
        assert_eq!(back, cache);
    }

    proptest! {
        #[test]
        fn cache_never_exceeds_capacity(capacity in 1usize..50, inserts in 0usize..200) {
            let mut cache = OfflineCache::new(capacity);
            for ts in 0..inserts {
                cache.push_location(sample(ts as u64));
            }
            prop_assert_eq!(cache.len(CacheCategory::Locations), inserts.min(capacity));
            if inserts > 0 {
                prop_assert_eq!(
                    cache.latest_location().map(|s| s.timestamp.0),
                    Some(inserts as u64 - 1)
                );
            }
        }
    }
}
