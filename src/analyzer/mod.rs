//! Event-driven image-similarity analysis.
//!
//! Consumes `ListingImagesUpdated` events from the bus through a bounded
//! internal queue drained by a single worker. Per event, the listing's
//! fingerprints are rebuilt inside one transaction, compared against every
//! other listing's fingerprints, and suspicion is propagated to matched
//! counterparts in both directions.

pub mod phash;

pub use phash::{HASH_BITS, hamming_distance, phash64};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{
    EventBus, EventKind, ListingAnalysisCompleted, ListingEvent, ListingImagesUpdated,
};
use crate::store::{
    Database, FingerprintStore, ImageFingerprint, ListingStore,
    fingerprint::NewFingerprint, listing::Listing,
};

pub const SUSPICION_REASON_DUPLICATE_IMAGE: &str = "duplicate-image";

/// Runtime configuration for image analysis.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub hash_method: String,
    /// Maximum Hamming distance still counted as a duplicate.
    pub phash_threshold: u32,
    pub fetch_timeout_seconds: u64,
    pub max_image_bytes: usize,
    pub parallel_downloads: usize,
    pub queue_capacity: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            hash_method: "phash".to_string(),
            phash_threshold: 5,
            fetch_timeout_seconds: 15,
            max_image_bytes: 10_000_000,
            parallel_downloads: 3,
            queue_capacity: 256,
        }
    }
}

/// Test hook replacing the HTTP download path.
pub type ImageFetcher = Arc<dyn Fn(String) -> BoxFuture<'static, Option<Vec<u8>>> + Send + Sync>;

struct FingerprintSource {
    url: String,
    bits: u64,
    width: i64,
    height: i64,
    file_size: i64,
}

pub struct ImageAnalyzer {
    db: Database,
    event_bus: Arc<EventBus>,
    config: AnalysisConfig,
    http: reqwest::Client,
    fetcher: Option<ImageFetcher>,
    queue_tx: mpsc::Sender<Option<ListingImagesUpdated>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Option<ListingImagesUpdated>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ImageAnalyzer {
    pub fn new(db: Database, event_bus: Arc<EventBus>, config: AnalysisConfig) -> Result<Arc<Self>> {
        Self::build(db, event_bus, config, None)
    }

    /// Construct with a byte-fetcher instead of live HTTP (tests).
    pub fn with_fetcher(
        db: Database,
        event_bus: Arc<EventBus>,
        config: AnalysisConfig,
        fetcher: ImageFetcher,
    ) -> Result<Arc<Self>> {
        Self::build(db, event_bus, config, Some(fetcher))
    }

    fn build(
        db: Database,
        event_bus: Arc<EventBus>,
        config: AnalysisConfig,
        fetcher: Option<ImageFetcher>,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_seconds))
            .build()
            .context("Failed to build image download client")?;
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Ok(Arc::new(Self {
            db,
            event_bus,
            config,
            http,
            fetcher,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            worker: Mutex::new(None),
        }))
    }

    /// Subscribe to image-update events and start the worker.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            warn!("Image analyzer already consumed its queue receiver");
            return;
        };

        let queue_tx = self.queue_tx.clone();
        self.event_bus
            .subscribe_fn(EventKind::ImagesUpdated, move |event| {
                let queue_tx = queue_tx.clone();
                async move {
                    if let ListingEvent::ImagesUpdated(payload) = event
                        && queue_tx.send(Some(payload)).await.is_err()
                    {
                        warn!("Image analyzer queue closed; dropping event");
                    }
                }
            });

        let analyzer = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            while let Some(message) = queue_rx.recv().await {
                let Some(event) = message else { break };
                let started = Instant::now();
                let status = match analyzer.handle_event(&event).await {
                    Ok(()) => "success",
                    Err(e) => {
                        error!(
                            listing_id = event.listing_id,
                            external_id = %event.external_id,
                            "Image analysis failed: {e:#}"
                        );
                        "error"
                    }
                };
                metrics::counter!("image_analysis_events_total", 1, "status" => status);
                metrics::histogram!(
                    "image_analysis_duration_seconds",
                    started.elapsed().as_secs_f64(),
                    "status" => status
                );
            }
            debug!("Image analyzer worker exited");
        }));
        info!("Image analyzer started");
    }

    /// Stop the worker after draining queued events.
    pub async fn stop(&self) {
        let task = self.worker.lock().await.take();
        if let Some(task) = task {
            if self.queue_tx.send(None).await.is_err() {
                task.abort();
            }
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!("Image analyzer worker failed during shutdown: {e}");
            }
            info!("Image analyzer stopped");
        }
    }

    /// One analysis pass, one transaction.
    async fn handle_event(&self, event: &ListingImagesUpdated) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let Some(listing) = ListingStore::get_by_id(&mut tx, event.listing_id).await? else {
            warn!(
                listing_id = event.listing_id,
                "Received analysis event for missing listing"
            );
            return Ok(());
        };

        if event.image_urls.is_empty() {
            FingerprintStore::delete_for_listing(&mut tx, listing.id).await?;
            ListingStore::clear_suspicion(&mut tx, listing.id).await?;
            tx.commit().await.map_err(anyhow::Error::from)?;
            self.publish_completed(&listing, false, None, None, None);
            debug!(listing_id = listing.id, "Cleared suspicion for listing without images");
            return Ok(());
        }

        FingerprintStore::delete_for_listing(&mut tx, listing.id).await?;
        let candidates = FingerprintStore::list_all(&mut tx, Some(listing.id)).await?;

        // Fingerprints stream in as downloads complete, bounded by the
        // download semaphore and the channel capacity.
        let (fp_tx, mut fp_rx) = mpsc::channel::<FingerprintSource>(
            self.config.parallel_downloads.max(1),
        );
        let semaphore = Arc::new(Semaphore::new(self.config.parallel_downloads.max(1)));
        for url in event.image_urls.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let fp_tx = fp_tx.clone();
            let client = self.http.clone();
            let fetcher = self.fetcher.clone();
            let max_bytes = self.config.max_image_bytes;
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok();
                let Some(bytes) = fetch_image(&client, fetcher.as_ref(), &url, max_bytes).await
                else {
                    return;
                };
                let Some(source) = build_fingerprint_source(&url, &bytes) else {
                    return;
                };
                let _ = fp_tx.send(source).await;
            });
        }
        drop(fp_tx);

        let mut matches: Vec<(ImageFingerprint, u32)> = Vec::new();
        while let Some(source) = fp_rx.recv().await {
            let stored = FingerprintStore::add(
                &mut tx,
                &NewFingerprint {
                    listing_id: listing.id,
                    image_url: source.url,
                    hash_method: self.config.hash_method.clone(),
                    hash_bits: source.bits,
                    width: Some(source.width),
                    height: Some(source.height),
                    file_size: Some(source.file_size),
                },
            )
            .await?;

            for candidate in &candidates {
                if candidate.hash_method != stored.hash_method {
                    continue;
                }
                let distance = hamming_distance(stored.hash_bits, candidate.hash_bits);
                if distance <= self.config.phash_threshold {
                    matches.push((candidate.clone(), distance));
                }
            }
        }

        if matches.is_empty() {
            ListingStore::clear_suspicion(&mut tx, listing.id).await?;
            tx.commit().await.map_err(anyhow::Error::from)?;
            self.publish_completed(&listing, false, None, None, None);
            return Ok(());
        }

        // Load every matched counterpart once; keep the clones current while
        // propagation appends to their match lists.
        let mut matched: HashMap<i64, Listing> = HashMap::new();
        for (fingerprint, _) in &matches {
            if matched.contains_key(&fingerprint.listing_id) {
                continue;
            }
            if let Some(counterpart) =
                ListingStore::get_by_id(&mut tx, fingerprint.listing_id).await?
            {
                matched.insert(counterpart.id, counterpart);
            }
        }

        let matches_payload: Vec<Value> = matches
            .iter()
            .map(|(fingerprint, distance)| {
                json!({
                    "listing_id": fingerprint.listing_id,
                    "external_id": matched
                        .get(&fingerprint.listing_id)
                        .map(|l| l.external_id.clone()),
                    "image_url": fingerprint.image_url,
                    "hash_hex": fingerprint.hash_hex,
                    "hamming_distance": distance,
                })
            })
            .collect();
        let meta = json!({
            "hash_method": self.config.hash_method,
            "threshold": self.config.phash_threshold,
            "matches": matches_payload,
        });
        let confidence =
            estimate_confidence(&matches.iter().map(|(_, d)| *d).collect::<Vec<_>>());

        ListingStore::mark_suspicion(
            &mut tx,
            listing.id,
            SUSPICION_REASON_DUPLICATE_IMAGE,
            Some(confidence),
            Some(&meta),
        )
        .await?;

        self.propagate_matches(&mut tx, &listing, &matches, &mut matched)
            .await?;

        tx.commit().await.map_err(anyhow::Error::from)?;
        self.publish_completed(
            &listing,
            true,
            Some(SUSPICION_REASON_DUPLICATE_IMAGE.to_string()),
            Some(confidence),
            Some(meta),
        );
        Ok(())
    }

    /// Mark each matched counterpart as suspicious too, appending this
    /// listing to its match list.
    async fn propagate_matches(
        &self,
        tx: &mut sqlx::SqliteConnection,
        source_listing: &Listing,
        matches: &[(ImageFingerprint, u32)],
        matched: &mut HashMap<i64, Listing>,
    ) -> Result<()> {
        for (fingerprint, distance) in matches {
            let Some(counterpart) = matched.get_mut(&fingerprint.listing_id) else {
                continue;
            };

            let mut meta = match counterpart.suspicion_meta.clone() {
                Some(Value::Object(map)) => Value::Object(map),
                _ => json!({ "matches": [] }),
            };
            let entry = json!({
                "listing_id": source_listing.id,
                "external_id": source_listing.external_id,
                "image_url": fingerprint.image_url,
                "hash_hex": fingerprint.hash_hex,
                "hamming_distance": distance,
                "threshold": self.config.phash_threshold,
            });
            if let Some(map) = meta.as_object_mut() {
                match map.get_mut("matches") {
                    Some(Value::Array(list)) => list.push(entry),
                    _ => {
                        map.insert("matches".to_string(), Value::Array(vec![entry]));
                    }
                }
                map.insert(
                    "hash_method".to_string(),
                    Value::String(self.config.hash_method.clone()),
                );
            }

            ListingStore::mark_suspicion(
                tx,
                counterpart.id,
                SUSPICION_REASON_DUPLICATE_IMAGE,
                None,
                Some(&meta),
            )
            .await?;
            counterpart.suspicion_meta = Some(meta);
        }
        Ok(())
    }

    fn publish_completed(
        &self,
        listing: &Listing,
        is_suspicious: bool,
        reason: Option<String>,
        confidence: Option<f64>,
        meta: Option<Value>,
    ) {
        let outcome = ListingAnalysisCompleted {
            listing_id: listing.id,
            external_id: listing.external_id.clone(),
            is_suspicious,
            reason,
            confidence,
            meta,
            analyzed_at: Utc::now(),
        };
        if let Err(e) = self
            .event_bus
            .publish(ListingEvent::AnalysisCompleted(outcome))
        {
            error!(listing_id = listing.id, "Failed to publish analysis outcome: {e}");
        }
    }
}

/// Confidence from the best (smallest) Hamming distance, in [0, 1],
/// rounded to three decimals.
pub fn estimate_confidence(distances: &[u32]) -> f64 {
    let Some(best) = distances.iter().min() else {
        return 0.0;
    };
    let raw = 1.0 - f64::from(*best) / f64::from(HASH_BITS);
    (raw * 1000.0).round() / 1000.0
}

async fn fetch_image(
    client: &reqwest::Client,
    fetcher: Option<&ImageFetcher>,
    url: &str,
    max_bytes: usize,
) -> Option<Vec<u8>> {
    if let Some(fetcher) = fetcher {
        return fetcher(url.to_string()).await;
    }

    let response = match client.get(url).send().await.and_then(|r| r.error_for_status()) {
        Ok(response) => response,
        Err(e) => {
            warn!(url, "Failed to download image: {e}");
            return None;
        }
    };
    match response.bytes().await {
        Ok(bytes) if bytes.len() > max_bytes => {
            warn!(url, size = bytes.len(), "Image exceeds max size limit");
            None
        }
        Ok(bytes) => Some(bytes.to_vec()),
        Err(e) => {
            warn!(url, "Failed to read image body: {e}");
            None
        }
    }
}

fn build_fingerprint_source(url: &str, bytes: &[u8]) -> Option<FingerprintSource> {
    let decoded = match image::load_from_memory(bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(url, "Unsupported image format: {e}");
            return None;
        }
    };
    Some(FingerprintSource {
        url: url.to_string(),
        bits: phash64(&decoded),
        width: i64::from(decoded.width()),
        height: i64::from(decoded.height()),
        file_size: bytes.len() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_follows_best_distance() {
        assert_eq!(estimate_confidence(&[0]), 1.0);
        assert_eq!(estimate_confidence(&[5, 2, 60]), 0.969);
        assert_eq!(estimate_confidence(&[]), 0.0);
    }
}
