//! Engine facade — the boundary the transport layer mounts on.
//!
//! Owns the detector, embedder, session manager, identity store, and
//! similarity index, and exposes the enrollment and search operations.
//! The store and index never diverge: the engine loads the index from
//! the store at construction and every enrollment writes both.

use crate::detector::{self, Detector, DetectorError};
use crate::embedder::{Embedder, EmbedderError};
use crate::index::{IndexError, RankedMatch, SimilarityIndex};
use crate::quality::QualityConfig;
use crate::session::{
    FrameOutcome, SessionConfig, SessionError, SessionManager, StartedSession,
};
use crate::store::{IdentityStore, StoreError};
use crate::trail::{NoMatchReason, Trail};
use crate::types::IdentityRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("no face detected in query image")]
    NoFaceDetected,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("processing timed out after {0} seconds")]
    ProcessingTimeout(u64),
}

/// Search result as returned to the transport layer.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub similarity: f32,
    pub trail: Trail,
    pub trail_icon: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NoMatchReason>,
    pub ranked: Vec<RankedMatch>,
    pub elapsed_ms: u64,
}

/// One row of an identity listing.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity_key: String,
    pub display_name: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

pub struct Engine {
    detector: Arc<dyn Detector>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IdentityStore>,
    index: Arc<SimilarityIndex>,
    sessions: SessionManager,
    top_k: usize,
}

impl Engine {
    /// Build the engine and hydrate the similarity index from the store.
    pub fn new(
        detector: Arc<dyn Detector>,
        embedder: Arc<dyn Embedder>,
        quality: QualityConfig,
        store: Arc<dyn IdentityStore>,
        session_config: SessionConfig,
        top_k: usize,
    ) -> Result<Self, EngineError> {
        let index = Arc::new(SimilarityIndex::new());
        let records = store.load_all()?;
        for record in &records {
            index.insert(&record.identity_key, &record.embedding)?;
        }
        tracing::info!(identities = records.len(), "similarity index loaded");

        let sessions = SessionManager::new(
            Arc::clone(&detector),
            Arc::clone(&embedder),
            quality,
            Arc::clone(&store),
            Arc::clone(&index),
            session_config,
        );

        Ok(Self {
            detector,
            embedder,
            store,
            index,
            sessions,
            top_k: top_k.max(1),
        })
    }

    /// Start an enrollment session for the given identity.
    pub fn start_enrollment(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<StartedSession, EngineError> {
        Ok(self.sessions.start(external_id, display_name)?)
    }

    /// Submit one captured frame to an active session.
    pub async fn submit_frame(
        &self,
        token: &str,
        image_bytes: &[u8],
    ) -> Result<FrameOutcome, EngineError> {
        let image = image::load_from_memory(image_bytes)?.to_rgb8();
        Ok(self.sessions.submit_frame(token, &image).await?)
    }

    /// Finish an enrollment session and return the identity record.
    pub async fn complete_enrollment(&self, token: &str) -> Result<IdentityRecord, EngineError> {
        Ok(self.sessions.complete(token).await?)
    }

    /// Explicitly abort an enrollment session.
    pub async fn abort_enrollment(&self, token: &str) -> Result<(), EngineError> {
        Ok(self.sessions.abort(token).await?)
    }

    /// Identify the pet in a query image and classify the match strength.
    pub fn search_by_image(&self, image_bytes: &[u8]) -> Result<SearchResponse, EngineError> {
        let started = Instant::now();
        let image = image::load_from_memory(image_bytes)?.to_rgb8();

        if self.index.is_empty() {
            tracing::debug!("search against empty corpus");
            return Ok(SearchResponse {
                identity_key: None,
                display_name: None,
                similarity: 0.0,
                trail: Trail::NoMatch,
                trail_icon: Trail::NoMatch.icon().to_string(),
                message: "No identities enrolled; nothing to match against.".to_string(),
                reason: Some(NoMatchReason::EmptyCorpus),
                ranked: Vec::new(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let detections = self.detector.detect(&image)?;
        let best = detector::best_detection(&detections).ok_or(EngineError::NoFaceDetected)?;
        let crop = detector::crop_face(&image, &best.bbox);
        let embedding = self.embedder.embed(&crop)?;

        let ranked = self.index.query(&embedding, self.top_k);
        // Corpus is non-empty and top_k >= 1, so a best match exists.
        let top_key = ranked[0].identity_key.clone();
        let top_score = ranked[0].score;
        let trail = Trail::from_score(top_score);

        let (identity_key, display_name, reason) = if trail == Trail::NoMatch {
            (None, None, Some(NoMatchReason::LowSimilarity))
        } else {
            let name = self.store.get(&top_key)?.map(|r| r.display_name);
            (Some(top_key), name, None)
        };

        let response = SearchResponse {
            identity_key,
            display_name,
            similarity: top_score,
            trail,
            trail_icon: trail.icon().to_string(),
            message: trail.message(top_score),
            reason,
            ranked,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            trail = response.trail.label(),
            similarity = response.similarity,
            elapsed_ms = response.elapsed_ms,
            "search completed"
        );
        Ok(response)
    }

    /// All enrolled identities, in key order.
    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        Ok(self
            .store
            .load_all()?
            .into_iter()
            .map(|r| IdentitySummary {
                identity_key: r.identity_key,
                display_name: r.display_name,
                version: r.version,
                created_at: r.created_at,
            })
            .collect())
    }

    /// Remove an identity from the store and the index. Returns whether
    /// it was present.
    pub fn remove_identity(&self, identity_key: &str) -> Result<bool, EngineError> {
        let removed = self.store.remove(identity_key)?;
        self.index.remove(identity_key);
        if removed {
            tracing::info!(identity_key, "identity removed");
        }
        Ok(removed)
    }

    pub fn corpus_size(&self) -> usize {
        self.index.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_sessions()
    }
}
