//! Time-boxed, multi-frame enrollment sessions.
//!
//! A session binds one identity to a capture window, gates each
//! submitted frame through detection and quality assessment, and
//! aggregates the accepted per-frame embeddings into the canonical
//! identity vector once the minimum count is reached.
//!
//! State machine: `Created → Capturing → Aggregating → Completed`,
//! with `Capturing → Expired` on deadline and `Created|Capturing →
//! Failed` on explicit abort or a write failure. Transitions are
//! one-way; no state is revisited.

use crate::aggregate::{self, AggregateError};
use crate::detector::{self, Detector, DetectorError};
use crate::embedder::{Embedder, EmbedderError};
use crate::ident::{derive_identity_key, IdentError};
use crate::index::{IndexError, SimilarityIndex};
use crate::quality::{self, QualityConfig, QualityMetrics, QualityReason};
use crate::store::{IdentityStore, StoreError};
use crate::types::{BoundingBox, Embedding, IdentityRecord};
use chrono::Utc;
use image::RgbImage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentError),
    #[error("session not found")]
    SessionNotFound,
    #[error("session not active (state: {0})")]
    SessionNotActive(SessionState),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Lifecycle state of an enrollment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Capturing,
    Aggregating,
    Completed,
    Expired,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Capturing => "capturing",
            SessionState::Aggregating => "aggregating",
            SessionState::Completed => "completed",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a submitted frame was not accepted. Recoverable: the caller may
/// resubmit within the same session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    NoFaceDetected,
    QualityRejected { reason: QualityReason },
}

/// One frame submission, recorded for session provenance. Immutable
/// once accepted.
#[derive(Debug, Clone, Serialize)]
pub struct FaceFrame {
    pub sequence: u32,
    pub bbox: Option<BoundingBox>,
    pub metrics: Option<QualityMetrics>,
    pub accepted: bool,
    pub reject_reason: Option<RejectReason>,
    #[serde(skip)]
    pub embedding: Option<Embedding>,
}

/// Per-frame response: always reports cumulative progress so the client
/// can decide whether to keep capturing.
#[derive(Debug, Clone, Serialize)]
pub struct FrameOutcome {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    pub frames_so_far: usize,
    pub frames_required: usize,
    /// True when this submission pushed the session to `Completed`.
    pub completed: bool,
}

/// Response to starting a session.
#[derive(Debug, Clone, Serialize)]
pub struct StartedSession {
    pub token: String,
    pub identity_key: String,
    pub frames_required: usize,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub min_frames: usize,
    pub max_frames: usize,
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_frames: 3,
            max_frames: 20,
            ttl: Duration::from_secs(600),
        }
    }
}

struct EnrollmentSession {
    token: String,
    identity_key: String,
    display_name: String,
    state: SessionState,
    deadline: Instant,
    frames: Vec<FaceFrame>,
    /// Set when the session reaches `Completed`; backs idempotent completion.
    record: Option<IdentityRecord>,
}

impl EnrollmentSession {
    fn accepted_count(&self) -> usize {
        self.frames.iter().filter(|f| f.accepted).count()
    }

    /// Enforce lazy expiry, then require a frame-accepting state.
    ///
    /// Expiry is a deadline compared against the clock on every access;
    /// once crossed the session can never accept frames or be resumed.
    fn ensure_active(&mut self, now: Instant) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Created | SessionState::Capturing)
            && now >= self.deadline
        {
            self.state = SessionState::Expired;
            tracing::info!(token = %self.token, "enrollment session expired");
        }
        match self.state {
            SessionState::Created | SessionState::Capturing => Ok(()),
            state => Err(SessionError::SessionNotActive(state)),
        }
    }
}

/// Owns every in-progress enrollment session and the full capture
/// workflow. Frame submissions for one session are serialized behind a
/// per-session lock; different sessions proceed in parallel.
pub struct SessionManager {
    detector: Arc<dyn Detector>,
    embedder: Arc<dyn Embedder>,
    quality: QualityConfig,
    store: Arc<dyn IdentityStore>,
    index: Arc<SimilarityIndex>,
    config: SessionConfig,
    sessions: StdMutex<HashMap<String, Arc<Mutex<EnrollmentSession>>>>,
}

impl SessionManager {
    pub fn new(
        detector: Arc<dyn Detector>,
        embedder: Arc<dyn Embedder>,
        quality: QualityConfig,
        store: Arc<dyn IdentityStore>,
        index: Arc<SimilarityIndex>,
        config: SessionConfig,
    ) -> Self {
        // A zero minimum or a minimum above the maximum would make the
        // session lifecycle degenerate.
        let min_frames = config.min_frames.max(1);
        let config = SessionConfig {
            min_frames,
            max_frames: config.max_frames.max(min_frames),
            ..config
        };
        Self {
            detector,
            embedder,
            quality,
            store,
            index,
            config,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    /// Start a session for the given identity, returning an opaque token.
    ///
    /// A key already present in the corpus fails fast with
    /// `DuplicateIdentity` instead of failing at aggregation time.
    pub fn start(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<StartedSession, SessionError> {
        let identity_key = derive_identity_key(external_id, display_name)?;
        if self.index.contains(&identity_key) {
            return Err(IndexError::DuplicateIdentity(identity_key).into());
        }

        let token = Uuid::new_v4().to_string();
        let session = EnrollmentSession {
            token: token.clone(),
            identity_key: identity_key.clone(),
            display_name: display_name.to_string(),
            state: SessionState::Created,
            deadline: Instant::now() + self.config.ttl,
            frames: Vec::new(),
            record: None,
        };

        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(token.clone(), Arc::new(Mutex::new(session)));

        tracing::info!(%identity_key, ttl_secs = self.config.ttl.as_secs(), "enrollment session started");

        Ok(StartedSession {
            token,
            identity_key,
            frames_required: self.config.min_frames,
            expires_in_secs: self.config.ttl.as_secs(),
        })
    }

    /// Submit one captured frame.
    ///
    /// Detection and quality failures are reported in the outcome and
    /// never terminate the session. When the accepted count reaches the
    /// configured minimum, aggregation runs and the session completes
    /// within this call.
    pub async fn submit_frame(
        &self,
        token: &str,
        image: &RgbImage,
    ) -> Result<FrameOutcome, SessionError> {
        let session = self.lookup(token)?;
        let mut session = session.lock().await;
        session.ensure_active(Instant::now())?;

        if session.state == SessionState::Created {
            session.state = SessionState::Capturing;
        }

        let sequence = session.frames.len() as u32 + 1;

        let detections = self.detector.detect(image)?;
        let Some(best) = detector::best_detection(&detections) else {
            session.frames.push(FaceFrame {
                sequence,
                bbox: None,
                metrics: None,
                accepted: false,
                reject_reason: Some(RejectReason::NoFaceDetected),
                embedding: None,
            });
            tracing::debug!(token = %session.token, sequence, "frame rejected: no face detected");
            return Ok(self.outcome(&session, false, Some(RejectReason::NoFaceDetected)));
        };
        let bbox = best.bbox.clone();

        let crop = detector::crop_face(image, &bbox);
        let metrics = quality::measure(&image::imageops::grayscale(&crop));
        if let Err(reason) = quality::assess(&metrics, &self.quality) {
            let reject = RejectReason::QualityRejected { reason };
            session.frames.push(FaceFrame {
                sequence,
                bbox: Some(bbox),
                metrics: Some(metrics),
                accepted: false,
                reject_reason: Some(reject),
                embedding: None,
            });
            tracing::debug!(token = %session.token, sequence, ?reason, "frame rejected: quality");
            return Ok(self.outcome(&session, false, Some(reject)));
        }

        let embedding = self.embedder.embed(&crop)?;
        debug_assert!(session.accepted_count() < self.config.max_frames);
        session.frames.push(FaceFrame {
            sequence,
            bbox: Some(bbox),
            metrics: Some(metrics),
            accepted: true,
            reject_reason: None,
            embedding: Some(embedding),
        });

        let accepted = session.accepted_count();
        tracing::debug!(
            token = %session.token,
            sequence,
            accepted,
            required = self.config.min_frames,
            "frame accepted"
        );

        let mut outcome = self.outcome(&session, true, None);
        if accepted >= self.config.min_frames {
            self.finalize(&mut session)?;
            outcome.completed = true;
        }
        Ok(outcome)
    }

    /// Finish the session and return the identity record.
    ///
    /// Idempotent on a `Completed` session. From `Capturing` below the
    /// minimum this is `InsufficientFrames`; the session stays active.
    pub async fn complete(&self, token: &str) -> Result<IdentityRecord, SessionError> {
        let session = self.lookup(token)?;
        let mut session = session.lock().await;

        if session.state == SessionState::Completed {
            if let Some(record) = &session.record {
                return Ok(record.clone());
            }
        }

        session.ensure_active(Instant::now())?;

        if session.accepted_count() < self.config.min_frames {
            return Err(AggregateError::InsufficientFrames {
                got: session.accepted_count(),
                min: self.config.min_frames,
            }
            .into());
        }
        self.finalize(&mut session)
    }

    /// Explicitly abort an in-progress session. Terminal.
    pub async fn abort(&self, token: &str) -> Result<(), SessionError> {
        let session = self.lookup(token)?;
        let mut session = session.lock().await;
        session.ensure_active(Instant::now())?;
        session.state = SessionState::Failed;
        tracing::info!(token = %session.token, "enrollment session aborted");
        Ok(())
    }

    /// Number of sessions currently able to accept frames.
    pub fn active_sessions(&self) -> usize {
        let sessions = self.sessions.lock().expect("session map lock poisoned");
        sessions
            .values()
            .filter(|s| {
                s.try_lock()
                    .map(|s| {
                        matches!(s.state, SessionState::Created | SessionState::Capturing)
                            && Instant::now() < s.deadline
                    })
                    .unwrap_or(true)
            })
            .count()
    }

    fn lookup(&self, token: &str) -> Result<Arc<Mutex<EnrollmentSession>>, SessionError> {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .get(token)
            .cloned()
            .ok_or(SessionError::SessionNotFound)
    }

    fn outcome(
        &self,
        session: &EnrollmentSession,
        accepted: bool,
        reason: Option<RejectReason>,
    ) -> FrameOutcome {
        FrameOutcome {
            accepted,
            reason,
            frames_so_far: session.accepted_count(),
            frames_required: self.config.min_frames,
            completed: false,
        }
    }

    /// Aggregate accepted frames, write the record, complete the session.
    ///
    /// Write order: index first (atomic duplicate guard), store second,
    /// index entry rolled back if the store write fails — the two never
    /// diverge.
    fn finalize(&self, session: &mut EnrollmentSession) -> Result<IdentityRecord, SessionError> {
        session.state = SessionState::Aggregating;

        let frames: Vec<Embedding> = session
            .frames
            .iter()
            .filter(|f| f.accepted)
            .filter_map(|f| f.embedding.clone())
            .collect();

        let canonical = match aggregate::aggregate(&frames, self.config.min_frames) {
            Ok(v) => v,
            Err(e) => {
                session.state = SessionState::Failed;
                return Err(e.into());
            }
        };

        let record = IdentityRecord {
            identity_key: session.identity_key.clone(),
            display_name: session.display_name.clone(),
            embedding: canonical,
            version: 1,
            created_at: Utc::now(),
            session_id: session.token.clone(),
        };

        if let Err(e) = self.index.insert(&record.identity_key, &record.embedding) {
            session.state = SessionState::Failed;
            return Err(e.into());
        }
        if let Err(e) = self.store.persist(&record) {
            self.index.remove(&record.identity_key);
            session.state = SessionState::Failed;
            return Err(e.into());
        }

        session.record = Some(record.clone());
        session.state = SessionState::Completed;
        tracing::info!(
            identity_key = %record.identity_key,
            frames = frames.len(),
            "enrollment completed"
        );
        Ok(record)
    }
}
