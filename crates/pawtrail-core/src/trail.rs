//! Trail classification — maps a best-match similarity score to a
//! named confidence tier.

use serde::{Deserialize, Serialize};

/// Inclusive lower bound for the Eagle trail.
pub const EAGLE_THRESHOLD: f32 = 0.90;
/// Inclusive lower bound for the Lobo trail.
pub const LOBO_THRESHOLD: f32 = 0.80;

/// Confidence tier assigned to a similarity score.
///
/// Boundary values belong to the higher tier: exactly 0.90 is Eagle,
/// exactly 0.80 is Lobo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trail {
    #[serde(rename = "eagle_trail")]
    Eagle,
    #[serde(rename = "lobo_trail")]
    Lobo,
    #[serde(rename = "no_match")]
    NoMatch,
}

/// Why a search produced no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    /// No identities are enrolled; every query is a No Match.
    EmptyCorpus,
    /// A best match exists but its score is below the Lobo threshold.
    LowSimilarity,
}

impl Trail {
    /// Classify a similarity score. Pure and stateless.
    pub fn from_score(score: f32) -> Trail {
        if score >= EAGLE_THRESHOLD {
            Trail::Eagle
        } else if score >= LOBO_THRESHOLD {
            Trail::Lobo
        } else {
            Trail::NoMatch
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Trail::Eagle => "eagle_trail",
            Trail::Lobo => "lobo_trail",
            Trail::NoMatch => "no_match",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Trail::Eagle => "\u{1F985}",
            Trail::Lobo => "\u{1F43A}",
            Trail::NoMatch => "\u{274C}",
        }
    }

    /// Human-readable result message including the score as a percentage.
    pub fn message(&self, similarity: f32) -> String {
        let pct = similarity * 100.0;
        match self {
            Trail::Eagle => format!(
                "Eagle Trail: very high confidence. Facial biometric similarity above 90% ({pct:.1}%)."
            ),
            Trail::Lobo => format!(
                "Lobo Trail: high confidence. Facial biometric similarity between 80% and 90% ({pct:.1}%)."
            ),
            Trail::NoMatch => format!("No match found. Similarity too low ({pct:.1}%)."),
        }
    }
}
