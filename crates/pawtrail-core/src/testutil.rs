//! Shared stub collaborators for engine and session tests.

use crate::detector::{Detection, Detector, DetectorError, PetClass};
use crate::embedder::{Embedder, EmbedderError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A detection covering most of a 64×64 test image.
pub(crate) fn full_frame_detection(confidence: f32) -> Detection {
    Detection {
        class: PetClass::DogFace,
        bbox: BoundingBox {
            x: 4.0,
            y: 4.0,
            width: 56.0,
            height: 56.0,
            confidence,
        },
    }
}

pub(crate) enum StubBehavior {
    Fixed(Vec<Detection>),
    /// Alternate between one face and none on successive calls.
    Alternating,
}

pub(crate) struct StubDetector {
    behavior: StubBehavior,
    calls: AtomicUsize,
}

impl StubDetector {
    pub(crate) fn one_face() -> Self {
        Self {
            behavior: StubBehavior::Fixed(vec![full_frame_detection(0.9)]),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn no_faces() -> Self {
        Self {
            behavior: StubBehavior::Fixed(vec![]),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn two_faces() -> Self {
        let small = Detection {
            class: PetClass::CatFace,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.7,
            },
        };
        Self {
            behavior: StubBehavior::Fixed(vec![small, full_frame_detection(0.95)]),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn alternating() -> Self {
        Self {
            behavior: StubBehavior::Alternating,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Detector for StubDetector {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            StubBehavior::Fixed(detections) => Ok(detections.clone()),
            StubBehavior::Alternating => {
                if call % 2 == 0 {
                    Ok(vec![full_frame_detection(0.9)])
                } else {
                    Ok(vec![])
                }
            }
        }
    }
}

/// Embeds a crop as its normalized mean color, so identical images map
/// to identical vectors and different colors stay distinguishable.
pub(crate) struct StubEmbedder;

impl StubEmbedder {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl Embedder for StubEmbedder {
    fn embed(&self, crop: &RgbImage) -> Result<Embedding, EmbedderError> {
        let n = (crop.width() * crop.height()) as f32;
        let mut sums = [0.0f32; 3];
        for pixel in crop.pixels() {
            for c in 0..3 {
                sums[c] += pixel[c] as f32;
            }
        }
        // Bias keeps the vector nonzero for all-black crops.
        let values: Vec<f32> = sums.iter().map(|s| s / n / 255.0 + 0.05).collect();
        Ok(Embedding {
            values,
            model_version: Some("stub".into()),
        }
        .normalized())
    }
}

/// Returns pre-seeded vectors in order; panics when the queue runs dry.
pub(crate) struct QueueEmbedder {
    queue: Mutex<VecDeque<Vec<f32>>>,
}

impl QueueEmbedder {
    pub(crate) fn new(vectors: Vec<Vec<f32>>) -> Self {
        Self {
            queue: Mutex::new(vectors.into()),
        }
    }
}

impl Embedder for QueueEmbedder {
    fn embed(&self, _crop: &RgbImage) -> Result<Embedding, EmbedderError> {
        let values = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("QueueEmbedder ran out of vectors");
        Ok(Embedding {
            values,
            model_version: Some("stub".into()),
        })
    }
}

/// Encode an image as PNG bytes, as the boundary operations receive them.
pub(crate) fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .expect("png encode");
    buf
}
