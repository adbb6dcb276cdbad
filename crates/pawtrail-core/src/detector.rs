//! Pet face detection via ONNX Runtime.
//!
//! Implements a YOLOv8-style detector over the four pet classes
//! (cat, cat_face, dog, dog_face) with single-tensor decoding and NMS
//! post-processing. Only face-class boxes are reported.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::{imageops, Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const YOLO_INPUT_SIZE: usize = 640;
const YOLO_CONFIDENCE_THRESHOLD: f32 = 0.5;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
const YOLO_BOX_ATTRS: usize = 4;
/// Letterbox padding value, the conventional YOLO neutral gray.
const YOLO_PAD_VALUE: u8 = 114;

/// Class vocabulary of the pet face model, in output-channel order.
const PET_CLASSES: [PetClass; 4] = [
    PetClass::Cat,
    PetClass::CatFace,
    PetClass::Dog,
    PetClass::DogFace,
];

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — place the pet face model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detected object class of the pet face model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PetClass {
    Cat,
    CatFace,
    Dog,
    DogFace,
}

impl PetClass {
    /// Whether this class is a face crop usable for embedding.
    pub fn is_face(&self) -> bool {
        matches!(self, PetClass::CatFace | PetClass::DogFace)
    }
}

/// One detected pet face.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Detection {
    pub class: PetClass,
    pub bbox: BoundingBox,
}

/// Capability interface over "something that finds pet faces".
///
/// Implementations are swappable black boxes; the engine never depends
/// on a concrete model.
pub trait Detector: Send + Sync {
    /// Detect pet faces, sorted by confidence descending.
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// YOLOv8-based pet face detector.
pub struct PetFaceDetector {
    session: Mutex<Session>,
}

impl PetFaceDetector {
    /// Load the ONNX model from the given path. Fails fast if absent.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded pet face detection model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl Detector for PetFaceDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detection output: {e}")))?;

        let detections = decode_predictions(data, &letterbox, YOLO_CONFIDENCE_THRESHOLD)?;
        let mut result = nms(detections, YOLO_NMS_THRESHOLD);
        result.sort_by(|a, b| {
            b.bbox
                .confidence
                .partial_cmp(&a.bbox.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(result)
    }
}

/// Resize with letterbox padding into the square model input, then
/// normalize RGB bytes to [0, 1] in NCHW layout.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();

    let scale_w = YOLO_INPUT_SIZE as f32 / width as f32;
    let scale_h = YOLO_INPUT_SIZE as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as u32).max(1);
    let new_h = ((height as f32 * scale).round() as u32).max(1);
    let pad_x = (YOLO_INPUT_SIZE as f32 - new_w as f32) / 2.0;
    let pad_y = (YOLO_INPUT_SIZE as f32 - new_h as f32) / 2.0;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(
        YOLO_INPUT_SIZE as u32,
        YOLO_INPUT_SIZE as u32,
        Rgb([YOLO_PAD_VALUE; 3]),
    );
    imageops::replace(
        &mut canvas,
        &resized,
        pad_x.floor() as i64,
        pad_y.floor() as i64,
    );

    let mut tensor = Array4::<f32>::zeros((1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Decode the flat YOLOv8 output tensor `[1, 4 + num_classes, anchors]`.
///
/// The layout is attribute-major: attribute `a` of anchor `i` lives at
/// `data[a * anchors + i]`. Boxes are center-format in letterboxed
/// pixel space and are mapped back to source coordinates here.
fn decode_predictions(
    data: &[f32],
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Result<Vec<Detection>, DetectorError> {
    let attrs = YOLO_BOX_ATTRS + PET_CLASSES.len();
    if data.is_empty() || data.len() % attrs != 0 {
        return Err(DetectorError::InferenceFailed(format!(
            "unexpected output length {} for {attrs} attributes",
            data.len()
        )));
    }
    let anchors = data.len() / attrs;

    let mut detections = Vec::new();

    for i in 0..anchors {
        // Best class for this anchor.
        let mut best_class = 0usize;
        let mut best_score = 0.0f32;
        for (c, _) in PET_CLASSES.iter().enumerate() {
            let score = data[(YOLO_BOX_ATTRS + c) * anchors + i];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if best_score <= threshold {
            continue;
        }

        let cx = data[i];
        let cy = data[anchors + i];
        let w = data[2 * anchors + i];
        let h = data[3 * anchors + i];

        // Map from letterboxed space to original frame space.
        let x1 = (cx - w / 2.0 - letterbox.pad_x) / letterbox.scale;
        let y1 = (cy - h / 2.0 - letterbox.pad_y) / letterbox.scale;

        detections.push(Detection {
            class: PET_CLASSES[best_class],
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: w / letterbox.scale,
                height: h / letterbox.scale,
                confidence: best_score,
            },
        });
    }

    // Body-class boxes are not usable for embedding extraction.
    detections.retain(|d| d.class.is_face());
    Ok(detections)
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.bbox
            .confidence
            .partial_cmp(&a.bbox.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let union_area = a.area() + b.area() - inter_area;
    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Pick the detection to use for a frame: highest confidence, breaking
/// ties toward the larger bounding-box area.
pub fn best_detection(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().reduce(|best, d| {
        match d
            .bbox
            .confidence
            .partial_cmp(&best.bbox.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
        {
            std::cmp::Ordering::Greater => d,
            std::cmp::Ordering::Equal if d.bbox.area() > best.bbox.area() => d,
            _ => best,
        }
    })
}

/// Crop a detected face from the source image, clamping the box to the
/// image bounds.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let (width, height) = image.dimensions();
    let x1 = bbox.x.max(0.0) as u32;
    let y1 = bbox.y.max(0.0) as u32;
    let x2 = ((bbox.x + bbox.width).max(0.0) as u32).min(width);
    let y2 = ((bbox.y + bbox.height).max(0.0) as u32).min(height);

    let w = x2.saturating_sub(x1).max(1);
    let h = y2.saturating_sub(y1).max(1);
    imageops::crop_imm(image, x1.min(width - 1), y1.min(height - 1), w, h).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: PetClass, x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            class,
            bbox: BoundingBox {
                x,
                y,
                width: w,
                height: h,
                confidence: conf,
            },
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = det(PetClass::DogFace, 0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a.bbox, &a.bbox) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = det(PetClass::DogFace, 0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(PetClass::DogFace, 20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a.bbox, &b.bbox).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = det(PetClass::DogFace, 0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(PetClass::DogFace, 5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        let expected = 50.0 / 150.0;
        assert!((iou(&a.bbox, &b.bbox) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            det(PetClass::DogFace, 0.0, 0.0, 100.0, 100.0, 0.9),
            det(PetClass::DogFace, 5.0, 5.0, 100.0, 100.0, 0.8),
            det(PetClass::CatFace, 200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.45);
        assert_eq!(result.len(), 2);
        assert!((result[0].bbox.confidence - 0.9).abs() < 1e-6);
        assert!((result[1].bbox.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.45).is_empty());
    }

    #[test]
    fn test_decode_keeps_only_face_classes() {
        // One anchor, 8 attributes. Box at center (320, 320), 100x100,
        // class scores: cat 0.9 (body — dropped), others below threshold.
        let letterbox = LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let data = [320.0, 320.0, 100.0, 100.0, 0.9, 0.1, 0.0, 0.0];
        let result = decode_predictions(&data, &letterbox, 0.5).unwrap();
        assert!(result.is_empty());

        // Same anchor, cat_face 0.9: kept.
        let data = [320.0, 320.0, 100.0, 100.0, 0.1, 0.9, 0.0, 0.0];
        let result = decode_predictions(&data, &letterbox, 0.5).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].class, PetClass::CatFace);
        assert!((result[0].bbox.x - 270.0).abs() < 1e-3);
        assert!((result[0].bbox.y - 270.0).abs() < 1e-3);
        assert!((result[0].bbox.width - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_maps_letterboxed_coordinates_back() {
        // A 1280x960 source letterboxed into 640: scale 0.5, pad_y 80.
        let letterbox = LetterboxInfo {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 80.0,
        };
        // Box center at letterboxed (320, 320) is source (640, 480).
        let data = [320.0, 320.0, 64.0, 64.0, 0.0, 0.95, 0.0, 0.0];
        let result = decode_predictions(&data, &letterbox, 0.5).unwrap();
        assert_eq!(result.len(), 1);
        let b = &result[0].bbox;
        assert!((b.x - (640.0 - 64.0)).abs() < 1e-3, "x = {}", b.x);
        assert!((b.y - (480.0 - 64.0)).abs() < 1e-3, "y = {}", b.y);
        assert!((b.width - 128.0).abs() < 1e-3);
        assert!((b.height - 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_rejects_malformed_output() {
        let letterbox = LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        // 7 values cannot be split into 8-attribute anchors.
        let data = [0.0; 7];
        assert!(decode_predictions(&data, &letterbox, 0.5).is_err());
    }

    #[test]
    fn test_best_detection_prefers_confidence() {
        let detections = vec![
            det(PetClass::DogFace, 0.0, 0.0, 10.0, 10.0, 0.7),
            det(PetClass::DogFace, 50.0, 50.0, 10.0, 10.0, 0.9),
        ];
        let best = best_detection(&detections).unwrap();
        assert!((best.bbox.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_best_detection_ties_break_on_area() {
        let detections = vec![
            det(PetClass::DogFace, 0.0, 0.0, 10.0, 10.0, 0.8),
            det(PetClass::CatFace, 50.0, 50.0, 30.0, 30.0, 0.8),
        ];
        let best = best_detection(&detections).unwrap();
        assert_eq!(best.class, PetClass::CatFace);
    }

    #[test]
    fn test_best_detection_empty() {
        assert!(best_detection(&[]).is_none());
    }

    #[test]
    fn test_preprocess_shape_and_letterbox() {
        let image = RgbImage::from_pixel(320, 240, Rgb([200, 100, 50]));
        let (tensor, letterbox) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert!((letterbox.pad_x - 0.0).abs() < 1e-6);
        assert!((letterbox.pad_y - 80.0).abs() < 1e-6);

        // Padding region carries the neutral gray, normalized.
        let pad_pixel = tensor[[0, 0, 0, 0]];
        assert!((pad_pixel - YOLO_PAD_VALUE as f32 / 255.0).abs() < 1e-6);

        // Image region carries the scaled pixel values.
        let center = tensor[[0, 0, 320, 320]];
        assert!((center - 200.0 / 255.0).abs() < 0.02);
    }

    #[test]
    fn test_crop_face_clamps_to_bounds() {
        let image = RgbImage::from_pixel(100, 100, Rgb([10, 20, 30]));
        let bbox = BoundingBox {
            x: -20.0,
            y: 80.0,
            width: 60.0,
            height: 60.0,
            confidence: 0.9,
        };
        let crop = crop_face(&image, &bbox);
        assert_eq!(crop.width(), 40);
        assert_eq!(crop.height(), 20);
    }

    #[test]
    fn test_crop_face_interior() {
        let image = RgbImage::from_fn(100, 100, |x, y| {
            if x >= 40 && x < 60 && y >= 40 && y < 60 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let bbox = BoundingBox {
            x: 40.0,
            y: 40.0,
            width: 20.0,
            height: 20.0,
            confidence: 0.9,
        };
        let crop = crop_face(&image, &bbox);
        assert_eq!(crop.dimensions(), (20, 20));
        assert_eq!(crop.get_pixel(0, 0)[0], 255);
    }
}
