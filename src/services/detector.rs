use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageFormat, RgbImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::detection::Detection;
use crate::models::job::ClassFilter;

/// COCO class names (80 classes), the default label table.
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck",
    "boat", "traffic light", "fire hydrant", "stop sign", "parking meter", "bench",
    "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra",
    "giraffe", "backpack", "umbrella", "handbag", "tie", "suitcase", "frisbee",
    "skis", "snowboard", "sports ball", "kite", "baseball bat", "baseball glove",
    "skateboard", "surfboard", "tennis racket", "bottle", "wine glass", "cup",
    "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

/// Label for a COCO class id, falling back to `class_<id>`.
pub fn coco_label(class_id: u32) -> String {
    COCO_CLASSES
        .get(class_id as usize)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("class_{class_id}"))
}

/// Tracker state that must be reused across the frames of one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSession {
    pub id: String,
    pub frame_index: u64,
}

impl TrackSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            frame_index: 0,
        }
    }
}

/// Object detection/tracking model.
///
/// One instance is created per process and shared by every detect stage.
/// It is read-only after construction: `infer` and `track` calls are
/// independent, and per-video state lives in the caller's [`TrackSession`].
#[async_trait]
pub trait Detector: Send + Sync {
    fn class_name(&self, class_id: u32) -> String;

    async fn infer(
        &self,
        image: &RgbImage,
        class_filter: Option<&ClassFilter>,
    ) -> Result<Vec<Detection>, DetectorError>;

    async fn track(
        &self,
        frame: &RgbImage,
        class_filter: Option<&ClassFilter>,
        session: &mut TrackSession,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Client for a YOLO-style inference server.
pub struct HttpDetector {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
struct InferRequest<'a> {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    classes: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_index: Option<u64>,
}

#[derive(Deserialize)]
struct InferResponse {
    detections: Vec<Detection>,
}

impl HttpDetector {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, path: &str, request: &InferRequest<'_>) -> Result<Vec<Detection>, DetectorError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(DetectorError::Http)?
            .error_for_status()
            .map_err(DetectorError::Http)?;

        let body: InferResponse = response.json().await.map_err(DetectorError::Http)?;
        Ok(body.detections)
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<String, DetectorError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(DetectorError::Encode)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

fn filter_vec(filter: Option<&ClassFilter>) -> Option<Vec<u32>> {
    filter.map(|f| f.iter().copied().collect())
}

#[async_trait]
impl Detector for HttpDetector {
    fn class_name(&self, class_id: u32) -> String {
        coco_label(class_id)
    }

    async fn infer(
        &self,
        image: &RgbImage,
        class_filter: Option<&ClassFilter>,
    ) -> Result<Vec<Detection>, DetectorError> {
        let request = InferRequest {
            image: encode_jpeg(image)?,
            classes: filter_vec(class_filter),
            session: None,
            frame_index: None,
        };
        self.call("infer", &request).await
    }

    async fn track(
        &self,
        frame: &RgbImage,
        class_filter: Option<&ClassFilter>,
        session: &mut TrackSession,
    ) -> Result<Vec<Detection>, DetectorError> {
        let request = InferRequest {
            image: encode_jpeg(frame)?,
            classes: filter_vec(class_filter),
            session: Some(&session.id),
            frame_index: Some(session.frame_index),
        };
        let detections = self.call("track", &request).await?;
        session.frame_index += 1;
        Ok(detections)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_labels() {
        assert_eq!(coco_label(0), "person");
        assert_eq!(coco_label(2), "car");
        assert_eq!(coco_label(500), "class_500");
    }

    #[test]
    fn test_request_omits_absent_fields() {
        let request = InferRequest {
            image: "abc".to_string(),
            classes: None,
            session: None,
            frame_index: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, serde_json::json!({ "image": "abc" }));
    }

    #[test]
    fn test_encode_jpeg_produces_base64() {
        let image = RgbImage::new(4, 4);
        let encoded = encode_jpeg(&image).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
