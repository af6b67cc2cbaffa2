use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One detection returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Present only for tracked video frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassCount {
    pub count: u32,
    pub class_id: u32,
}

/// Per-label counts, ordered by label for stable output.
pub type DetectionSummary = BTreeMap<String, ClassCount>;

/// Result of the detect stage, consumed by publish to choose its branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DetectOutcome {
    Detected {
        summary: DetectionSummary,
        output_path: PathBuf,
    },
    Empty,
}

impl DetectOutcome {
    pub fn from_summary(summary: DetectionSummary, output_path: PathBuf) -> Self {
        if summary.is_empty() {
            DetectOutcome::Empty
        } else {
            DetectOutcome::Detected {
                summary,
                output_path,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DetectOutcome::Empty)
    }
}

/// Counts every box once, for single images.
pub fn count_boxes<F>(detections: &[Detection], label: F) -> DetectionSummary
where
    F: Fn(u32) -> String,
{
    let mut summary = DetectionSummary::new();
    for det in detections {
        summary
            .entry(label(det.class_id))
            .or_insert(ClassCount {
                count: 0,
                class_id: det.class_id,
            })
            .count += 1;
    }
    summary
}

/// Accumulates unique tracks per class across video frames.
///
/// A tracked object crossing many frames is counted once; detections
/// without a track id are ignored.
#[derive(Debug, Default)]
pub struct TrackCounter {
    seen: HashMap<String, HashSet<u64>>,
    summary: DetectionSummary,
}

impl TrackCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the track had not been seen for this class yet.
    pub fn observe(&mut self, label: &str, class_id: u32, track_id: Option<u64>) -> bool {
        let Some(track_id) = track_id else {
            return false;
        };
        let fresh = self
            .seen
            .entry(label.to_string())
            .or_default()
            .insert(track_id);
        if fresh {
            let entry = self.summary.entry(label.to_string()).or_insert(ClassCount {
                count: 0,
                class_id,
            });
            entry.count += 1;
            entry.class_id = class_id;
        }
        fresh
    }

    pub fn summary(&self) -> &DetectionSummary {
        &self.summary
    }

    pub fn into_summary(self) -> DetectionSummary {
        self.summary
    }
}
