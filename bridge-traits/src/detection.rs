//! Detection Service Abstraction
//!
//! Remote image-analysis service returning face bounding boxes and embeddings.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Liveness report from the detection service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "healthy")
    }
}

/// Bounding box in pixel coordinates of the submitted image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub faces: Vec<DetectedFace>,
}

/// Detection service client.
#[async_trait]
pub trait DetectionClient: Send + Sync {
    /// Liveness probe.
    async fn health(&self) -> Result<HealthStatus>;

    /// Submit image bytes for analysis.
    async fn extract(&self, image: Bytes, mime_type: &str) -> Result<ExtractionResult>;
}
