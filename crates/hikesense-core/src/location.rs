//! Best-effort current position.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::GeoPoint;

/// Source of the hiker's current position.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current position, or `None` when no fix is available.
    async fn current_position(&self) -> Option<GeoPoint>;
}

/// Position most recently reported by the UI.
#[derive(Debug, Default)]
pub struct ReportedLocation {
    latest: RwLock<Option<GeoPoint>>,
}

impl ReportedLocation {
    /// Start with no fix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new fix.
    pub async fn update(&self, point: GeoPoint) {
        *self.latest.write().await = Some(point);
    }

    /// Forget the last fix.
    pub async fn clear(&self) {
        *self.latest.write().await = None;
    }
}

#[async_trait]
impl LocationProvider for ReportedLocation {
    async fn current_position(&self) -> Option<GeoPoint> {
        *self.latest.read().await
    }
}

/// A provider that always answers with the same value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocation(pub Option<GeoPoint>);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_position(&self) -> Option<GeoPoint> {
        self.0
    }
}
