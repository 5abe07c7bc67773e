// Ranging - pluggable distance measurement and the co-presence decision rule

use crate::{Confidence, PeerId, RangingSample, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Platform ranging capability (UWB, BLE RSSI, ...)
///
/// The state machine owns at most one ranging subscription at a time and calls
/// `stop()` before starting another or tearing the session down.
#[async_trait]
pub trait RangingProvider: Send + Sync {
    /// Whether distance can be measured to this peer on this device pair
    async fn is_available(&self, peer_id: &PeerId) -> bool;

    /// Begin ranging; samples arrive on the returned channel until `stop()`
    ///
    /// Fails with `RangingUnavailable` when the capability disappeared after
    /// the availability check.
    async fn start(&self, peer_id: &PeerId) -> Result<mpsc::Receiver<RangingSample>>;

    fn stop(&self);

    fn name(&self) -> &str;
}

/// Provider for devices without any ranging hardware
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRanging;

#[async_trait]
impl RangingProvider for NoRanging {
    async fn is_available(&self, _peer_id: &PeerId) -> bool {
        false
    }

    async fn start(&self, _peer_id: &PeerId) -> Result<mpsc::Receiver<RangingSample>> {
        Err(crate::ProximityError::RangingUnavailable(
            "no ranging hardware".to_string(),
        ))
    }

    fn stop(&self) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// Rolling window over the most recent samples
///
/// Co-presence is confirmed only when every sample in a full window is below
/// the threshold with at least medium confidence. A non-qualifying sample
/// blocks confirmation until it has been pushed out of the window.
#[derive(Debug, Clone)]
pub struct RangingWindow {
    size: usize,
    threshold_meters: f64,
    samples: VecDeque<RangingSample>,
}

impl RangingWindow {
    pub fn new(size: usize, threshold_meters: f64) -> Self {
        let size = size.max(1);
        Self {
            size,
            threshold_meters,
            samples: VecDeque::with_capacity(size),
        }
    }

    pub fn qualifies(&self, sample: &RangingSample) -> bool {
        sample.confidence >= Confidence::Medium
            && sample.distance_meters >= 0.0
            && sample.distance_meters < self.threshold_meters
    }

    /// Add a sample; returns the mean distance once the window is satisfied
    pub fn push(&mut self, sample: RangingSample) -> Option<f64> {
        if self.samples.len() == self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        if self.samples.len() < self.size || !self.samples.iter().all(|s| self.qualifies(s)) {
            return None;
        }

        let total: f64 = self.samples.iter().map(|s| s.distance_meters).sum();
        Some(total / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
