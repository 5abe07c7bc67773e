use crate::ranging::RangingProvider;
use crate::{Confidence, PeerId, ProximityError, RangingSample, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Measured RSSI at 1 m for a typical phone beacon
pub const DEFAULT_TX_POWER_DBM: i16 = -59;

/// Free-space path loss exponent
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const RSSI_HISTORY: usize = 5;
const SAMPLE_CHANNEL_CAPACITY: usize = 32;

/// Log-distance path loss model used to turn RSSI into metres
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RssiModel {
    pub tx_power_dbm: i16,
    pub path_loss_exponent: f64,
}

impl Default for RssiModel {
    fn default() -> Self {
        Self {
            tx_power_dbm: DEFAULT_TX_POWER_DBM,
            path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
        }
    }
}

impl RssiModel {
    pub fn distance_meters(&self, rssi: i16) -> f64 {
        let exponent = f64::from(self.tx_power_dbm - rssi) / (10.0 * self.path_loss_exponent);
        10f64.powf(exponent)
    }
}

/// Grade confidence from how much the recent readings disagree
pub fn confidence_from_spread(readings: &[i16]) -> Confidence {
    if readings.len() < 2 {
        return Confidence::Low;
    }

    let max = readings.iter().copied().max().unwrap_or_default();
    let min = readings.iter().copied().min().unwrap_or_default();
    match max - min {
        0..=3 => Confidence::High,
        4..=6 => Confidence::Medium,
        _ => Confidence::Low,
    }
}

/// The part of a BLE central needed to switch scanning off
#[async_trait]
trait ScanControl: Clone + Send + Sync + 'static {
    async fn stop_scan(&self) -> std::result::Result<(), String>;
}

#[async_trait]
impl ScanControl for Adapter {
    async fn stop_scan(&self) -> std::result::Result<(), String> {
        Central::stop_scan(self).await.map_err(|e| e.to_string())
    }
}

/// Tracks which scan currently owns the radio
///
/// Every scan start takes a new generation. A release only stops the scan
/// while its generation is still current, so a late release from an old
/// session never switches off a newer scan.
#[derive(Clone)]
struct ScanLeases<S: ScanControl> {
    scanner: S,
    generation: Arc<AtomicU64>,
}

impl<S: ScanControl> ScanLeases<S> {
    fn new(scanner: S) -> Self {
        Self {
            scanner,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn acquire(&self) -> ScanGuard<S> {
        let held = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        ScanGuard {
            leases: self.clone(),
            held,
            armed: true,
        }
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn release(&self, held: u64) {
        if self.current() != held {
            debug!(held, "BLE scan already taken over, leaving it running");
            return;
        }
        if let Err(e) = self.scanner.stop_scan().await {
            debug!("Failed to stop BLE scan: {}", e);
        }
    }

    /// Release from a synchronous context; needs a running tokio runtime
    fn release_later(&self, held: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to stop BLE scan on");
            return;
        };
        let leases = self.clone();
        handle.spawn(async move { leases.release(held).await });
    }
}

/// Stops the scan it was acquired for unless disarmed, including when the
/// owning future is dropped mid-await
struct ScanGuard<S: ScanControl> {
    leases: ScanLeases<S>,
    held: u64,
    armed: bool,
}

impl<S: ScanControl> ScanGuard<S> {
    /// Hand the scan over to a longer-lived owner
    fn disarm(mut self) -> u64 {
        self.armed = false;
        self.held
    }

    async fn release(mut self) {
        self.armed = false;
        self.leases.release(self.held).await;
    }
}

impl<S: ScanControl> Drop for ScanGuard<S> {
    fn drop(&mut self) {
        if self.armed {
            self.leases.release_later(self.held);
        }
    }
}

/// RSSI-based ranging against a peer's BLE beacon
///
/// btleplug only supports the central role, so each peer has to be bound to
/// the local name its device advertises before ranging can start.
pub struct BleRangingProvider {
    adapter: Adapter,
    model: RssiModel,
    poll_interval: Duration,
    beacons: DashMap<PeerId, String>,
    active: Mutex<Option<CancellationToken>>,
    scans: ScanLeases<Adapter>,
}

impl BleRangingProvider {
    /// Create a provider on the first BLE adapter
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| {
            ProximityError::BleError(format!("Failed to create BLE manager: {}", e))
        })?;

        let adapters = manager.adapters().await.map_err(|e| {
            ProximityError::BleError(format!("Failed to get BLE adapters: {}", e))
        })?;

        let adapter = adapters.into_iter().next().ok_or_else(|| {
            ProximityError::BleError("No BLE adapter found".to_string())
        })?;

        Ok(Self {
            scans: ScanLeases::new(adapter.clone()),
            adapter,
            model: RssiModel::default(),
            poll_interval: POLL_INTERVAL,
            beacons: DashMap::new(),
            active: Mutex::new(None),
        })
    }

    pub fn with_model(mut self, model: RssiModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Associate a discovery peer with the BLE local name it advertises
    pub fn bind_beacon(&self, peer_id: impl Into<PeerId>, local_name: impl Into<String>) {
        self.beacons.insert(peer_id.into(), local_name.into());
    }

    pub fn unbind_beacon(&self, peer_id: &PeerId) {
        self.beacons.remove(peer_id);
    }

    fn beacon_name(&self, peer_id: &PeerId) -> Option<String> {
        self.beacons.get(peer_id).map(|name| name.value().clone())
    }

    /// Find the advertising peripheral and its current RSSI
    async fn find_peripheral(adapter: &Adapter, local_name: &str) -> Result<Option<(Peripheral, i16)>> {
        let peripherals = adapter.peripherals().await.map_err(|e| {
            ProximityError::BleError(format!("Failed to get peripherals: {}", e))
        })?;

        for peripheral in peripherals {
            let properties = match peripheral.properties().await {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Error reading peripheral properties: {}", e);
                    continue;
                }
            };

            if properties.local_name.as_deref() == Some(local_name) {
                if let Some(rssi) = properties.rssi {
                    return Ok(Some((peripheral, rssi)));
                }
            }
        }

        Ok(None)
    }

    async fn start_scan(&self) -> Result<ScanGuard<Adapter>> {
        let guard = self.scans.acquire();
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ProximityError::BleError(format!("Failed to start BLE scan: {}", e)))?;
        Ok(guard)
    }

    fn replace_active(&self, token: Option<CancellationToken>) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = std::mem::replace(&mut *active, token) {
            previous.cancel();
        }
    }
}

#[async_trait]
impl RangingProvider for BleRangingProvider {
    async fn is_available(&self, peer_id: &PeerId) -> bool {
        let Some(local_name) = self.beacon_name(peer_id) else {
            debug!("No beacon bound for peer {}", peer_id);
            return false;
        };

        let scan = match self.start_scan().await {
            Ok(scan) => scan,
            Err(e) => {
                warn!("BLE ranging unavailable: {}", e);
                return false;
            }
        };

        let found = Self::find_peripheral(&self.adapter, &local_name).await;
        scan.release().await;

        match found {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!("BLE ranging unavailable: {}", e);
                false
            }
        }
    }

    async fn start(&self, peer_id: &PeerId) -> Result<mpsc::Receiver<RangingSample>> {
        let local_name = self.beacon_name(peer_id).ok_or_else(|| {
            ProximityError::RangingUnavailable(format!("No beacon bound for peer {}", peer_id))
        })?;

        let scan = self.start_scan().await?;
        let (peripheral, first_rssi) = match Self::find_peripheral(&self.adapter, &local_name).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                scan.release().await;
                return Err(ProximityError::RangingUnavailable(format!(
                    "Beacon {} not visible",
                    local_name
                )));
            }
            Err(e) => {
                scan.release().await;
                return Err(e);
            }
        };
        let held = scan.disarm();

        let token = CancellationToken::new();
        self.replace_active(Some(token.clone()));

        let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let scans = self.scans.clone();
        let model = self.model;
        let poll_interval = self.poll_interval;

        info!("Starting BLE ranging against beacon {}", local_name);
        tokio::spawn(async move {
            let mut history: VecDeque<i16> = VecDeque::with_capacity(RSSI_HISTORY);
            history.push_back(first_rssi);
            let mut ticker = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let rssi = match peripheral.properties().await {
                    Ok(Some(properties)) => properties.rssi,
                    Ok(None) => None,
                    Err(e) => {
                        debug!("Error reading beacon RSSI: {}", e);
                        None
                    }
                };
                let Some(rssi) = rssi else {
                    continue;
                };

                if history.len() == RSSI_HISTORY {
                    history.pop_front();
                }
                history.push_back(rssi);

                let readings: Vec<i16> = history.iter().copied().collect();
                let sample = RangingSample::new(model.distance_meters(rssi), confidence_from_spread(&readings));
                debug!(rssi, distance = sample.distance_meters, "BLE ranging sample");

                if tx.send(sample).await.is_err() {
                    break;
                }
            }

            scans.release(held).await;
            info!("BLE ranging stopped");
        });

        Ok(rx)
    }

    fn stop(&self) {
        self.replace_active(None);
        // Covers scans left behind by a start that never spawned a poll task
        self.scans.release_later(self.scans.current());
    }

    fn name(&self) -> &str {
        "ble-rssi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_at_tx_power_is_one_meter() {
        let model = RssiModel::default();
        assert!((model.distance_meters(DEFAULT_TX_POWER_DBM) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_distance_grows_with_weaker_signal() {
        let model = RssiModel::default();
        // 20 dB weaker with exponent 2 is ten times farther
        assert!((model.distance_meters(-79) - 10.0).abs() < 1e-9);
        // Stronger than the reference means closer than a metre
        assert!(model.distance_meters(-50) < 0.5);
    }

    #[derive(Clone, Default)]
    struct CountingScanner {
        stops: Arc<AtomicU64>,
    }

    #[async_trait]
    impl ScanControl for CountingScanner {
        async fn stop_scan(&self) -> std::result::Result<(), String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl CountingScanner {
        fn stops(&self) -> u64 {
            self.stops.load(Ordering::SeqCst)
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_released_scan_is_stopped() {
        let scanner = CountingScanner::default();
        let leases = ScanLeases::new(scanner.clone());

        leases.acquire().release().await;
        assert_eq!(scanner.stops(), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_stops_scan() {
        let scanner = CountingScanner::default();
        let leases = ScanLeases::new(scanner.clone());

        let scan = leases.acquire();
        drop(scan);
        settle().await;
        assert_eq!(scanner.stops(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_start_stops_scan() {
        let scanner = CountingScanner::default();
        let leases = ScanLeases::new(scanner.clone());

        let task = {
            let leases = leases.clone();
            tokio::spawn(async move {
                let _scan = leases.acquire();
                std::future::pending::<()>().await;
            })
        };
        settle().await;
        task.abort();
        let _ = task.await;
        settle().await;

        assert_eq!(scanner.stops(), 1);
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_scan_running() {
        let scanner = CountingScanner::default();
        let leases = ScanLeases::new(scanner.clone());

        let held = leases.acquire().disarm();
        settle().await;
        assert_eq!(scanner.stops(), 0);

        leases.release(held).await;
        assert_eq!(scanner.stops(), 1);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_scan() {
        let scanner = CountingScanner::default();
        let leases = ScanLeases::new(scanner.clone());

        let old = leases.acquire().disarm();
        let newer = leases.acquire();

        leases.release(old).await;
        assert_eq!(scanner.stops(), 0);

        newer.release().await;
        assert_eq!(scanner.stops(), 1);
    }

    #[tokio::test]
    async fn test_release_later_stops_current_scan() {
        let scanner = CountingScanner::default();
        let leases = ScanLeases::new(scanner.clone());

        let _held = leases.acquire().disarm();
        leases.release_later(leases.current());
        settle().await;
        assert_eq!(scanner.stops(), 1);
    }

    #[test]
    fn test_confidence_from_spread() {
        assert_eq!(confidence_from_spread(&[]), Confidence::Low);
        assert_eq!(confidence_from_spread(&[-50]), Confidence::Low);
        assert_eq!(confidence_from_spread(&[-50, -52, -53]), Confidence::High);
        assert_eq!(confidence_from_spread(&[-50, -56]), Confidence::Medium);
        assert_eq!(confidence_from_spread(&[-50, -60, -55]), Confidence::Low);
    }
}
