use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Longest accepted QR offer lifetime (one day)
pub const MAX_QR_OFFER_TTL_SECS: u64 = 86_400;

/// Longest accepted discovery, ranging or connect timeout
pub const MAX_TIMEOUT_SECS: u64 = 3_600;

pub const MAX_RANGING_WINDOW_SIZE: usize = 64;

/// Policy knobs for the proximity verification protocol
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VerificationConfig {
    /// How long to browse for peers before giving up (default: 30)
    pub discovery_timeout_secs: u64,
    /// How long `Measuring` may run without a qualifying window (default: 20)
    pub ranging_timeout_secs: u64,
    /// Co-presence distance in metres (default: 0.5)
    pub proximity_threshold_meters: f64,
    /// Number of consecutive samples that must qualify (default: 3)
    pub ranging_window_size: usize,
    /// Lifetime of a QR offer and of a QR-only session (default: 120)
    pub qr_offer_ttl_secs: u64,
    /// Cap on the nearby peer list (default: 50)
    pub max_nearby_peers: usize,
    /// Upper bound on `Connecting` (default: 10)
    pub connect_timeout_secs: u64,
    /// Persist automatically on entering `Verified` (default: false)
    pub auto_finalize: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 30,
            ranging_timeout_secs: 20,
            proximity_threshold_meters: 0.5,
            ranging_window_size: 3,
            qr_offer_ttl_secs: 120,
            max_nearby_peers: 50,
            connect_timeout_secs: 10,
            auto_finalize: false,
        }
    }
}

impl VerificationConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = VerificationConfig {
            discovery_timeout_secs: env::var("VERIFY_DISCOVERY_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.discovery_timeout_secs.to_string())
                .parse()?,
            ranging_timeout_secs: env::var("VERIFY_RANGING_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.ranging_timeout_secs.to_string())
                .parse()?,
            proximity_threshold_meters: env::var("VERIFY_PROXIMITY_THRESHOLD_METERS")
                .unwrap_or_else(|_| defaults.proximity_threshold_meters.to_string())
                .parse()?,
            ranging_window_size: env::var("VERIFY_RANGING_WINDOW_SIZE")
                .unwrap_or_else(|_| defaults.ranging_window_size.to_string())
                .parse()?,
            qr_offer_ttl_secs: env::var("VERIFY_QR_OFFER_TTL_SECS")
                .unwrap_or_else(|_| defaults.qr_offer_ttl_secs.to_string())
                .parse()?,
            max_nearby_peers: env::var("VERIFY_MAX_NEARBY_PEERS")
                .unwrap_or_else(|_| defaults.max_nearby_peers.to_string())
                .parse()?,
            connect_timeout_secs: env::var("VERIFY_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.connect_timeout_secs.to_string())
                .parse()?,
            auto_finalize: env::var("VERIFY_AUTO_FINALIZE")
                .unwrap_or_else(|_| defaults.auto_finalize.to_string())
                .parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.ranging_window_size == 0 || self.ranging_window_size > MAX_RANGING_WINDOW_SIZE {
            return Err(crate::Error::Config(format!(
                "ranging_window_size must be between 1 and {}, got {}",
                MAX_RANGING_WINDOW_SIZE, self.ranging_window_size
            )));
        }
        if !(self.proximity_threshold_meters > 0.0) {
            return Err(crate::Error::Config(format!(
                "proximity_threshold_meters must be positive, got {}",
                self.proximity_threshold_meters
            )));
        }

        let timeouts = [
            ("discovery_timeout_secs", self.discovery_timeout_secs, MAX_TIMEOUT_SECS),
            ("ranging_timeout_secs", self.ranging_timeout_secs, MAX_TIMEOUT_SECS),
            ("qr_offer_ttl_secs", self.qr_offer_ttl_secs, MAX_QR_OFFER_TTL_SECS),
            ("connect_timeout_secs", self.connect_timeout_secs, MAX_TIMEOUT_SECS),
        ];
        for (name, value, max) in timeouts {
            if value == 0 {
                return Err(crate::Error::Config(format!("{} must be non-zero", name)));
            }
            if value > max {
                return Err(crate::Error::Config(format!(
                    "{} must be at most {}, got {}",
                    name, max, value
                )));
            }
        }

        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn ranging_timeout(&self) -> Duration {
        Duration::from_secs(self.ranging_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn qr_offer_ttl(&self) -> Duration {
        Duration::from_secs(self.qr_offer_ttl_secs)
    }

    /// Offer lifetime as a chrono duration, saturating at the accepted maximum
    pub fn qr_offer_ttl_chrono(&self) -> chrono::Duration {
        let secs = self.qr_offer_ttl_secs.min(MAX_QR_OFFER_TTL_SECS) as i64;
        chrono::Duration::try_seconds(secs).unwrap_or_else(chrono::Duration::zero)
    }
}
