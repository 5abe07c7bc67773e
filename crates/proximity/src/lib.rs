pub mod types;
pub mod error;
pub mod session;
pub mod discovery;
pub mod ranging;
pub mod qr;
pub mod machine;
pub mod verifier;
pub mod finalizer;
pub mod handshake;
pub mod mdns;
pub mod ble;
pub mod testing;

pub use types::*;
pub use error::{ErrorCategory, ErrorContext, ErrorReason, ProximityError, Result};
pub use session::VerificationSession;
pub use discovery::{DiscoveryEvent, PeerDiscoveryProvider};
pub use ranging::{NoRanging, RangingProvider, RangingWindow};
pub use qr::{QrCodeService, QrPayload, QR_PROTOCOL_VERSION, QR_TEXT_PREFIX};
pub use machine::{Action, DiscoveryStatus, Event, ScanStatus, TaggedEvent, TimerId, TimerKind, VerificationCore};
pub use verifier::{VerificationObserver, VerificationStateMachine};
pub use finalizer::{ConnectionFinalizer, ConnectionStore, InMemoryConnectionStore};
pub use mdns::MdnsDiscoveryProvider;
pub use ble::{BleRangingProvider, RssiModel};

pub use shared::{Connection, Identity, VerificationConfig, VerificationMethod};
