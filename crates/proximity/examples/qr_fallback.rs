// Two devices without wireless discovery verify each other by QR code
//
// Run with: cargo run -p proximity --example qr_fallback

use anyhow::Result;
use proximity::testing::{FakeDiscoveryProvider, RecordingObserver};
use proximity::{
    ConnectionFinalizer, Identity, InMemoryConnectionStore, NoRanging, QrCodeService, ScanStatus,
    VerificationConfig, VerificationStateMachine,
};
use shared::logging::init_logging_pretty;
use std::sync::Arc;
use tracing::info;

fn device(config: &VerificationConfig, store: Arc<InMemoryConnectionStore>) -> Result<VerificationStateMachine> {
    let machine = VerificationStateMachine::spawn(
        config.clone(),
        Arc::new(FakeDiscoveryProvider::unavailable("local network permission denied")),
        Arc::new(NoRanging),
        Arc::new(ConnectionFinalizer::new(store)),
        Some(Arc::new(RecordingObserver::new())),
    )?;
    Ok(machine)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging_pretty();

    let config = VerificationConfig::from_env()?;
    let store = Arc::new(InMemoryConnectionStore::new());

    let alice = device(&config, store.clone())?;
    let bob = device(&config, store.clone())?;
    alice.configure(Identity::new("user-alice", "Alice")).await?;
    bob.configure(Identity::new("user-bob", "Bob")).await?;

    if let ScanStatus::QrOnly { reason } = alice.start_scanning().await? {
        info!(reason = %reason, "Alice falls back to QR");
    }

    let offer = alice.generate_qr_data().await?;
    let png = QrCodeService::render_png(&offer)?;
    info!(bytes = png.len(), expires_at = ?offer.expires_at_utc(), "Alice shows her code");

    let scanned = QrCodeService::scan_png(&png)?;
    let result = bob.process_scanned_qr(scanned.to_text()?).await?;
    info!(peer = %result.peer_identity.display_name, method = %result.method, "Bob verified");

    let connection = bob.finalize_verification().await?;
    info!(connection_id = %connection.id, "Connection saved");

    alice.shutdown().await?;
    bob.shutdown().await?;

    info!(saved = store.len().await, "Done");
    Ok(())
}
