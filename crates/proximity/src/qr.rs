// QR exchange fallback - versioned offer payload and QR image pipeline

use crate::error::{ProximityError, Result};
use crate::session::VerificationSession;
use chrono::{DateTime, Duration, TimeZone, Utc};
use image::{DynamicImage, Luma};
use qrcode::QrCode;
use serde::{Deserialize, Serialize};
use shared::Identity;
use uuid::Uuid;

/// Current wire format version
pub const QR_PROTOCOL_VERSION: u8 = 1;

/// Prefix of the text placed inside the QR symbol
pub const QR_TEXT_PREFIX: &str = "verify:";

const SESSION_ID_LEN: usize = 16;

/// Wire projection of a session offer
///
/// Timestamps are unix seconds so that `decode(encode(p)) == p` holds exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub protocol_version: u8,
    pub session_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl QrPayload {
    /// Build the offer for `session`, stamped at `issued_at` and valid for `ttl`
    pub fn offer(session: &VerificationSession, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        let identity = &session.local_identity;
        Self {
            protocol_version: QR_PROTOCOL_VERSION,
            session_id: session.session_id,
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            avatar_ref: identity.avatar_ref.clone(),
            issued_at: issued_at.timestamp(),
            expires_at: issued_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .timestamp(),
        }
    }

    /// Identity of the user who generated the offer
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
        }
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }

    /// Decode-time validity check, left to the scanning side
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if now.timestamp() >= self.expires_at {
            return Err(ProximityError::QrExpired);
        }
        Ok(())
    }

    /// Serialize to the binary wire format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(
            1 + SESSION_ID_LEN + 3 + self.user_id.len() + self.display_name.len() + 16,
        );

        buf.push(self.protocol_version);
        buf.extend_from_slice(self.session_id.as_bytes());
        write_str(&mut buf, "user_id", &self.user_id)?;
        write_str(&mut buf, "display_name", &self.display_name)?;
        match &self.avatar_ref {
            Some(avatar) => {
                buf.push(1);
                write_str(&mut buf, "avatar_ref", avatar)?;
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.issued_at.to_be_bytes());
        buf.extend_from_slice(&self.expires_at.to_be_bytes());

        Ok(buf)
    }

    /// Parse the binary wire format
    ///
    /// The version byte is checked before anything else is read.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        let protocol_version = reader.u8("protocol_version")?;
        if protocol_version != QR_PROTOCOL_VERSION {
            return Err(ProximityError::QrVersionMismatch {
                expected: QR_PROTOCOL_VERSION,
                found: protocol_version,
            });
        }

        let session_id = Uuid::from_slice(reader.take("session_id", SESSION_ID_LEN)?)
            .map_err(|e| ProximityError::QrDecode(format!("session_id: {}", e)))?;
        let user_id = reader.string("user_id")?;
        let display_name = reader.string("display_name")?;
        let avatar_ref = match reader.u8("avatar_flag")? {
            0 => None,
            1 => Some(reader.string("avatar_ref")?),
            other => {
                return Err(ProximityError::QrDecode(format!(
                    "invalid avatar flag {}",
                    other
                )))
            }
        };
        let issued_at = reader.i64("issued_at")?;
        let expires_at = reader.i64("expires_at")?;

        if !reader.is_empty() {
            return Err(ProximityError::QrDecode(format!(
                "{} trailing bytes",
                reader.remaining()
            )));
        }
        if user_id.is_empty() || display_name.is_empty() {
            return Err(ProximityError::QrDecode("empty identity field".to_string()));
        }
        if expires_at < issued_at {
            return Err(ProximityError::QrDecode(
                "expires_at precedes issued_at".to_string(),
            ));
        }

        Ok(Self {
            protocol_version,
            session_id,
            user_id,
            display_name,
            avatar_ref,
            issued_at,
            expires_at,
        })
    }

    /// Text form carried inside the QR symbol
    pub fn to_text(&self) -> Result<String> {
        let bytes = self.encode()?;
        Ok(format!("{}{}", QR_TEXT_PREFIX, bs58::encode(bytes).into_string()))
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let encoded = text
            .trim()
            .strip_prefix(QR_TEXT_PREFIX)
            .ok_or_else(|| ProximityError::QrDecode("missing verify: prefix".to_string()))?;

        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| ProximityError::QrDecode(format!("invalid base58: {}", e)))?;

        Self::decode(&bytes)
    }
}

fn write_str(buf: &mut Vec<u8>, field: &str, value: &str) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        ProximityError::InvalidInput(format!(
            "{} is {} bytes, at most 255 fit in a QR payload",
            field,
            value.len()
        ))
    })?;
    buf.push(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, field: &str, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(ProximityError::QrDecode(format!(
                "truncated payload reading {}",
                field
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.take(field, 1)?[0])
    }

    fn i64(&mut self, field: &str) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(field, 8)?);
        Ok(i64::from_be_bytes(raw))
    }

    fn string(&mut self, field: &str) -> Result<String> {
        let len = self.u8(field)? as usize;
        let raw = self.take(field, len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProximityError::QrDecode(format!("{} is not valid UTF-8", field)))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Renders offers into QR images and scans them back
pub struct QrCodeService;

impl QrCodeService {
    /// Render the payload as a QR code image
    pub fn render(payload: &QrPayload) -> Result<DynamicImage> {
        let text = payload.to_text()?;

        let qr = QrCode::new(text.as_bytes())
            .map_err(|e| ProximityError::QrCode(format!("Failed to generate QR code: {}", e)))?;
        let image = qr.render::<Luma<u8>>().build();

        Ok(DynamicImage::ImageLuma8(image))
    }

    /// Render the payload as PNG bytes
    pub fn render_png(payload: &QrPayload) -> Result<Vec<u8>> {
        let image = Self::render(payload)?;

        let mut png_bytes = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut png_bytes),
                image::ImageFormat::Png,
            )
            .map_err(|e| ProximityError::QrCode(format!("Failed to encode PNG: {}", e)))?;

        Ok(png_bytes)
    }

    /// Find a QR code in the image and decode the offer it carries
    ///
    /// Camera integration captures the frame and passes it here. Expiry is not
    /// checked; callers validate against their own clock.
    pub fn scan(image: &DynamicImage) -> Result<QrPayload> {
        let mut prepared = rqrr::PreparedImage::prepare(image.to_luma8());
        let grids = prepared.detect_grids();

        let grid = grids
            .first()
            .ok_or_else(|| ProximityError::QrCode("No QR code found in image".to_string()))?;

        let (_, content) = grid
            .decode()
            .map_err(|e| ProximityError::QrCode(format!("Failed to decode QR code: {:?}", e)))?;

        QrPayload::from_text(&content)
    }

    pub fn scan_png(png_bytes: &[u8]) -> Result<QrPayload> {
        let image = image::load_from_memory_with_format(png_bytes, image::ImageFormat::Png)
            .map_err(|e| ProximityError::QrCode(format!("Failed to load PNG: {}", e)))?;

        Self::scan(&image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    fn payload() -> QrPayload {
        QrPayload {
            protocol_version: QR_PROTOCOL_VERSION,
            session_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            display_name: "Alice".to_string(),
            avatar_ref: Some("https://cdn.example/alice.png".to_string()),
            issued_at: 1_700_000_000,
            expires_at: 1_700_000_120,
        }
    }

    #[test]
    fn test_encode_layout() {
        let mut p = payload();
        p.avatar_ref = None;
        let bytes = p.encode().unwrap();

        assert_eq!(bytes[0], QR_PROTOCOL_VERSION);
        assert_eq!(&bytes[1..17], p.session_id.as_bytes());
        assert_eq!(bytes[17], 6);
        assert_eq!(&bytes[18..24], b"user-1");
        assert_eq!(bytes[24], 5);
        assert_eq!(&bytes[25..30], b"Alice");
        assert_eq!(bytes[30], 0);
        assert_eq!(&bytes[31..39], &1_700_000_000i64.to_be_bytes());
        assert_eq!(&bytes[39..47], &1_700_000_120i64.to_be_bytes());
        assert_eq!(bytes.len(), 47);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let p = payload();
        assert_eq!(p.encode().unwrap(), p.encode().unwrap());
        assert_eq!(p.to_text().unwrap(), p.to_text().unwrap());
    }

    #[test]
    fn test_text_round_trip() {
        let p = payload();
        let text = p.to_text().unwrap();
        assert!(text.starts_with(QR_TEXT_PREFIX));
        assert_eq!(QrPayload::from_text(&text).unwrap(), p);
    }

    #[test]
    fn test_version_checked_first() {
        // Only the version byte is present
        match QrPayload::decode(&[7]) {
            Err(ProximityError::QrVersionMismatch { expected, found }) => {
                assert_eq!(expected, QR_PROTOCOL_VERSION);
                assert_eq!(found, 7);
            }
            other => panic!("Expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_and_trailing() {
        let bytes = payload().encode().unwrap();
        for cut in [1, 10, 20, bytes.len() - 1] {
            assert!(
                matches!(QrPayload::decode(&bytes[..cut]), Err(ProximityError::QrDecode(_))),
                "cut at {} accepted",
                cut
            );
        }

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(matches!(QrPayload::decode(&extended), Err(ProximityError::QrDecode(_))));
    }

    #[test]
    fn test_bad_avatar_flag() {
        let mut p = payload();
        p.avatar_ref = None;
        let mut bytes = p.encode().unwrap();
        bytes[30] = 2;
        assert!(matches!(QrPayload::decode(&bytes), Err(ProximityError::QrDecode(_))));
    }

    #[test]
    fn test_expires_before_issued_rejected() {
        let mut p = payload();
        p.expires_at = p.issued_at - 1;
        let bytes = p.encode().unwrap();
        assert!(matches!(QrPayload::decode(&bytes), Err(ProximityError::QrDecode(_))));
    }

    #[test]
    fn test_oversized_field_rejected_on_encode() {
        let mut p = payload();
        p.display_name = "x".repeat(256);
        assert!(matches!(p.encode(), Err(ProximityError::InvalidInput(_))));
    }

    #[test]
    fn test_from_text_requires_prefix() {
        assert!(matches!(
            QrPayload::from_text("hello"),
            Err(ProximityError::QrDecode(_))
        ));
        assert!(matches!(
            QrPayload::from_text("verify:0OIl"),
            Err(ProximityError::QrDecode(_))
        ));
    }

    #[test]
    fn test_validate_expiry_boundary() {
        let p = payload();
        let before = Utc.timestamp_opt(p.expires_at - 1, 0).unwrap();
        let at = Utc.timestamp_opt(p.expires_at, 0).unwrap();
        assert!(p.validate(before).is_ok());
        assert_eq!(p.validate(at), Err(ProximityError::QrExpired));
    }

    #[test]
    fn test_offer_from_session() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let session = VerificationSession::new(
            Identity::new("user-1", "Alice"),
            Transport::Wireless,
            now,
            Duration::seconds(120),
        );
        let offer = QrPayload::offer(&session, now, Duration::seconds(60));

        assert_eq!(offer.session_id, session.session_id);
        assert_eq!(offer.identity(), session.local_identity);
        assert_eq!(offer.expires_at - offer.issued_at, 60);
        assert_eq!(offer.expires_at_utc(), Some(now + Duration::seconds(60)));
    }

    #[test]
    fn test_render_and_scan() {
        let p = payload();
        let image = QrCodeService::render(&p).unwrap();
        assert!(image.width() > 0);

        let scanned = QrCodeService::scan(&image).unwrap();
        assert_eq!(scanned, p);
    }

    #[test]
    fn test_scan_blank_image() {
        let blank = DynamicImage::new_luma8(64, 64);
        assert!(matches!(
            QrCodeService::scan(&blank),
            Err(ProximityError::QrCode(_))
        ));
    }
}
