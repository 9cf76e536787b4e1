//! Pairing token scheme and its scannable console rendering.
//!
//! Tokens follow the edgevpn connection-data layout: a base64 document
//! carrying the one-time-password seeds for DHT discovery and payload
//! encryption, plus the room, rendezvous and mDNS identifiers.

use crate::credentials::PairingToken;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use qrcode::QrCode;
use qrcode::render::unicode;
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const OTP_KEY_LENGTH: usize = 43;
const OTP_INTERVAL_SECS: u64 = 9000;
const MAX_MESSAGE_SIZE: u64 = 20 << 20;

pub trait PairingTokenSource: Send + Sync {
    fn generate(&self) -> PairingToken;
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("token too large for a scannable code: {0}")]
    Encode(#[from] qrcode::types::QrError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpSeed {
    pub interval: u64,
    pub key: String,
    pub length: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpSettings {
    pub dht: OtpSeed,
    pub crypto: OtpSeed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub otp: OtpSettings,
    pub room: String,
    pub rendezvous: String,
    pub mdns: String,
    pub max_message_size: u64,
}

impl ConnectionData {
    pub fn random() -> Self {
        Self {
            otp: OtpSettings {
                dht: OtpSeed::random(),
                crypto: OtpSeed::random(),
            },
            room: random_letters(OTP_KEY_LENGTH),
            rendezvous: random_letters(OTP_KEY_LENGTH),
            mdns: random_letters(OTP_KEY_LENGTH),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn encode(&self) -> PairingToken {
        // serde_json cannot fail on this plain struct; JSON is also valid YAML
        // for engines that decode the token as YAML.
        let document = serde_json::to_vec(self).unwrap_or_default();
        PairingToken::new(STANDARD.encode(document))
    }

    pub fn decode(token: &PairingToken) -> Option<Self> {
        let bytes = STANDARD.decode(token.as_str()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

impl OtpSeed {
    fn random() -> Self {
        Self {
            interval: OTP_INTERVAL_SECS,
            key: random_letters(OTP_KEY_LENGTH),
            length: OTP_KEY_LENGTH,
        }
    }
}

/// Generates fresh edgevpn-style connection data for every call.
#[derive(Clone, Copy, Debug, Default)]
pub struct EdgeTokenSource;

impl PairingTokenSource for EdgeTokenSource {
    fn generate(&self) -> PairingToken {
        ConnectionData::random().encode()
    }
}

/// Renders the token as a QR code drawn with Unicode half blocks.
pub fn render_scannable(token: &PairingToken) -> Result<String, RenderError> {
    let code = QrCode::new(token.as_str().as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

fn random_letters(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_decode_to_connection_data() {
        let token = EdgeTokenSource.generate();
        let data = ConnectionData::decode(&token).expect("decodable token");
        assert_eq!(data.otp.dht.length, OTP_KEY_LENGTH);
        assert_eq!(data.otp.dht.key.len(), OTP_KEY_LENGTH);
        assert_eq!(data.otp.crypto.interval, OTP_INTERVAL_SECS);
        assert_eq!(data.max_message_size, 20 * 1024 * 1024);
        assert!(data.room.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn every_token_is_fresh() {
        let first = EdgeTokenSource.generate();
        let second = EdgeTokenSource.generate();
        assert_ne!(first, second);
    }

    #[test]
    fn scannable_rendering_is_multiline_block_art() {
        let token = EdgeTokenSource.generate();
        let rendered = render_scannable(&token).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines.len() > 10);
        assert!(rendered.contains('█') || rendered.contains('▀') || rendered.contains('▄'));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(ConnectionData::decode(&PairingToken::new("not base64!")).is_none());
    }
}
