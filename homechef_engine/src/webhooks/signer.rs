//! HMAC-SHA256 body signatures, hex encoded.
//!
//! Outbound webhooks carry `hex(hmac_sha256(secret, raw_body))` in the signature header. The same scheme is used to
//! verify inbound calls from the payment collaborator.
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-HomeChef-Signature";
pub const EVENT_HEADER: &str = "X-HomeChef-Event";
pub const DELIVERY_HEADER: &str = "X-HomeChef-Delivery";

#[derive(Debug, Clone, Error)]
pub enum SignatureError {
    #[error("Invalid HMAC key. {0}")]
    InvalidKey(String),
    #[error("The signature is not valid hex")]
    MalformedSignature,
}

fn mac_for(secret: &[u8], body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(mac)
}

pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mac = mac_for(secret, body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature` (hex, case-insensitive) against the body in constant time.
pub fn verify(secret: &[u8], body: &[u8], signature: &str) -> Result<bool, SignatureError> {
    let expected = hex::decode(signature.trim()).map_err(|_| SignatureError::MalformedSignature)?;
    let mac = mac_for(secret, body)?;
    Ok(mac.verify_slice(&expected).is_ok())
}
