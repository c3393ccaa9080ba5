use crate::error::{ReconcileError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-shkeeper-signature";
const SCHEME: &str = "sha256=";

/// Checks `X-SHKeeper-Signature: sha256=<hex>` against an HMAC-SHA256 of the raw body.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    dev_mode: bool,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("dev_mode", &self.dev_mode)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, dev_mode: bool) -> Self {
        Self {
            secret: secret.into(),
            dev_mode,
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ReconcileError::InternalError(Box::new(std::io::Error::other(e.to_string()))))
    }

    /// Header value the gateway is expected to send for `body`.
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(format!("{SCHEME}{}", hex::encode(mac.finalize().into_bytes())))
    }

    /// Verifies the signature header. In dev mode every payload is accepted.
    pub fn verify(&self, header: Option<&str>, body: &[u8]) -> Result<()> {
        if self.dev_mode {
            tracing::warn!("dev mode: webhook signature verification skipped");
            return Ok(());
        }

        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ReconcileError::Unauthorized("missing signature".to_string()))?;

        let encoded = header
            .get(..SCHEME.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(SCHEME))
            .map(|_| &header[SCHEME.len()..])
            .ok_or_else(|| {
                ReconcileError::Unauthorized("unsupported signature scheme".to_string())
            })?;

        let expected = hex::decode(encoded)
            .map_err(|_| ReconcileError::Unauthorized("signature is not hex".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| ReconcileError::Unauthorized("signature mismatch".to_string()))
    }
}
