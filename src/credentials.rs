use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::store_types::ProxyCredentialRecord;

type HmacSha256 = Hmac<Sha256>;

/// Recognizable prefix on every issued proxy secret.
pub const SECRET_PREFIX: &str = "pk-";

const SECRET_RANDOM_BYTES: usize = 32;
const MIN_PEPPER_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("pepper must be at least {MIN_PEPPER_BYTES} bytes")]
    PepperTooShort,
    #[error("system randomness unavailable")]
    RandomnessUnavailable,
}

/// Generates, fingerprints, and verifies proxy secrets. The pepper is a
/// process-wide server secret mixed into every fingerprint; it is validated
/// at construction so a misconfigured process fails before accepting traffic.
pub struct CredentialVault {
    mac: HmacSha256,
}

impl CredentialVault {
    pub fn new(pepper: &[u8]) -> Result<Self, CredentialError> {
        if pepper.len() < MIN_PEPPER_BYTES {
            return Err(CredentialError::PepperTooShort);
        }
        let mac =
            HmacSha256::new_from_slice(pepper).map_err(|_| CredentialError::PepperTooShort)?;
        Ok(Self { mac })
    }

    /// Produces one fresh secret with 256 bits of randomness. The plaintext
    /// is returned exactly once and never stored here. No fallback source:
    /// if the system RNG is unavailable, issuing fails.
    pub fn generate(&self) -> Result<String, CredentialError> {
        let mut bytes = [0u8; SECRET_RANDOM_BYTES];
        getrandom::fill(&mut bytes).map_err(|_| CredentialError::RandomnessUnavailable)?;
        Ok(format!("{SECRET_PREFIX}{}", hex::encode(bytes)))
    }

    /// Keyed one-way digest of a secret: hex HMAC-SHA-256 under the pepper.
    /// Deterministic, so stored fingerprints support equality lookup without
    /// ever storing the secret.
    pub fn fingerprint(&self, secret: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(secret.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Matches `provided` against the active credential set. Every stored
    /// fingerprint is compared in fixed time and the scan always covers the
    /// full set, so timing does not depend on match position or mismatch
    /// offset. Returns `None` for any failure; the caller maps that to one
    /// generic authentication error.
    pub fn verify<'a>(
        &self,
        provided: &str,
        active: &'a [ProxyCredentialRecord],
    ) -> Option<&'a ProxyCredentialRecord> {
        let provided_fp = self.fingerprint(provided);
        let provided_bytes = provided_fp.as_bytes();

        let mut matched: Option<&ProxyCredentialRecord> = None;
        for record in active {
            let stored = record.fingerprint.as_bytes();
            let equal =
                stored.len() == provided_bytes.len() && bool::from(stored.ct_eq(provided_bytes));
            if equal && matched.is_none() {
                matched = Some(record);
            }
        }
        matched
    }
}
