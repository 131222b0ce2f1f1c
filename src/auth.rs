//! Optional API-key authentication.
//!
//! Keys are compared as SHA-256 digests with a constant-time equality,
//! so neither key length nor matching-prefix length leaks through
//! timing. Raw keys are never logged; a short digest prefix is exposed
//! for log correlation.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{Result, ScoutError};

pub struct Authenticator {
    digests: Vec<[u8; 32]>,
}

fn digest(key: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(key.as_bytes()));
    out
}

impl Authenticator {
    /// An empty key set disables authentication.
    pub fn new(keys: &HashSet<String>) -> Self {
        Self {
            digests: keys.iter().map(|k| digest(k)).collect(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.digests.is_empty()
    }

    /// Short digest prefix for correlating log lines with a key without
    /// ever writing the key itself.
    pub fn fingerprint(key: &str) -> String {
        hex::encode(&digest(key)[..4])
    }

    pub fn check(&self, api_key: Option<&str>) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let presented = match api_key {
            Some(k) if !k.is_empty() => digest(k),
            _ => return Err(ScoutError::Auth),
        };
        // Scan the whole set unconditionally; acceptance is the OR of
        // constant-time comparisons.
        let mut ok = subtle::Choice::from(0u8);
        for known in &self.digests {
            ok |= known.as_slice().ct_eq(presented.as_slice());
        }
        if bool::from(ok) {
            Ok(())
        } else {
            debug!(
                key = %Self::fingerprint(api_key.unwrap_or_default()),
                "rejected API key"
            );
            Err(ScoutError::Auth)
        }
    }
}
