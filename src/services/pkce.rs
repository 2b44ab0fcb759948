//! PKCE (RFC 7636) material for the OAuth code exchange.
//!
//! The verifier never leaves the process except in the final token request,
//! and is wiped from memory once the exchange is done.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, Zeroizing};

use crate::types::errors::AuthError;

/// Entropy of the code verifier in bytes (43 base64url characters).
const VERIFIER_BYTES: usize = 32;

/// Challenge method sent with the authorize request.
pub const CHALLENGE_METHOD: &str = "s256";

/// A verifier and its derived challenge.
pub struct PkcePair {
    pub verifier: Zeroizing<String>,
    pub challenge: String,
}

/// Generates PKCE pairs from the system CSPRNG.
pub struct PkceGenerator {
    rng: SystemRandom,
}

impl PkceGenerator {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Creates a fresh verifier and its S256 challenge.
    pub fn generate(&self) -> Result<PkcePair, AuthError> {
        let mut bytes = [0u8; VERIFIER_BYTES];
        self.rng.fill(&mut bytes).map_err(|_| {
            AuthError::RandomGeneration("Failed to generate code verifier".to_string())
        })?;
        let verifier = Zeroizing::new(URL_SAFE_NO_PAD.encode(bytes));
        bytes.zeroize();

        let challenge = challenge_for(&verifier);
        Ok(PkcePair {
            verifier,
            challenge,
        })
    }
}

impl Default for PkceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest(&SHA256, verifier.as_bytes()))
}
