//! Sudo password relay: the agent-side shell asks for a sudo password via an ECDH-wrapped
//! request (spec.md §4.9); the core derives a shared secret with the shell's ephemeral
//! public key, encrypts the password under it, and ships back the ciphertext plus its own
//! ephemeral public key.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SudoRelayError {
    #[error("invalid shell public key")]
    InvalidPeerKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A completed encryption of a password under a freshly derived ECDH shared secret.
pub struct SudoResponsePayload {
    /// Base64 of the AEAD-sealed password (12-byte nonce prefix + ciphertext).
    pub encrypted_secret: String,
    /// Base64 SEC1-encoded point of our ephemeral public key, sent back so the shell side
    /// can derive the same shared secret.
    pub srv_pub_key: String,
}

/// Encrypt `password` for the shell side's ephemeral public key (base64 SEC1-encoded point).
pub fn encrypt_for_shell(
    shell_pub_key_b64: &str,
    password: &str,
) -> Result<SudoResponsePayload, SudoRelayError> {
    let peer_bytes = B64.decode(shell_pub_key_b64)?;
    let peer_pub = PublicKey::from_sec1_bytes(&peer_bytes).map_err(|_| SudoRelayError::InvalidPeerKey)?;

    let our_secret = EphemeralSecret::random(&mut OsRng);
    let our_pub = our_secret.public_key();
    let shared = our_secret.diffie_hellman(&peer_pub);

    // Use the raw shared-secret bytes directly as an AES-256 key; both sides derive the
    // identical 32-byte x-coordinate so no separate KDF round is required for this relay.
    let key_bytes = shared.raw_secret_bytes();
    let cipher = Aes256Gcm::new_from_slice(key_bytes.as_slice()).map_err(|_| SudoRelayError::Encrypt)?;

    let mut nonce_bytes = [0u8; 12];
    rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, password.as_bytes())
        .map_err(|_| SudoRelayError::Encrypt)?;

    let mut sealed = Vec::with_capacity(12 + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    Ok(SudoResponsePayload {
        encrypted_secret: B64.encode(sealed),
        srv_pub_key: B64.encode(our_pub.to_encoded_point(false).as_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::SecretKey;

    #[test]
    fn encrypts_and_shell_side_can_decrypt() {
        // Simulate the shell side generating its own ephemeral keypair.
        let shell_secret = SecretKey::random(&mut OsRng);
        let shell_pub = shell_secret.public_key();
        let shell_pub_b64 = B64.encode(shell_pub.to_encoded_point(false).as_bytes());

        let payload = encrypt_for_shell(&shell_pub_b64, "hunter2").unwrap();

        // Shell side: derive the same shared secret using our returned ephemeral pub key.
        let our_pub_bytes = B64.decode(&payload.srv_pub_key).unwrap();
        let our_pub = PublicKey::from_sec1_bytes(&our_pub_bytes).unwrap();
        let shared = p256::ecdh::diffie_hellman(
            shell_secret.to_nonzero_scalar(),
            our_pub.as_affine(),
        );

        let sealed = B64.decode(&payload.encrypted_secret).unwrap();
        let (nonce_bytes, ciphertext) = sealed.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes().as_slice()).unwrap();
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .unwrap();
        assert_eq!(plaintext, b"hunter2");
    }

    #[test]
    fn invalid_peer_key_is_rejected() {
        let err = encrypt_for_shell(&B64.encode(b"not a point"), "x").unwrap_err();
        assert!(matches!(err, SudoRelayError::InvalidPeerKey));
    }
}
