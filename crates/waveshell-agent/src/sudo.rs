//! Agent-side half of the sudo ECDH relay (spec.md §4.9): the counterpart to
//! `waveshell_pty::sudo::encrypt_for_shell`, which runs on the core. The agent generates its
//! own ephemeral keypair, advertises the public half in a `SudoRequest`, and decrypts the
//! core's `SudoResponse` once it arrives using the shared secret derived from the core's
//! returned ephemeral key.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use tokio::sync::mpsc;

use waveshell_proto::{CmdKey, Packet};
use waveshell_pty::SudoRelayError;

/// A sudo password request awaiting the core's encrypted reply.
pub struct PendingSudo {
    secret: EphemeralSecret,
}

impl PendingSudo {
    /// Start a request: returns the pending state plus the base64 SEC1 public key to send
    /// as `shell_pub_key` in the `SudoRequest` packet.
    pub fn begin() -> (Self, String) {
        let secret = EphemeralSecret::random(&mut OsRng);
        let pub_key_b64 = B64.encode(secret.public_key().to_encoded_point(false).as_bytes());
        (PendingSudo { secret }, pub_key_b64)
    }

    /// Decrypt a `SudoResponse`'s payload.
    pub fn decrypt(
        &self,
        srv_pub_key_b64: &str,
        encrypted_secret_b64: &str,
    ) -> Result<String, SudoRelayError> {
        let peer_bytes = B64.decode(srv_pub_key_b64)?;
        let peer_pub =
            PublicKey::from_sec1_bytes(&peer_bytes).map_err(|_| SudoRelayError::InvalidPeerKey)?;
        let shared = self.secret.diffie_hellman(&peer_pub);

        let sealed = B64.decode(encrypted_secret_b64)?;
        if sealed.len() < 12 {
            return Err(SudoRelayError::Encrypt);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes().as_slice())
            .map_err(|_| SudoRelayError::Encrypt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SudoRelayError::Encrypt)?;
        String::from_utf8(plaintext).map_err(|_| SudoRelayError::Encrypt)
    }
}

/// Substrings in a pty's last output line that flag a `sudo -S` password prompt.
pub const SUDO_PROMPT_MARKERS: &[&str] = &["assword"];

pub fn looks_like_sudo_prompt(line: &str) -> bool {
    SUDO_PROMPT_MARKERS.iter().any(|m| line.contains(m))
}

/// Send a `SudoRequest` for `ck` and wait for the core's encrypted reply, returning the
/// decrypted password. Returns `None` if the core never replies (inbound channel closed)
/// or the reply fails to decrypt.
pub async fn relay_sudo_password(
    ck: CmdKey,
    sudo_status: &str,
    out_tx: &mpsc::Sender<Packet>,
    reply_rx: &mut mpsc::Receiver<(String, String)>,
) -> Option<String> {
    let (pending, shell_pub_key) = PendingSudo::begin();
    out_tx
        .send(Packet::SudoRequest {
            ck,
            shell_pub_key,
            sudo_status: sudo_status.to_string(),
        })
        .await
        .ok()?;
    let (srv_pub_key, encrypted_secret) = reply_rx.recv().await?;
    pending.decrypt(&srv_pub_key, &encrypted_secret).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::SecretKey;

    #[test]
    fn decrypts_a_payload_encrypted_for_our_public_key() {
        let (pending, our_pub_b64) = PendingSudo::begin();

        // Simulate the core: derive the shared secret from our advertised public key.
        let core_secret = SecretKey::random(&mut OsRng);
        let our_pub_bytes = B64.decode(&our_pub_b64).unwrap();
        let our_pub = PublicKey::from_sec1_bytes(&our_pub_bytes).unwrap();
        let shared =
            p256::ecdh::diffie_hellman(core_secret.to_nonzero_scalar(), our_pub.as_affine());

        let mut nonce_bytes = [0u8; 12];
        rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes().as_slice()).unwrap();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), b"hunter2".as_slice())
            .unwrap();
        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);

        let core_pub_b64 = B64.encode(core_secret.public_key().to_encoded_point(false).as_bytes());
        let plaintext = pending.decrypt(&core_pub_b64, &B64.encode(sealed)).unwrap();
        assert_eq!(plaintext, "hunter2");
    }

    #[test]
    fn rejects_a_malformed_peer_key() {
        let (pending, _) = PendingSudo::begin();
        let err = pending
            .decrypt(&B64.encode(b"not a point"), &B64.encode(b"short"))
            .unwrap_err();
        assert!(matches!(err, SudoRelayError::InvalidPeerKey));
    }

    #[test]
    fn sudo_prompt_detection_matches_common_wording() {
        assert!(looks_like_sudo_prompt("[sudo] password for user:"));
        assert!(!looks_like_sudo_prompt("$ "));
    }

    #[tokio::test]
    async fn relay_sudo_password_sends_request_and_decrypts_reply() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(1);

        let relay = tokio::spawn(async move {
            relay_sudo_password(CmdKey::new("s1", "l1"), "first-attempt", &out_tx, &mut reply_rx).await
        });

        let shell_pub_key = match out_rx.recv().await.unwrap() {
            Packet::SudoRequest { shell_pub_key, sudo_status, .. } => {
                assert_eq!(sudo_status, "first-attempt");
                shell_pub_key
            }
            other => panic!("expected SudoRequest, got {other:?}"),
        };

        let core_secret = SecretKey::random(&mut OsRng);
        let our_pub_bytes = B64.decode(&shell_pub_key).unwrap();
        let our_pub = PublicKey::from_sec1_bytes(&our_pub_bytes).unwrap();
        let shared = p256::ecdh::diffie_hellman(core_secret.to_nonzero_scalar(), our_pub.as_affine());
        let mut nonce_bytes = [0u8; 12];
        rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes().as_slice()).unwrap();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), b"hunter2".as_slice())
            .unwrap();
        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        let core_pub_b64 = B64.encode(core_secret.public_key().to_encoded_point(false).as_bytes());

        reply_tx.send((core_pub_b64, B64.encode(sealed))).await.unwrap();

        let password = relay.await.unwrap();
        assert_eq!(password.as_deref(), Some("hunter2"));
    }
}
