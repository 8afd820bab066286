//! Crypto primitives: password-keyed MAC, frame payload encryption with a
//! truncated tag, session-key sealing, nonces and random keys.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::protocol::AUTH_TAG_LEN;

type HmacSha256 = Hmac<Sha256>;

pub const HASH_KEY_LEN: usize = 32;
/// Default nonce length in characters.
pub const DEFAULT_NONCE_LEN: usize = 13;

const FRAME_ENC_LABEL: &[u8] = b"linkmesh-frame-enc";
const FRAME_TAG_LABEL: &[u8] = b"linkmesh-frame-tag";
const HASH_KEY_LABEL: &[u8] = b"linkmesh-hash-key";

fn keyed(key: &[u8]) -> Result<HmacSha256, CryptoError> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::Key)
}

/// HMAC-SHA256 of `bytes` under `key`.
pub fn mac(key: &[u8], bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    mac_parts(key, &[bytes])
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn mac_parts(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut m = keyed(key)?;
    for part in parts {
        m.update(part);
    }
    Ok(m.finalize().into_bytes().into())
}

/// Constant-time check of a full MAC over `parts`.
pub fn verify_mac(key: &[u8], parts: &[&[u8]], expected: &[u8; 32]) -> Result<(), CryptoError> {
    let mut m = keyed(key)?;
    for part in parts {
        m.update(part);
    }
    m.verify_slice(expected)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Hash key shared by both ends of a session: password-keyed MAC over both nonces.
pub fn derive_hash_key(
    password: &str,
    initiator_nonce: &str,
    responder_nonce: &str,
) -> Result<[u8; HASH_KEY_LEN], CryptoError> {
    mac_parts(
        password.as_bytes(),
        &[
            HASH_KEY_LABEL,
            initiator_nonce.as_bytes(),
            responder_nonce.as_bytes(),
        ],
    )
}

fn frame_keys(
    session_key: u64,
    hash_key: &[u8; HASH_KEY_LEN],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let sk = session_key.to_le_bytes();
    let enc = mac_parts(hash_key, &[FRAME_ENC_LABEL, &sk])?;
    let tag = mac_parts(hash_key, &[FRAME_TAG_LABEL, &sk])?;
    Ok((enc, tag))
}

fn frame_nonce(header: &[u8]) -> [u8; 12] {
    let digest = Sha256::digest(header);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

fn apply_keystream(key: &[u8; 32], header: &[u8], buf: &mut [u8]) {
    let nonce = frame_nonce(header);
    let mut cipher = ChaCha20::new(
        chacha20::Key::from_slice(key),
        chacha20::Nonce::from_slice(&nonce),
    );
    cipher.apply_keystream(buf);
}

/// Encrypt a frame payload. `session_key` is the sender's own session key,
/// `header` the transmitted header bytes (it must be unique per frame).
pub fn encrypt(
    session_key: u64,
    hash_key: &[u8; HASH_KEY_LEN],
    header: &[u8],
    payload: &[u8],
) -> Result<(Vec<u8>, [u8; AUTH_TAG_LEN]), CryptoError> {
    let (enc_key, tag_key) = frame_keys(session_key, hash_key)?;
    let mut cipher = payload.to_vec();
    apply_keystream(&enc_key, header, &mut cipher);
    let full = mac_parts(&tag_key, &[header, &cipher])?;
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&full[..AUTH_TAG_LEN]);
    Ok((cipher, tag))
}

/// Verify the tag, then decrypt. Fails with `AuthenticationFailed` on mismatch.
pub fn decrypt(
    session_key: u64,
    hash_key: &[u8; HASH_KEY_LEN],
    header: &[u8],
    cipher: &[u8],
    tag: &[u8; AUTH_TAG_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let (enc_key, tag_key) = frame_keys(session_key, hash_key)?;
    let mut m = keyed(&tag_key)?;
    m.update(header);
    m.update(cipher);
    m.verify_truncated_left(tag)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    let mut plain = cipher.to_vec();
    apply_keystream(&enc_key, header, &mut plain);
    Ok(plain)
}

fn seal_nonce(request_id: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&request_id.to_le_bytes());
    nonce
}

/// Seal the two session keys of a handshake with ChaCha20-Poly1305 under the hash key.
/// The request ID is both nonce and associated data; it is fresh per handshake.
pub fn seal_session_keys(
    hash_key: &[u8; HASH_KEY_LEN],
    request_id: u64,
    peer_session_key: u64,
    own_session_key: u64,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(hash_key).map_err(|_| CryptoError::Key)?;
    let mut plain = [0u8; 16];
    plain[..8].copy_from_slice(&peer_session_key.to_le_bytes());
    plain[8..].copy_from_slice(&own_session_key.to_le_bytes());
    let nonce = seal_nonce(request_id);
    let aad = request_id.to_le_bytes();
    cipher
        .encrypt(
            chacha20poly1305::Nonce::from_slice(&nonce),
            Payload {
                msg: &plain,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)
}

/// Inverse of [`seal_session_keys`]. Returns `(peer_session_key, own_session_key)`
/// as chosen by the sealing side.
pub fn open_session_keys(
    hash_key: &[u8; HASH_KEY_LEN],
    request_id: u64,
    sealed: &[u8],
) -> Result<(u64, u64), CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(hash_key).map_err(|_| CryptoError::Key)?;
    let nonce = seal_nonce(request_id);
    let aad = request_id.to_le_bytes();
    let plain = cipher
        .decrypt(
            chacha20poly1305::Nonce::from_slice(&nonce),
            Payload { msg: sealed, aad: &aad },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    if plain.len() != 16 {
        return Err(CryptoError::Malformed);
    }
    let mut peer = [0u8; 8];
    let mut own = [0u8; 8];
    peer.copy_from_slice(&plain[..8]);
    own.copy_from_slice(&plain[8..]);
    Ok((u64::from_le_bytes(peer), u64::from_le_bytes(own)))
}

/// Random printable nonce of `len` alphanumeric characters.
pub fn random_nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random non-zero 64-bit value from the OS RNG.
pub fn random64() -> u64 {
    loop {
        let v = OsRng.next_u64();
        if v != 0 {
            return v;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("malformed sealed data")]
    Malformed,
}
