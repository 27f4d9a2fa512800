//! End-to-end stream encryption between ingress and exit.
//!
//! Each endpoint contributes an ephemeral X25519 key through
//! STREAM_OPEN / STREAM_OPEN_ACK. The shared secret feeds HKDF-SHA256 with
//! one label per direction, yielding two independent ChaCha20-Poly1305 keys.
//! Every STREAM_DATA payload between the endpoints is then a sealed record;
//! transit agents forward them without the means to open them.
//!
//! Record layout: `nonce[12] | ciphertext | tag[16]`, where the nonce is the
//! little-endian 64-bit sequence followed by four zero bytes. Sequences are
//! strictly increasing per direction and the receiver refuses anything at or
//! below the highest it has accepted.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::CryptoError;
use trellis_proto::MAX_PAYLOAD_LEN;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Per-record overhead added by sealing.
pub const RECORD_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Largest plaintext that still fits a sealed record in one frame.
pub const MAX_PLAINTEXT: usize = MAX_PAYLOAD_LEN - RECORD_OVERHEAD;

const LABEL_INGRESS_TO_EXIT: &[u8] = "ingress→exit".as_bytes();
const LABEL_EXIT_TO_INGRESS: &[u8] = "exit→ingress".as_bytes();

/// Which end of the stream this session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Ingress,
    Exit,
}

/// Ephemeral X25519 keypair for one stream handshake.
pub struct StreamKeys {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl StreamKeys {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        StreamKeys { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Consume the ephemeral secret and derive the session for `side`.
    pub fn into_session(self, remote_public: &[u8; 32], side: Side) -> E2eSession {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*remote_public));
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut ingress_to_exit = [0u8; 32];
        let mut exit_to_ingress = [0u8; 32];
        hk.expand(LABEL_INGRESS_TO_EXIT, &mut ingress_to_exit)
            .expect("hkdf output length is valid");
        hk.expand(LABEL_EXIT_TO_INGRESS, &mut exit_to_ingress)
            .expect("hkdf output length is valid");

        let (seal_key, open_key) = match side {
            Side::Ingress => (ingress_to_exit, exit_to_ingress),
            Side::Exit => (exit_to_ingress, ingress_to_exit),
        };
        E2eSession {
            seal: SealHalf {
                cipher: ChaCha20Poly1305::new(Key::from_slice(&seal_key)),
                next_sequence: 0,
            },
            open: OpenHalf {
                cipher: ChaCha20Poly1305::new(Key::from_slice(&open_key)),
                highest_seen: None,
            },
        }
    }
}

/// Symmetric state for one stream endpoint.
pub struct E2eSession {
    pub seal: SealHalf,
    pub open: OpenHalf,
}

impl E2eSession {
    pub fn split(self) -> (SealHalf, OpenHalf) {
        (self.seal, self.open)
    }
}

/// Sending direction of an [`E2eSession`].
pub struct SealHalf {
    cipher: ChaCha20Poly1305,
    next_sequence: u64,
}

impl SealHalf {
    /// Seal one record. `plaintext` must not exceed [`MAX_PLAINTEXT`].
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        debug_assert!(plaintext.len() <= MAX_PLAINTEXT);
        // The session dies before the sequence can wrap.
        if self.next_sequence == u64::MAX {
            return Err(CryptoError::Exhausted);
        }
        let nonce_bytes = nonce_for(self.next_sequence);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::BadTag)?;
        self.next_sequence += 1;

        let mut record = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }
}

/// Receiving direction of an [`E2eSession`].
pub struct OpenHalf {
    cipher: ChaCha20Poly1305,
    highest_seen: Option<u64>,
}

impl OpenHalf {
    /// Open one record, enforcing nonce shape and sequence monotonicity.
    pub fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::ShortRecord);
        }
        let (nonce_bytes, ciphertext) = record.split_at(NONCE_LEN);
        if nonce_bytes[8..] != [0u8; 4] {
            return Err(CryptoError::MalformedNonce);
        }
        let sequence = u64::from_le_bytes(nonce_bytes[..8].try_into().unwrap());
        if let Some(highest) = self.highest_seen {
            if sequence <= highest {
                return Err(CryptoError::Replay { sequence });
            }
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::BadTag)?;
        self.highest_seen = Some(sequence);
        Ok(plaintext)
    }
}

fn nonce_for(sequence: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (E2eSession, E2eSession) {
        let ingress = StreamKeys::generate();
        let exit = StreamKeys::generate();
        let ingress_pub = ingress.public_bytes();
        let exit_pub = exit.public_bytes();
        (
            ingress.into_session(&exit_pub, Side::Ingress),
            exit.into_session(&ingress_pub, Side::Exit),
        )
    }

    #[test]
    fn both_directions_seal_and_open() {
        let (mut ingress, mut exit) = session_pair();

        let record = ingress.seal.seal(b"request").unwrap();
        assert_eq!(exit.open.open(&record).unwrap(), b"request");

        let record = exit.seal.seal(b"response").unwrap();
        assert_eq!(ingress.open.open(&record).unwrap(), b"response");
    }

    #[test]
    fn directions_use_independent_keys() {
        let (mut ingress, mut exit) = session_pair();
        let record = ingress.seal.seal(b"hello").unwrap();
        // The ingress cannot open its own sealed record: the reverse key differs.
        assert_eq!(ingress.open.open(&record), Err(CryptoError::BadTag));
        assert!(exit.open.open(&record).is_ok());
    }

    #[test]
    fn record_carries_le_sequence_nonce() {
        let (mut ingress, _) = session_pair();
        let first = ingress.seal.seal(b"a").unwrap();
        let second = ingress.seal.seal(b"b").unwrap();
        assert_eq!(&first[..12], &[0u8; 12]);
        assert_eq!(&second[..8], &1u64.to_le_bytes());
        assert_eq!(&second[8..12], &[0u8; 4]);
        assert_eq!(first.len(), 1 + RECORD_OVERHEAD);
    }

    #[test]
    fn replayed_record_is_rejected() {
        let (mut ingress, mut exit) = session_pair();
        let record = ingress.seal.seal(b"once").unwrap();
        assert!(exit.open.open(&record).is_ok());
        assert_eq!(
            exit.open.open(&record),
            Err(CryptoError::Replay { sequence: 0 })
        );
    }

    #[test]
    fn reordered_record_is_rejected() {
        let (mut ingress, mut exit) = session_pair();
        let first = ingress.seal.seal(b"1").unwrap();
        let second = ingress.seal.seal(b"2").unwrap();
        assert!(exit.open.open(&second).is_ok());
        assert_eq!(exit.open.open(&first), Err(CryptoError::Replay { sequence: 0 }));
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let (mut ingress, mut exit) = session_pair();
        let mut record = ingress.seal.seal(b"payload").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;
        assert_eq!(exit.open.open(&record), Err(CryptoError::BadTag));
    }

    #[test]
    fn nonzero_nonce_tail_is_rejected() {
        let (mut ingress, mut exit) = session_pair();
        let mut record = ingress.seal.seal(b"x").unwrap();
        record[11] = 1;
        assert_eq!(exit.open.open(&record), Err(CryptoError::MalformedNonce));
    }

    #[test]
    fn short_record_is_rejected() {
        let (_, mut exit) = session_pair();
        assert_eq!(exit.open.open(&[0u8; 27]), Err(CryptoError::ShortRecord));
    }

    #[test]
    fn mismatched_keys_never_open() {
        let (mut ingress, _) = session_pair();
        let (_, mut other_exit) = session_pair();
        let record = ingress.seal.seal(b"secret").unwrap();
        assert_eq!(other_exit.open.open(&record), Err(CryptoError::BadTag));
    }

    #[test]
    fn max_plaintext_fits_one_frame() {
        let (mut ingress, _) = session_pair();
        let record = ingress.seal.seal(&vec![7u8; MAX_PLAINTEXT]).unwrap();
        assert_eq!(record.len(), MAX_PAYLOAD_LEN);
    }
}
