#![allow(missing_docs)]
//! Handshake tokens: claims, the engine contract, and a sealed
//! shared-secret implementation.
//!
//! Three token shapes share one wire encoding. SYN tokens carry the
//! identity claim set and an embedded 32-byte connection nonce. SYN-ACK
//! tokens add the peer's nonce. ACK tokens carry only the two nonces and
//! have a fixed sealed length so sequence adjustment after detach is
//! deterministic.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::connection::CONTEXT_NONCE_LEN;
use crate::error::DatapathError;
use crate::policy::TagStore;

/// Claim key naming the transmitting workload. Required in every SYN and
/// SYN-ACK token.
pub const TRANSMITTER_LABEL: &str = "transmitter-id";

const AEAD_NONCE_LEN: usize = 12;
const AEAD_TAG_LEN: usize = 16;
const MAX_TAGS: usize = 1024;

/// Claims carried inside a handshake token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionClaims {
    /// Identity tags; absent in ACK tokens
    pub tags: Option<TagStore>,
    /// Transmitter's connection nonce
    pub lcl: Vec<u8>,
    /// Nonce received from the peer, echoed back
    pub rmt: Vec<u8>,
}

/// Result of opening a token.
pub struct DecodedToken {
    pub claims: ConnectionClaims,
    /// Connection nonce embedded in the token; empty for ACK tokens
    pub nonce: Vec<u8>,
    /// Peer certificate when the engine carries one
    pub certificate: Option<Vec<u8>>,
}

/// The token cryptography contract the datapath builds on.
///
/// Implementations are thread-safe and stateless per call aside from key
/// material.
pub trait TokenEngine: Send + Sync {
    /// Create a signed token. `ack` selects the short dual-nonce shape.
    /// Returns the token and the freshly generated connection nonce
    /// (empty for ACK tokens, which embed no new nonce).
    fn create_and_sign(
        &self,
        ack: bool,
        claims: &ConnectionClaims,
    ) -> Result<(Vec<u8>, Vec<u8>), DatapathError>;

    /// Validate and open a token.
    fn decode(
        &self,
        ack: bool,
        data: &[u8],
        remote_public_key: Option<&[u8]>,
    ) -> Result<DecodedToken, DatapathError>;

    /// Replace the connection nonce embedded in a SYN token without
    /// re-deriving the claims, returning the new nonce. Amortizes signing
    /// cost across a connection burst.
    fn randomize(&self, token: &mut Vec<u8>) -> Result<Vec<u8>, DatapathError>;

    /// Exact sealed length of an ACK token.
    fn ack_size(&self) -> usize;
}

/// Shared-secret token engine sealing claims with AES-256-GCM.
///
/// The sealing key is derived from the configured secret with SHA-256.
/// The token layout is `[aead-nonce:12][ciphertext+tag]`; the ack flag is
/// bound as associated data so the two token shapes cannot be confused.
pub struct SealedTokenEngine {
    cipher: Aes256Gcm,
}

impl SealedTokenEngine {
    /// Build an engine from a shared secret.
    pub fn new(shared_secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(shared_secret);
        let key: [u8; 32] = hasher.finalize().into();
        Self {
            cipher: Aes256Gcm::new_from_slice(&key).expect("SHA-256 output is a valid key"),
        }
    }

    fn seal(&self, ack: bool, plaintext: &[u8]) -> Result<Vec<u8>, DatapathError> {
        let mut nonce = [0u8; AEAD_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce.into(),
                Payload {
                    msg: plaintext,
                    aad: &[ack as u8],
                },
            )
            .map_err(|_| DatapathError::CryptoFailure)?;

        let mut token = Vec::with_capacity(AEAD_NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    fn open(&self, ack: bool, data: &[u8]) -> Result<Vec<u8>, DatapathError> {
        if data.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
            return Err(DatapathError::InvalidToken);
        }
        let nonce: [u8; AEAD_NONCE_LEN] = data[..AEAD_NONCE_LEN].try_into().unwrap();
        self.cipher
            .decrypt(
                &nonce.into(),
                Payload {
                    msg: &data[AEAD_NONCE_LEN..],
                    aad: &[ack as u8],
                },
            )
            .map_err(|_| DatapathError::InvalidToken)
    }
}

impl TokenEngine for SealedTokenEngine {
    fn create_and_sign(
        &self,
        ack: bool,
        claims: &ConnectionClaims,
    ) -> Result<(Vec<u8>, Vec<u8>), DatapathError> {
        if ack {
            if claims.lcl.len() != CONTEXT_NONCE_LEN || claims.rmt.len() != CONTEXT_NONCE_LEN {
                return Err(DatapathError::CryptoFailure);
            }
            let mut plaintext = Vec::with_capacity(2 * CONTEXT_NONCE_LEN);
            plaintext.extend_from_slice(&claims.lcl);
            plaintext.extend_from_slice(&claims.rmt);
            return Ok((self.seal(true, &plaintext)?, Vec::new()));
        }

        let mut nonce = vec![0u8; CONTEXT_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut plaintext = nonce.clone();
        encode_claims(claims, &mut plaintext)?;
        Ok((self.seal(false, &plaintext)?, nonce))
    }

    fn decode(
        &self,
        ack: bool,
        data: &[u8],
        _remote_public_key: Option<&[u8]>,
    ) -> Result<DecodedToken, DatapathError> {
        let plaintext = self.open(ack, data)?;

        if ack {
            if plaintext.len() != 2 * CONTEXT_NONCE_LEN {
                return Err(DatapathError::InvalidToken);
            }
            return Ok(DecodedToken {
                claims: ConnectionClaims {
                    tags: None,
                    lcl: plaintext[..CONTEXT_NONCE_LEN].to_vec(),
                    rmt: plaintext[CONTEXT_NONCE_LEN..].to_vec(),
                },
                nonce: Vec::new(),
                certificate: None,
            });
        }

        if plaintext.len() < CONTEXT_NONCE_LEN {
            return Err(DatapathError::InvalidToken);
        }
        let nonce = plaintext[..CONTEXT_NONCE_LEN].to_vec();
        let claims = decode_claims(&plaintext[CONTEXT_NONCE_LEN..])?;
        Ok(DecodedToken {
            claims,
            nonce,
            certificate: None,
        })
    }

    fn randomize(&self, token: &mut Vec<u8>) -> Result<Vec<u8>, DatapathError> {
        let mut plaintext = self.open(false, token)?;
        if plaintext.len() < CONTEXT_NONCE_LEN {
            return Err(DatapathError::InvalidToken);
        }
        let mut nonce = vec![0u8; CONTEXT_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        plaintext[..CONTEXT_NONCE_LEN].copy_from_slice(&nonce);
        *token = self.seal(false, &plaintext)?;
        Ok(nonce)
    }

    fn ack_size(&self) -> usize {
        AEAD_NONCE_LEN + 2 * CONTEXT_NONCE_LEN + AEAD_TAG_LEN
    }
}

// Claims wire encoding: echoed peer nonce with a one-byte length, then
// tag count u16, then length-prefixed tag strings. SYN tokens carry an
// empty echo; SYN-ACK tokens echo the initiator's nonce.
fn encode_claims(claims: &ConnectionClaims, out: &mut Vec<u8>) -> Result<(), DatapathError> {
    if !claims.rmt.is_empty() && claims.rmt.len() != CONTEXT_NONCE_LEN {
        return Err(DatapathError::CryptoFailure);
    }
    out.push(claims.rmt.len() as u8);
    out.extend_from_slice(&claims.rmt);

    let tags = claims.tags.as_ref().map(TagStore::as_slice).unwrap_or(&[]);
    if tags.len() > MAX_TAGS {
        return Err(DatapathError::CryptoFailure);
    }
    out.extend_from_slice(&(tags.len() as u16).to_be_bytes());
    for tag in tags {
        let bytes = tag.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(DatapathError::CryptoFailure);
        }
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    Ok(())
}

fn decode_claims(data: &[u8]) -> Result<ConnectionClaims, DatapathError> {
    if data.is_empty() {
        return Err(DatapathError::InvalidToken);
    }
    let rmt_len = data[0] as usize;
    if rmt_len != 0 && rmt_len != CONTEXT_NONCE_LEN {
        return Err(DatapathError::InvalidToken);
    }
    if data.len() < 1 + rmt_len + 2 {
        return Err(DatapathError::InvalidToken);
    }
    let rmt = data[1..1 + rmt_len].to_vec();

    let mut pos = 1 + rmt_len;
    let count = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    if count > MAX_TAGS {
        return Err(DatapathError::InvalidToken);
    }
    pos += 2;

    let mut tags = TagStore::default();
    for _ in 0..count {
        if pos + 2 > data.len() {
            return Err(DatapathError::InvalidToken);
        }
        let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(DatapathError::InvalidToken);
        }
        let tag =
            std::str::from_utf8(&data[pos..pos + len]).map_err(|_| DatapathError::InvalidToken)?;
        match tag.split_once('=') {
            Some((key, value)) => tags.append_key_value(key, value),
            None => return Err(DatapathError::InvalidToken),
        }
        pos += len;
    }
    if pos != data.len() {
        return Err(DatapathError::InvalidToken);
    }

    Ok(ConnectionClaims {
        tags: Some(tags),
        lcl: Vec::new(),
        rmt,
    })
}
