//! Crypto service port.
//!
//! The gateway never implements algorithms itself: it hands protected
//! payloads to a [`CryptoService`] whenever a header's cipher-info flags ask
//! for it. [`SoftwareCrypto`] is a key-table adapter over `ring` for
//! deployments without an HSM; [`NoCrypto`] refuses everything.

use crate::error::{GatewayError, GatewayResult};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Length of a key check value.
pub const KCV_LEN: usize = 3;

/// Opaque reference to a key held by the crypto backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRef(String);

impl KeyRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the gateway needs from a crypto backend.
///
/// Implementations must be safe to call concurrently from many connection
/// handlers; keys are selected per call.
pub trait CryptoService: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>>;

    fn sign(&self, data: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>>;

    fn verify_mac(&self, data: &[u8], mac: &[u8], key: &KeyRef) -> GatewayResult<bool>;

    fn compute_kcv(&self, key: &KeyRef) -> GatewayResult<Vec<u8>>;
}

/// Backend used when no keys are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCrypto;

impl NoCrypto {
    fn refuse<T>(key: &KeyRef) -> GatewayResult<T> {
        Err(GatewayError::config(format!(
            "protected content for key {key} but no crypto backend is configured"
        )))
    }
}

impl CryptoService for NoCrypto {
    fn encrypt(&self, _plaintext: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>> {
        Self::refuse(key)
    }

    fn decrypt(&self, _ciphertext: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>> {
        Self::refuse(key)
    }

    fn sign(&self, _data: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>> {
        Self::refuse(key)
    }

    fn verify_mac(&self, _data: &[u8], _mac: &[u8], key: &KeyRef) -> GatewayResult<bool> {
        Self::refuse(key)
    }

    fn compute_kcv(&self, key: &KeyRef) -> GatewayResult<Vec<u8>> {
        Self::refuse(key)
    }
}

struct KeyMaterial {
    aead: LessSafeKey,
    mac: hmac::Key,
    kcv: [u8; KCV_LEN],
}

/// In-process key table: AES-256-GCM for payloads, HMAC-SHA256 for MACs.
///
/// Ciphertext is `nonce || sealed payload || tag`. The MAC key is derived
/// from the configured key so the same secret is never fed to two primitives.
pub struct SoftwareCrypto {
    keys: HashMap<String, KeyMaterial>,
    rng: SystemRandom,
}

impl SoftwareCrypto {
    /// Build from `(key id, hex-encoded 32-byte key)` pairs.
    pub fn from_hex_keys<'a, I>(keys: I) -> GatewayResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut table = HashMap::new();
        for (id, hex_key) in keys {
            let raw = hex::decode(hex_key.trim())
                .map_err(|e| GatewayError::config(format!("key {id}: {e}")))?;
            table.insert(id.to_string(), Self::material(id, &raw)?);
        }
        Ok(Self {
            keys: table,
            rng: SystemRandom::new(),
        })
    }

    fn material(id: &str, raw: &[u8]) -> GatewayResult<KeyMaterial> {
        let unbound = UnboundKey::new(&AES_256_GCM, raw).map_err(|_| {
            GatewayError::config(format!(
                "key {id} must be 32 bytes, got {}",
                raw.len()
            ))
        })?;

        let mut mac_seed = Sha256::new();
        mac_seed.update(b"isogate-mac");
        mac_seed.update(raw);
        let mac = hmac::Key::new(hmac::HMAC_SHA256, &mac_seed.finalize());

        let digest = Sha256::digest(raw);
        let mut kcv = [0u8; KCV_LEN];
        kcv.copy_from_slice(&digest[..KCV_LEN]);

        Ok(KeyMaterial {
            aead: LessSafeKey::new(unbound),
            mac,
            kcv,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn key(&self, key: &KeyRef) -> GatewayResult<&KeyMaterial> {
        self.keys
            .get(key.as_str())
            .ok_or_else(|| GatewayError::config(format!("unknown key {key}")))
    }
}

impl CryptoService for SoftwareCrypto {
    fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>> {
        let material = self.key(key)?;
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| GatewayError::crypto("RNG failure"))?;

        let mut sealed = plaintext.to_vec();
        material
            .aead
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
            .map_err(|_| GatewayError::crypto(format!("seal failed for key {key}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend(sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>> {
        let material = self.key(key)?;
        if ciphertext.len() < NONCE_LEN {
            return Err(GatewayError::crypto("ciphertext shorter than nonce"));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);

        let mut in_out = sealed.to_vec();
        let plain = material
            .aead
            .open_in_place(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| GatewayError::crypto(format!("open failed for key {key}")))?;
        Ok(plain.to_vec())
    }

    fn sign(&self, data: &[u8], key: &KeyRef) -> GatewayResult<Vec<u8>> {
        let material = self.key(key)?;
        Ok(hmac::sign(&material.mac, data).as_ref().to_vec())
    }

    fn verify_mac(&self, data: &[u8], mac: &[u8], key: &KeyRef) -> GatewayResult<bool> {
        let material = self.key(key)?;
        Ok(hmac::verify(&material.mac, data, mac).is_ok())
    }

    fn compute_kcv(&self, key: &KeyRef) -> GatewayResult<Vec<u8>> {
        Ok(self.key(key)?.kcv.to_vec())
    }
}
