//! Per-side wire profile: whether a link carries the TLV header and how its
//! bodies are protected.

use crate::crypto::{CryptoService, KeyRef};
use crate::error::{GatewayError, GatewayResult, VerificationError};
use crate::message::GatewayMessage;
use crate::tlv::{CipherInfo, Tag, TlvFrame};

const CRYPTO_TAGS: [Tag; 4] = [Tag::CipherInfo, Tag::KeyId, Tag::Kcv, Tag::Mac];

/// How messages look on one side of the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireProfile {
    /// Messages on this side start with a TLV header.
    pub header: bool,
    /// Bodies sent on this side are encrypted; bodies received must be.
    pub encrypt: bool,
    /// Bodies sent on this side are MAC'd; bodies received must be.
    pub mac: bool,
    /// Key used for outgoing protection.
    pub key_id: Option<String>,
}

impl WireProfile {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn with_header() -> Self {
        Self {
            header: true,
            ..Self::default()
        }
    }

    /// Reject combinations that can never produce a valid message.
    pub fn validate(&self) -> GatewayResult<()> {
        let protected = self.encrypt || self.mac;
        if protected && !self.header {
            return Err(GatewayError::config(
                "encryption or MAC requires the TLV header on that side",
            ));
        }
        if protected && self.key_id.is_none() {
            return Err(GatewayError::config("encryption or MAC requires a key_id"));
        }
        Ok(())
    }

    /// Parse an inbound message, verifying and removing any protection.
    ///
    /// The returned header no longer carries cipher tags.
    pub fn decode(&self, bytes: &[u8], crypto: &dyn CryptoService) -> GatewayResult<GatewayMessage> {
        let mut msg = GatewayMessage::parse(bytes, self.header)?;
        let Some(header) = msg.header.as_mut() else {
            return Ok(msg);
        };

        let info = header.cipher_info();
        let key = header.get_str(Tag::KeyId).map(KeyRef::new);

        if let Some(kcv) = header.get(Tag::Kcv) {
            let key = key
                .as_ref()
                .ok_or_else(|| GatewayError::wrong_header("KCV present without KeyId"))?;
            if crypto.compute_kcv(key)? != kcv {
                return Err(GatewayError::config(format!("KCV mismatch for key {key}")));
            }
        }

        if self.mac && !info.mac {
            return Err(GatewayError::new(
                VerificationError::WrongMac,
                "unMAC'd message on a MAC-protected link",
            ));
        }
        if self.encrypt && !info.encrypted {
            return Err(GatewayError::crypto("plaintext message on an encrypted link"));
        }

        if info.is_protected() {
            let key = key.ok_or_else(|| {
                GatewayError::wrong_header("protected message without KeyId")
            })?;
            if info.mac {
                let mac = header.get(Tag::Mac).ok_or_else(|| {
                    GatewayError::new(VerificationError::WrongMac, "MAC flagged but missing")
                })?;
                if !crypto.verify_mac(&msg.body, mac, &key)? {
                    return Err(GatewayError::new(
                        VerificationError::WrongMac,
                        format!("MAC mismatch under key {key}"),
                    ));
                }
            }
            if info.encrypted {
                msg.body = crypto.decrypt(&msg.body, &key)?;
            }
        }

        strip_crypto(header);
        Ok(msg)
    }

    /// Serialize `msg` for this side, applying the configured protection.
    pub fn encode(&self, msg: &GatewayMessage, crypto: &dyn CryptoService) -> GatewayResult<Vec<u8>> {
        if !self.header {
            return Ok(msg.body.clone());
        }

        let mut header = msg.header.clone().unwrap_or_else(TlvFrame::new);
        strip_crypto(&mut header);
        let mut body = msg.body.clone();

        let info = CipherInfo {
            encrypted: self.encrypt,
            mac: self.mac,
        };
        if info.is_protected() {
            let key = self
                .key_id
                .as_deref()
                .map(KeyRef::new)
                .ok_or_else(|| GatewayError::config("protection configured without key_id"))?;
            if info.encrypted {
                body = crypto.encrypt(&body, &key)?;
            }
            header.put(Tag::CipherInfo, [info.to_byte()]);
            header.put(Tag::KeyId, key.as_str());
            header.put(Tag::Kcv, crypto.compute_kcv(&key)?);
            if info.mac {
                header.put(Tag::Mac, crypto.sign(&body, &key)?);
            }
        }

        GatewayMessage::with_header(header, body).to_bytes()
    }
}

fn strip_crypto(header: &mut TlvFrame) {
    for tag in CRYPTO_TAGS {
        header.remove(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NoCrypto, SoftwareCrypto};

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const OTHER: &str = "ff0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1eff";

    fn protected() -> WireProfile {
        WireProfile {
            header: true,
            encrypt: true,
            mac: true,
            key_id: Some("zpk".into()),
        }
    }

    fn routed(body: &[u8]) -> GatewayMessage {
        let mut header = TlvFrame::new();
        header.put(Tag::Nii, b"001");
        GatewayMessage::with_header(header, body.to_vec())
    }

    #[test]
    fn plain_profile_passes_body_through() {
        let bytes = WireProfile::plain().encode(&routed(b"0200"), &NoCrypto).unwrap();
        assert_eq!(bytes, b"0200");
        let msg = WireProfile::plain().decode(&bytes, &NoCrypto).unwrap();
        assert_eq!(msg, GatewayMessage::new(b"0200".to_vec()));
    }

    #[test]
    fn protected_round_trip_strips_cipher_tags() {
        let crypto = SoftwareCrypto::from_hex_keys([("zpk", KEY)]).unwrap();
        let bytes = protected().encode(&routed(b"0200sale"), &crypto).unwrap();

        let on_wire = GatewayMessage::parse(&bytes, true).unwrap();
        let header = on_wire.header.as_ref().unwrap();
        assert!(header.cipher_info().encrypted);
        assert_eq!(header.get_str(Tag::KeyId), Some("zpk"));
        assert_ne!(on_wire.body, b"0200sale");

        let decoded = protected().decode(&bytes, &crypto).unwrap();
        assert_eq!(decoded, routed(b"0200sale"));
    }

    #[test]
    fn tampered_body_is_wrong_mac() {
        let crypto = SoftwareCrypto::from_hex_keys([("zpk", KEY)]).unwrap();
        let profile = WireProfile {
            encrypt: false,
            ..protected()
        };
        let mut bytes = profile.encode(&routed(b"0200sale"), &crypto).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = profile.decode(&bytes, &crypto).unwrap_err();
        assert_eq!(err.kind, VerificationError::WrongMac);
    }

    #[test]
    fn kcv_mismatch_is_configuration_error() {
        let ours = SoftwareCrypto::from_hex_keys([("zpk", KEY)]).unwrap();
        let theirs = SoftwareCrypto::from_hex_keys([("zpk", OTHER)]).unwrap();
        let bytes = protected().encode(&routed(b"0200"), &ours).unwrap();
        let err = protected().decode(&bytes, &theirs).unwrap_err();
        assert_eq!(err.kind, VerificationError::WrongConfiguration);
    }

    #[test]
    fn mac_required_but_absent() {
        let crypto = SoftwareCrypto::from_hex_keys([("zpk", KEY)]).unwrap();
        let bytes = WireProfile::with_header().encode(&routed(b"0200"), &crypto).unwrap();
        let profile = WireProfile {
            encrypt: false,
            ..protected()
        };
        assert_eq!(
            profile.decode(&bytes, &crypto).unwrap_err().kind,
            VerificationError::WrongMac
        );
    }

    #[test]
    fn header_profile_adds_bare_frame() {
        let bytes = WireProfile::with_header()
            .encode(&GatewayMessage::new(b"0800".to_vec()), &NoCrypto)
            .unwrap();
        let msg = GatewayMessage::parse(&bytes, true).unwrap();
        assert_eq!(msg.header, Some(TlvFrame::new()));
        assert_eq!(msg.body, b"0800");
    }

    #[test]
    fn validate_rejects_impossible_profiles() {
        assert!(protected().validate().is_ok());
        let headerless = WireProfile {
            header: false,
            ..protected()
        };
        assert!(headerless.validate().is_err());
        let keyless = WireProfile {
            key_id: None,
            ..protected()
        };
        assert!(keyless.validate().is_err());
    }
}
