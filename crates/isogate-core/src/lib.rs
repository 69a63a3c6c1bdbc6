//! isogate-core: wire layer shared by gateway instances.
//!
//! Provides the TLV header codec, length-prefixed message framing, the
//! `VerificationError` taxonomy, the crypto service port and per-side wire
//! profiles.

pub mod crypto;
pub mod error;
pub mod framing;
pub mod message;
pub mod tlv;
pub mod wire;

// Re-export commonly used items at crate root.
pub use crypto::{CryptoService, KeyRef, NoCrypto, SoftwareCrypto};
pub use error::{GatewayError, GatewayResult, Side, VerificationError};
pub use framing::{frame_encode, write_message, FrameDecoder, LengthHeader, MessageReader};
pub use message::{GatewayMessage, Nii};
pub use tlv::{read_frame, write_frame, CipherInfo, Tag, TlvFrame};
pub use wire::WireProfile;
