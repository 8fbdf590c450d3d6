//! SSH agent wire protocol.
//!
//! Only the framing and the handful of message layouts the switcher needs to
//! look inside are modelled here. Everything else travels as opaque bytes.

mod fingerprint;
mod frame;
mod message;

pub use fingerprint::fingerprint;
pub use frame::{read_frame, write_frame, Frame, FrameError, DEFAULT_MAX_FRAME_LEN};
pub use message::{
    decode_identities, encode_identities, leading_key_blob, message_name, Identity,
    MessageError, MessageType,
};
