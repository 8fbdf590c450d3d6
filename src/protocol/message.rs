//! Agent message types and the few payload layouts the switcher inspects.

use thiserror::Error;

use super::fingerprint;

/// Agent protocol message numbers (draft-miller-ssh-agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Failure = 5,
    Success = 6,
    RequestIdentities = 11,
    IdentitiesAnswer = 12,
    SignRequest = 13,
    SignResponse = 14,
    AddIdentity = 17,
    RemoveIdentity = 18,
    RemoveAllIdentities = 19,
    AddSmartcardKey = 20,
    RemoveSmartcardKey = 21,
    Lock = 22,
    Unlock = 23,
    AddIdConstrained = 25,
    AddSmartcardKeyConstrained = 26,
    Extension = 27,
    ExtensionFailure = 28,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let msg = match value {
            5 => Self::Failure,
            6 => Self::Success,
            11 => Self::RequestIdentities,
            12 => Self::IdentitiesAnswer,
            13 => Self::SignRequest,
            14 => Self::SignResponse,
            17 => Self::AddIdentity,
            18 => Self::RemoveIdentity,
            19 => Self::RemoveAllIdentities,
            20 => Self::AddSmartcardKey,
            21 => Self::RemoveSmartcardKey,
            22 => Self::Lock,
            23 => Self::Unlock,
            25 => Self::AddIdConstrained,
            26 => Self::AddSmartcardKeyConstrained,
            27 => Self::Extension,
            28 => Self::ExtensionFailure,
            _ => return None,
        };
        Some(msg)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Success => "success",
            Self::RequestIdentities => "request-identities",
            Self::IdentitiesAnswer => "identities-answer",
            Self::SignRequest => "sign-request",
            Self::SignResponse => "sign-response",
            Self::AddIdentity => "add-identity",
            Self::RemoveIdentity => "remove-identity",
            Self::RemoveAllIdentities => "remove-all-identities",
            Self::AddSmartcardKey => "add-smartcard-key",
            Self::RemoveSmartcardKey => "remove-smartcard-key",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::AddIdConstrained => "add-identity-constrained",
            Self::AddSmartcardKeyConstrained => "add-smartcard-key-constrained",
            Self::Extension => "extension",
            Self::ExtensionFailure => "extension-failure",
        }
    }
}

/// Display name for a raw message number, for logging.
pub fn message_name(value: u8) -> &'static str {
    MessageType::from_u8(value).map_or("unknown", MessageType::name)
}

/// Errors raised while parsing a message payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("payload ended while reading {what}")]
    ShortPayload { what: &'static str },

    #[error("{count} trailing bytes after identities list")]
    TrailingBytes { count: usize },
}

/// A public key advertised by some agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    pub comment: Vec<u8>,
    pub fingerprint: String,
}

impl Identity {
    pub fn new(key_blob: Vec<u8>, comment: impl Into<Vec<u8>>) -> Self {
        let fingerprint = fingerprint(&key_blob);
        Self {
            key_blob,
            comment: comment.into(),
            fingerprint,
        }
    }

    pub fn comment_lossy(&self) -> String {
        String::from_utf8_lossy(&self.comment).into_owned()
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u32(&mut self, what: &'static str) -> Result<u32, MessageError> {
        if self.buf.len() < 4 {
            return Err(MessageError::ShortPayload { what });
        }
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn string(&mut self, what: &'static str) -> Result<&'a [u8], MessageError> {
        let len = self.u32(what)? as usize;
        if self.buf.len() < len {
            return Err(MessageError::ShortPayload { what });
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }
}

fn put_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Parse the payload of an `SSH_AGENT_IDENTITIES_ANSWER`.
pub fn decode_identities(payload: &[u8]) -> Result<Vec<Identity>, MessageError> {
    let mut reader = Reader { buf: payload };
    let count = reader.u32("key count")?;

    // Cap the preallocation: the count comes from the peer.
    let mut identities = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let key_blob = reader.string("key blob")?.to_vec();
        let comment = reader.string("key comment")?.to_vec();
        identities.push(Identity::new(key_blob, comment));
    }

    if !reader.buf.is_empty() {
        return Err(MessageError::TrailingBytes {
            count: reader.buf.len(),
        });
    }
    Ok(identities)
}

/// Build the payload of an `SSH_AGENT_IDENTITIES_ANSWER`.
pub fn encode_identities<'a, I>(identities: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Identity>,
{
    let mut body = Vec::new();
    let mut count: u32 = 0;
    for identity in identities {
        put_string(&mut body, &identity.key_blob);
        put_string(&mut body, &identity.comment);
        count += 1;
    }

    let mut payload = Vec::with_capacity(body.len() + 4);
    payload.extend_from_slice(&count.to_be_bytes());
    payload.extend(body);
    payload
}

/// Key blob at the start of a sign or remove-identity payload.
pub fn leading_key_blob(payload: &[u8]) -> Result<&[u8], MessageError> {
    Reader { buf: payload }.string("key blob")
}
