//! Request classification and dispatch across backends.
//!
//! Every client request takes one of four paths:
//!
//! - identities are gathered from all backends and merged,
//! - administrative requests (lock, unlock, remove-all, extensions) are
//!   broadcast and their results aggregated,
//! - key-specific requests (sign, remove) go to the single backend that owns
//!   the key, or fail without contacting anyone,
//! - add-key requests go to the primary backend.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backend::{BackendAgent, BackendError, BackendRegistry};
use crate::protocol::{
    decode_identities, encode_identities, fingerprint, leading_key_blob, message_name, Frame,
    Identity, MessageType,
};
use crate::proxy::error::RouterError;

/// How a request is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Ask every backend, merge the identity lists.
    MergeIdentities,
    /// Deliver to every backend; success only if all reachable ones agree.
    Broadcast,
    /// Deliver to the backend owning the key blob at the head of the payload.
    ByKey,
    /// Deliver to the first-discovered backend.
    Primary,
}

/// Pick the delivery strategy for a client message type.
pub fn classify(msg_type: u8) -> Result<Strategy, RouterError> {
    use MessageType::*;

    let strategy = match MessageType::from_u8(msg_type) {
        Some(RequestIdentities) => Strategy::MergeIdentities,
        Some(SignRequest | RemoveIdentity) => Strategy::ByKey,
        Some(RemoveAllIdentities | RemoveSmartcardKey | Lock | Unlock | Extension) => {
            Strategy::Broadcast
        }
        Some(AddIdentity | AddIdConstrained | AddSmartcardKey | AddSmartcardKeyConstrained) => {
            Strategy::Primary
        }
        _ => return Err(RouterError::UnsupportedMessage { msg_type }),
    };
    Ok(strategy)
}

/// Routes decoded client frames to backends.
#[derive(Clone)]
pub struct RequestRouter {
    registry: BackendRegistry,
}

impl RequestRouter {
    pub fn new(registry: BackendRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Produce the reply for one client frame.
    ///
    /// Only an unclassifiable frame is an error; backend trouble is turned
    /// into protocol failure replies.
    pub async fn route(&self, session: &str, frame: Frame) -> Result<Frame, RouterError> {
        let strategy = classify(frame.msg_type)?;
        let msg = message_name(frame.msg_type);

        let reply = match strategy {
            Strategy::MergeIdentities => self.merge_identities(session).await,
            Strategy::Broadcast => self.broadcast(session, msg, &frame).await,
            Strategy::ByKey => self.forward_by_key(session, msg, frame).await,
            Strategy::Primary => self.forward_to_primary(session, msg, frame).await,
        };
        Ok(reply)
    }

    async fn merge_identities(&self, session: &str) -> Frame {
        let backends = self.registry.current_backends();
        let request = Frame::bare(MessageType::RequestIdentities);
        let replies = self.scatter(&backends, &request).await;

        let mut seen = HashSet::new();
        let mut merged: Vec<Identity> = Vec::new();
        let mut updates = Vec::new();

        for (backend, reply) in replies {
            let identities = match reply {
                Ok(reply) if reply.is(MessageType::IdentitiesAnswer) => {
                    match decode_identities(&reply.payload) {
                        Ok(identities) => identities,
                        Err(e) => {
                            warn!(
                                session,
                                backend = %backend.path().display(),
                                error = %e,
                                "Malformed identities answer"
                            );
                            continue;
                        }
                    }
                }
                Ok(reply) => {
                    warn!(
                        session,
                        backend = %backend.path().display(),
                        reply = message_name(reply.msg_type),
                        "Backend refused to list identities"
                    );
                    continue;
                }
                Err(e) => {
                    self.note_failure(session, &backend, &e);
                    continue;
                }
            };

            for identity in &identities {
                if seen.insert(identity.fingerprint.clone()) {
                    merged.push(identity.clone());
                } else {
                    debug!(
                        session,
                        fingerprint = %identity.fingerprint,
                        comment = %identity.comment_lossy(),
                        backend = %backend.path().display(),
                        "Dropping duplicate identity"
                    );
                }
            }
            updates.push((backend.path().to_path_buf(), identities));
        }

        self.registry.record_identities(updates);
        debug!(
            session,
            backends = backends.len(),
            count = merged.len(),
            "Answered request-identities"
        );
        Frame::new(
            MessageType::IdentitiesAnswer as u8,
            encode_identities(&merged),
        )
    }

    async fn broadcast(&self, session: &str, msg: &'static str, frame: &Frame) -> Frame {
        let backends = self.registry.current_backends();
        let replies = self.scatter(&backends, frame).await;

        let mut failed: Vec<PathBuf> = Vec::new();
        let mut reached = 0usize;
        for (backend, reply) in replies {
            match reply {
                Ok(reply) => {
                    reached += 1;
                    if !reply.is(MessageType::Success) {
                        warn!(
                            session,
                            msg,
                            backend = %backend.path().display(),
                            reply = message_name(reply.msg_type),
                            "Backend rejected broadcast request"
                        );
                        failed.push(backend.path().to_path_buf());
                    }
                }
                Err(e) => self.note_failure(session, &backend, &e),
            }
        }

        debug!(
            session,
            msg,
            reached,
            failed = failed.len(),
            "Broadcast request delivered"
        );
        if failed.is_empty() {
            Frame::success()
        } else {
            Frame::failure()
        }
    }

    async fn forward_by_key(&self, session: &str, msg: &'static str, frame: Frame) -> Frame {
        let key_blob = match leading_key_blob(&frame.payload) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(session, msg, error = %e, "Malformed key-specific request");
                return Frame::failure();
            }
        };
        let fingerprint = fingerprint(key_blob);

        let Some(backend) = self.registry.lookup(&fingerprint) else {
            debug!(session, msg, fingerprint = %fingerprint, "No backend holds key");
            return Frame::failure();
        };

        debug!(
            session,
            msg,
            fingerprint = %fingerprint,
            backend = %backend.path().display(),
            "Routing request"
        );
        self.forward(session, &backend, &frame).await
    }

    async fn forward_to_primary(&self, session: &str, msg: &'static str, frame: Frame) -> Frame {
        let Some(backend) = self.registry.snapshot().primary() else {
            debug!(session, msg, "No backend available");
            return Frame::failure();
        };

        debug!(
            session,
            msg,
            backend = %backend.path().display(),
            "Routing request to primary backend"
        );
        self.forward(session, &backend, &frame).await
    }

    /// Relay `frame` to one backend and its reply back, untouched.
    async fn forward(&self, session: &str, backend: &Arc<BackendAgent>, frame: &Frame) -> Frame {
        match self.registry.client().request(backend.path(), frame).await {
            Ok(reply) => {
                backend.mark_contacted();
                debug!(
                    session,
                    backend = %backend.path().display(),
                    reply = message_name(reply.msg_type),
                    "Relaying backend reply"
                );
                reply
            }
            Err(e) => {
                self.note_failure(session, backend, &e);
                Frame::failure()
            }
        }
    }

    /// Send `frame` to every backend concurrently. Replies come back in
    /// `backends` order.
    async fn scatter(
        &self,
        backends: &[Arc<BackendAgent>],
        frame: &Frame,
    ) -> Vec<(Arc<BackendAgent>, Result<Frame, BackendError>)> {
        let mut tasks = JoinSet::new();
        for (index, backend) in backends.iter().enumerate() {
            let client = self.registry.client().clone();
            let backend = Arc::clone(backend);
            let frame = frame.clone();
            tasks.spawn(async move {
                let reply = client.request(backend.path(), &frame).await;
                if reply.is_ok() {
                    backend.mark_contacted();
                }
                (index, backend, reply)
            });
        }

        let mut replies = Vec::with_capacity(backends.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reply) => replies.push(reply),
                Err(e) => warn!(error = %e, "Backend request task failed"),
            }
        }
        replies.sort_by_key(|(index, _, _)| *index);
        replies
            .into_iter()
            .map(|(_, backend, reply)| (backend, reply))
            .collect()
    }

    fn note_failure(&self, session: &str, backend: &BackendAgent, error: &BackendError) {
        if error.is_stale() {
            warn!(session, backend = %backend.path().display(), error = %error, "Backend is gone");
            self.registry.forget(backend.path());
        } else {
            warn!(
                session,
                backend = %backend.path().display(),
                error = %error,
                "Backend request failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_requests() {
        assert_eq!(classify(11).unwrap(), Strategy::MergeIdentities);
        assert_eq!(classify(13).unwrap(), Strategy::ByKey);
        assert_eq!(classify(18).unwrap(), Strategy::ByKey);
        assert_eq!(classify(19).unwrap(), Strategy::Broadcast);
        assert_eq!(classify(22).unwrap(), Strategy::Broadcast);
        assert_eq!(classify(23).unwrap(), Strategy::Broadcast);
        assert_eq!(classify(27).unwrap(), Strategy::Broadcast);
        assert_eq!(classify(17).unwrap(), Strategy::Primary);
        assert_eq!(classify(25).unwrap(), Strategy::Primary);
    }

    #[test]
    fn replies_and_unknown_types_are_rejected() {
        for msg_type in [0u8, 5, 6, 12, 14, 24, 99, 255] {
            assert!(matches!(
                classify(msg_type),
                Err(RouterError::UnsupportedMessage { .. })
            ));
        }
    }
}
