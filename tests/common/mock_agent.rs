//! Mock SSH agent serving the agent protocol on a Unix socket.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ssh_agent_switcher::protocol::{
    encode_identities, read_frame, write_frame, Frame, Identity, MessageType,
    DEFAULT_MAX_FRAME_LEN,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex};

#[derive(Clone)]
struct MockState {
    name: String,
    identities: Arc<Mutex<Vec<Identity>>>,
    requests: Arc<Mutex<Vec<Frame>>>,
    replies: Arc<Mutex<VecDeque<Frame>>>,
    delay_ms: Arc<AtomicU64>,
}

/// A fake forwarded agent living at `<root>/<dir>/agent.<n>`.
///
/// Answers identity requests from its key list, signs with a reply naming the
/// agent, and answers everything else with queued replies or SUCCESS.
pub struct MockAgent {
    pub path: PathBuf,
    state: MockState,
    shutdown: watch::Sender<bool>,
}

impl MockAgent {
    /// Start an agent in a fresh `ssh-<name>` session directory under `root`.
    pub async fn start(root: &Path, name: &str, identities: Vec<Identity>) -> Self {
        let dir = root.join(format!("ssh-{name}"));
        std::fs::create_dir_all(&dir).expect("create agent dir");
        let path = dir.join("agent.1000");
        let listener = UnixListener::bind(&path).expect("bind mock agent");

        let state = MockState {
            name: name.to_string(),
            identities: Arc::new(Mutex::new(identities)),
            requests: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            delay_ms: Arc::new(AtomicU64::new(0)),
        };
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let serve_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(serve(stream, serve_state.clone()));
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self {
            path,
            state,
            shutdown: shutdown_tx,
        }
    }

    /// Delay every reply by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Reply with `frame` to the next request that is not an identity listing.
    pub async fn enqueue_reply(&self, frame: Frame) {
        self.state.replies.lock().await.push_back(frame);
    }

    pub async fn set_identities(&self, identities: Vec<Identity>) {
        *self.state.identities.lock().await = identities;
    }

    pub async fn captured_requests(&self) -> Vec<Frame> {
        self.state.requests.lock().await.clone()
    }

    /// Captured requests of one type.
    pub async fn received(&self, msg_type: MessageType) -> Vec<Frame> {
        self.captured_requests()
            .await
            .into_iter()
            .filter(|frame| frame.is(msg_type))
            .collect()
    }

    pub async fn clear(&self) {
        self.state.requests.lock().await.clear();
        self.state.replies.lock().await.clear();
    }

    /// The reply payload this agent produces for sign requests.
    pub fn signature(&self) -> Vec<u8> {
        signature_for(&self.state.name)
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn signature_for(name: &str) -> Vec<u8> {
    format!("signed-by-{name}").into_bytes()
}

async fn serve(mut stream: UnixStream, state: MockState) {
    while let Ok(Some(request)) = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await {
        state.requests.lock().await.push(request.clone());

        let delay = state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let reply = if request.is(MessageType::RequestIdentities) {
            let identities = state.identities.lock().await;
            Frame::new(
                MessageType::IdentitiesAnswer as u8,
                encode_identities(identities.iter()),
            )
        } else if let Some(reply) = state.replies.lock().await.pop_front() {
            reply
        } else if request.is(MessageType::SignRequest) {
            Frame::new(MessageType::SignResponse as u8, signature_for(&state.name))
        } else {
            Frame::success()
        };

        if write_frame(&mut stream, &reply).await.is_err() {
            break;
        }
    }
}
