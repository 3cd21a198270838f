//! Per-token tunnel state: the request queue, the pending-request set, and
//! the reply channel plumbing between the public ingress and the websocket
//! writer/reader loops.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tunnel_proto::RequestId;

use crate::token::Token;

/// One request can receive more than one verdict over its lifetime (a retry
/// verdict from a dying writer, then an orphaned response from a reconnected
/// tunnel), so the reply slot keeps a little slack.
const REPLY_CHANNEL_CAPACITY: usize = 4;

/// Verdict delivered to the ingress task waiting on a tunneled request.
#[derive(Debug)]
pub enum TunnelReply {
    /// Raw HTTP/1.1 response bytes read off the tunnel.
    Response(Bytes),
    Error(TunnelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    /// The websocket write failed; the request may be replayed over whichever
    /// tunnel is attached by then.
    #[error("error sending request, please retry")]
    SendFailed,
    #[error("timeout before forwarding the request")]
    ExpiredBeforeSend,
    #[error("tunnel deleted due to inactivity, request cancelled")]
    TunnelDeleted,
}

#[derive(Debug, thiserror::Error)]
#[error("too many requests in-flight, tunnel broken?")]
pub struct QueueFull;

/// A caller request travelling through one tunnel.
pub struct TunnelRequest {
    /// Assigned on first enqueue; unset is the "not yet queued" sentinel.
    id: OnceLock<RequestId>,
    /// "METHOD target" for logs.
    pub info: String,
    /// Caller address for logs and `/_stats`.
    pub remote_addr: String,
    /// The caller's HTTP/1.1 request, serialized exactly as received.
    pub wire: Bytes,
    /// Absolute time after which the request is abandoned.
    pub deadline: tokio::time::Instant,
    reply_tx: mpsc::Sender<TunnelReply>,
}

impl TunnelRequest {
    pub fn new(
        info: String,
        remote_addr: String,
        wire: Bytes,
        deadline: tokio::time::Instant,
    ) -> (Arc<Self>, mpsc::Receiver<TunnelReply>) {
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let request = Arc::new(Self {
            id: OnceLock::new(),
            info,
            remote_addr,
            wire,
            deadline,
            reply_tx,
        });
        (request, reply_rx)
    }

    pub fn id(&self) -> Option<RequestId> {
        self.id.get().copied()
    }

    /// Non-blocking reply delivery. Returns false when the consumer is gone
    /// or saturated; the value is discarded in that case (orphan response).
    pub fn reply(&self, reply: TunnelReply) -> bool {
        self.reply_tx.try_send(reply).is_ok()
    }
}

#[derive(Debug, Default, Clone)]
pub struct RemoteInfo {
    pub remote_addr: String,
    pub remote_name: String,
    pub remote_whois: String,
    pub client_version: String,
}

struct Pending {
    last_id: RequestId,
    set: HashMap<RequestId, Arc<TunnelRequest>>,
}

/// Server-side state for one tunnel endpoint.
///
/// Shared between the registry, the per-attachment websocket tasks, and the
/// ingress handlers; the registry holds the canonical handle and the idle
/// reaper unlinks it there.
pub struct RemoteServer {
    token: Token,
    queue_tx: mpsc::Sender<Arc<TunnelRequest>>,
    /// Concurrent attachments for one token share consumption of the queue.
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<TunnelRequest>>>,
    pending: Mutex<Pending>,
    last_activity: Mutex<Option<Instant>>,
    info: RwLock<RemoteInfo>,
}

impl RemoteServer {
    pub fn new(token: Token, queue_capacity: usize) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        Arc::new(Self {
            token,
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            pending: Mutex::new(Pending {
                last_id: RequestId::ZERO,
                set: HashMap::new(),
            }),
            last_activity: Mutex::new(Some(Instant::now())),
            info: RwLock::new(RemoteInfo::default()),
        })
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Stamps an id (first time only), records the request as pending, then
    /// attempts a non-blocking enqueue. The set insertion happens before the
    /// enqueue so that a response matched by id can never race it.
    pub fn add_request(&self, request: &Arc<TunnelRequest>) -> Result<(), QueueFull> {
        let mut pending = self.pending.lock();
        let id = *request.id.get_or_init(|| {
            pending.last_id = pending.last_id.next();
            pending.last_id
        });
        pending.set.insert(id, Arc::clone(request));
        drop(pending);

        match self.queue_tx.try_send(Arc::clone(request)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => Err(QueueFull),
        }
    }

    /// Removes the request from the pending set. A response arriving for a
    /// retired id is treated as orphaned and discarded by the reader.
    pub fn retire_request(&self, request: &TunnelRequest) {
        if let Some(id) = request.id() {
            self.pending.lock().set.remove(&id);
        }
    }

    /// Fetches the next queued request. Used by attachment writer loops;
    /// cancel-safe, so it can sit in a `select!` arm.
    pub async fn dequeue(&self) -> Option<Arc<TunnelRequest>> {
        self.queue_rx.lock().await.recv().await
    }

    /// Matches an inbound response id against the pending set, bumping the
    /// activity clock as a side effect of tunnel traffic.
    pub fn match_pending(&self, id: RequestId) -> Option<Arc<TunnelRequest>> {
        let pending = self.pending.lock();
        self.touch();
        pending.set.get(&id).cloned()
    }

    /// Fails every queued (not yet transmitted) request. Run by the idle
    /// reaper after the registry entry is unlinked; in-flight requests are
    /// retired by their own ingress tasks.
    pub fn abort_pending(&self) {
        if let Ok(mut queue_rx) = self.queue_rx.try_lock() {
            while let Ok(request) = queue_rx.try_recv() {
                request.reply(TunnelReply::Error(TunnelError::TunnelDeleted));
            }
        }
        let idle_mins = self.idle_duration().map(|d| d.as_secs_f64() / 60.0);
        info!(token = %self.token.cut(), idle_mins, "tunnel closed");
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Some(Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, at: Option<Instant>) {
        *self.last_activity.lock() = at;
    }

    /// Time since the last tunnel activity, `None` if never active.
    pub fn idle_duration(&self) -> Option<Duration> {
        self.last_activity.lock().map(|at| at.elapsed())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().set.len()
    }

    /// Address of the caller behind the most recently assigned request.
    pub fn last_request_addr(&self) -> Option<String> {
        let pending = self.pending.lock();
        pending.set.get(&pending.last_id).map(|r| r.remote_addr.clone())
    }

    pub fn remote_info(&self) -> RemoteInfo {
        self.info.read().clone()
    }

    pub fn set_attachment_info(&self, remote_addr: String, client_version: String) {
        let mut info = self.info.write();
        info.remote_addr = remote_addr;
        info.client_version = client_version;
    }

    pub fn set_remote_info(&self, name: String, whois: String) {
        let mut info = self.info.write();
        info.remote_name = name;
        info.remote_whois = whois;
    }
}
