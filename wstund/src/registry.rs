//! Token registry: the canonical map of live tunnels, per-token client
//! accounting, and the idle reaper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use wstun_task::{ChildTask, ShutdownSignal, Task};

use crate::config::Conf;
use crate::token::Token;
use crate::tunnel::RemoteServer;

/// Tunnels idle longer than this are unlinked and their queues failed.
pub const TUNNEL_INACTIVE_KILL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[error("maximum number of clients ({limit}) reached for this token")]
pub struct ClientCapReached {
    pub limit: usize,
}

pub struct Registry {
    servers: Mutex<HashMap<Token, Arc<RemoteServer>>>,
    clients: RwLock<HashMap<Token, usize>>,
    /// Read-mostly; populated once at startup.
    passwords: HashMap<Token, String>,
    queue_capacity: usize,
    max_clients_per_token: usize,
}

impl Registry {
    pub fn new(conf: &Conf) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            passwords: conf.passwords.clone(),
            queue_capacity: conf.queue_capacity(),
            max_clients_per_token: conf.max_clients_per_token,
        })
    }

    /// Looks up the tunnel for `token`, constructing a fresh one when
    /// `create` is set. No I/O happens under the registry lock.
    pub fn get(&self, token: &Token, create: bool) -> Option<Arc<RemoteServer>> {
        if create {
            return Some(self.get_or_create(token));
        }
        match self.servers.lock().get(token) {
            Some(rs) => {
                debug!(token = %token.cut(), "tunnel exists");
                Some(Arc::clone(rs))
            }
            None => {
                info!(token = %token.cut(), "tunnel not found");
                None
            }
        }
    }

    pub fn get_or_create(&self, token: &Token) -> Arc<RemoteServer> {
        let mut servers = self.servers.lock();
        if let Some(rs) = servers.get(token) {
            debug!(token = %token.cut(), "tunnel exists");
            return Arc::clone(rs);
        }
        let rs = RemoteServer::new(token.clone(), self.queue_capacity);
        servers.insert(token.clone(), Arc::clone(&rs));
        info!(token = %token.cut(), "new tunnel created");
        rs
    }

    pub fn tunnel_count(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn snapshot(&self) -> Vec<Arc<RemoteServer>> {
        self.servers.lock().values().cloned().collect()
    }

    pub fn password_for(&self, token: &Token) -> Option<&str> {
        self.passwords.get(token).map(String::as_str)
    }

    /// Live client count per token plus the total, for `/_stats`.
    pub fn client_counts(&self) -> (Vec<(Token, usize)>, usize) {
        let clients = self.clients.read();
        let list: Vec<_> = clients.iter().map(|(t, c)| (t.clone(), *c)).collect();
        let total = list.iter().map(|(_, c)| c).sum();
        (list, total)
    }

    /// Reserves one client slot for `token` ahead of the websocket upgrade.
    ///
    /// Returns `Ok(None)` when no limit is configured. The returned guard
    /// decrements the count exactly once on drop, which doubles as the
    /// rollback when the handshake fails before the tunnel loops start.
    pub fn try_reserve_client(self: &Arc<Self>, token: &Token) -> Result<Option<ClientSlot>, ClientCapReached> {
        let limit = self.max_clients_per_token;
        if limit == 0 {
            return Ok(None);
        }

        // Cheap read-path refusal first; the write lock re-checks because
        // another upgrade may have taken the last slot in between.
        if self.clients.read().get(token).copied().unwrap_or(0) >= limit {
            return Err(ClientCapReached { limit });
        }

        let mut clients = self.clients.write();
        let count = clients.entry(token.clone()).or_insert(0);
        if *count >= limit {
            return Err(ClientCapReached { limit });
        }
        *count += 1;

        Ok(Some(ClientSlot {
            registry: Arc::clone(self),
            token: token.clone(),
        }))
    }

    fn release_client(&self, token: &Token) {
        let mut clients = self.clients.write();
        if let Some(count) = clients.get_mut(token) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                clients.remove(token);
            }
        }
    }

    /// Unlinks and returns every tunnel idle beyond the kill timeout.
    fn collect_expired(&self) -> Vec<Arc<RemoteServer>> {
        let mut servers = self.servers.lock();
        let expired: Vec<Token> = servers
            .iter()
            .filter(|(_, rs)| {
                rs.idle_duration()
                    .map(|idle| idle > TUNNEL_INACTIVE_KILL_TIMEOUT)
                    .unwrap_or(false)
            })
            .map(|(token, _)| token.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|token| {
                warn!(token = %token.cut(), "tunnel not seen for a long time, deleting");
                servers.remove(&token)
            })
            .collect()
    }
}

/// RAII client-count reservation; see [`Registry::try_reserve_client`].
pub struct ClientSlot {
    registry: Arc<Registry>,
    token: Token,
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.registry.release_client(&self.token);
    }
}

/// Background task killing tunnels that have been idle for a long time.
pub struct IdleReaperTask {
    pub registry: Arc<Registry>,
}

#[async_trait]
impl Task for IdleReaperTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "idle tunnel reaper";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("task started");
        loop {
            for rs in self.registry.collect_expired() {
                // Queue draining delivers errors to waiting callers; keep it
                // off the reaper's own loop.
                ChildTask::spawn(async move { rs.abort_pending() }).detach();
            }

            tokio::select! {
                _ = tokio::time::sleep(REAPER_INTERVAL) => {}
                _ = shutdown_signal.wait() => break,
            }
        }
        debug!("task terminated");
        Ok(())
    }
}
