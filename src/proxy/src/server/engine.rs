use crate::backend::health::HealthRegistry;
use crate::server::notify::{AnvilClient, NotifyPipe};
use crate::server::pump::PumpStats;
use crate::server::{DIE_IDLE_SECS, KILL_PREFIX};

use common::metrics::metric_def::{PROXY_DETACHED_CONN, PROXY_PENDING_CONN};
use common::metrics::{common_labels, gauge_dec, gauge_inc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Process-wide knobs; per-session settings live on the session.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_reconnects: u32,
    /// Window over which a mass disconnect is spread; 0 disables pacing.
    pub max_disconnect_delay_secs: u64,
    pub notify_path: Option<PathBuf>,
    pub anvil_path: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_reconnects: 3,
            max_disconnect_delay_secs: 0,
            notify_path: None,
            anvil_path: None,
        }
    }
}

/// How fast a kill command takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillGrace {
    Now,
    After(Duration),
    /// Let the session compute a per-destination pacing delay.
    Paced,
}

#[derive(Debug)]
pub enum ProxyCommand {
    Kill { reason: String, grace: KillGrace },
}

struct SessionEntry {
    user: String,
    ctl: mpsc::UnboundedSender<ProxyCommand>,
    stats: Option<Arc<PumpStats>>,
    anvil_guid: Option<String>,
}

/// All process-wide login-proxy state: the destination health registry, the
/// pending and detached session tables and the per-user index. Constructed
/// explicitly at startup and shared by reference; there are no hidden
/// singletons.
pub struct ProxyEngine {
    settings: EngineSettings,
    registry: HealthRegistry,
    next_id: AtomicU64,
    pending: DashMap<u64, SessionEntry>,
    detached: DashMap<u64, SessionEntry>,
    by_user: DashMap<String, Vec<u64>>,
    notify: Option<NotifyPipe>,
    anvil: Option<AnvilClient>,
}

impl ProxyEngine {
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        let notify = settings.notify_path.as_ref().map(NotifyPipe::new);
        let anvil = settings.anvil_path.as_ref().map(AnvilClient::new);
        Arc::new(Self {
            settings,
            registry: HealthRegistry::new(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            detached: DashMap::new(),
            by_user: DashMap::new(),
            notify,
            anvil,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub(crate) fn anvil(&self) -> Option<&AnvilClient> {
        self.anvil.as_ref()
    }

    pub async fn notify_user(&self, user: &str) {
        if let Some(notify) = &self.notify {
            notify.notify(&[user]).await;
        }
    }

    pub(crate) fn register_pending(
        &self,
        user: &str,
        ctl: mpsc::UnboundedSender<ProxyCommand>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            id,
            SessionEntry {
                user: user.to_string(),
                ctl,
                stats: None,
                anvil_guid: None,
            },
        );
        gauge_inc(PROXY_PENDING_CONN, 1.0, Some(common_labels()));
        id
    }

    /// Pre-login finished: move the session to the detached table and index
    /// it by user for O(1) kicks. Happens at most once per session.
    pub(crate) fn promote(&self, id: u64, stats: Arc<PumpStats>, anvil_guid: Option<String>) {
        let Some((_, mut entry)) = self.pending.remove(&id) else {
            return;
        };
        gauge_dec(PROXY_PENDING_CONN, 1.0, Some(common_labels()));
        entry.stats = Some(stats);
        entry.anvil_guid = anvil_guid;
        self.by_user.entry(entry.user.clone()).or_default().push(id);
        self.detached.insert(id, entry);
        gauge_inc(PROXY_DETACHED_CONN, 1.0, Some(common_labels()));
    }

    pub(crate) fn remove(&self, id: u64) {
        if self.pending.remove(&id).is_some() {
            gauge_dec(PROXY_PENDING_CONN, 1.0, Some(common_labels()));
            return;
        }
        if let Some((_, entry)) = self.detached.remove(&id) {
            gauge_dec(PROXY_DETACHED_CONN, 1.0, Some(common_labels()));
            if let Some(mut ids) = self.by_user.get_mut(&entry.user) {
                ids.retain(|other| *other != id);
                let empty = ids.is_empty();
                drop(ids);
                if empty {
                    self.by_user.remove_if(&entry.user, |_, v| v.is_empty());
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }

    /// Close all of a user's proxies, optionally narrowed to one accounting
    /// GUID. Detached sessions get the paced close; pending sessions are
    /// disconnected directly. Returns how many were told to go.
    pub fn kick_user(&self, user: &str, conn_guid: Option<&str>) -> usize {
        let reason = format!("{KILL_PREFIX}Kicked by admin");
        let mut killed = 0;

        let ids = self
            .by_user
            .get(user)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        for id in ids {
            let Some(entry) = self.detached.get(&id) else {
                continue;
            };
            if conn_guid.is_some() && entry.anvil_guid.as_deref() != conn_guid {
                continue;
            }
            if entry
                .ctl
                .send(ProxyCommand::Kill {
                    reason: reason.clone(),
                    grace: KillGrace::Paced,
                })
                .is_ok()
            {
                killed += 1;
            }
        }

        for entry in self.pending.iter() {
            if entry.user != user {
                continue;
            }
            if entry
                .ctl
                .send(ProxyCommand::Kill {
                    reason: reason.clone(),
                    grace: KillGrace::Now,
                })
                .is_ok()
            {
                killed += 1;
            }
        }
        info!(user, killed, "admin kick");
        killed
    }

    /// Process shutdown: close detached sessions that have been idle for
    /// [`DIE_IDLE_SECS`], give the rest a timer for the remaining window.
    pub fn kill_idle(&self) {
        for entry in self.detached.iter() {
            let Some(stats) = &entry.stats else {
                continue;
            };
            let _ = entry.ctl.send(ProxyCommand::Kill {
                reason: "Process shutting down".to_string(),
                grace: idle_grace(stats.last_io_elapsed()),
            });
        }
    }
}

fn idle_grace(idle: Duration) -> KillGrace {
    let max_idle = Duration::from_secs(DIE_IDLE_SECS);
    if idle >= max_idle {
        KillGrace::Now
    } else {
        KillGrace::After(max_idle - idle)
    }
}
