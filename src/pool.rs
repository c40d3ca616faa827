use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{util::lock_unpoisoned, ApiClientError, Result};

/// Transport settings. Changing them replaces the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentOptions {
    /// Keep idle connections open for reuse.
    pub keep_alive: bool,
    /// Ceiling on in-flight requests per host; further requests queue.
    pub max_sockets_per_host: usize,
    /// Idle connections kept per host when `keep_alive` is on.
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Option<Duration>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            max_sockets_per_host: 64,
            max_idle_per_host: 16,
            idle_timeout: Duration::from_secs(15),
            connect_timeout: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    /// Requests holding a connection slot.
    pub active: usize,
    /// Requests waiting for a slot.
    pub queued: usize,
    pub limit: usize,
    pub completed: u64,
}

/// Pool statistics keyed by `scheme://host:port`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub hosts: BTreeMap<String, HostStats>,
}

impl PoolStats {
    /// Counters for `key` (`scheme://host:port`), if the host was ever used.
    pub fn host(&self, key: &str) -> Option<&HostStats> {
        self.hosts.get(key)
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (host, stats) in &self.hosts {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(
                f,
                "{host}: active={} queued={} limit={} completed={}",
                stats.active, stats.queued, stats.limit, stats.completed
            )?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct HostSlot {
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
}

impl HostSlot {
    fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        }
    }
}

/// Slot on a host, released on drop.
#[derive(Debug)]
pub(crate) struct HostLease {
    slot: Arc<HostSlot>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.slot.active.fetch_sub(1, Ordering::SeqCst);
        self.slot.completed.fetch_add(1, Ordering::SeqCst);
    }
}

struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Persistent-connection transport shared by every client of a factory.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    http: reqwest::Client,
    options: AgentOptions,
    hosts: Mutex<BTreeMap<String, Arc<HostSlot>>>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("options", &self.inner.options)
            .field("stats", &self.stats().to_string())
            .finish()
    }
}

impl ConnectionPool {
    /// Fails with [`ApiClientError::Config`] when `max_sockets_per_host` is zero
    /// or above what a semaphore can hold.
    pub fn new(options: AgentOptions) -> Result<Self> {
        if options.max_sockets_per_host == 0 {
            return Err(ApiClientError::Config(
                "max_sockets_per_host must be at least 1".to_owned(),
            ));
        }
        if options.max_sockets_per_host > Semaphore::MAX_PERMITS {
            return Err(ApiClientError::Config(format!(
                "max_sockets_per_host must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("intercall-http/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(options.idle_timeout);
        builder = if options.keep_alive {
            builder
                .pool_max_idle_per_host(options.max_idle_per_host)
                .tcp_keepalive(options.idle_timeout)
        } else {
            builder.pool_max_idle_per_host(0)
        };
        if let Some(timeout) = options.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| ApiClientError::Config(format!("failed to build transport: {err}")))?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                http,
                options,
                hosts: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    /// Options the transport was built with.
    pub fn options(&self) -> &AgentOptions {
        &self.inner.options
    }

    /// Whether both handles point at the same pool.
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Waits for a free slot on `host`.
    pub(crate) async fn acquire(&self, host: &str) -> Result<HostLease> {
        let slot = self.slot(host);
        slot.queued.fetch_add(1, Ordering::SeqCst);
        let permit = {
            let _queued = QueuedGuard(&slot.queued);
            Arc::clone(&slot.permits)
                .acquire_owned()
                .await
                .map_err(|_| ApiClientError::Shutdown)?
        };
        slot.active.fetch_add(1, Ordering::SeqCst);
        Ok(HostLease {
            slot,
            _permit: permit,
        })
    }

    /// Snapshot of every host seen by this pool.
    pub fn stats(&self) -> PoolStats {
        let hosts = lock_unpoisoned(&self.inner.hosts);
        PoolStats {
            hosts: hosts
                .iter()
                .map(|(host, slot)| {
                    (
                        host.clone(),
                        HostStats {
                            active: slot.active.load(Ordering::SeqCst),
                            queued: slot.queued.load(Ordering::SeqCst),
                            limit: self.inner.options.max_sockets_per_host,
                            completed: slot.completed.load(Ordering::SeqCst),
                        },
                    )
                })
                .collect(),
        }
    }

    fn slot(&self, host: &str) -> Arc<HostSlot> {
        let mut hosts = lock_unpoisoned(&self.inner.hosts);
        Arc::clone(hosts.entry(host.to_owned()).or_insert_with(|| {
            Arc::new(HostSlot::new(self.inner.options.max_sockets_per_host))
        }))
    }
}
