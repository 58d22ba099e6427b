//! Egress identity pool.
//!
//! One task owns the proxy list. Workers talk to it through a cloneable
//! [`ProxyPool`] handle: they ask for an identity and report the ones that
//! failed. When every proxy has been dropped the next acquire waits out the
//! cooldown, reloads the list from its [`ProxySource`] and carries on, so
//! callers never see the exhaustion. Cancelling the session during that
//! wait makes the acquire return [`CrawlError::Cancelled`].

use async_trait::async_trait;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CrawlError, CrawlResult, TransientKind};
use crate::scrapers::EgressIdentity;

/// Where proxy URLs come from. Read once at startup and again on every reinit.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn load(&self) -> Vec<String>;
}

/// Fixed list, typically from `HTTP_PROXY_LIST`
pub struct StaticProxies(pub Vec<String>);

#[async_trait]
impl ProxySource for StaticProxies {
    async fn load(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// One proxy URL per line; blank lines and `#` comments are skipped.
pub struct ProxyFile(pub PathBuf);

#[async_trait]
impl ProxySource for ProxyFile {
    async fn load(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.0).await {
            Ok(contents) => parse_proxy_lines(&contents),
            Err(e) => {
                warn!(path = %self.0.display(), error = %e, "Could not read proxy file");
                Vec::new()
            }
        }
    }
}

fn parse_proxy_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Snapshot of the pool, for logs and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub reinits: u64,
    /// No proxies were configured; every request goes out directly
    pub direct: bool,
}

enum PoolCommand {
    /// `None` answers an acquire that was cancelled mid-cooldown
    Acquire(oneshot::Sender<Option<EgressIdentity>>),
    Drop(EgressIdentity),
    Stats(oneshot::Sender<PoolStats>),
}

/// Handle to the pool task
#[derive(Clone)]
pub struct ProxyPool {
    tx: mpsc::Sender<PoolCommand>,
}

impl ProxyPool {
    /// Load the initial list and start the pool task. An empty initial list
    /// puts the pool in direct mode for the rest of the session.
    pub async fn spawn(
        source: Arc<dyn ProxySource>,
        cooldown: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let initial = source.load().await;
        let direct = initial.is_empty();
        if direct {
            info!("No proxies configured, requests go out directly");
        } else {
            info!(proxies = initial.len(), "Proxy pool loaded");
        }

        let (tx, rx) = mpsc::channel(64);
        let actor = PoolActor {
            source,
            proxies: initial.into_iter().map(EgressIdentity::Proxy).collect(),
            direct,
            reinits: 0,
            cooldown,
            cancel,
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Next identity to send a request through. Waits through a cooldown and
    /// reload if the pool is empty.
    pub async fn acquire(&self) -> CrawlResult<EgressIdentity> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(PoolCommand::Acquire(reply))
            .await
            .map_err(|_| pool_stopped())?;
        response
            .await
            .map_err(|_| pool_stopped())?
            .ok_or(CrawlError::Cancelled)
    }

    /// Tell the pool a request through `identity` failed. Only failures that
    /// implicate the egress remove it.
    pub async fn report_failure(&self, identity: &EgressIdentity, kind: TransientKind) {
        if !kind.implicates_egress() || *identity == EgressIdentity::Direct {
            return;
        }
        // A stopped pool has nothing left to drop from
        let _ = self.tx.send(PoolCommand::Drop(identity.clone())).await;
    }

    pub async fn stats(&self) -> CrawlResult<PoolStats> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(PoolCommand::Stats(reply))
            .await
            .map_err(|_| pool_stopped())?;
        response.await.map_err(|_| pool_stopped())
    }
}

fn pool_stopped() -> CrawlError {
    CrawlError::fatal("proxy pool stopped")
}

struct PoolActor {
    source: Arc<dyn ProxySource>,
    proxies: Vec<EgressIdentity>,
    direct: bool,
    reinits: u64,
    cooldown: Duration,
    cancel: CancellationToken,
}

impl PoolActor {
    async fn run(mut self, mut rx: mpsc::Receiver<PoolCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PoolCommand::Acquire(reply) => {
                    let _ = reply.send(self.next_identity().await);
                }
                PoolCommand::Drop(identity) => self.drop_identity(&identity),
                PoolCommand::Stats(reply) => {
                    let _ = reply.send(PoolStats {
                        available: self.proxies.len(),
                        reinits: self.reinits,
                        direct: self.direct,
                    });
                }
            }
        }
        debug!("Proxy pool stopped");
    }

    async fn next_identity(&mut self) -> Option<EgressIdentity> {
        if self.direct {
            return Some(EgressIdentity::Direct);
        }
        while self.proxies.is_empty() {
            warn!(
                cooldown_secs = self.cooldown.as_secs(),
                "Proxy pool exhausted, waiting before reload"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.cooldown) => {}
            }
            self.proxies = self
                .source
                .load()
                .await
                .into_iter()
                .map(EgressIdentity::Proxy)
                .collect();
            self.reinits += 1;
            info!(
                proxies = self.proxies.len(),
                reinits = self.reinits,
                "Proxy pool reloaded"
            );
        }
        let index = rand::thread_rng().gen_range(0..self.proxies.len());
        Some(self.proxies[index].clone())
    }

    fn drop_identity(&mut self, identity: &EgressIdentity) {
        let before = self.proxies.len();
        self.proxies.retain(|p| p != identity);
        if self.proxies.len() < before {
            info!(
                proxy = identity.label(),
                remaining = self.proxies.len(),
                "Dropped failing proxy"
            );
        }
    }
}
