use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ahash::AHashSet;
use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use super::Config;
use crate::{metrics::Metrics, network::ProviderDiscovery};

const MAX_QUEUED_REQUESTS: usize = 1024;

/// Runs provider discovery for root blocks on a fixed set of workers.
///
/// Requests are idempotent: a cid that is already being searched for is not queued again.
/// Found providers are forwarded on the `found` channel given to [`ProviderQueryManager::new`].
#[derive(Debug, Clone)]
pub struct ProviderQueryManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    requests: mpsc::Sender<Cid>,
    loads: Arc<Mutex<AHashSet<Cid>>>,
    cancel: CancellationToken,
}

impl ProviderQueryManager {
    pub fn new(
        discovery: Arc<dyn ProviderDiscovery>,
        config: &Config,
        found: mpsc::Sender<(Cid, PeerId)>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (requests_s, requests_r) = mpsc::channel(MAX_QUEUED_REQUESTS);
        let requests_r = Arc::new(tokio::sync::Mutex::new(requests_r));
        let loads: Arc<Mutex<AHashSet<Cid>>> = Default::default();

        for id in 0..config.provider_query_workers.max(1) {
            let worker = Worker {
                requests: requests_r.clone(),
                discovery: discovery.clone(),
                loads: loads.clone(),
                found: found.clone(),
                max_providers: config.max_providers_per_request.max(1),
                timeout: config.provider_query_timeout,
                metrics: metrics.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(
                worker
                    .run()
                    .instrument(tracing::debug_span!("provider_query", id)),
            );
        }

        ProviderQueryManager {
            inner: Arc::new(Inner {
                requests: requests_s,
                loads,
                cancel,
            }),
        }
    }

    /// Queues a search for providers of `cid`.
    ///
    /// Returns `false` if a search for `cid` is already running or the queue is full.
    pub fn find_providers(&self, cid: Cid) -> bool {
        if !self.inner.loads.lock().expect("poisoned").insert(cid) {
            trace!(%cid, "provider search already running");
            return false;
        }
        if let Err(err) = self.inner.requests.try_send(cid) {
            warn!(%cid, "failed to queue provider search: {err}");
            self.inner.loads.lock().expect("poisoned").remove(&cid);
            return false;
        }
        true
    }

    pub fn is_loading(&self, cid: &Cid) -> bool {
        self.inner.loads.lock().expect("poisoned").contains(cid)
    }

    /// Forgets all running searches, so that they can be requested again.
    pub fn reset(&self) {
        self.inner.loads.lock().expect("poisoned").clear();
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    requests: Arc<tokio::sync::Mutex<mpsc::Receiver<Cid>>>,
    discovery: Arc<dyn ProviderDiscovery>,
    loads: Arc<Mutex<AHashSet<Cid>>>,
    found: mpsc::Sender<(Cid, PeerId)>,
    max_providers: usize,
    timeout: Duration,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let cid = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                cid = async { self.requests.lock().await.recv().await } => match cid {
                    Some(cid) => cid,
                    None => break,
                },
            };
            self.find(cid).await;
            self.loads.lock().expect("poisoned").remove(&cid);
        }
        trace!("provider query worker stopped");
    }

    async fn find(&self, cid: Cid) {
        let (providers_s, mut providers_r) = mpsc::channel(self.max_providers);
        let query = self.discovery.find_providers(cid, providers_s);
        tokio::pin!(query);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut query_done = false;
        let mut count = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = &mut deadline => {
                    debug!(%cid, count, "provider search timed out");
                    return;
                }
                res = &mut query, if !query_done => {
                    query_done = true;
                    if let Err(err) = res {
                        warn!(%cid, "provider search failed: {err:#}");
                    }
                }
                peer = providers_r.recv() => {
                    let Some(peer) = peer else {
                        debug!(%cid, count, "provider search finished");
                        return;
                    };
                    count += 1;
                    self.metrics.providers_found.inc();
                    trace!(%cid, %peer, "found provider");
                    if self.found.send((cid, peer)).await.is_err() {
                        return;
                    }
                    if count >= self.max_providers {
                        return;
                    }
                }
            }
        }
    }
}
