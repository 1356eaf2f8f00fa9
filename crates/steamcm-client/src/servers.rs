//! Server list manager.
//!
//! Keeps a scored pool of CM addresses bootstrapped from the directory web
//! API. Health updates are appended rather than applied in place; the latest
//! entry per address is the one that counts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use steamcm_core::{CmError, CmResult};

use crate::config::ClientConfig;
use crate::transport::websocket::cm_socket_url;

/// Result code the directory returns on success.
const DIRECTORY_OK: i32 = 1;

/// Response header carrying the CM's self-reported load.
const CM_LOAD_HEADER: &str = "X-Steam-CMLoad";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Good,
    Bad,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerCandidate {
    /// `host:port`
    pub address: String,
    pub quality: Quality,
    /// Lower is better.
    pub score: f64,
}

impl ServerCandidate {
    pub fn good(address: impl Into<String>, score: f64) -> Self {
        Self {
            address: address.into(),
            quality: Quality::Good,
            score,
        }
    }

    /// WebSocket endpoint for this server.
    pub fn websocket_url(&self) -> String {
        cm_socket_url(&self.address)
    }
}

/// Parsed directory answer.
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub result: i32,
    pub message: String,
    pub servers: Vec<String>,
}

/// Outcome of one latency probe.
#[derive(Debug, Clone, Copy)]
pub struct PingReport {
    pub load: f64,
    pub latency: Duration,
}

impl PingReport {
    pub fn score(&self) -> f64 {
        self.load * 2.0 + self.latency.as_secs_f64()
    }
}

/// HTTP side of the server list: bootstrap fetch and latency probes.
pub trait DirectoryClient: Send + Sync {
    fn fetch_server_list(
        &self,
        cell_id: u32,
    ) -> Pin<Box<dyn Future<Output = CmResult<DirectoryListing>> + Send + '_>>;

    fn ping<'a>(
        &'a self,
        address: &'a str,
    ) -> Pin<Box<dyn Future<Output = CmResult<PingReport>> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
struct DirectoryEnvelope {
    response: DirectoryBody,
}

#[derive(Debug, Deserialize)]
struct DirectoryBody {
    #[serde(default)]
    result: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    serverlist_websockets: Vec<String>,
}

/// `reqwest`-backed directory client.
pub struct HttpDirectory {
    url: String,
    http_client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl DirectoryClient for HttpDirectory {
    fn fetch_server_list(
        &self,
        cell_id: u32,
    ) -> Pin<Box<dyn Future<Output = CmResult<DirectoryListing>> + Send + '_>> {
        Box::pin(async move {
            debug!(url = %self.url, cell_id, "fetching CM list");
            let response = self
                .http_client
                .get(&self.url)
                .query(&[("cellid", cell_id)])
                .send()
                .await
                .map_err(|e| CmError::Directory(format!("request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(CmError::Directory(format!(
                    "directory returned HTTP {}",
                    response.status()
                )));
            }

            let body: DirectoryEnvelope = response
                .json()
                .await
                .map_err(|e| CmError::Directory(format!("bad directory response: {e}")))?;

            Ok(DirectoryListing {
                result: body.response.result,
                message: body.response.message,
                servers: body.response.serverlist_websockets,
            })
        })
    }

    fn ping<'a>(
        &'a self,
        address: &'a str,
    ) -> Pin<Box<dyn Future<Output = CmResult<PingReport>> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let response = self
                .http_client
                .get(format!("https://{address}/cmping/"))
                .send()
                .await
                .map_err(|e| CmError::Directory(format!("ping {address}: {e}")))?;
            let latency = started.elapsed();

            if !response.status().is_success() {
                return Err(CmError::Directory(format!(
                    "ping {address}: HTTP {}",
                    response.status()
                )));
            }

            let load = response
                .headers()
                .get(CM_LOAD_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .ok_or_else(|| CmError::Directory(format!("ping {address}: no load header")))?;

            Ok(PingReport { load, latency })
        })
    }
}

/// Scored pool of candidate servers.
pub struct ServerList {
    /// Append-only health log.
    entries: Mutex<Vec<ServerCandidate>>,
    directory: Arc<dyn DirectoryClient>,
    cell_id: u32,
    probe_count: usize,
}

impl ServerList {
    pub fn new(directory: Arc<dyn DirectoryClient>, cell_id: u32, probe_count: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            directory,
            cell_id,
            probe_count,
        }
    }

    /// A list backed by the HTTP directory named in `config`.
    pub fn from_config(config: &ClientConfig) -> Self {
        let directory = HttpDirectory::new(config.directory.url.clone(), config.http_timeout());
        Self::new(
            Arc::new(directory),
            config.directory.cell_id,
            config.directory.probe_count,
        )
    }

    /// Bootstrap from the directory. On failure the current list is left
    /// untouched and `false` is returned.
    pub async fn fetch_servers_from_api(&self, cell_id: u32) -> bool {
        let listing = match self.directory.fetch_server_list(cell_id).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "server list bootstrap failed");
                return false;
            }
        };

        if listing.result != DIRECTORY_OK {
            warn!(
                result = listing.result,
                message = %listing.message,
                "directory returned an error result"
            );
            return false;
        }

        let mut entries = self.entries.lock().await;
        entries.clear();
        entries.extend(
            listing
                .servers
                .into_iter()
                .map(|address| ServerCandidate::good(address, 0.0)),
        );
        info!(count = entries.len(), cell_id, "server list bootstrapped");
        true
    }

    /// Empty the list and immediately bootstrap again.
    pub async fn clear(&self) -> bool {
        self.entries.lock().await.clear();
        self.fetch_servers_from_api(self.cell_id).await
    }

    /// Latest entry per address, in first-seen order.
    pub async fn current(&self) -> Vec<ServerCandidate> {
        let entries = self.entries.lock().await;
        latest_per_address(&entries)
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn mark_good(&self, address: &str, score: f64) {
        let mut entries = self.entries.lock().await;
        append(&mut entries, ServerCandidate::good(address, score));
    }

    pub async fn mark_bad(&self, address: &str) {
        let mut entries = self.entries.lock().await;
        let score = entries
            .iter()
            .rev()
            .find(|c| c.address == address)
            .map(|c| c.score)
            .unwrap_or(0.0);
        debug!(address, "marking server bad");
        append(
            &mut entries,
            ServerCandidate {
                address: address.to_string(),
                quality: Quality::Bad,
                score,
            },
        );
    }

    /// Flip every entry back to Good.
    pub async fn reset_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            entry.quality = Quality::Good;
        }
    }

    /// Append addresses pushed by the server itself.
    pub async fn extend(&self, addresses: impl IntoIterator<Item = String>) {
        let mut entries = self.entries.lock().await;
        let known: Vec<String> = latest_per_address(&entries)
            .into_iter()
            .map(|c| c.address)
            .collect();
        for address in addresses {
            if !known.contains(&address) {
                append(&mut entries, ServerCandidate::good(address, 0.0));
            }
        }
    }

    /// Good candidates, probed and sorted by ascending score.
    ///
    /// With no Good entries, every entry is reset to Good; with no entries at
    /// all, the list is bootstrapped. An empty result after that is
    /// [`CmError::NoServersFound`].
    pub async fn best_candidates(&self) -> CmResult<Vec<ServerCandidate>> {
        let mut good: Vec<ServerCandidate> = self
            .current()
            .await
            .into_iter()
            .filter(|c| c.quality == Quality::Good)
            .collect();

        if good.is_empty() {
            self.reset_all().await;
            if self.is_empty().await {
                self.fetch_servers_from_api(self.cell_id).await;
            }
            good = self.current().await;
        }

        if good.is_empty() {
            return Err(CmError::NoServersFound);
        }

        good.shuffle(&mut rand::thread_rng());
        good.truncate(self.probe_count.max(1));

        let directory = self.directory.clone();
        let reports = join_all(good.iter().map(|c| directory.ping(&c.address))).await;

        let mut scored = Vec::with_capacity(good.len());
        for (candidate, report) in good.iter().zip(reports) {
            match report {
                Ok(report) => {
                    let score = report.score();
                    self.mark_good(&candidate.address, score).await;
                    scored.push(ServerCandidate::good(candidate.address.clone(), score));
                }
                Err(e) => {
                    debug!(address = %candidate.address, error = %e, "probe failed");
                    self.mark_bad(&candidate.address).await;
                }
            }
        }

        if scored.is_empty() {
            // Every probe failed; the HTTP side may be blocked while the
            // socket side still works, so hand back the unprobed set.
            warn!(count = good.len(), "all server probes failed");
            return Ok(good);
        }

        scored.sort_by(|a, b| a.score.total_cmp(&b.score));
        Ok(scored)
    }
}

/// Health-log length past which superseded entries are dropped.
const HISTORY_LIMIT: usize = 256;

/// Push onto the health log, folding it to the latest entry per address once
/// it outgrows [`HISTORY_LIMIT`].
fn append(entries: &mut Vec<ServerCandidate>, candidate: ServerCandidate) {
    entries.push(candidate);
    if entries.len() > HISTORY_LIMIT {
        let before = entries.len();
        *entries = latest_per_address(entries);
        debug!(before, after = entries.len(), "compacted server health log");
    }
}

fn latest_per_address(entries: &[ServerCandidate]) -> Vec<ServerCandidate> {
    let mut order: Vec<&str> = Vec::new();
    let mut latest: HashMap<&str, &ServerCandidate> = HashMap::new();
    for entry in entries {
        if latest.insert(&entry.address, entry).is_none() {
            order.push(&entry.address);
        }
    }
    order
        .into_iter()
        .filter_map(|a| latest.get(a).map(|c| (*c).clone()))
        .collect()
}
