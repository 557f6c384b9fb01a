//! Refreshable media-server connection info.
//!
//! Uploads need a short-lived auth token and an ordered host list,
//! both handed out by the signaling layer. The cache keeps the last
//! response until its ttl runs out and serialises concurrent refreshes
//! so parallel uploads don't stampede the token endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::TransportError;

/// One upload host, in server-preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHost {
    /// Hostname to POST to.
    pub hostname: String,
    /// Largest body this host accepts, if it declared one.
    pub max_content_length: Option<u64>,
}

impl UploadHost {
    /// A host without a declared size limit.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            max_content_length: None,
        }
    }
}

/// Media-server connection info with a limited lifetime.
#[derive(Debug, Clone)]
pub struct MediaConn {
    /// Auth token to attach to upload requests.
    pub auth: String,
    /// Upload hosts in preference order.
    pub hosts: Vec<UploadHost>,
    /// How long this record stays valid.
    pub ttl: Duration,
    /// When this record was fetched.
    pub fetched_at: Instant,
}

impl MediaConn {
    /// Build a record stamped with the current time.
    pub fn new(auth: impl Into<String>, hosts: Vec<UploadHost>, ttl: Duration) -> Self {
        Self {
            auth: auth.into(),
            hosts,
            ttl,
            fetched_at: Instant::now(),
        }
    }

    /// Whether the ttl has run out.
    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// Where fresh connection info comes from (the signaling layer).
#[async_trait]
pub trait MediaConnSource: Send + Sync {
    /// Fetch a fresh connection record.
    async fn fetch(&self) -> Result<MediaConn, TransportError>;
}

/// Caches the last [`MediaConn`] and serialises refreshes.
pub struct MediaConnCache<S> {
    source: S,
    cached: Mutex<Option<MediaConn>>,
}

impl<S> MediaConnCache<S>
where
    S: MediaConnSource,
{
    /// Wrap a connection source.
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Get connection info, refreshing when forced or expired.
    ///
    /// Holding the lock across the fetch means concurrent callers wait
    /// for one refresh instead of issuing their own.
    pub async fn get(&self, force: bool) -> Result<MediaConn, TransportError> {
        let mut cached = self.cached.lock().await;
        if !force {
            if let Some(conn) = cached.as_ref() {
                if !conn.is_expired() {
                    return Ok(conn.clone());
                }
            }
        }
        tracing::debug!(target: "wamedia_net::conn", force, "refreshing media connection");
        let fresh = self.source.fetch().await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}
