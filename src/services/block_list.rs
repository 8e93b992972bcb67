//! Block list of client addresses and ranges.
//!
//! Lookups happen on every request while updates are rare administrative
//! actions, so the in-memory store keeps single addresses in a `DashMap`
//! (lock-free reads across shards) and the few CIDR ranges behind a
//! read-mostly `RwLock`.
//!
//! Entries may carry an expiry. Expired entries stop matching immediately and
//! are physically removed by the background purge.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::middleware::ip::{CidrRange, ClientIdentity};

/// One block-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    /// Address or CIDR range, with host bits cleared
    pub target: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlockEntry {
    fn new(target: &CidrRange, reason: &str, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        let expires_at = ttl.and_then(|ttl| {
            TimeDelta::from_std(ttl)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
        });

        Self {
            target: target.to_string(),
            reason: reason.to_string(),
            blocked_at: now,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Backing store for the block list.
#[async_trait]
pub trait BlockList: Send + Sync {
    /// Whether an identity is covered by any live entry.
    async fn is_blocked(&self, identity: &ClientIdentity) -> Result<bool, StoreError>;

    /// Add or replace an entry.
    async fn block(
        &self,
        target: &CidrRange,
        reason: &str,
        ttl: Option<Duration>,
    ) -> Result<BlockEntry, StoreError>;

    /// Remove an entry. Returns whether it existed.
    async fn unblock(&self, target: &CidrRange) -> Result<bool, StoreError>;

    /// Live entries, sorted by target.
    async fn entries(&self) -> Result<Vec<BlockEntry>, StoreError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// In-process block list.
#[derive(Debug, Default)]
pub struct InMemoryBlockList {
    hosts: DashMap<IpAddr, BlockEntry>,
    ranges: RwLock<Vec<(CidrRange, BlockEntry)>>,
}

impl InMemoryBlockList {
    pub fn new() -> Self {
        Self::default()
    }

    async fn is_blocked_at(&self, identity: &ClientIdentity, now: DateTime<Utc>) -> bool {
        // The unknown identity is shared by unrelated clients and never blocked
        let Some(ip) = identity.ip() else {
            return false;
        };

        if self
            .hosts
            .get(&ip)
            .is_some_and(|entry| !entry.is_expired_at(now))
        {
            return true;
        }

        self.ranges
            .read()
            .await
            .iter()
            .any(|(range, entry)| range.contains(&ip) && !entry.is_expired_at(now))
    }

    async fn block_at(
        &self,
        target: &CidrRange,
        reason: &str,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> BlockEntry {
        let entry = BlockEntry::new(target, reason, ttl, now);

        if target.is_single_host() {
            self.hosts.insert(target.network(), entry.clone());
        } else {
            let mut ranges = self.ranges.write().await;
            ranges.retain(|(range, _)| range != target);
            ranges.push((target.clone(), entry.clone()));
        }

        entry
    }

    async fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let hosts_before = self.hosts.len();
        self.hosts.retain(|_, entry| !entry.is_expired_at(now));
        let mut removed = hosts_before.saturating_sub(self.hosts.len());

        let mut ranges = self.ranges.write().await;
        let ranges_before = ranges.len();
        ranges.retain(|(_, entry)| !entry.is_expired_at(now));
        removed += ranges_before.saturating_sub(ranges.len());

        removed
    }
}

#[async_trait]
impl BlockList for InMemoryBlockList {
    async fn is_blocked(&self, identity: &ClientIdentity) -> Result<bool, StoreError> {
        Ok(self.is_blocked_at(identity, Utc::now()).await)
    }

    async fn block(
        &self,
        target: &CidrRange,
        reason: &str,
        ttl: Option<Duration>,
    ) -> Result<BlockEntry, StoreError> {
        Ok(self.block_at(target, reason, ttl, Utc::now()).await)
    }

    async fn unblock(&self, target: &CidrRange) -> Result<bool, StoreError> {
        if target.is_single_host() {
            return Ok(self.hosts.remove(&target.network()).is_some());
        }

        let mut ranges = self.ranges.write().await;
        let before = ranges.len();
        ranges.retain(|(range, _)| range != target);
        Ok(ranges.len() < before)
    }

    async fn entries(&self) -> Result<Vec<BlockEntry>, StoreError> {
        let now = Utc::now();
        let mut entries: Vec<BlockEntry> = self
            .ranges
            .read()
            .await
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect();
        entries.extend(self.hosts.iter().map(|item| item.value().clone()));
        entries.retain(|entry| !entry.is_expired_at(now));
        entries.sort_by(|a, b| a.target.cmp(&b.target));
        Ok(entries)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(self.purge_expired_at(Utc::now()).await)
    }
}

/// IP filtering policy over a [`BlockList`].
#[derive(Clone)]
pub struct IpFilteringService {
    block_list: Arc<dyn BlockList>,
    timeout: Duration,
}

impl IpFilteringService {
    pub fn new(block_list: Arc<dyn BlockList>, timeout: Duration) -> Self {
        Self {
            block_list,
            timeout,
        }
    }

    /// Policy backed by a fresh [`InMemoryBlockList`].
    pub fn in_memory(timeout: Duration) -> Self {
        Self::new(Arc::new(InMemoryBlockList::new()), timeout)
    }

    /// Whether the identity is blocked, bounded by the store timeout.
    pub async fn is_ip_blocked(&self, identity: &ClientIdentity) -> Result<bool, StoreError> {
        let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        tokio::time::timeout(self.timeout, self.block_list.is_blocked(identity))
            .await
            .map_err(|_| StoreError::Timeout(millis))?
    }

    pub async fn block(
        &self,
        target: &CidrRange,
        reason: &str,
        ttl: Option<Duration>,
    ) -> Result<BlockEntry, StoreError> {
        let entry = self.block_list.block(target, reason, ttl).await?;
        info!(
            blocked = %entry.target,
            reason = %entry.reason,
            expires_at = ?entry.expires_at,
            "Blocked client"
        );
        Ok(entry)
    }

    pub async fn unblock(&self, target: &CidrRange) -> Result<bool, StoreError> {
        let removed = self.block_list.unblock(target).await?;
        if removed {
            info!(unblocked = %target, "Unblocked client");
        }
        Ok(removed)
    }

    pub async fn entries(&self) -> Result<Vec<BlockEntry>, StoreError> {
        self.block_list.entries().await
    }

    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.block_list.purge_expired().await
    }

    /// Block every parseable target, skipping (and logging) the rest.
    ///
    /// Used for the `BLOCKED_IPS` list at startup. Returns how many entries
    /// were added.
    pub async fn seed(&self, targets: &[String], reason: &str) -> Result<usize, StoreError> {
        let mut added = 0;
        for raw in targets {
            match CidrRange::parse(raw) {
                Some(target) => {
                    self.block_list.block(&target, reason, None).await?;
                    added += 1;
                }
                None => warn!(entry = %raw, "Invalid entry in BLOCKED_IPS, skipping"),
            }
        }
        Ok(added)
    }
}
