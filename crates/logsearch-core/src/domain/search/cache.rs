//! Result page cache
//!
//! Pages are cached under a hash of the normalized query and every request
//! parameter that changes the result. Entries expire after a fixed TTL and
//! are never invalidated by writes; the log table is append-only and brief
//! staleness is acceptable for search.

use async_trait::async_trait;
use moka::future::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::entity::{GroupBy, PageRequest, SearchFilters, SearchResultPage, Sort};
use super::query::Query;
use crate::config::CacheSettings;
use crate::error::Result;

/// Shared store for search result pages
#[async_trait]
pub trait SearchCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SearchResultPage>>;

    async fn insert(&self, key: String, page: SearchResultPage) -> Result<()>;

    async fn invalidate_all(&self) -> Result<()>;
}

/// In-process cache with TTL expiry and a capacity bound
#[derive(Clone)]
pub struct MokaSearchCache {
    cache: Cache<String, Arc<SearchResultPage>>,
}

impl MokaSearchCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.max_capacity, settings.ttl())
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl SearchCache for MokaSearchCache {
    async fn get(&self, key: &str) -> Result<Option<SearchResultPage>> {
        Ok(self
            .cache
            .get(key)
            .await
            .map(|page| page.as_ref().clone()))
    }

    async fn insert(&self, key: String, page: SearchResultPage) -> Result<()> {
        self.cache.insert(key, Arc::new(page)).await;
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<()> {
        self.cache.invalidate_all();
        Ok(())
    }
}

#[derive(Serialize)]
struct CacheKeyParts<'a> {
    query: Option<&'a Query>,
    filters: &'a SearchFilters,
    page: PageRequest,
    sort: Sort,
    group_by: Option<GroupBy>,
}

/// Stable key for a normalized query and its request parameters
///
/// `query` is `None` for a blank (match-all) search.
pub fn cache_key(
    query: Option<&Query>,
    filters: &SearchFilters,
    page: PageRequest,
    sort: Sort,
    group_by: Option<GroupBy>,
) -> Result<String> {
    let parts = CacheKeyParts {
        query,
        filters,
        page,
        sort,
        group_by,
    };
    let bytes = serde_json::to_vec(&parts)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
