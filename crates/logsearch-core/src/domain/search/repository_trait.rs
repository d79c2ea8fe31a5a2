//! Repository trait for search persistence
//!
//! This module defines the trait for search storage operations.
//! The trait abstracts over different storage backends (SQLite, etc.) and
//! lets the service be exercised against test doubles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;

use super::compiler::CompiledPredicate;
use super::context::SearchContext;
use super::entity::{
    ExportFormat, FrequentSearch, GroupBy, LogEntryRef, PageRequest, SavedSearch,
    SavedSearchUpdate, SearchFilters, SearchHistoryEntry, SearchMetadata, SharedSearchGrant,
    Sort,
};
use super::export;

/// Repository trait for search persistence
///
/// Missing searches and searches the requester may not see both fail with
/// `Error::SearchNotFound`.
#[async_trait]
pub trait SearchRepositoryTrait: Send + Sync {
    // ========== Saved Searches ==========

    /// Persist a new saved search; duplicate `(owner, name)` is a conflict
    async fn save_search(
        &self,
        owner_user_id: i64,
        name: &str,
        query_string: &str,
        description: &str,
    ) -> Result<SavedSearch>;

    /// Get a saved search owned by, shared with or made public to the requester
    async fn get_saved_search(&self, id: Uuid, requesting_user_id: i64) -> Result<SavedSearch>;

    /// Id, query and creation time under the same visibility as `get_saved_search`
    async fn get_search_metadata(&self, id: Uuid, requesting_user_id: i64) -> Result<SearchMetadata>;

    /// Update a saved search (owner only)
    async fn update_saved_search(
        &self,
        id: Uuid,
        owner_user_id: i64,
        update: &SavedSearchUpdate,
    ) -> Result<SavedSearch>;

    /// Delete a saved search (owner only)
    async fn delete_saved_search(&self, id: Uuid, owner_user_id: i64) -> Result<()>;

    /// Owned and shared-with searches, most recently updated first
    async fn list_user_searches(&self, user_id: i64) -> Result<Vec<SavedSearch>>;

    async fn list_user_searches_paginated(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SavedSearch>>;

    async fn list_public_searches(&self, limit: u32, offset: u32) -> Result<Vec<SavedSearch>>;

    // ========== Sharing ==========

    /// Grant read-only access (owner only, idempotent)
    async fn share_search(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()>;

    /// Withdraw read-only access (owner only, idempotent)
    async fn revoke_share(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()>;

    /// Searches shared with a user by others
    async fn get_shared_searches(&self, grantee_user_id: i64) -> Result<Vec<SavedSearch>>;

    /// Grants on a search (owner only)
    async fn list_grants(&self, id: Uuid, owner_user_id: i64) -> Result<Vec<SharedSearchGrant>>;

    // ========== Search History ==========

    /// Append a history entry, pruning the oldest beyond the cap
    async fn save_search_history(
        &self,
        user_id: i64,
        query_string: &str,
        results_count: i64,
    ) -> Result<()>;

    async fn get_search_history(&self, user_id: i64, limit: u32) -> Result<Vec<SearchHistoryEntry>>;

    /// Distinct query strings, most recent occurrence first
    async fn get_recent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<String>>;

    async fn get_frequent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<FrequentSearch>>;

    async fn clear_search_history(&self, user_id: i64) -> Result<u64>;

    async fn delete_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ========== Execution ==========

    /// One page of matching entries and the total match count
    ///
    /// Implementations stop work once `ctx` is canceled or out of time and
    /// report that through `ctx.check()`.
    async fn execute_compiled_predicate(
        &self,
        predicate: &CompiledPredicate,
        filters: &SearchFilters,
        page: PageRequest,
        sort: Sort,
        ctx: &SearchContext,
    ) -> Result<(Vec<LogEntryRef>, i64)>;

    /// Match counts per group value
    async fn count_by_group(
        &self,
        predicate: &CompiledPredicate,
        filters: &SearchFilters,
        group_by: GroupBy,
        ctx: &SearchContext,
    ) -> Result<HashMap<String, i64>>;

    // ========== Export ==========

    fn export_as_json(&self, entries: &[LogEntryRef]) -> Result<Vec<u8>> {
        export::export_as_json(entries)
    }

    fn export_as_csv(&self, entries: &[LogEntryRef]) -> Vec<u8> {
        export::export_as_csv(entries)
    }

    /// Serialize in `format`, dispatching to the per-format methods
    fn export(&self, entries: &[LogEntryRef], format: ExportFormat) -> Result<Vec<u8>> {
        match format {
            ExportFormat::Json => self.export_as_json(entries),
            ExportFormat::Csv => Ok(self.export_as_csv(entries)),
        }
    }
}
