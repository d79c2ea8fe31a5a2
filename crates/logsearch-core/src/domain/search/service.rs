//! Search service for orchestrating query execution
//!
//! Parses, validates, optimizes and compiles a query, consults the result
//! cache, runs the predicate against the log store, highlights matches and
//! records history. Saved search management, sharing and export go through
//! here as well so that access rules and error surfacing stay in one place.

use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use super::cache::{self, MokaSearchCache, SearchCache};
use super::compiler::{self, CompiledPredicate};
use super::context::SearchContext;
use super::entity::{
    ExportFormat, ExportedResults, FrequentSearch, GroupBy, LogEntryRef, PageRequest, SavedSearch,
    SavedSearchUpdate, SearchFilters, SearchHistoryEntry, SearchMetadata, SearchResultPage,
    SharedSearchGrant, Sort,
};
use super::highlight::Highlighter;
use super::parser::QueryParser;
use super::query::Query;
use super::repository::SearchRepository;
use super::repository_trait::SearchRepositoryTrait;
use crate::config::{Config, SearchSettings};
use crate::error::{Error, Result};

/// A single search as submitted by a user
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub user_id: i64,
    pub query: String,
    pub filters: SearchFilters,
    pub page: PageRequest,
    pub sort: Sort,
    pub group_by: Option<GroupBy>,
}

impl SearchRequest {
    pub fn new(user_id: i64, query: impl Into<String>) -> Self {
        Self {
            user_id,
            query: query.into(),
            filters: SearchFilters::default(),
            page: PageRequest::default(),
            sort: Sort::default(),
            group_by: None,
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = Some(group_by);
        self
    }
}

/// Service for log search, saved searches and history
#[derive(Clone)]
pub struct SearchService {
    repository: Arc<dyn SearchRepositoryTrait>,
    cache: Arc<dyn SearchCache>,
    parser: QueryParser,
    settings: SearchSettings,
}

impl SearchService {
    /// Create a search service with default settings
    pub fn new(pool: SqlitePool) -> Self {
        Self::from_config(pool, &Config::default())
    }

    /// Create a search service from loaded configuration
    pub fn from_config(pool: SqlitePool, config: &Config) -> Self {
        let repository =
            SearchRepository::new(pool).with_history_limit(config.search.history_limit);
        Self::with_components(
            Arc::new(repository),
            Arc::new(MokaSearchCache::from_settings(&config.cache)),
            config.search.clone(),
        )
    }

    /// Assemble a service from explicit parts
    pub fn with_components(
        repository: Arc<dyn SearchRepositoryTrait>,
        cache: Arc<dyn SearchCache>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            repository,
            cache,
            parser: QueryParser::new(&settings),
            settings,
        }
    }

    pub fn parser(&self) -> &QueryParser {
        &self.parser
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn supported_fields(&self) -> Vec<&'static str> {
        self.parser.supported_fields()
    }

    /// Parse and validate a query without running it
    pub fn validate_query(&self, query_string: &str) -> Result<Query> {
        self.parser.parse_and_validate(query_string)
    }

    // ========== Execution ==========

    /// Execute a search and return one page of results
    ///
    /// A blank query matches every entry allowed by the filters. History is
    /// recorded only once the search has succeeded.
    pub async fn execute_search(
        &self,
        request: &SearchRequest,
        ctx: &SearchContext,
    ) -> Result<SearchResultPage> {
        ctx.check()?;
        let page = self.normalize_page(request.page)?;

        let query = if request.query.trim().is_empty() {
            None
        } else {
            let parsed = self.parser.parse_and_validate(&request.query)?;
            Some(
                self.parser
                    .optimize(&parsed)
                    .with_case_sensitivity(request.filters.case_sensitive),
            )
        };

        let predicate = match &query {
            Some(query) => compiler::compile(query)
                .map_err(|e| self.surface(e, request.user_id, &request.query, "compiling query"))?,
            None => CompiledPredicate::match_all(),
        };

        if predicate.needs_prefilter_warning() && !request.filters.has_indexed_bound() {
            tracing::warn!(
                user_id = request.user_id,
                query = %request.query,
                "Regex search has no indexed prefilter and will scan the whole log table"
            );
        }

        let key = match cache::cache_key(
            query.as_ref(),
            &request.filters,
            page,
            request.sort,
            request.group_by,
        ) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build cache key, bypassing cache");
                None
            }
        };

        if let Some(key) = &key {
            match self.cache.get(key).await {
                Ok(Some(cached)) => {
                    tracing::debug!(user_id = request.user_id, "Search served from cache");
                    self.record_history(request.user_id, &request.query, cached.total_matched)
                        .await;
                    return Ok(cached);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Search cache lookup failed, executing directly");
                }
            }
        }

        // Regex predicates also get a work budget on top of the caller's limits
        let run_ctx = if predicate.has_regex {
            ctx.with_budget(self.settings.regex_timeout())
        } else {
            ctx.clone()
        };
        let result = run_ctx
            .run(self.run_query(query.as_ref(), &predicate, request, page, &run_ctx))
            .await
            .map_err(|e| self.surface(e, request.user_id, &request.query, "executing query"))?;

        if let Some(key) = key {
            if let Err(e) = self.cache.insert(key, result.clone()).await {
                tracing::warn!(error = %e, "Failed to cache search results");
            }
        }

        self.record_history(request.user_id, &request.query, result.total_matched)
            .await;

        tracing::info!(
            user_id = request.user_id,
            total = result.total_matched,
            returned = result.entries.len(),
            "Search executed"
        );
        Ok(result)
    }

    /// Execute a saved search the user owns or has been granted
    pub async fn execute_saved_search(
        &self,
        user_id: i64,
        saved_search_id: Uuid,
        page: PageRequest,
        sort: Sort,
        ctx: &SearchContext,
    ) -> Result<SearchResultPage> {
        let saved = self.get_saved_search(saved_search_id, user_id).await?;
        let request = SearchRequest::new(user_id, saved.query_string)
            .with_page(page)
            .with_sort(sort);
        self.execute_search(&request, ctx).await
    }

    /// Drop every cached result page
    pub async fn invalidate_cache(&self) -> Result<()> {
        self.cache.invalidate_all().await
    }

    async fn run_query(
        &self,
        query: Option<&Query>,
        predicate: &CompiledPredicate,
        request: &SearchRequest,
        page: PageRequest,
        ctx: &SearchContext,
    ) -> Result<SearchResultPage> {
        let (entries, total_matched) = self
            .repository
            .execute_compiled_predicate(predicate, &request.filters, page, request.sort, ctx)
            .await?;

        let aggregations = match request.group_by {
            Some(group_by) => {
                self.repository
                    .count_by_group(predicate, &request.filters, group_by, ctx)
                    .await?
            }
            None => Default::default(),
        };

        ctx.check()?;
        let highlights = match query {
            Some(query) => {
                Arc::new(Highlighter::from_query(query)?)
                    .highlight_entries(&entries, self.settings.regex_timeout())
                    .await?
            }
            None => Default::default(),
        };

        Ok(SearchResultPage {
            entries,
            total_matched,
            page: page.page,
            page_size: page.page_size,
            highlights,
            aggregations,
        })
    }

    fn normalize_page(&self, page: PageRequest) -> Result<PageRequest> {
        if page.page == 0 {
            return Err(Error::InvalidInput(
                "page numbers start at 1".to_string(),
            ));
        }
        let page_size = match page.page_size {
            0 => self.settings.default_page_size,
            size => size.min(self.settings.max_page_size),
        };
        Ok(PageRequest::new(page.page, page_size))
    }

    async fn record_history(&self, user_id: i64, query_string: &str, results_count: i64) {
        if query_string.trim().is_empty() {
            return;
        }
        if let Err(e) = self
            .repository
            .save_search_history(user_id, query_string, results_count)
            .await
        {
            tracing::warn!(user_id, error = %e, "Failed to record search history");
        }
    }

    /// Log infrastructure failures with context and hide their detail
    fn surface(&self, error: Error, user_id: i64, query: &str, stage: &str) -> Error {
        if !error.is_infrastructure() {
            return error;
        }
        tracing::error!(user_id, query = %query, stage, error = %error, "Search failed");
        Error::Internal(stage.to_string())
    }

    // ========== Saved Searches ==========

    /// Save a query under a name unique for the owner
    pub async fn save_search(
        &self,
        owner_user_id: i64,
        name: &str,
        query_string: &str,
        description: &str,
    ) -> Result<SavedSearch> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "saved search name cannot be empty".to_string(),
            ));
        }
        self.parser.parse_and_validate(query_string)?;

        let saved = self
            .repository
            .save_search(owner_user_id, name.trim(), query_string, description)
            .await
            .map_err(|e| self.surface(e, owner_user_id, query_string, "saving search"))?;
        tracing::info!(owner_user_id, id = %saved.id, name = %saved.name, "Saved search created");
        Ok(saved)
    }

    pub async fn get_saved_search(&self, id: Uuid, requesting_user_id: i64) -> Result<SavedSearch> {
        self.repository
            .get_saved_search(id, requesting_user_id)
            .await
            .map_err(|e| self.surface(e, requesting_user_id, "", "loading saved search"))
    }

    /// Id, query and creation time of a search the user may read
    pub async fn get_search_metadata(&self, id: Uuid, requesting_user_id: i64) -> Result<SearchMetadata> {
        self.repository
            .get_search_metadata(id, requesting_user_id)
            .await
            .map_err(|e| self.surface(e, requesting_user_id, "", "loading search metadata"))
    }

    /// Update a saved search; a new query string is validated first
    pub async fn update_saved_search(
        &self,
        id: Uuid,
        owner_user_id: i64,
        update: &SavedSearchUpdate,
    ) -> Result<SavedSearch> {
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "saved search name cannot be empty".to_string(),
                ));
            }
        }
        if let Some(query_string) = &update.query_string {
            self.parser.parse_and_validate(query_string)?;
        }

        self.repository
            .update_saved_search(id, owner_user_id, update)
            .await
            .map_err(|e| self.surface(e, owner_user_id, "", "updating saved search"))
    }

    pub async fn delete_saved_search(&self, id: Uuid, owner_user_id: i64) -> Result<()> {
        self.repository
            .delete_saved_search(id, owner_user_id)
            .await
            .map_err(|e| self.surface(e, owner_user_id, "", "deleting saved search"))?;
        tracing::info!(owner_user_id, id = %id, "Saved search deleted");
        Ok(())
    }

    pub async fn list_user_searches(&self, user_id: i64) -> Result<Vec<SavedSearch>> {
        self.repository
            .list_user_searches(user_id)
            .await
            .map_err(|e| self.surface(e, user_id, "", "listing saved searches"))
    }

    pub async fn list_user_searches_paginated(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SavedSearch>> {
        self.repository
            .list_user_searches_paginated(user_id, limit, offset)
            .await
            .map_err(|e| self.surface(e, user_id, "", "listing saved searches"))
    }

    pub async fn list_public_searches(&self, limit: u32, offset: u32) -> Result<Vec<SavedSearch>> {
        self.repository
            .list_public_searches(limit, offset)
            .await
            .map_err(|e| self.surface(e, 0, "", "listing public searches"))
    }

    // ========== Sharing ==========

    pub async fn share_search(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()> {
        self.repository
            .share_search(id, owner_user_id, grantee_user_id)
            .await
            .map_err(|e| self.surface(e, owner_user_id, "", "sharing saved search"))?;
        tracing::info!(owner_user_id, grantee_user_id, id = %id, "Saved search shared");
        Ok(())
    }

    pub async fn revoke_share(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()> {
        self.repository
            .revoke_share(id, owner_user_id, grantee_user_id)
            .await
            .map_err(|e| self.surface(e, owner_user_id, "", "revoking share"))
    }

    pub async fn get_shared_searches(&self, grantee_user_id: i64) -> Result<Vec<SavedSearch>> {
        self.repository
            .get_shared_searches(grantee_user_id)
            .await
            .map_err(|e| self.surface(e, grantee_user_id, "", "listing shared searches"))
    }

    pub async fn list_grants(&self, id: Uuid, owner_user_id: i64) -> Result<Vec<SharedSearchGrant>> {
        self.repository
            .list_grants(id, owner_user_id)
            .await
            .map_err(|e| self.surface(e, owner_user_id, "", "listing grants"))
    }

    // ========== Search History ==========

    pub async fn get_search_history(&self, user_id: i64, limit: u32) -> Result<Vec<SearchHistoryEntry>> {
        self.repository
            .get_search_history(user_id, limit)
            .await
            .map_err(|e| self.surface(e, user_id, "", "loading search history"))
    }

    pub async fn get_recent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<String>> {
        self.repository
            .get_recent_searches(user_id, limit)
            .await
            .map_err(|e| self.surface(e, user_id, "", "loading recent searches"))
    }

    pub async fn get_frequent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<FrequentSearch>> {
        self.repository
            .get_frequent_searches(user_id, limit)
            .await
            .map_err(|e| self.surface(e, user_id, "", "loading frequent searches"))
    }

    pub async fn clear_search_history(&self, user_id: i64) -> Result<u64> {
        self.repository
            .clear_search_history(user_id)
            .await
            .map_err(|e| self.surface(e, user_id, "", "clearing search history"))
    }

    /// Retention sweep across all users
    pub async fn delete_history_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let removed = self
            .repository
            .delete_history_before(cutoff)
            .await
            .map_err(|e| self.surface(e, 0, "", "pruning search history"))?;
        tracing::info!(removed, cutoff = %cutoff, "Pruned search history");
        Ok(removed)
    }

    // ========== Export ==========

    /// Serialize entries for download
    pub fn export(&self, entries: &[LogEntryRef], format: ExportFormat) -> Result<ExportedResults> {
        let data = self
            .repository
            .export(entries, format)
            .map_err(|e| self.surface(e, 0, "", "exporting results"))?;
        Ok(ExportedResults {
            format,
            content_type: format.content_type(),
            data,
        })
    }

    /// Run a search and export its result page
    pub async fn export_search(
        &self,
        request: &SearchRequest,
        format: ExportFormat,
        ctx: &SearchContext,
    ) -> Result<ExportedResults> {
        let page = self.execute_search(request, ctx).await?;
        self.export(&page.entries, format)
    }
}
