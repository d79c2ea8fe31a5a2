//! Search repository for database operations
//!
//! Handles saved searches, sharing grants, search history and execution of
//! compiled predicates against `log_entries`.

use super::compiler::CompiledPredicate;
use super::context::SearchContext;
use super::repository_trait::SearchRepositoryTrait;
use super::entity::{
    FrequentSearch, GroupBy, LogEntryRef, PageRequest, SavedSearch, SavedSearchUpdate,
    SearchFilters, SearchHistoryEntry, SearchMetadata, SharedSearchGrant, Sort,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Default number of history entries kept per user
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

const SAVED_SEARCH_COLUMNS: &str = "s.id, s.owner_user_id, s.name, s.query_string, s.description, \
     s.is_public, s.created_at, s.updated_at";

/// Rows a user may read: their own, granted to them, or public
const VISIBLE_TO_REQUESTER: &str = r#"
    (
        s.owner_user_id = ?
        OR s.is_public = 1
        OR EXISTS (
            SELECT 1 FROM shared_searches g
            WHERE g.saved_search_id = s.id AND g.grantee_user_id = ?
        )
    )
"#;

/// SQLite VM instructions between checks of the search context
const INTERRUPT_CHECK_OPS: i32 = 1_000;

const LOG_ENTRY_COLUMNS: &str = "id, timestamp, level, service, message, correlation_id, metadata";

/// Repository for search database operations
#[derive(Debug, Clone)]
pub struct SearchRepository {
    pool: SqlitePool,
    history_limit: u32,
}

impl SearchRepository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Keep at most `limit` history entries per user
    pub fn with_history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn history_limit(&self) -> u32 {
        self.history_limit
    }

    fn cap(&self, limit: u32) -> u32 {
        if limit == 0 || limit > self.history_limit {
            self.history_limit
        } else {
            limit
        }
    }

    // ========== Saved Searches ==========

    /// Persist a new saved search; the name must be unique per owner
    pub async fn save_search(
        &self,
        owner_user_id: i64,
        name: &str,
        query_string: &str,
        description: &str,
    ) -> Result<SavedSearch> {
        let name = validate_name(name)?;
        let search = SavedSearch::new(owner_user_id, name, query_string, description);

        sqlx::query(
            r#"
            INSERT INTO saved_searches (
                id, owner_user_id, name, query_string, description, is_public, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(search.id.to_string())
        .bind(search.owner_user_id)
        .bind(&search.name)
        .bind(&search.query_string)
        .bind(&search.description)
        .bind(search.is_public)
        .bind(search.created_at)
        .bind(search.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_database(e, &search.name))?;

        tracing::debug!(
            search_id = %search.id,
            owner_user_id,
            name = %search.name,
            "Saved search"
        );
        Ok(search)
    }

    /// Get a saved search visible to the requester (owner, grantee or public)
    pub async fn get_saved_search(&self, id: Uuid, requesting_user_id: i64) -> Result<SavedSearch> {
        let sql = format!(
            "SELECT {SAVED_SEARCH_COLUMNS} FROM saved_searches s WHERE s.id = ? AND {VISIBLE_TO_REQUESTER}"
        );
        let row: Option<SavedSearchRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(requesting_user_id)
            .bind(requesting_user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        match row {
            Some(row) => row.into_saved_search(),
            None => Err(Error::SearchNotFound(id.to_string())),
        }
    }

    /// Id, query and creation time of a search visible to the requester
    pub async fn get_search_metadata(&self, id: Uuid, requesting_user_id: i64) -> Result<SearchMetadata> {
        let sql = format!(
            "SELECT s.id, s.query_string, s.created_at FROM saved_searches s WHERE s.id = ? AND {VISIBLE_TO_REQUESTER}"
        );
        let row: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(requesting_user_id)
            .bind(requesting_user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let Some((raw_id, query_string, created_at)) = row else {
            return Err(Error::SearchNotFound(id.to_string()));
        };
        Ok(SearchMetadata {
            id: parse_search_id(&raw_id)?,
            query_string,
            created_at,
        })
    }

    /// Apply an update; only the owner may change a saved search
    pub async fn update_saved_search(
        &self,
        id: Uuid,
        owner_user_id: i64,
        update: &SavedSearchUpdate,
    ) -> Result<SavedSearch> {
        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        let sql = format!(
            "SELECT {SAVED_SEARCH_COLUMNS} FROM saved_searches s WHERE s.id = ? AND s.owner_user_id = ?"
        );
        let row: Option<SavedSearchRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(owner_user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::DatabaseError)?;
        let Some(row) = row else {
            return Err(Error::SearchNotFound(id.to_string()));
        };

        let mut search = row.into_saved_search()?;
        if let Some(name) = &update.name {
            search.name = validate_name(name)?.to_string();
        }
        if let Some(query_string) = &update.query_string {
            search.query_string = query_string.clone();
        }
        if let Some(description) = &update.description {
            search.description = description.clone();
        }
        if let Some(is_public) = update.is_public {
            search.is_public = is_public;
        }
        search.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE saved_searches
            SET name = ?, query_string = ?, description = ?, is_public = ?, updated_at = ?
            WHERE id = ? AND owner_user_id = ?
            "#,
        )
        .bind(&search.name)
        .bind(&search.query_string)
        .bind(&search.description)
        .bind(search.is_public)
        .bind(search.updated_at)
        .bind(id.to_string())
        .bind(owner_user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_or_database(e, &search.name))?;

        if result.rows_affected() == 0 {
            return Err(Error::SearchNotFound(id.to_string()));
        }
        tx.commit().await.map_err(Error::DatabaseError)?;

        tracing::debug!(search_id = %id, owner_user_id, "Updated saved search");
        Ok(search)
    }

    /// Delete a saved search; only the owner may delete it. Grants cascade.
    pub async fn delete_saved_search(&self, id: Uuid, owner_user_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM saved_searches WHERE id = ? AND owner_user_id = ?")
            .bind(id.to_string())
            .bind(owner_user_id)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(Error::SearchNotFound(id.to_string()));
        }
        tracing::debug!(search_id = %id, owner_user_id, "Deleted saved search");
        Ok(())
    }

    /// Owned and shared-with searches, most recently updated first
    pub async fn list_user_searches(&self, user_id: i64) -> Result<Vec<SavedSearch>> {
        self.list_visible(user_id, None).await
    }

    pub async fn list_user_searches_paginated(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SavedSearch>> {
        self.list_visible(user_id, Some((limit, offset))).await
    }

    /// Searches their owners made public, most recently updated first
    pub async fn list_public_searches(&self, limit: u32, offset: u32) -> Result<Vec<SavedSearch>> {
        let sql = format!(
            r#"
            SELECT {SAVED_SEARCH_COLUMNS}
            FROM saved_searches s
            WHERE s.is_public = 1
            ORDER BY s.updated_at DESC, s.name ASC
            LIMIT ? OFFSET ?
            "#
        );
        let rows: Vec<SavedSearchRow> = sqlx::query_as(&sql)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        rows.into_iter().map(SavedSearchRow::into_saved_search).collect()
    }

    async fn list_visible(&self, user_id: i64, window: Option<(u32, u32)>) -> Result<Vec<SavedSearch>> {
        let mut sql = format!(
            r#"
            SELECT {SAVED_SEARCH_COLUMNS}
            FROM saved_searches s
            WHERE s.owner_user_id = ?
               OR s.id IN (SELECT saved_search_id FROM shared_searches WHERE grantee_user_id = ?)
            ORDER BY s.updated_at DESC, s.name ASC
            "#
        );
        if window.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query_as::<_, SavedSearchRow>(&sql)
            .bind(user_id)
            .bind(user_id);
        if let Some((limit, offset)) = window {
            query = query.bind(i64::from(limit)).bind(i64::from(offset));
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        rows.into_iter().map(SavedSearchRow::into_saved_search).collect()
    }

    // ========== Sharing ==========

    /// Grant read-only access; sharing twice is a no-op
    pub async fn share_search(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()> {
        if owner_user_id == grantee_user_id {
            return Err(Error::InvalidInput(
                "a saved search cannot be shared with its owner".to_string(),
            ));
        }
        self.ensure_owner(id, owner_user_id).await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO shared_searches (
                saved_search_id, owner_user_id, grantee_user_id, created_at
            )
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(owner_user_id)
        .bind(grantee_user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        tracing::debug!(search_id = %id, owner_user_id, grantee_user_id, "Shared saved search");
        Ok(())
    }

    /// Withdraw a grant; revoking a missing grant is a no-op
    pub async fn revoke_share(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()> {
        self.ensure_owner(id, owner_user_id).await?;

        sqlx::query("DELETE FROM shared_searches WHERE saved_search_id = ? AND grantee_user_id = ?")
            .bind(id.to_string())
            .bind(grantee_user_id)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(())
    }

    /// Searches other users have shared with `grantee_user_id`
    pub async fn get_shared_searches(&self, grantee_user_id: i64) -> Result<Vec<SavedSearch>> {
        let sql = format!(
            r#"
            SELECT {SAVED_SEARCH_COLUMNS}
            FROM saved_searches s
            JOIN shared_searches g ON g.saved_search_id = s.id
            WHERE g.grantee_user_id = ?
            ORDER BY s.updated_at DESC, s.name ASC
            "#
        );
        let rows: Vec<SavedSearchRow> = sqlx::query_as(&sql)
            .bind(grantee_user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        rows.into_iter().map(SavedSearchRow::into_saved_search).collect()
    }

    /// Grants on a search, visible to its owner only
    pub async fn list_grants(&self, id: Uuid, owner_user_id: i64) -> Result<Vec<SharedSearchGrant>> {
        self.ensure_owner(id, owner_user_id).await?;

        let rows: Vec<GrantRow> = sqlx::query_as(
            r#"
            SELECT saved_search_id, owner_user_id, grantee_user_id, created_at
            FROM shared_searches
            WHERE saved_search_id = ?
            ORDER BY created_at ASC, grantee_user_id ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        rows.into_iter().map(GrantRow::into_grant).collect()
    }

    async fn ensure_owner(&self, id: Uuid, owner_user_id: i64) -> Result<()> {
        let owned: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM saved_searches WHERE id = ? AND owner_user_id = ?")
                .bind(id.to_string())
                .bind(owner_user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;
        match owned {
            Some(_) => Ok(()),
            None => Err(Error::SearchNotFound(id.to_string())),
        }
    }

    // ========== Search History ==========

    /// Append a history entry and drop the user's oldest entries beyond the cap
    pub async fn save_search_history(
        &self,
        user_id: i64,
        query_string: &str,
        results_count: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        sqlx::query(
            "INSERT INTO search_history (user_id, query_string, results_count, searched_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(query_string)
        .bind(results_count)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?;

        let pruned = sqlx::query(
            r#"
            DELETE FROM search_history
            WHERE user_id = ?
              AND id NOT IN (
                SELECT id FROM search_history
                WHERE user_id = ?
                ORDER BY searched_at DESC, id DESC
                LIMIT ?
              )
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(i64::from(self.history_limit))
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?;

        tx.commit().await.map_err(Error::DatabaseError)?;

        if pruned.rows_affected() > 0 {
            tracing::trace!(user_id, pruned = pruned.rows_affected(), "Pruned search history");
        }
        Ok(())
    }

    /// Every entry, duplicates included, most recent first
    pub async fn get_search_history(&self, user_id: i64, limit: u32) -> Result<Vec<SearchHistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, query_string, results_count, searched_at
            FROM search_history
            WHERE user_id = ?
            ORDER BY searched_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(self.cap(limit)))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows.into_iter().map(HistoryRow::into_entry).collect())
    }

    /// Distinct query strings, most recent occurrence first
    pub async fn get_recent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT query_string
            FROM search_history
            WHERE user_id = ?
            GROUP BY query_string
            ORDER BY MAX(searched_at) DESC, MAX(id) DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(self.cap(limit)))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows.into_iter().map(|(query,)| query).collect())
    }

    /// Distinct query strings with run counts, most frequent first
    pub async fn get_frequent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<FrequentSearch>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT query_string, COUNT(*) AS runs
            FROM search_history
            WHERE user_id = ?
            GROUP BY query_string
            ORDER BY runs DESC, MAX(id) DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(self.cap(limit)))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|(query_string, count)| FrequentSearch { query_string, count })
            .collect())
    }

    /// Remove all history for a user, returning the number of entries deleted
    pub async fn clear_search_history(&self, user_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_history WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected())
    }

    /// Retention sweep over all users
    pub async fn delete_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_history WHERE searched_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        tracing::info!(
            cutoff = %cutoff,
            deleted = result.rows_affected(),
            "Deleted old search history"
        );
        Ok(result.rows_affected())
    }

    // ========== Execution ==========

    /// Run a compiled predicate plus filters; returns one page and the total match count
    ///
    /// Statements are interrupted once `ctx` is canceled or out of time.
    pub async fn execute_compiled_predicate(
        &self,
        predicate: &CompiledPredicate,
        filters: &SearchFilters,
        page: PageRequest,
        sort: Sort,
        ctx: &SearchContext,
    ) -> Result<(Vec<LogEntryRef>, i64)> {
        let (where_sql, binds) = build_where(predicate, filters);

        let mut conn = InterruptibleConnection::acquire(&self.pool, ctx).await?;
        let fetched = fetch_page(conn.connection()?, &where_sql, &binds, page, sort).await;
        conn.release().await;
        let (rows, total) = fetched.map_err(|e| interrupted_or(e, ctx))?;

        tracing::debug!(total, returned = rows.len(), "Executed compiled predicate");
        Ok((rows.into_iter().map(LogEntryRow::into_entry).collect(), total))
    }

    /// Match counts bucketed by a lower-cased column value
    pub async fn count_by_group(
        &self,
        predicate: &CompiledPredicate,
        filters: &SearchFilters,
        group_by: GroupBy,
        ctx: &SearchContext,
    ) -> Result<HashMap<String, i64>> {
        let (where_sql, binds) = build_where(predicate, filters);
        let sql = format!(
            "SELECT lower({col}) AS bucket, COUNT(*) FROM log_entries{where_sql} GROUP BY bucket",
            col = group_by.column(),
        );

        let mut conn = InterruptibleConnection::acquire(&self.pool, ctx).await?;
        let fetched = bind_all(sqlx::query_as::<_, (String, i64)>(&sql), &binds)
            .fetch_all(conn.connection()?)
            .await;
        conn.release().await;
        let rows = fetched.map_err(|e| interrupted_or(e, ctx))?;
        Ok(rows.into_iter().collect())
    }
}

async fn fetch_page(
    conn: &mut SqliteConnection,
    where_sql: &str,
    binds: &[Bind],
    page: PageRequest,
    sort: Sort,
) -> std::result::Result<(Vec<LogEntryRow>, i64), sqlx::Error> {
    let count_sql = format!("SELECT COUNT(*) FROM log_entries{}", where_sql);
    let (total,) = bind_all(sqlx::query_as::<_, (i64,)>(&count_sql), binds)
        .fetch_one(&mut *conn)
        .await?;

    let order = sort.order.as_sql();
    let page_sql = format!(
        "SELECT {} FROM log_entries{} ORDER BY {} {}, id {} LIMIT ? OFFSET ?",
        LOG_ENTRY_COLUMNS,
        where_sql,
        sort.field.column(),
        order,
        order
    );
    let offset = i64::try_from(page.offset()).unwrap_or(i64::MAX);
    let rows = bind_all(sqlx::query_as::<_, LogEntryRow>(&page_sql), binds)
        .bind(i64::from(page.page_size))
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;
    Ok((rows, total))
}

/// A failed statement reports why the search stopped, if it did
fn interrupted_or(error: sqlx::Error, ctx: &SearchContext) -> Error {
    match ctx.check() {
        Err(stopped) => stopped,
        Ok(()) => Error::DatabaseError(error),
    }
}

/// Pooled connection whose statements stop when the search is done
///
/// A SQLite progress handler polls the context while a statement runs. If
/// the owning future is dropped mid-statement the handler aborts the scan and
/// a background task clears it before the connection returns to the pool.
struct InterruptibleConnection {
    conn: Option<PoolConnection<Sqlite>>,
    abandoned: Arc<AtomicBool>,
}

impl InterruptibleConnection {
    async fn acquire(pool: &SqlitePool, ctx: &SearchContext) -> Result<Self> {
        let mut conn = pool.acquire().await.map_err(Error::DatabaseError)?;
        let abandoned = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&abandoned);
        let watch = ctx.clone();
        conn.lock_handle()
            .await
            .map_err(Error::DatabaseError)?
            .set_progress_handler(INTERRUPT_CHECK_OPS, move || {
                !flag.load(Ordering::Relaxed) && !watch.is_done()
            });

        Ok(Self {
            conn: Some(conn),
            abandoned,
        })
    }

    fn connection(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| Error::Internal("search connection already released".to_string()))
    }

    async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            clear_progress_handler(conn).await;
        }
    }
}

impl Drop for InterruptibleConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        self.abandoned.store(true, Ordering::Relaxed);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(clear_progress_handler(conn));
            }
            // No runtime to finish the statement on; never hand the handler back to the pool
            Err(_) => conn.close_on_drop(),
        }
    }
}

async fn clear_progress_handler(mut conn: PoolConnection<Sqlite>) {
    let cleared = conn
        .lock_handle()
        .await
        .map(|mut handle| handle.remove_progress_handler());
    if let Err(e) = cleared {
        tracing::warn!(error = %e, "Failed to clear progress handler, closing connection");
        conn.close_on_drop();
    }
}

fn bind_all<'q, O>(
    mut query: sqlx::query::QueryAs<'q, Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [Bind],
) -> sqlx::query::QueryAs<'q, Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(value) => query.bind(value.as_str()),
            Bind::Time(value) => query.bind(*value),
        };
    }
    query
}

enum Bind {
    Text(String),
    Time(DateTime<Utc>),
}

/// WHERE clause (with leading space) for a predicate and filters
fn build_where(predicate: &CompiledPredicate, filters: &SearchFilters) -> (String, Vec<Bind>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(condition) = predicate.to_condition() {
        clauses.push(format!("({})", condition.sql));
        binds.extend(condition.params.into_iter().map(Bind::Text));
    }
    if let Some(from) = filters.from {
        clauses.push("timestamp >= ?".to_string());
        binds.push(Bind::Time(from));
    }
    if let Some(to) = filters.to {
        clauses.push("timestamp < ?".to_string());
        binds.push(Bind::Time(to));
    }
    for (column, values) in [("level", &filters.levels), ("service", &filters.services)] {
        if values.is_empty() {
            continue;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        clauses.push(format!("{} IN ({})", column, placeholders));
        binds.extend(values.iter().cloned().map(Bind::Text));
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("saved search name must not be empty".to_string()));
    }
    Ok(name)
}

fn parse_search_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Parse(format!("Invalid saved search ID: {}", e)))
}

fn conflict_or_database(error: sqlx::Error, name: &str) -> Error {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.is_unique_violation() {
            return Error::DuplicateSearchName(name.to_string());
        }
    }
    Error::DatabaseError(error)
}

// ========== Database Row Types ==========

#[derive(sqlx::FromRow)]
struct SavedSearchRow {
    id: String,
    owner_user_id: i64,
    name: String,
    query_string: String,
    description: String,
    is_public: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SavedSearchRow {
    fn into_saved_search(self) -> Result<SavedSearch> {
        Ok(SavedSearch {
            id: parse_search_id(&self.id)?,
            owner_user_id: self.owner_user_id,
            name: self.name,
            query_string: self.query_string,
            description: self.description,
            is_public: self.is_public,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GrantRow {
    saved_search_id: String,
    owner_user_id: i64,
    grantee_user_id: i64,
    created_at: DateTime<Utc>,
}

impl GrantRow {
    fn into_grant(self) -> Result<SharedSearchGrant> {
        Ok(SharedSearchGrant {
            saved_search_id: parse_search_id(&self.saved_search_id)?,
            owner_user_id: self.owner_user_id,
            grantee_user_id: self.grantee_user_id,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    user_id: i64,
    query_string: String,
    results_count: i64,
    searched_at: DateTime<Utc>,
}

impl HistoryRow {
    fn into_entry(self) -> SearchHistoryEntry {
        SearchHistoryEntry {
            id: self.id,
            user_id: self.user_id,
            query_string: self.query_string,
            results_count: self.results_count,
            searched_at: self.searched_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogEntryRow {
    id: i64,
    timestamp: DateTime<Utc>,
    level: String,
    service: String,
    message: String,
    correlation_id: Option<String>,
    metadata: Option<String>,
}

impl LogEntryRow {
    fn into_entry(self) -> LogEntryRef {
        // Metadata is written by the ingestion side; keep unparseable values verbatim
        let metadata = self.metadata.map(|raw| {
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::debug!(entry_id = self.id, error = %e, "Log metadata is not JSON");
                serde_json::Value::String(raw)
            })
        });
        LogEntryRef {
            id: self.id,
            timestamp: self.timestamp,
            level: self.level,
            service: self.service,
            message: self.message,
            correlation_id: self.correlation_id,
            metadata,
        }
    }
}

// ========== Trait Implementation ==========

#[async_trait]
impl SearchRepositoryTrait for SearchRepository {
    async fn save_search(
        &self,
        owner_user_id: i64,
        name: &str,
        query_string: &str,
        description: &str,
    ) -> Result<SavedSearch> {
        self.save_search(owner_user_id, name, query_string, description)
            .await
    }

    async fn get_saved_search(&self, id: Uuid, requesting_user_id: i64) -> Result<SavedSearch> {
        self.get_saved_search(id, requesting_user_id).await
    }

    async fn update_saved_search(
        &self,
        id: Uuid,
        owner_user_id: i64,
        update: &SavedSearchUpdate,
    ) -> Result<SavedSearch> {
        self.update_saved_search(id, owner_user_id, update).await
    }

    async fn delete_saved_search(&self, id: Uuid, owner_user_id: i64) -> Result<()> {
        self.delete_saved_search(id, owner_user_id).await
    }

    async fn list_user_searches(&self, user_id: i64) -> Result<Vec<SavedSearch>> {
        self.list_user_searches(user_id).await
    }

    async fn list_user_searches_paginated(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SavedSearch>> {
        self.list_user_searches_paginated(user_id, limit, offset)
            .await
    }

    async fn share_search(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()> {
        self.share_search(id, owner_user_id, grantee_user_id).await
    }

    async fn revoke_share(&self, id: Uuid, owner_user_id: i64, grantee_user_id: i64) -> Result<()> {
        self.revoke_share(id, owner_user_id, grantee_user_id).await
    }

    async fn get_shared_searches(&self, grantee_user_id: i64) -> Result<Vec<SavedSearch>> {
        self.get_shared_searches(grantee_user_id).await
    }

    async fn list_grants(&self, id: Uuid, owner_user_id: i64) -> Result<Vec<SharedSearchGrant>> {
        self.list_grants(id, owner_user_id).await
    }

    async fn get_search_metadata(&self, id: Uuid, requesting_user_id: i64) -> Result<SearchMetadata> {
        self.get_search_metadata(id, requesting_user_id).await
    }

    async fn list_public_searches(&self, limit: u32, offset: u32) -> Result<Vec<SavedSearch>> {
        self.list_public_searches(limit, offset).await
    }

    async fn save_search_history(
        &self,
        user_id: i64,
        query_string: &str,
        results_count: i64,
    ) -> Result<()> {
        self.save_search_history(user_id, query_string, results_count)
            .await
    }

    async fn get_search_history(&self, user_id: i64, limit: u32) -> Result<Vec<SearchHistoryEntry>> {
        self.get_search_history(user_id, limit).await
    }

    async fn get_recent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<String>> {
        self.get_recent_searches(user_id, limit).await
    }

    async fn get_frequent_searches(&self, user_id: i64, limit: u32) -> Result<Vec<FrequentSearch>> {
        self.get_frequent_searches(user_id, limit).await
    }

    async fn clear_search_history(&self, user_id: i64) -> Result<u64> {
        self.clear_search_history(user_id).await
    }

    async fn delete_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.delete_history_before(cutoff).await
    }

    async fn execute_compiled_predicate(
        &self,
        predicate: &CompiledPredicate,
        filters: &SearchFilters,
        page: PageRequest,
        sort: Sort,
        ctx: &SearchContext,
    ) -> Result<(Vec<LogEntryRef>, i64)> {
        self.execute_compiled_predicate(predicate, filters, page, sort, ctx)
            .await
    }

    async fn count_by_group(
        &self,
        predicate: &CompiledPredicate,
        filters: &SearchFilters,
        group_by: GroupBy,
        ctx: &SearchContext,
    ) -> Result<HashMap<String, i64>> {
        self.count_by_group(predicate, filters, group_by, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::search::compiler::compile;
    use crate::domain::search::entity::{SortField, SortOrder};
    use crate::domain::search::parser::QueryParser;
    use crate::storage::Database;
    use chrono::{Duration, TimeZone};

    async fn create_test_repo() -> SearchRepository {
        let db = Database::in_memory()
            .await
            .expect("Failed to create test database");
        SearchRepository::new(db.pool().clone())
    }

    async fn insert_log(
        pool: &SqlitePool,
        timestamp: DateTime<Utc>,
        level: &str,
        service: &str,
        message: &str,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO log_entries (timestamp, level, service, message, metadata) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(timestamp)
        .bind(level)
        .bind(service)
        .bind(message)
        .bind(r#"{"host":"web-1"}"#)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
    }

    async fn seed(repo: &SearchRepository) {
        let pool = repo.pool();
        let t = base_time();
        insert_log(pool, t, "error", "api", "upstream timeout after 30s").await;
        insert_log(pool, t + Duration::minutes(1), "ERROR", "db", "connection refused").await;
        insert_log(pool, t + Duration::minutes(2), "info", "api", "request served").await;
        insert_log(pool, t + Duration::minutes(3), "warn", "api", "slow request, Timeout close").await;
    }

    fn live() -> SearchContext {
        SearchContext::new()
    }

    fn predicate(query: &str) -> CompiledPredicate {
        if query.trim().is_empty() {
            return CompiledPredicate::match_all();
        }
        let parser = QueryParser::default();
        compile(&parser.parse(query).unwrap()).unwrap()
    }

    async fn run(repo: &SearchRepository, query: &str, filters: &SearchFilters) -> (Vec<String>, i64) {
        let (entries, total) = repo
            .execute_compiled_predicate(&predicate(query), filters, PageRequest::default(), Sort::default(), &live())
            .await
            .unwrap();
        (entries.into_iter().map(|e| e.message).collect(), total)
    }

    #[tokio::test]
    async fn test_save_and_get_search() {
        let repo = create_test_repo().await;

        let saved = repo
            .save_search(1, "errors", "level:error", "all errors")
            .await
            .unwrap();
        let fetched = repo.get_saved_search(saved.id, 1).await.unwrap();
        assert_eq!(fetched.name, "errors");
        assert_eq!(fetched.query_string, "level:error");
        assert_eq!(fetched.description, "all errors");
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let repo = create_test_repo().await;

        let first = repo.save_search(1, "errors", "level:error", "").await.unwrap();
        let err = repo
            .save_search(1, "errors", "level:warn", "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSearchName(_)));
        assert!(err.is_validation());

        // First is unaffected
        let fetched = repo.get_saved_search(first.id, 1).await.unwrap();
        assert_eq!(fetched.query_string, "level:error");

        // Same name for another owner is fine
        repo.save_search(2, "errors", "level:error", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let repo = create_test_repo().await;
        let err = repo.save_search(1, "  ", "a", "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_get_hides_searches_from_strangers() {
        let repo = create_test_repo().await;
        let saved = repo.save_search(1, "errors", "level:error", "").await.unwrap();

        let stranger = repo.get_saved_search(saved.id, 2).await.unwrap_err();
        let missing = repo.get_saved_search(Uuid::new_v4(), 1).await.unwrap_err();
        assert!(stranger.is_access());
        assert!(missing.is_access());
        assert_eq!(stranger.code(), missing.code());
    }

    #[tokio::test]
    async fn test_update_owner_only() {
        let repo = create_test_repo().await;
        let saved = repo.save_search(1, "errors", "level:error", "").await.unwrap();
        repo.share_search(saved.id, 1, 2).await.unwrap();

        let update = SavedSearchUpdate::default().query_string("level:warn");
        let err = repo.update_saved_search(saved.id, 2, &update).await.unwrap_err();
        assert!(err.is_access());

        let updated = repo.update_saved_search(saved.id, 1, &update).await.unwrap();
        assert_eq!(updated.query_string, "level:warn");
        assert_eq!(updated.name, "errors");
        assert!(updated.updated_at >= saved.updated_at);
    }

    #[tokio::test]
    async fn test_rename_to_existing_name_is_conflict() {
        let repo = create_test_repo().await;
        repo.save_search(1, "a", "x", "").await.unwrap();
        let b = repo.save_search(1, "b", "y", "").await.unwrap();

        let err = repo
            .update_saved_search(b.id, 1, &SavedSearchUpdate::default().name("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSearchName(_)));
    }

    #[tokio::test]
    async fn test_delete_owner_only_and_cascades() {
        let repo = create_test_repo().await;
        let saved = repo.save_search(1, "errors", "level:error", "").await.unwrap();
        repo.share_search(saved.id, 1, 2).await.unwrap();

        assert!(repo.delete_saved_search(saved.id, 2).await.unwrap_err().is_access());
        repo.delete_saved_search(saved.id, 1).await.unwrap();

        assert!(repo.get_shared_searches(2).await.unwrap().is_empty());
        assert!(repo.delete_saved_search(saved.id, 1).await.unwrap_err().is_access());
    }

    #[tokio::test]
    async fn test_list_includes_shared_most_recent_first() {
        let repo = create_test_repo().await;
        let own_old = repo.save_search(2, "mine", "a", "").await.unwrap();
        let shared = repo.save_search(1, "theirs", "b", "").await.unwrap();
        repo.save_search(3, "unrelated", "c", "").await.unwrap();
        repo.share_search(shared.id, 1, 2).await.unwrap();
        let touched = repo
            .update_saved_search(own_old.id, 2, &SavedSearchUpdate::default().description("bumped"))
            .await
            .unwrap();

        let listed = repo.list_user_searches(2).await.unwrap();
        let names: Vec<_> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["mine", "theirs"]);
        assert_eq!(listed[0].updated_at, touched.updated_at);

        let page = repo.list_user_searches_paginated(2, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "theirs");
    }

    #[tokio::test]
    async fn test_share_is_idempotent_and_owner_only() {
        let repo = create_test_repo().await;
        let saved = repo.save_search(1, "errors", "level:error", "").await.unwrap();

        repo.share_search(saved.id, 1, 2).await.unwrap();
        repo.share_search(saved.id, 1, 2).await.unwrap();
        assert_eq!(repo.list_grants(saved.id, 1).await.unwrap().len(), 1);

        // Grantee cannot re-share
        assert!(repo.share_search(saved.id, 2, 3).await.unwrap_err().is_access());
        assert!(matches!(
            repo.share_search(saved.id, 1, 1).await,
            Err(Error::InvalidInput(_))
        ));

        let fetched = repo.get_saved_search(saved.id, 2).await.unwrap();
        assert_eq!(fetched.owner_user_id, 1);
    }

    #[tokio::test]
    async fn test_revoke_share() {
        let repo = create_test_repo().await;
        let saved = repo.save_search(1, "errors", "level:error", "").await.unwrap();
        repo.share_search(saved.id, 1, 2).await.unwrap();
        assert_eq!(repo.get_shared_searches(2).await.unwrap().len(), 1);

        assert!(repo.revoke_share(saved.id, 2, 2).await.unwrap_err().is_access());
        repo.revoke_share(saved.id, 1, 2).await.unwrap();
        repo.revoke_share(saved.id, 1, 2).await.unwrap();

        assert!(repo.get_shared_searches(2).await.unwrap().is_empty());
        assert!(repo.get_saved_search(saved.id, 2).await.unwrap_err().is_access());
    }

    #[tokio::test]
    async fn test_history_dedup() {
        let repo = create_test_repo().await;
        for query in ["a", "b", "a"] {
            repo.save_search_history(1, query, 0).await.unwrap();
        }

        assert_eq!(repo.get_recent_searches(1, 50).await.unwrap(), vec!["a", "b"]);
        let history = repo.get_search_history(1, 50).await.unwrap();
        let queries: Vec<_> = history.iter().map(|h| h.query_string.as_str()).collect();
        assert_eq!(queries, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_history_is_capped_fifo() {
        let db = Database::in_memory().await.unwrap();
        let repo = SearchRepository::new(db.pool().clone()).with_history_limit(3);

        for i in 0..5 {
            repo.save_search_history(1, &format!("q{}", i), 0).await.unwrap();
        }
        repo.save_search_history(2, "other", 0).await.unwrap();

        let history = repo.get_search_history(1, 0).await.unwrap();
        let queries: Vec<_> = history.iter().map(|h| h.query_string.as_str()).collect();
        assert_eq!(queries, vec!["q4", "q3", "q2"]);
        assert_eq!(repo.get_search_history(2, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_frequent_searches_and_clear() {
        let repo = create_test_repo().await;
        for query in ["a", "b", "b", "c", "b", "a"] {
            repo.save_search_history(1, query, 0).await.unwrap();
        }

        let frequent = repo.get_frequent_searches(1, 2).await.unwrap();
        assert_eq!(
            frequent,
            vec![
                FrequentSearch { query_string: "b".to_string(), count: 3 },
                FrequentSearch { query_string: "a".to_string(), count: 2 },
            ]
        );

        assert_eq!(repo.clear_search_history(1).await.unwrap(), 6);
        assert!(repo.get_recent_searches(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_history_before() {
        let repo = create_test_repo().await;
        repo.save_search_history(1, "old", 0).await.unwrap();

        assert_eq!(repo.delete_history_before(Utc::now() - Duration::days(1)).await.unwrap(), 0);
        assert_eq!(repo.delete_history_before(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_execute_full_text_and_fields() {
        let repo = create_test_repo().await;
        seed(&repo).await;
        let none = SearchFilters::default();

        let (messages, total) = run(&repo, "timeout", &none).await;
        assert_eq!(total, 2);
        assert_eq!(messages, vec!["slow request, Timeout close", "upstream timeout after 30s"]);

        // level column is case-insensitive
        let (_, total) = run(&repo, "level:error", &none).await;
        assert_eq!(total, 2);

        let (messages, _) = run(&repo, "level:error AND (timeout OR \"connection refused\")", &none).await;
        assert_eq!(messages, vec!["connection refused", "upstream timeout after 30s"]);

        let (messages, _) = run(&repo, "service:api NOT timeout", &none).await;
        assert_eq!(messages, vec!["request served"]);

        let (messages, _) = run(&repo, "/after \\d+s$/", &none).await;
        assert_eq!(messages, vec!["upstream timeout after 30s"]);

        let (_, total) = run(&repo, "time:2024-01-15T10:01", &none).await;
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_execute_case_sensitive() {
        let repo = create_test_repo().await;
        seed(&repo).await;
        let parser = QueryParser::default();

        let query = parser.parse("Timeout").unwrap().with_case_sensitivity(true);
        let (entries, total) = repo
            .execute_compiled_predicate(
                &compile(&query).unwrap(),
                &SearchFilters::default(),
                PageRequest::default(),
                Sort::default(),
                &live(),
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].message, "slow request, Timeout close");
    }

    #[tokio::test]
    async fn test_execute_filters_sort_and_paging() {
        let repo = create_test_repo().await;
        seed(&repo).await;
        let t = base_time();

        let filters = SearchFilters::between(t + Duration::minutes(1), t + Duration::minutes(3));
        let (messages, total) = run(&repo, "", &filters).await;
        assert_eq!(total, 2);
        assert_eq!(messages, vec!["request served", "connection refused"]);

        let filters = SearchFilters::default().with_services(["API"]).with_levels(["warn", "info"]);
        let (_, total) = run(&repo, "", &filters).await;
        assert_eq!(total, 2);

        let (entries, total) = repo
            .execute_compiled_predicate(
                &CompiledPredicate::match_all(),
                &SearchFilters::default(),
                PageRequest::new(2, 3),
                Sort::new(SortField::Timestamp, SortOrder::Asc),
                &live(),
            )
            .await
            .unwrap();
        assert_eq!(total, 4);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "slow request, Timeout close");
        assert_eq!(entries[0].metadata, Some(serde_json::json!({"host": "web-1"})));
    }

    #[tokio::test]
    async fn test_count_by_group() {
        let repo = create_test_repo().await;
        seed(&repo).await;

        let counts = repo
            .count_by_group(&CompiledPredicate::match_all(), &SearchFilters::default(), GroupBy::Level, &live())
            .await
            .unwrap();
        assert_eq!(counts.get("error"), Some(&2));
        assert_eq!(counts.get("info"), Some(&1));
        assert_eq!(counts.get("warn"), Some(&1));

        let counts = repo
            .count_by_group(&predicate("timeout"), &SearchFilters::default(), GroupBy::Service, &live())
            .await
            .unwrap();
        assert_eq!(counts, HashMap::from([("api".to_string(), 2)]));
    }

    async fn seed_bulk(pool: &SqlitePool, rows: i64) {
        sqlx::query(
            r#"
            INSERT INTO log_entries (timestamp, level, service, message)
            WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < ?)
            SELECT ?, 'info', 'worker', 'job ' || i || ' handled ' || (CASE WHEN i % 2 = 0 THEN 'fine' ELSE 'late' END)
            FROM n
            "#,
        )
        .bind(rows)
        .bind(base_time())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_history_keeps_results_count() {
        let repo = create_test_repo().await;
        repo.save_search_history(1, "level:error", 12).await.unwrap();
        repo.save_search_history(1, "service:db", 0).await.unwrap();

        let history = repo.get_search_history(1, 10).await.unwrap();
        assert_eq!(history[0].query_string, "service:db");
        assert_eq!(history[0].results_count, 0);
        assert_eq!(history[1].results_count, 12);
    }

    #[tokio::test]
    async fn test_public_searches_are_readable_by_anyone() {
        let repo = create_test_repo().await;
        let private = repo.save_search(1, "mine", "level:error", "").await.unwrap();
        let public = repo.save_search(1, "ours", "service:api", "").await.unwrap();
        assert!(!public.is_public);

        let update = SavedSearchUpdate::default().is_public(true);
        assert!(repo.update_saved_search(public.id, 2, &update).await.unwrap_err().is_access());
        let updated = repo.update_saved_search(public.id, 1, &update).await.unwrap();
        assert!(updated.is_public);

        assert_eq!(repo.get_saved_search(public.id, 2).await.unwrap().name, "ours");
        assert!(repo.get_saved_search(private.id, 2).await.unwrap_err().is_access());

        let listed = repo.list_public_searches(10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, public.id);
        assert!(repo.list_public_searches(10, 1).await.unwrap().is_empty());

        // Public searches do not show up in other users' own lists
        assert!(repo.list_user_searches(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_metadata() {
        let repo = create_test_repo().await;
        let saved = repo.save_search(1, "errors", "level:error", "long description").await.unwrap();

        let metadata = repo.get_search_metadata(saved.id, 1).await.unwrap();
        assert_eq!(metadata.id, saved.id);
        assert_eq!(metadata.query_string, "level:error");
        assert_eq!(metadata.created_at, saved.created_at);

        assert!(repo.get_search_metadata(saved.id, 2).await.unwrap_err().is_access());
        repo.share_search(saved.id, 1, 2).await.unwrap();
        assert_eq!(repo.get_search_metadata(saved.id, 2).await.unwrap(), metadata);
        assert!(repo.get_search_metadata(Uuid::new_v4(), 1).await.unwrap_err().is_access());
    }

    #[tokio::test]
    async fn test_canceled_context_interrupts_scan() {
        let repo = create_test_repo().await;
        seed_bulk(repo.pool(), 5_000).await;

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let canceled = SearchContext::new().with_cancellation(token);
        let err = repo
            .execute_compiled_predicate(
                &predicate("/handled (fine|late)$/"),
                &SearchFilters::default(),
                PageRequest::default(),
                Sort::default(),
                &canceled,
            )
            .await
            .unwrap_err();
        assert!(err.is_canceled());

        // The handler is gone once the connection is back in the pool
        let (_, total) = run(&repo, "/handled fine$/", &SearchFilters::default()).await;
        assert_eq!(total, 2_500);
    }

    #[tokio::test]
    async fn test_exhausted_budget_interrupts_grouping() {
        let repo = create_test_repo().await;
        seed_bulk(repo.pool(), 5_000).await;

        let spent = SearchContext::new().with_budget(std::time::Duration::ZERO);
        let err = repo
            .count_by_group(&predicate("/late$/"), &SearchFilters::default(), GroupBy::Service, &spent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueryTooExpensive(0)));

        let counts = repo
            .count_by_group(&predicate("/late$/"), &SearchFilters::default(), GroupBy::Service, &live())
            .await
            .unwrap();
        assert_eq!(counts, HashMap::from([("worker".to_string(), 2_500)]));
    }

    #[tokio::test]
    async fn test_abandoned_query_leaves_connection_usable() {
        let repo = create_test_repo().await;
        seed_bulk(repo.pool(), 5_000).await;

        let scan = predicate("/job \\d+ handled/");
        let ctx = live();
        let filters = SearchFilters::default();
        let abandoned = repo.execute_compiled_predicate(
            &scan,
            &filters,
            PageRequest::default(),
            Sort::default(),
            &ctx,
        );
        // Either finishes or is dropped mid-statement
        let _ = tokio::time::timeout(std::time::Duration::from_millis(1), abandoned).await;

        let (_, total) = run(&repo, "/handled late$/", &SearchFilters::default()).await;
        assert_eq!(total, 2_500);
    }
}
