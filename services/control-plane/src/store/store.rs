//! SQLite-based state store.
//!
//! Holds accounts, budgets, the live node map, the append-only node journal,
//! the provisioning queue, scheduler membership and service units. Every
//! compound mutation runs inside one transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::models::{
    Budget, CloudAccount, DesiredState, JournalEntry, Membership, NodeInstance, NodeRequest,
    NodeStatus, ObservedState, ServiceUnit, UnitKind, Vendor,
};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("{0}")]
    Invalid(String),

    #[error("state store lock poisoned")]
    Poisoned,
}

/// Result of a store health check.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    /// Output of `PRAGMA integrity_check` (`ok` when healthy).
    pub integrity: String,
    /// Row count per table.
    pub tables: Vec<(String, i64)>,
}

impl StoreHealth {
    pub fn is_ok(&self) -> bool {
        self.integrity == "ok"
    }
}

const TABLES: &[&str] = &[
    "cloud_accounts",
    "account_endpoints",
    "protected_nodes",
    "budget",
    "node_map",
    "node_journal",
    "node_requests",
    "account_membership",
    "service_units",
];

const NODE_COLUMNS: &str =
    "hostname, node_type, account, instance_id, ip, started_at, status, rate, drain_started_at";

const JOURNAL_COLUMNS: &str =
    "id, hostname, node_type, account, instance_id, started_at, ended_at, rate, note";

const UNIT_COLUMNS: &str = "name, kind, target, desired, observed, restart_count, \
     last_restart_at, started_at, restart_requested";

/// SQLite state store.
///
/// The connection is guarded by a mutex so the store can be shared across
/// tasks behind an `Arc`.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets the CLI read while the daemon writes.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        Self::init(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cloud_accounts (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                vendor TEXT NOT NULL,
                vendor_account_id TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS account_endpoints (
                account TEXT NOT NULL REFERENCES cloud_accounts(name) ON DELETE CASCADE,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                PRIMARY KEY (account, name)
            );

            CREATE TABLE IF NOT EXISTS protected_nodes (
                account TEXT NOT NULL REFERENCES cloud_accounts(name) ON DELETE CASCADE,
                name TEXT NOT NULL,
                PRIMARY KEY (account, name)
            );

            CREATE TABLE IF NOT EXISTS budget (
                account TEXT PRIMARY KEY REFERENCES cloud_accounts(name) ON DELETE CASCADE,
                start_date TEXT NOT NULL,
                amount REAL NOT NULL CHECK (amount > 0),
                max_rate REAL NOT NULL CHECK (max_rate > 0)
            );

            CREATE TABLE IF NOT EXISTS node_map (
                hostname TEXT PRIMARY KEY,
                node_type TEXT NOT NULL,
                account TEXT NOT NULL REFERENCES cloud_accounts(name),
                instance_id TEXT,
                ip TEXT,
                started_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                rate REAL NOT NULL,
                drain_started_at INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_node_map_account ON node_map(account);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_node_map_instance
                ON node_map(account, instance_id) WHERE instance_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS node_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                node_type TEXT NOT NULL,
                account TEXT NOT NULL REFERENCES cloud_accounts(name),
                instance_id TEXT,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                rate REAL NOT NULL,
                note TEXT,
                CHECK (ended_at IS NULL OR ended_at >= started_at)
            );

            CREATE INDEX IF NOT EXISTS idx_node_journal_account ON node_journal(account, ended_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_node_journal_open
                ON node_journal(hostname) WHERE ended_at IS NULL;

            CREATE TRIGGER IF NOT EXISTS node_journal_closed_immutable
            BEFORE UPDATE ON node_journal
            WHEN OLD.ended_at IS NOT NULL
            BEGIN
                SELECT RAISE(ABORT, 'closed journal entries are immutable');
            END;

            CREATE TRIGGER IF NOT EXISTS node_journal_append_only
            BEFORE DELETE ON node_journal
            BEGIN
                SELECT RAISE(ABORT, 'node journal is append-only');
            END;

            CREATE TABLE IF NOT EXISTS node_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL REFERENCES cloud_accounts(name) ON DELETE CASCADE,
                node_type TEXT NOT NULL,
                count INTEGER NOT NULL CHECK (count > 0),
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS account_membership (
                username TEXT NOT NULL,
                account TEXT NOT NULL REFERENCES cloud_accounts(name) ON DELETE CASCADE,
                source_version INTEGER NOT NULL,
                PRIMARY KEY (username, account)
            );

            CREATE TABLE IF NOT EXISTS service_units (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                target TEXT,
                desired TEXT NOT NULL,
                observed TEXT NOT NULL,
                restart_count INTEGER NOT NULL DEFAULT 0,
                last_restart_at INTEGER,
                started_at INTEGER,
                restart_requested INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Verify the database and count rows per table.
    pub fn check(&self) -> Result<StoreHealth, StoreError> {
        let conn = self.conn()?;
        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;

        let mut tables = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            tables.push((table.to_string(), count));
        }

        Ok(StoreHealth { integrity, tables })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Insert a new account with its endpoints and protected nodes.
    pub fn insert_account(&self, account: &CloudAccount) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO cloud_accounts (name, owner, vendor, vendor_account_id, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account.name,
                account.owner,
                account.vendor.as_str(),
                account.vendor_account_id,
                account.active,
                account.created_at,
            ],
        )
        .map_err(|e| duplicate_or(e, format!("account {}", account.name)))?;

        for (name, address) in &account.endpoints {
            tx.execute(
                "INSERT INTO account_endpoints (account, name, address) VALUES (?1, ?2, ?3)",
                params![account.name, name, address],
            )?;
        }
        for name in &account.protected_nodes {
            tx.execute(
                "INSERT INTO protected_nodes (account, name) VALUES (?1, ?2)",
                params![account.name, name],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get an account.
    pub fn get_account(&self, name: &str) -> Result<Option<CloudAccount>, StoreError> {
        let conn = self.conn()?;
        load_account(&conn, name)
    }

    /// Get an account or fail with `NotFound`.
    pub fn require_account(&self, name: &str) -> Result<CloudAccount, StoreError> {
        self.get_account(name)?
            .ok_or_else(|| StoreError::NotFound(format!("account {name}")))
    }

    /// List all accounts.
    pub fn list_accounts(&self) -> Result<Vec<CloudAccount>, StoreError> {
        let conn = self.conn()?;
        let names: Vec<String> = conn
            .prepare("SELECT name FROM cloud_accounts ORDER BY name")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut accounts = Vec::with_capacity(names.len());
        for name in names {
            if let Some(account) = load_account(&conn, &name)? {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    /// Update the active flag.
    pub fn set_account_active(&self, name: &str, active: bool) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE cloud_accounts SET active = ?1 WHERE name = ?2",
            params![active, name],
        )?;
        require_updated(updated, || format!("account {name}"))
    }

    /// Change the vendor identity. Refused once nodes exist under the account.
    pub fn update_account_identity(
        &self,
        name: &str,
        vendor: Vendor,
        vendor_account_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let nodes: i64 = tx.query_row(
            "SELECT (SELECT COUNT(*) FROM node_map WHERE account = ?1)
                  + (SELECT COUNT(*) FROM node_journal WHERE account = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        if nodes > 0 {
            return Err(StoreError::Invalid(format!(
                "account {name} identity is immutable once nodes exist"
            )));
        }

        let updated = tx.execute(
            "UPDATE cloud_accounts SET vendor = ?1, vendor_account_id = ?2 WHERE name = ?3",
            params![vendor.as_str(), vendor_account_id, name],
        )?;
        require_updated(updated, || format!("account {name}"))?;
        tx.commit()?;
        Ok(())
    }

    /// Add or replace a named endpoint.
    pub fn set_endpoint(&self, account: &str, name: &str, address: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        require_account_row(&conn, account)?;
        conn.execute(
            "INSERT INTO account_endpoints (account, name, address) VALUES (?1, ?2, ?3)
             ON CONFLICT(account, name) DO UPDATE SET address = excluded.address",
            params![account, name, address],
        )?;
        Ok(())
    }

    /// Remove a named endpoint.
    pub fn remove_endpoint(&self, account: &str, name: &str) -> Result<(), StoreError> {
        let removed = self.conn()?.execute(
            "DELETE FROM account_endpoints WHERE account = ?1 AND name = ?2",
            params![account, name],
        )?;
        require_updated(removed, || format!("endpoint {name} of account {account}"))
    }

    /// Mark an instance name as protected.
    pub fn add_protected_node(&self, account: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        require_account_row(&conn, account)?;
        conn.execute(
            "INSERT OR IGNORE INTO protected_nodes (account, name) VALUES (?1, ?2)",
            params![account, name],
        )?;
        Ok(())
    }

    /// Delete an account that has never had nodes.
    pub fn delete_account(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let history: i64 = tx.query_row(
            "SELECT (SELECT COUNT(*) FROM node_map WHERE account = ?1)
                  + (SELECT COUNT(*) FROM node_journal WHERE account = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        if history > 0 {
            return Err(StoreError::Invalid(format!(
                "account {name} has node history and cannot be deleted; deactivate it instead"
            )));
        }

        let removed = tx.execute("DELETE FROM cloud_accounts WHERE name = ?1", params![name])?;
        require_updated(removed, || format!("account {name}"))?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Budgets
    // =========================================================================

    /// Create the budget for an account.
    pub fn insert_budget(&self, budget: &Budget) -> Result<(), StoreError> {
        let conn = self.conn()?;
        require_account_row(&conn, &budget.account)?;
        conn.execute(
            "INSERT INTO budget (account, start_date, amount, max_rate) VALUES (?1, ?2, ?3, ?4)",
            params![
                budget.account,
                budget.start_date.format("%Y-%m-%d").to_string(),
                budget.amount,
                budget.max_rate,
            ],
        )
        .map_err(|e| duplicate_or(e, format!("budget for account {}", budget.account)))?;
        Ok(())
    }

    /// Get the budget of an account.
    pub fn get_budget(&self, account: &str) -> Result<Option<Budget>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT account, start_date, amount, max_rate FROM budget WHERE account = ?1",
                params![account],
                budget_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// List all budgets.
    pub fn list_budgets(&self) -> Result<Vec<Budget>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT account, start_date, amount, max_rate FROM budget ORDER BY account",
        )?;
        let budgets = stmt
            .query_map([], budget_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(budgets)
    }

    /// Update the total amount.
    pub fn set_budget_amount(&self, account: &str, amount: f64) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE budget SET amount = ?1 WHERE account = ?2",
            params![amount, account],
        )?;
        require_updated(updated, || format!("budget for account {account}"))
    }

    /// Update the per-node rate cap.
    pub fn set_budget_rate(&self, account: &str, max_rate: f64) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE budget SET max_rate = ?1 WHERE account = ?2",
            params![max_rate, account],
        )?;
        require_updated(updated, || format!("budget for account {account}"))
    }

    /// Start a new billing period.
    pub fn set_budget_start(&self, account: &str, start: NaiveDate) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE budget SET start_date = ?1 WHERE account = ?2",
            params![start.format("%Y-%m-%d").to_string(), account],
        )?;
        require_updated(updated, || format!("budget for account {account}"))
    }

    // =========================================================================
    // Node map
    // =========================================================================

    /// List live nodes of an account, oldest first.
    pub fn list_nodes(&self, account: &str) -> Result<Vec<NodeInstance>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM node_map WHERE account = ?1 ORDER BY started_at, hostname"
        ))?;
        let nodes = stmt
            .query_map(params![account], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    /// List every live node.
    pub fn list_all_nodes(&self) -> Result<Vec<NodeInstance>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM node_map ORDER BY account, started_at, hostname"
        ))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    /// Get a live node by hostname.
    pub fn get_node(&self, hostname: &str) -> Result<Option<NodeInstance>, StoreError> {
        self.conn()?
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM node_map WHERE hostname = ?1"),
                params![hostname],
                node_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Find a live node of `account` by hostname or vendor instance id.
    pub fn find_node(&self, account: &str, key: &str) -> Result<Option<NodeInstance>, StoreError> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM node_map
                     WHERE account = ?1 AND (hostname = ?2 OR instance_id = ?2)"
                ),
                params![account, key],
                node_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert a node and open its journal entry in one transaction.
    ///
    /// Returns the journal entry id.
    pub fn insert_node(&self, node: &NodeInstance, note: Option<&str>) -> Result<i64, StoreError> {
        if node.status.is_terminal() {
            return Err(StoreError::Invalid(format!(
                "cannot insert node {} in terminal state {}",
                node.hostname, node.status
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO node_map (hostname, node_type, account, instance_id, ip, started_at,
                                   status, rate, drain_started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?6)",
            params![
                node.hostname,
                node.node_type,
                node.account,
                node.instance_id,
                node.ip,
                node.started_at,
                node.status.as_str(),
                node.rate,
                node.drain_started_at,
            ],
        )
        .map_err(|e| duplicate_or(e, format!("node {}", node.hostname)))?;

        tx.execute(
            "INSERT INTO node_journal (hostname, node_type, account, instance_id, started_at, rate, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node.hostname,
                node.node_type,
                node.account,
                node.instance_id,
                node.started_at,
                node.rate,
                note,
            ],
        )
        .map_err(|e| duplicate_or(e, format!("open journal entry for {}", node.hostname)))?;
        let journal_id = tx.last_insert_rowid();

        tx.commit()?;
        Ok(journal_id)
    }

    /// Attach the vendor instance to a provisioning node.
    ///
    /// A node still `provisioning` becomes `ready`; a node drained while its
    /// launch was in flight keeps `draining`. Returns the updated node, or
    /// `None` if the node was archived in the meantime.
    pub fn attach_instance(
        &self,
        hostname: &str,
        instance_id: &str,
        ip: Option<&str>,
        now: i64,
    ) -> Result<Option<NodeInstance>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(node) = select_node(&tx, hostname)? else {
            return Ok(None);
        };
        let status = match node.status {
            NodeStatus::Provisioning => NodeStatus::Ready,
            other => other,
        };

        tx.execute(
            "UPDATE node_map SET instance_id = ?1, ip = ?2, status = ?3, updated_at = ?4
             WHERE hostname = ?5",
            params![instance_id, ip, status.as_str(), now, hostname],
        )?;
        tx.execute(
            "UPDATE node_journal SET instance_id = ?1 WHERE hostname = ?2 AND ended_at IS NULL",
            params![instance_id, hostname],
        )?;

        let updated = select_node(&tx, hostname)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Move a node to `draining`.
    ///
    /// Returns `false` if the node was already draining.
    pub fn set_draining(&self, hostname: &str, now: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let node = select_node(&tx, hostname)?
            .ok_or_else(|| StoreError::NotFound(format!("node {hostname}")))?;
        if node.status == NodeStatus::Draining {
            return Ok(false);
        }

        tx.execute(
            "UPDATE node_map SET status = 'draining', drain_started_at = ?1, updated_at = ?1
             WHERE hostname = ?2",
            params![now, hostname],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Archive a node: close its journal entry and remove it from the live set.
    ///
    /// Idempotent: returns `None` if the node is no longer live.
    pub fn archive_node(
        &self,
        hostname: &str,
        status: NodeStatus,
        now: i64,
        note: Option<&str>,
    ) -> Result<Option<JournalEntry>, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Invalid(format!(
                "archive requires a terminal status, got {status}"
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(node) = select_node(&tx, hostname)? else {
            return Ok(None);
        };

        let ended_at = now.max(node.started_at);
        let note = match note {
            Some(n) => Some(format!("{}: {n}", status.as_str())),
            None => Some(status.as_str().to_string()),
        };

        // Keep any note written at open time (e.g. `orphan`).
        let closed = tx.execute(
            "UPDATE node_journal
             SET ended_at = ?1,
                 instance_id = COALESCE(instance_id, ?2),
                 note = CASE WHEN note IS NULL THEN ?3 ELSE note || '; ' || ?3 END
             WHERE hostname = ?4 AND ended_at IS NULL",
            params![ended_at, node.instance_id, note, hostname],
        )?;
        if closed != 1 {
            return Err(StoreError::Invalid(format!(
                "node {hostname} has {closed} open journal entries"
            )));
        }

        tx.execute("DELETE FROM node_map WHERE hostname = ?1", params![hostname])?;

        let entry = tx.query_row(
            &format!(
                "SELECT {JOURNAL_COLUMNS} FROM node_journal
                 WHERE hostname = ?1 AND ended_at = ?2 ORDER BY id DESC LIMIT 1"
            ),
            params![hostname, ended_at],
            journal_from_row,
        )?;

        tx.commit()?;
        Ok(Some(entry))
    }

    // =========================================================================
    // Journal
    // =========================================================================

    /// Journal entries of an account, oldest first.
    pub fn list_journal(&self, account: &str) -> Result<Vec<JournalEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM node_journal WHERE account = ?1 ORDER BY id"
        ))?;
        let entries = stmt
            .query_map(params![account], journal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Closed journal entries of an account that ended after `since`.
    pub fn closed_journal_since(
        &self,
        account: &str,
        since: i64,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOURNAL_COLUMNS} FROM node_journal
             WHERE account = ?1 AND ended_at IS NOT NULL AND ended_at > ?2 ORDER BY id"
        ))?;
        let entries = stmt
            .query_map(params![account, since], journal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // =========================================================================
    // Provisioning queue
    // =========================================================================

    /// Queue a provisioning request. Returns its id.
    pub fn enqueue_request(
        &self,
        account: &str,
        node_type: &str,
        count: u32,
        now: i64,
    ) -> Result<i64, StoreError> {
        if count == 0 {
            return Err(StoreError::Invalid("request count must be positive".into()));
        }
        let conn = self.conn()?;
        require_account_row(&conn, account)?;
        conn.execute(
            "INSERT INTO node_requests (account, node_type, count, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![account, node_type, count, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending requests of an account, oldest first.
    pub fn list_requests(&self, account: &str) -> Result<Vec<NodeRequest>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, account, node_type, count, attempts, created_at, last_reason
             FROM node_requests WHERE account = ?1 ORDER BY id",
        )?;
        let requests = stmt
            .query_map(params![account], |row| {
                Ok(NodeRequest {
                    id: row.get(0)?,
                    account: row.get(1)?,
                    node_type: row.get(2)?,
                    count: row.get(3)?,
                    attempts: row.get(4)?,
                    created_at: row.get(5)?,
                    last_reason: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// One node of a request was admitted; drop the request when done.
    pub fn consume_request(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let count: Option<u32> = tx
            .query_row(
                "SELECT count FROM node_requests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match count {
            None => return Err(StoreError::NotFound(format!("request {id}"))),
            Some(n) if n > 1 => {
                tx.execute(
                    "UPDATE node_requests SET count = count - 1 WHERE id = ?1",
                    params![id],
                )?;
            }
            Some(_) => {
                tx.execute("DELETE FROM node_requests WHERE id = ?1", params![id])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Record a denied admission. Returns the new attempt count.
    pub fn record_request_denial(&self, id: i64, reason: &str) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE node_requests SET attempts = attempts + 1, last_reason = ?1 WHERE id = ?2",
            params![reason, id],
        )?;
        conn.query_row(
            "SELECT attempts FROM node_requests WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("request {id}")))
    }

    /// Drop a request.
    pub fn delete_request(&self, id: i64) -> Result<(), StoreError> {
        self.conn()?
            .execute("DELETE FROM node_requests WHERE id = ?1", params![id])?;
        Ok(())
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Record that `username` may use `account`.
    pub fn add_membership(&self, membership: &Membership) -> Result<(), StoreError> {
        let conn = self.conn()?;
        require_account_row(&conn, &membership.account)?;
        conn.execute(
            "INSERT INTO account_membership (username, account, source_version) VALUES (?1, ?2, ?3)
             ON CONFLICT(username, account) DO UPDATE SET source_version = excluded.source_version",
            params![membership.username, membership.account, membership.source_version],
        )?;
        Ok(())
    }

    /// Remove a membership row.
    pub fn remove_membership(&self, username: &str, account: &str) -> Result<(), StoreError> {
        let removed = self.conn()?.execute(
            "DELETE FROM account_membership WHERE username = ?1 AND account = ?2",
            params![username, account],
        )?;
        require_updated(removed, || format!("membership {username}@{account}"))
    }

    /// All membership rows.
    pub fn list_membership(&self) -> Result<Vec<Membership>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT username, account, source_version FROM account_membership
             ORDER BY account, username",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Membership {
                    username: row.get(0)?,
                    account: row.get(1)?,
                    source_version: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Service units
    // =========================================================================

    /// Register a unit (desired `running`, observed `unknown`).
    pub fn insert_unit(&self, name: &str, kind: &UnitKind, now: i64) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO service_units (name, kind, target, desired, observed, updated_at)
                 VALUES (?1, ?2, ?3, 'running', 'unknown', ?4)",
                params![name, kind.as_str(), kind.target(), now],
            )
            .map_err(|e| duplicate_or(e, format!("service {name}")))?;
        Ok(())
    }

    /// Get a unit.
    pub fn get_unit(&self, name: &str) -> Result<Option<ServiceUnit>, StoreError> {
        self.conn()?
            .query_row(
                &format!("SELECT {UNIT_COLUMNS} FROM service_units WHERE name = ?1"),
                params![name],
                unit_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// List all units.
    pub fn list_units(&self) -> Result<Vec<ServiceUnit>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM service_units ORDER BY name"
        ))?;
        let units = stmt
            .query_map([], unit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(units)
    }

    /// Set the desired state. Returns `false` if it was already set.
    pub fn set_unit_desired(
        &self,
        name: &str,
        desired: DesiredState,
        now: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT desired FROM service_units WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(format!("service {name}")));
        };
        if current == desired.as_str() {
            return Ok(false);
        }

        conn.execute(
            "UPDATE service_units SET desired = ?1, updated_at = ?2 WHERE name = ?3",
            params![desired.as_str(), now, name],
        )?;
        Ok(true)
    }

    /// Flag an operator restart (also sets desired `running`).
    pub fn request_unit_restart(&self, name: &str, now: i64) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE service_units SET desired = 'running', restart_requested = 1, updated_at = ?1
             WHERE name = ?2",
            params![now, name],
        )?;
        require_updated(updated, || format!("service {name}"))
    }

    /// Record the observed state after a health check.
    pub fn record_unit_observed(
        &self,
        name: &str,
        observed: ObservedState,
        started_at: Option<i64>,
        now: i64,
    ) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE service_units SET observed = ?1, started_at = ?2, updated_at = ?3 WHERE name = ?4",
            params![observed.as_str(), started_at, now, name],
        )?;
        require_updated(updated, || format!("service {name}"))
    }

    /// Count a restart performed by the supervisor.
    pub fn record_unit_restart(&self, name: &str, now: i64) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE service_units SET restart_count = restart_count + 1, last_restart_at = ?1,
                    restart_requested = 0, started_at = ?1, updated_at = ?1
             WHERE name = ?2",
            params![now, name],
        )?;
        require_updated(updated, || format!("service {name}"))
    }

    /// Clear a pending operator restart without counting it.
    pub fn clear_unit_restart_request(&self, name: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE service_units SET restart_requested = 0 WHERE name = ?1",
            params![name],
        )?;
        Ok(())
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn duplicate_or(err: rusqlite::Error, what: String) -> StoreError {
    if is_constraint_violation(&err) {
        StoreError::Duplicate(what)
    } else {
        StoreError::Sqlite(err)
    }
}

fn require_updated(rows: usize, what: impl FnOnce() -> String) -> Result<(), StoreError> {
    if rows == 0 {
        Err(StoreError::NotFound(what()))
    } else {
        Ok(())
    }
}

fn require_account_row(conn: &Connection, account: &str) -> Result<(), StoreError> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM cloud_accounts WHERE name = ?1",
            params![account],
            |row| row.get(0),
        )
        .optional()?;
    exists
        .map(|_| ())
        .ok_or_else(|| StoreError::NotFound(format!("account {account}")))
}

fn load_account(conn: &Connection, name: &str) -> Result<Option<CloudAccount>, StoreError> {
    let row = conn
        .query_row(
            "SELECT name, owner, vendor, vendor_account_id, active, created_at
             FROM cloud_accounts WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((name, owner, vendor, vendor_account_id, active, created_at)) = row else {
        return Ok(None);
    };
    let vendor: Vendor = vendor.parse().map_err(StoreError::Invalid)?;

    let endpoints: BTreeMap<String, String> = conn
        .prepare("SELECT name, address FROM account_endpoints WHERE account = ?1")?
        .query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    let protected_nodes: BTreeSet<String> = conn
        .prepare("SELECT name FROM protected_nodes WHERE account = ?1")?
        .query_map(params![name], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    Ok(Some(CloudAccount {
        name,
        owner,
        vendor,
        vendor_account_id,
        endpoints,
        protected_nodes,
        active,
        created_at,
    }))
}

fn select_node(tx: &Transaction<'_>, hostname: &str) -> Result<Option<NodeInstance>, StoreError> {
    tx.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM node_map WHERE hostname = ?1"),
        params![hostname],
        node_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn invalid_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeInstance> {
    let status: String = row.get(6)?;
    Ok(NodeInstance {
        hostname: row.get(0)?,
        node_type: row.get(1)?,
        account: row.get(2)?,
        instance_id: row.get(3)?,
        ip: row.get(4)?,
        started_at: row.get(5)?,
        status: NodeStatus::from_str(&status).ok_or_else(|| invalid_column(6, &status))?,
        rate: row.get(7)?,
        drain_started_at: row.get(8)?,
    })
}

fn journal_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        id: row.get(0)?,
        hostname: row.get(1)?,
        node_type: row.get(2)?,
        account: row.get(3)?,
        instance_id: row.get(4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
        rate: row.get(7)?,
        note: row.get(8)?,
    })
}

fn budget_from_row(row: &Row<'_>) -> rusqlite::Result<Budget> {
    let start: String = row.get(1)?;
    Ok(Budget {
        account: row.get(0)?,
        start_date: NaiveDate::parse_from_str(&start, "%Y-%m-%d")
            .map_err(|_| invalid_column(1, &start))?,
        amount: row.get(2)?,
        max_rate: row.get(3)?,
    })
}

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceUnit> {
    let kind: String = row.get(1)?;
    let target: Option<String> = row.get(2)?;
    let desired: String = row.get(3)?;
    let observed: String = row.get(4)?;

    Ok(ServiceUnit {
        name: row.get(0)?,
        kind: UnitKind::from_parts(&kind, target.as_deref()).map_err(|_| invalid_column(1, &kind))?,
        desired: DesiredState::from_str(&desired).ok_or_else(|| invalid_column(3, &desired))?,
        observed: ObservedState::from_str(&observed).ok_or_else(|| invalid_column(4, &observed))?,
        restart_count: row.get(5)?,
        last_restart_at: row.get(6)?,
        started_at: row.get(7)?,
        restart_requested: row.get(8)?,
    })
}
