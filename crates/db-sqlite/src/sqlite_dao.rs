use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::{
    Block, BlockId, Container, NotificationHint, Subscriber, Subscription, UserId, WorkspaceId,
    storage::{
        BlockHistoryQuery, BlockStore, DbConnection, DbConnectionError, DbError, DbPool,
        HintClaim, HintStore, SpecificError, SubscriptionStore, resolve_board_and_card,
    },
};
use conversions::{Millis, consistency_rusqlite};
use hashbrown::HashMap;
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Params, Row, Transaction, TransactionBehavior,
    named_params,
};
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, Span, debug, error, info, instrument, trace, warn};

#[derive(Debug, thiserror::Error)]
#[error("initialization error")]
pub struct InitializationError;

/*
mmap_size = 128MB - Set the global memory map so all processes can share some data
https://www.sqlite.org/pragma.html#pragma_mmap_size

journal_size_limit = 64 MB - limit on the WAL file to prevent unlimited growth
https://www.sqlite.org/pragma.html#pragma_journal_size_limit
*/
const PRAGMA: [[&str; 2]; 9] = [
    ["journal_mode", "wal"],
    ["synchronous", "FULL"],
    ["foreign_keys", "true"],
    ["busy_timeout", "1000"],
    ["cache_size", "10000"], // number of pages
    ["temp_store", "MEMORY"],
    ["mmap_size", "134217728"],
    ["journal_size_limit", "67108864"],
    ["integrity_check", ""],
];

// Append only
const CREATE_TABLE_T_METADATA: &str = r"
CREATE TABLE IF NOT EXISTS t_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schema_version INTEGER NOT NULL,
    created_at INTEGER NOT NULL
) STRICT
";
const T_METADATA_EXPECTED_SCHEMA_VERSION: u32 = 1;

/// Pending hints, at most one per block. Rows are deleted when claimed.
/// All timestamps are stored as milliseconds since the epoch.
const CREATE_TABLE_T_NOTIFICATION_HINT: &str = r"
CREATE TABLE IF NOT EXISTS t_notification_hint (
    block_id TEXT NOT NULL,
    block_type TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    modified_by_id TEXT NOT NULL,
    modified_by_name TEXT NOT NULL,
    create_at INTEGER NOT NULL,
    notify_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    PRIMARY KEY (block_id)
) STRICT
";
// Used when claiming the earliest hint
const IDX_T_NOTIFICATION_HINT_NOTIFY_AT: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_notification_hint_notify_at ON t_notification_hint (notify_at, block_id);
";

const CREATE_TABLE_T_SUBSCRIPTION: &str = r"
CREATE TABLE IF NOT EXISTS t_subscription (
    workspace_id TEXT NOT NULL,
    block_id TEXT NOT NULL,
    subscriber_id TEXT NOT NULL,
    block_type TEXT NOT NULL,
    subscriber_type TEXT NOT NULL,
    notified_at INTEGER NOT NULL,
    create_at INTEGER NOT NULL,
    PRIMARY KEY (workspace_id, block_id, subscriber_id)
) STRICT
";

/// Current state of every block, deleted blocks included.
const CREATE_TABLE_T_BLOCK: &str = r"
CREATE TABLE IF NOT EXISTS t_block (
    id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    parent_id TEXT,
    root_id TEXT NOT NULL,
    block_type TEXT NOT NULL,
    title TEXT NOT NULL,
    fields TEXT NOT NULL,
    created_by TEXT NOT NULL,
    modified_by TEXT NOT NULL,
    create_at INTEGER NOT NULL,
    update_at INTEGER NOT NULL,
    delete_at INTEGER,
    PRIMARY KEY (id)
) STRICT
";

/// Every version of every block. Append only.
/// `seq` orders rows written within the same millisecond.
const CREATE_TABLE_T_BLOCK_HISTORY: &str = r"
CREATE TABLE IF NOT EXISTS t_block_history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    parent_id TEXT,
    root_id TEXT NOT NULL,
    block_type TEXT NOT NULL,
    title TEXT NOT NULL,
    fields TEXT NOT NULL,
    created_by TEXT NOT NULL,
    modified_by TEXT NOT NULL,
    create_at INTEGER NOT NULL,
    update_at INTEGER NOT NULL,
    delete_at INTEGER
) STRICT
";
// Used in `get_block_history`
const IDX_T_BLOCK_HISTORY_ID_UPDATE_AT: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_block_history_id_update_at ON t_block_history (workspace_id, id, update_at);
";
// Used in `get_subtree_history`
const IDX_T_BLOCK_HISTORY_PARENT_ID_UPDATE_AT: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_block_history_parent_id_update_at ON t_block_history (workspace_id, parent_id, update_at);
";

const HINT_COLUMNS: &str = "block_id, block_type, workspace_id, modified_by_id, \
    modified_by_name, create_at, notify_at, attempts";
const BLOCK_COLUMNS: &str = "id, workspace_id, parent_id, root_id, block_type, title, fields, \
    created_by, modified_by, create_at, update_at, delete_at";

mod conversions {
    use chrono::{DateTime, Utc};
    use rusqlite::{
        ToSql,
        types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    };

    /// Timestamp stored as milliseconds since the epoch, so that SQL comparisons
    /// and `MAX` work on plain integers.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct Millis(pub(crate) DateTime<Utc>);

    impl ToSql for Millis {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::from(self.0.timestamp_millis()))
        }
    }

    impl FromSql for Millis {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            let millis = i64::column_result(value)?;
            DateTime::from_timestamp_millis(millis)
                .map(Millis)
                .ok_or(FromSqlError::OutOfRange(millis))
        }
    }

    // Used as a wrapper for `FromSqlError::Other`
    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    pub(crate) struct OtherError(&'static str);
    pub(crate) fn consistency_rusqlite(input: &'static str) -> rusqlite::Error {
        FromSqlError::other(OtherError(input)).into()
    }
}

fn hint_from_row(row: &Row) -> rusqlite::Result<NotificationHint> {
    Ok(NotificationHint {
        block_id: row.get("block_id")?,
        block_type: row.get("block_type")?,
        workspace_id: row.get("workspace_id")?,
        modified_by_id: row.get("modified_by_id")?,
        modified_by_name: row.get("modified_by_name")?,
        create_at: row.get::<_, Millis>("create_at")?.0,
        notify_at: row.get::<_, Millis>("notify_at")?.0,
        attempts: row.get("attempts")?,
    })
}

fn block_from_row(row: &Row) -> rusqlite::Result<Block> {
    let fields = match row.get::<_, serde_json::Value>("fields")? {
        serde_json::Value::Object(fields) => fields,
        other => {
            error!("Block fields must be a JSON object, got `{other}`");
            return Err(consistency_rusqlite("block fields must be a JSON object"));
        }
    };
    Ok(Block {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        root_id: row.get("root_id")?,
        workspace_id: row.get("workspace_id")?,
        block_type: row.get("block_type")?,
        title: row.get("title")?,
        fields,
        created_by: row.get("created_by")?,
        modified_by: row.get("modified_by")?,
        create_at: row.get::<_, Millis>("create_at")?.0,
        update_at: row.get::<_, Millis>("update_at")?.0,
        delete_at: row.get::<_, Option<Millis>>("delete_at")?.map(|m| m.0),
    })
}

#[derive(derive_more::Debug)]
enum ThreadCommand {
    Func {
        #[debug(skip)]
        func: Box<dyn FnOnce(&mut Connection) + Send>,
        sent_at: Instant,
        name: &'static str,
    },
    Shutdown,
}

/// Handle to a single sqlite connection owned by a dedicated thread.
/// Every operation is sent to the thread and runs in its own transaction.
#[derive(Clone, Debug)]
pub struct SqlitePool(SqlitePoolInner);

#[derive(Clone, Debug)]
struct SqlitePoolInner {
    shutdown_requested: Arc<AtomicBool>,
    shutdown_finished: Arc<AtomicBool>,
    command_tx: mpsc::Sender<ThreadCommand>,
    join_handle: Option<Arc<std::thread::JoinHandle<()>>>, // always Some, Optional for swapping in drop.
}

#[async_trait]
impl DbPool for SqlitePool {
    fn connection(&self) -> Arc<dyn DbConnection> {
        Arc::new(self.clone())
    }

    async fn close(&self) -> Result<(), DbError> {
        self.0.shutdown_requested.store(true, Ordering::Release);
        // Unblock the thread's blocking_recv. If the capacity is reached, the next processed message will trigger shutdown.
        let _ = self.0.command_tx.try_send(ThreadCommand::Shutdown);
        while !self.0.shutdown_finished.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }
}

impl Drop for SqlitePool {
    fn drop(&mut self) {
        let arc = self.0.join_handle.take().expect("join_handle was set");
        if let Ok(join_handle) = Arc::try_unwrap(arc) {
            // Last holder
            if !join_handle.is_finished() && !self.0.shutdown_finished.load(Ordering::Acquire) {
                warn!("SqlitePool was not closed properly");
                self.0.shutdown_requested.store(true, Ordering::Release);
                let _ = self.0.command_tx.try_send(ThreadCommand::Shutdown);
                // Not joining the thread, drop might be called from async context.
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub queue_capacity: usize,
    pub pragma_override: Option<HashMap<String, String>>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            pragma_override: None,
        }
    }
}

impl SqlitePool {
    fn init_thread(
        path: &Path,
        mut pragma_override: HashMap<String, String>,
    ) -> Result<Connection, InitializationError> {
        fn execute<P: Params>(
            conn: &Connection,
            sql: &str,
            params: P,
        ) -> Result<(), InitializationError> {
            conn.execute(sql, params).map(|_| ()).map_err(|err| {
                error!("Cannot run `{sql}` - {err:?}");
                InitializationError
            })
        }
        fn pragma_update(
            conn: &Connection,
            name: &str,
            value: &str,
        ) -> Result<(), InitializationError> {
            let res = if value.is_empty() {
                debug!("Querying PRAGMA {name}");
                conn.pragma_query(None, name, |row| {
                    debug!("{row:?}");
                    Ok(())
                })
            } else {
                debug!("Setting PRAGMA {name}={value}");
                conn.pragma_update(None, name, value)
            };
            res.map_err(|err| {
                error!("cannot update pragma `{name}`=`{value}` - {err:?}");
                InitializationError
            })
        }

        let conn = Connection::open_with_flags(path, OpenFlags::default()).map_err(|err| {
            error!("cannot open the connection - {err:?}");
            InitializationError
        })?;

        for [pragma_name, default_value] in PRAGMA {
            let pragma_value = pragma_override
                .remove(pragma_name)
                .unwrap_or_else(|| default_value.to_string());
            pragma_update(&conn, pragma_name, &pragma_value)?;
        }
        // drain the rest overrides
        for (pragma_name, pragma_value) in pragma_override.drain() {
            pragma_update(&conn, &pragma_name, &pragma_value)?;
        }

        // t_metadata
        execute(&conn, CREATE_TABLE_T_METADATA, [])?;
        // Insert row if not exists.
        execute(
            &conn,
            &format!(
                "INSERT INTO t_metadata (schema_version, created_at) VALUES
                    ({T_METADATA_EXPECTED_SCHEMA_VERSION}, ?) ON CONFLICT DO NOTHING"
            ),
            [Millis(Utc::now())],
        )?;
        // Fail on unexpected `schema_version`.
        let actual_version = conn
            .query_row(
                "SELECT schema_version FROM t_metadata ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, u32>("schema_version"),
            )
            .map_err(|err| {
                error!("Cannot read the schema version - {err:?}");
                InitializationError
            })?;
        if actual_version != T_METADATA_EXPECTED_SCHEMA_VERSION {
            error!(
                "wrong schema version, expected {T_METADATA_EXPECTED_SCHEMA_VERSION}, got {actual_version}"
            );
            return Err(InitializationError);
        }

        // t_notification_hint
        execute(&conn, CREATE_TABLE_T_NOTIFICATION_HINT, [])?;
        execute(&conn, IDX_T_NOTIFICATION_HINT_NOTIFY_AT, [])?;
        // t_subscription
        execute(&conn, CREATE_TABLE_T_SUBSCRIPTION, [])?;
        // t_block
        execute(&conn, CREATE_TABLE_T_BLOCK, [])?;
        // t_block_history
        execute(&conn, CREATE_TABLE_T_BLOCK_HISTORY, [])?;
        execute(&conn, IDX_T_BLOCK_HISTORY_ID_UPDATE_AT, [])?;
        execute(&conn, IDX_T_BLOCK_HISTORY_PARENT_ID_UPDATE_AT, [])?;
        Ok(conn)
    }

    fn connection_rpc(
        mut conn: Connection,
        shutdown_requested: &AtomicBool,
        shutdown_finished: &AtomicBool,
        mut command_rx: mpsc::Receiver<ThreadCommand>,
    ) {
        while let Some(command) = command_rx.blocking_recv() {
            match command {
                ThreadCommand::Func {
                    func,
                    sent_at,
                    name,
                } => {
                    if shutdown_requested.load(Ordering::Acquire) {
                        debug!("Received shutdown, dropping `{name}`");
                        break;
                    }
                    trace!(name, queued = ?sent_at.elapsed(), "Executing");
                    func(&mut conn);
                }
                ThreadCommand::Shutdown => {
                    debug!("Received shutdown");
                    break;
                }
            }
        }
        drop(conn);
        debug!("Closing command thread");
        shutdown_finished.store(true, Ordering::Release);
    }

    #[instrument(level = Level::DEBUG, skip_all, name = "sqlite_new")]
    pub async fn new<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, InitializationError> {
        let path = path.as_ref().to_owned();
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let shutdown_finished = Arc::new(AtomicBool::new(false));

        let (command_tx, command_rx) = mpsc::channel(config.queue_capacity);
        info!("Sqlite database location: {path:?}");
        let join_handle = {
            // Initialize the `Connection`.
            let init_task = tokio::task::spawn_blocking(move || {
                Self::init_thread(&path, config.pragma_override.unwrap_or_default())
            })
            .await;
            let conn = match init_task {
                Ok(res) => res?,
                Err(join_err) => {
                    error!("Initialization panic - {join_err:?}");
                    return Err(InitializationError);
                }
            };
            let shutdown_requested = shutdown_requested.clone();
            let shutdown_finished = shutdown_finished.clone();
            std::thread::Builder::new()
                .name("sqlite".to_string())
                .spawn(move || {
                    Self::connection_rpc(
                        conn,
                        &shutdown_requested,
                        &shutdown_finished,
                        command_rx,
                    );
                })
                .map_err(|err| {
                    error!("Cannot spawn the sqlite thread - {err:?}");
                    InitializationError
                })?
        };
        Ok(SqlitePool(SqlitePoolInner {
            shutdown_requested,
            shutdown_finished,
            command_tx,
            join_handle: Some(Arc::new(join_handle)),
        }))
    }

    async fn transaction_write<F, T>(&self, func: F, name: &'static str) -> Result<T, DbError>
    where
        F: FnOnce(&Transaction) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        self.transaction(func, true, name).await
    }

    async fn transaction_read<F, T>(&self, func: F, name: &'static str) -> Result<T, DbError>
    where
        F: FnOnce(&Transaction) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        self.transaction(func, false, name).await
    }

    /// Invokes the provided function wrapping a new [`rusqlite::Transaction`] that is committed automatically.
    /// Write transactions start as `IMMEDIATE` so that read-then-write sequences are atomic.
    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    async fn transaction<F, T>(&self, func: F, write: bool, name: &'static str) -> Result<T, DbError>
    where
        F: FnOnce(&Transaction) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let parent_span = Span::current();
        self.0
            .command_tx
            .send(ThreadCommand::Func {
                func: Box::new(move |conn| {
                    let result = parent_span.in_scope(|| -> Result<T, DbError> {
                        let transaction = conn.transaction_with_behavior(if write {
                            TransactionBehavior::Immediate
                        } else {
                            TransactionBehavior::Deferred
                        })?;
                        let ok = func(&transaction)?;
                        transaction.commit()?;
                        Ok(ok)
                    });
                    // The caller might have been cancelled.
                    let _ = tx.send(result);
                }),
                sent_at: Instant::now(),
                name,
            })
            .await
            .map_err(|_send_err| DbError::Connection(DbConnectionError::Closed))?;
        rx.await
            .map_err(|_recv_err| DbError::Connection(DbConnectionError::Closed))?
    }

    fn next_hint(
        tx: &Transaction,
        scope: Option<&WorkspaceId>,
    ) -> Result<Option<NotificationHint>, DbError> {
        let mut stmt = tx.prepare_cached(&format!(
            "SELECT {HINT_COLUMNS} FROM t_notification_hint \
            WHERE (:workspace_id IS NULL OR workspace_id = :workspace_id) \
            ORDER BY notify_at, block_id LIMIT 1"
        ))?;
        Ok(stmt
            .query_row(named_params! {":workspace_id": scope}, hint_from_row)
            .optional()?)
    }

    fn get_block_inner(
        tx: &Transaction,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<Block, DbError> {
        let mut stmt = tx.prepare_cached(&format!(
            "SELECT {BLOCK_COLUMNS} FROM t_block \
            WHERE id = :id AND workspace_id = :workspace_id AND delete_at IS NULL"
        ))?;
        Ok(stmt.query_row(
            named_params! {
                ":id": block_id,
                ":workspace_id": container.workspace_id,
            },
            block_from_row,
        )?)
    }

    /// Store the current state and append the same row to the history.
    fn write_block(tx: &Transaction, block: &Block) -> Result<(), DbError> {
        let fields = serde_json::Value::Object(block.fields.clone());
        let insert = |sql: &str| -> rusqlite::Result<usize> {
            tx.prepare_cached(sql)?.execute(named_params! {
                ":id": block.id,
                ":workspace_id": block.workspace_id,
                ":parent_id": block.parent_id,
                ":root_id": block.root_id,
                ":block_type": block.block_type,
                ":title": block.title,
                ":fields": fields,
                ":created_by": block.created_by,
                ":modified_by": block.modified_by,
                ":create_at": Millis(block.create_at),
                ":update_at": Millis(block.update_at),
                ":delete_at": block.delete_at.map(Millis),
            })
        };
        let values = ":id, :workspace_id, :parent_id, :root_id, :block_type, :title, :fields, \
            :created_by, :modified_by, :create_at, :update_at, :delete_at";
        insert(&format!(
            "INSERT INTO t_block ({BLOCK_COLUMNS}) VALUES ({values}) \
            ON CONFLICT (id) DO UPDATE SET \
            workspace_id = excluded.workspace_id, parent_id = excluded.parent_id, \
            root_id = excluded.root_id, block_type = excluded.block_type, \
            title = excluded.title, fields = excluded.fields, \
            created_by = excluded.created_by, modified_by = excluded.modified_by, \
            create_at = excluded.create_at, update_at = excluded.update_at, \
            delete_at = excluded.delete_at"
        ))?;
        insert(&format!(
            "INSERT INTO t_block_history ({BLOCK_COLUMNS}) VALUES ({values})"
        ))?;
        Ok(())
    }
}

#[async_trait]
impl HintStore for SqlitePool {
    #[instrument(level = Level::DEBUG, skip_all, fields(block_id = %hint.block_id))]
    async fn upsert_hint(
        &self,
        hint: NotificationHint,
        notify_freq: Duration,
    ) -> Result<NotificationHint, DbError> {
        let notify_at = hint.create_at + notify_freq;
        let stored = self
            .transaction_write(
                move |tx| {
                    let mut stmt = tx.prepare_cached(&format!(
                        "INSERT INTO t_notification_hint ({HINT_COLUMNS}) VALUES \
                        (:block_id, :block_type, :workspace_id, :modified_by_id, \
                        :modified_by_name, :create_at, :notify_at, 0) \
                        ON CONFLICT (block_id) DO UPDATE SET \
                        block_type = excluded.block_type, \
                        modified_by_id = excluded.modified_by_id, \
                        modified_by_name = excluded.modified_by_name, \
                        notify_at = MAX(t_notification_hint.notify_at, excluded.notify_at), \
                        attempts = 0 \
                        RETURNING {HINT_COLUMNS}"
                    ))?;
                    Ok(stmt.query_row(
                        named_params! {
                            ":block_id": hint.block_id,
                            ":block_type": hint.block_type,
                            ":workspace_id": hint.workspace_id,
                            ":modified_by_id": hint.modified_by_id,
                            ":modified_by_name": hint.modified_by_name,
                            ":create_at": Millis(hint.create_at),
                            ":notify_at": Millis(notify_at),
                        },
                        hint_from_row,
                    )?)
                },
                "upsert_hint",
            )
            .await?;
        trace!(notify_at = %stored.notify_at, "Upserted hint");
        Ok(stored)
    }

    async fn peek_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
    ) -> Result<Option<NotificationHint>, DbError> {
        let scope = scope.cloned();
        self.transaction_read(
            move |tx| Self::next_hint(tx, scope.as_ref()),
            "peek_next_hint",
        )
        .await
    }

    #[instrument(level = Level::TRACE, skip(self))]
    async fn claim_next_hint(
        &self,
        scope: Option<&WorkspaceId>,
        now: DateTime<Utc>,
    ) -> Result<HintClaim, DbError> {
        let scope = scope.cloned();
        self.transaction_write(
            move |tx| {
                let Some(next) = Self::next_hint(tx, scope.as_ref())? else {
                    return Ok(HintClaim::Empty);
                };
                if next.notify_at > now {
                    return Ok(HintClaim::NotReady {
                        notify_at: next.notify_at,
                    });
                }
                tx.prepare_cached("DELETE FROM t_notification_hint WHERE block_id = :block_id")?
                    .execute(named_params! {":block_id": next.block_id})?;
                Ok(HintClaim::Claimed(next))
            },
            "claim_next_hint",
        )
        .await
    }

    async fn requeue_hint(&self, hint: NotificationHint) -> Result<bool, DbError> {
        let block_id = hint.block_id.clone();
        let inserted = self
            .transaction_write(
                move |tx| {
                    let changed = tx
                        .prepare_cached(&format!(
                            "INSERT INTO t_notification_hint ({HINT_COLUMNS}) VALUES \
                            (:block_id, :block_type, :workspace_id, :modified_by_id, \
                            :modified_by_name, :create_at, :notify_at, :attempts) \
                            ON CONFLICT (block_id) DO NOTHING"
                        ))?
                        .execute(named_params! {
                            ":block_id": hint.block_id,
                            ":block_type": hint.block_type,
                            ":workspace_id": hint.workspace_id,
                            ":modified_by_id": hint.modified_by_id,
                            ":modified_by_name": hint.modified_by_name,
                            ":create_at": Millis(hint.create_at),
                            ":notify_at": Millis(hint.notify_at),
                            ":attempts": hint.attempts,
                        })?;
                    Ok(changed == 1)
                },
                "requeue_hint",
            )
            .await?;
        if !inserted {
            debug!(%block_id, "Not requeueing, a fresher hint exists");
        }
        Ok(inserted)
    }
}

#[async_trait]
impl SubscriptionStore for SqlitePool {
    async fn create_subscription(&self, subscription: Subscription) -> Result<(), DbError> {
        self.transaction_write(
            move |tx| {
                tx.prepare_cached(
                    "INSERT INTO t_subscription (workspace_id, block_id, subscriber_id, \
                    block_type, subscriber_type, notified_at, create_at) VALUES \
                    (:workspace_id, :block_id, :subscriber_id, :block_type, :subscriber_type, \
                    :notified_at, :create_at) \
                    ON CONFLICT (workspace_id, block_id, subscriber_id) DO UPDATE SET \
                    block_type = excluded.block_type, subscriber_type = excluded.subscriber_type",
                )?
                .execute(named_params! {
                    ":workspace_id": subscription.workspace_id,
                    ":block_id": subscription.block_id,
                    ":subscriber_id": subscription.subscriber_id,
                    ":block_type": subscription.block_type,
                    ":subscriber_type": subscription.subscriber_type,
                    ":notified_at": Millis(subscription.notified_at),
                    ":create_at": Millis(subscription.create_at),
                })?;
                Ok(())
            },
            "create_subscription",
        )
        .await
    }

    async fn delete_subscription(
        &self,
        container: &Container,
        block_id: &BlockId,
        subscriber_id: &UserId,
    ) -> Result<(), DbError> {
        let workspace_id = container.workspace_id.clone();
        let block_id = block_id.clone();
        let subscriber_id = subscriber_id.clone();
        self.transaction_write(
            move |tx| {
                let deleted = tx
                    .prepare_cached(
                        "DELETE FROM t_subscription WHERE workspace_id = :workspace_id \
                        AND block_id = :block_id AND subscriber_id = :subscriber_id",
                    )?
                    .execute(named_params! {
                        ":workspace_id": workspace_id,
                        ":block_id": block_id,
                        ":subscriber_id": subscriber_id,
                    })?;
                if deleted == 0 {
                    return Err(DbError::Specific(SpecificError::NotFound));
                }
                Ok(())
            },
            "delete_subscription",
        )
        .await
    }

    async fn subscribers_for_block(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<Vec<Subscriber>, DbError> {
        let workspace_id = container.workspace_id.clone();
        let block_id = block_id.clone();
        self.transaction_read(
            move |tx| {
                let mut stmt = tx.prepare_cached(
                    "SELECT subscriber_type, subscriber_id, notified_at FROM t_subscription \
                    WHERE workspace_id = :workspace_id AND block_id = :block_id \
                    ORDER BY notified_at, subscriber_id",
                )?;
                let subscribers = stmt
                    .query_map(
                        named_params! {
                            ":workspace_id": workspace_id,
                            ":block_id": block_id,
                        },
                        |row| {
                            Ok(Subscriber {
                                subscriber_type: row.get("subscriber_type")?,
                                subscriber_id: row.get("subscriber_id")?,
                                notified_at: row.get::<_, Millis>("notified_at")?.0,
                            })
                        },
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(subscribers)
            },
            "subscribers_for_block",
        )
        .await
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(%block_id, %notified_at))]
    async fn update_subscribers_notified_at(
        &self,
        container: &Container,
        block_id: &BlockId,
        notified_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let workspace_id = container.workspace_id.clone();
        let block_id = block_id.clone();
        self.transaction_write(
            move |tx| {
                tx.prepare_cached(
                    "UPDATE t_subscription SET notified_at = MAX(notified_at, :notified_at) \
                    WHERE workspace_id = :workspace_id AND block_id = :block_id",
                )?
                .execute(named_params! {
                    ":notified_at": Millis(notified_at),
                    ":workspace_id": workspace_id,
                    ":block_id": block_id,
                })?;
                Ok(())
            },
            "update_subscribers_notified_at",
        )
        .await
    }
}

#[async_trait]
impl BlockStore for SqlitePool {
    #[instrument(level = Level::TRACE, skip_all, fields(block_id = %block.id))]
    async fn insert_block(&self, block: Block) -> Result<(), DbError> {
        if block.workspace_id.is_empty() {
            return Err(DbError::Specific(SpecificError::ValidationFailed(
                "workspace id must not be empty".to_string(),
            )));
        }
        self.transaction_write(move |tx| Self::write_block(tx, &block), "insert_block")
            .await
    }

    async fn delete_block(
        &self,
        container: &Container,
        block_id: &BlockId,
        modified_by: &UserId,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let container = container.clone();
        let block_id = block_id.clone();
        let modified_by = modified_by.clone();
        self.transaction_write(
            move |tx| {
                let mut block = Self::get_block_inner(tx, &container, &block_id)?;
                block.modified_by = modified_by;
                block.update_at = deleted_at;
                block.delete_at = Some(deleted_at);
                Self::write_block(tx, &block)
            },
            "delete_block",
        )
        .await
    }

    async fn get_block(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<Block, DbError> {
        let container = container.clone();
        let block_id = block_id.clone();
        self.transaction_read(
            move |tx| Self::get_block_inner(tx, &container, &block_id),
            "get_block",
        )
        .await
    }

    async fn get_board_and_card(
        &self,
        container: &Container,
        block_id: &BlockId,
    ) -> Result<(Block, Option<Block>), DbError> {
        resolve_board_and_card(self, container, block_id).await
    }

    async fn get_block_history(
        &self,
        container: &Container,
        block_id: &BlockId,
        query: BlockHistoryQuery,
    ) -> Result<Vec<Block>, DbError> {
        let workspace_id = container.workspace_id.clone();
        let block_id = block_id.clone();
        self.transaction_read(
            move |tx| {
                let order = if query.descending { "DESC" } else { "ASC" };
                // Negative LIMIT means no limit.
                let limit = query
                    .limit
                    .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {BLOCK_COLUMNS} FROM t_block_history \
                    WHERE workspace_id = :workspace_id AND id = :id \
                    AND (:after IS NULL OR update_at > :after) \
                    AND (:until IS NULL OR update_at <= :until) \
                    ORDER BY update_at {order}, seq {order} LIMIT :limit"
                ))?;
                let rows = stmt
                    .query_map(
                        named_params! {
                            ":workspace_id": workspace_id,
                            ":id": block_id,
                            ":after": query.after.map(Millis),
                            ":until": query.until.map(Millis),
                            ":limit": limit,
                        },
                        block_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            },
            "get_block_history",
        )
        .await
    }

    async fn get_subtree_history(
        &self,
        container: &Container,
        parent_id: &BlockId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Block>, DbError> {
        let workspace_id = container.workspace_id.clone();
        let parent_id = parent_id.clone();
        self.transaction_read(
            move |tx| {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {BLOCK_COLUMNS} FROM t_block_history \
                    WHERE workspace_id = :workspace_id AND parent_id = :parent_id \
                    AND update_at > :after ORDER BY update_at, seq"
                ))?;
                let rows = stmt
                    .query_map(
                        named_params! {
                            ":workspace_id": workspace_id,
                            ":parent_id": parent_id,
                            ":after": Millis(after),
                        },
                        block_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            },
            "get_subtree_history",
        )
        .await
    }
}

#[cfg(any(test, feature = "tempfile"))]
pub mod tempfile {
    use super::{SqliteConfig, SqlitePool};
    use tempfile::NamedTempFile;

    pub async fn sqlite_pool() -> (SqlitePool, Option<NamedTempFile>) {
        if let Ok(path) = std::env::var("SQLITE_FILE") {
            (
                SqlitePool::new(path, SqliteConfig::default())
                    .await
                    .unwrap(),
                None,
            )
        } else {
            let file = NamedTempFile::new().unwrap();
            let path = file.path();
            (
                SqlitePool::new(path, SqliteConfig::default())
                    .await
                    .unwrap(),
                Some(file),
            )
        }
    }
}
