// crates/engram-server/src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// `interact()` runs a closure on a pooled connection on the blocking
// thread pool; `interact_mut()` is the variant for transactional work
// that needs `&mut Connection` (BEGIN IMMEDIATE). Both have `_with_retry`
// forms that back off on SQLite contention.

use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Session settings applied to every file-backed connection. WAL keeps
/// readers off the writer's lock, NORMAL sync is safe under WAL, and the
/// busy timeout gives competing writers a 5s window before SQLITE_BUSY
/// reaches us at all.
const FILE_PRAGMAS: &str = "PRAGMA journal_mode=WAL; \
     PRAGMA synchronous=NORMAL; \
     PRAGMA foreign_keys=ON; \
     PRAGMA busy_timeout=5000; \
     PRAGMA journal_size_limit=32768;";

/// In-memory databases cannot run WAL; they keep only the settings that
/// still apply.
const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;";

/// Whether an error is SQLite write contention and therefore retryable.
///
/// Two codes qualify: SQLITE_BUSY from file databases and SQLITE_LOCKED
/// from the shared-cache in-memory databases the tests use. Anything else
/// is a real failure and propagates untouched.
fn is_contention_code(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi::ErrorCode;
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// Walk an anyhow chain for retryable contention, whether it surfaced as
/// a bare rusqlite error or wrapped in `EngramError::Db`. String-only
/// errors never qualify; only typed SQLite codes count.
pub(crate) fn is_sqlite_contention(err: &anyhow::Error) -> bool {
    if let Some(db_err) = err.downcast_ref::<rusqlite::Error>() {
        return is_contention_code(db_err);
    }
    matches!(
        err.downcast_ref::<crate::EngramError>(),
        Some(crate::EngramError::Db(inner)) if is_contention_code(inner)
    )
}

/// Backoff schedule for contended writes (10ms, 40ms, 100ms).
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(10),
    Duration::from_millis(40),
    Duration::from_millis(100),
];

/// Run `op`, sleeping through the backoff schedule whenever
/// `is_retryable` says the failure was contention. One attempt follows
/// each scheduled delay, so the operation runs at most
/// `RETRY_DELAYS.len() + 1` times.
async fn with_contention_retries<F, Fut, R, E>(
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> std::result::Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<R, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < RETRY_DELAYS.len() && is_retryable(&e) => {
                let delay = RETRY_DELAYS[attempt];
                attempt += 1;
                tracing::warn!(
                    "write contention ({}); backing off {:?} before attempt {}",
                    e,
                    delay,
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Which schema a pool carries.
#[derive(Debug, Clone, Copy)]
pub enum DbKind {
    /// Per-project database: facts, chat messages, chunks, embeddings.
    Project,
    /// Global alias table database.
    Alias,
}

/// Whether to use a file path or a shared in-memory URI.
enum DbStorage {
    File(PathBuf),
    InMemory { label: &'static str },
}

/// Database pool wrapper with per-connection setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
}

impl DatabasePool {
    /// Open a pooled database at the given path.
    pub async fn open(path: &Path, kind: DbKind) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf()), kind).await
    }

    /// Open a pooled in-memory database.
    ///
    /// The URI carries `cache=shared` so every connection in the pool
    /// lands on one database; a plain `:memory:` open would give each
    /// connection its own empty copy.
    pub async fn open_in_memory(kind: DbKind) -> Result<Self> {
        Self::open_internal(DbStorage::InMemory { label: "memdb" }, kind).await
    }

    /// Internal constructor shared by both open variants.
    async fn open_internal(storage: DbStorage, kind: DbKind) -> Result<Self> {
        let (conn_str, path) = match storage {
            DbStorage::File(p) => {
                prepare_db_directory(&p)?;
                (p.to_string_lossy().to_string(), Some(p))
            }
            DbStorage::InMemory { label } => {
                let uri = format!(
                    "file:{}_{}?mode=memory&cache=shared",
                    label,
                    uuid::Uuid::new_v4().simple()
                );
                (uri, None)
            }
        };

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("pool builder init failed")?
            .max_size(8)
            .post_create(connection_hook(path.clone()))
            .build()
            .context("connection pool construction failed")?;

        let db_pool = Self { pool, path };
        db_pool.run_migrations(kind).await?;
        Ok(db_pool)
    }

    /// Run a closure with a shared connection from the pool.
    ///
    /// Database work happens on deadpool's blocking threads, never on the
    /// async runtime itself.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("checkout from connection pool failed")?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("blocking database task failed: {e}"))?
    }

    /// Run a closure that needs exclusive access to the connection,
    /// e.g. to open an immediate transaction.
    pub async fn interact_mut<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("checkout from connection pool failed")?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("blocking database task failed: {e}"))?
    }

    /// Like [`interact`](Self::interact) but retries on SQLite contention
    /// with backoff (10ms, 40ms, 100ms). The closure must be `Clone`.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        with_contention_retries(
            || {
                let f_clone = f.clone();
                self.interact(f_clone)
            },
            |e: &anyhow::Error| is_sqlite_contention(e),
        )
        .await
    }

    /// Like [`interact_mut`](Self::interact_mut) with contention retry.
    /// Used for the write transactions that must not be lost.
    pub async fn interact_mut_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        with_contention_retries(
            || {
                let f_clone = f.clone();
                self.interact_mut(f_clone)
            },
            |e: &anyhow::Error| is_sqlite_contention(e),
        )
        .await
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run schema migrations for this pool's kind.
    async fn run_migrations(&self, kind: DbKind) -> Result<()> {
        self.interact(move |conn| {
            match kind {
                DbKind::Project => super::schema::run_project_migrations(conn)?,
                DbKind::Alias => super::schema::run_alias_migrations(conn)?,
            }
            if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                tracing::debug!("PRAGMA optimize skipped: {}", e);
            }
            Ok(())
        })
        .await
    }
}

/// Create the database's parent directory, owner-only on Unix.
fn prepare_db_directory(path: &Path) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating database directory {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("restricting database directory {}", dir.display()))?;
    }
    Ok(())
}

/// Post-create hook applying session pragmas to each new connection.
///
/// `db_file` selects the pragma set (file vs in-memory) and, on Unix,
/// gets its mode tightened to owner-only once the file exists.
fn connection_hook(db_file: Option<PathBuf>) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let db_file = db_file.clone();
        Box::pin(async move {
            let setup = conn
                .interact(move |conn| {
                    let pragmas = if db_file.is_some() {
                        FILE_PRAGMAS
                    } else {
                        MEMORY_PRAGMAS
                    };
                    conn.execute_batch(pragmas)?;

                    #[cfg(unix)]
                    if let Some(path) = &db_file {
                        restrict_db_file_mode(path);
                    }

                    Ok::<_, rusqlite::Error>(())
                })
                .await;

            match setup {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(deadpool_sqlite::HookError::Message(
                    format!("session pragmas rejected: {e}").into(),
                )),
                Err(e) => Err(deadpool_sqlite::HookError::Message(
                    format!("new connection unreachable: {e}").into(),
                )),
            }
        })
    })
}

/// Tighten the database file to owner-only (0o600).
///
/// The file may not exist until SQLite's first write; a later
/// connection's hook picks it up then, so a miss here is not an error.
#[cfg(unix)]
fn restrict_db_file_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        if let Err(e) = std::fs::set_permissions(path, perms) {
            tracing::warn!(
                "could not restrict {} to owner-only: {}",
                path.display(),
                e
            );
        }
    }
}
