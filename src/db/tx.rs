use std::collections::HashSet;

use sqlx::pool::PoolConnection;
use sqlx::{Row as _, Sqlite, SqliteConnection, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Whether foreign-key enforcement stays on for the duration of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityMode {
    Enforced,
    Relaxed,
}

/// Where a lifecycle operation gets its transaction from.
pub enum TxTarget<'a> {
    /// No transaction is open; the operation begins, commits and rolls back its own.
    Pool(&'a SqlitePool),
    /// The caller already holds an open transaction on this connection. The
    /// operation nests inside it and never finishes the caller's transaction.
    Open(&'a mut SqliteConnection),
}

enum Inner<'a> {
    Owned {
        conn: PoolConnection<Sqlite>,
        restore_foreign_keys: bool,
    },
    Joined {
        conn: &'a mut SqliteConnection,
        savepoint: String,
        deferred: Option<DeferredChecks>,
    },
}

/// Foreign-key checks a joined handle postponed to the caller's commit.
struct DeferredChecks {
    /// Violations already present when the handle joined.
    baseline: HashSet<ViolationKey>,
    was_deferred: bool,
}

type ViolationKey = (String, Option<i64>, i64);

/// A row whose declared reference points at a missing parent row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
}

/// Explicit transaction handle threaded through every statement of an
/// import or reset. Ownership of BEGIN/COMMIT/ROLLBACK is a property of the
/// handle: an owned handle drives a real transaction on a pooled connection,
/// a joined handle only ever touches its own SAVEPOINT.
pub struct TxHandle<'a> {
    inner: Inner<'a>,
    finished: bool,
}

impl<'a> TxHandle<'a> {
    pub async fn open(target: TxTarget<'a>, mode: IntegrityMode) -> Result<Self, sqlx::Error> {
        match target {
            TxTarget::Pool(pool) => TxHandle::begin(pool, mode).await,
            TxTarget::Open(conn) => TxHandle::join(conn, mode).await,
        }
    }

    /// Begin an owned write transaction. With [`IntegrityMode::Relaxed`] the
    /// connection's foreign-key enforcement is switched off before BEGIN (SQLite
    /// ignores the pragma inside a transaction) and restored when the handle
    /// finishes, on both the commit and the rollback path.
    pub async fn begin(pool: &SqlitePool, mode: IntegrityMode) -> Result<TxHandle<'static>, sqlx::Error> {
        TxHandle::begin_with(pool, mode, "BEGIN IMMEDIATE").await
    }

    /// Begin an owned read transaction giving a consistent snapshot.
    pub async fn begin_read(pool: &SqlitePool) -> Result<TxHandle<'static>, sqlx::Error> {
        TxHandle::begin_with(pool, IntegrityMode::Enforced, "BEGIN").await
    }

    async fn begin_with(
        pool: &SqlitePool,
        mode: IntegrityMode,
        begin_sql: &str,
    ) -> Result<TxHandle<'static>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        let mut restore_foreign_keys = false;
        if mode == IntegrityMode::Relaxed {
            let current: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
                .fetch_one(&mut *conn)
                .await?;
            if current != 0 {
                sqlx::query("PRAGMA foreign_keys = OFF")
                    .execute(&mut *conn)
                    .await?;
                restore_foreign_keys = true;
            }
        }

        if let Err(err) = sqlx::query(begin_sql).execute(&mut *conn).await {
            if restore_foreign_keys {
                restore_enforcement(&mut conn).await;
            }
            return Err(err);
        }
        info!(target: "tenant_lifecycle", event = "db_tx_begin", owner = true, integrity = ?mode);

        Ok(TxHandle {
            inner: Inner::Owned {
                conn,
                restore_foreign_keys,
            },
            finished: false,
        })
    }

    /// Nest inside the caller's open transaction through a savepoint.
    /// Relaxed mode on an enforcing connection defers foreign-key checks to
    /// the caller's commit; [`TxHandle::deferred_violations`] reports what
    /// that commit would reject.
    pub async fn join(conn: &'a mut SqliteConnection, mode: IntegrityMode) -> Result<Self, sqlx::Error> {
        let mut deferred = None;
        if mode == IntegrityMode::Relaxed {
            let enforced: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
                .fetch_one(&mut *conn)
                .await?;
            if enforced != 0 {
                let was_deferred: i64 = sqlx::query_scalar("PRAGMA defer_foreign_keys")
                    .fetch_one(&mut *conn)
                    .await?;
                let baseline = foreign_key_check(conn)
                    .await?
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect();
                deferred = Some(DeferredChecks {
                    baseline,
                    was_deferred: was_deferred != 0,
                });
            }
        }

        let savepoint = format!("lifecycle_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("SAVEPOINT {savepoint}"))
            .execute(&mut *conn)
            .await?;
        if deferred.is_some() {
            if let Err(err) = sqlx::query("PRAGMA defer_foreign_keys = ON")
                .execute(&mut *conn)
                .await
            {
                sqlx::query(&format!("ROLLBACK TO {savepoint}"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!("RELEASE {savepoint}"))
                    .execute(&mut *conn)
                    .await?;
                return Err(err);
            }
        }
        info!(
            target: "tenant_lifecycle",
            event = "db_tx_join",
            owner = false,
            savepoint = %savepoint,
            deferred_checks = deferred.is_some()
        );

        Ok(TxHandle {
            inner: Inner::Joined {
                conn,
                savepoint,
                deferred,
            },
            finished: false,
        })
    }

    /// Foreign-key violations added since a joined handle deferred its
    /// checks. Empty when nothing was deferred.
    pub async fn deferred_violations(&mut self) -> Result<Vec<ForeignKeyViolation>, sqlx::Error> {
        let Inner::Joined {
            conn,
            deferred: Some(checks),
            ..
        } = &mut self.inner
        else {
            return Ok(Vec::new());
        };
        Ok(foreign_key_check(conn)
            .await?
            .into_iter()
            .filter(|(key, _)| !checks.baseline.contains(key))
            .map(|(_, violation)| violation)
            .collect())
    }

    pub fn is_owner(&self) -> bool {
        matches!(self.inner, Inner::Owned { .. })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        match &mut self.inner {
            Inner::Owned { conn, .. } => &mut **conn,
            Inner::Joined { conn, .. } => &mut **conn,
        }
    }

    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        self.finished = true;
        match &mut self.inner {
            Inner::Owned {
                conn,
                restore_foreign_keys,
            } => {
                if let Err(err) = sqlx::query("COMMIT").execute(&mut **conn).await {
                    error!(target: "tenant_lifecycle", event = "db_tx_commit_failed", error = %err);
                    if let Err(rb) = sqlx::query("ROLLBACK").execute(&mut **conn).await {
                        error!(target: "tenant_lifecycle", event = "db_tx_rollback_failed", error = %rb);
                        conn.close_on_drop();
                    }
                    if *restore_foreign_keys {
                        restore_enforcement(conn).await;
                    }
                    return Err(err);
                }
                if *restore_foreign_keys {
                    restore_enforcement(conn).await;
                }
                info!(target: "tenant_lifecycle", event = "db_tx_commit");
            }
            Inner::Joined {
                conn,
                savepoint,
                deferred,
            } => {
                sqlx::query(&format!("RELEASE {savepoint}"))
                    .execute(&mut **conn)
                    .await?;
                restore_deferral(conn, deferred.as_ref()).await?;
                info!(target: "tenant_lifecycle", event = "db_savepoint_release", savepoint = %savepoint);
            }
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        self.finished = true;
        match &mut self.inner {
            Inner::Owned {
                conn,
                restore_foreign_keys,
            } => {
                let result = sqlx::query("ROLLBACK").execute(&mut **conn).await;
                if result.is_err() {
                    conn.close_on_drop();
                }
                if *restore_foreign_keys {
                    restore_enforcement(conn).await;
                }
                result?;
                warn!(target: "tenant_lifecycle", event = "db_tx_rollback");
            }
            Inner::Joined {
                conn,
                savepoint,
                deferred,
            } => {
                sqlx::query(&format!("ROLLBACK TO {savepoint}"))
                    .execute(&mut **conn)
                    .await?;
                sqlx::query(&format!("RELEASE {savepoint}"))
                    .execute(&mut **conn)
                    .await?;
                restore_deferral(conn, deferred.as_ref()).await?;
                warn!(target: "tenant_lifecycle", event = "db_savepoint_rollback", savepoint = %savepoint);
            }
        }
        Ok(())
    }
}

impl Drop for TxHandle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match &mut self.inner {
            // Never hand a connection that is mid-transaction (or has enforcement
            // switched off) back to the pool.
            Inner::Owned { conn, .. } => {
                warn!(target: "tenant_lifecycle", event = "db_tx_dropped_unfinished");
                conn.close_on_drop();
            }
            Inner::Joined { savepoint, .. } => {
                error!(
                    target: "tenant_lifecycle",
                    event = "db_savepoint_dropped_unfinished",
                    savepoint = %savepoint
                );
            }
        }
    }
}

async fn foreign_key_check(
    conn: &mut SqliteConnection,
) -> Result<Vec<(ViolationKey, ForeignKeyViolation)>, sqlx::Error> {
    let rows = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut *conn)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let violation = ForeignKeyViolation {
            table: row.try_get("table")?,
            rowid: row.try_get("rowid")?,
            parent: row.try_get("parent")?,
        };
        let fkid: i64 = row.try_get("fkid")?;
        out.push(((violation.table.clone(), violation.rowid, fkid), violation));
    }
    Ok(out)
}

/// `defer_foreign_keys` outlives a savepoint; put back the caller's setting.
async fn restore_deferral(
    conn: &mut SqliteConnection,
    deferred: Option<&DeferredChecks>,
) -> Result<(), sqlx::Error> {
    if deferred.is_some_and(|checks| !checks.was_deferred) {
        sqlx::query("PRAGMA defer_foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn restore_enforcement(conn: &mut PoolConnection<Sqlite>) {
    if let Err(err) = sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut **conn)
        .await
    {
        error!(target: "tenant_lifecycle", event = "db_integrity_restore_failed", error = %err);
        conn.close_on_drop();
    }
}
