//! Relational storage for queue records, users, rcpt-hosts and DKIM
//! configurations.
//!
//! rusqlite is synchronous, so every call goes through a small pool and
//! `spawn_blocking`; callers stay async and never hold a connection across
//! an await point.

use crate::dkim::DkimConfig;
use crate::queue::QMessage;

/// A user of the system, read by the AUTH and relay paths.
#[derive(Debug, Clone)]
pub struct User {
    pub login: String,
    /// bcrypt hash
    pub passwd: String,
    pub auth_relay: bool,
    pub have_mailbox: bool,
}

/// A domain this server accepts mail for.
#[derive(Debug, Clone)]
pub struct Rcpthost {
    pub hostname: String,
    pub is_local: bool,
}

#[derive(Clone)]
pub struct Db {
    pool: r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>,
}

impl Db {
    pub fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        let manager = r2d2_sqlite::SqliteConnectionManager::file(path);
        let pool = r2d2::Pool::builder().build(manager)?;
        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    /// a private in-memory database, one connection so all callers see it
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let manager = r2d2_sqlite::SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.pool.get()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                mail_from TEXT NOT NULL,
                auth_user TEXT NOT NULL DEFAULT '',
                rcpt_to TEXT NOT NULL,
                message_id TEXT NOT NULL,
                host TEXT NOT NULL,
                added_at TEXT NOT NULL,
                last_update TEXT NOT NULL,
                next_delivery_scheduled_at TEXT NOT NULL,
                status INTEGER NOT NULL,
                delivery_failed_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_uuid ON queue (uuid);
            CREATE TABLE IF NOT EXISTS users (
                login TEXT PRIMARY KEY,
                passwd TEXT NOT NULL,
                auth_relay INTEGER NOT NULL DEFAULT 0,
                have_mailbox INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS rcpthosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL UNIQUE,
                is_local INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS dkim_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                pub_key TEXT NOT NULL,
                priv_key TEXT NOT NULL,
                selector TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT ''
            );
            "#,
        )?;
        Ok(())
    }

    async fn call<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

// users and rcpthosts
impl Db {
    pub async fn user_get(&self, login: &str) -> anyhow::Result<Option<User>> {
        let login = login.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare("SELECT login, passwd, auth_relay, have_mailbox FROM users WHERE login = ?1")?;
            let mut rows = stmt.query_map([&login], |row| {
                Ok(User {
                    login: row.get(0)?,
                    passwd: row.get(1)?,
                    auth_relay: row.get(2)?,
                    have_mailbox: row.get(3)?,
                })
            })?;
            rows.next().transpose().map_err(anyhow::Error::new)
        })
        .await
    }

    pub async fn user_create(&self, user: &User) -> anyhow::Result<()> {
        let user = user.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (login, passwd, auth_relay, have_mailbox) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user.login, user.passwd, user.auth_relay, user.have_mailbox],
            )?;
            Ok(())
        })
        .await
    }

    /// does a local mailbox exist for this (already lowercased) address
    pub async fn is_valid_local_rcpt(&self, address: &str) -> anyhow::Result<bool> {
        let address = address.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE login = ?1 AND have_mailbox = 1",
                [&address],
                |row| row.get(0),
            )?;
            Ok(count != 0)
        })
        .await
    }

    pub async fn rcpthost_get(&self, hostname: &str) -> anyhow::Result<Option<Rcpthost>> {
        let hostname = hostname.to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT hostname, is_local FROM rcpthosts WHERE hostname = ?1")?;
            let mut rows = stmt.query_map([&hostname], |row| {
                Ok(Rcpthost {
                    hostname: row.get(0)?,
                    is_local: row.get(1)?,
                })
            })?;
            rows.next().transpose().map_err(anyhow::Error::new)
        })
        .await
    }

    pub async fn rcpthost_create(&self, rcpthost: &Rcpthost) -> anyhow::Result<()> {
        let rcpthost = rcpthost.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO rcpthosts (hostname, is_local) VALUES (?1, ?2)",
                rusqlite::params![rcpthost.hostname, rcpthost.is_local],
            )?;
            Ok(())
        })
        .await
    }
}

// dkim configurations
impl Db {
    pub async fn dkim_get(&self, domain: &str) -> anyhow::Result<Option<DkimConfig>> {
        let domain = domain.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, domain, pub_key, priv_key, selector, headers FROM dkim_config WHERE domain = ?1",
            )?;
            let mut rows = stmt.query_map([&domain], map_dkim)?;
            rows.next().transpose().map_err(anyhow::Error::new)
        })
        .await
    }

    pub async fn dkim_save(&self, dkc: &DkimConfig) -> anyhow::Result<i64> {
        let dkc = dkc.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO dkim_config (domain, pub_key, priv_key, selector, headers)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![dkc.domain, dkc.pub_key, dkc.priv_key, dkc.selector, dkc.headers],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// delete the configuration; deleting an absent domain is not an error
    pub async fn dkim_delete(&self, domain: &str) -> anyhow::Result<()> {
        let domain = domain.to_string();
        self.call(move |conn| {
            conn.execute("DELETE FROM dkim_config WHERE domain = ?1", [&domain])?;
            Ok(())
        })
        .await
    }
}

// queue records
impl Db {
    pub async fn queue_create(&self, message: &QMessage) -> anyhow::Result<i64> {
        let m = message.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO queue (uuid, mail_from, auth_user, rcpt_to, message_id, host,
                                    added_at, last_update, next_delivery_scheduled_at,
                                    status, delivery_failed_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    m.uuid,
                    m.mail_from,
                    m.auth_user,
                    m.rcpt_to,
                    m.message_id,
                    m.host,
                    m.added_at.to_rfc3339(),
                    m.last_update.to_rfc3339(),
                    m.next_delivery_scheduled_at.to_rfc3339(),
                    m.status,
                    m.delivery_failed_count,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn queue_get(&self, id: i64) -> anyhow::Result<Option<QMessage>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_QUEUE))?;
            let mut rows = stmt.query_map([id], map_qmessage)?;
            rows.next().transpose().map_err(anyhow::Error::new)
        })
        .await
    }

    pub async fn queue_list(&self) -> anyhow::Result<Vec<QMessage>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(SELECT_QUEUE)?;
            let rows = stmt.query_map([], map_qmessage)?;
            rows.collect::<Result<_, _>>().map_err(anyhow::Error::new)
        })
        .await
    }

    pub async fn queue_count(&self) -> anyhow::Result<i64> {
        self.call(move |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?)
        })
        .await
    }

    pub async fn queue_count_uuid(&self, uuid: &str) -> anyhow::Result<i64> {
        let uuid = uuid.to_string();
        self.call(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE uuid = ?1",
                [&uuid],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// records whose next delivery was scheduled before `before`
    pub async fn queue_expired(
        &self,
        before: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Vec<QMessage>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!("{} WHERE next_delivery_scheduled_at < ?1", SELECT_QUEUE))?;
            let rows = stmt.query_map([before.to_rfc3339()], map_qmessage)?;
            rows.collect::<Result<_, _>>().map_err(anyhow::Error::new)
        })
        .await
    }

    /// Delete a record and report how many siblings still reference its
    /// uuid, in one transaction so two concurrent deletes cannot both see a
    /// non-zero count.
    pub async fn queue_delete_counting_refs(&self, id: i64, uuid: &str) -> anyhow::Result<i64> {
        let uuid = uuid.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM queue WHERE id = ?1", [id])?;
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM queue WHERE uuid = ?1",
                [&uuid],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(remaining)
        })
        .await
    }

    pub async fn queue_save(&self, message: &QMessage) -> anyhow::Result<()> {
        let m = message.clone();
        self.call(move |conn| {
            conn.execute(
                "UPDATE queue SET uuid = ?2, mail_from = ?3, auth_user = ?4, rcpt_to = ?5,
                                  message_id = ?6, host = ?7, added_at = ?8, last_update = ?9,
                                  next_delivery_scheduled_at = ?10, status = ?11,
                                  delivery_failed_count = ?12
                 WHERE id = ?1",
                rusqlite::params![
                    m.id,
                    m.uuid,
                    m.mail_from,
                    m.auth_user,
                    m.rcpt_to,
                    m.message_id,
                    m.host,
                    m.added_at.to_rfc3339(),
                    m.last_update.to_rfc3339(),
                    m.next_delivery_scheduled_at.to_rfc3339(),
                    m.status,
                    m.delivery_failed_count,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Status change gated on the record not being under delivery; returns
    /// the number of rows updated (0 when the gate refused).
    pub async fn queue_set_status(&self, id: i64, status: u32) -> anyhow::Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        self.call(move |conn| {
            Ok(conn.execute(
                "UPDATE queue SET status = ?2, last_update = ?3 WHERE id = ?1 AND status != 0",
                rusqlite::params![id, status, now],
            )?)
        })
        .await
    }
}

const SELECT_QUEUE: &str = "SELECT id, uuid, mail_from, auth_user, rcpt_to, message_id, host,
                            added_at, last_update, next_delivery_scheduled_at, status,
                            delivery_failed_count FROM queue";

fn map_qmessage(row: &rusqlite::Row) -> rusqlite::Result<QMessage> {
    Ok(QMessage {
        id: row.get(0)?,
        uuid: row.get(1)?,
        mail_from: row.get(2)?,
        auth_user: row.get(3)?,
        rcpt_to: row.get(4)?,
        message_id: row.get(5)?,
        host: row.get(6)?,
        added_at: parse_ts(row, 7)?,
        last_update: parse_ts(row, 8)?,
        next_delivery_scheduled_at: parse_ts(row, 9)?,
        status: row.get(10)?,
        delivery_failed_count: row.get(11)?,
    })
}

fn map_dkim(row: &rusqlite::Row) -> rusqlite::Result<DkimConfig> {
    Ok(DkimConfig {
        id: row.get(0)?,
        domain: row.get(1)?,
        pub_key: row.get(2)?,
        priv_key: row.get(3)?,
        selector: row.get(4)?,
        headers: row.get(5)?,
    })
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    let text: String = row.get(idx)?;
    chrono::DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
