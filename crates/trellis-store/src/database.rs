//! SQLite database handle

use crate::error::{Result, StoreError};
use crate::schema::{watched_tables, SCHEMA, SOURCE_TYPES};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Params, Transaction};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_events::{Cdc, Event, Router};
use uuid::Uuid;

struct Inner {
    conn: Mutex<Connection>,
    cdc: Cdc,
}

/// Shared handle to the embedded database
///
/// There is exactly one connection per database, and the CDC hooks are
/// installed on it when the database is opened. Every write goes through
/// [`Database::execute`] or [`Database::transaction`], which fire the events
/// for committed changes before returning.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("cdc", &self.inner.cdc).finish()
    }
}

/// A new app row
#[derive(Debug, Clone, Default)]
pub struct NewApp {
    /// Owning user
    pub owner: String,
    /// Display name
    pub name: String,
    /// Owning plugin key, `<plugin>:<app>`
    pub plugin: Option<String>,
    /// Description
    pub description: String,
}

/// A new source row
#[derive(Debug, Clone, Default)]
pub struct NewSource {
    /// Owning user
    pub owner: String,
    /// App the source belongs to
    pub app: Option<String>,
    /// Plugin-defined key
    pub key: Option<String>,
    /// Source type
    pub source_type: String,
    /// Display name
    pub name: String,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>, router: Arc<Router>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Database opened");
        Self::from_connection(conn, router)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(router: Arc<Router>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, router)
    }

    fn from_connection(conn: Connection, router: Arc<Router>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let cdc = Cdc::install(&conn, watched_tables(), router);
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                cdc,
            }),
        })
    }

    /// Execute one statement, then fire events for what it changed
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        let conn = self.inner.conn.lock();
        let result = conn.execute(sql, params);
        self.inner.cdc.dispatch(&conn);
        Ok(result?)
    }

    /// Run `f` inside a transaction
    ///
    /// The transaction commits if `f` returns `Ok`, and rolls back otherwise.
    /// Events for the committed changes fire before this returns.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.inner.conn.lock();
        let result = {
            let tx = conn.transaction()?;
            match f(&tx) {
                Ok(value) => tx.commit().map(|_| value).map_err(StoreError::from),
                // dropping the transaction rolls it back
                Err(e) => Err(e),
            }
        };
        self.inner.cdc.dispatch(&conn);
        result
    }

    /// Run a query returning a single text column
    pub fn query_strings<P: Params>(&self, sql: &str, params: P) -> Result<Vec<String>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Create a user
    pub fn create_user(&self, username: &str) -> Result<()> {
        self.execute("INSERT INTO users (username) VALUES (?1)", [username])?;
        Ok(())
    }

    /// Delete a user, with their apps and sources
    pub fn delete_user(&self, username: &str) -> Result<()> {
        let n = self.execute("DELETE FROM users WHERE username=?1", [username])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("user '{username}'")));
        }
        Ok(())
    }

    /// Create an app, returning its id
    pub fn create_app(&self, app: &NewApp) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.execute(
            "INSERT INTO apps (id, owner, name, plugin, description) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, app.owner, app.name, app.plugin, app.description],
        )?;
        debug!(app = %id, owner = %app.owner, "App created");
        Ok(id)
    }

    /// Create a source, returning its id
    pub fn create_source(&self, source: &NewSource) -> Result<String> {
        if !SOURCE_TYPES.contains(&source.source_type.as_str()) {
            return Err(StoreError::UnknownSourceType(source.source_type.clone()));
        }
        let id = Uuid::new_v4().to_string();
        self.execute(
            "INSERT INTO sources (id, owner, app, key, type, name, plugin) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, (SELECT plugin FROM apps WHERE id=?3))",
            params![
                id,
                source.owner,
                source.app,
                source.key,
                source.source_type,
                source.name
            ],
        )?;
        debug!(source = %id, owner = %source.owner, "Source created");
        Ok(id)
    }

    /// Delete a source
    pub fn delete_source(&self, id: &str) -> Result<()> {
        let n = self.execute("DELETE FROM sources WHERE id=?1", [id])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("source '{id}'")));
        }
        Ok(())
    }

    /// Users that do not yet own an app with the given plugin key
    pub fn users_without_app(&self, plugin_key: &str) -> Result<Vec<String>> {
        self.query_strings(
            "SELECT username FROM users WHERE NOT EXISTS \
             (SELECT 1 FROM apps WHERE apps.owner=users.username AND apps.plugin=?1)",
            [plugin_key],
        )
    }

    /// `(app id, owner)` pairs for apps with the given plugin key that lack
    /// a source with the given key
    pub fn apps_without_source(&self, plugin_key: &str, key: &str) -> Result<Vec<(String, String)>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, owner FROM apps WHERE plugin=?1 AND NOT EXISTS \
             (SELECT 1 FROM sources WHERE sources.app=apps.id AND sources.key=?2)",
        )?;
        let rows = stmt.query_map([plugin_key, key], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stored schema version of a plugin
    pub fn plugin_version(&self, plugin: &str) -> Result<Option<i64>> {
        let conn = self.inner.conn.lock();
        let version = conn
            .query_row(
                "SELECT version FROM plugin_versions WHERE plugin=?1",
                [plugin],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Persist a plugin's schema version
    pub fn set_plugin_version(&self, plugin: &str, version: i64) -> Result<()> {
        self.execute(
            "INSERT INTO plugin_versions (plugin, version) VALUES (?1, ?2) \
             ON CONFLICT(plugin) DO UPDATE SET version=excluded.version",
            params![plugin, version],
        )?;
        Ok(())
    }

    /// Fire an application-defined event through the same router as CDC events
    pub fn fire(&self, event: Event) {
        self.inner.cdc.router().fire(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use trellis_events::EventHandler;

    #[derive(Debug)]
    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: &Event) -> trellis_core::Result<()> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    fn setup() -> (Database, mpsc::UnboundedReceiver<Event>) {
        let router = Arc::new(Router::new());
        let (tx, rx) = mpsc::unbounded_channel();
        router.subscribe(Event::new("*"), Arc::new(Recorder(tx)));
        (Database::open_in_memory(router).unwrap(), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_source_delete_fires_one_event() {
        let (db, mut rx) = setup();
        db.create_user("alice").unwrap();
        let app = db
            .create_app(&NewApp {
                owner: "alice".to_string(),
                name: "Inbox".to_string(),
                plugin: Some("notify:inbox".to_string()),
                ..Default::default()
            })
            .unwrap();
        let source = db
            .create_source(&NewSource {
                owner: "alice".to_string(),
                app: Some(app.clone()),
                key: Some("mail".to_string()),
                source_type: "timeseries".to_string(),
                name: "Mail".to_string(),
            })
            .unwrap();

        let mut created = Vec::new();
        for _ in 0..3 {
            created.push(next_event(&mut rx).await);
        }
        let source_create = created
            .iter()
            .find(|e| e.event == "source_create")
            .unwrap();
        assert_eq!(source_create.plugin, "notify:inbox");
        assert!(created.iter().any(|e| e.event == "user_create"));
        assert!(created.iter().any(|e| e.event == "app_create"));

        db.delete_source(&source).unwrap();
        let deleted = next_event(&mut rx).await;
        assert_eq!(deleted.event, "source_delete");
        assert_eq!(deleted.user, "alice");
        assert_eq!(deleted.object, source);
        assert_eq!(deleted.app, app);
        assert_eq!(deleted.plugin, "notify:inbox");
        assert_eq!(deleted.key, "mail");
        assert_eq!(deleted.event_type, "timeseries");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cascaded_source_delete_keeps_plugin() {
        let (db, mut rx) = setup();
        db.create_user("alice").unwrap();
        let app = db
            .create_app(&NewApp {
                owner: "alice".to_string(),
                name: "Inbox".to_string(),
                plugin: Some("notify:inbox".to_string()),
                ..Default::default()
            })
            .unwrap();
        let source = db
            .create_source(&NewSource {
                owner: "alice".to_string(),
                app: Some(app.clone()),
                key: Some("mail".to_string()),
                source_type: "notes".to_string(),
                name: "Mail".to_string(),
            })
            .unwrap();
        for _ in 0..3 {
            next_event(&mut rx).await;
        }

        db.execute("DELETE FROM apps WHERE id=?1", [&app]).unwrap();
        let mut deleted = Vec::new();
        for _ in 0..2 {
            deleted.push(next_event(&mut rx).await);
        }
        let source_delete = deleted
            .iter()
            .find(|e| e.event == "source_delete")
            .unwrap();
        assert_eq!(source_delete.object, source);
        assert_eq!(source_delete.app, app);
        assert_eq!(source_delete.plugin, "notify:inbox");
        assert!(deleted.iter().any(|e| e.event == "app_delete"));
    }

    #[tokio::test]
    async fn test_failed_transaction_fires_nothing() {
        let (db, mut rx) = setup();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute("INSERT INTO users (username) VALUES ('bob')", [])?;
            Err(StoreError::NotFound("forced".to_string()))
        });
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(db.users_without_app("x:y").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_source_type() {
        let (db, _rx) = setup();
        db.create_user("alice").unwrap();
        let err = db
            .create_source(&NewSource {
                owner: "alice".to_string(),
                source_type: "hologram".to_string(),
                name: "x".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownSourceType(_)));
    }

    #[test]
    fn test_plugin_version_roundtrip() {
        let (db, _rx) = setup();
        assert_eq!(db.plugin_version("notify").unwrap(), None);
        db.set_plugin_version("notify", 2).unwrap();
        db.set_plugin_version("notify", 3).unwrap();
        assert_eq!(db.plugin_version("notify").unwrap(), Some(3));
    }

    #[test]
    fn test_provisioning_queries() {
        let (db, _rx) = setup();
        db.create_user("alice").unwrap();
        db.create_user("bob").unwrap();
        let app = db
            .create_app(&NewApp {
                owner: "alice".to_string(),
                name: "Inbox".to_string(),
                plugin: Some("notify:inbox".to_string()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(db.users_without_app("notify:inbox").unwrap(), vec!["bob"]);
        assert_eq!(
            db.apps_without_source("notify:inbox", "mail").unwrap(),
            vec![(app, "alice".to_string())]
        );
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellis.db");
        let router = Arc::new(Router::new());
        {
            let db = Database::open(&path, Arc::clone(&router)).unwrap();
            db.create_user("alice").unwrap();
        }
        let db = Database::open(&path, router).unwrap();
        assert_eq!(db.users_without_app("a:b").unwrap(), vec!["alice"]);
    }
}
