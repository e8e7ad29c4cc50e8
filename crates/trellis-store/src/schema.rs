//! Table definitions and CDC projections

use trellis_events::WatchedTable;

pub(crate) const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS apps (
    id TEXT PRIMARY KEY NOT NULL,
    owner TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
    name TEXT NOT NULL,
    plugin TEXT,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY NOT NULL,
    owner TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
    app TEXT REFERENCES apps(id) ON DELETE CASCADE,
    key TEXT,
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    plugin TEXT
);

CREATE TABLE IF NOT EXISTS plugin_versions (
    plugin TEXT PRIMARY KEY NOT NULL,
    version INTEGER NOT NULL
);
"#;

/// Source types the store accepts
pub(crate) const SOURCE_TYPES: &[&str] = &["timeseries", "notes", "file"];

/// Tables observed by change-data-capture
///
/// Projections return `(user, app, plugin, object, key, type)`. Sources
/// carry a copy of their app's plugin key so deletes cascading from an app
/// still report it. Deleted-row
/// projections bind the old column values in the column order of [`SCHEMA`].
pub fn watched_tables() -> Vec<WatchedTable> {
    vec![
        WatchedTable {
            table: "users",
            event: "user",
            select_by_rowid: "SELECT username,'','','','','' FROM users WHERE rowid=?1",
            select_deleted: "SELECT ?1,'','','','',''",
        },
        WatchedTable {
            table: "apps",
            event: "app",
            select_by_rowid:
                "SELECT owner,id,COALESCE(plugin,''),'','','' FROM apps WHERE rowid=?1",
            select_deleted: "SELECT ?2,?1,COALESCE(?4,''),'','',''",
        },
        WatchedTable {
            table: "sources",
            event: "source",
            select_by_rowid: "SELECT owner,COALESCE(app,''),COALESCE(plugin,''),id,COALESCE(key,''),type \
                FROM sources WHERE rowid=?1",
            // the owning app may be gone by now, so the plugin comes from the row itself
            select_deleted: "SELECT ?2,COALESCE(?3,''),COALESCE(?7,''),?1,COALESCE(?4,''),?5",
        },
    ]
}
