//! Change-data-capture hooks on the embedded SQLite database
//!
//! SQLite allows a single update hook and a single pre-update hook per
//! connection, and neither may query the connection while it runs. The hooks
//! therefore only record what changed:
//!
//! - inserts and updates are recorded by rowid from the update hook
//! - deletes are recorded from the pre-update hook together with the old
//!   column values, since the row is gone once the statement completes
//!
//! Recorded changes become visible to [`Cdc::dispatch`] only once their
//! transaction commits and are discarded on rollback. `dispatch` runs each
//! table's cached projection statement to build the [`Event`] and hands it to
//! the [`Router`] without waiting on subscribers.

use crate::event::Event;
use crate::router::Router;
use parking_lot::Mutex;
use rusqlite::hooks::{Action, PreUpdateCase};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Kind of row mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Row inserted
    Create,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl Op {
    /// Suffix used in event names
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

/// A table observed by the CDC hooks
///
/// Both projection statements must return six columns:
/// `(user, app, plugin, object, key, type)`.
#[derive(Debug, Clone)]
pub struct WatchedTable {
    /// Table name
    pub table: &'static str,

    /// Event name prefix, e.g. `source` for `source_create`
    pub event: &'static str,

    /// Projection for inserted/updated rows, bound to `?1 = rowid`
    pub select_by_rowid: &'static str,

    /// Projection for deleted rows, bound to the row's old column values in
    /// table column order (`?1` is the first column)
    pub select_deleted: &'static str,
}

impl WatchedTable {
    /// Event name for an operation on this table
    pub fn event_name(&self, op: Op) -> String {
        format!("{}_{}", self.event, op.as_str())
    }
}

#[derive(Debug)]
enum Target {
    RowId(i64),
    OldRow(Vec<Value>),
}

#[derive(Debug)]
struct Change {
    table: usize,
    op: Op,
    target: Target,
}

#[derive(Default)]
struct Queues {
    pending: Vec<Change>,
    committed: Vec<Change>,
}

/// CDC hooks installed on one connection
pub struct Cdc {
    tables: Arc<[WatchedTable]>,
    queues: Arc<Mutex<Queues>>,
    router: Arc<Router>,
}

impl fmt::Debug for Cdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cdc")
            .field("tables", &self.tables.iter().map(|t| t.table).collect::<Vec<_>>())
            .finish()
    }
}

impl Cdc {
    /// Install update, pre-update, commit and rollback hooks on `conn`
    ///
    /// This replaces any hooks previously set on the connection, so it must
    /// be called exactly once per connection, before any writes.
    pub fn install(conn: &Connection, tables: Vec<WatchedTable>, router: Arc<Router>) -> Self {
        let tables: Arc<[WatchedTable]> = tables.into();
        let queues = Arc::new(Mutex::new(Queues::default()));

        let lookup = {
            let tables = Arc::clone(&tables);
            move |db: &str, table: &str| -> Option<usize> {
                if db != "main" {
                    return None;
                }
                tables.iter().position(|t| t.table == table)
            }
        };

        {
            let queues = Arc::clone(&queues);
            let lookup = lookup.clone();
            conn.update_hook(Some(
                move |action: Action, db: &str, table: &str, rowid: i64| {
                    let op = match action {
                        Action::SQLITE_INSERT => Op::Create,
                        Action::SQLITE_UPDATE => Op::Update,
                        // deletes are captured by the pre-update hook
                        _ => return,
                    };
                    if let Some(table) = lookup(db, table) {
                        queues.lock().pending.push(Change {
                            table,
                            op,
                            target: Target::RowId(rowid),
                        });
                    }
                },
            ));
        }

        {
            let queues = Arc::clone(&queues);
            conn.preupdate_hook(Some(
                move |_action: Action, db: &str, table: &str, case: &PreUpdateCase| {
                    let PreUpdateCase::Delete(old) = case else {
                        return;
                    };
                    let Some(table) = lookup(db, table) else {
                        return;
                    };

                    let mut values = Vec::new();
                    for i in 0..old.get_column_count() {
                        match old.get_old_column_value(i) {
                            Ok(v) => values.push(Value::from(v)),
                            Err(e) => {
                                error!(error = %e, "Failed to read deleted row");
                                return;
                            }
                        }
                    }

                    queues.lock().pending.push(Change {
                        table,
                        op: Op::Delete,
                        target: Target::OldRow(values),
                    });
                },
            ));
        }

        {
            let queues = Arc::clone(&queues);
            conn.commit_hook(Some(move || {
                let mut q = queues.lock();
                let mut pending = std::mem::take(&mut q.pending);
                q.committed.append(&mut pending);
                // false lets the commit proceed
                false
            }));
        }

        {
            let queues = Arc::clone(&queues);
            conn.rollback_hook(Some(move || {
                queues.lock().pending.clear();
            }));
        }

        debug!(tables = tables.len(), "CDC hooks installed");

        Self {
            tables,
            queues,
            router,
        }
    }

    /// Router events are fired on
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Resolve every committed change into an [`Event`] and fire it
    ///
    /// Must be called on the hooked connection after the write returns,
    /// outside of any hook. Returns the fired events.
    pub fn dispatch(&self, conn: &Connection) -> Vec<Event> {
        let changes = std::mem::take(&mut self.queues.lock().committed);
        let mut fired = Vec::with_capacity(changes.len());

        for change in changes {
            let table = &self.tables[change.table];
            match self.project(conn, table, &change) {
                Ok(Some(mut event)) => {
                    event.event = table.event_name(change.op);
                    debug!(event = %event, "Firing database event");
                    self.router.fire(event.clone());
                    fired.push(event);
                }
                Ok(None) => {
                    debug!(table = table.table, op = change.op.as_str(), "Changed row no longer exists");
                }
                Err(e) => {
                    error!(table = table.table, error = %e, "CDC projection failed");
                }
            }
        }
        fired
    }

    fn project(
        &self,
        conn: &Connection,
        table: &WatchedTable,
        change: &Change,
    ) -> rusqlite::Result<Option<Event>> {
        let result = match &change.target {
            Target::RowId(rowid) => conn
                .prepare_cached(table.select_by_rowid)?
                .query_row([rowid], row_to_event),
            Target::OldRow(values) => {
                let mut stmt = conn.prepare_cached(table.select_deleted)?;
                // the projection may not reference trailing columns
                let bound = values.iter().take(stmt.parameter_count());
                stmt.query_row(params_from_iter(bound), row_to_event)
            }
        };

        match result {
            Ok(event) => Ok(Some(event)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        user: text(row, 0)?,
        app: text(row, 1)?,
        plugin: text(row, 2)?,
        object: text(row, 3)?,
        key: text(row, 4)?,
        event_type: text(row, 5)?,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventHandler;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: &Event) -> trellis_core::Result<()> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    fn notes_table() -> WatchedTable {
        WatchedTable {
            table: "notes",
            event: "note",
            select_by_rowid: "SELECT owner,'','',id,'','' FROM notes WHERE rowid=?1",
            select_deleted: "SELECT ?2,'','',?1,'',''",
        }
    }

    fn setup() -> (Connection, Cdc, mpsc::UnboundedReceiver<Event>) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE notes (id TEXT PRIMARY KEY, owner TEXT NOT NULL);")
            .unwrap();

        let router = Arc::new(Router::new());
        let (tx, rx) = mpsc::unbounded_channel();
        router.subscribe(Event::new("*"), Arc::new(Recorder(tx)));

        let cdc = Cdc::install(&conn, vec![notes_table()], router);
        (conn, cdc, rx)
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let (conn, cdc, mut rx) = setup();

        conn.execute("INSERT INTO notes VALUES ('n1', 'alice')", [])
            .unwrap();
        let fired = cdc.dispatch(&conn);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event, "note_create");
        assert_eq!(fired[0].object, "n1");

        conn.execute("UPDATE notes SET owner='bob' WHERE id='n1'", [])
            .unwrap();
        let fired = cdc.dispatch(&conn);
        assert_eq!(fired[0].event, "note_update");
        assert_eq!(fired[0].user, "bob");

        conn.execute("DELETE FROM notes WHERE id='n1'", []).unwrap();
        let fired = cdc.dispatch(&conn);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event, "note_delete");
        assert_eq!(fired[0].user, "bob");

        let mut names = Vec::new();
        for _ in 0..3 {
            names.push(rx.recv().await.unwrap().event);
        }
        names.sort();
        assert_eq!(names, vec!["note_create", "note_delete", "note_update"]);
    }

    #[test]
    fn test_rollback_discards_changes() {
        let (mut conn, cdc, _rx) = setup();

        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO notes VALUES ('n2', 'alice')", [])
            .unwrap();
        tx.rollback().unwrap();

        assert!(cdc.dispatch(&conn).is_empty());
    }

    #[test]
    fn test_uncommitted_changes_are_held() {
        let (mut conn, cdc, _rx) = setup();

        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO notes VALUES ('n3', 'alice')", [])
            .unwrap();
        assert!(cdc.dispatch(&tx).is_empty());
        tx.commit().unwrap();

        assert_eq!(cdc.dispatch(&conn).len(), 1);
    }

    #[test]
    fn test_unwatched_tables_are_ignored() {
        let (conn, cdc, _rx) = setup();
        conn.execute_batch("CREATE TABLE other (x INTEGER); INSERT INTO other VALUES (1);")
            .unwrap();
        assert!(cdc.dispatch(&conn).is_empty());
    }
}
