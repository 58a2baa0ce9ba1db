use super::{BackendSession, BatchOutcome, Outcome, Statement, TxnHandle};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

use lazy_static::lazy_static;
use log::debug;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// An in-memory backend, storing key/value tables (an integer `id` and one value column).
/// Clones share the same store, so each clone acts as a separate session against the same
/// database.
///
/// Transactions run against a snapshot of the committed tables and commit optimistically: a
/// read-write transaction aborts if any other commit landed after it began. Aborts, slow
/// statements and DDL failures can also be injected, for testing retry, timeout and batch
/// behavior.
#[derive(Clone, Default)]
pub struct Memory {
    store: Arc<Mutex<Store>>,
}

/// Counters and history recorded by the in-memory backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub aborts: u64,
    /// Every statement submitted, in order, including batch members and replays.
    pub executed: Vec<String>,
    /// Transaction and statement tags seen.
    pub tags: Vec<String>,
}

type Tables = BTreeMap<String, Table>;

#[derive(Clone, Debug)]
struct Table {
    column: String,
    rows: BTreeMap<i64, Value>,
}

struct Txn {
    read_only: bool,
    /// Store version the snapshot was taken at.
    base: u64,
    tables: Tables,
    aborted: bool,
}

#[derive(Default)]
struct Faults {
    commit_aborts: u32,
    statement_aborts: Vec<(String, u32)>,
    statement_delays: Vec<(String, Duration)>,
    ddl_failure: Option<usize>,
}

impl Faults {
    fn take_statement_abort(&mut self, sql: &str) -> bool {
        let sql = sql.to_lowercase();
        for (pattern, remaining) in self.statement_aborts.iter_mut() {
            if *remaining > 0 && sql.contains(pattern.as_str()) {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    fn take_statement_delay(&mut self, sql: &str) -> Option<Duration> {
        let sql = sql.to_lowercase();
        let index = self.statement_delays.iter().position(|(p, _)| sql.contains(p.as_str()))?;
        Some(self.statement_delays.remove(index).1)
    }
}

#[derive(Default)]
struct Store {
    tables: Tables,
    version: u64,
    next_txn: u64,
    txns: HashMap<u64, Txn>,
    faults: Faults,
    stats: Stats,
}

impl Memory {
    /// Creates a new, empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> Result<MutexGuard<'_, Store>> {
        Ok(self.store.lock()?)
    }

    /// Makes the next n read-write commits abort.
    pub fn abort_next_commits(&self, n: u32) -> Result<()> {
        self.store()?.faults.commit_aborts = n;
        Ok(())
    }

    /// Makes the next n statements containing the given text (case-insensitive) abort their
    /// transaction.
    pub fn abort_statements(&self, pattern: &str, n: u32) -> Result<()> {
        self.store()?.faults.statement_aborts.push((pattern.to_lowercase(), n));
        Ok(())
    }

    /// Makes the next statement containing the given text (case-insensitive) wait for the
    /// given delay before it executes.
    pub fn delay_statement(&self, pattern: &str, delay: Duration) -> Result<()> {
        self.store()?.faults.statement_delays.push((pattern.to_lowercase(), delay));
        Ok(())
    }

    /// Makes the next DDL batch fail at the given statement index.
    pub fn fail_ddl_batch_at(&self, index: usize) -> Result<()> {
        self.store()?.faults.ddl_failure = Some(index);
        Ok(())
    }

    /// Lists the committed tables.
    pub fn tables(&self) -> Result<Vec<String>> {
        Ok(self.store()?.tables.keys().cloned().collect())
    }

    /// Reads a committed row value.
    pub fn get(&self, table: &str, id: i64) -> Result<Option<Value>> {
        let store = self.store()?;
        Ok(store.tables.get(&table.to_lowercase()).and_then(|t| t.rows.get(&id)).cloned())
    }

    /// Reads all committed rows of a table.
    pub fn rows(&self, table: &str) -> Result<Vec<(i64, Value)>> {
        let store = self.store()?;
        let table = store
            .tables
            .get(&table.to_lowercase())
            .ok_or_else(|| Error::Value(format!("Table {} does not exist", table)))?;
        Ok(table.rows.iter().map(|(id, v)| (*id, v.clone())).collect())
    }

    /// Returns the number of open transactions.
    pub fn open_transactions(&self) -> Result<usize> {
        Ok(self.store()?.txns.len())
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(self.store()?.stats.clone())
    }
}

impl BackendSession for Memory {
    async fn begin(&mut self, read_only: bool, tag: Option<String>) -> Result<TxnHandle> {
        let mut guard = self.store()?;
        let store = &mut *guard;
        store.next_txn += 1;
        let id = store.next_txn;
        store.txns.insert(
            id,
            Txn { read_only, base: store.version, tables: store.tables.clone(), aborted: false },
        );
        store.stats.begins += 1;
        store.stats.tags.extend(tag);
        debug!("Began transaction {} (read_only={})", id, read_only);
        Ok(TxnHandle { id, read_only })
    }

    async fn execute(&mut self, txn: TxnHandle, statement: Statement) -> Result<Outcome> {
        let delay = {
            let mut store = self.store()?;
            store.faults.take_statement_delay(&statement.sql)
        };
        if let Some(delay) = delay {
            debug!("Delaying {} by {:?}", statement.sql, delay);
            tokio::time::sleep(delay).await;
        }
        let mut guard = self.store()?;
        let store = &mut *guard;
        store.stats.executed.push(statement.sql.clone());
        store.stats.tags.extend(statement.tag);
        let active = store
            .txns
            .get_mut(&txn.id)
            .ok_or_else(|| Error::Internal(format!("Unknown transaction {}", txn.id)))?;
        if active.aborted {
            return Err(Error::Abort);
        }
        if store.faults.take_statement_abort(&statement.sql) {
            debug!("Injecting abort of transaction {} at {}", txn.id, statement.sql);
            active.aborted = true;
            store.stats.aborts += 1;
            return Err(Error::Abort);
        }
        let sql = Sql::parse(&bind(&statement.sql, &statement.params)?)?;
        if sql.is_ddl() {
            return Err(Error::Value("DDL statements cannot run in a transaction".into()));
        }
        if sql.is_write() && active.read_only {
            return Err(Error::ReadOnly);
        }
        sql.apply(&mut active.tables)
    }

    async fn commit(&mut self, txn: TxnHandle) -> Result<()> {
        let mut guard = self.store()?;
        let store = &mut *guard;
        let active = store
            .txns
            .remove(&txn.id)
            .ok_or_else(|| Error::Internal(format!("Unknown transaction {}", txn.id)))?;
        if active.aborted {
            return Err(Error::Abort);
        }
        if !active.read_only {
            if store.faults.commit_aborts > 0 {
                store.faults.commit_aborts -= 1;
                store.stats.aborts += 1;
                debug!("Injecting abort of transaction {} at commit", txn.id);
                return Err(Error::Abort);
            }
            if store.version != active.base {
                store.stats.aborts += 1;
                debug!("Transaction {} conflicts with a concurrent commit", txn.id);
                return Err(Error::Abort);
            }
            store.tables = active.tables;
            store.version += 1;
        }
        store.stats.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self, txn: TxnHandle) -> Result<()> {
        let mut store = self.store()?;
        if store.txns.remove(&txn.id).is_some() {
            store.stats.rollbacks += 1;
        }
        Ok(())
    }

    async fn submit_ddl_batch(&mut self, statements: Vec<String>) -> Result<BatchOutcome> {
        let mut guard = self.store()?;
        let store = &mut *guard;
        let mut counts = Vec::new();
        for (index, sql) in statements.iter().enumerate() {
            store.stats.executed.push(sql.clone());
            if store.faults.ddl_failure == Some(index) {
                store.faults.ddl_failure = None;
                let error = Error::Value(format!("Injected failure of DDL statement {}", index));
                return Ok(BatchOutcome { counts, error: Some(error) });
            }
            let result = Sql::parse(sql).and_then(|sql| match sql.is_ddl() {
                true => sql.apply(&mut store.tables),
                false => Err(Error::Value("Only DDL statements can run in a DDL batch".into())),
            });
            match result {
                Ok(_) => {
                    store.version += 1;
                    counts.push(0);
                }
                Err(err) => return Ok(BatchOutcome { counts, error: Some(err) }),
            }
        }
        Ok(BatchOutcome::success(counts))
    }

    async fn submit_dml_batch(
        &mut self,
        txn: TxnHandle,
        statements: Vec<Statement>,
    ) -> Result<BatchOutcome> {
        let mut guard = self.store()?;
        let store = &mut *guard;
        let active = store
            .txns
            .get_mut(&txn.id)
            .ok_or_else(|| Error::Internal(format!("Unknown transaction {}", txn.id)))?;
        if active.aborted {
            return Err(Error::Abort);
        }
        if active.read_only {
            return Err(Error::ReadOnly);
        }
        let mut counts = Vec::new();
        for statement in statements {
            store.stats.executed.push(statement.sql.clone());
            if store.faults.take_statement_abort(&statement.sql) {
                active.aborted = true;
                store.stats.aborts += 1;
                return Err(Error::Abort);
            }
            let result = bind(&statement.sql, &statement.params)
                .and_then(|sql| Sql::parse(&sql))
                .and_then(|sql| match sql.is_write() && !sql.is_ddl() {
                    true => sql.apply(&mut active.tables),
                    false => Err(Error::Value("Only DML statements can run in a DML batch".into())),
                });
            match result {
                Ok(Outcome::Count(count)) => counts.push(count),
                Ok(_) => counts.push(0),
                Err(err) => return Ok(BatchOutcome { counts, error: Some(err) }),
            }
        }
        Ok(BatchOutcome::success(counts))
    }
}

/// Substitutes `?` placeholders outside string literals with the given parameters.
fn bind(sql: &str, params: &[Value]) -> Result<String> {
    let mut bound = String::with_capacity(sql.len());
    let mut params = params.iter();
    let mut quoted = false;
    for c in sql.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                bound.push(c);
            }
            '?' if !quoted => {
                let param = params
                    .next()
                    .ok_or_else(|| Error::Value(format!("Missing parameter in {}", sql)))?;
                bound.push_str(&literal(param));
            }
            c => bound.push(c),
        }
    }
    if params.next().is_some() {
        return Err(Error::Value(format!("Too many parameters for {}", sql)));
    }
    Ok(bound)
}

/// Formats a value as an SQL literal.
fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Boolean(true) => "TRUE".into(),
        Value::Boolean(false) => "FALSE".into(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => format!("{:?}", f),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

/// Parses an SQL literal.
fn parse_literal(s: &str) -> Result<Value> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("NULL") {
        Ok(Value::Null)
    } else if s.eq_ignore_ascii_case("TRUE") {
        Ok(Value::Boolean(true))
    } else if s.eq_ignore_ascii_case("FALSE") {
        Ok(Value::Boolean(false))
    } else if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        Ok(Value::String(s[1..s.len() - 1].replace("''", "'")))
    } else if let Ok(i) = s.parse::<i64>() {
        Ok(Value::Integer(i))
    } else if let Ok(f) = s.parse::<f64>() {
        Ok(Value::Float(f))
    } else {
        Err(Error::Value(format!("Invalid value {}", s)))
    }
}

lazy_static! {
    static ref CREATE: Regex =
        Regex::new(r"(?i)^\s*CREATE\s+TABLE\s+(\w+)(?:\s*\(\s*\w+[^,]*,\s*(\w+))?").unwrap();
    static ref DROP: Regex = Regex::new(r"(?i)^\s*DROP\s+TABLE\s+(\w+)\s*;?\s*$").unwrap();
    static ref INSERT: Regex = Regex::new(
        r"(?i)^\s*INSERT\s+INTO\s+(\w+)\s+VALUES\s*\(\s*(-?\d+)\s*,\s*(.+?)\s*\)\s*;?\s*$"
    )
    .unwrap();
    static ref UPDATE: Regex = Regex::new(concat!(
        r"(?i)^\s*UPDATE\s+(\w+)\s+SET\s+(\w+)\s*=\s*(?:(\w+)\s*([+-])\s*)?(.+?)",
        r"(?:\s+WHERE\s+id\s*=\s*(-?\d+))?\s*;?\s*$"
    ))
    .unwrap();
    static ref DELETE: Regex =
        Regex::new(r"(?i)^\s*DELETE\s+FROM\s+(\w+)(?:\s+WHERE\s+id\s*=\s*(-?\d+))?\s*;?\s*$")
            .unwrap();
    static ref SELECT: Regex = Regex::new(concat!(
        r"(?i)^\s*SELECT\s+(\*|COUNT\(\*\)|\w+)\s+FROM\s+(\w+)",
        r"(?:\s+WHERE\s+id\s*=\s*(-?\d+))?\s*;?\s*$"
    ))
    .unwrap();
}

/// A column assignment in an UPDATE.
enum Assignment {
    Set(Value),
    Add(Value),
}

enum Projection {
    All,
    Id,
    Value(String),
    Count,
}

/// The SQL subset understood by the in-memory backend.
enum Sql {
    CreateTable { table: String, column: String },
    DropTable { table: String },
    Insert { table: String, id: i64, value: Value },
    Update { table: String, assignment: Assignment, id: Option<i64> },
    Delete { table: String, id: Option<i64> },
    Select { table: String, projection: Projection, id: Option<i64> },
}

impl Sql {
    fn parse(sql: &str) -> Result<Self> {
        let name = |c: &Captures, i: usize| c[i].to_lowercase();
        let id = |c: &Captures, i: usize| -> Result<Option<i64>> {
            Ok(match c.get(i) {
                Some(m) => Some(m.as_str().parse()?),
                None => None,
            })
        };
        if let Some(c) = CREATE.captures(sql) {
            let column =
                c.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or_else(|| "value".into());
            Ok(Sql::CreateTable { table: name(&c, 1), column })
        } else if let Some(c) = DROP.captures(sql) {
            Ok(Sql::DropTable { table: name(&c, 1) })
        } else if let Some(c) = INSERT.captures(sql) {
            Ok(Sql::Insert { table: name(&c, 1), id: c[2].parse()?, value: parse_literal(&c[3])? })
        } else if let Some(c) = UPDATE.captures(sql) {
            let value = parse_literal(&c[5])?;
            let assignment = match (c.get(3), c.get(4)) {
                (Some(source), Some(op)) => {
                    if !source.as_str().eq_ignore_ascii_case(&c[2]) {
                        return Err(Error::Value(format!("Unsupported assignment in {}", sql)));
                    }
                    match (op.as_str(), value) {
                        ("-", Value::Integer(i)) => Assignment::Add(Value::Integer(-i)),
                        ("-", Value::Float(f)) => Assignment::Add(Value::Float(-f)),
                        (_, value) => Assignment::Add(value),
                    }
                }
                _ => Assignment::Set(value),
            };
            Ok(Sql::Update { table: name(&c, 1), assignment, id: id(&c, 6)? })
        } else if let Some(c) = DELETE.captures(sql) {
            Ok(Sql::Delete { table: name(&c, 1), id: id(&c, 2)? })
        } else if let Some(c) = SELECT.captures(sql) {
            let projection = match c[1].to_lowercase().as_str() {
                "*" => Projection::All,
                "count(*)" => Projection::Count,
                "id" => Projection::Id,
                column => Projection::Value(column.to_owned()),
            };
            Ok(Sql::Select { table: name(&c, 2), projection, id: id(&c, 3)? })
        } else {
            Err(Error::Parse(format!("Unsupported statement {}", sql)))
        }
    }

    fn is_ddl(&self) -> bool {
        matches!(self, Sql::CreateTable { .. } | Sql::DropTable { .. })
    }

    fn is_write(&self) -> bool {
        !matches!(self, Sql::Select { .. })
    }

    fn apply(self, tables: &mut Tables) -> Result<Outcome> {
        match self {
            Sql::CreateTable { table, column } => {
                if tables.contains_key(&table) {
                    return Err(Error::Value(format!("Table {} already exists", table)));
                }
                tables.insert(table, Table { column, rows: BTreeMap::new() });
                Ok(Outcome::Done)
            }
            Sql::DropTable { table } => match tables.remove(&table) {
                Some(_) => Ok(Outcome::Done),
                None => Err(Error::Value(format!("Table {} does not exist", table))),
            },
            Sql::Insert { table, id, value } => {
                let table = lookup(tables, &table)?;
                if table.rows.contains_key(&id) {
                    return Err(Error::Value(format!("Primary key {} already exists", id)));
                }
                table.rows.insert(id, value);
                Ok(Outcome::Count(1))
            }
            Sql::Update { table, assignment, id } => {
                let table = lookup(tables, &table)?;
                let mut updates = Vec::new();
                let matching = table.rows.iter().filter(|(k, _)| id.map_or(true, |id| **k == id));
                for (key, current) in matching {
                    let value = match &assignment {
                        Assignment::Set(value) => value.clone(),
                        Assignment::Add(delta) => add(current, delta)?,
                    };
                    updates.push((*key, value));
                }
                let count = updates.len() as u64;
                table.rows.extend(updates);
                Ok(Outcome::Count(count))
            }
            Sql::Delete { table, id } => {
                let table = lookup(tables, &table)?;
                let before = table.rows.len();
                table.rows.retain(|k, _| id.map_or(false, |id| *k != id));
                Ok(Outcome::Count((before - table.rows.len()) as u64))
            }
            Sql::Select { table, projection, id } => {
                let table = lookup(tables, &table)?;
                let rows = table.rows.iter().filter(|(k, _)| id.map_or(true, |id| **k == id));
                let (columns, rows): (Vec<String>, Vec<Row>) = match projection {
                    Projection::All => (
                        vec!["id".into(), table.column.clone()],
                        rows.map(|(k, v)| vec![Value::Integer(*k), v.clone()]).collect(),
                    ),
                    Projection::Id => {
                        (vec!["id".into()], rows.map(|(k, _)| vec![Value::Integer(*k)]).collect())
                    }
                    Projection::Value(column) => {
                        (vec![column], rows.map(|(_, v)| vec![v.clone()]).collect())
                    }
                    Projection::Count => {
                        (vec!["count".into()], vec![vec![Value::Integer(rows.count() as i64)]])
                    }
                };
                Ok(Outcome::Rows { columns, rows })
            }
        }
    }
}

fn lookup<'a>(tables: &'a mut Tables, table: &str) -> Result<&'a mut Table> {
    tables.get_mut(table).ok_or_else(|| Error::Value(format!("Table {} does not exist", table)))
}

fn add(current: &Value, delta: &Value) -> Result<Value> {
    match (current, delta) {
        (Value::Integer(a), Value::Integer(b)) => a
            .checked_add(*b)
            .map(Value::Integer)
            .ok_or_else(|| Error::Value("Integer overflow".into())),
        (Value::Integer(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Integer(b)) => Ok(Value::Float(a + *b as f64)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (a, b) => Err(Error::Value(format!("Can't add {} and {}", a, b))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(sql: &str) -> Statement {
        Statement::new(sql, vec![])
    }

    async fn setup() -> Result<Memory> {
        let mut db = Memory::new();
        let outcome = db.submit_ddl_batch(vec!["CREATE TABLE t (id INT, x INT)".into()]).await?;
        assert!(outcome.is_success());
        let txn = db.begin(false, None).await?;
        db.execute(txn, stmt("INSERT INTO t VALUES (1, 10)")).await?;
        db.execute(txn, stmt("INSERT INTO t VALUES (2, 20)")).await?;
        db.commit(txn).await?;
        Ok(db)
    }

    #[test]
    fn bind_params() -> Result<()> {
        assert_eq!(
            "UPDATE t SET x = 'a?''b' WHERE id = 3",
            bind("UPDATE t SET x = ? WHERE id = ?", &["a?'b".into(), 3.into()])?
        );
        assert_eq!("SELECT '?' FROM t", bind("SELECT '?' FROM t", &[])?);
        assert!(bind("SELECT ? FROM t", &[]).is_err());
        assert!(bind("SELECT x FROM t", &[Value::Null]).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn statements() -> Result<()> {
        let mut db = setup().await?;
        let txn = db.begin(false, None).await?;
        assert_eq!(
            Outcome::Count(1),
            db.execute(txn, stmt("UPDATE t SET x = x + 1 WHERE id = 1")).await?
        );
        assert_eq!(Outcome::Count(2), db.execute(txn, stmt("update t set x = x - 2")).await?);
        assert_eq!(
            Outcome::Rows {
                columns: vec!["id".into(), "x".into()],
                rows: vec![
                    vec![Value::Integer(1), Value::Integer(9)],
                    vec![Value::Integer(2), Value::Integer(18)],
                ],
            },
            db.execute(txn, stmt("SELECT * FROM t")).await?
        );
        assert_eq!(
            Outcome::Rows { columns: vec!["x".into()], rows: vec![vec![Value::Integer(18)]] },
            db.execute(txn, Statement::new("SELECT x FROM t WHERE id = ?", vec![2.into()])).await?
        );
        assert_eq!(Outcome::Count(1), db.execute(txn, stmt("DELETE FROM t WHERE id = 2")).await?);
        assert_eq!(
            Outcome::Rows { columns: vec!["count".into()], rows: vec![vec![Value::Integer(1)]] },
            db.execute(txn, stmt("SELECT COUNT(*) FROM t")).await?
        );
        assert!(matches!(
            db.execute(txn, stmt("INSERT INTO t VALUES (1, 0)")).await,
            Err(Error::Value(_))
        ));
        let result = db.execute(txn, stmt("SELECT * FROM missing")).await;
        assert!(matches!(result, Err(Error::Value(_))));
        db.commit(txn).await?;
        assert_eq!(vec![(1, Value::Integer(9))], db.rows("t")?);
        Ok(())
    }

    #[tokio::test]
    async fn isolation_and_conflicts() -> Result<()> {
        let mut a = setup().await?;
        let mut b = a.clone();
        let ta = a.begin(false, None).await?;
        let tb = b.begin(false, None).await?;
        a.execute(ta, stmt("UPDATE t SET x = 0 WHERE id = 1")).await?;
        assert_eq!(
            Outcome::Rows { columns: vec!["x".into()], rows: vec![vec![Value::Integer(10)]] },
            b.execute(tb, stmt("SELECT x FROM t WHERE id = 1")).await?
        );
        a.commit(ta).await?;
        assert_eq!(Err(Error::Abort), b.commit(tb).await);
        assert_eq!(Some(Value::Integer(0)), a.get("t", 1)?);

        // Read-only transactions neither write nor abort.
        let ro = a.begin(true, None).await?;
        assert_eq!(Err(Error::ReadOnly), a.execute(ro, stmt("DELETE FROM t")).await);
        let tb = b.begin(false, None).await?;
        b.execute(tb, stmt("DELETE FROM t")).await?;
        b.commit(tb).await?;
        a.commit(ro).await?;
        assert_eq!(0, a.open_transactions()?);
        Ok(())
    }

    #[tokio::test]
    async fn injected_aborts() -> Result<()> {
        let mut db = setup().await?;
        db.abort_next_commits(1)?;
        let txn = db.begin(false, None).await?;
        db.execute(txn, stmt("UPDATE t SET x = 1")).await?;
        assert_eq!(Err(Error::Abort), db.commit(txn).await);

        db.abort_statements("set x = 2", 1)?;
        let txn = db.begin(false, None).await?;
        assert_eq!(Err(Error::Abort), db.execute(txn, stmt("UPDATE t SET x = 2")).await);
        assert_eq!(Err(Error::Abort), db.execute(txn, stmt("SELECT * FROM t")).await);
        db.rollback(txn).await?;

        assert_eq!(Some(Value::Integer(10)), db.get("t", 1)?);
        assert_eq!(2, db.stats()?.aborts);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn injected_delays() -> Result<()> {
        let mut db = setup().await?;
        db.delay_statement("where id = 1", Duration::from_secs(5))?;
        let txn = db.begin(false, None).await?;

        let start = tokio::time::Instant::now();
        db.execute(txn, stmt("UPDATE t SET x = 1 WHERE id = 1")).await?;
        assert!(start.elapsed() >= Duration::from_secs(5));

        // The delay is used up.
        let start = tokio::time::Instant::now();
        db.execute(txn, stmt("UPDATE t SET x = 2 WHERE id = 1")).await?;
        assert!(start.elapsed() < Duration::from_secs(5));
        db.commit(txn).await?;
        assert_eq!(Some(Value::Integer(2)), db.get("t", 1)?);
        Ok(())
    }

    #[tokio::test]
    async fn batches() -> Result<()> {
        let mut db = setup().await?;
        let outcome = db
            .submit_ddl_batch(vec![
                "CREATE TABLE a (id INT, v STRING)".into(),
                "CREATE TABLE t (id INT, x INT)".into(),
                "CREATE TABLE b (id INT, v STRING)".into(),
            ])
            .await?;
        assert_eq!(vec![0], outcome.counts);
        assert!(matches!(outcome.error, Some(Error::Value(_))));
        assert_eq!(vec!["a".to_string(), "t".to_string()], db.tables()?);

        let txn = db.begin(false, None).await?;
        let outcome = db
            .submit_dml_batch(
                txn,
                vec![
                    stmt("UPDATE t SET x = x + 1"),
                    stmt("INSERT INTO t VALUES (1, 0)"),
                    stmt("DELETE FROM t"),
                ],
            )
            .await?;
        assert_eq!(vec![2], outcome.counts);
        assert!(outcome.error.is_some());
        assert!(!db.stats()?.executed.contains(&"DELETE FROM t".to_string()));
        Ok(())
    }
}
