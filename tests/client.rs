use sqlconn::{Client, Connection, ConnectionConfig, Error, Memory, Result, Server, Value};

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Starts a server for the given database on a random local port.
async fn serve(db: Memory) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(Server::new(db).serve(listener));
    Ok(addr)
}

#[tokio::test]
async fn remote_connection() -> Result<()> {
    let db = Memory::new();
    let addr = serve(db.clone()).await?;
    let mut conn = Connection::new(Client::new(addr).await?, &ConnectionConfig::default());

    conn.execute("CREATE TABLE t (id INT, x INT)", vec![]).await?;
    conn.execute("INSERT INTO t VALUES (?, ?)", vec![Value::Integer(1), Value::Integer(1)]).await?;

    // Aborts travel over the wire and are retried client-side.
    db.abort_next_commits(1)?;
    let result = conn.execute("UPDATE t SET x = x + 1 WHERE id = 1", vec![]).await?;
    assert_eq!(1, result.count()?);
    assert_eq!(Some(Value::Integer(2)), db.get("t", 1)?);
    assert_eq!(1, conn.retry_stats().recovered);

    let rows = conn.execute("SELECT x FROM t", vec![]).await?.into_rows()?;
    assert_eq!(vec![vec![Value::Integer(2)]], rows);
    assert_eq!(
        Some(Error::Value("Table nope does not exist".into())),
        conn.execute("SELECT * FROM nope", vec![]).await.err()
    );

    conn.execute("START BATCH DML", vec![]).await?;
    conn.execute("INSERT INTO t VALUES (2, 2)", vec![]).await?;
    conn.execute("INSERT INTO t VALUES (3, 3)", vec![]).await?;
    assert_eq!(vec![1, 1], conn.run_batch().await?);
    assert_eq!(3, db.rows("t")?.len());

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn disconnect_rolls_back() -> Result<()> {
    let db = Memory::new();
    let addr = serve(db.clone()).await?;
    let mut conn = Connection::new(Client::new(addr).await?, &ConnectionConfig::default());
    conn.execute("CREATE TABLE t", vec![]).await?;
    conn.execute("BEGIN", vec![]).await?;
    conn.execute("INSERT INTO t VALUES (1, 'a')", vec![]).await?;
    assert_eq!(1, db.open_transactions()?);

    drop(conn);
    for _ in 0..100 {
        if db.open_transactions()? == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(0, db.open_transactions()?);
    assert_eq!(Vec::<(i64, Value)>::new(), db.rows("t")?);
    Ok(())
}

#[tokio::test]
async fn timed_out_call_keeps_session_usable() -> Result<()> {
    let db = Memory::new();
    let addr = serve(db.clone()).await?;
    let config = ConnectionConfig { statement_timeout_ms: 200, ..ConnectionConfig::default() };
    let mut conn = Connection::new(Client::new(addr).await?, &config);
    conn.execute("CREATE TABLE t (id INT, x INT)", vec![]).await?;
    conn.execute("INSERT INTO t VALUES (1, 1)", vec![]).await?;

    // The server still answers the timed-out call, after the client stopped waiting.
    db.delay_statement("set x = 10", Duration::from_millis(300))?;
    assert_eq!(
        Some(Error::Timeout),
        conn.execute("UPDATE t SET x = 10 WHERE id = 1", vec![]).await.err()
    );

    // Later calls get their own responses.
    let rows = conn.execute("SELECT x FROM t", vec![]).await?.into_rows()?;
    assert_eq!(vec![vec![Value::Integer(1)]], rows);
    let result = conn.execute("UPDATE t SET x = x + 1 WHERE id = 1", vec![]).await?;
    assert_eq!(1, result.count()?);
    assert_eq!(Some(Value::Integer(2)), db.get("t", 1)?);

    conn.execute("BEGIN", vec![]).await?;
    conn.execute("INSERT INTO t VALUES (2, 2)", vec![]).await?;
    conn.execute("COMMIT", vec![]).await?;
    assert_eq!(2, db.rows("t")?.len());
    assert_eq!(0, db.open_transactions()?);
    Ok(())
}
