/*
 * sqlconn is an interactive shell on top of a connection to a sqlconnd server. Usage:
 *
 *     sqlconn [ADDRESS] [CONFIG_FILE]
 *
 * Besides SQL statements and connection directives, it accepts !retries to show the
 * connection's retry counters and !quit to exit.
 */

#![warn(clippy::all)]

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use sqlconn::error::Result;
use sqlconn::{Client, Connection, ConnectionConfig, ResultSet};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).try_init()?;

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:9705".into());
    let config = ConnectionConfig::load(args.next().as_deref())?;
    let client = Client::new(addr.as_str()).await?;
    println!("Connected to {}. Enter !quit or ^D to exit.", addr);

    Shell::new(Connection::new(client, &config))?.run().await
}

struct Shell {
    conn: Connection<Client>,
    editor: DefaultEditor,
}

impl Shell {
    fn new(conn: Connection<Client>) -> Result<Self> {
        Ok(Self { conn, editor: DefaultEditor::new()? })
    }

    async fn run(&mut self) -> Result<()> {
        while let Some(input) = self.prompt()? {
            match input.as_str() {
                "!quit" => break,
                "!retries" => {
                    let stats = self.conn.retry_stats();
                    println!(
                        "aborts={} attempts={} recovered={} failed={}",
                        stats.aborts, stats.attempts, stats.recovered, stats.failed
                    );
                }
                sql => match self.conn.execute(sql, Vec::new()).await {
                    Ok(result) => print(result),
                    Err(err) => println!("Error: {}", err),
                },
            }
        }
        self.conn.close().await
    }

    /// Reads the next non-empty line, or None at end of input.
    fn prompt(&mut self) -> Result<Option<String>> {
        loop {
            let prompt = format!("sqlconn:{}> ", self.conn.phase());
            match self.editor.readline(&prompt) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    self.editor.add_history_entry(line.as_str())?;
                    return Ok(Some(line.trim().to_owned()));
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn print(result: ResultSet) {
    match result {
        ResultSet::Query { columns, rows } => {
            println!("{}", columns.join("|"));
            for row in rows {
                println!("{}", row.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("|"));
            }
        }
        ResultSet::Update { count } => println!("{} rows affected", count),
        ResultSet::Batch { counts } => println!("Batch ran, row counts {:?}", counts),
        ResultSet::Empty => {}
    }
}
