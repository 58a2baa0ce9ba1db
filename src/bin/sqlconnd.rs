/*
 * sqlconnd serves an in-memory database over TCP, for use with the sqlconn shell. It takes
 * an optional config file as its only argument; SQLCONND_* environment variables override
 * the file.
 */

#![warn(clippy::all)]

use log::info;
use sqlconn::error::Result;
use sqlconn::{Memory, Server, ServerConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let file = std::env::args().nth(1);
    let config = ServerConfig::load(file.as_deref())?;
    env_logger::Builder::new().filter_level(config.log_filter()?).parse_default_env().try_init()?;

    let listener = TcpListener::bind(config.listen_addr()?).await?;
    tokio::select! {
        result = Server::new(Memory::new()).serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
