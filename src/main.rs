//! MySQL MCP Server
//!
//! A Model Context Protocol (MCP) server for MySQL databases. The server is
//! launched as a subprocess by an LLM host application and speaks JSON-RPC
//! 2.0 over stdio, one message per line. Connection parameters arrive
//! through `MYSQL_*` environment variables (or the equivalent CLI flags).
//!
//! # Features
//!
//! - Schema inspection via `information_schema`
//! - SQL query execution with a read-only guard and a row cap
//! - Gated data manipulation tools (INSERT, UPDATE, DELETE)
//! - Structured logging to stderr with credential redaction

mod config;
mod db;
mod error;
mod rpc;
mod server;

use clap::Parser;
use config::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout is reserved for protocol frames.
    env_logger::init();

    let args = Args::parse();
    server::run(args).await
}
