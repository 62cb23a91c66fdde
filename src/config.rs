//! Server configuration from flags and environment.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "csv-api")]
#[command(about = "Load CSV files and query them over HTTP")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8001)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Durable store: a postgres:// URL or an SQLite path
    #[arg(long = "db-url", env = "DATABASE_URL", default_value = "file:data.db")]
    pub database_url: String,

    /// Directory holding one ephemeral database per table
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

impl Config {
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}
