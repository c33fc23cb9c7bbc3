use anyhow::Result;
use civic_assist_lib::{config::ServerConfig, init_tracing, run_server};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config file)
    #[arg(long, env = "CIVIC_ASSIST_HTTP_ADDR")]
    http_addr: Option<String>,

    /// SQLite database path (overrides config file)
    #[arg(long, env = "CIVIC_ASSIST_DATABASE")]
    database: Option<PathBuf>,

    /// Directory holding attached documents (overrides config file)
    #[arg(long, env = "CIVIC_ASSIST_DOCUMENTS_DIR")]
    documents_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // before loading config, which logs where it came from
    init_tracing();

    let mut config = ServerConfig::load(args.config)?;

    if let Some(addr) = args.http_addr {
        config.server.listen_addr = addr;
    }
    if let Some(database) = args.database {
        config.storage.database_path = database;
    }
    if let Some(documents_dir) = args.documents_dir {
        config.storage.documents_dir = documents_dir;
    }

    run_server(config).await
}
