use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tftpmux::config::{AppConfig, CliOverrides};
use tftpmux::tftp;

#[derive(Parser)]
#[command(name = "tftpmux", version, about = "File and directory transfer over a shared UDP endpoint")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve files and directories until Ctrl+C
    Serve {
        /// Directory to serve
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Local address to bind
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        /// Block size requested for downloads
        #[arg(long)]
        block_size: Option<u16>,
        /// Peer silence timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Download one file, or a directory archive with `dir:<name>`
    Get {
        /// Serving node
        server: SocketAddr,
        /// Name on the serving node
        remote: String,
        /// Where to write the result (defaults to the remote name)
        output: Option<PathBuf>,
        /// Local address to bind
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        #[arg(long)]
        block_size: Option<u16>,
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn init_logger(filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn default_output(remote: &str) -> PathBuf {
    match remote.strip_prefix(tftp::DIR_PREFIX) {
        Some(dir) => {
            let base = dir.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
            let base = if base.is_empty() || base == "." { "root" } else { base };
            PathBuf::from(format!("{}.tar", base))
        }
        None => PathBuf::from(remote.rsplit('/').next().unwrap_or(remote)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level);

    let app_config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Command::Serve {
            root,
            bind,
            block_size,
            timeout,
        } => {
            let overrides = CliOverrides {
                root_dir: root,
                bind,
                block_size,
                timeout: timeout.map(Duration::from_secs),
            };
            let (config, bind) = app_config.resolve(&overrides)?;
            tftp::server::run(config, bind).await
        }
        Command::Get {
            server,
            remote,
            output,
            bind,
            block_size,
            timeout,
        } => {
            let overrides = CliOverrides {
                root_dir: None,
                bind: Some(bind),
                block_size,
                timeout: timeout.map(Duration::from_secs),
            };
            let (config, bind) = app_config.resolve(&overrides)?;
            let output = output.unwrap_or_else(|| default_output(&remote));
            tftp::client::fetch(config, bind, server, &remote, &output).await.map(|_| ())
        }
    }
}
