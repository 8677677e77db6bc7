use clap::Parser;
use heimdall::config::Config;
use heimdall::{ProxyServer, config_validation, logging};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "A caching forward HTTP proxy with CONNECT tunneling"
)]
struct Args {
    #[clap(value_name = "PORT", help = "Port to listen on (overrides the port of --listen)")]
    port: Option<u16>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds (0 disables)")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Per-read timeout in seconds (0 disables)")]
    read_timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, help = "Disable the response cache")]
    no_cache: bool,

    #[clap(long, value_name = "DIR", help = "Mirror cached responses to this directory")]
    cache_dir: Option<PathBuf>,

    #[clap(long, value_name = "SECONDS", help = "Expire cached responses after this many seconds")]
    cache_ttl: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum number of cached responses")]
    cache_max_entries: Option<usize>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_args(&mut config, &args)?;

    logging::init(&config.logging)?;

    let validation = config_validation::validate(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err("Invalid configuration".into());
    }

    info!("Starting proxy server...");
    let server = ProxyServer::bind(&config).await?;

    server
        .run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    info!("Proxy server stopped. Goodbye!");
    Ok(())
}

fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse::<SocketAddr>()?;
    }
    if let Some(port) = args.port {
        config.listen_addr.set_port(port);
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.read_timeout {
        config.read_timeout_secs = secs;
    }
    if let Some(size) = args.max_header_size {
        config.max_header_size = size;
    }
    if args.no_cache {
        config.cache.enabled = false;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache.disk_dir = Some(dir.clone());
    }
    if let Some(ttl) = args.cache_ttl {
        config.cache.ttl_secs = Some(ttl);
    }
    if let Some(max) = args.cache_max_entries {
        config.cache.max_entries = Some(max);
    }
    if let Some(level) = &args.log_level {
        logging::parse_log_level(level)?;
        config.logging.level = level.clone();
    }
    if let Some(format) = &args.log_format {
        config.logging.format = logging::parse_log_format(format)?;
    }
    Ok(())
}
