//! # wikicomma CLI
//!
//! Loads a JSON configuration (spec §6), builds one [`SiteEngine`] per
//! configured wiki, and runs them concurrently under a shared sitemap
//! lock. Exits 0 on clean completion, 1 on missing or invalid
//! configuration (or on any wiki's run raising a fatal error).
//!
//! Usage:
//!   wikicomma --config path/to/wikicomma.json
//!   WIKICOMMA_CONFIG=path/to/wikicomma.json wikicomma

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

use wikicomma_core::{SiteEngine, SiteEngineConfig, Sink, TracingTelemetry};

#[derive(Parser, Debug)]
#[command(name = "wikicomma", about = "Incremental, resumable wiki archiver")]
struct Args {
    /// Path to the JSON configuration file. Falls back to WIKICOMMA_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Config {
    base_directory: String,
    wikis: Vec<WikiConfig>,
    #[serde(default)]
    ratelimit: Option<RatelimitConfig>,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    maximum_jobs: Option<usize>,
    #[serde(default)]
    http_proxy: Option<ProxyAddr>,
    #[serde(default)]
    socks_proxy: Option<ProxyAddr>,
    #[serde(default = "default_user_list_cache_freshness")]
    user_list_cache_freshness: u64,
}

fn default_user_list_cache_freshness() -> u64 {
    86_400
}

#[derive(Debug, Deserialize)]
struct WikiConfig {
    name: String,
    url: String,
    #[serde(default)]
    blacklist: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RatelimitConfig {
    bucket_size: u32,
    refill_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ProxyAddr {
    address: String,
    port: u16,
}

/// Resolve the configuration path: `--config` wins, else `WIKICOMMA_CONFIG`.
fn config_path(args: &Args) -> Option<PathBuf> {
    args.config
        .clone()
        .or_else(|| std::env::var("WIKICOMMA_CONFIG").ok().map(PathBuf::from))
}

fn load_config(path: &std::path::Path) -> Result<Config, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("reading {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("parsing {}: {}", path.display(), e))
}

fn engine_config(wiki: &WikiConfig, cfg: &Config) -> SiteEngineConfig {
    SiteEngineConfig {
        name: wiki.name.clone(),
        url: wiki.url.trim_end_matches('/').to_string(),
        blacklist: wiki.blacklist.clone(),
        ratelimit_bucket_size: cfg.ratelimit.as_ref().map(|r| r.bucket_size),
        ratelimit_refill_seconds: cfg.ratelimit.as_ref().map(|r| r.refill_seconds),
        delay_ms: cfg.delay_ms,
        maximum_jobs: cfg.maximum_jobs,
        http_proxy: cfg.http_proxy.as_ref().map(|p| (p.address.clone(), p.port)),
        socks_proxy: cfg.socks_proxy.as_ref().map(|p| (p.address.clone(), p.port)),
        user_list_cache_freshness_secs: cfg.user_list_cache_freshness,
        ..Default::default()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Some(path) = config_path(&args) else {
        eprintln!("no configuration: pass --config <path> or set WIKICOMMA_CONFIG");
        std::process::exit(1);
    };

    let config = match load_config(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if config.wikis.is_empty() {
        eprintln!("invalid configuration: `wikis` must list at least one entry");
        std::process::exit(1);
    }

    let base_directory = PathBuf::from(&config.base_directory);
    let sitemap_lock = Arc::new(AsyncMutex::new(()));

    let mut engines = Vec::with_capacity(config.wikis.len());
    for wiki in &config.wikis {
        let econfig = engine_config(wiki, &config);
        let telemetry = Sink::new(wiki.name.clone(), Arc::new(TracingTelemetry));
        match SiteEngine::new(econfig, &base_directory, telemetry) {
            Ok(engine) => engines.push(engine),
            Err(e) => {
                eprintln!("failed to construct site engine for '{}': {}", wiki.name, e);
                std::process::exit(1);
            }
        }
    }

    info!(count = engines.len(), "starting crawl");

    let runs = engines
        .iter()
        .map(|engine| engine.run(Arc::clone(&sitemap_lock)));
    let results = futures_util::future::join_all(runs).await;

    let mut failed = false;
    for (wiki, result) in config.wikis.iter().zip(results) {
        if let Err(e) = result {
            failed = true;
            error!(wiki = %wiki.name, error = %e, "site run failed");
        }
    }

    if failed {
        std::process::exit(1);
    }
    info!("crawl finished");
}
