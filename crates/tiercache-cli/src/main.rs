mod cli;
mod observability;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tiercache_core::{Ttl, ValueSource};
use tiercache_redis::config::loader::load_settings;
use tiercache_redis::{CacheRuntime, RedisCache};

use cli::{Cli, Commands};
use output::{parse_value, print_error, print_value};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("loading settings")?;
    if let Some(host) = &cli.host {
        settings.redis.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.redis.port = port;
    }

    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    observability::init_tracing_with_level(level);

    let runtime = CacheRuntime::with_redis(&settings.runtime)?;
    let cache = runtime.cache(&cli.namespace, &settings.redis)?;
    tracing::debug!(
        address = %settings.redis.address(),
        namespace = %cli.namespace,
        process_id = %runtime.process_id(),
        "cache ready"
    );

    let result = execute(&cache, cli.command).await?;
    print_value(&result);
    Ok(())
}

async fn execute(cache: &RedisCache, command: Commands) -> Result<Value> {
    let result = match command {
        Commands::Get(args) => cache.get::<Value>(&args.key).await?.unwrap_or(Value::Null),
        Commands::Set(args) => {
            let value = parse_value(&args.value);
            let ttl = args.ttl.unwrap_or(Ttl::NONE);
            let stored = cache.set(&args.key, ValueSource::literal(value), ttl).await?;
            json!({ "stored": stored, "ttl_ms": ttl.as_millis() })
        }
        Commands::Del(args) => json!({ "deleted": cache.del(&args.key).await? }),
        Commands::Clear => json!({ "removed": cache.clear().await? }),
        Commands::Size => json!({ "size": cache.size().await? }),
        Commands::Has(args) => json!({ "exists": cache.has(&args.key).await? }),
    };
    Ok(result)
}
