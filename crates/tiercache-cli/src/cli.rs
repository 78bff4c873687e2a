use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tiercache_core::Ttl;

#[derive(Parser)]
#[command(name = "tiercache")]
#[command(about = "Inspect and modify a tiercache namespace")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to ./tiercache.toml when present)
    #[arg(short, long, global = true, env = "TIERCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cache namespace
    #[arg(short, long, global = true, env = "TIERCACHE_NAMESPACE", default_value = "global")]
    pub namespace: String,

    /// Redis host (overrides settings)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Redis port (overrides settings)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Log level (overrides settings; RUST_LOG wins over both)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read a key
    Get(KeyArgs),
    /// Write a key
    Set(SetArgs),
    /// Delete a key
    Del(KeyArgs),
    /// Delete every key in the namespace
    Clear,
    /// Count keys in the namespace
    Size,
    /// Check whether a key exists
    Has(KeyArgs),
}

#[derive(clap::Args)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(clap::Args)]
pub struct SetArgs {
    pub key: String,
    /// JSON value; anything that is not valid JSON is stored as a string
    pub value: String,
    /// Time to live: milliseconds or a duration such as "1d 3h"
    #[arg(long)]
    pub ttl: Option<Ttl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_with_human_ttl() {
        let cli = Cli::try_parse_from(["tiercache", "-n", "users", "set", "42", "{\"a\":1}", "--ttl", "1d 3h"])
            .unwrap();
        assert_eq!(cli.namespace, "users");
        match cli.command {
            Commands::Set(args) => {
                assert_eq!(args.key, "42");
                assert_eq!(args.ttl.unwrap().as_millis(), (27 * 3600) * 1000);
            }
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn test_parse_set_with_millis_ttl() {
        let cli = Cli::try_parse_from(["tiercache", "set", "k", "v", "--ttl", "1500"]).unwrap();
        match cli.command {
            Commands::Set(args) => assert_eq!(args.ttl, Some(Ttl::from(1500u64))),
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn test_rejects_bad_ttl() {
        assert!(Cli::try_parse_from(["tiercache", "set", "k", "v", "--ttl", "soon"]).is_err());
    }

    #[test]
    fn test_default_namespace() {
        let cli = Cli::try_parse_from(["tiercache", "size"]).unwrap();
        assert_eq!(cli.namespace, "global");
        assert!(matches!(cli.command, Commands::Size));
    }
}
