//! accelstore — inspect and seed the response cache store.
//!
//! Usage:
//!   accelstore put --config config.toml --url http://x/a --vary gzip < body
//!   accelstore get --config config.toml --url http://x/a [--body]

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use accelstore::config::Config;
use accelstore::storage::{make_storage, Discriminators, EntryMeta};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "accelstore", about = "Response cache storage tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store stdin as the body of one cache variant.
    Put {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        url: String,
        /// Discriminator value; repeat for a multi-value tuple.
        #[arg(long = "vary")]
        vary: Vec<String>,
        #[arg(long, default_value_t = 200)]
        status: u16,
        /// Response header as `Name: value`; repeatable.
        #[arg(long = "header")]
        headers: Vec<String>,
        /// Seconds from now until the entry expires.
        #[arg(long, default_value_t = 0)]
        ttl: i64,
        /// Extra field as `key=json`; repeatable.
        #[arg(long = "extra")]
        extras: Vec<String>,
    },
    /// List every stored variant of a URL.
    Get {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        url: String,
        /// Write bodies to stdout after the listing.
        #[arg(long)]
        body: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Put { config, url, vary, status, headers, ttl, extras } => {
            run_put(config, &url, vary, status, &headers, ttl, &extras)
        }
        Command::Get { config, url, body } => run_get(config, &url, body),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}

fn run_put(
    config_path: PathBuf,
    url: &str,
    vary: Vec<String>,
    status: u16,
    headers: &[String],
    ttl: i64,
    extras: &[String],
) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let storage = make_storage(&cfg.storage)?;

    let expires = expires_at(Utc::now().timestamp(), ttl)?;
    let mut meta = EntryMeta::new(Discriminators::new(vary), expires, status);
    for h in headers {
        let Some((name, value)) = h.split_once(':') else {
            bail!("header '{h}' is not of the form 'Name: value'");
        };
        meta = meta.header(name.trim(), value.trim());
    }
    for x in extras {
        let Some((key, raw)) = x.split_once('=') else {
            bail!("extra '{x}' is not of the form 'key=json'");
        };
        let value: serde_json::Value = serde_json::from_str(raw)
            .with_context(|| format!("extra '{key}' is not valid JSON"))?;
        meta = meta.extra(key, value);
    }

    let mut writer = storage.store(url, meta)?;
    let mut stdin = std::io::stdin().lock();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stdin.read(&mut buf).context("reading body from stdin")?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n])?;
    }
    let bytes = writer.bytes_written();
    writer.close()?;
    info!(url, bytes, "Entry stored");
    Ok(())
}

/// Absolute expiry for a TTL in seconds; `0` (never) when `ttl <= 0`.
fn expires_at(now: i64, ttl: i64) -> anyhow::Result<i64> {
    if ttl <= 0 {
        return Ok(0);
    }
    match now.checked_add(ttl) {
        Some(ts) => Ok(ts),
        None => bail!("--ttl {ttl} overflows the expiry timestamp"),
    }
}

fn run_get(config_path: PathBuf, url: &str, dump_body: bool) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let storage = make_storage(&cfg.storage)?;

    let mut stdout = std::io::stdout().lock();
    let mut found = 0usize;
    for entry in storage.fetch(url)? {
        found += 1;
        let meta = &entry.meta;
        let expires = match DateTime::<Utc>::from_timestamp(meta.expires, 0) {
            Some(ts) if meta.expires != 0 => ts.to_rfc3339(),
            _ => meta.expires.to_string(),
        };
        writeln!(stdout, "=== Variant {} ===", meta.discriminators)?;
        writeln!(stdout, "Status  : {}", meta.status)?;
        writeln!(stdout, "Expires : {expires}")?;
        for (name, value) in &meta.headers {
            writeln!(stdout, "  {name}: {value}")?;
        }
        for (key, value) in &meta.extras {
            writeln!(stdout, "  [{key}] = {value}")?;
        }
        if dump_body {
            let mut body = entry.body;
            std::io::copy(&mut body, &mut stdout)?;
            writeln!(stdout)?;
        }
    }
    if found == 0 {
        writeln!(stdout, "No entries for {url}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_added_to_now() {
        assert_eq!(expires_at(1_000, 60).unwrap(), 1_060);
        assert_eq!(expires_at(1_000, 0).unwrap(), 0);
        assert_eq!(expires_at(1_000, -5).unwrap(), 0);
    }

    #[test]
    fn huge_ttl_is_rejected() {
        let err = expires_at(1_700_000_000, i64::MAX).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }
}
