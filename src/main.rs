use std::env;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use melker_bundler::bundle::FatalError;
use melker_bundler::runtime::{exit_fatal, NoDisplay};
use melker_bundler::{
    execute_bundle, process_melker_bundle, BundleCache, BundleOptions, DenoHost, DenoToolchain,
    ExecutionContext, ParseResult,
};

const USAGE: &str = "usage: melker-bundler [--no-cache] [--minify] [--debug] [--cache-dir <path>] [--out <path>] [--run [-- <args>...]]
       melker-bundler --cache-stats | --clear-cache | --clear-cache-older-than <secs> [--cache-dir <path>]";

#[derive(Debug)]
enum Mode {
    Bundle,
    CacheStats,
    ClearCache,
    ClearCacheOlderThan(Duration),
}

#[derive(Debug)]
struct Args {
    mode: Mode,
    opts: BundleOptions,
    out: Option<PathBuf>,
    run: bool,
    argv: Vec<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("[melker-bundler] {err:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MELKER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    let args = parse_args(env::args().skip(1))?;
    let cache = BundleCache::open(args.opts.cache_dir.as_deref());

    match args.mode {
        Mode::CacheStats => {
            let stats = cache.stats().await.context("failed to scan the bundle cache")?;
            println!("cache dir: {}", cache.dir().display());
            println!("entries:   {}", stats.count);
            println!("size:      {} bytes", stats.total_bytes);
            if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
                println!("oldest:    {}", oldest.to_rfc3339());
                println!("newest:    {}", newest.to_rfc3339());
            }
            return Ok(());
        }
        Mode::ClearCache => {
            let removed = cache.clear().await.context("failed to clear the bundle cache")?;
            println!("removed {removed} cache entries");
            return Ok(());
        }
        Mode::ClearCacheOlderThan(max_age) => {
            let removed = cache
                .clear_older_than(max_age)
                .await
                .context("failed to clear the bundle cache")?;
            println!("removed {removed} cache entries older than {}s", max_age.as_secs());
            return Ok(());
        }
        Mode::Bundle => {}
    }

    let mut stdin_payload = String::new();
    io::stdin()
        .read_to_string(&mut stdin_payload)
        .context("failed to read stdin")?;
    if stdin_payload.trim().is_empty() {
        bail!("stdin payload is empty");
    }
    let parsed: ParseResult =
        serde_json::from_str(&stdin_payload).context("invalid ParseResult JSON")?;

    let toolchain = DenoToolchain::from_env();
    let assembled = match process_melker_bundle(&parsed, &args.opts, &toolchain).await {
        Ok(assembled) => assembled,
        Err(err) => exit_fatal(&mut NoDisplay, &FatalError::new(&parsed, &err)),
    };

    if let Some(metadata) = &assembled.metadata {
        for diagnostic in &metadata.diagnostics {
            tracing::debug!(level = ?diagnostic.level, context = ?diagnostic.context, "{}", diagnostic.message);
        }
    }

    if !args.run {
        let json = serde_json::to_string_pretty(&assembled).context("failed to serialize bundle")?;
        match &args.out {
            Some(path) => tokio::fs::write(path, json)
                .await
                .with_context(|| format!("failed to write '{}'", path.display()))?,
            None => println!("{json}"),
        }
        return Ok(());
    }

    let context = ExecutionContext::for_source(&parsed.source_id, args.argv);
    let host = DenoHost::from_env();
    let mut registry = match execute_bundle(assembled, &host, &context).await {
        Ok(registry) => registry,
        Err(err) => exit_fatal(&mut NoDisplay, &err.report()),
    };
    if let Err(err) = registry.call_ready().await {
        exit_fatal(&mut NoDisplay, &err.report());
    }
    registry.close().await.context("script host did not shut down cleanly")?;
    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args {
        mode: Mode::Bundle,
        opts: BundleOptions {
            use_cache: true,
            ..Default::default()
        },
        out: None,
        run: false,
        argv: Vec::new(),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-cache" => parsed.opts.use_cache = false,
            "--minify" => parsed.opts.minify = true,
            "--debug" => parsed.opts.debug = true,
            "--run" => parsed.run = true,
            "--cache-dir" => {
                let value = args.next().context("missing value for --cache-dir")?;
                parsed.opts.cache_dir = Some(PathBuf::from(value));
            }
            "--out" => {
                let value = args.next().context("missing value for --out")?;
                parsed.out = Some(PathBuf::from(value));
            }
            "--cache-stats" => parsed.mode = Mode::CacheStats,
            "--clear-cache" => parsed.mode = Mode::ClearCache,
            "--clear-cache-older-than" => {
                let value = args
                    .next()
                    .context("missing value for --clear-cache-older-than")?;
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("invalid number of seconds '{value}'"))?;
                parsed.mode = Mode::ClearCacheOlderThan(Duration::from_secs(secs));
            }
            "--" => {
                parsed.argv.extend(args.by_ref());
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                process::exit(0);
            }
            _ => bail!("unknown argument '{arg}'. {USAGE}"),
        }
    }

    if !parsed.argv.is_empty() && !parsed.run {
        bail!("app arguments after `--` require --run");
    }
    Ok(parsed)
}
