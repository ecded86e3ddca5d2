//! siteindex: CLI tool for partitioning, checking and querying site catalogs.

use clap::{Parser, Subcommand};
use flate2::write::GzEncoder;
use flate2::Compression;
use siteindex::chunk::{sha256_hex, ManifestFile, PartitionInfo};
use siteindex::{
    parse_catalog_bytes, ChunkManifest, ConfigEntry, EngineConfig, EngineConfigOverrides,
    FileChunkSource, Header, SiteEngine,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "siteindex")]
#[command(version)]
#[command(about = "Partition, check and query per-site rule catalogs", long_about = None)]
struct Cli {
    /// Engine configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use mobile crawler user agents
    #[arg(long, global = true)]
    mobile: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a catalog into per-TLD partitions plus a manifest
    Split {
        /// Input catalog (JSON or YAML, optionally gzipped)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Gzip partition files
        #[arg(long)]
        gzip: bool,
    },

    /// Load a catalog and print index statistics
    Check {
        /// Input catalog
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Show the block decision and rewritten headers for a request
    Query {
        /// Input catalog
        #[arg(short, long)]
        input: PathBuf,

        /// Domain the request is made on
        #[arg(short, long)]
        domain: String,

        /// Requested URL
        #[arg(short, long)]
        url: Option<String>,

        /// Request header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Resolve a domain through a partition manifest
    Resolve {
        /// Manifest written by `split`
        #[arg(short, long)]
        manifest: PathBuf,

        /// Domain to resolve
        #[arg(short, long)]
        domain: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref(), cli.mobile) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Split {
            input,
            output_dir,
            gzip,
        } => split_catalog(&input, &output_dir, gzip),
        Commands::Check { input } => check_catalog(&input, config),
        Commands::Query {
            input,
            domain,
            url,
            headers,
        } => query_catalog(&input, config, &domain, url.as_deref(), &headers),
        Commands::Resolve { manifest, domain } => resolve_domain(&manifest, config, &domain).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_config(path: Option<&Path>, mobile: bool) -> siteindex::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let overrides = EngineConfigOverrides {
        mobile: mobile.then_some(true),
        ..Default::default()
    };
    Ok(config.merge(&overrides))
}

fn read_catalog(input: &Path) -> Result<Vec<ConfigEntry>, Box<dyn std::error::Error>> {
    let data = fs::read(input)?;
    Ok(parse_catalog_bytes(&data)?)
}

/// Partition key: the top-level label of the entry's first domain.
fn partition_key(entry: &ConfigEntry) -> Option<String> {
    let domain = entry.domains().into_iter().next()?;
    let tld = domain.rsplit('.').next()?.to_string();
    if tld.is_empty() {
        None
    } else {
        Some(tld)
    }
}

fn encode(entries: &[ConfigEntry], gzip: bool) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let json = serde_json::to_vec_pretty(entries)?;
    if !gzip {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn split_catalog(input: &Path, output_dir: &Path, gzip: bool) -> CliResult {
    let entries: Vec<ConfigEntry> = read_catalog(input)?
        .into_iter()
        .filter(|e| !e.is_comment())
        .collect();

    let mut partitions: BTreeMap<String, Vec<ConfigEntry>> = BTreeMap::new();
    for entry in &entries {
        if let Some(key) = partition_key(entry) {
            partitions.entry(key).or_default().push(entry.clone());
        }
    }

    let chunk_dir = output_dir.join("chunks");
    fs::create_dir_all(&chunk_dir)?;
    let ext = if gzip { "json.gz" } else { "json" };

    let mut manifest = ManifestFile::default();
    for (name, members) in &partitions {
        let data = encode(members, gzip)?;
        let locator = format!("chunks/{}.{}", name, ext);
        fs::write(output_dir.join(&locator), &data)?;

        manifest.partitions.insert(
            name.clone(),
            PartitionInfo {
                source: locator,
                domains: members.iter().flat_map(ConfigEntry::domains).collect(),
                sha256: Some(sha256_hex(&data)),
            },
        );
        log::debug!("Partition {}: {} entries", name, members.len());
    }

    let fallback = format!("catalog.{}", ext);
    fs::write(output_dir.join(&fallback), encode(&entries, gzip)?)?;
    manifest.fallback = Some(fallback);

    fs::write(
        output_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    println!(
        "Split {} entries into {} partitions under {:?}",
        entries.len(),
        partitions.len(),
        output_dir
    );
    Ok(())
}

fn check_catalog(input: &Path, config: EngineConfig) -> CliResult {
    let entries = read_catalog(input)?;
    let total = entries.len();
    let engine = SiteEngine::with_catalog(config, entries);

    let stats = engine.index().stats();
    let patterns = engine.index().patterns().stats();
    println!("Entries:             {}", total);
    println!("Domains:             {}", stats.domains);
    println!("  direct:            {}", stats.direct);
    println!("  grouped:           {}", stats.grouped);
    println!("Group entries:       {}", stats.shared_entries);
    println!("Block-pattern sites: {}", stats.with_block_patterns);
    println!("Compiled patterns:   {}", patterns.compiled);
    println!("Header rules:        {}", engine.header_rules().len());
    Ok(())
}

fn parse_header(raw: &str) -> Result<Header, Box<dyn std::error::Error>> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("invalid header {:?}, expected \"Name: value\"", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn query_catalog(
    input: &Path,
    config: EngineConfig,
    domain: &str,
    url: Option<&str>,
    raw_headers: &[String],
) -> CliResult {
    let engine = SiteEngine::with_catalog(config, read_catalog(input)?);
    let headers = raw_headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<Vec<_>, _>>()?;

    let (matched, entry) = match engine.lookup_host(domain) {
        Some(found) => found,
        None => {
            println!("{}: no configuration", domain);
            return Ok(());
        }
    };
    println!("{}: {} (via {})", domain, entry.name, matched);

    if let Some(url) = url {
        println!("block {}: {}", url, engine.should_block(&matched, url));
    }
    if let Some(policy) = engine.cookie_policy(&matched) {
        println!("cookies: {:?}", policy);
    }
    for (name, value) in engine.apply_headers(&matched, &headers).iter() {
        println!("{}: {}", name, value);
    }
    Ok(())
}

async fn resolve_domain(manifest_path: &Path, config: EngineConfig, domain: &str) -> CliResult {
    let root = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let engine = SiteEngine::new(config).with_chunks(
        ChunkManifest::load(manifest_path)?,
        Arc::new(FileChunkSource::new(root)),
    );

    let found = engine.resolve(domain).await;
    match engine.lookup(domain) {
        Some(entry) if found => println!("{}: {}", domain, entry.name),
        _ => println!("{}: not found", domain),
    }
    if let Some(loader) = engine.loader() {
        println!("{:?}", loader.stats());
    }
    Ok(())
}
