use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use audiencelens_common::{Config, EntityId, PlatformId, StoreLocation, SubjectKey};
use audiencelens_enrichment::{
    DemographicsEnricher, EnrichmentWorker, ReportDemographics, StaticProfiles,
};
use audiencelens_store::CacheStore;
use research_client::{HttpTransport, ResearchClient};

#[derive(Parser)]
#[command(name = "audiencelens")]
#[command(about = "Audience demographics enrichment")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich one entity now and print the per-platform result
    Enrich {
        /// Entity id
        #[arg(long)]
        entity: String,

        /// Display name the research agent should look for
        #[arg(long)]
        name: String,

        /// Platform account as PLATFORM=PROFILE_URL (repeatable)
        #[arg(long = "account", value_parser = parse_account, required = true)]
        accounts: Vec<(String, String)>,
    },

    /// Queue every entity in a JSON file through the background worker
    Batch {
        /// JSON array of {"entity", "name", "accounts": {platform: url}}
        file: PathBuf,
    },

    /// Print cached demographics for an entity without researching anything
    Show {
        #[arg(long)]
        entity: String,

        /// Platform to show (repeatable)
        #[arg(long = "platform", required = true)]
        platforms: Vec<String>,
    },

    /// Delete cache rows older than the TTL
    Evict,
}

#[derive(Deserialize)]
struct BatchEntry {
    entity: serde_json::Value,
    name: String,
    accounts: BTreeMap<String, String>,
}

fn parse_account(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(p, u)| (p.to_string(), u.to_string()))
        .ok_or_else(|| format!("expected PLATFORM=PROFILE_URL, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("audiencelens=info".parse()?)
                .add_directive("research_client=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Enrich {
            entity,
            name,
            accounts,
        } => enrich(&entity, &name, &accounts).await,
        Commands::Batch { file } => batch(&file).await,
        Commands::Show { entity, platforms } => show(&entity, &platforms).await,
        Commands::Evict => evict().await,
    }
}

async fn open_store(config: &Config) -> Result<CacheStore> {
    let store = match &config.store {
        StoreLocation::Postgres(url) => CacheStore::postgres(url).await,
        StoreLocation::Sqlite(path) => CacheStore::sqlite(path).await,
    }
    .context("Failed to open demographics cache")?;
    Ok(store.with_ttl(config.demographics_ttl))
}

fn build_enricher(config: &Config, store: CacheStore, profiles: StaticProfiles) -> DemographicsEnricher {
    let transport = HttpTransport::with_endpoint(
        config.research_api_key.clone(),
        config.research_base_url.clone(),
        config.research_agent.clone(),
    );
    let client = ResearchClient::with_transport(Arc::new(transport))
        .with_timeout(config.research_timeout);

    DemographicsEnricher::builder()
        .store(store)
        .client(Arc::new(client))
        .profiles(Arc::new(profiles))
        .refresh_interval(config.connection_refresh_interval)
        .build()
}

fn platform_ids<'a>(raw: impl IntoIterator<Item = &'a String>) -> Result<Vec<PlatformId>> {
    raw.into_iter()
        .map(|p| PlatformId::new(p).with_context(|| format!("Invalid platform {p:?}")))
        .collect()
}

async fn enrich(entity: &str, name: &str, accounts: &[(String, String)]) -> Result<()> {
    let config = Config::from_env()?;
    let entity = EntityId::try_from(entity)?;

    let mut profiles = StaticProfiles::new();
    let mut platforms = Vec::with_capacity(accounts.len());
    for (platform, url) in accounts {
        let key = SubjectKey::new(entity, PlatformId::new(platform)?);
        platforms.push(key.platform.clone());
        profiles.insert(key, name, url);
    }

    let store = open_store(&config).await?;
    let enricher = build_enricher(&config, store, profiles);

    info!(entity = %entity, platforms = platforms.len(), "Manual enrichment starting");
    let outcome = enricher.enrich_subject(entity, &platforms).await?;

    let printable: BTreeMap<String, bool> = outcome
        .into_iter()
        .map(|(p, ok)| (p.to_string(), ok))
        .collect();
    println!("{}", serde_json::to_string_pretty(&printable)?);
    Ok(())
}

async fn batch(file: &PathBuf) -> Result<()> {
    let config = Config::from_env()?;
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let entries: Vec<BatchEntry> = serde_json::from_str(&raw).context("Malformed batch file")?;

    let mut profiles = StaticProfiles::new();
    let mut requests = Vec::with_capacity(entries.len());
    for entry in &entries {
        let entity = EntityId::try_from(&entry.entity)?;
        let platforms = platform_ids(entry.accounts.keys())?;
        for (platform, url) in platforms.iter().zip(entry.accounts.values()) {
            profiles.insert(SubjectKey::new(entity, platform.clone()), &entry.name, url);
        }
        requests.push((entity, platforms));
    }

    let store = open_store(&config).await?;
    let enricher = build_enricher(&config, store, profiles);
    let (handle, worker) = EnrichmentWorker::spawn(enricher, config.worker_concurrency);

    for (entity, platforms) in requests {
        let run_id = handle.enqueue(entity, platforms).await?;
        info!(run_id = %run_id, entity = %entity, "Queued enrichment");
    }
    drop(handle);

    worker.await.context("Enrichment worker crashed")?;
    Ok(())
}

async fn show(entity: &str, platforms: &[String]) -> Result<()> {
    let config = Config::store_from_env()?;
    let entity = EntityId::try_from(entity)?;
    let platforms = platform_ids(platforms)?;

    let report = ReportDemographics::new(open_store(&config).await?);
    let found = report.for_entity(entity, &platforms).await;
    let printable: BTreeMap<String, _> = found
        .into_iter()
        .map(|(p, profile)| (p.to_string(), profile))
        .collect();
    println!("{}", serde_json::to_string_pretty(&printable)?);
    Ok(())
}

async fn evict() -> Result<()> {
    let config = Config::store_from_env()?;
    let store = open_store(&config).await?;
    let removed = store.evict_expired().await?;
    println!("Removed {removed} expired cache rows");
    Ok(())
}
