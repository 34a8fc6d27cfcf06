#![forbid(unsafe_code)]

//! Helper binary that refreshes the approved-video cache for every stored
//! talent. Acts like a nightly cron job.

use anyhow::{Context, Result, anyhow};
use skyward_tools::{
    config::{RuntimeOverrides, resolve_runtime_paths},
    secrets::{HttpSecretTransport, SecretResolver, SecretTransport},
    security::ensure_not_root,
    store::{RelayReader, RelayStore},
    youtube::{RemoteVideo, YoutubeClient},
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

const RELAY_DB_FILE: &str = "relay.db";

#[derive(Debug, Clone)]
struct RoutineArgs {
    data_root: PathBuf,
    bootstrap_blob: PathBuf,
    credential_file: PathBuf,
    secret_endpoint: String,
}

impl RoutineArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut data_root_override: Option<PathBuf> = None;
        let mut blob_override: Option<PathBuf> = None;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                data_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--blob=") {
                blob_override = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    data_root_override = Some(PathBuf::from(value));
                }
                "--blob" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--blob requires a value"))?;
                    blob_override = Some(PathBuf::from(value));
                }
                _ => {
                    anyhow::bail!("unknown argument: {arg}");
                }
            }
        }

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            data_root: data_root_override.clone(),
            bootstrap_blob: blob_override.clone(),
            ..RuntimeOverrides::default()
        })?;
        let data_root = data_root_override.unwrap_or(runtime_paths.data_root);

        Ok(Self {
            data_root,
            bootstrap_blob: runtime_paths.bootstrap_blob,
            credential_file: runtime_paths.credential_file,
            secret_endpoint: runtime_paths.secret_endpoint,
        })
    }
}

/// Bootstraps the credential chain, then polls every talent's recent uploads
/// and folds them into the approved-video cache.
#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("routine_update")?;

    let RoutineArgs {
        data_root,
        bootstrap_blob,
        credential_file,
        secret_endpoint,
    } = RoutineArgs::parse()?;

    let relay_db = data_root.join(RELAY_DB_FILE);
    let store = RelayStore::open(&relay_db)
        .await
        .context("initializing relay store")?;
    let reader = RelayReader::new(&relay_db)
        .await
        .context("initializing relay reader")?;

    let transport: Arc<dyn SecretTransport> = Arc::new(HttpSecretTransport::new(&secret_endpoint));
    let resolver = SecretResolver::new(reader.clone(), transport);
    resolver
        .bootstrap(&bootstrap_blob, &credential_file)
        .await
        .context("bootstrapping credentials")?;
    if let Some(credential) = resolver.credential() {
        println!("Operating credential: {}", credential);
    }

    let youtube = YoutubeClient::new(resolver.api_key());

    println!("Relay database: {}", relay_db.display());

    let talents = reader.list_talents().await.context("listing talents")?;
    if talents.is_empty() {
        println!("No approved talents registered in {}.", relay_db.display());
        return Ok(());
    }

    println!("Found {} talent(s) to refresh.", talents.len());
    println!("Channels queued for refresh:");
    for talent in &talents {
        if talent.display_name.is_empty() {
            println!("  - {}", talent.channel_id);
        } else {
            println!("  - {} ({})", talent.display_name, talent.channel_id);
        }
    }

    for (index, talent) in talents.iter().enumerate() {
        let current = index + 1;
        println!();
        println!(
            "[{}/{}] Refreshing channel: {}",
            current,
            talents.len(),
            talent.channel_id
        );

        match youtube.recent_videos(&talent.channel_id) {
            Ok(videos) => {
                let (fresh, total) = cache_remote_videos(&store, &reader, videos).await?;
                println!(
                    "  Cached {} new video(s) out of {} for {}",
                    fresh, total, talent.channel_id
                );
            }
            Err(err) => {
                eprintln!(
                    "  Warning: failed to poll {}: {}",
                    talent.channel_id, err
                );
            }
        }
    }

    println!();
    println!("All talent updates complete.");

    Ok(())
}

/// Upserts every polled video and reports how many were new to the cache.
async fn cache_remote_videos(
    store: &RelayStore,
    reader: &RelayReader,
    videos: Vec<RemoteVideo>,
) -> Result<(usize, usize)> {
    let total = videos.len();
    let mut fresh = 0;

    for video in videos {
        let existing = reader.get_video(&video.video_id).await?;
        if existing.is_none() {
            fresh += 1;
        }
        store.upsert_video(&video.into_cached()).await?;
    }

    Ok((fresh, total))
}
