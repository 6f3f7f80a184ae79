// Streamshelf - Offline Video Downloads for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Desktop tool for exercising the download core without the app

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use streamshelf_core::download::{CompletionPhase, DownloadEvent, DownloadTransport};
use streamshelf_core::storage::{AssetStore, Database};
use streamshelf_core::stream::{ensure_streaming_headers, HeaderMap};
use streamshelf_core::{CoreConfig, DownloadManager, DownloadRequest, EventBus, HttpTransport};

#[derive(Parser)]
#[command(name = "streamshelf-cli")]
#[command(about = "Streamshelf CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Data directory (database, downloads, temp files)
    #[arg(short, long, default_value = "./streamshelf-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the quality variants of an HLS master manifest
    Qualities {
        url: String,
        /// Extra header, `Name: value`
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// Show the headers a request to URL would carry
    Headers {
        url: String,
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// Download one or more URLs and wait until the queue is idle
    Download {
        urls: Vec<String>,
        /// Title for the downloaded asset (single URL only)
        #[arg(short, long)]
        title: Option<String>,
        /// Quality label for HLS streams, e.g. "720p"
        #[arg(short, long)]
        quality: Option<String>,
        /// Subtitle URL (single URL only)
        #[arg(short, long)]
        subtitle: Option<String>,
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Maximum concurrent downloads
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
    },
    /// List downloaded assets
    List,
    /// Delete a downloaded asset by id
    Delete { id: String },
    /// Re-check stored file locations
    Validate,
}

fn parse_headers(values: &[String]) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for value in values {
        let Some((name, content)) = value.split_once(':') else {
            bail!("header must look like 'Name: value', got '{}'", value);
        };
        headers.insert(name.trim().to_string(), content.trim().to_string());
    }
    Ok(headers)
}

async fn open_store(config: &CoreConfig, events: EventBus) -> anyhow::Result<Arc<AssetStore>> {
    let db = Database::new(config.database_path())
        .await
        .context("opening database")?;
    let store = AssetStore::open(db, config.downloads_dir(), events)
        .await
        .context("opening asset store")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CoreConfig::load_or_init(&cli.data_dir)?;
    streamshelf_core::logging::init_logging(&config.log_filter);

    match cli.command {
        Commands::Qualities { url, headers } => {
            let transport = HttpTransport::new(&config.download)?;
            let variants = transport.fetch_qualities(&url, &parse_headers(&headers)?).await;
            if variants.is_empty() {
                println!("No variants found");
            }
            for variant in variants {
                println!("{:<14} {}", variant.label, variant.url);
            }
        }
        Commands::Headers { url, headers } => {
            let combined = ensure_streaming_headers(&parse_headers(&headers)?, &url);
            let mut names: Vec<_> = combined.iter().collect();
            names.sort();
            for (name, value) in names {
                println!("{}: {}", name, value);
            }
        }
        Commands::Download {
            urls,
            title,
            quality,
            subtitle,
            headers,
            jobs,
        } => {
            if urls.is_empty() {
                bail!("no URLs given");
            }
            if urls.len() > 1 && (title.is_some() || subtitle.is_some()) {
                bail!("--title and --subtitle apply to a single URL");
            }
            if let Some(jobs) = jobs {
                config.download.max_concurrent_downloads = jobs;
            }
            config.validate()?;

            let headers = parse_headers(&headers)?;
            let events = EventBus::new();
            let mut rx = events.subscribe_channel();
            let store = open_store(&config, events).await?;
            let transport: Arc<dyn DownloadTransport> = Arc::new(HttpTransport::new(&config.download)?);
            let manager = DownloadManager::new(config.download.clone(), config.temp_dir(), store, transport).await?;

            for interrupted in manager.recover_interrupted().await {
                println!("Interrupted last run: {} ({})", interrupted.title, interrupted.url);
            }

            for (index, url) in urls.iter().enumerate() {
                let name = title.clone().unwrap_or_else(|| format!("Video {}", index + 1));
                let mut request = DownloadRequest::movie(url.clone(), name).with_headers(headers.clone());
                if let Some(label) = &quality {
                    request = request.with_preferred_quality(label.clone());
                }
                if let Some(subtitle_url) = &subtitle {
                    request = request.with_subtitle(subtitle_url.clone());
                }
                let id = manager.enqueue(request).await;
                println!("Queued {} as {}", url, id);
            }

            let mut failures = 0usize;
            let mut pending_subtitles = usize::from(subtitle.is_some());
            while let Some(event) = rx.recv().await {
                match event {
                    DownloadEvent::Progress(p) => {
                        println!("{} {:>5.1}%", p.id, p.progress * 100.0);
                    }
                    DownloadEvent::Completed { payload, phase } => {
                        println!("{} completed ({:?})", payload.id, phase);
                        if phase == CompletionPhase::FullyReady && pending_subtitles > 0 {
                            pending_subtitles -= 1;
                        }
                    }
                    DownloadEvent::Failed { title, message, .. } => {
                        eprintln!("{} failed: {}", title, message);
                        failures += 1;
                        pending_subtitles = pending_subtitles.saturating_sub(1);
                    }
                    _ => {}
                }
                if manager.is_idle().await && pending_subtitles == 0 {
                    break;
                }
            }

            if failures > 0 {
                bail!("{} download(s) failed", failures);
            }
        }
        Commands::List => {
            let store = open_store(&config, EventBus::new()).await?;
            let assets = store.assets().await;
            if assets.is_empty() {
                println!("No downloads");
            }
            for asset in assets {
                println!(
                    "{}  {}  {}  {}",
                    asset.id,
                    asset.download_date.format("%Y-%m-%d %H:%M"),
                    asset.name,
                    asset.local_url.display()
                );
            }
            println!("Total size: {} bytes", store.storage_size().await?);
        }
        Commands::Delete { id } => {
            let store = open_store(&config, EventBus::new()).await?;
            match store.remove(&id).await? {
                Some(asset) => println!("Deleted {}", asset.name),
                None => bail!("no asset with id {}", id),
            }
        }
        Commands::Validate => {
            let store = open_store(&config, EventBus::new()).await?;
            let report = store.validate_and_update_asset_locations().await?;
            println!(
                "relocated {}, removed {}, subtitles relocated {}, subtitles cleared {}",
                report.relocated, report.removed, report.subtitles_relocated, report.subtitles_cleared
            );
        }
    }

    Ok(())
}
