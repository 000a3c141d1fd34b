use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::assemble::assemble;
use crate::extract::{self, ExtractedArticle};
use crate::fetch::{fetch_pages, PageFetcher, RawPage};
use crate::images::{resolve_images, ImageOptions, ResolvedArticle, RunContext};
use crate::package::{write_epub, GENERATOR};
use crate::persist::{
    derive_key, dominant_domain, persist, sync_artifact, PersistOptions, PersistedArtifact,
    Sidecar, SyncBackend,
};

const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Book title; derived from the dominant source domain when absent.
    pub title: Option<String>,
    /// Book author metadata; derived from article bylines when absent.
    pub author: Option<String>,
    /// Explicit destination key; derived from the dominant domain when absent.
    pub output: Option<String>,
    pub persist: PersistOptions,
    pub images: ImageOptions,
    pub concurrency: usize,
    pub timeout: Duration,
    pub wait_for_sync: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            title: None,
            author: None,
            output: None,
            persist: PersistOptions {
                out_dir: PathBuf::from("books"),
                overwrite: false,
            },
            images: ImageOptions::default(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            wait_for_sync: false,
        }
    }
}

/// One input that did not make it into the book. `index` is the 1-based
/// position in the input list.
#[derive(Debug, Clone)]
pub struct DroppedArticle {
    pub index: usize,
    pub url: Url,
    pub reason: String,
}

#[derive(Debug)]
pub struct BuildReport {
    pub artifact: PersistedArtifact,
    pub dropped: Vec<DroppedArticle>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no articles survived the pipeline; nothing to write")]
    NoArticles,
}

/// Full pipeline: fetch the URLs, then hand the surviving pages to
/// [`build_from_pages`]'s phases. Per-page fetch failures become dropped
/// articles; the run fails only when nothing survives.
pub async fn build(
    urls: &[Url],
    options: &BuildOptions,
    sync: Option<&dyn SyncBackend>,
) -> Result<BuildReport> {
    let started = Instant::now();
    if urls.is_empty() {
        return Err(PipelineError::NoArticles.into());
    }

    let fetcher = PageFetcher::new(options.timeout).context("failed to build HTTP client")?;
    info!("Fetching {} pages", urls.len());
    let fetched = fetch_pages(&fetcher, urls, options.concurrency).await?;

    let mut pages = Vec::new();
    let mut dropped = Vec::new();
    for (index, result) in fetched.into_iter().enumerate() {
        match result {
            Ok(page) => pages.push((index, page)),
            Err(e) => {
                warn!("Dropping article {} ({}): {}", index + 1, urls[index], e);
                dropped.push(DroppedArticle {
                    index: index + 1,
                    url: urls[index].clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let report = run_phases(pages, dropped, fetcher.client(), options, sync).await?;
    info!("Build finished in {:.1}s", started.elapsed().as_secs_f64());
    Ok(report)
}

/// Pipeline entry for pre-fetched pages, in caller order.
pub async fn build_from_pages(
    pages: Vec<RawPage>,
    options: &BuildOptions,
    sync: Option<&dyn SyncBackend>,
) -> Result<BuildReport> {
    if pages.is_empty() {
        return Err(PipelineError::NoArticles.into());
    }
    let client = PageFetcher::new(options.timeout)
        .context("failed to build HTTP client")?
        .client();
    let indexed = pages.into_iter().enumerate().collect();
    run_phases(indexed, Vec::new(), client, options, sync).await
}

async fn run_phases(
    pages: Vec<(usize, RawPage)>,
    mut dropped: Vec<DroppedArticle>,
    client: reqwest::Client,
    options: &BuildOptions,
    sync: Option<&dyn SyncBackend>,
) -> Result<BuildReport> {
    // Extract phase: CPU-bound, so it runs on the rayon pool. The parsed
    // DOM is not Send and never leaves its closure; only the owned article
    // tree crosses back.
    info!("Extracting {} pages", pages.len());
    let extracted: Vec<(usize, ExtractedArticle)> = pages
        .par_iter()
        .map(|(index, page)| (*index, extract::extract(&page.html, &page.final_url)))
        .collect();

    for (_, article) in &extracted {
        if article.method.is_degraded() {
            warn!(
                "Extraction degraded to {} for {}",
                article.method.as_str(),
                article.source_url
            );
        }
    }

    // Image phase: per-article tasks over one shared run context, so a
    // URL referenced by several articles is fetched once.
    info!("Resolving images for {} articles", extracted.len());
    let ctx = Arc::new(RunContext::new(
        client,
        options.images.clone(),
        options.concurrency.max(1),
    ));
    let pb = ProgressBar::new(extracted.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let mut tasks = Vec::new();
    for (index, article) in extracted {
        let ctx = Arc::clone(&ctx);
        let url = article.source_url.clone();
        tasks.push((
            index,
            url,
            tokio::spawn(async move { resolve_images(article, ctx).await }),
        ));
    }
    let mut resolved: Vec<(usize, ResolvedArticle)> = Vec::new();
    for (index, url, handle) in tasks {
        match handle.await {
            Ok(article) => resolved.push((index, article)),
            Err(e) => {
                warn!("Image resolution task failed for {}: {}", url, e);
                dropped.push(DroppedArticle {
                    index: index + 1,
                    url,
                    reason: format!("image resolution failed: {}", e),
                });
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    // Output order comes from input indices, never completion order.
    resolved.sort_by_key(|(index, _)| *index);
    dropped.sort_by_key(|d| d.index);

    if resolved.is_empty() {
        return Err(PipelineError::NoArticles.into());
    }
    let articles: Vec<ResolvedArticle> = resolved.into_iter().map(|(_, a)| a).collect();
    let source_urls: Vec<Url> = articles
        .iter()
        .map(|a| a.article.source_url.clone())
        .collect();

    // Assemble and verify. A verify failure is an assembler defect and
    // aborts the run.
    let book_title = options.title.clone().unwrap_or_else(|| {
        match dominant_domain(&source_urls) {
            Some(domain) => format!("Articles from {}", domain),
            None => "Saved Articles".to_string(),
        }
    });
    let set = assemble(&articles, &book_title);
    set.verify()
        .context("assembled document set failed verification")?;
    for resource in &set.resources {
        debug!("Embedded {} from {}", resource.filename, resource.source_url);
    }

    let author = options.author.clone().or_else(|| joined_authors(&articles));
    let bytes = write_epub(&set, author.as_deref()).context("EPUB packaging failed")?;

    let key = derive_key(options.output.as_deref(), &source_urls);
    let sidecar = Sidecar {
        created_at: Utc::now(),
        source_domain: dominant_domain(&source_urls).unwrap_or_default(),
        article_count: articles.len(),
        size_bytes: bytes.len() as u64,
        title: book_title,
        generated_by: GENERATOR.to_string(),
    };
    let artifact = persist(&bytes, &key, &sidecar, &options.persist)?;
    info!(
        "Wrote {} ({} chapters, {} images, {} bytes)",
        artifact.local_path.display(),
        set.chapters.len(),
        set.resources.len(),
        artifact.size_bytes
    );

    if let Some(backend) = sync {
        sync_artifact(backend, &artifact.destination_key, &bytes, options.wait_for_sync).await;
    }

    Ok(BuildReport { artifact, dropped })
}

fn joined_authors(articles: &[ResolvedArticle]) -> Option<String> {
    let mut seen: Vec<&str> = Vec::new();
    for resolved in articles {
        if let Some(author) = resolved.article.author.as_deref() {
            if !seen.contains(&author) {
                seen.push(author);
            }
        }
    }
    if seen.is_empty() {
        None
    } else {
        Some(seen.join(", "))
    }
}

// ── Tests ──
