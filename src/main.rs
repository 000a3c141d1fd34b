mod assemble;
mod extract;
mod fetch;
mod images;
mod package;
mod persist;
mod pipeline;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context};
use clap::{Parser, Subcommand};
use url::Url;

use crate::fetch::RawPage;
use crate::images::ImageOptions;
use crate::persist::{DirSync, PersistOptions, SyncBackend};
use crate::pipeline::BuildOptions;

#[derive(Parser)]
#[command(name = "webtome", about = "Bundle web articles into a single offline EPUB")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch articles and build one EPUB in reading order
    Build {
        /// Article URLs, in reading order
        urls: Vec<String>,
        /// Read more URLs from a file (one per line, # comments skipped)
        #[arg(long, value_name = "FILE")]
        from_file: Option<PathBuf>,
        /// Build from saved HTML files instead of fetching URLs
        #[arg(long, value_name = "FILE")]
        html: Vec<PathBuf>,
        /// Book title (default: derived from the dominant source domain)
        #[arg(long)]
        title: Option<String>,
        /// Book author metadata (default: derived from article bylines)
        #[arg(long)]
        author: Option<String>,
        /// Destination name without extension (default: dominant source domain)
        #[arg(short, long)]
        output: Option<String>,
        /// Directory for the book and its sidecar
        #[arg(long, default_value = "books")]
        out_dir: PathBuf,
        /// Keep image references remote instead of embedding them
        #[arg(long)]
        no_images: bool,
        /// Per-image size cap in bytes
        #[arg(long, default_value_t = 5 * 1024 * 1024)]
        max_image_bytes: u64,
        /// Replace an existing book with the same name
        #[arg(long)]
        overwrite: bool,
        /// Parallel fetches (pages and images)
        #[arg(short = 'j', long, default_value_t = 5)]
        concurrency: usize,
        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Also copy the finished book into this directory
        #[arg(long, value_name = "DIR")]
        sync_dir: Option<PathBuf>,
        /// Poll the sync directory until the copy is visible
        #[arg(long)]
        wait_for_sync: bool,
    },
    /// Fetch one page and show what would be extracted
    Probe {
        url: String,
    },
    /// Print the sidecar of an existing book
    Inspect {
        /// Destination name (key) of the book
        key: String,
        /// Directory holding the book
        #[arg(long, default_value = "books")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build {
            urls,
            from_file,
            html,
            title,
            author,
            output,
            out_dir,
            no_images,
            max_image_bytes,
            overwrite,
            concurrency,
            timeout_secs,
            sync_dir,
            wait_for_sync,
        } => {
            let options = BuildOptions {
                title,
                author,
                output,
                persist: PersistOptions { out_dir, overwrite },
                images: ImageOptions {
                    download: !no_images,
                    max_bytes: max_image_bytes,
                },
                concurrency,
                timeout: Duration::from_secs(timeout_secs),
                wait_for_sync,
            };
            let backend = sync_dir.map(DirSync::new);
            let sync = backend.as_ref().map(|b| b as &dyn SyncBackend);

            let report = if !html.is_empty() {
                ensure!(
                    urls.is_empty() && from_file.is_none(),
                    "pass URLs or --html files, not both"
                );
                let pages = load_local_pages(&html)?;
                println!("Building a book from {} saved pages...", pages.len());
                pipeline::build_from_pages(pages, &options, sync).await?
            } else {
                let urls = collect_urls(&urls, from_file.as_deref())?;
                if urls.is_empty() {
                    println!("No URLs given. Pass them as arguments or via --from-file.");
                    return Ok(());
                }
                println!("Building a book from {} articles...", urls.len());
                pipeline::build(&urls, &options, sync).await?
            };

            println!("\nWrote {}", report.artifact.local_path.display());
            println!("  key      {}", report.artifact.destination_key);
            println!("  articles {}", report.artifact.article_count);
            println!("  size     {} bytes", report.artifact.size_bytes);
            println!("  sidecar  {}", report.artifact.sidecar_path.display());
            println!(
                "  created  {}",
                report.artifact.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if !report.dropped.is_empty() {
                println!("\n--- Dropped ---");
                for d in &report.dropped {
                    println!("  {}. {}: {}", d.index, d.url, truncate(&d.reason, 80));
                }
            }
            Ok(())
        }
        Commands::Probe { url } => {
            let url = Url::parse(&url).context("invalid URL")?;
            let fetcher = fetch::PageFetcher::new(Duration::from_secs(30))?;
            let page = fetcher.fetch(&url).await?;
            let article = extract::extract(&page.html, &page.final_url);

            if page.final_url != page.url {
                println!("URL:     {} (redirected from {})", page.final_url, page.url);
            } else {
                println!("URL:     {}", page.final_url);
            }
            println!("Fetched: {}", page.fetched_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Title:   {}", article.title);
            println!("Author:  {}", article.author.as_deref().unwrap_or("-"));
            println!("Date:    {}", article.published);
            println!("Method:  {}", article.method.as_str());
            println!("Text:    {} chars", article.text_chars());
            println!("Images:  {}", article.image_count());
            Ok(())
        }
        Commands::Inspect { key, out_dir } => {
            let path = out_dir.join(format!("{}.json", key));
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("no sidecar at {}", path.display()))?;
            let sidecar: persist::Sidecar = serde_json::from_str(&raw)?;

            println!("Title:     {}", sidecar.title);
            println!("Domain:    {}", sidecar.source_domain);
            println!("Articles:  {}", sidecar.article_count);
            println!("Size:      {} bytes", sidecar.size_bytes);
            println!("Created:   {}", sidecar.created_at);
            println!("Generator: {}", sidecar.generated_by);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Positional URLs first, then the file's entries, preserving line order.
fn collect_urls(args: &[String], from_file: Option<&Path>) -> anyhow::Result<Vec<Url>> {
    let mut raw: Vec<String> = args.to_vec();
    if let Some(path) = from_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            raw.push(line.to_string());
        }
    }

    let mut urls = Vec::with_capacity(raw.len());
    for spec in &raw {
        urls.push(Url::parse(spec).with_context(|| format!("invalid URL: {}", spec))?);
    }
    Ok(urls)
}

/// Saved pages become articles with `file://` URLs; their relative image
/// references stay local and are never fetched.
fn load_local_pages(paths: &[PathBuf]) -> anyhow::Result<Vec<RawPage>> {
    let mut pages = Vec::with_capacity(paths.len());
    for path in paths {
        let html = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let abs = std::fs::canonicalize(path)
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        let url = Url::from_file_path(&abs)
            .map_err(|_| anyhow!("cannot form a file URL for {}", abs.display()))?;
        pages.push(RawPage {
            url: url.clone(),
            final_url: url,
            html,
            fetched_at: chrono::Utc::now(),
        });
    }
    Ok(pages)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn url_file_skips_comments_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# weekend queue").unwrap();
        writeln!(file, "https://news.example.com/a").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  https://news.example.com/b  ").unwrap();

        let args = vec!["https://blog.other.net/x".to_string()];
        let urls = collect_urls(&args, Some(file.path())).unwrap();
        let specs: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            specs,
            vec![
                "https://blog.other.net/x",
                "https://news.example.com/a",
                "https://news.example.com/b",
            ]
        );
    }

    #[test]
    fn invalid_url_is_reported_with_the_offending_spec() {
        let err = collect_urls(&["not a url".to_string()], None).unwrap_err();
        assert!(err.to_string().contains("not a url"));
    }

    #[test]
    fn local_pages_get_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.html");
        std::fs::write(&path, "<html><body><p>saved</p></body></html>").unwrap();

        let pages = load_local_pages(&[path]).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].url.scheme(), "file");
        assert_eq!(pages[0].url, pages[0].final_url);
        assert!(pages[0].html.contains("saved"));
    }
}
