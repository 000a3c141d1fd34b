use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{OnceCell, RwLock, Semaphore};
use tracing::warn;
use url::Url;

use crate::extract::{ExtractedArticle, Node};

const DEFAULT_MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;
const SYNTHETIC_ALT: &str = "Article image";

// Dynamic-loading attributes with no meaning inside a static book.
const SCRUB_ATTRS: &[&str] = &["onload", "onerror", "loading", "decoding"];

#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Fetch and embed images. When false, references are only rewritten
    /// to absolute URLs.
    pub download: bool,
    /// Hard cap per image, checked against Content-Length and again after
    /// the body arrives.
    pub max_bytes: u64,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            download: true,
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

/// One downloaded image, shared by every chapter that references it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedResource {
    pub seq: usize,
    pub filename: String,
    pub mime: String,
    pub source_url: String,
    pub bytes: Vec<u8>,
}

/// An article whose image references are final: embedded ones point at
/// book-local filenames, the rest at absolute URLs.
#[derive(Debug, Clone)]
pub struct ResolvedArticle {
    pub article: ExtractedArticle,
    pub resources: Vec<Arc<EmbeddedResource>>,
}

#[derive(Debug, Clone)]
enum ImageOutcome {
    Embedded(Arc<EmbeddedResource>),
    Remote,
}

/// Shared state for one pipeline run: the HTTP client, the image fetch
/// limit, and the URL → outcome table that makes every image fetch happen
/// at most once per run. Never a process global; drop it and the cache is
/// gone with it.
pub struct RunContext {
    client: Client,
    options: ImageOptions,
    semaphore: Semaphore,
    seen: RwLock<HashMap<String, Arc<OnceCell<ImageOutcome>>>>,
    next_seq: AtomicUsize,
}

impl RunContext {
    pub fn new(client: Client, options: ImageOptions, max_parallel: usize) -> Self {
        Self {
            client,
            options,
            semaphore: Semaphore::new(max_parallel.max(1)),
            seen: RwLock::new(HashMap::new()),
            next_seq: AtomicUsize::new(0),
        }
    }
}

/// Resolve every image reference in `article` against its source URL, fetch
/// distinct embeddable ones (bounded, once per run), and rewrite the markup
/// in original DOM order. Image failures degrade to remote links; this
/// function never fails.
pub async fn resolve_images(mut article: ExtractedArticle, ctx: Arc<RunContext>) -> ResolvedArticle {
    let base = article.source_url.clone();

    // Pass 1: resolved reference per img element, DOM order.
    let mut refs: Vec<Option<String>> = Vec::new();
    for node in &article.content {
        node.walk_images(&mut |img| {
            refs.push(img.attr("src").and_then(|src| resolve_src(src, &base)));
        });
    }

    // Pass 2: fetch the fetchable ones in parallel. The per-run table
    // collapses duplicate URLs onto one in-flight download.
    let mut outcomes: Vec<Option<ImageOutcome>> = vec![None; refs.len()];
    if ctx.options.download {
        let mut tasks = Vec::new();
        for (i, reference) in refs.iter().enumerate() {
            if let Some(url) = reference {
                if is_fetchable(url) {
                    let ctx = Arc::clone(&ctx);
                    let url = url.clone();
                    tasks.push((i, tokio::spawn(async move { outcome_for(&ctx, &url).await })));
                }
            }
        }
        for (i, handle) in tasks {
            outcomes[i] = Some(handle.await.unwrap_or(ImageOutcome::Remote));
        }
    }

    // Pass 3: rewrite in the same DOM order the references were collected.
    let mut resources: Vec<Arc<EmbeddedResource>> = Vec::new();
    let mut cursor = 0usize;
    for node in &mut article.content {
        node.walk_images_mut(&mut |img| {
            let resolved = refs.get(cursor).cloned().flatten();
            let outcome = outcomes.get(cursor).cloned().flatten();
            cursor += 1;
            rewrite_img(img, resolved, outcome, &base, &mut resources);
        });
    }

    ResolvedArticle { article, resources }
}

fn rewrite_img(
    img: &mut Node,
    resolved: Option<String>,
    outcome: Option<ImageOutcome>,
    base: &Url,
    resources: &mut Vec<Arc<EmbeddedResource>>,
) {
    match outcome {
        Some(ImageOutcome::Embedded(res)) => {
            img.set_attr("src", res.filename.clone());
            // One concrete file per image in a static book.
            img.remove_attr("srcset");
            if !resources.iter().any(|r| r.seq == res.seq) {
                resources.push(res);
            }
        }
        _ => match resolved {
            Some(abs) => {
                img.set_attr("src", abs);
                if let Some(srcset) = img.attr("srcset").map(str::to_string) {
                    let srcset = resolve_srcset(&srcset, base);
                    if srcset.is_empty() {
                        img.remove_attr("srcset");
                    } else {
                        img.set_attr("srcset", srcset);
                    }
                }
            }
            None => {
                img.remove_attr("src");
                img.remove_attr("srcset");
            }
        },
    }

    if img.attr("alt").map_or(true, |alt| alt.trim().is_empty()) {
        img.set_attr("alt", SYNTHETIC_ALT);
    }
    for attr in SCRUB_ATTRS {
        img.remove_attr(attr);
    }
}

// ── Reference resolution ──

/// Absolute form of one image reference, or `None` when it cannot be made
/// absolute. `data:` URLs pass through untouched.
fn resolve_src(raw: &str, base: &Url) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("data:") {
        return Some(raw.to_string());
    }
    base.join(raw).ok().map(String::from)
}

fn resolve_srcset(srcset: &str, base: &Url) -> String {
    let mut parts = Vec::new();
    for entry in srcset.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut fields = entry.split_whitespace();
        let Some(reference) = fields.next() else {
            continue;
        };
        let descriptors: Vec<&str> = fields.collect();
        if let Some(abs) = resolve_src(reference, base) {
            if descriptors.is_empty() {
                parts.push(abs);
            } else {
                parts.push(format!("{} {}", abs, descriptors.join(" ")));
            }
        }
    }
    parts.join(", ")
}

fn is_fetchable(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

// ── Fetching ──

async fn outcome_for(ctx: &RunContext, url: &str) -> ImageOutcome {
    let cell = {
        let seen = ctx.seen.read().await;
        seen.get(url).cloned()
    };
    let cell = match cell {
        Some(cell) => cell,
        None => {
            let mut seen = ctx.seen.write().await;
            seen.entry(url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        }
    };
    cell.get_or_init(|| fetch_image(ctx, url)).await.clone()
}

async fn fetch_image(ctx: &RunContext, url: &str) -> ImageOutcome {
    let _permit = ctx.semaphore.acquire().await.unwrap();

    let resp = match ctx.client.get(url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("Image fetch failed for {}: {}", url, e);
            return ImageOutcome::Remote;
        }
    };
    if !resp.status().is_success() {
        warn!("Image fetch returned {} for {}", resp.status(), url);
        return ImageOutcome::Remote;
    }
    if let Some(len) = resp.content_length() {
        if len > ctx.options.max_bytes {
            warn!("Skipping oversized image ({} bytes): {}", len, url);
            return ImageOutcome::Remote;
        }
    }

    let header_mime = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Image body read failed for {}: {}", url, e);
            return ImageOutcome::Remote;
        }
    };
    if bytes.len() as u64 > ctx.options.max_bytes {
        warn!("Skipping oversized image ({} bytes): {}", bytes.len(), url);
        return ImageOutcome::Remote;
    }

    let (mime, ext) = mime_and_ext(header_mime.as_deref(), url);
    let seq = ctx.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
    ImageOutcome::Embedded(Arc::new(EmbeddedResource {
        seq,
        filename: format!("images/img_{}.{}", seq, ext),
        mime,
        source_url: url.to_string(),
        bytes: bytes.to_vec(),
    }))
}

// ── MIME / extension mapping ──

fn mime_and_ext(header: Option<&str>, url: &str) -> (String, String) {
    let header_mime = header
        .map(|h| h.split(';').next().unwrap_or(h).trim().to_ascii_lowercase())
        .filter(|m| m.starts_with("image/"));
    let path_ext = Url::parse(url).ok().and_then(|u| {
        Path::new(u.path())
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
    });

    let mime = header_mime
        .or_else(|| {
            path_ext
                .as_deref()
                .and_then(mime_for_ext)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let ext = ext_for_mime(&mime)
        .map(str::to_string)
        .or(path_ext)
        .unwrap_or_else(|| "bin".to_string());
    (mime, ext)
}

fn mime_for_ext(ext: &str) -> Option<&'static str> {
    match ext {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        "avif" => Some("image/avif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

fn ext_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "image/avif" => Some("avif"),
        "image/bmp" => Some("bmp"),
        "image/tiff" => Some("tif"),
        _ => None,
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractionMethod;
    use chrono::NaiveDate;
    use httpmock::prelude::*;

    fn img_node(attrs: &[(&str, &str)]) -> Node {
        Node::Element {
            name: "img".to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children: Vec::new(),
        }
    }

    fn article_with(imgs: Vec<Node>, source: &str) -> ExtractedArticle {
        let mut children = vec![Node::text("Intro text.")];
        children.extend(imgs);
        ExtractedArticle {
            source_url: Url::parse(source).unwrap(),
            title: "T".to_string(),
            author: None,
            published: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            content: vec![Node::Element {
                name: "p".to_string(),
                attrs: Vec::new(),
                children,
            }],
            method: ExtractionMethod::Scored,
        }
    }

    fn img_srcs(resolved: &ResolvedArticle) -> Vec<Option<String>> {
        let mut srcs = Vec::new();
        for node in &resolved.article.content {
            node.walk_images(&mut |img| srcs.push(img.attr("src").map(str::to_string)));
        }
        srcs
    }

    fn no_download_ctx() -> Arc<RunContext> {
        Arc::new(RunContext::new(
            Client::new(),
            ImageOptions {
                download: false,
                ..ImageOptions::default()
            },
            4,
        ))
    }

    #[tokio::test]
    async fn rewrites_relative_absolute_and_data_refs() {
        let article = article_with(
            vec![
                img_node(&[("src", "pics/a.png")]),
                img_node(&[("src", "https://cdn.example.com/b.png"), ("alt", "b")]),
                img_node(&[("src", "data:image/png;base64,AAAA"), ("alt", "inline")]),
            ],
            "https://host.example.com/post/1",
        );
        let resolved = resolve_images(article, no_download_ctx()).await;
        assert_eq!(
            img_srcs(&resolved),
            vec![
                Some("https://host.example.com/post/pics/a.png".to_string()),
                Some("https://cdn.example.com/b.png".to_string()),
                Some("data:image/png;base64,AAAA".to_string()),
            ]
        );
        assert!(resolved.resources.is_empty());
    }

    #[tokio::test]
    async fn srcset_rewritten_absolute_when_not_embedded() {
        let article = article_with(
            vec![img_node(&[
                ("src", "a.png"),
                ("srcset", "a.png 1x, big/a2.png 2x"),
            ])],
            "https://host.example.com/dir/page",
        );
        let resolved = resolve_images(article, no_download_ctx()).await;
        let mut srcsets = Vec::new();
        for node in &resolved.article.content {
            node.walk_images(&mut |img| srcsets.push(img.attr("srcset").map(str::to_string)));
        }
        assert_eq!(
            srcsets,
            vec![Some(
                "https://host.example.com/dir/a.png 1x, https://host.example.com/dir/big/a2.png 2x"
                    .to_string()
            )]
        );
    }

    #[tokio::test]
    async fn unresolvable_srcset_is_dropped_not_emptied() {
        let article = article_with(
            vec![img_node(&[("src", "a.png"), ("srcset", "http://[bad 1x, ,")])],
            "https://host.example.com/dir/page",
        );
        let resolved = resolve_images(article, no_download_ctx()).await;
        let mut imgs = Vec::new();
        for node in &resolved.article.content {
            node.walk_images(&mut |img| imgs.push(img.clone()));
        }
        assert_eq!(
            imgs[0].attr("src"),
            Some("https://host.example.com/dir/a.png")
        );
        assert_eq!(imgs[0].attr("srcset"), None);
    }

    #[tokio::test]
    async fn alt_synthesized_and_dynamic_attrs_scrubbed() {
        let article = article_with(
            vec![img_node(&[("src", "a.png"), ("loading", "lazy")])],
            "https://host.example.com/p",
        );
        let resolved = resolve_images(article, no_download_ctx()).await;
        let mut imgs = Vec::new();
        for node in &resolved.article.content {
            node.walk_images(&mut |img| imgs.push(img.clone()));
        }
        assert_eq!(imgs[0].attr("alt"), Some(SYNTHETIC_ALT));
        assert_eq!(imgs[0].attr("loading"), None);
    }

    #[tokio::test]
    async fn downloads_each_distinct_url_once_per_run() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/img.png");
                then.status(200)
                    .header("content-type", "image/png")
                    .body(vec![1u8, 2, 3, 4]);
            })
            .await;

        let url = server.url("/img.png");
        let ctx = Arc::new(RunContext::new(Client::new(), ImageOptions::default(), 4));

        let first = article_with(
            vec![img_node(&[("src", &url)]), img_node(&[("src", &url)])],
            "https://host.example.com/one",
        );
        let second = article_with(
            vec![img_node(&[("src", &url)])],
            "https://host.example.com/two",
        );

        let first = resolve_images(first, Arc::clone(&ctx)).await;
        let second = resolve_images(second, Arc::clone(&ctx)).await;

        mock.assert_hits_async(1).await;
        assert_eq!(first.resources.len(), 1);
        assert_eq!(second.resources.len(), 1);
        assert_eq!(first.resources[0].filename, second.resources[0].filename);
        assert_eq!(first.resources[0].bytes, vec![1u8, 2, 3, 4]);
        assert_eq!(
            img_srcs(&first),
            vec![
                Some(first.resources[0].filename.clone()),
                Some(first.resources[0].filename.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_image_kept_as_remote_link() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/big.jpg");
                then.status(200)
                    .header("content-type", "image/jpeg")
                    .body(vec![0u8; 64]);
            })
            .await;

        let url = server.url("/big.jpg");
        let ctx = Arc::new(RunContext::new(
            Client::new(),
            ImageOptions {
                download: true,
                max_bytes: 16,
            },
            4,
        ));
        let article = article_with(
            vec![img_node(&[("src", &url)])],
            "https://host.example.com/p",
        );
        let resolved = resolve_images(article, ctx).await;
        assert!(resolved.resources.is_empty());
        assert_eq!(img_srcs(&resolved), vec![Some(url)]);
    }

    #[tokio::test]
    async fn failed_fetch_degrades_to_remote_link() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gone.png");
                then.status(404);
            })
            .await;

        let url = server.url("/gone.png");
        let ctx = Arc::new(RunContext::new(Client::new(), ImageOptions::default(), 4));
        let article = article_with(
            vec![img_node(&[("src", &url)])],
            "https://host.example.com/p",
        );
        let resolved = resolve_images(article, ctx).await;
        assert!(resolved.resources.is_empty());
        assert_eq!(img_srcs(&resolved), vec![Some(url)]);
    }

    #[test]
    fn mime_and_ext_mapping() {
        assert_eq!(
            mime_and_ext(Some("image/png; charset=binary"), "https://x.test/a"),
            ("image/png".to_string(), "png".to_string())
        );
        assert_eq!(
            mime_and_ext(None, "https://x.test/pics/photo.JPEG?w=200"),
            ("image/jpeg".to_string(), "jpg".to_string())
        );
        assert_eq!(
            mime_and_ext(None, "https://x.test/no-extension"),
            ("application/octet-stream".to_string(), "bin".to_string())
        );
        assert_eq!(
            mime_and_ext(Some("text/html"), "https://x.test/fake.png"),
            ("image/png".to_string(), "png".to_string())
        );
    }
}
