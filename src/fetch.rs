use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;
const MAX_REDIRECTS: usize = 10;
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// One fetched page, HTML plus the URL the server actually served after
/// redirects. Image references resolve against `final_url`, never the
/// requested one.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub url: Url,
    pub final_url: Url,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// The underlying client, shared with the image phase so both reuse
    /// one connection pool and one timeout policy.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Fetch one page with retry on rate limits and server errors.
    pub async fn fetch(&self, url: &Url) -> Result<RawPage> {
        fetch_with_retry(&self.client, url).await
    }
}

/// Fetch pages concurrently, streaming results back as they arrive. The
/// returned vec is in input order whatever order tasks completed in; a
/// per-page failure occupies its slot instead of aborting the batch.
pub async fn fetch_pages(
    fetcher: &PageFetcher,
    urls: &[Url],
    concurrency: usize,
) -> Result<Vec<Result<RawPage>>> {
    let concurrency = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let total = urls.len();

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Channel: workers send results, the coordinator slots them by index.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(usize, Result<RawPage>)>(concurrency * 2);

    for (index, url) in urls.iter().cloned().enumerate() {
        let client = fetcher.client.clone();
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = sem.acquire().await.unwrap();
            let result = fetch_with_retry(&client, &url).await;
            let _ = tx.send((index, result)).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish.
    drop(tx);

    let mut slots: Vec<Option<Result<RawPage>>> = (0..total).map(|_| None).collect();
    let mut ok = 0usize;
    let mut errors = 0usize;

    while let Some((index, result)) = rx.recv().await {
        if result.is_ok() {
            ok += 1;
        } else {
            errors += 1;
        }
        slots[index] = Some(result);
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!("Fetched {} pages ({} ok, {} errors)", total, ok, errors);

    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| Err(anyhow!("fetch task for input {} vanished", index + 1)))
        })
        .collect())
}

async fn fetch_with_retry(client: &Client, url: &Url) -> Result<RawPage> {
    let mut attempt = 0u32;
    loop {
        let result = fetch_one(client, url).await;
        match &result {
            Err(e) if attempt < MAX_RETRIES && is_retryable(e) => {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    "Retryable failure on {} (attempt {}/{}), backing off {:.1}s: {}",
                    url,
                    attempt + 1,
                    MAX_RETRIES,
                    backoff.as_secs_f64(),
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            _ => return result,
        }
    }
}

fn is_retryable(e: &anyhow::Error) -> bool {
    let msg = e.to_string();
    msg.contains("HTTP 429")
        || msg.contains("HTTP 500")
        || msg.contains("HTTP 502")
        || msg.contains("HTTP 503")
        || msg.contains("HTTP 504")
}

async fn fetch_one(client: &Client, url: &Url) -> Result<RawPage> {
    let resp = client.get(url.clone()).send().await?;
    let status = resp.status();
    let final_url = resp.url().clone();
    if !status.is_success() {
        anyhow::bail!("HTTP {} for {}", status, url);
    }
    let html = resp.text().await?;
    Ok(RawPage {
        url: url.clone(),
        final_url,
        html,
        fetched_at: Utc::now(),
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn fetcher() -> PageFetcher {
        PageFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn captures_final_url_after_redirect() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/a");
                then.status(302).header("location", server.url("/b"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/b");
                then.status(200).body("<html><body>landed</body></html>");
            })
            .await;

        let page = fetcher()
            .fetch(&Url::parse(&server.url("/a")).unwrap())
            .await
            .unwrap();
        assert!(page.final_url.path().ends_with("/b"));
        assert!(page.html.contains("landed"));
        assert!(page.url.path().ends_with("/a"));
    }

    #[test]
    fn retry_classification_covers_rate_limits_and_server_errors() {
        for retryable in ["HTTP 429 Too Many Requests for x", "HTTP 503 Service Unavailable for x"] {
            assert!(is_retryable(&anyhow!("{}", retryable)));
        }
        for fatal in ["HTTP 404 Not Found for x", "connection refused"] {
            assert!(!is_retryable(&anyhow!("{}", fatal)));
        }
    }

    #[tokio::test]
    async fn server_error_carries_status_in_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/flaky");
                then.status(503);
            })
            .await;

        let client = fetcher().client();
        let err = fetch_one(&client, &Url::parse(&server.url("/flaky")).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn plain_404_fails_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/gone");
                then.status(404);
            })
            .await;

        let err = fetcher()
            .fetch(&Url::parse(&server.url("/gone")).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn batch_results_keep_input_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/one");
                then.status(200)
                    .body("<p>first</p>")
                    .delay(Duration::from_millis(80));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/two");
                then.status(200).body("<p>second</p>");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;

        let urls = vec![
            Url::parse(&server.url("/one")).unwrap(),
            Url::parse(&server.url("/missing")).unwrap(),
            Url::parse(&server.url("/two")).unwrap(),
        ];
        let results = fetch_pages(&fetcher(), &urls, 3).await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(results[0].as_ref().unwrap().html.contains("first"));
        assert!(results[1].is_err());
        assert!(results[2].as_ref().unwrap().html.contains("second"));
    }
}
