use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;
use tracing::info;

use super::{HarvestConfig, HarvestError};
use crate::config::HarvestSettings;
use crate::xml::EventStream;

/// Maximum number of body characters kept in an HTTP status error
const ERROR_BODY_CHARS: usize = 80;

/// HTTP client for OAI-PMH feeds
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: Client,
}

impl FeedClient {
    pub fn new(settings: &HarvestSettings) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self { client })
    }

    /// `ListRecords` request for the current job state
    ///
    /// A stored resumption token replaces every selective argument; extra
    /// params and headers are always sent.
    pub fn list_records(&self, config: &HarvestConfig) -> RequestBuilder {
        let mut query: Vec<(&str, &str)> = vec![("verb", "ListRecords")];

        match config.resumption_token.as_deref() {
            Some(token) => query.push(("resumptionToken", token)),
            None => {
                let selectors = [
                    ("from", &config.from),
                    ("until", &config.until),
                    ("set", &config.set),
                    ("metadataPrefix", &config.metadata_prefix),
                ];
                for (name, value) in selectors {
                    if let Some(value) = value.as_deref() {
                        query.push((name, value));
                    }
                }
            },
        }

        for (name, value) in &config.params {
            query.push((name.as_str(), value.as_str()));
        }

        let mut request = self
            .client
            .get(&config.url)
            .query(&query)
            .header(ACCEPT, "text/xml");

        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        request
    }

    /// Send the next page request
    pub async fn fetch_page(&self, config: &HarvestConfig) -> Result<Response, HarvestError> {
        info!(
            url = %config.display_url(),
            verb = "ListRecords",
            resuming = config.resumption_token.is_some(),
            "requesting page"
        );
        // reqwest errors print the request URL, query params included
        self.list_records(config)
            .send()
            .await
            .map_err(|e| HarvestError::Http(e.without_url()))
    }
}

/// Fail unless the response status is 200, keeping the start of the body
pub async fn check_status(response: Response) -> Result<Response, HarvestError> {
    let status = response.status();
    if status == reqwest::StatusCode::OK {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(ERROR_BODY_CHARS).collect();
    Err(HarvestError::Protocol(format!(
        "Returned HTTP status {}: {}",
        status.as_u16(),
        excerpt
    )))
}

/// Event stream reading the response body as it arrives
pub fn body_events(response: Response) -> EventStream<impl AsyncBufRead + Unpin + Send> {
    let body = Box::pin(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.without_url())),
    );
    EventStream::new(StreamReader::new(body))
}
