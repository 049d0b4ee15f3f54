//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::Url;

use crate::{Fetcher, NetError, Request, Response, ResponseType};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Site origin. Responses from elsewhere are typed `Cors`.
    pub origin: Option<Url>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("sitecache/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            origin: None,
        }
    }
}

impl LoaderConfig {
    /// Config for a given site origin.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin: Some(origin),
            ..Default::default()
        }
    }
}

/// Resource loader for fetching URLs.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?config.origin.as_ref().map(Url::as_str), "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// Type a response by comparing its final URL with the site origin.
    fn response_type_for(&self, final_url: &Url) -> ResponseType {
        match &self.config.origin {
            Some(origin) if origin.origin() != final_url.origin() => ResponseType::Cors,
            _ => ResponseType::Basic,
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(body) = &request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.config.default_timeout)
            } else if e.is_connect() {
                NetError::Offline(e.to_string())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        let response_type = self.response_type_for(&url);
        let mut out = Response::new(url, status, body).with_type(response_type);
        out.headers = headers;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("sitecache/"));
        assert!(config.origin.is_none());
    }

    #[tokio::test]
    async fn test_same_origin_is_basic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assets/css/styles.css"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/css")
                    .set_body_string("body{}"),
            )
            .mount(&server)
            .await;

        let origin = Url::parse(&server.uri()).unwrap();
        let loader = ResourceLoader::new(LoaderConfig::for_origin(origin.clone())).unwrap();
        let request = Request::get(origin.join("/assets/css/styles.css").unwrap());

        let response = loader.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.response_type, ResponseType::Basic);
        assert!(response.is_cacheable());
        assert_eq!(response.text().unwrap(), "body{}");
        assert_eq!(response.content_type(), Some(mime::TEXT_CSS));
    }

    #[tokio::test]
    async fn test_cross_origin_is_cors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/webfonts/fa-solid-900.woff2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 1, 2]))
            .mount(&server)
            .await;

        let site = Url::parse("https://mpdigital.com/").unwrap();
        let loader = ResourceLoader::new(LoaderConfig::for_origin(site)).unwrap();
        let cdn = Url::parse(&server.uri()).unwrap();
        let request = Request::get(cdn.join("/webfonts/fa-solid-900.woff2").unwrap());

        let response = loader.fetch(&request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Cors);
        assert!(!response.is_cacheable());
    }

    #[tokio::test]
    async fn test_error_status_is_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let origin = Url::parse(&server.uri()).unwrap();
        let loader = ResourceLoader::new(LoaderConfig::for_origin(origin.clone())).unwrap();
        let response = loader
            .fetch(&Request::get(origin.join("/missing.jpg").unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_error() {
        let loader = ResourceLoader::new(LoaderConfig {
            default_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        // port 9 (discard) is closed on test machines
        let request = Request::get(Url::parse("http://127.0.0.1:9/").unwrap());
        assert!(loader.fetch(&request).await.is_err());
    }
}
