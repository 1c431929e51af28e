//! HTTP client for a running controller's API.

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(server: &str) -> Self {
        Self {
            base_url: normalize_server(server),
            client: reqwest::Client::new(),
        }
    }

    pub async fn scopes(&self) -> Result<Value> {
        self.get("/api/scopes").await
    }

    pub async fn scope(&self, name: &str) -> Result<Value> {
        self.get(&format!("/api/scopes/{name}")).await
    }

    pub async fn sync(&self, name: &str) -> Result<Value> {
        self.post(&format!("/api/scopes/{name}/sync")).await
    }

    pub async fn approve(&self, name: &str) -> Result<Value> {
        self.post(&format!("/api/scopes/{name}/approve")).await
    }

    pub async fn cancel(&self, name: &str) -> Result<Value> {
        self.post(&format!("/api/scopes/{name}/cancel")).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        parse_response(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        parse_response(response).await
    }
}

fn normalize_server(server: &str) -> String {
    server.trim_end_matches('/').to_string()
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.context("Failed to read API response")?;

    if !status.is_success() {
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|problem| problem["detail"].as_str().map(str::to_string))
            .unwrap_or(body);
        bail!("API error {status}: {detail}");
    }

    serde_json::from_str(&body).context("Invalid API response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slashes_are_trimmed() {
        assert_eq!(normalize_server("http://localhost:7878//"), "http://localhost:7878");
        assert_eq!(ApiClient::new("http://h:1/").base_url, "http://h:1");
    }
}
