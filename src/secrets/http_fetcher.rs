//! Production [`SecretFetcher`] that pulls the secrets document from a
//! configured upstream endpoint, the same `reqwest::Client` + JSON body
//! shape `llm/lmstudio.rs` uses for its provider calls.

use reqwest::Client;
use serde_json::Value;

use super::SecretFetcher;

#[derive(Clone)]
pub struct HttpSecretFetcher {
    url: String,
    client: Client,
}

impl HttpSecretFetcher {
    pub fn new(url: String) -> Self {
        HttpSecretFetcher {
            url,
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl SecretFetcher for HttpSecretFetcher {
    async fn fetch_secrets(&self) -> Result<Value, String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("secret source returned {}", response.status()));
        }

        response.json::<Value>().await.map_err(|e| e.to_string())
    }
}
