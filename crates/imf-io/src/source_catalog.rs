use async_trait::async_trait;
use imf_core::{CatalogSource, CatalogSpec, IndicatorCode, IndicatorDataset, RefreshError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// IMF DataMapper catalog over HTTP.
///
/// One request per call, bounded by the configured timeout. Any network
/// error, non-2xx status or undecodable body is a fetch error; nothing is retried.
pub struct HttpCatalog {
    http_client: Client,
    base_url: String,
}

/// Body of `GET {base}/indicators`
#[derive(Debug, Deserialize)]
struct IndicatorsResponse {
    #[serde(default)]
    indicators: BTreeMap<String, Option<IndicatorInfo>>,
}

#[derive(Debug, Deserialize)]
struct IndicatorInfo {
    #[serde(default)]
    dataset: Option<String>,
}

impl HttpCatalog {
    pub fn new(spec: &CatalogSpec) -> anyhow::Result<Self> {
        let http_client = Client::builder().timeout(spec.timeout()).build()?;
        Ok(Self {
            http_client,
            base_url: spec.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value, RefreshError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("Fetching {}", url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| RefreshError::fetch(&url, e))?;

        if !response.status().is_success() {
            return Err(RefreshError::fetch(
                &url,
                format!("API request failed with status: {}", response.status()),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| RefreshError::fetch(&url, e))
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn list_indicators(&self, dataset: &str) -> Result<Vec<IndicatorCode>, RefreshError> {
        let body = self.get_json("indicators").await?;
        let parsed: IndicatorsResponse = serde_json::from_value(body)
            .map_err(|e| RefreshError::fetch(format!("{}/indicators", self.base_url), e))?;

        let total = parsed.indicators.len();
        let codes: Vec<IndicatorCode> = parsed
            .indicators
            .into_iter()
            .filter(|(code, info)| {
                !code.is_empty()
                    && info
                        .as_ref()
                        .and_then(|i| i.dataset.as_deref())
                        .is_some_and(|d| d == dataset)
            })
            .map(|(code, _)| code)
            .collect();
        info!("Catalog lists {} indicators, {} in {}", total, codes.len(), dataset);
        Ok(codes)
    }

    async fn fetch_indicator(&self, code: &str) -> Result<IndicatorDataset, RefreshError> {
        let payload = self.get_json(code).await?;
        Ok(IndicatorDataset::new(code, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog_for(server: &mockito::ServerGuard) -> HttpCatalog {
        let spec = CatalogSpec {
            base_url: format!("{}/", server.url()),
            timeout_secs: 5,
            ..CatalogSpec::default()
        };
        HttpCatalog::new(&spec).unwrap()
    }

    #[tokio::test]
    async fn lists_only_codes_of_the_dataset() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({"indicators": {
            "NGDP_RPCH": {"label": "Real GDP growth", "dataset": "WEO"},
            "PCPIPCH": {"label": "Inflation", "dataset": "WEO"},
            "GGXWDG_NGDP": {"label": "Debt", "dataset": "FM"},
            "": {"dataset": "WEO"},
            "BROKEN": null
        }});
        let mock = server
            .mock("GET", "/indicators")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let codes = catalog_for(&server).list_indicators("WEO").await.unwrap();
        assert_eq!(codes, vec!["NGDP_RPCH".to_string(), "PCPIPCH".to_string()]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetches_indicator_payload() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({"values": {"NGDP_RPCH": {"USA": {"2020": null, "2021": 3.5}}}});
        server
            .mock("GET", "/NGDP_RPCH")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let ds = catalog_for(&server).fetch_indicator("NGDP_RPCH").await.unwrap();
        assert_eq!(ds.code, "NGDP_RPCH");
        assert_eq!(ds.payload, body);
    }

    #[tokio::test]
    async fn non_success_status_is_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/NGDP_RPCH")
            .with_status(503)
            .create_async()
            .await;

        let err = catalog_for(&server).fetch_indicator("NGDP_RPCH").await.unwrap_err();
        match err {
            RefreshError::SourceFetch { target, message } => {
                assert!(target.ends_with("/NGDP_RPCH"));
                assert!(message.contains("503"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_body_is_fetch_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/indicators")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let err = catalog_for(&server).list_indicators("WEO").await.unwrap_err();
        assert!(matches!(err, RefreshError::SourceFetch { .. }));
    }
}
