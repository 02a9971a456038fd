//! Remote API client
//!
//! The engine only needs two things from the model-sharing site: a paged
//! listing of assets for a selection, and a fresh download URL for one
//! asset. [`CivitaiClient`] implements both against the public REST API.

use crate::error::CivitdlError;
use async_trait::async_trait;
use civitdl_types::{AssetPage, AssetQuery, RemoteAsset, ResolvedDownload, Selection};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// The slice of the remote API the engine consumes
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// One page of assets matching `selection`; `page` is the token from the
    /// previous page, `None` for the first.
    async fn list_assets(
        &self,
        selection: &Selection,
        page: Option<&str>,
        page_size: u32,
    ) -> Result<AssetPage, CivitdlError>;

    /// Fresh transfer location for one asset
    async fn resolve_download_url(&self, asset_id: &str) -> Result<ResolvedDownload, CivitdlError>;
}

// ============================================================================
// Civitai response shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    items: Vec<Model>,
    #[serde(default)]
    metadata: Option<ListMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMetadata {
    /// Sent as a string or a number depending on the sort
    next_cursor: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Model {
    id: u64,
    name: Option<String>,
    #[serde(rename = "type")]
    model_type: Option<String>,
    #[serde(default)]
    model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelVersion {
    id: u64,
    model_id: Option<u64>,
    #[serde(default)]
    model: Option<VersionModel>,
    #[serde(default)]
    files: Vec<ModelFile>,
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionModel {
    name: Option<String>,
    #[serde(rename = "type")]
    model_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelFile {
    name: Option<String>,
    primary: Option<bool>,
    download_url: Option<String>,
    #[serde(default)]
    hashes: Option<FileHashes>,
}

#[derive(Debug, Deserialize)]
struct FileHashes {
    #[serde(rename = "SHA256")]
    sha256: Option<String>,
}

impl ModelVersion {
    /// The primary file, or the first one when none is flagged
    fn primary_file(&self) -> Option<&ModelFile> {
        self.files
            .iter()
            .find(|f| f.primary.unwrap_or(false))
            .or_else(|| self.files.first())
    }

    fn to_asset(&self, model_id: Option<u64>, name: Option<&str>, model_type: Option<&str>) -> RemoteAsset {
        let file = self.primary_file();
        let download_url = file
            .and_then(|f| f.download_url.clone())
            .or_else(|| self.download_url.clone());
        let skip_reason = match (file, &download_url) {
            (None, _) => Some("version has no files".to_string()),
            (_, None) => Some("version has no download url".to_string()),
            _ => None,
        };

        RemoteAsset {
            id: self.id.to_string(),
            model_id: model_id.or(self.model_id),
            model_name: name
                .map(str::to_string)
                .or_else(|| self.model.as_ref().and_then(|m| m.name.clone())),
            model_type: model_type
                .map(str::to_string)
                .or_else(|| self.model.as_ref().and_then(|m| m.model_type.clone())),
            filename: file
                .and_then(|f| f.name.clone())
                .unwrap_or_else(|| format!("{}.safetensors", self.id)),
            download_url,
            // sizeKB is rounded, the exact length comes from the transfer
            expected_size: None,
            checksum: file
                .and_then(|f| f.hashes.as_ref())
                .and_then(|h| h.sha256.as_ref())
                .map(|h| h.to_lowercase()),
            skip_reason,
        }
    }
}

impl Model {
    fn assets(&self, latest_only: bool) -> Vec<RemoteAsset> {
        let take = if latest_only { 1 } else { self.model_versions.len() };
        self.model_versions
            .iter()
            .take(take)
            .map(|v| v.to_asset(Some(self.id), self.name.as_deref(), self.model_type.as_deref()))
            .collect()
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client for the Civitai REST API
#[derive(Clone, Debug)]
pub struct CivitaiClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl CivitaiClient {
    pub fn new(base_url: &str, api_key: Option<String>, user_agent: &str) -> Result<Self, CivitdlError> {
        let base_url =
            Url::parse(base_url).map_err(|_| CivitdlError::InvalidUrl(base_url.to_string()))?;

        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CivitdlError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CivitdlError> {
        self.base_url
            .join(path)
            .map_err(|_| CivitdlError::InvalidUrl(format!("{}{}", self.base_url, path)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, CivitdlError> {
        debug!("GET {}", url);
        let response = self.authorize(self.client.get(url)).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    fn models_url(&self, query: &AssetQuery, cursor: Option<&str>, page_size: u32) -> Result<Url, CivitdlError> {
        let mut url = self.endpoint("api/v1/models")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("limit", &page_size.min(100).to_string());
            if let Some(q) = &query.query {
                pairs.append_pair("query", q);
            }
            if let Some(username) = &query.username {
                pairs.append_pair("username", username);
            }
            if let Some(tag) = &query.tag {
                pairs.append_pair("tag", tag);
            }
            for t in &query.types {
                pairs.append_pair("types", t);
            }
            for base in &query.base_models {
                pairs.append_pair("baseModels", base);
            }
            if let Some(sort) = &query.sort {
                pairs.append_pair("sort", sort);
            }
            if let Some(period) = &query.period {
                pairs.append_pair("period", period);
            }
            if let Some(nsfw) = query.nsfw {
                pairs.append_pair("nsfw", if nsfw { "true" } else { "false" });
            }
            if let Some(cursor) = cursor {
                pairs.append_pair("cursor", cursor);
            }
        }
        Ok(url)
    }

    async fn fetch_version(&self, id: &str) -> Result<ModelVersion, CivitdlError> {
        let url = self.endpoint(&format!("api/v1/model-versions/{}", id))?;
        self.get_json(url).await
    }

    /// Add the API token as a query parameter; download redirects drop headers
    fn with_token(&self, download_url: &str) -> Result<String, CivitdlError> {
        let Some(key) = &self.api_key else {
            return Ok(download_url.to_string());
        };
        let mut url = Url::parse(download_url)
            .map_err(|_| CivitdlError::InvalidUrl(download_url.to_string()))?;
        if !url.query_pairs().any(|(k, _)| k == "token") {
            url.query_pairs_mut().append_pair("token", key);
        }
        Ok(url.to_string())
    }

    /// Walk an explicit id list one id per page; the page token is the index
    /// of the next id. Ids the API does not know are listed under
    /// `placeholder_id(id)` with a skip reason.
    async fn list_ids<F, Fut>(
        &self,
        ids: &[u64],
        page: Option<&str>,
        placeholder_id: fn(u64) -> String,
        fetch: F,
    ) -> Result<AssetPage, CivitdlError>
    where
        F: Fn(u64) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<RemoteAsset>, CivitdlError>>,
    {
        let index: usize = match page {
            Some(token) => token
                .parse()
                .map_err(|_| CivitdlError::Enumeration(format!("bad page token {}", token)))?,
            None => 0,
        };
        let Some(&id) = ids.get(index) else {
            return Ok(AssetPage::default());
        };

        let assets = match fetch(id).await {
            Ok(assets) => assets,
            // An unknown id is recorded, not fatal to the listing
            Err(CivitdlError::PermanentSource { status, message }) => vec![RemoteAsset {
                id: placeholder_id(id),
                filename: id.to_string(),
                skip_reason: Some(format!("{} - {}", status, message)),
                ..Default::default()
            }],
            Err(e) => return Err(e),
        };

        let next = index + 1;
        Ok(AssetPage {
            assets,
            next_page: (next < ids.len()).then(|| next.to_string()),
        })
    }

    /// Listing URLs are handed straight to the transport, so they carry the
    /// token as well
    fn with_tokens(&self, mut listing: AssetPage) -> Result<AssetPage, CivitdlError> {
        for asset in &mut listing.assets {
            if let Some(url) = asset.download_url.take() {
                asset.download_url = Some(self.with_token(&url)?);
            }
        }
        Ok(listing)
    }

    async fn fetch_listing(
        &self,
        selection: &Selection,
        page: Option<&str>,
        page_size: u32,
    ) -> Result<AssetPage, CivitdlError> {
        match selection {
            Selection::Query(query) => {
                let url = self.models_url(query, page, page_size)?;
                let list: ModelList = self.get_json(url).await?;
                let assets = list
                    .items
                    .iter()
                    .flat_map(|m| m.assets(query.latest_only))
                    .collect();
                let next_page = list
                    .metadata
                    .and_then(|m| m.next_cursor)
                    .and_then(|c| match c {
                        serde_json::Value::String(s) if !s.is_empty() => Some(s),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    });
                Ok(AssetPage { assets, next_page })
            }
            Selection::Models { ids, latest_only } => {
                self.list_ids(ids, page, |id| format!("model-{}", id), |id| async move {
                    let url = self.endpoint(&format!("api/v1/models/{}", id))?;
                    let model: Model = self.get_json(url).await?;
                    Ok(model.assets(*latest_only))
                })
                .await
            }
            Selection::Versions { ids } => {
                self.list_ids(ids, page, |id| id.to_string(), |id| async move {
                    let version = self.fetch_version(&id.to_string()).await?;
                    Ok(vec![version.to_asset(None, None, None)])
                })
                .await
            }
        }
    }
}

#[async_trait]
impl ApiClient for CivitaiClient {
    async fn list_assets(
        &self,
        selection: &Selection,
        page: Option<&str>,
        page_size: u32,
    ) -> Result<AssetPage, CivitdlError> {
        let listing = self.fetch_listing(selection, page, page_size).await?;
        self.with_tokens(listing)
    }

    async fn resolve_download_url(&self, asset_id: &str) -> Result<ResolvedDownload, CivitdlError> {
        let version = self.fetch_version(asset_id).await?;
        let asset = version.to_asset(None, None, None);
        let url = asset.download_url.ok_or_else(|| CivitdlError::PermanentSource {
            status: 404,
            message: format!("model version {} has no downloadable file", asset_id),
        })?;

        Ok(ResolvedDownload {
            url: self.with_token(&url)?,
            expected_size: None,
            checksum: asset.checksum,
        })
    }
}

async fn check_status(response: Response) -> Result<Response, CivitdlError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body.chars().take(200).collect()
    };
    Err(CivitdlError::from_status(status.as_u16(), message))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS_PAGE: &str = r#"{
        "items": [{
            "id": 7,
            "name": "Cool LoRA",
            "type": "LORA",
            "modelVersions": [
                {
                    "id": 101,
                    "files": [
                        {"name": "extra.yaml", "downloadUrl": "https://civitai.com/api/download/models/101?type=Config"},
                        {"name": "cool.safetensors", "primary": true,
                         "downloadUrl": "https://civitai.com/api/download/models/101",
                         "hashes": {"SHA256": "ABCDEF"}}
                    ]
                },
                {"id": 100, "files": []}
            ]
        }],
        "metadata": {"nextCursor": "100|200"}
    }"#;

    #[test]
    fn test_model_page_maps_primary_files() {
        let list: ModelList = serde_json::from_str(MODELS_PAGE).unwrap();
        let assets = list.items[0].assets(false);
        assert_eq!(assets.len(), 2);

        let first = &assets[0];
        assert_eq!(first.id, "101");
        assert_eq!(first.model_id, Some(7));
        assert_eq!(first.model_name.as_deref(), Some("Cool LoRA"));
        assert_eq!(first.filename, "cool.safetensors");
        assert_eq!(first.checksum.as_deref(), Some("abcdef"));
        assert!(first.skip_reason.is_none());

        assert_eq!(assets[1].skip_reason.as_deref(), Some("version has no files"));
        assert_eq!(list.items[0].assets(true).len(), 1);
    }

    #[test]
    fn test_models_url_carries_filters() {
        let client = CivitaiClient::new("https://civitai.com", None, "test").unwrap();
        let query = AssetQuery {
            query: Some("anime style".into()),
            types: vec!["LORA".into(), "Checkpoint".into()],
            nsfw: Some(false),
            ..Default::default()
        };
        let url = client.models_url(&query, Some("abc"), 500).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("limit".into(), "100".into())));
        assert!(pairs.contains(&("query".into(), "anime style".into())));
        assert!(pairs.contains(&("types".into(), "Checkpoint".into())));
        assert!(pairs.contains(&("nsfw".into(), "false".into())));
        assert!(pairs.contains(&("cursor".into(), "abc".into())));
        assert_eq!(url.path(), "/api/v1/models");
    }

    #[test]
    fn test_token_is_appended_once() {
        let client =
            CivitaiClient::new("https://civitai.com", Some("secret".into()), "test").unwrap();
        let url = client
            .with_token("https://civitai.com/api/download/models/101")
            .unwrap();
        assert_eq!(url, "https://civitai.com/api/download/models/101?token=secret");
        assert_eq!(client.with_token(&url).unwrap(), url);

        let anonymous = CivitaiClient::new("https://civitai.com", None, "test").unwrap();
        assert_eq!(
            anonymous.with_token("https://x.test/a").unwrap(),
            "https://x.test/a"
        );
    }

    #[test]
    fn test_listing_urls_carry_the_token() {
        let list: ModelList = serde_json::from_str(MODELS_PAGE).unwrap();
        let listing = AssetPage {
            assets: list.items[0].assets(false),
            next_page: None,
        };

        let client =
            CivitaiClient::new("https://civitai.com", Some("secret".into()), "test").unwrap();
        let listing = client.with_tokens(listing).unwrap();
        assert_eq!(
            listing.assets[0].download_url.as_deref(),
            Some("https://civitai.com/api/download/models/101?token=secret")
        );
        // Versions without a file stay without a url
        assert!(listing.assets[1].download_url.is_none());
    }

    #[tokio::test]
    async fn test_id_lists_page_by_index() {
        let client = CivitaiClient::new("https://civitai.com", None, "test").unwrap();
        let ids = [5, 6];
        let placeholder: fn(u64) -> String = |id| format!("model-{}", id);
        let fetch = |id: u64| async move {
            if id == 6 {
                Err(CivitdlError::from_status(404, "Not Found"))
            } else {
                Ok(vec![RemoteAsset {
                    id: id.to_string(),
                    filename: "a.bin".into(),
                    download_url: Some("https://x.test/a".into()),
                    ..Default::default()
                }])
            }
        };

        let first = client.list_ids(&ids, None, placeholder, fetch).await.unwrap();
        assert_eq!(first.assets[0].id, "5");
        assert_eq!(first.next_page.as_deref(), Some("1"));

        let second = client.list_ids(&ids, Some("1"), placeholder, fetch).await.unwrap();
        assert_eq!(second.assets[0].id, "model-6");
        assert!(second.assets[0].skip_reason.is_some());
        assert!(second.next_page.is_none());

        let past_end = client.list_ids(&ids, Some("2"), placeholder, fetch).await.unwrap();
        assert!(past_end.assets.is_empty());
    }
}
