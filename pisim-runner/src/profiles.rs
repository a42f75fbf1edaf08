//! Base character profiles from the simulator's public repository.
use serde::Deserialize;

use crate::http::{HttpClient, HttpError, HttpRequest};

pub const GITHUB_API: &str = "https://api.github.com/repos/simulationcraft/simc/contents/profiles";
pub const RAW_BASE: &str = "https://raw.githubusercontent.com/simulationcraft/simc/master/profiles";

/// Folders under `profiles/` that never hold a current tier.
const SKIPPED_FOLDERS: [&str; 2] = ["generators", "tests"];

#[derive(Debug, Clone, Deserialize)]
pub struct ContentEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// One fetched profile file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileFile {
    pub name: String,
    pub text: String,
}

/// The lexicographically last tier folder, ignoring pre-raid and tooling
/// folders.
#[must_use]
pub fn latest_tier(entries: &[ContentEntry]) -> Option<String> {
    entries
        .iter()
        .filter(|e| e.kind == "dir")
        .filter(|e| !e.name.to_lowercase().starts_with("pre"))
        .filter(|e| !SKIPPED_FOLDERS.contains(&e.name.as_str()))
        .map(|e| e.name.clone())
        .max()
}

/// Listing and raw-file access to the profile repository.
#[derive(Clone)]
pub struct ProfileRepository {
    http: HttpClient,
    token: Option<String>,
    api_base: String,
    raw_base: String,
}

impl ProfileRepository {
    #[must_use]
    pub fn new(http: HttpClient, token: Option<String>) -> Self {
        Self {
            http,
            token,
            api_base: GITHUB_API.to_string(),
            raw_base: RAW_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_endpoints(mut self, api_base: &str, raw_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.raw_base = raw_base.trim_end_matches('/').to_string();
        self
    }

    fn get(&self, url: String) -> HttpRequest {
        let request = HttpRequest::get(url)
            .header("User-Agent", "pisim")
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => request.header("Authorization", format!("token {token}")),
            None => request,
        }
    }

    async fn list(&self, url: String) -> Result<Vec<ContentEntry>, HttpError> {
        self.http.request(self.get(url)).await?.error_for_status()?.json()
    }

    /// Name of the current tier folder, `None` when the listing has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be fetched.
    pub async fn latest_tier(&self) -> Result<Option<String>, HttpError> {
        let entries = self.list(self.api_base.clone()).await?;
        Ok(latest_tier(&entries))
    }

    /// Every `.simc` file of a tier folder, in listing order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing or any file cannot be fetched.
    pub async fn fetch_tier(&self, tier: &str) -> Result<Vec<ProfileFile>, HttpError> {
        let entries = self.list(format!("{}/{tier}", self.api_base)).await?;
        let mut files = Vec::new();
        for entry in entries.into_iter().filter(|e| e.name.ends_with(".simc")) {
            let url = format!("{}/{tier}/{}", self.raw_base, entry.name);
            let text = self
                .http
                .request(HttpRequest::get(url).header("User-Agent", "pisim"))
                .await?
                .error_for_status()?
                .body;
            files.push(ProfileFile {
                name: entry.name,
                text,
            });
        }
        log::info!("fetched {} profile(s) from tier {tier}", files.len());
        Ok(files)
    }
}
