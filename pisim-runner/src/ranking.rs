//! Leaderboard telemetry from the Warcraft Logs v2 API.
use async_trait::async_trait;
use pisim_core::{EncounterGroup, ItemCatalog, RankingEntry};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::http::{HttpClient, HttpError, HttpRequest, TokenCache};

pub const TOKEN_URL: &str = "https://www.warcraftlogs.com/oauth/token";
pub const GRAPHQL_URL: &str = "https://www.warcraftlogs.com/api/v2/client";

/// Difficulty id of mythic raids.
const MYTHIC_DIFFICULTY: u32 = 5;

const EXPANSIONS_QUERY: &str = "query { worldData { expansions { id name } } }";

const ZONES_QUERY: &str = "query ($expID: Int!) {
  worldData {
    expansion(id: $expID) {
      zones {
        id
        name
        difficulties { id name }
        encounters { id name }
      }
    }
  }
}";

const RANKINGS_QUERY: &str = "query TopData($encID: Int!, $class: String!, $spec: String!) {
  worldData {
    encounter(id: $encID) {
      characterRankings(
        className: $class
        specName: $spec
        leaderboard: LogsOnly
        includeCombatantInfo: true
      )
    }
  }
}";

#[derive(Debug, Error)]
pub enum RankingError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("GraphQL error: {0}")]
    GraphQl(String),
    #[error("unexpected response shape: missing {0}")]
    Shape(&'static str),
    #[error("invalid ranking payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("no mythic raid zone in expansion {0}")]
    NoRaidZone(u32),
    #[error("zone {0} not found")]
    NoZone(u32),
}

/// OAuth client credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Manual encounter selection, bypassing zone discovery where set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncounterOverride {
    /// Raid zone to use instead of the discovered one.
    pub zone_id: Option<u32>,
    /// Single raid encounter to sample instead of the whole zone.
    pub boss_id: Option<u32>,
}

/// Encounter ids of the current raid tier and dungeon season.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncounterSets {
    pub raid_zone: String,
    pub dungeon_zone: String,
    pub raid: Vec<u32>,
    pub dungeon: Vec<u32>,
}

impl EncounterSets {
    #[must_use]
    pub fn for_group(&self, group: EncounterGroup) -> &[u32] {
        match group {
            EncounterGroup::Raid => &self.raid,
            EncounterGroup::Dungeon => &self.dungeon,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub difficulties: Vec<Named>,
    #[serde(default)]
    pub encounters: Vec<Named>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Named {
    pub id: u32,
    #[serde(default)]
    pub name: String,
}

/// Pick the raid zone (first mythic zone not named "complete raids", or the
/// override) and its dungeon season, which is the next zone id.
///
/// # Errors
///
/// Returns an error when no raid zone qualifies or the dungeon zone is absent.
pub fn select_encounters(
    zones: &[Zone],
    overrides: EncounterOverride,
    expansion: u32,
) -> Result<EncounterSets, RankingError> {
    let raid = match overrides.zone_id {
        Some(id) => zones
            .iter()
            .find(|z| z.id == id)
            .ok_or(RankingError::NoZone(id))?,
        None => zones
            .iter()
            .find(|z| {
                z.difficulties.iter().any(|d| d.id == MYTHIC_DIFFICULTY)
                    && !z.name.to_lowercase().contains("complete raids")
            })
            .ok_or(RankingError::NoRaidZone(expansion))?,
    };
    let dungeon_id = raid.id + 1;
    let dungeon = zones
        .iter()
        .find(|z| z.id == dungeon_id)
        .ok_or(RankingError::NoZone(dungeon_id))?;

    let raid_ids = match overrides.boss_id {
        Some(boss) => vec![boss],
        None => raid.encounters.iter().map(|e| e.id).collect(),
    };
    Ok(EncounterSets {
        raid_zone: raid.name.clone(),
        dungeon_zone: dungeon.name.clone(),
        raid: raid_ids,
        dungeon: dungeon.encounters.iter().map(|e| e.id).collect(),
    })
}

/// Set each gear piece's inventory type from the catalog where it knows the
/// item; the payload value is kept otherwise.
pub fn resolve_inventory_types(entries: &mut [RankingEntry], catalog: &ItemCatalog) {
    for piece in entries.iter_mut().flat_map(|e| e.gear.iter_mut()) {
        if let Some(inventory_type) = catalog.inventory_type(piece.id) {
            piece.inventory_type = Some(inventory_type);
        }
    }
}

/// Anything that can list encounters and their top rankings.
#[async_trait]
pub trait RankingSource: Send + Sync {
    async fn encounters(
        &self,
        overrides: EncounterOverride,
    ) -> Result<EncounterSets, RankingError>;

    async fn rankings(
        &self,
        encounter_id: u32,
        class: &str,
        spec: &str,
    ) -> Result<Vec<RankingEntry>, RankingError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

const fn default_token_lifetime() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct RankingsPage {
    #[serde(default)]
    rankings: Vec<RankingEntry>,
}

/// GraphQL client with a shared bearer-token cache.
#[derive(Clone)]
pub struct WclClient {
    http: HttpClient,
    credentials: Credentials,
    tokens: Arc<TokenCache>,
    token_url: String,
    graphql_url: String,
}

impl WclClient {
    #[must_use]
    pub fn new(http: HttpClient, credentials: Credentials, tokens: Arc<TokenCache>) -> Self {
        Self {
            http,
            credentials,
            tokens,
            token_url: TOKEN_URL.to_string(),
            graphql_url: GRAPHQL_URL.to_string(),
        }
    }

    #[must_use]
    pub fn with_endpoints(mut self, token_url: &str, graphql_url: &str) -> Self {
        self.token_url = token_url.to_string();
        self.graphql_url = graphql_url.to_string();
        self
    }

    /// Current access token, fetched through the client-credentials grant
    /// when the cache is empty or stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the token endpoint rejects the credentials.
    pub async fn token(&self) -> Result<String, RankingError> {
        self.tokens.get_or_refresh(|| self.fetch_token()).await
    }

    async fn fetch_token(&self) -> Result<(String, Duration), RankingError> {
        let request = HttpRequest::post(&self.token_url)
            .form(&[("grant_type", "client_credentials")])
            .basic_auth(&self.credentials.client_id, &self.credentials.client_secret);
        let token: TokenResponse = self
            .http
            .request(request)
            .await?
            .error_for_status()?
            .json()?;
        Ok((token.access_token, Duration::from_secs(token.expires_in)))
    }

    /// Run a query and return its `data` object.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, RankingError> {
        let token = self.token().await?;
        let request = HttpRequest::post(&self.graphql_url)
            .bearer(&token)
            .json(json!({ "query": query, "variables": variables }));
        let mut body: Value = self.http.request(request).await?.error_for_status()?.json()?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            return Err(RankingError::GraphQl(messages.join("; ")));
        }
        body.get_mut("data")
            .map(Value::take)
            .ok_or(RankingError::Shape("data"))
    }
}

#[async_trait]
impl RankingSource for WclClient {
    async fn encounters(
        &self,
        overrides: EncounterOverride,
    ) -> Result<EncounterSets, RankingError> {
        let data = self.graphql(EXPANSIONS_QUERY, json!({})).await?;
        let expansion = data
            .pointer("/worldData/expansions")
            .and_then(Value::as_array)
            .ok_or(RankingError::Shape("worldData.expansions"))?
            .iter()
            .filter_map(|e| e.get("id").and_then(Value::as_u64))
            .max()
            .ok_or(RankingError::Shape("expansion id"))?;
        let expansion = u32::try_from(expansion).map_err(|_| RankingError::Shape("expansion id"))?;

        let mut data = self
            .graphql(ZONES_QUERY, json!({ "expID": expansion }))
            .await?;
        let zones = data
            .pointer_mut("/worldData/expansion/zones")
            .map(Value::take)
            .ok_or(RankingError::Shape("worldData.expansion.zones"))?;
        let zones: Vec<Zone> = serde_json::from_value(zones)?;

        let sets = select_encounters(&zones, overrides, expansion)?;
        log::info!(
            "current raid: {} ({} encounters), dungeon season: {} ({} encounters)",
            sets.raid_zone,
            sets.raid.len(),
            sets.dungeon_zone,
            sets.dungeon.len()
        );
        Ok(sets)
    }

    async fn rankings(
        &self,
        encounter_id: u32,
        class: &str,
        spec: &str,
    ) -> Result<Vec<RankingEntry>, RankingError> {
        let variables = json!({ "encID": encounter_id, "class": class, "spec": spec });
        let mut data = self.graphql(RANKINGS_QUERY, variables).await?;
        let Some(page) = data
            .pointer_mut("/worldData/encounter/characterRankings")
            .map(Value::take)
            .filter(|v| !v.is_null())
        else {
            log::warn!("no rankings for {class} {spec} on encounter {encounter_id}");
            return Ok(Vec::new());
        };
        let page: RankingsPage = serde_json::from_value(page)?;
        log::debug!(
            "{} rankings for {class} {spec} on encounter {encounter_id}",
            page.rankings.len()
        );
        Ok(page.rankings)
    }
}
