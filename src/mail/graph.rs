//! Microsoft Graph implementation of `MailStore`.
//!
//! Talks to the `/users/{owner}/mailFolders` and `/users/{owner}/messages`
//! endpoints with an app-only (client credentials) token. Tokens are cached
//! until shortly before they expire.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::MailStoreError;
use crate::mail::{BodyFormat, CandidateMessage, CandidateQuery, Folder, MailStore};

/// Default Graph API root.
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";

/// Default identity platform root.
pub const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh tokens this long before the reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const MESSAGE_FIELDS: &str = "id,subject,bodyPreview,body,from,receivedDateTime,isRead,categories";

const IMMUTABLE_ID_PREFERENCE: &str = "IdType=\"ImmutableId\"";

/// How requests are authenticated.
#[derive(Debug, Clone)]
pub enum GraphAuth {
    /// App registration credentials, exchanged for a bearer token on demand.
    ClientCredentials {
        tenant_id: String,
        client_id: String,
        client_secret: SecretString,
        login_url: String,
    },
    /// A pre-issued bearer token (tests, short-lived tooling).
    StaticToken(SecretString),
}

/// Connection settings for the Graph store.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    pub auth: GraphAuth,
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

/// `MailStore` backed by Microsoft Graph.
pub struct GraphMailStore {
    http: Client,
    config: GraphConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
    #[serde(default)]
    parent_folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEmailAddress {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body_preview: Option<String>,
    #[serde(default)]
    body: Option<GraphBody>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    received_date_time: DateTime<Utc>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GraphCategories {
    #[serde(default)]
    categories: Vec<String>,
}

impl From<GraphMessage> for CandidateMessage {
    fn from(m: GraphMessage) -> Self {
        let (body, body_format) = match m.body {
            Some(b) if b.content_type.eq_ignore_ascii_case("html") => (b.content, BodyFormat::Html),
            Some(b) => (b.content, BodyFormat::Text),
            None => (String::new(), BodyFormat::Text),
        };
        CandidateMessage {
            id: m.id,
            sender: m
                .from
                .and_then(|f| f.email_address.address)
                .unwrap_or_default(),
            subject: m.subject.unwrap_or_default(),
            body_preview: m.body_preview.unwrap_or_default(),
            body,
            body_format,
            received_at: m.received_date_time,
            is_read: m.is_read,
            categories: m.categories.into_iter().collect(),
        }
    }
}

/// Quote a string literal for an OData `$filter` expression.
fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn odata_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Map a non-success Graph response onto a `MailStoreError`.
async fn error_from_response(response: Response, conflict_name: &str) -> MailStoreError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::CONFLICT => MailStoreError::Conflict {
            name: conflict_name.to_string(),
        },
        StatusCode::NOT_FOUND => MailStoreError::NotFound(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => MailStoreError::Auth(body),
        StatusCode::TOO_MANY_REQUESTS => MailStoreError::RateLimited { retry_after },
        _ => MailStoreError::Http {
            status: status.as_u16(),
            body,
        },
    }
}

impl GraphMailStore {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            http: Client::new(),
            config,
            token: Mutex::new(None),
        }
    }

    /// Build `{base}/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, MailStoreError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| MailStoreError::Request(format!("invalid base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| MailStoreError::Request("base url cannot have a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn folders_url(&self, owner_id: &str, parent_id: Option<&str>) -> Result<Url, MailStoreError> {
        match parent_id {
            Some(parent) => self.url(&["users", owner_id, "mailFolders", parent, "childFolders"]),
            None => self.url(&["users", owner_id, "mailFolders"]),
        }
    }

    async fn bearer(&self) -> Result<SecretString, MailStoreError> {
        let (tenant_id, client_id, client_secret, login_url) = match &self.config.auth {
            GraphAuth::StaticToken(token) => return Ok(token.clone()),
            GraphAuth::ClientCredentials {
                tenant_id,
                client_id,
                client_secret,
                login_url,
            } => (tenant_id, client_id, client_secret, login_url),
        };

        let mut cached = self.token.lock().await;
        if let Some(ref t) = *cached
            && Instant::now() < t.expires_at
        {
            return Ok(t.token.clone());
        }

        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            login_url.trim_end_matches('/'),
            tenant_id
        );
        let response = self
            .http
            .post(&token_url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MailStoreError::Auth(format!(
                "token request failed ({status}): {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| MailStoreError::InvalidResponse(format!("token response: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let secret = SecretString::from(token.access_token);
        *cached = Some(CachedToken {
            token: secret.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!(expires_in = token.expires_in, "Acquired Graph access token");
        Ok(secret)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<Response, MailStoreError> {
        let token = self.bearer().await?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token.expose_secret())
            // Message ids must survive a move: the message is tagged afterwards.
            .header("Prefer", IMMUTABLE_ID_PREFERENCE);
        if let Some(body) = body {
            request = request.json(&body);
        }
        Ok(request.send().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, MailStoreError> {
        let response = self.send(Method::GET, url, None).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, "").await);
        }
        response
            .json()
            .await
            .map_err(|e| MailStoreError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl MailStore for GraphMailStore {
    async fn find_child_folder(
        &self,
        owner_id: &str,
        parent_id: Option<&str>,
        display_name: &str,
    ) -> Result<Option<Folder>, MailStoreError> {
        let mut url = self.folders_url(owner_id, parent_id)?;
        url.query_pairs_mut().append_pair(
            "$filter",
            &format!("displayName eq {}", odata_literal(display_name)),
        );

        let found: Collection<GraphFolder> = self.get_json(url).await?;
        // The OData filter is case-insensitive; segment matching is not.
        Ok(found
            .value
            .into_iter()
            .find(|f| f.display_name == display_name)
            .map(|f| Folder {
                id: f.id,
                display_name: f.display_name,
                parent_id: parent_id.map(str::to_string).or(f.parent_folder_id),
            }))
    }

    async fn create_child_folder(
        &self,
        owner_id: &str,
        parent_id: Option<&str>,
        display_name: &str,
    ) -> Result<Folder, MailStoreError> {
        let url = self.folders_url(owner_id, parent_id)?;
        let response = self
            .send(Method::POST, url, Some(json!({ "displayName": display_name })))
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, display_name).await);
        }

        let created: GraphFolder = response
            .json()
            .await
            .map_err(|e| MailStoreError::InvalidResponse(e.to_string()))?;
        Ok(Folder {
            id: created.id,
            display_name: created.display_name,
            parent_id: parent_id.map(str::to_string),
        })
    }

    async fn fetch_candidates(
        &self,
        owner_id: &str,
        folder_id: &str,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateMessage>, MailStoreError> {
        let Some((oldest, newest)) = query.window.bounds(query.now) else {
            return Ok(Vec::new());
        };

        let filter = format!(
            "receivedDateTime ge {} and receivedDateTime le {} and not(categories/any(c:c eq {}))",
            odata_datetime(oldest),
            odata_datetime(newest),
            odata_literal(&query.exclude_category),
        );

        let mut url = self.url(&["users", owner_id, "mailFolders", folder_id, "messages"])?;
        url.query_pairs_mut()
            .append_pair("$filter", &filter)
            .append_pair("$orderby", "receivedDateTime desc")
            .append_pair("$top", &query.limit.to_string())
            .append_pair("$select", MESSAGE_FIELDS);

        let page: Collection<GraphMessage> = self.get_json(url).await?;
        let mut messages: Vec<CandidateMessage> = page
            .value
            .into_iter()
            .map(CandidateMessage::from)
            .filter(|m| !m.categories.contains(&query.exclude_category))
            .collect();
        messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        messages.truncate(query.limit);
        Ok(messages)
    }

    async fn move_message(
        &self,
        owner_id: &str,
        message_id: &str,
        destination_folder_id: &str,
    ) -> Result<(), MailStoreError> {
        let url = self.url(&["users", owner_id, "messages", message_id, "move"])?;
        let response = self
            .send(
                Method::POST,
                url,
                Some(json!({ "destinationId": destination_folder_id })),
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, destination_folder_id).await);
        }
        Ok(())
    }

    async fn add_categories(
        &self,
        owner_id: &str,
        message_id: &str,
        categories: &BTreeSet<String>,
    ) -> Result<(), MailStoreError> {
        // PATCH replaces the whole list, so read-merge-write.
        let mut url = self.url(&["users", owner_id, "messages", message_id])?;
        url.query_pairs_mut().append_pair("$select", "categories");
        let current: GraphCategories = self.get_json(url).await?;

        let mut merged = current.categories;
        for category in categories {
            if !merged.contains(category) {
                merged.push(category.clone());
            }
        }

        let url = self.url(&["users", owner_id, "messages", message_id])?;
        let response = self
            .send(Method::PATCH, url, Some(json!({ "categories": merged })))
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, message_id).await);
        }
        Ok(())
    }
}
