//! Drive file provider: the operations the sync machine needs, behind the
//! [`DriveProvider`] trait, plus a Google Drive v3 REST implementation.
//!
//! All list/get calls pass the shared-drive flags (`supportsAllDrives`,
//! `includeItemsFromAllDrives`) so folders on shared drives behave like
//! folders in My Drive. Drive calls are not retried; the next sync trigger
//! retries naturally.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::DriveConfig;
use crate::error::PipelineError;
use crate::models::SourceType;
use crate::state::WatchChannel;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const GOOGLE_SHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
pub const GOOGLE_DOC_MIME: &str = "application/vnd.google-apps.document";
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,parents,trashed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub modified_time: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub file: Option<DriveFile>,
}

/// One page of the incremental change feed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    /// Present only on the last page.
    #[serde(default)]
    pub new_start_page_token: Option<String>,
}

/// How a Drive file becomes a local input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePlan {
    pub source_type: SourceType,
    /// Export target for native Google formats; `None` means raw download.
    pub export_mime: Option<&'static str>,
}

impl FilePlan {
    /// Native spreadsheets export to xlsx and native documents to docx;
    /// other files are supported when their name or MIME type maps to a
    /// known source type.
    pub fn for_file(file: &DriveFile) -> Option<Self> {
        let raw = |source_type| {
            Some(FilePlan {
                source_type,
                export_mime: None,
            })
        };
        match file.mime_type.as_str() {
            FOLDER_MIME => None,
            GOOGLE_SHEET_MIME => Some(FilePlan {
                source_type: SourceType::Xlsx,
                export_mime: Some(XLSX_MIME),
            }),
            GOOGLE_DOC_MIME => Some(FilePlan {
                source_type: SourceType::Docx,
                export_mime: Some(DOCX_MIME),
            }),
            m if m.starts_with("application/vnd.google-apps.") => None,
            m => match SourceType::from_extension(std::path::Path::new(&file.name)) {
                Some(t) => raw(t),
                None => match m {
                    "text/csv" => raw(SourceType::Csv),
                    "application/json" => raw(SourceType::Json),
                    XLSX_MIME => raw(SourceType::Xlsx),
                    DOCX_MIME => raw(SourceType::Docx),
                    _ => None,
                },
            },
        }
    }

    /// Local file name: the Drive name, with the format extension appended
    /// when it is missing (always the case for native exports).
    pub fn local_name(&self, file: &DriveFile) -> String {
        let ext = self.source_type.as_str();
        let safe: String = file
            .name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let has_ext = SourceType::from_extension(std::path::Path::new(&safe))
            == Some(self.source_type);
        if has_ext {
            safe
        } else {
            format!("{}.{}", safe, ext)
        }
    }
}

/// Drive operations used by the sync machine.
#[async_trait]
pub trait DriveProvider: Send + Sync {
    /// Metadata for the target folder; fails when it is missing or not shared.
    async fn get_folder(&self, folder_id: &str) -> Result<DriveFile>;

    /// Every non-trashed direct child of the folder, all pages.
    async fn list_folder_files(&self, folder_id: &str) -> Result<Vec<DriveFile>>;

    async fn start_page_token(&self) -> Result<String>;

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage>;

    /// Registers a webhook channel on the change feed.
    async fn watch_changes(
        &self,
        page_token: &str,
        channel_id: &str,
        address: &str,
        token: Option<&str>,
    ) -> Result<WatchChannel>;

    async fn download(&self, file_id: &str) -> Result<Vec<u8>>;

    async fn export(&self, file_id: &str, mime_type: &str) -> Result<Vec<u8>>;
}

/// Cached access token and its expiry.
type TokenCache = tokio::sync::Mutex<Option<(String, DateTime<Utc>)>>;

/// The fields of a service-account key file that the JWT-bearer grant needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_json(content: &str) -> Result<Self> {
        let key: ServiceAccountKey =
            serde_json::from_str(content).context("Failed to parse service-account key")?;
        if key.client_email.trim().is_empty() || key.private_key.trim().is_empty() {
            return Err(PipelineError::MissingCredential(
                "service-account key needs client_email and private_key".to_string(),
            )
            .into());
        }
        Ok(key)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!("Failed to read service-account key: {}", path.display())
        })?;
        Self::from_json(&content)
    }
}

/// Claims of the RS256 assertion exchanged for a Drive access token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

impl AssertionClaims {
    pub fn new(key: &ServiceAccountKey, subject: Option<&str>, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            iss: key.client_email.clone(),
            scope: DRIVE_SCOPE.to_string(),
            aud: key.token_uri.clone(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
            sub: subject.map(str::to_string),
        }
    }
}

fn sign_assertion(key: &ServiceAccountKey, subject: Option<&str>) -> Result<String> {
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .context("Service-account private_key is not a valid RSA PEM")?;
    encode(&header, &AssertionClaims::new(key, subject, Utc::now()), &signing_key)
        .context("Failed to sign service-account assertion")
}

/// Access-token source for the Drive REST client.
pub enum DriveAuth {
    /// A pre-issued bearer token (`GOOGLE_DRIVE_ACCESS_TOKEN`).
    Static(String),
    /// Service-account JWT-bearer grant, optionally impersonating `subject`.
    ServiceAccount {
        key: ServiceAccountKey,
        subject: Option<String>,
        cached: TokenCache,
    },
    /// OAuth refresh-token grant; the access token is cached until shortly
    /// before it expires.
    Refresh {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        cached: TokenCache,
    },
}

impl DriveAuth {
    pub fn service_account(key: ServiceAccountKey, subject: Option<String>) -> Self {
        DriveAuth::ServiceAccount {
            key,
            subject,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Resolution order: `GOOGLE_DRIVE_ACCESS_TOKEN`, then the key file named
    /// by `GOOGLE_SERVICE_ACCOUNT_FILE` (with optional
    /// `GOOGLE_SERVICE_ACCOUNT_SUBJECT`), then the `GOOGLE_OAUTH_CLIENT_ID`,
    /// `GOOGLE_OAUTH_CLIENT_SECRET` and `GOOGLE_OAUTH_REFRESH_TOKEN` triple.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).unwrap_or_default().trim().to_string();
        let token = var("GOOGLE_DRIVE_ACCESS_TOKEN");
        if !token.is_empty() {
            return Ok(DriveAuth::Static(token));
        }

        let key_file = var("GOOGLE_SERVICE_ACCOUNT_FILE");
        if !key_file.is_empty() {
            let key = ServiceAccountKey::from_file(Path::new(&key_file))?;
            let subject = Some(var("GOOGLE_SERVICE_ACCOUNT_SUBJECT")).filter(|s| !s.is_empty());
            return Ok(DriveAuth::service_account(key, subject));
        }

        let (client_id, client_secret, refresh_token) = (
            var("GOOGLE_OAUTH_CLIENT_ID"),
            var("GOOGLE_OAUTH_CLIENT_SECRET"),
            var("GOOGLE_OAUTH_REFRESH_TOKEN"),
        );
        if client_id.is_empty() || refresh_token.is_empty() {
            return Err(PipelineError::MissingCredential(
                "GOOGLE_DRIVE_ACCESS_TOKEN, GOOGLE_SERVICE_ACCOUNT_FILE or \
                 GOOGLE_OAUTH_CLIENT_ID/GOOGLE_OAUTH_REFRESH_TOKEN"
                    .to_string(),
            )
            .into());
        }
        Ok(DriveAuth::Refresh {
            client_id,
            client_secret,
            refresh_token,
            cached: tokio::sync::Mutex::new(None),
        })
    }

    async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        let cache = match self {
            DriveAuth::Static(token) => return Ok(token.clone()),
            DriveAuth::ServiceAccount { cached, .. } | DriveAuth::Refresh { cached, .. } => cached,
        };

        let mut cached = cache.lock().await;
        if let Some((token, expiry)) = cached.as_ref() {
            if *expiry > Utc::now() + ChronoDuration::seconds(60) {
                return Ok(token.clone());
            }
        }

        let (token_uri, form): (&str, Vec<(&str, String)>) = match self {
            DriveAuth::Static(token) => return Ok(token.clone()),
            DriveAuth::ServiceAccount { key, subject, .. } => (
                key.token_uri.as_str(),
                vec![
                    ("grant_type", JWT_BEARER_GRANT.to_string()),
                    ("assertion", sign_assertion(key, subject.as_deref())?),
                ],
            ),
            DriveAuth::Refresh {
                client_id,
                client_secret,
                refresh_token,
                ..
            } => {
                let mut form = vec![
                    ("client_id", client_id.clone()),
                    ("refresh_token", refresh_token.clone()),
                    ("grant_type", "refresh_token".to_string()),
                ];
                if !client_secret.is_empty() {
                    form.push(("client_secret", client_secret.clone()));
                }
                (TOKEN_URI, form)
            }
        };

        let resp = client
            .post(token_uri)
            .form(&form)
            .send()
            .await
            .context("Drive token request failed")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PipelineError::http("drive-auth", status.as_u16(), &body).into());
        }
        let json: serde_json::Value =
            serde_json::from_str(&body).context("Drive token response is not JSON")?;
        let token = json["access_token"]
            .as_str()
            .ok_or_else(|| {
                PipelineError::InvalidInput("no access_token in token response".to_string())
            })?
            .to_string();
        let expires_in = json["expires_in"].as_i64().unwrap_or(3600);
        *cached = Some((token.clone(), Utc::now() + ChronoDuration::seconds(expires_in)));
        Ok(token)
    }
}

/// Google Drive v3 over REST.
pub struct GoogleDriveClient {
    client: reqwest::Client,
    api_base: String,
    auth: DriveAuth,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResponse {
    id: String,
    resource_id: String,
    #[serde(default)]
    resource_uri: Option<String>,
    /// Milliseconds since the epoch, sent as a string.
    #[serde(default)]
    expiration: Option<String>,
}

impl GoogleDriveClient {
    pub fn new(config: &DriveConfig, auth: DriveAuth) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth,
        })
    }

    pub fn from_env(config: &DriveConfig) -> Result<Self> {
        Self::new(config, DriveAuth::from_env()?)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.auth.access_token(&self.client).await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .context("Drive request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::http("drive", status.as_u16(), &body).into());
        }
        Ok(resp)
    }

    async fn get_bytes(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>> {
        let resp = self.send(request).await?;
        Ok(resp.bytes().await.context("Drive download interrupted")?.to_vec())
    }
}

#[async_trait]
impl DriveProvider for GoogleDriveClient {
    async fn get_folder(&self, folder_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files/{}", self.api_base, folder_id);
        let request = self.client.get(&url).query(&[
            ("fields", FILE_FIELDS),
            ("supportsAllDrives", "true"),
        ]);
        let folder: DriveFile = self
            .send(request)
            .await
            .with_context(|| format!("Drive folder '{}' not found or not shared", folder_id))?
            .json()
            .await?;
        if folder.mime_type != FOLDER_MIME {
            return Err(PipelineError::MissingConfig(format!(
                "drive.folder_id '{}' is not a folder ({})",
                folder_id, folder.mime_type
            ))
            .into());
        }
        Ok(folder)
    }

    async fn list_folder_files(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let url = format!("{}/files", self.api_base);
        let q = format!("'{}' in parents and trashed = false", folder_id);
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(&url).query(&[
                ("q", q.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", "1000"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: FileListResponse = self.send(request).await?.json().await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn start_page_token(&self) -> Result<String> {
        let url = format!("{}/changes/startPageToken", self.api_base);
        let request = self
            .client
            .get(&url)
            .query(&[("supportsAllDrives", "true")]);
        let json: serde_json::Value = self.send(request).await?.json().await?;
        json["startPageToken"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                PipelineError::InvalidInput("no startPageToken in Drive response".into()).into()
            })
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        let url = format!("{}/changes", self.api_base);
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,file({}))",
            FILE_FIELDS
        );
        let request = self.client.get(&url).query(&[
            ("pageToken", page_token),
            ("fields", fields.as_str()),
            ("pageSize", "1000"),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ]);
        Ok(self.send(request).await?.json().await?)
    }

    async fn watch_changes(
        &self,
        page_token: &str,
        channel_id: &str,
        address: &str,
        token: Option<&str>,
    ) -> Result<WatchChannel> {
        let url = format!("{}/changes/watch", self.api_base);
        let mut body = serde_json::json!({
            "id": channel_id,
            "type": "web_hook",
            "address": address,
        });
        if let Some(token) = token {
            body["token"] = serde_json::Value::String(token.to_string());
        }
        let request = self
            .client
            .post(&url)
            .query(&[
                ("pageToken", page_token),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .json(&body);
        let resp: ChannelResponse = self.send(request).await?.json().await?;
        Ok(WatchChannel {
            id: resp.id,
            resource_id: resp.resource_id,
            resource_uri: resp.resource_uri,
            expiration: resp.expiration.and_then(|e| e.parse().ok()),
            address: address.to_string(),
            created_at: Utc::now().to_rfc3339(),
        })
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/files/{}", self.api_base, file_id);
        let request = self
            .client
            .get(&url)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")]);
        self.get_bytes(request).await
    }

    async fn export(&self, file_id: &str, mime_type: &str) -> Result<Vec<u8>> {
        let url = format!("{}/files/{}/export", self.api_base, file_id);
        let request = self.client.get(&url).query(&[("mimeType", mime_type)]);
        self.get_bytes(request).await
    }
}
