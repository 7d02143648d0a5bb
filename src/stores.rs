use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::model::{ContactRecord, SaveOutcome};

const HTTP_TIMEOUT_SECS: u64 = 15;

/// First-party record store. Called at most once per save gesture.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn save(&self, record: &ContactRecord, auth_token: &SecretString)
        -> AppResult<SaveOutcome>;

    /// Reloads a contact saved before a navigation so a deferred save can resume.
    async fn load(
        &self,
        subject_id: &str,
        auth_token: &SecretString,
    ) -> AppResult<Option<ContactRecord>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecondarySaveOptions {
    /// The primary save already happened in an earlier attempt.
    pub only_secondary: bool,
}

/// Third-party address book behind an OAuth scope the user may lack.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    async fn save(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
        options: SecondarySaveOptions,
    ) -> AppResult<SaveOutcome>;
}

fn http_client() -> AppResult<Client> {
    Ok(Client::builder()
        .user_agent(concat!("contact-relay/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()?)
}

#[derive(Clone)]
pub struct HttpPrimaryStore {
    http: Client,
    endpoint: Url,
}

#[derive(Deserialize)]
struct PrimarySaveResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl HttpPrimaryStore {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let endpoint = Url::parse(&config.primary_store_endpoint)
            .map_err(|err| AppError::Config(format!("invalid primary store endpoint: {err}")))?;
        Ok(Self {
            http: http_client()?,
            endpoint,
        })
    }

    fn record_url(&self, subject_id: &str) -> AppResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("invalid primary store endpoint".into()))?
            .pop_if_empty()
            .push(subject_id);
        Ok(url)
    }
}

#[async_trait]
impl PrimaryStore for HttpPrimaryStore {
    async fn save(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
    ) -> AppResult<SaveOutcome> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(auth_token.expose_secret())
            .json(record)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Ok(SaveOutcome::failed(describe_failure(status, &body)));
        }

        let parsed: PrimarySaveResponse = if body.trim().is_empty() {
            PrimarySaveResponse {
                success: true,
                error: None,
                id: None,
            }
        } else {
            serde_json::from_str(&body)?
        };
        Ok(SaveOutcome {
            success: parsed.success,
            error: parsed.error,
            external_id: parsed.id,
        })
    }

    async fn load(
        &self,
        subject_id: &str,
        auth_token: &SecretString,
    ) -> AppResult<Option<ContactRecord>> {
        let response = self
            .http
            .get(self.record_url(subject_id)?)
            .bearer_auth(auth_token.expose_secret())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = response.error_for_status()?.json().await?;
        Ok(Some(record))
    }
}

/// Google People API client creating contacts in the user's address book.
#[derive(Clone)]
pub struct PeopleContactsStore {
    http: Client,
    api_base: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonBody<'a> {
    names: Vec<PersonName<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    phone_numbers: Vec<PersonValue<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    email_addresses: Vec<PersonValue<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    biographies: Vec<PersonValue<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    urls: Vec<PersonUrl>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonName<'a> {
    display_name: &'a str,
    given_name: String,
    family_name: String,
}

#[derive(Serialize)]
struct PersonValue<'a> {
    value: &'a str,
}

#[derive(Serialize)]
struct PersonUrl {
    value: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonCreated {
    resource_name: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl PeopleContactsStore {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            http: http_client()?,
            api_base: config.people_api_base.trim_end_matches('/').to_string(),
        })
    }

    fn person_body(record: &ContactRecord) -> PersonBody<'_> {
        let (family, given) = record.name_parts();
        PersonBody {
            names: vec![PersonName {
                display_name: &record.display_name,
                given_name: given,
                family_name: family,
            }],
            phone_numbers: record
                .phone
                .as_deref()
                .map(|value| vec![PersonValue { value }])
                .unwrap_or_default(),
            email_addresses: record
                .email
                .as_deref()
                .map(|value| vec![PersonValue { value }])
                .unwrap_or_default(),
            biographies: record
                .bio
                .as_deref()
                .map(|value| vec![PersonValue { value }])
                .unwrap_or_default(),
            urls: record
                .socials
                .iter()
                .map(|entry| PersonUrl {
                    value: crate::vcard::social_profile_url(entry),
                    kind: entry.platform.to_lowercase(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl SecondaryStore for PeopleContactsStore {
    async fn save(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
        options: SecondarySaveOptions,
    ) -> AppResult<SaveOutcome> {
        debug!(
            target: "people_api",
            subject = %record.subject_id,
            only_secondary = options.only_secondary,
            "creating contact"
        );
        let response = self
            .http
            .post(format!("{}/people:createContact", self.api_base))
            .bearer_auth(auth_token.expose_secret())
            .json(&Self::person_body(record))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Ok(SaveOutcome::failed(describe_failure(status, &body)));
        }
        let created: PersonCreated = serde_json::from_str(&body)?;
        Ok(match created.resource_name {
            Some(name) => SaveOutcome::with_external_id(name),
            None => SaveOutcome::ok(),
        })
    }
}

/// Keeps the provider's wording so the permission classifier can read it.
fn describe_failure(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ApiErrorEnvelope>(body)
        .ok()
        .map(|envelope| {
            let ApiError { message, status } = envelope.error;
            match (status, message) {
                (Some(status), Some(message)) => format!("{status}: {message}"),
                (None, Some(message)) => message,
                (Some(status), None) => status,
                (None, None) => String::new(),
            }
        })
        .filter(|detail| !detail.is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect())
        });
    match detail {
        Some(detail) => format!("{status} {detail}"),
        None => status.to_string(),
    }
}
