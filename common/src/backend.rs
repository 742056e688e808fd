use serde::Deserialize;
use serde_json::json;

use crate::{
    config::{AccountCredentials, BackendConfig},
    endpoints::*,
    error::{AuthError, TransportError},
    session::Session,
    telemetry::TelemetryRecord,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub trait HttpTransport {
    fn post(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

fn base_headers(config: &BackendConfig) -> Vec<(&'static str, String)> {
    vec![
        (HEADER_API_KEY, config.api_key.clone()),
        (HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON.to_string()),
    ]
}

fn token_url(config: &BackendConfig, grant: &str) -> String {
    format!("{}{AUTH_TOKEN_PATH}?grant_type={grant}", config.base_url)
}

pub fn login_request(config: &BackendConfig, account: &AccountCredentials) -> HttpRequest {
    HttpRequest {
        url: token_url(config, GRANT_PASSWORD),
        headers: base_headers(config),
        body: json!({ "email": account.email, "password": account.password }).to_string(),
    }
}

pub fn refresh_request(config: &BackendConfig, refresh_token: &str) -> HttpRequest {
    HttpRequest {
        url: token_url(config, GRANT_REFRESH_TOKEN),
        headers: base_headers(config),
        body: json!({ "refresh_token": refresh_token }).to_string(),
    }
}

pub fn telemetry_request(
    config: &BackendConfig,
    access_token: &str,
    record: &TelemetryRecord<'_>,
) -> HttpRequest {
    let mut headers = base_headers(config);
    headers.push((HEADER_AUTHORIZATION, format!("Bearer {access_token}")));
    headers.push((HEADER_PREFER, PREFER_RETURN_MINIMAL.to_string()));

    HttpRequest {
        url: format!("{}{REST_PATH}/{}", config.base_url, config.telemetry_table),
        headers,
        body: record.to_json().to_string(),
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
}

/// Turns a token endpoint answer into a session. Both tokens must be present;
/// a response carrying only one of them is rejected as a whole.
pub fn parse_token_response(response: &HttpResponse) -> Result<Session, AuthError> {
    if response.status != STATUS_TOKEN_OK {
        return Err(AuthError::Rejected {
            status: response.status,
        });
    }

    let tokens: TokenResponse = serde_json::from_str(&response.body)
        .map_err(|err| AuthError::MalformedResponse(err.to_string()))?;

    if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
        return Err(AuthError::MalformedResponse(
            "access_token and refresh_token are required".to_string(),
        ));
    }

    Ok(Session::new(tokens.access_token, tokens.refresh_token))
}
