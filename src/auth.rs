//! Credential discovery for both monitoring variants.

use crate::config::SERVICE_NAME;
use crate::error::AppError;
use crate::models::Mode;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const ADMIN_KEY_ENV: &str = "ANTHROPIC_ADMIN_API_KEY";
const ADMIN_KEY_ENTRY: &str = "console:admin-key";
const ADMIN_KEY_PREFIX: &str = "sk-ant-admin";
const ADMIN_KEY_MIN_LEN: usize = 20;
const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

pub const TOKEN_EXPIRED: &str = "Token expired. Please run 'claude' to refresh.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub subscription_type: Option<String>,
}

pub fn is_token_expired_at(creds: &OAuthCredentials, now_ms: i64) -> bool {
    now_ms >= creds.expires_at - EXPIRY_BUFFER_MS
}

/// True once fewer than five minutes of validity remain.
pub fn is_token_expired(creds: &OAuthCredentials) -> bool {
    is_token_expired_at(creds, Utc::now().timestamp_millis())
}

pub fn auth_headers(creds: &OAuthCredentials) -> Result<HeaderMap, AppError> {
    let bearer = HeaderValue::from_str(&format!("Bearer {}", creds.access_token))
        .map_err(|_| AppError::Credentials("OAuth access token contains invalid characters.".into()))?;

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("anthropic-beta", HeaderValue::from_static("oauth-2025-04-20"));
    headers.insert(USER_AGENT, HeaderValue::from_static("claude-code/2.0.37"));
    Ok(headers)
}

pub fn validate_admin_key(key: &str) -> Result<(), AppError> {
    if key.is_empty() {
        return Err(AppError::Credentials("Admin API key is empty".into()));
    }
    if !key.starts_with(ADMIN_KEY_PREFIX) {
        return Err(AppError::Credentials(format!(
            "Invalid Admin API key format: must start with {ADMIN_KEY_PREFIX}"
        )));
    }
    if key.len() < ADMIN_KEY_MIN_LEN {
        return Err(AppError::Credentials(
            "Invalid Admin API key format: key is too short".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminKeySource {
    Environment,
    Keyring,
    CredentialsFile,
}

impl AdminKeySource {
    pub fn as_label(self) -> &'static str {
        match self {
            AdminKeySource::Environment => "environment",
            AdminKeySource::Keyring => "keyring",
            AdminKeySource::CredentialsFile => "credentials file",
        }
    }
}

fn read_credentials_file(path: &Path) -> Result<Option<Value>, AppError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

fn keyring_admin_key() -> Option<String> {
    let lookup = keyring::Entry::new(SERVICE_NAME, ADMIN_KEY_ENTRY).and_then(|entry| entry.get_password());
    match lookup {
        Ok(value) if !value.is_empty() => Some(value),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(err) => {
            tracing::debug!(error = %err, "keyring lookup failed");
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Everything credential-related that was found on this machine.
#[derive(Debug, Clone, Default)]
pub struct CredentialSources {
    pub path: PathBuf,
    pub file: Option<Value>,
    pub env_admin_key: Option<String>,
    pub keyring_admin_key: Option<String>,
}

impl CredentialSources {
    pub fn gather(path: &Path) -> Self {
        let file = match read_credentials_file(path) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable credentials file");
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file,
            env_admin_key: non_empty(std::env::var(ADMIN_KEY_ENV).ok()),
            keyring_admin_key: keyring_admin_key(),
        }
    }

    fn declared_mode(&self) -> Option<Mode> {
        self.file
            .as_ref()?
            .get("mode")
            .and_then(Value::as_str)
            .and_then(Mode::parse)
    }

    pub fn oauth(&self) -> Option<OAuthCredentials> {
        let file = self.file.as_ref()?;
        ["claudeAiOauth", "claudeCode"]
            .iter()
            .filter_map(|key| file.get(*key))
            .find_map(|value| serde_json::from_value(value.clone()).ok())
    }

    fn file_admin_key(&self) -> Option<String> {
        let key = self
            .file
            .as_ref()?
            .get("anthropicConsole")?
            .get("adminApiKey")?
            .as_str()?;
        non_empty(Some(key.to_string()))
    }

    /// First admin key found, in precedence order. Not validated.
    pub fn admin_key(&self) -> Option<(String, AdminKeySource)> {
        if let Some(key) = &self.env_admin_key {
            return Some((key.clone(), AdminKeySource::Environment));
        }
        if let Some(key) = &self.keyring_admin_key {
            return Some((key.clone(), AdminKeySource::Keyring));
        }
        self.file_admin_key()
            .map(|key| (key, AdminKeySource::CredentialsFile))
    }

    pub fn validated_admin_key(&self) -> Result<(String, AdminKeySource), AppError> {
        let (key, source) = self
            .admin_key()
            .ok_or_else(|| AppError::Credentials("Admin API key not found".into()))?;
        validate_admin_key(&key)?;
        Ok((key, source))
    }
}

pub fn detect_mode(sources: &CredentialSources) -> Result<Mode, AppError> {
    if let Some(mode) = sources.declared_mode() {
        return Ok(mode);
    }
    if sources.oauth().is_some() {
        return Ok(Mode::Code);
    }
    if sources.admin_key().is_some() {
        return Ok(Mode::Console);
    }
    Err(AppError::Credentials(format!(
        "No credentials found in {}. Run 'claude' to sign in, or set {ADMIN_KEY_ENV} for Console mode.",
        sources.path.display()
    )))
}

pub fn resolve_mode(explicit: Option<Mode>, sources: &CredentialSources) -> Result<Mode, AppError> {
    match explicit {
        Some(mode) => Ok(mode),
        None => detect_mode(sources),
    }
}

/// Loads the OAuth token, re-reading the file once when it looks expired in
/// case another process refreshed it meanwhile.
pub fn load_oauth_credentials(path: &Path) -> Result<OAuthCredentials, AppError> {
    load_oauth_credentials_at(path, Utc::now().timestamp_millis())
}

fn load_oauth_credentials_at(path: &Path, now_ms: i64) -> Result<OAuthCredentials, AppError> {
    let read = || -> Result<OAuthCredentials, AppError> {
        let file = read_credentials_file(path)?.ok_or_else(|| {
            AppError::Credentials("Credentials file not found. Please run 'claude' to authenticate.".into())
        })?;
        let sources = CredentialSources {
            path: path.to_path_buf(),
            file: Some(file),
            ..CredentialSources::default()
        };
        sources
            .oauth()
            .ok_or_else(|| AppError::Credentials("No OAuth credentials found".into()))
    };

    let creds = read()?;
    if !is_token_expired_at(&creds, now_ms) {
        return Ok(creds);
    }

    tracing::info!("OAuth token near expiry, re-reading credentials file");
    let reread = read()?;
    if is_token_expired_at(&reread, now_ms) {
        return Err(AppError::Credentials(TOKEN_EXPIRED.into()));
    }
    Ok(reread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const NOW_MS: i64 = 1_700_000_000_000;

    fn creds(expires_at: i64) -> OAuthCredentials {
        OAuthCredentials {
            access_token: "sk-ant-oat01-token".into(),
            refresh_token: Some("refresh".into()),
            expires_at,
            subscription_type: None,
        }
    }

    fn sources(file: Value) -> CredentialSources {
        CredentialSources {
            path: PathBuf::from("/tmp/.credentials.json"),
            file: Some(file),
            ..CredentialSources::default()
        }
    }

    fn write_credentials(tmp: &TempDir, body: Value) -> PathBuf {
        let path = tmp.path().join(".credentials.json");
        fs::write(&path, body.to_string()).expect("write credentials");
        path
    }

    #[test]
    fn expiry_uses_five_minute_buffer() {
        assert!(!is_token_expired_at(&creds(NOW_MS + 10 * 60 * 1000), NOW_MS));
        assert!(is_token_expired_at(&creds(NOW_MS + 4 * 60 * 1000), NOW_MS));
        assert!(is_token_expired_at(&creds(NOW_MS + 5 * 60 * 1000), NOW_MS));
        assert!(is_token_expired_at(&creds(0), NOW_MS));
    }

    #[test]
    fn auth_headers_carry_bearer_and_beta_flag() {
        let headers = auth_headers(&creds(0)).expect("headers");
        assert_eq!(
            headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer sk-ant-oat01-token")
        );
        assert_eq!(
            headers.get("anthropic-beta").and_then(|v| v.to_str().ok()),
            Some("oauth-2025-04-20")
        );
    }

    #[test]
    fn admin_key_validation_rules() {
        assert!(validate_admin_key("").is_err());
        assert!(validate_admin_key("sk-ant-REDACTED").is_err());
        assert!(validate_admin_key("sk-ant-admin-x").is_err());
        assert!(validate_admin_key("sk-ant-REDACTED").is_ok());
    }

    #[test]
    fn explicit_mode_field_wins() {
        let src = sources(json!({
            "mode": "console",
            "claudeAiOauth": { "accessToken": "t", "expiresAt": 0 }
        }));
        assert_eq!(detect_mode(&src).expect("mode"), Mode::Console);
    }

    #[test]
    fn oauth_credentials_select_code_mode() {
        let src = sources(json!({ "claudeAiOauth": { "accessToken": "t", "expiresAt": 1 } }));
        assert_eq!(detect_mode(&src).expect("mode"), Mode::Code);

        let legacy = sources(json!({ "claudeCode": { "accessToken": "t" } }));
        assert_eq!(detect_mode(&legacy).expect("mode"), Mode::Code);
    }

    #[test]
    fn admin_key_selects_console_mode() {
        let src = sources(json!({
            "anthropicConsole": { "adminApiKey": "sk-ant-REDACTED" }
        }));
        assert_eq!(detect_mode(&src).expect("mode"), Mode::Console);

        let env_only = CredentialSources {
            env_admin_key: Some("sk-ant-REDACTED".into()),
            ..CredentialSources::default()
        };
        assert_eq!(detect_mode(&env_only).expect("mode"), Mode::Console);
    }

    #[test]
    fn no_credentials_is_an_error() {
        let err = detect_mode(&CredentialSources::default()).expect_err("no credentials");
        assert!(err.to_string().contains("No credentials found"));
    }

    #[test]
    fn explicit_flag_overrides_detection() {
        let src = sources(json!({ "claudeAiOauth": { "accessToken": "t" } }));
        assert_eq!(resolve_mode(Some(Mode::Console), &src).expect("mode"), Mode::Console);
        assert_eq!(resolve_mode(None, &src).expect("mode"), Mode::Code);
    }

    #[test]
    fn admin_key_precedence_env_then_keyring_then_file() {
        let mut src = sources(json!({
            "anthropicConsole": { "adminApiKey": "sk-ant-REDACTED" }
        }));
        assert_eq!(
            src.admin_key().map(|(_, s)| s),
            Some(AdminKeySource::CredentialsFile)
        );

        src.keyring_admin_key = Some("sk-ant-REDACTED".into());
        assert_eq!(src.admin_key().map(|(_, s)| s), Some(AdminKeySource::Keyring));

        src.env_admin_key = Some("sk-ant-REDACTED".into());
        let (key, source) = src.validated_admin_key().expect("valid key");
        assert_eq!(source, AdminKeySource::Environment);
        assert_eq!(key, "sk-ant-REDACTED");
    }

    #[test]
    fn invalid_admin_key_is_reported() {
        let src = CredentialSources {
            env_admin_key: Some("not-an-admin-key".into()),
            ..CredentialSources::default()
        };
        let err = src.validated_admin_key().expect_err("invalid");
        assert!(err.to_string().contains("sk-ant-admin"));
    }

    #[test]
    fn load_oauth_returns_valid_token() {
        let tmp = TempDir::new().expect("tempdir");
        let path = write_credentials(
            &tmp,
            json!({ "claudeAiOauth": { "accessToken": "abc", "expiresAt": NOW_MS + 3_600_000 } }),
        );
        let loaded = load_oauth_credentials_at(&path, NOW_MS).expect("load");
        assert_eq!(loaded.access_token, "abc");
    }

    #[test]
    fn load_oauth_reports_expired_token() {
        let tmp = TempDir::new().expect("tempdir");
        let path = write_credentials(
            &tmp,
            json!({ "claudeAiOauth": { "accessToken": "abc", "expiresAt": NOW_MS - 1 } }),
        );
        let err = load_oauth_credentials_at(&path, NOW_MS).expect_err("expired");
        assert_eq!(err.to_string(), TOKEN_EXPIRED);
    }

    #[test]
    fn load_oauth_reports_missing_file() {
        let tmp = TempDir::new().expect("tempdir");
        let err = load_oauth_credentials_at(&tmp.path().join("missing.json"), NOW_MS)
            .expect_err("missing");
        assert!(err.to_string().contains("Credentials file not found"));
    }

    #[test]
    fn gather_tolerates_malformed_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join(".credentials.json");
        fs::write(&path, "{not json").expect("write");
        let src = CredentialSources::gather(&path);
        assert!(src.file.is_none());
    }
}
