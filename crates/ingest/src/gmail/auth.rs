//! Gmail OAuth2 token exchange
//!
//! Implements the server side of the authorization code flow: building the
//! consent URL, exchanging the returned code, and refreshing access tokens.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use serde::Deserialize;

use super::client::UnauthorizedError;
use crate::config::GmailCredentials;
use crate::models::TokenSet;

/// OAuth2 client for the Google token endpoint
#[derive(Clone)]
pub struct GmailAuth {
    client_id: String,
    client_secret: String,
}

/// Token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

impl GmailAuth {
    /// Gmail API OAuth2 endpoints
    const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    /// Read-only access is enough for ingestion
    pub const GMAIL_READONLY_SCOPE: &'static str =
        "https://www.googleapis.com/auth/gmail.readonly";

    /// Create a new GmailAuth instance
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
        }
    }

    pub fn from_credentials(creds: &GmailCredentials) -> Self {
        Self::new(creds.client_id.clone(), creds.client_secret.clone())
    }

    /// Build the consent URL the user is sent to.
    ///
    /// `access_type=offline` and `prompt=consent` make Google return a
    /// refresh token every time, which a long-lived grant depends on.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            Self::AUTH_URL,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(Self::GMAIL_READONLY_SCOPE),
            urlencoding::encode(state),
        )
    }

    /// Exchange an authorization code for a token set
    pub fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet> {
        let mut response = ureq::post(Self::TOKEN_URL)
            .send_form([
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ])
            .context("Failed to exchange authorization code")?;

        let token: TokenResponse = response
            .body_mut()
            .read_json()
            .context("Failed to parse token response")?;

        log::info!("[AUTH] Authorization code exchanged");
        Ok(TokenSet::from_expires_in(
            token.access_token,
            token.refresh_token,
            token.expires_in,
        ))
    }

    /// Refresh an access token using a refresh token
    ///
    /// Google usually omits the refresh token on refresh; the one passed in
    /// is carried over in that case.
    ///
    /// # Errors
    /// Returns `UnauthorizedError` when Google rejects the refresh token
    /// (`invalid_grant` arrives as HTTP 400).
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        let result = ureq::post(Self::TOKEN_URL).send_form([
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ]);

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(status @ (400 | 401 | 403))) => {
                return Err(UnauthorizedError { status }.into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to refresh access token")),
        };

        let token: TokenResponse = response
            .into_body()
            .read_json()
            .context("Failed to parse refresh token response")?;

        Ok(TokenSet::from_expires_in(
            token.access_token,
            token
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            token.expires_in,
        ))
    }
}
