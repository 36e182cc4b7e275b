// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session tokens.
//!
//! A caller exchanges the static access key for a compact HS512 token whose
//! claims are `{"iss": <issuer>, "sess_id": <id>}`. Issuing a token creates
//! the session; validating one checks the signature, the issuer and that the
//! session is still live.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::security::constant_time_eq;
use crate::session::{SessionError, SessionStore};
use crate::types::SessionId;

type HmacSha512 = Hmac<Sha512>;

/// Largest session id ever drawn.
pub const MAX_SESSION_ID: SessionId = 9_223_372_036_854_775;

const TOKEN_ALG: &str = "HS512";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access key rejected")]
    Forbidden,
    #[error("invalid token: {0}")]
    Unauthorized(&'static str),
    #[error("session {0} is gone")]
    Gone(SessionId),
    #[error("session id {0} collided with a live session")]
    Conflict(SessionId),
    #[error("signing key rejected")]
    SigningKey,
    #[error(transparent)]
    Storage(SessionError),
}

impl From<SessionError> for AuthError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Conflict(id) => Self::Conflict(id),
            other => Self::Storage(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sess_id: SessionId,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: Option<String>,
    sess_id: Option<SessionId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub session_id: SessionId,
}

pub struct Authenticator {
    access_key: String,
    signing_key: Vec<u8>,
    issuer: String,
    sessions: Arc<SessionStore>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(
        access_key: impl Into<String>,
        signing_key: impl AsRef<[u8]>,
        issuer: impl Into<String>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            signing_key: signing_key.as_ref().to_vec(),
            issuer: issuer.into(),
            sessions,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Exchange `supplied_key` for a token bound to a fresh session.
    ///
    /// A collision with a live session id is reported as
    /// [`AuthError::Conflict`]; there is no retry.
    pub fn issue(&self, supplied_key: &str) -> Result<IssuedToken, AuthError> {
        let candidate = rand::thread_rng().gen_range(0..=MAX_SESSION_ID);
        self.issue_with_candidate(supplied_key, candidate)
    }

    /// [`Authenticator::issue`] with a caller-chosen candidate id.
    pub fn issue_with_candidate(
        &self,
        supplied_key: &str,
        candidate: SessionId,
    ) -> Result<IssuedToken, AuthError> {
        if !constant_time_eq(supplied_key, &self.access_key) {
            tracing::warn!("Rejected token request with bad access key");
            return Err(AuthError::Forbidden);
        }

        self.sessions.create(candidate)?;
        let token = self.sign(&Claims {
            iss: self.issuer.clone(),
            sess_id: candidate,
        })?;
        Ok(IssuedToken {
            token,
            session_id: candidate,
        })
    }

    /// Session id of a valid token whose session is still live.
    pub fn validate(&self, token: &str) -> Result<SessionId, AuthError> {
        let claims = self.verify(token)?;
        if !self.sessions.exists(claims.sess_id)? {
            return Err(AuthError::Gone(claims.sess_id));
        }
        Ok(claims.sess_id)
    }

    fn mac(&self) -> Result<HmacSha512, AuthError> {
        HmacSha512::new_from_slice(&self.signing_key).map_err(|_| AuthError::SigningKey)
    }

    fn encode_part<T: Serialize>(value: &T) -> Result<String, AuthError> {
        let json = serde_json::to_vec(value).map_err(|_| AuthError::SigningKey)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = Header {
            alg: TOKEN_ALG.to_string(),
            typ: Some("JWT".to_string()),
        };
        let signing_input = format!("{}.{}", Self::encode_part(&header)?, Self::encode_part(claims)?);

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Check structure, algorithm, signature and claims. Does not touch the
    /// session store.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let Some((signing_input, signature)) = token.rsplit_once('.') else {
            return Err(AuthError::Unauthorized("malformed token"));
        };
        let Some((header, payload)) = signing_input.split_once('.') else {
            return Err(AuthError::Unauthorized("malformed token"));
        };
        if payload.contains('.') {
            return Err(AuthError::Unauthorized("malformed token"));
        }

        let header: Header = decode_part(header)?;
        if header.alg != TOKEN_ALG {
            return Err(AuthError::Unauthorized("unsupported algorithm"));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Unauthorized("malformed signature"))?;
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::Unauthorized("bad signature"))?;

        let raw: RawClaims = decode_part(payload)?;
        let (Some(iss), Some(sess_id)) = (raw.iss, raw.sess_id) else {
            return Err(AuthError::Unauthorized("missing claim"));
        };
        if iss != self.issuer {
            return Err(AuthError::Unauthorized("wrong issuer"));
        }
        Ok(Claims { iss, sess_id })
    }
}

fn decode_part<T: for<'de> Deserialize<'de>>(part: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| AuthError::Unauthorized("malformed token"))?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Unauthorized("malformed token"))
}
