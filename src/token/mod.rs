//! Signed bearer tokens (compact JWS, ES512).

mod claims;

pub use claims::{Claims, GRANT, SESSION};

use std::{fs, path::Path, time::Duration};

use axum::http::{header, HeaderMap};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use p521::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    PublicKey, SecretKey,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Cookie carrying the session token for browsers.
pub const COOKIE_NAME: &str = "warden_token";

/// Tokens expiring within this window should be refreshed.
pub const EXPIRING_SOON: Duration = Duration::from_secs(10 * 60);

const ALG: &str = "ES512";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: String,
    typ: String,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|err| Error::internal(format!("Could not encode token: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Option<T> {
    let bytes = Base64UrlUnpadded::decode_vec(s).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn invalid() -> Error {
    Error::unauthorized("Token is invalid")
}

fn read_pem(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|err| {
        Error::internal(format!("Could not read JWT {what} key {}: {err}", path.display()))
    })
}

/// Issues and validates tokens with one P-521 key pair.
pub struct TokenService {
    issuer: String,
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    #[must_use]
    pub fn new(issuer: impl Into<String>, signing: SigningKey, verifying: VerifyingKey) -> Self {
        Self {
            issuer: issuer.into(),
            signing,
            verifying,
        }
    }

    /// A service with a fresh random key, for tools and tests.
    #[must_use]
    pub fn ephemeral(issuer: impl Into<String>) -> Self {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let verifying = VerifyingKey::from(&signing);
        Self::new(issuer, signing, verifying)
    }

    /// Loads the key pair named by `config`. Without a public key file the
    /// verifying key is derived from the private key.
    ///
    /// # Errors
    /// `Internal` for unreadable or unparsable key material.
    #[instrument(skip_all)]
    pub fn load(config: &Config) -> Result<Self> {
        let pem = read_pem(config.jwt_private_key(), "private")?;
        let secret = SecretKey::from_pkcs8_pem(&pem)
            .or_else(|_| SecretKey::from_sec1_pem(&pem))
            .map_err(|err| Error::internal(format!("Could not parse JWT private key: {err}")))?;
        let signing = SigningKey::from_bytes(&secret.to_bytes())
            .map_err(|err| Error::internal(format!("Unusable JWT private key: {err}")))?;

        let verifying = match config.jwt_public_key() {
            Some(path) => {
                let pem = read_pem(path, "public")?;
                let public = PublicKey::from_public_key_pem(&pem).map_err(|err| {
                    Error::internal(format!("Could not parse JWT public key: {err}"))
                })?;
                VerifyingKey::from_affine(*public.as_affine())
                    .map_err(|err| Error::internal(format!("Unusable JWT public key: {err}")))?
            }
            None => VerifyingKey::from(&signing),
        };

        Ok(Self::new(config.app_name(), signing, verifying))
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Signs `claims` valid for `ttl` from now; issuer and times are set here.
    ///
    /// # Errors
    /// `Internal` when the claims cannot be encoded.
    pub fn issue(&self, mut claims: Claims, ttl: Duration) -> Result<String> {
        let now = Utc::now().timestamp();
        claims.iss.clone_from(&self.issuer);
        claims.iat = now;
        claims.exp = now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);

        let header = Header {
            alg: ALG.to_string(),
            typ: "JWT".to_string(),
        };
        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(&claims)?);
        let signature: Signature = self.signing.sign(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Validates `token` and returns its claims and whether it expires soon.
    ///
    /// Revocation is not consulted here, see [`crate::Core::parse_token`].
    ///
    /// # Errors
    /// `Unauthorized` for malformed, forged, not yet valid, expired or
    /// wrong-audience tokens.
    pub fn parse(&self, token: &str, expected_aud: Option<&str>) -> Result<(Claims, bool)> {
        let mut parts = token.trim().split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::unauthorized("Token does not even look like a token"));
        };

        let header: Header = b64d_json(header_b64).ok_or_else(invalid)?;
        if header.alg != ALG {
            debug!("Rejecting token with algorithm {}", header.alg);
            return Err(invalid());
        }

        let sig_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| invalid())?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| invalid())?;
        let signing_input = format!("{header_b64}.{claims_b64}");
        self.verifying
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| invalid())?;

        let claims: Claims = b64d_json(claims_b64).ok_or_else(invalid)?;
        let now = Utc::now().timestamp();

        if claims.nbf.is_some_and(|nbf| nbf > now) || claims.iat > now {
            return Err(Error::unauthorized("Token not active yet"));
        }

        if claims.exp <= now {
            return Err(Error::unauthorized("Token expired"));
        }

        if let Some(aud) = expected_aud {
            if claims.aud != aud {
                return Err(Error::unauthorized(format!("Token is not a {aud} token")));
            }
        }

        let soon = i64::try_from(EXPIRING_SOON.as_secs()).unwrap_or(i64::MAX);
        let expsoon = claims.exp - now < soon;
        Ok((claims, expsoon))
    }
}

/// `WWW-Authenticate` value handing a refreshed token to the client.
#[must_use]
pub fn refresh_challenge(realm: &str, token: &str) -> String {
    format!("Bearer realm=\"{realm}\", access_token=\"{token}\"")
}

/// Picks the token out of a challenge produced by [`refresh_challenge`].
#[must_use]
pub fn token_from_challenge(value: &str) -> Option<&str> {
    let start = value.find("access_token=\"")? + "access_token=\"".len();
    let rest = &value[start..];
    let end = rest.find('"')?;
    Some(&rest[..end]).filter(|t| !t.is_empty())
}

/// The bearer token of a request, from `Authorization` or the session cookie.
#[must_use]
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        })
        .filter(|t| !t.is_empty());

    if from_header.is_some() {
        return from_header;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|kv| kv.trim().split_once('='))
        .find(|(k, _)| *k == COOKIE_NAME)
        .map(|(_, v)| v.to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn issue_and_parse() {
        let svc = TokenService::ephemeral("Warden");
        let token = svc
            .issue(Claims::session("alice", "Alice", true), Duration::from_secs(1200))
            .unwrap();

        let (claims, soon) = svc.parse(&token, Some(SESSION)).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.iss, "Warden");
        assert!(claims.is_sysadmin());
        assert!(!soon);

        let err = svc.parse(&token, Some(GRANT)).unwrap_err();
        assert_eq!(err.to_string(), "Token is not a authorization_grant token");
    }

    #[test]
    fn expiring_soon() {
        let svc = TokenService::ephemeral("Warden");
        let token = svc
            .issue(Claims::session("alice", "Alice", false), Duration::from_secs(300))
            .unwrap();
        let (_, soon) = svc.parse(&token, None).unwrap();
        assert!(soon);
    }

    #[test]
    fn expired_token() {
        let svc = TokenService::ephemeral("Warden");
        let token = svc
            .issue(Claims::session("alice", "Alice", false), Duration::ZERO)
            .unwrap();
        assert_eq!(svc.parse(&token, None).unwrap_err().to_string(), "Token expired");
    }

    #[test]
    fn foreign_key_is_rejected() {
        let ours = TokenService::ephemeral("Warden");
        let theirs = TokenService::ephemeral("Warden");
        let token = theirs
            .issue(Claims::session("mallory", "", true), Duration::from_secs(600))
            .unwrap();
        assert_eq!(ours.parse(&token, None).unwrap_err().to_string(), "Token is invalid");
    }

    #[test]
    fn garbage_and_wrong_algorithm() {
        let svc = TokenService::ephemeral("Warden");
        assert_eq!(
            svc.parse("nope", None).unwrap_err().to_string(),
            "Token does not even look like a token"
        );

        let token = svc
            .issue(Claims::session("alice", "", false), Duration::from_secs(600))
            .unwrap();
        let rest = token.split_once('.').unwrap().1;
        let none_header = Base64UrlUnpadded::encode_string(br#"{"alg":"none","typ":"JWT"}"#);
        let forged = format!("{none_header}.{rest}");
        assert_eq!(svc.parse(&forged, None).unwrap_err().to_string(), "Token is invalid");
    }

    #[test]
    fn challenge_roundtrip() {
        let value = refresh_challenge("Warden", "abc.def.ghi");
        assert_eq!(value, "Bearer realm=\"Warden\", access_token=\"abc.def.ghi\"");
        assert_eq!(token_from_challenge(&value), Some("abc.def.ghi"));
        assert_eq!(token_from_challenge("Basic realm=\"x\""), None);
    }

    #[test]
    fn bearer_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(header::COOKIE, HeaderValue::from_static("a=1; warden_token=tok1"));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("tok1"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok2"));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("tok2"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("tok1"));
    }
}
