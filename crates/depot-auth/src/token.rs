//! OIDC token validation
//!
//! Fetches the provider's JWKS through its discovery document, caches
//! decoding keys by `kid`, and refreshes on unknown kids with a minimum
//! inter-refresh interval. Tokens verify as RS256; `sub`, `exp`, and
//! `iat` are required claims.

use crate::Principal;
use depot_common::config::IdentityConfig;
use depot_common::{Error, Result};
use depot_reliability::{BreakerRegistry, CircuitBreaker};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Breaker name for identity-provider calls
pub const IDENTITY_DEPENDENCY: &str = "identity";

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

/// Claims Depot reads from an access token. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub realm_access: Option<RealmAccess>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// OIDC token validator with a kid-keyed JWKS cache
pub struct TokenValidator {
    config: IdentityConfig,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_refresh: RwLock<Option<Instant>>,
    breaker: CircuitBreaker,
}

impl TokenValidator {
    #[must_use]
    pub fn new(config: IdentityConfig, breakers: &BreakerRegistry) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            breaker: breakers.get(IDENTITY_DEPENDENCY),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Validate a bearer token and map its claims onto a [`Principal`]
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn validate(&self, token: &str) -> Result<Principal> {
        let header = decode_header(token)
            .map_err(|err| Error::token_invalid("malformed token header").with_source(err))?;
        if header.alg != Algorithm::RS256 {
            return Err(Error::token_invalid(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| Error::token_invalid("token header carries no kid"))?;

        let key = match self.cached_key(&kid) {
            Some(key) => key,
            None => {
                self.refresh_keys().await?;
                self.cached_key(&kid)
                    .ok_or_else(|| Error::token_invalid(format!("unknown signing key {kid}")))?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "sub", "iat"]);
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &key, &validation).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::token_expired("token is expired")
                }
                _ => Error::token_invalid("token validation failed").with_source(err),
            }
        })?;
        let claims = data.claims;

        // Not-yet-valid tokens fail even though iat is not checked by
        // the library
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if claims.iat > now {
            return Err(Error::token_invalid("token issued in the future")
                .with_detail("iat", claims.iat.to_string()));
        }

        debug!(sub = %claims.sub, "validated token");
        Ok(Principal {
            user_id: claims.sub,
            username: claims
                .preferred_username
                .unwrap_or_else(|| "unknown".to_string()),
            email: claims.email,
            roles: claims.realm_access.map(|r| r.roles).unwrap_or_default(),
            groups: claims.groups.unwrap_or_default(),
            anonymous: false,
        })
    }

    fn cached_key(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().get(kid).cloned()
    }

    /// Refresh the JWKS cache, rate-limited to avoid hammering the
    /// provider on floods of unknown-kid tokens
    async fn refresh_keys(&self) -> Result<()> {
        {
            let last = self.last_refresh.read();
            if last.is_some_and(|at| at.elapsed() < MIN_REFRESH_INTERVAL) {
                return Ok(());
            }
        }
        *self.last_refresh.write() = Some(Instant::now());

        let issuer = self.config.issuer_url.trim_end_matches('/').to_string();
        let discovery_url = format!("{issuer}/.well-known/openid-configuration");
        let http = self.http.clone();

        let jwks: JwksDocument = self
            .breaker
            .call(|| async move {
                let discovery: DiscoveryDocument = http
                    .get(&discovery_url)
                    .timeout(JWKS_FETCH_TIMEOUT)
                    .send()
                    .await
                    .map_err(|err| {
                        Error::service_unavailable("identity provider unreachable").with_source(err)
                    })?
                    .json()
                    .await
                    .map_err(|err| {
                        Error::service_unavailable("invalid discovery document").with_source(err)
                    })?;

                http.get(&discovery.jwks_uri)
                    .timeout(JWKS_FETCH_TIMEOUT)
                    .send()
                    .await
                    .map_err(|err| {
                        Error::service_unavailable("jwks endpoint unreachable").with_source(err)
                    })?
                    .json()
                    .await
                    .map_err(|err| {
                        Error::service_unavailable("invalid jwks document").with_source(err)
                    })
            })
            .await?;

        let mut keys = self.keys.write();
        keys.clear();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" || jwk.kid.is_empty() {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(err) => warn!(kid = %jwk.kid, error = %err, "skipping unparsable jwk"),
            }
        }
        debug!(keys = keys.len(), "refreshed jwks cache");
        Ok(())
    }

    /// Insert a decoding key directly (tests and static-key setups)
    pub fn install_key(&self, kid: impl Into<String>, key: DecodingKey) {
        self.keys.write().insert(kid.into(), key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::traits::PublicKeyParts;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use serde_json::json;

    struct TestIdp {
        encoding_key: EncodingKey,
        decoding_key: DecodingKey,
    }

    fn test_idp() -> TestIdp {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
        let public = RsaPublicKey::from(&private);

        let pem = private
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("encode pem");
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("encoding key");

        let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
        let decoding_key = DecodingKey::from_rsa_components(&n, &e).expect("decoding key");

        TestIdp {
            encoding_key,
            decoding_key,
        }
    }

    fn validator() -> TokenValidator {
        TokenValidator::new(IdentityConfig::default(), &BreakerRegistry::default())
    }

    fn issue(idp: &TestIdp, kid: &str, claims: serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        encode(&header, &claims, &idp.encoding_key).expect("sign token")
    }

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    #[tokio::test]
    async fn test_valid_token_maps_claims() {
        let idp = test_idp();
        let validator = validator();
        validator.install_key("k1", idp.decoding_key.clone());

        let token = issue(
            &idp,
            "k1",
            json!({
                "sub": "u1",
                "exp": now() + 600,
                "iat": now() - 10,
                "preferred_username": "alice",
                "email": "alice@example.com",
                "realm_access": {"roles": ["dev", "release"]},
                "groups": ["build"],
            }),
        );

        let principal = validator.validate(&token).await.unwrap();
        assert_eq!(principal.user_id, "u1");
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.roles, vec!["dev", "release"]);
        assert_eq!(principal.groups, vec!["build"]);
        assert!(!principal.anonymous);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let idp = test_idp();
        let validator = validator();
        validator.install_key("k1", idp.decoding_key.clone());

        let token = issue(
            &idp,
            "k1",
            json!({"sub": "u1", "exp": now() - 600, "iat": now() - 1200}),
        );
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.kind(), depot_common::ErrorKind::TokenExpired);
    }

    #[tokio::test]
    async fn test_future_iat_rejected() {
        let idp = test_idp();
        let validator = validator();
        validator.install_key("k1", idp.decoding_key.clone());

        let token = issue(
            &idp,
            "k1",
            json!({"sub": "u1", "exp": now() + 600, "iat": now() + 300}),
        );
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.kind(), depot_common::ErrorKind::TokenInvalid);
    }

    #[tokio::test]
    async fn test_missing_required_claims() {
        let idp = test_idp();
        let validator = validator();
        validator.install_key("k1", idp.decoding_key.clone());

        // No iat
        let token = issue(&idp, "k1", json!({"sub": "u1", "exp": now() + 600}));
        assert!(validator.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let signer = test_idp();
        let other = test_idp();
        let validator = validator();
        validator.install_key("k1", other.decoding_key.clone());

        let token = issue(
            &signer,
            "k1",
            json!({"sub": "u1", "exp": now() + 600, "iat": now()}),
        );
        let err = validator.validate(&token).await.unwrap_err();
        assert_eq!(err.kind(), depot_common::ErrorKind::TokenInvalid);
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let validator = validator();
        let err = validator.validate("not-a-jwt").await.unwrap_err();
        assert_eq!(err.kind(), depot_common::ErrorKind::TokenInvalid);
    }
}
