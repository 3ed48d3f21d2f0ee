//! DPoP proof validation (RFC 9449).

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Validation, decode};
use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use crate::config::DpopConfig;
use crate::dpop::DpopError;
use crate::dpop::thumbprint::{ProofJwk, jwk_thumbprint};
use crate::storage::JtiStorage;

/// Media type a proof must declare in `typ`.
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

const MAX_JTI_LENGTH: usize = 256;

/// A validated DPoP proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpopProof {
    /// Thumbprint of the proof key.
    pub jkt: String,
    /// Proof identifier.
    pub jti: String,
    /// Issue time (Unix seconds).
    pub iat: i64,
}

#[derive(Debug, Deserialize)]
struct ProofHeader {
    #[serde(default)]
    typ: Option<String>,
    alg: String,
    #[serde(default)]
    jwk: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
}

/// Validates DPoP proofs presented to the token endpoint.
pub struct DpopValidator {
    jti_storage: Arc<dyn JtiStorage>,
    max_age: Duration,
    clock_skew: Duration,
}

impl DpopValidator {
    /// Creates a validator recording proof JTIs in `jti_storage`.
    pub fn new(jti_storage: Arc<dyn JtiStorage>, max_age: Duration, clock_skew: Duration) -> Self {
        Self {
            jti_storage,
            max_age,
            clock_skew,
        }
    }

    /// Creates a validator from configuration.
    pub fn from_config(jti_storage: Arc<dyn JtiStorage>, config: &DpopConfig) -> Self {
        Self::new(jti_storage, config.max_age, config.clock_skew)
    }

    /// Validates `proof` for a request by `client_id` to `method` `url`.
    ///
    /// The proof's `jti` is recorded only after every other check passed, so
    /// a rejected proof does not burn its identifier.
    ///
    /// # Errors
    ///
    /// Returns a [`DpopError`] describing the first failed check. Storage
    /// failures surface as [`DpopError::Storage`].
    pub async fn validate(
        &self,
        proof: &str,
        client_id: &str,
        method: &str,
        url: &str,
    ) -> Result<DpopProof, DpopError> {
        let header = parse_header(proof)?;
        if header.typ.as_deref() != Some(DPOP_JWT_TYPE) {
            return Err(DpopError::Malformed(format!(
                "typ must be {DPOP_JWT_TYPE}"
            )));
        }
        let algorithm = proof_algorithm(&header.alg)?;
        let jwk = ProofJwk::from_value(
            header
                .jwk
                .ok_or_else(|| DpopError::MalformedJwk("missing jwk header".to_string()))?,
        )?;
        let key = jwk.decoding_key(algorithm)?;

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let claims = decode::<ProofClaims>(proof, &key, &validation)
            .map_err(|e| DpopError::InvalidSignature(e.to_string()))?
            .claims;

        if claims.htm != method {
            return Err(DpopError::MethodMismatch {
                expected: method.to_string(),
                actual: claims.htm,
            });
        }
        if normalize_htu(&claims.htu)? != normalize_htu(url)? {
            return Err(DpopError::UrlMismatch {
                expected: url.to_string(),
                actual: claims.htu,
            });
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if claims.iat > now + self.clock_skew.as_secs() as i64 {
            return Err(DpopError::IssuedInFuture);
        }
        if now - claims.iat > self.max_age.as_secs() as i64 {
            return Err(DpopError::Expired);
        }

        if claims.jti.is_empty() || claims.jti.len() > MAX_JTI_LENGTH {
            return Err(DpopError::Malformed("jti is empty or too long".to_string()));
        }

        let jkt = jwk_thumbprint(&jwk)?;

        let retain_until = OffsetDateTime::from_unix_timestamp(claims.iat)
            .map_err(|_| DpopError::Malformed("iat out of range".to_string()))?
            + self.max_age
            + self.clock_skew;
        let key = format!("dpop:{client_id}:{}", claims.jti);
        if !self.jti_storage.mark_used(&key, retain_until).await? {
            tracing::warn!(
                client_id = %client_id,
                jti = %claims.jti,
                jkt = %jkt,
                "DPoP proof replay detected"
            );
            return Err(DpopError::Replay { jti: claims.jti });
        }

        Ok(DpopProof {
            jkt,
            jti: claims.jti,
            iat: claims.iat,
        })
    }
}

fn parse_header(proof: &str) -> Result<ProofHeader, DpopError> {
    let mut segments = proof.split('.');
    let (Some(header), Some(_), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(DpopError::Malformed("not a compact JWS".to_string()));
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| DpopError::Malformed(format!("header encoding: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| DpopError::Malformed(format!("header: {e}")))
}

/// Asymmetric algorithms accepted for proofs. `none` and HMAC are refused.
fn proof_algorithm(alg: &str) -> Result<Algorithm, DpopError> {
    match alg {
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "PS256" => Ok(Algorithm::PS256),
        "PS384" => Ok(Algorithm::PS384),
        "PS512" => Ok(Algorithm::PS512),
        "EdDSA" => Ok(Algorithm::EdDSA),
        other => Err(DpopError::UnsupportedAlgorithm(other.to_string())),
    }
}

/// Reduces a URL to scheme, host, port and path. Default ports are dropped.
fn normalize_htu(value: &str) -> Result<String, DpopError> {
    let url = Url::parse(value).map_err(|e| DpopError::Malformed(format!("htu: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| DpopError::Malformed("htu has no host".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}{}", url.scheme(), url.path()),
        None => format!("{}://{host}{}", url.scheme(), url.path()),
    })
}
