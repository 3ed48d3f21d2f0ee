//! Public keys embedded in DPoP proofs and their RFC 7638 thumbprints.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::dpop::DpopError;

/// Members that only a private JWK carries.
const PRIVATE_MEMBERS: &[&str] = &["d", "p", "q", "dp", "dq", "qi", "oth", "k"];

/// A public JWK as found in a DPoP proof header.
#[derive(Debug, Clone, Deserialize)]
pub struct ProofJwk {
    /// Key type: `EC`, `RSA` or `OKP`.
    pub kty: String,
    /// Curve for `EC` and `OKP` keys.
    #[serde(default)]
    pub crv: Option<String>,
    /// X coordinate (`EC`) or public key (`OKP`).
    #[serde(default)]
    pub x: Option<String>,
    /// Y coordinate (`EC`).
    #[serde(default)]
    pub y: Option<String>,
    /// Modulus (`RSA`).
    #[serde(default)]
    pub n: Option<String>,
    /// Exponent (`RSA`).
    #[serde(default)]
    pub e: Option<String>,
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

impl ProofJwk {
    /// Parses a JWK from a header value, rejecting private keys.
    ///
    /// # Errors
    ///
    /// Returns `MalformedJwk` if the value is not a JWK or carries private
    /// key members.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DpopError> {
        let jwk: Self = serde_json::from_value(value)
            .map_err(|e| DpopError::MalformedJwk(e.to_string()))?;
        if let Some(member) = PRIVATE_MEMBERS.iter().find(|m| jwk.other.contains_key(**m)) {
            return Err(DpopError::MalformedJwk(format!(
                "private member '{member}' present"
            )));
        }
        Ok(jwk)
    }

    /// Builds the verification key for `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedJwk` if the key does not match the algorithm or
    /// misses required members.
    pub fn decoding_key(&self, algorithm: Algorithm) -> Result<DecodingKey, DpopError> {
        let malformed = |reason: &str| DpopError::MalformedJwk(reason.to_string());
        match (self.kty.as_str(), algorithm) {
            ("EC", Algorithm::ES256 | Algorithm::ES384) => {
                let expected_crv = if algorithm == Algorithm::ES256 {
                    "P-256"
                } else {
                    "P-384"
                };
                if self.crv.as_deref() != Some(expected_crv) {
                    return Err(malformed("curve does not match alg"));
                }
                let (Some(x), Some(y)) = (&self.x, &self.y) else {
                    return Err(malformed("EC key is missing x or y"));
                };
                DecodingKey::from_ec_components(x, y).map_err(|e| malformed(&e.to_string()))
            }
            (
                "RSA",
                Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512,
            ) => {
                let (Some(n), Some(e)) = (&self.n, &self.e) else {
                    return Err(malformed("RSA key is missing n or e"));
                };
                DecodingKey::from_rsa_components(n, e).map_err(|e| malformed(&e.to_string()))
            }
            ("OKP", Algorithm::EdDSA) => {
                if self.crv.as_deref() != Some("Ed25519") {
                    return Err(malformed("unsupported OKP curve"));
                }
                let Some(x) = &self.x else {
                    return Err(malformed("OKP key is missing x"));
                };
                DecodingKey::from_ed_components(x).map_err(|e| malformed(&e.to_string()))
            }
            (kty, alg) => Err(DpopError::MalformedJwk(format!(
                "key type {kty} cannot verify {alg:?}"
            ))),
        }
    }
}

/// Computes the RFC 7638 SHA-256 thumbprint (`jkt`) of a public JWK.
///
/// The required members are serialized in lexicographic order without
/// whitespace.
///
/// # Errors
///
/// Returns `MalformedJwk` if a required member is missing or the key type is
/// unsupported.
pub fn jwk_thumbprint(jwk: &ProofJwk) -> Result<String, DpopError> {
    let member = |value: &Option<String>, name: &str| {
        value
            .as_deref()
            .map(json_string)
            .ok_or_else(|| DpopError::MalformedJwk(format!("missing '{name}'")))
    };

    let canonical = match jwk.kty.as_str() {
        "EC" => format!(
            r#"{{"crv":{},"kty":"EC","x":{},"y":{}}}"#,
            member(&jwk.crv, "crv")?,
            member(&jwk.x, "x")?,
            member(&jwk.y, "y")?
        ),
        "RSA" => format!(
            r#"{{"e":{},"kty":"RSA","n":{}}}"#,
            member(&jwk.e, "e")?,
            member(&jwk.n, "n")?
        ),
        "OKP" => format!(
            r#"{{"crv":{},"kty":"OKP","x":{}}}"#,
            member(&jwk.crv, "crv")?,
            member(&jwk.x, "x")?
        ),
        other => {
            return Err(DpopError::MalformedJwk(format!(
                "unsupported key type {other}"
            )));
        }
    };

    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
