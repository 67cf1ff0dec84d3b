use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;

use super::claims::{RawClaims, RequiredClaim, SessionClaims};
use super::error::AuthError;
use crate::config::{AuthorizationConfig, KeyMaterial};

#[derive(Debug, Error)]
pub enum KeySetupError {
    #[error("algorithm {algorithm:?} requires {expected}")]
    KeyKindMismatch {
        algorithm: Algorithm,
        expected: &'static str,
    },
    #[error("invalid key material for {algorithm:?}: {source}")]
    InvalidKey {
        algorithm: Algorithm,
        source: jsonwebtoken::errors::Error,
    },
}

/// Session token verifier.
///
/// The accepted algorithm is pinned by configuration; a token whose header names any
/// other algorithm is rejected before its signature is looked at.
/// Key material is intentionally not printable via Debug.
#[derive(Clone)]
pub struct TokenValidator {
    algorithm: Algorithm,
    decoding_key: DecodingKey,
    validation: Validation,
    required_claims: Vec<RequiredClaim>,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Do not print key material
        f.debug_struct("TokenValidator")
            .field("algorithm", &self.algorithm)
            .field("validation", &self.validation)
            .field("required_claims", &self.required_claims)
            .finish()
    }
}

fn decoding_key(algorithm: Algorithm, key: &KeyMaterial) -> Result<DecodingKey, KeySetupError> {
    let invalid = |source| KeySetupError::InvalidKey { algorithm, source };

    match (algorithm, key) {
        (Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512, KeyMaterial::Secret(secret)) => {
            Ok(DecodingKey::from_secret(secret.as_bytes()))
        }
        (Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512, _) => {
            Err(KeySetupError::KeyKindMismatch {
                algorithm,
                expected: "a shared secret",
            })
        }
        (_, KeyMaterial::Secret(_)) => Err(KeySetupError::KeyKindMismatch {
            algorithm,
            expected: "a PEM public key",
        }),
        (
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512,
            KeyMaterial::PublicKeyPem(pem),
        ) => DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(invalid),
        (Algorithm::ES256 | Algorithm::ES384, KeyMaterial::PublicKeyPem(pem)) => {
            DecodingKey::from_ec_pem(pem.as_bytes()).map_err(invalid)
        }
        (Algorithm::EdDSA, KeyMaterial::PublicKeyPem(pem)) => {
            DecodingKey::from_ed_pem(pem.as_bytes()).map_err(invalid)
        }
        #[allow(unreachable_patterns)]
        (_, KeyMaterial::PublicKeyPem(_)) => Err(KeySetupError::KeyKindMismatch {
            algorithm,
            expected: "a supported signature algorithm",
        }),
    }
}

impl TokenValidator {
    pub fn new(config: &AuthorizationConfig) -> Result<Self, KeySetupError> {
        let decoding_key = decoding_key(config.algorithm, &config.key)?;

        let mut validation = Validation::new(config.algorithm);
        validation.leeway = config.clock_skew.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            algorithm: config.algorithm,
            decoding_key,
            validation,
            required_claims: config.required_claims.clone(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Verify signature, algorithm, time window and required claims.
    pub fn validate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let header = jsonwebtoken::decode_header(token).map_err(|err| {
            tracing::debug!(error = ?err, "undecodable token header");
            AuthError::InvalidToken
        })?;
        if header.alg != self.algorithm {
            tracing::warn!(
                expected = ?self.algorithm,
                received = ?header.alg,
                "token algorithm mismatch"
            );
            return Err(AuthError::InvalidToken);
        }

        let data = jsonwebtoken::decode::<RawClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::ImmatureSignature => AuthError::TokenNotYetValid,
                ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
                _ => {
                    tracing::debug!(error = ?err, "token verification failed");
                    AuthError::InvalidToken
                }
            })?;

        let claims = SessionClaims::from_raw(data.claims)
            .ok_or_else(|| AuthError::MissingClaim(RequiredClaim::UserId.to_string()))?;

        if let Some(missing) = self
            .required_claims
            .iter()
            .find(|required| !required.is_present(&claims))
        {
            return Err(AuthError::MissingClaim(missing.to_string()));
        }

        Ok(claims)
    }
}
