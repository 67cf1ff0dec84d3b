pub mod authorizer;
pub mod claims;
pub mod error;
pub mod extractor;
pub mod policy;
pub mod revocation;
pub mod validator;

pub use authorizer::Authorizer;
pub use claims::{RequiredClaim, SessionClaims, UserContext};
pub use error::AuthError;
pub use extractor::TokenExtractor;
pub use policy::{
    AuthorizationPolicy, CombinationLogic, CustomPolicy, PolicyDecision, PolicyError,
    PolicyEvaluator, PolicyType,
};
pub use revocation::{RevocationChecker, RevocationError, RevocationService, StaticRevocationList};
pub use validator::{KeySetupError, TokenValidator};
