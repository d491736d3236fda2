//! Caller authentication and the request interceptor.

pub mod authenticator;
pub mod dpop;
pub mod interceptor;
pub mod roles;
pub mod routes;
pub mod token;

pub use authenticator::{AuthContext, Authenticator, RequestParts, UserInfoEnricher};
pub use dpop::{DpopError, DpopValidator, ProofTarget, ValidatedProof};
pub use interceptor::{Interceptor, access_middleware};
pub use roles::{ClaimsRoleProvider, RoleProvider, RoleProviderRegistry, StaticRoleProvider};
pub use routes::RouteSet;
pub use token::{AccessToken, RawToken, TokenType, TokenVerifier};
