//! Authentication Module
//! Mission: Gate API access with signed access/refresh tokens and RBAC

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod session;
pub mod unverified;

pub use api::AuthState;
pub use jwt::{SigningConfig, TokenError, TokenService};
pub use middleware::{current_principal, optional_auth, require_admin, require_auth, GateStage};
pub use models::{Principal, Role};
pub use session::{CredentialVerifier, PrincipalDirectory, SessionService};
