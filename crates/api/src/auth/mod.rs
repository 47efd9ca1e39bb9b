//! Authentication module for Certiva

pub mod jwt;
pub mod middleware;

pub use jwt::{JwtError, JwtManager, SessionClaims};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
