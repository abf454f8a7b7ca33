//! Session layer: password hashing, token issuance, validation and login.

pub mod login;
pub mod password;
pub mod token;
pub mod validator;

pub use login::{LoginOutcome, LoginService};
pub use password::{PasswordHasher, Sha256Hasher};
pub use token::{fingerprint, IssuedSession, SessionClaims, TokenIssuer};
pub use validator::{check_role, SessionValidator, TokenStatus, ValidatedSession};
