//! Inbound request shape and gate decisions.

use crate::config::GateConfig;
use crate::model::Role;
use crate::ModwardenError;

/// Header carrying `Bearer <token>`.
pub const AUTHORIZATION: &str = "Authorization";

/// Header carrying the claimed identity.
pub const USER_NAME: &str = "UserName";

/// The parts of an HTTP request the gate looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    path: String,
    source_address: String,
    headers: Vec<(String, String)>,
}

impl InboundRequest {
    /// Request for `path` from `source_address`, without headers.
    pub fn new(path: impl Into<String>, source_address: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source_address: source_address.into(),
            headers: Vec::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add `Authorization: Bearer <token>` and `UserName: <identity>`.
    pub fn with_credentials(self, token: &str, identity: &str) -> Self {
        self.with_header(AUTHORIZATION, format!("Bearer {}", token))
            .with_header(USER_NAME, identity)
    }

    /// Request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Peer address.
    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    /// First header value with a case-insensitive name match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the path can be routed at all.
    ///
    /// Paths are matched by prefix without normalization, so `.` and `..`
    /// segments (plain or percent-encoded) are refused outright.
    pub fn has_routable_path(&self) -> bool {
        self.path.starts_with('/')
            && !self
                .path
                .chars()
                .any(|c| c.is_whitespace() || c.is_control())
            && !self.path.split('/').any(is_dot_segment)
    }

    /// Extract the bearer token and identity.
    ///
    /// # Errors
    /// `MissingCredentials` if either header is absent, empty or malformed.
    pub fn credentials(&self) -> Result<Credentials, ModwardenError> {
        let token = self
            .header(AUTHORIZATION)
            .and_then(parse_bearer)
            .ok_or(ModwardenError::MissingCredentials)?;

        let identity = self
            .header(USER_NAME)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ModwardenError::MissingCredentials)?;

        Ok(Credentials {
            token: token.to_string(),
            identity: identity.to_string(),
        })
    }
}

fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    if token.chars().any(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Token and claimed identity from a guarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Presented session token.
    pub token: String,
    /// Claimed login.
    pub identity: String,
}

/// How the gate treats a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Address-limited only; no session needed.
    Exempt,
    /// Identity-limited and session-validated.
    Guarded,
    /// Guarded, and the identity must hold the admin role.
    Admin,
}

impl PathClass {
    /// Role the session must hold, if any.
    pub fn required_role(&self) -> Option<Role> {
        match self {
            PathClass::Admin => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Classify `path` against the configured prefix lists.
pub fn classify(path: &str, config: &GateConfig) -> PathClass {
    if config
        .exempt_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
        PathClass::Exempt
    } else if path.starts_with(config.admin_prefix.as_str()) {
        PathClass::Admin
    } else {
        PathClass::Guarded
    }
}

/// A request cleared to reach business logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedRequest {
    /// The original request.
    pub request: InboundRequest,
    /// Validated identity; `None` on exempt paths.
    pub identity: Option<String>,
    /// Role of the validated identity; `None` on exempt paths.
    pub role: Option<Role>,
}

/// A response produced by the gate itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResponse {
    /// HTTP status code.
    pub status: u16,
    /// Short plain-text body.
    pub body: String,
    /// Seconds until a retry may succeed (429/503 only).
    pub retry_after_secs: Option<u64>,
}

impl GateResponse {
    /// Render an error as a client-facing response.
    pub fn from_error(error: &ModwardenError) -> Self {
        let retry_after_secs = match error {
            ModwardenError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            ModwardenError::QueueFull => Some(1),
            _ => None,
        };
        Self {
            status: error.status_code(),
            body: error.public_message(),
            retry_after_secs,
        }
    }
}

/// Result of [`crate::Gateway::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Pass the request on to business logic.
    Forward(AdmittedRequest),
    /// Answer directly with this response.
    Respond(GateResponse),
}

impl GateDecision {
    /// Direct response for an error.
    pub fn deny(error: &ModwardenError) -> Self {
        GateDecision::Respond(GateResponse::from_error(error))
    }

    /// Whether the request was forwarded.
    pub fn is_forward(&self) -> bool {
        matches!(self, GateDecision::Forward(_))
    }

    /// Status of a direct response; `None` when forwarded.
    pub fn status(&self) -> Option<u16> {
        match self {
            GateDecision::Forward(_) => None,
            GateDecision::Respond(r) => Some(r.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_extracted() {
        let req = InboundRequest::new("/api/servers", "10.0.0.1").with_credentials("abc", "alice");
        let creds = req.credentials().unwrap();
        assert_eq!(creds.token, "abc");
        assert_eq!(creds.identity, "alice");
    }

    #[test]
    fn test_header_names_case_insensitive() {
        let req = InboundRequest::new("/x", "10.0.0.1")
            .with_header("authorization", "bearer abc")
            .with_header("username", "alice");
        assert!(req.credentials().is_ok());
    }

    #[test]
    fn test_missing_identity() {
        let req = InboundRequest::new("/x", "10.0.0.1").with_header(AUTHORIZATION, "Bearer abc");
        assert!(matches!(
            req.credentials(),
            Err(ModwardenError::MissingCredentials)
        ));
    }

    #[test]
    fn test_missing_token() {
        let req = InboundRequest::new("/x", "10.0.0.1").with_header(USER_NAME, "alice");
        assert!(matches!(
            req.credentials(),
            Err(ModwardenError::MissingCredentials)
        ));
    }

    #[test]
    fn test_malformed_authorization() {
        for value in ["abc", "Basic abc", "Bearer ", "Bearer a b"] {
            let req = InboundRequest::new("/x", "10.0.0.1")
                .with_header(AUTHORIZATION, value)
                .with_header(USER_NAME, "alice");
            assert!(req.credentials().is_err(), "accepted {:?}", value);
        }
    }

    #[test]
    fn test_blank_identity_rejected() {
        let req = InboundRequest::new("/x", "10.0.0.1").with_credentials("abc", "   ");
        assert!(req.credentials().is_err());
    }

    #[test]
    fn test_routable_path() {
        assert!(InboundRequest::new("/api/mods", "a").has_routable_path());
        assert!(InboundRequest::new("/api/mods/v1.2/..tar", "a").has_routable_path());
        assert!(!InboundRequest::new("", "a").has_routable_path());
        assert!(!InboundRequest::new("api/mods", "a").has_routable_path());
        assert!(!InboundRequest::new("/api/mo ds", "a").has_routable_path());
    }

    #[test]
    fn test_dot_segments_are_unroutable() {
        for path in [
            "/api/mods/public/../../api/admin/x",
            "/api/mods/public/./x",
            "/health/..",
            "/api/mods/public/%2e%2e/%2E%2E/api/admin",
            "/api/check/.%2e/admin",
        ] {
            assert!(
                !InboundRequest::new(path, "a").has_routable_path(),
                "{} was routable",
                path
            );
        }
    }

    #[test]
    fn test_classify() {
        let config = GateConfig::default();
        assert_eq!(classify("/api/auth/login", &config), PathClass::Exempt);
        assert_eq!(classify("/health", &config), PathClass::Exempt);
        assert_eq!(classify("/api/mods/public/3", &config), PathClass::Exempt);
        assert_eq!(classify("/api/admin/users", &config), PathClass::Admin);
        assert_eq!(classify("/api/server/private", &config), PathClass::Guarded);
    }

    #[test]
    fn test_required_role() {
        assert_eq!(PathClass::Admin.required_role(), Some(Role::Admin));
        assert_eq!(PathClass::Guarded.required_role(), None);
    }

    #[test]
    fn test_response_from_rate_limit() {
        let resp = GateResponse::from_error(&ModwardenError::RateLimited {
            retry_after_secs: 30,
        });
        assert_eq!(resp.status, 429);
        assert_eq!(resp.retry_after_secs, Some(30));
    }

    #[test]
    fn test_auth_denials_are_uniform() {
        let a = GateResponse::from_error(&ModwardenError::AuthDenied);
        assert_eq!(a.status, 401);
        assert_eq!(a.body, "Unauthorized.");
    }
}
