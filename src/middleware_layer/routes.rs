/// The protection class of a request path.
///
/// Classification is by longest-prefix semantics over a fixed table; the
/// first matching class below wins, checked in the order public, auth API,
/// admin, step-up, protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// No session required.
    Public,
    /// No session required, but throttled per client IP before the handler
    /// runs its own checks.
    AuthApi,
    /// Requires a valid session.
    Protected,
    /// Requires a valid session with the admin role.
    Admin,
    /// Requires a valid session plus a completed second-factor step.
    Mfa,
}

/// Paths reachable without a session.
const PUBLIC_PREFIXES: &[&str] = &["/auth", "/health", "/assets"];

/// Credential-bearing endpoints that must stay reachable without a session
/// so sign-in is possible at all.
const AUTH_API_PATHS: &[&str] = &[
    "/api/auth/login",
    "/api/auth/signup",
    "/api/auth/password-reset",
    "/api/mfa/verify",
];

const ADMIN_PREFIXES: &[&str] = &["/admin", "/api/admin"];

/// Sensitive areas gated behind a completed second factor.
const MFA_PREFIXES: &[&str] = &["/billing", "/api/billing", "/settings/security"];

/// True when `path` is `prefix` itself or a descendant of it. Plain
/// `starts_with` would let `/authx` impersonate `/auth`.
fn under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Classifies a request path.
pub fn classify(path: &str) -> RouteClass {
    if path == "/" || PUBLIC_PREFIXES.iter().any(|p| under(path, p)) {
        return RouteClass::Public;
    }
    if AUTH_API_PATHS.iter().any(|p| under(path, p)) {
        return RouteClass::AuthApi;
    }
    if ADMIN_PREFIXES.iter().any(|p| under(path, p)) {
        return RouteClass::Admin;
    }
    if MFA_PREFIXES.iter().any(|p| under(path, p)) {
        return RouteClass::Mfa;
    }
    RouteClass::Protected
}

/// Whether the path is an API endpoint, which changes how denials are
/// rendered (JSON status instead of a login redirect).
pub fn is_api_path(path: &str) -> bool {
    under(path, "/api")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_route_table() {
        let cases = [
            ("/", RouteClass::Public),
            ("/auth", RouteClass::Public),
            ("/auth/mfa", RouteClass::Public),
            ("/health", RouteClass::Public),
            ("/assets/logo.svg", RouteClass::Public),
            ("/api/auth/login", RouteClass::AuthApi),
            ("/api/auth/signup", RouteClass::AuthApi),
            ("/api/auth/password-reset", RouteClass::AuthApi),
            ("/api/mfa/verify", RouteClass::AuthApi),
            ("/admin", RouteClass::Admin),
            ("/admin/users", RouteClass::Admin),
            ("/api/admin/rate-limits", RouteClass::Admin),
            ("/billing", RouteClass::Mfa),
            ("/api/billing/invoices", RouteClass::Mfa),
            ("/settings/security", RouteClass::Mfa),
            ("/dashboard", RouteClass::Protected),
            ("/api/sessions", RouteClass::Protected),
            ("/settings", RouteClass::Protected),
        ];
        for (path, expected) in cases {
            assert_eq!(classify(path), expected, "path {path}");
        }
    }

    #[test]
    fn prefix_match_is_segment_aware() {
        // Similar-looking paths must not inherit a class.
        assert_eq!(classify("/authx"), RouteClass::Protected);
        assert_eq!(classify("/administrator"), RouteClass::Protected);
        assert_eq!(classify("/billings"), RouteClass::Protected);
        assert_eq!(classify("/api/auth/login-history"), RouteClass::Protected);
    }

    #[test]
    fn api_paths_are_detected() {
        assert!(is_api_path("/api/sessions"));
        assert!(is_api_path("/api"));
        assert!(!is_api_path("/apix"));
        assert!(!is_api_path("/dashboard"));
    }
}
