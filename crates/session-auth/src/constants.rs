//! Dashboard API auth endpoints and defaults
//!
//! Paths are relative to the API base URL the transport was built with.

/// Exchanges a refresh token for a new credential pair
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Password login, answers with the same token shape as refresh
pub const LOGIN_PATH: &str = "/auth/login";

/// Server-side session teardown (best effort)
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Default credential file name when none is configured
pub const DEFAULT_CREDENTIAL_FILE: &str = "credentials.json";

/// Deadline for auth endpoint calls when the caller sets none
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;
