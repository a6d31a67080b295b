use std::time::Duration;

/// Default budget for the spawn readiness probe (§4.6 step 5: "MUST be finite").
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a single TCP-connect attempt in the readiness probe is allowed to take.
pub const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay between readiness probe retries.
pub const READINESS_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period between SIGTERM and SIGKILL when stopping a spawned process.
pub const SPAWN_STOP_GRACE: Duration = Duration::from_secs(5);

/// Entropy, in raw bytes, behind every minted token (192 bits, comfortably over
/// the 128-bit floor the token mint contract requires).
pub const TOKEN_BYTES: usize = 24;

/// PAM service name used by the reference authenticator when none is configured.
pub const DEFAULT_PAM_SERVICE: &str = "login";

/// Name of the cookie the hub itself issues, absent an explicit configuration.
pub const DEFAULT_HUB_COOKIE_NAME: &str = "hub-token";
