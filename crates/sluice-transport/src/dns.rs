//! Shared DNS resolver construction.

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

/// Resolver from the system configuration, falling back to the library
/// defaults when `/etc/resolv.conf` (or the platform equivalent) is unusable.
pub fn system_resolver() -> TokioAsyncResolver {
    match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            tracing::debug!("system resolver config unavailable, using defaults: {e}");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    }
}
