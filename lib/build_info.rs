/// Build identity reported by `--version`, the bootstrap log line, and `/metrics`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("LEDGER_WORKER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("LEDGER_WORKER_GIT_COMMIT_HASH")
);

/// Returns at most 12 characters of the commit hash, or `"unknown"` when git was unavailable.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }

    &GIT_COMMIT_HASH[..GIT_COMMIT_HASH.len().min(12)]
}
