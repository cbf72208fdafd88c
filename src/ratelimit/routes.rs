//! Path exclusion and route classification.

use super::policy::Category;

/// Paths that are never throttled: static assets, image transforms and the health check.
pub const EXCLUDED_PREFIXES: &[&str] = &["/_next/static", "/_next/image", "/favicon.ico", "/api/health"];

/// Prefix table for classification, checked in order. First match wins.
const CATEGORY_PREFIXES: &[(&str, Category)] = &[
    ("/api/auth", Category::Auth),
    ("/login", Category::Auth),
    ("/signup", Category::Auth),
    ("/reset-password", Category::Auth),
    ("/update-password", Category::Auth),
    ("/api/checkout", Category::Checkout),
    ("/api/orders", Category::Checkout),
    ("/checkout", Category::Checkout),
    ("/api/admin", Category::Admin),
    ("/admin", Category::Admin),
    ("/api/export", Category::Export),
    ("/api/", Category::Default),
];

/// Whether `path` bypasses throttling entirely.
pub fn is_excluded(path: &str) -> bool {
    EXCLUDED_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Map a request path to its throttling category.
///
/// Prefixes match on whole path segments, so `/administrator` is not an admin route.
pub fn classify(path: &str) -> Category {
    CATEGORY_PREFIXES
        .iter()
        .find(|(prefix, _)| matches_segment(path, prefix))
        .map(|(_, category)| *category)
        .unwrap_or(Category::Public)
}

fn matches_segment(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.is_empty() || rest.starts_with(['/', '?']),
        None => false,
    }
}
