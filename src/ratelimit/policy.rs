//! Route categories and the policy table.
//!
//! Every inbound request path belongs to one [`Category`], and every category has exactly
//! one [`RateLimitPolicy`]. The table is fixed at build time; changing a limit means
//! redeploying.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// A logical grouping of routes sharing one throttling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Public storefront pages and catalog reads
    Public,
    /// Login, signup and password flows
    Auth,
    /// Order placement and payment
    Checkout,
    /// Back-office consoles
    Admin,
    /// Bulk data exports
    Export,
    /// Anything not classified otherwise
    Default,
}

impl Category {
    /// All categories, in table order.
    pub const ALL: [Category; 6] = [
        Category::Public,
        Category::Auth,
        Category::Checkout,
        Category::Admin,
        Category::Export,
        Category::Default,
    ];

    /// The lowercase name used in counter keys and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Public => "public",
            Category::Auth => "auth",
            Category::Checkout => "checkout",
            Category::Admin => "admin",
            Category::Export => "export",
            Category::Default => "default",
        }
    }

    /// Lenient lookup for dynamic call sites: unknown names map to [`Category::Default`].
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(Category::Default)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TollgateError::Config(format!("unknown rate limit category: {}", s)))
    }
}

/// An immutable limit/window pair for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// The category this policy applies to
    pub category: Category,
    /// Maximum requests admitted per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Human-readable description
    pub description: String,
}

impl RateLimitPolicy {
    /// Create a new policy.
    pub fn new(category: Category, limit: u64, window_seconds: u64, description: &str) -> Self {
        Self {
            category,
            limit,
            window_seconds,
            description: description.to_string(),
        }
    }

    /// The window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TollgateError::InvalidPolicy {
                category: self.category,
                reason: "limit must be greater than zero".to_string(),
            });
        }
        if self.window_seconds == 0 {
            return Err(TollgateError::InvalidPolicy {
                category: self.category,
                reason: "window must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Static lookup table from [`Category`] to [`RateLimitPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<Category, RateLimitPolicy>,
}

impl PolicyRegistry {
    /// Build a registry from an explicit table.
    ///
    /// Fails if any entry has a zero limit or window, if a category appears twice, or if
    /// the table has no `default` entry to fall back on.
    pub fn new(policies: Vec<RateLimitPolicy>) -> Result<Self> {
        let mut table = HashMap::with_capacity(policies.len());

        for policy in policies {
            policy.validate()?;
            let category = policy.category;
            if table.insert(category, policy).is_some() {
                return Err(TollgateError::InvalidPolicy {
                    category,
                    reason: "duplicate entry".to_string(),
                });
            }
        }

        if !table.contains_key(&Category::Default) {
            return Err(TollgateError::InvalidPolicy {
                category: Category::Default,
                reason: "a default policy is required".to_string(),
            });
        }

        Ok(Self { policies: table })
    }

    /// The built-in production table.
    pub fn standard() -> Self {
        let policies = [
            RateLimitPolicy::new(Category::Public, 100, 60, "Public storefront pages and catalog reads"),
            RateLimitPolicy::new(Category::Auth, 5, 60, "Login, signup and password reset"),
            RateLimitPolicy::new(Category::Checkout, 10, 60, "Order placement and payment"),
            RateLimitPolicy::new(Category::Admin, 1000, 60, "Back-office dashboards and consoles"),
            RateLimitPolicy::new(Category::Export, 3, 60, "Bulk data exports"),
            RateLimitPolicy::new(Category::Default, 60, 60, "Unclassified API routes"),
        ];

        Self {
            policies: policies.into_iter().map(|p| (p.category, p)).collect(),
        }
    }

    /// Resolve the policy for a category, falling back to the default policy.
    pub fn resolve(&self, category: Category) -> &RateLimitPolicy {
        self.policies
            .get(&category)
            .or_else(|| self.policies.get(&Category::Default))
            .expect("registry always holds a default policy")
    }

    /// Resolve the policy for a category given by name.
    pub fn resolve_name(&self, name: &str) -> &RateLimitPolicy {
        self.resolve(Category::from_name(name))
    }

    /// All policies in table order.
    pub fn policies(&self) -> Vec<&RateLimitPolicy> {
        Category::ALL
            .iter()
            .filter_map(|c| self.policies.get(c))
            .collect()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
