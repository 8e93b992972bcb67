//! Coarse classification of request paths into quota policies.
//!
//! Prefixes are checked in priority order and the first match wins, so the
//! `auth` and `payment` buckets are carved out of the generic `/api/` bucket:
//!
//! | Prefix          | Class     |
//! |-----------------|-----------|
//! | `/api/auth/`    | `auth`    |
//! | `/api/payment/` | `payment` |
//! | `/api/`         | `api`     |
//! | anything else   | `default` |

use std::fmt;

use serde::{Deserialize, Serialize};

const AUTH_PREFIX: &str = "/api/auth/";
const PAYMENT_PREFIX: &str = "/api/payment/";
const API_PREFIX: &str = "/api/";

/// Route class used to select a quota policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    Auth,
    Payment,
    Api,
    Default,
}

impl RouteClass {
    /// Every class, in classification priority order.
    pub const ALL: [RouteClass; 4] = [
        RouteClass::Auth,
        RouteClass::Payment,
        RouteClass::Api,
        RouteClass::Default,
    ];

    /// Classify a request path.
    #[inline]
    pub fn classify(path: &str) -> Self {
        if path.starts_with(AUTH_PREFIX) {
            RouteClass::Auth
        } else if path.starts_with(PAYMENT_PREFIX) {
            RouteClass::Payment
        } else if path.starts_with(API_PREFIX) {
            RouteClass::Api
        } else {
            RouteClass::Default
        }
    }

    /// Lower-case label used in logs, metrics and the admin API.
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Auth => "auth",
            RouteClass::Payment => "payment",
            RouteClass::Api => "api",
            RouteClass::Default => "default",
        }
    }

    /// Environment variable carrying this class's limit.
    pub fn limit_env_var(&self) -> &'static str {
        match self {
            RouteClass::Auth => "RATE_LIMIT_AUTH",
            RouteClass::Payment => "RATE_LIMIT_PAYMENT",
            RouteClass::Api => "RATE_LIMIT_API",
            RouteClass::Default => "RATE_LIMIT_DEFAULT",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RouteClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouteClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown route class '{s}'"))
    }
}
