//! Request queues, one per topic.
//!
//! Dispatchers own disjoint action sets. The publisher picks the queue from
//! the action name, so every action maps to exactly one topic.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Saved-property actions served by the property-management dispatcher.
pub const PROPERTY_ACTIONS: &[&str] = &["saveProperty", "getSavedProperties", "deleteSavedProperty"];

/// Action prefixes of the third-party data dispatcher.
const MARKET_DATA_PREFIXES: &[&str] = &["rentcast_", "maps_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Accounts and sessions.
    Auth,
    /// Saved properties.
    PropertyManagement,
    /// Property search, valuations and geocoding. Served by an external
    /// worker that holds the third-party API keys.
    MarketData,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Auth, Topic::PropertyManagement, Topic::MarketData];

    /// Durable request queue for this topic.
    pub fn queue(self) -> &'static str {
        match self {
            Topic::Auth => "frontend_to_backend",
            Topic::PropertyManagement => "property_management",
            Topic::MarketData => "rentcast_queue",
        }
    }

    /// Path segment used by the HTTP gateway.
    pub fn route(self) -> &'static str {
        match self {
            Topic::Auth => "auth",
            Topic::PropertyManagement => "properties",
            Topic::MarketData => "market",
        }
    }

    pub fn from_route(segment: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.route() == segment)
    }

    /// Topic whose dispatcher owns `action`.
    ///
    /// Unrecognized actions go to the auth queue, whose dispatcher answers
    /// them with an unknown-action error.
    pub fn for_action(action: &str) -> Topic {
        if PROPERTY_ACTIONS.contains(&action) {
            Topic::PropertyManagement
        } else if MARKET_DATA_PREFIXES.iter().any(|p| action.starts_with(p)) {
            Topic::MarketData
        } else {
            Topic::Auth
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Auth => "auth",
            Topic::PropertyManagement => "property_management",
            Topic::MarketData => "market_data",
        };
        f.write_str(name)
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.to_string() == s || t.route() == s)
            .ok_or_else(|| format!("unknown topic '{}'", s))
    }
}
