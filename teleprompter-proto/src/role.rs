use std::collections::HashMap;
use std::fmt;

/// Query parameter carrying the requested role on the upgrade request.
pub const ROLE_QUERY_KEY: &str = "type";

/// Label used for connections that named neither role.
pub const UNKNOWN_ROLE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Drives the prompter: sends cues, script and scroll commands
    Controller,
    /// Renders the script and reports its scroll position back
    Display,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "controller" => Some(Role::Controller),
            "display" => Some(Role::Display),
            _ => None,
        }
    }

    /// Classify an upgrade request by its query parameters.
    ///
    /// `None` means the client asked for no recognised role; such connections
    /// are tracked but never routed.
    pub fn from_query(query: &HashMap<String, String>) -> Option<Self> {
        query.get(ROLE_QUERY_KEY).and_then(|v| Role::parse(v))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Display => "display",
        }
    }

    /// The role on the other end of the relay.
    pub fn peer(self) -> Self {
        match self {
            Role::Controller => Role::Display,
            Role::Display => Role::Controller,
        }
    }

    pub fn label(role: Option<Role>) -> &'static str {
        role.map(Role::as_str).unwrap_or(UNKNOWN_ROLE)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
