//! Destination routing
//!
//! Maps client-supplied destination paths to channel ids. Clients read a
//! room under `/topic/chat/{room}` and publish to it under
//! `/app/chat/{room}`; both must resolve to the same channel.

/// Well-known channel for presence broadcasts.
pub const ONLINE_USERS_CHANNEL: &str = "online-users";

const TOPIC_CHAT_PREFIX: &str = "/topic/chat/";
const APP_CHAT_PREFIX: &str = "/app/chat/";
const ONLINE_USERS_TOPIC: &str = "/topic/online-users";

/// One routing rule. Rules are evaluated top to bottom; the first match
/// wins.
#[derive(Debug, Clone)]
enum Rule {
    /// Strip the prefix, the remainder is the channel id.
    Prefix(&'static str),
    /// Exact path mapped to a fixed channel id.
    Exact(&'static str, &'static str),
}

impl Rule {
    fn resolve(&self, destination: &str) -> Option<String> {
        match self {
            Rule::Prefix(prefix) => destination
                .strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(str::to_string),
            Rule::Exact(path, channel) => {
                (destination == *path).then(|| channel.to_string())
            }
        }
    }
}

/// Ordered destination routing table.
#[derive(Debug, Clone)]
pub struct DestinationRouter {
    rules: Vec<Rule>,
}

impl Default for DestinationRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationRouter {
    /// Create a router with the built-in chat and presence namespaces.
    pub fn new() -> Self {
        Self {
            rules: vec![
                Rule::Prefix(TOPIC_CHAT_PREFIX),
                Rule::Exact(ONLINE_USERS_TOPIC, ONLINE_USERS_CHANNEL),
                Rule::Prefix(APP_CHAT_PREFIX),
            ],
        }
    }

    /// Resolve a destination to a channel id, or `None` when no rule
    /// matches (the caller drops the frame).
    pub fn resolve(&self, destination: &str) -> Option<String> {
        self.rules
            .iter()
            .find_map(|rule| rule.resolve(destination))
    }

    /// Topic-namespace destination a subscriber reads a channel under,
    /// used for the `destination` header on broadcast MESSAGE frames.
    pub fn topic_for(channel: &str) -> String {
        if channel == ONLINE_USERS_CHANNEL {
            ONLINE_USERS_TOPIC.to_string()
        } else {
            format!("{TOPIC_CHAT_PREFIX}{channel}")
        }
    }
}
