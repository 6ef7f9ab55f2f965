//! Topic layout and MQTT-style topic filter matching
//!
//! A service address such as `/rt:dev/rn:zw/ad:1/sv:out_lvl_switch/ad:5_0` is
//! published under two namespaces: commands go to `<cmd_prefix><address>` and
//! events come back on `<evt_prefix><address>`.

use serde::{Deserialize, Serialize};

pub const DEFAULT_CMD_PREFIX: &str = "pt:j1/mt:cmd";
pub const DEFAULT_EVT_PREFIX: &str = "pt:j1/mt:evt";

/// Command/event topic namespaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    #[serde(default = "default_cmd_prefix")]
    pub cmd_prefix: String,
    #[serde(default = "default_evt_prefix")]
    pub evt_prefix: String,
}

fn default_cmd_prefix() -> String {
    DEFAULT_CMD_PREFIX.to_string()
}

fn default_evt_prefix() -> String {
    DEFAULT_EVT_PREFIX.to_string()
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            cmd_prefix: default_cmd_prefix(),
            evt_prefix: default_evt_prefix(),
        }
    }
}

impl TopicScheme {
    pub fn command_topic(&self, address: &str) -> String {
        format!("{}{}", self.cmd_prefix, address)
    }

    pub fn event_topic(&self, address: &str) -> String {
        format!("{}{}", self.evt_prefix, address)
    }

    /// Event-namespace counterpart of a command topic
    pub fn response_topic_for(&self, command_topic: &str) -> Option<String> {
        command_topic
            .strip_prefix(&self.cmd_prefix)
            .map(|address| self.event_topic(address))
    }

    /// Service address carried by an event topic
    pub fn address_of_event<'a>(&self, event_topic: &'a str) -> Option<&'a str> {
        event_topic
            .strip_prefix(&self.evt_prefix)
            .filter(|address| !address.is_empty())
    }

    /// Filter covering the whole event namespace
    pub fn event_filter(&self) -> String {
        format!("{}/#", self.evt_prefix.trim_end_matches('/'))
    }
}

/// Check whether a topic matches an MQTT filter (`+` one level, `#` the rest)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
