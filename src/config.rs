//! Agent options: the text after `=` in `-agentpath:libdebug_agent.so=...`.
//!
//! ```text
//! debug=true;methods=java.net.InetAddress::getByName(java.lang.String)|java.net.Socket::bind(java.net.SocketAddress)
//! ```
//!
//! | key       | effect                                                    |
//! |-----------|-----------------------------------------------------------|
//! | `debug`   | `true` enables `>>> DebugAgent DEBUG:` diagnostics        |
//! | `methods` | `|`-separated selectors replacing [`DEFAULT_SELECTORS`]   |

use crate::error::AgentError;
use crate::selector::{parse_selectors, MethodSelector, DEFAULT_SELECTORS};

pub const DEBUG_KEY: &str = "debug";
pub const METHODS_KEY: &str = "methods";

/// Raw `key=value` pairs in the order they were given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOptions {
    entries: Vec<(String, String)>,
}

impl AgentOptions {
    /// Splits `key1=value1;key2=value2`. Entries that are not exactly one
    /// non-empty key and one non-empty value are reported and skipped.
    pub fn parse(options: &str) -> (Self, Vec<AgentError>) {
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut errors = Vec::new();

        for entry in options.split(';') {
            if entry.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = entry.split('=').map(str::trim).collect();
            match parts.as_slice() {
                [key, value] if !key.is_empty() && !value.is_empty() => {
                    entries.retain(|(k, _)| k != key);
                    entries.push((key.to_string(), value.to_string()));
                }
                _ => errors.push(AgentError::config(entry, "Ignoring agent option")),
            }
        }

        (Self { entries }, errors)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Keys the agent does not understand.
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|k| *k != DEBUG_KEY && *k != METHODS_KEY)
    }
}

/// Startup configuration derived from [`AgentOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub debug: bool,
    pub selectors: Vec<MethodSelector>,
    /// Whether the selectors came from the built-in default list.
    pub using_defaults: bool,
    pub unknown_options: Vec<String>,
}

impl AgentConfig {
    /// Never fails: every problem is returned as an error next to a usable
    /// configuration built from whatever did parse.
    pub fn from_options(options: &str) -> (Self, Vec<AgentError>) {
        let (opts, mut errors) = AgentOptions::parse(options);

        let debug = opts.get(DEBUG_KEY) == Some("true");
        let (selectors, selector_errors, using_defaults) = match opts.get(METHODS_KEY) {
            Some(methods) => {
                let (selectors, errors) = parse_selectors(methods.split('|'));
                (selectors, errors, false)
            }
            None => {
                let (selectors, errors) = parse_selectors(DEFAULT_SELECTORS);
                (selectors, errors, true)
            }
        };
        errors.extend(selector_errors);

        let config = Self {
            debug,
            selectors,
            using_defaults,
            unknown_options: opts.unknown_keys().map(str::to_string).collect(),
        };
        (config, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_use_the_default_selectors() {
        let (config, errors) = AgentConfig::from_options("");
        assert!(errors.is_empty());
        assert!(!config.debug);
        assert!(config.using_defaults);
        assert_eq!(config.selectors.len(), DEFAULT_SELECTORS.len());
    }

    #[test]
    fn debug_and_methods_are_read() {
        let (config, errors) = AgentConfig::from_options(
            "debug=true;methods=java.net.InetAddress::getByName(java.lang.String)| a.B::c(int, long) ",
        );
        assert!(errors.is_empty());
        assert!(config.debug);
        assert!(!config.using_defaults);
        let names: Vec<String> = config.selectors.iter().map(|s| s.to_string()).collect();
        assert_eq!(names, ["java.net.InetAddress::getByName(java.lang.String)", "a.B::c(int, long)"]);
    }

    #[test]
    fn debug_requires_exactly_true() {
        for value in ["TRUE", "yes", "1", "false"] {
            let (config, _) = AgentConfig::from_options(&format!("debug={value}"));
            assert!(!config.debug, "{value}");
        }
    }

    #[test]
    fn malformed_option_entries_are_reported_and_skipped() {
        let (opts, errors) = AgentOptions::parse("debug;a=b=c;=x;y=;;methods=a.B::c()");
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|e| matches!(e, AgentError::ConfigParse { .. })));
        assert_eq!(opts.get("methods"), Some("a.B::c()"));
        assert_eq!(opts.get("debug"), None);
    }

    #[test]
    fn bad_selectors_do_not_drop_good_ones() {
        let (config, errors) = AgentConfig::from_options("methods=a.B::c()|nonsense||a.B::d(int)");
        assert_eq!(errors.len(), 2);
        assert_eq!(config.selectors.len(), 2);
    }

    #[test]
    fn later_keys_override_and_unknown_keys_are_kept() {
        let (opts, errors) = AgentOptions::parse("debug=false; debug = true ;colour=blue");
        assert!(errors.is_empty());
        assert_eq!(opts.get("debug"), Some("true"));
        assert_eq!(opts.unknown_keys().collect::<Vec<_>>(), ["colour"]);
    }
}
