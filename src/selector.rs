//! Method selectors: `Owner::method(ArgType, ArgType)`.

use crate::descriptor::{resolve_type_name, JvmType};
use crate::error::AgentError;
use std::fmt;

/// Targets instrumented when no `methods` option is given: DNS lookups and
/// TCP/UDP bind/connect, the usual suspects when chasing network problems.
pub const DEFAULT_SELECTORS: [&str; 8] = [
    "java.net.InetAddress::getByName(java.lang.String)",
    "java.net.InetAddress::getByName(java.lang.String, java.net.InetAddress)",
    "java.net.Socket::connect(java.net.SocketAddress, int)",
    "java.net.Socket::bind(java.net.SocketAddress)",
    "java.net.ServerSocket::bind(java.net.SocketAddress, int)",
    "java.net.DatagramSocket::bind(java.net.SocketAddress)",
    "java.net.DatagramSocket::connect(java.net.SocketAddress)",
    "java.net.DatagramSocket::connect(java.net.SocketAddress, int)",
];

/// One method overload to instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSelector {
    /// Dotted binary name, e.g. `java.net.InetAddress`.
    pub owner_class: String,
    pub method_name: String,
    /// Parameter type names as written, trimmed.
    pub argument_types: Vec<String>,
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | '(' | ')' | ','))
}

impl MethodSelector {
    pub fn parse(input: &str) -> Result<Self, AgentError> {
        let text = input.trim();
        let invalid = |reason| AgentError::config(input, reason);

        let (owner, rest) = text.split_once("::").ok_or_else(|| invalid("Invalid method selector, expected Owner::method(Types)"))?;
        let (name, args) = rest.split_once('(').ok_or_else(|| invalid("Invalid method selector, missing '('"))?;
        let args = args.strip_suffix(')').ok_or_else(|| invalid("Invalid method selector, missing closing ')'"))?;

        let owner = owner.trim();
        let name = name.trim();
        if !is_plain_name(owner) {
            return Err(invalid("Invalid method selector, bad owner class name"));
        }
        if !is_plain_name(name) {
            return Err(invalid("Invalid method selector, bad method name"));
        }
        if args.contains(['(', ')']) {
            return Err(invalid("Invalid method selector, unbalanced parentheses"));
        }

        let argument_types = if args.trim().is_empty() {
            Vec::new()
        } else {
            let tokens: Vec<String> = args.split(',').map(|t| t.trim().to_string()).collect();
            if tokens.iter().any(String::is_empty) {
                return Err(invalid("Invalid method selector, empty argument type"));
            }
            tokens
        };

        Ok(Self {
            owner_class: owner.to_string(),
            method_name: name.to_string(),
            argument_types,
        })
    }

    /// Resolves every argument type name; the first failure is attributed to
    /// this selector.
    pub fn resolve_argument_types(&self) -> Result<Vec<JvmType>, AgentError> {
        self.argument_types
            .iter()
            .map(|name| resolve_type_name(name))
            .collect::<Result<_, _>>()
            .map_err(|source| AgentError::TypeResolution { selector: self.to_string(), source })
    }

    /// The owner's name without its package, as shown in log lines.
    pub fn owner_simple_name(&self) -> &str {
        simple_name(&self.owner_class)
    }
}

/// Text after the last `.`; nested classes keep their `Outer$Inner` form.
pub fn simple_name(dotted: &str) -> &str {
    dotted.rsplit('.').next().unwrap_or(dotted)
}

impl fmt::Display for MethodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}({})", self.owner_class, self.method_name, self.argument_types.join(", "))
    }
}

/// Parses each entry independently; malformed entries become errors and the
/// remaining selectors keep their relative order.
pub fn parse_selectors<'a, I>(entries: I) -> (Vec<MethodSelector>, Vec<AgentError>)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut selectors = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        match MethodSelector::parse(entry) {
            Ok(selector) => selectors.push(selector),
            Err(e) => errors.push(e),
        }
    }
    (selectors, errors)
}
