// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pre-compiled matchers for user-agent globs and client IP ranges.

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

/// A shell-style glob compiled to an anchored regular expression.
///
/// Supports `*` (any run of characters), `?` (one character), and bracket
/// classes such as `[abc]`, `[a-z]` or `[!0-9]`. Matching is case-sensitive.
#[derive(Clone, Debug)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    /// # Errors
    ///
    /// Returns a description of the problem for an unclosed bracket class or
    /// a dangling escape.
    pub fn new(pattern: &str) -> Result<Self, String> {
        let source = glob_to_regex(pattern)?;
        let regex = Regex::new(&source).map_err(|e| e.to_string())?;
        Ok(GlobMatcher {
            pattern: pattern.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

fn glob_to_regex(pattern: &str) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => return Err("pattern ends with an unescaped '\\'".to_string()),
            },
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!' | '^')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                let mut empty = true;
                for class_char in chars.by_ref() {
                    match class_char {
                        ']' if !empty => {
                            closed = true;
                            break;
                        }
                        '\\' | '[' | ']' | '&' | '~' => {
                            out.push('\\');
                            out.push(class_char);
                        }
                        other => out.push(other),
                    }
                    empty = false;
                }
                if !closed {
                    return Err("unclosed '[' character class".to_string());
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Ok(out)
}

/// A single IP address or CIDR range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CidrMatcher {
    net: IpNet,
}

impl CidrMatcher {
    /// Parses `10.0.0.0/8`, `2001:db8::/32`, or a bare address, which matches
    /// only itself.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(net) = value.parse::<IpNet>() {
            return Some(CidrMatcher { net });
        }
        let addr = value.parse::<IpAddr>().ok()?;
        let host_prefix = if addr.is_ipv4() { 32 } else { 128 };
        IpNet::new(addr, host_prefix)
            .ok()
            .map(|net| CidrMatcher { net })
    }

    #[must_use]
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.net.contains(addr)
    }
}
