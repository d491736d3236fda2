//! Fully-qualified attribute names and values.
//!
//! A definition is named `{authority}/attr/{name}` and a value
//! `{authority}/attr/{name}/value/{value}`; name and value are path-escaped.
//! Comparison keys are the lowercased URL.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://[\w./-]+)/attr/([^/\s]*)$").expect("static regex")
});

static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://[\w./-]+)/attr/(\S*)/value/(\S*)$").expect("static regex")
});

/// FQN of an attribute definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeNameFqn {
    url: String,
    key: String,
    authority: String,
    name: String,
}

impl AttributeNameFqn {
    /// Parse `{authority}/attr/{name}`.
    pub fn parse(u: &str) -> Result<Self> {
        let caps = NAME_RE
            .captures(u)
            .ok_or_else(|| Error::InvalidRequest(format!("attribute regex fail for [{u}]")))?;
        let authority = caps[1].to_string();
        let raw_name = &caps[2];
        validate_parts(&authority, &[raw_name])?;
        let name = path_unescape(raw_name)
            .ok_or_else(|| Error::InvalidRequest(format!("error in attribute name [{raw_name}]")))?;
        Ok(Self {
            url: u.to_string(),
            key: u.to_lowercase(),
            authority,
            name,
        })
    }

    /// Build from an authority and an unescaped name.
    pub fn from_parts(authority: &str, name: &str) -> Result<Self> {
        let authority = authority.trim_end_matches('/');
        Self::parse(&format!("{authority}/attr/{}", path_escape(name)))
    }

    /// Value FQN for `value` under this definition.
    #[must_use]
    pub fn select(&self, value: &str) -> AttributeValueFqn {
        let url = format!("{}/value/{}", self.url, path_escape(value));
        AttributeValueFqn {
            key: url.to_lowercase(),
            url,
            authority: self.authority.clone(),
            name: self.name.clone(),
            value: value.to_string(),
        }
    }

    /// Lowercased comparison key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `scheme://host[/path]` part.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Unescaped definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for AttributeNameFqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// FQN of a single attribute value (an attribute instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeValueFqn {
    url: String,
    key: String,
    authority: String,
    name: String,
    value: String,
}

impl AttributeValueFqn {
    /// Parse `{authority}/attr/{name}/value/{value}`.
    pub fn parse(u: &str) -> Result<Self> {
        let caps = VALUE_RE
            .captures(u)
            .ok_or_else(|| Error::InvalidRequest(format!("attribute regex fail for [{u}]")))?;
        let authority = caps[1].to_string();
        let (raw_name, raw_value) = (&caps[2], &caps[3]);
        validate_parts(&authority, &[raw_name, raw_value])?;
        let name = path_unescape(raw_name)
            .ok_or_else(|| Error::InvalidRequest(format!("error in attribute name [{raw_name}]")))?;
        let value = path_unescape(raw_value).ok_or_else(|| {
            Error::InvalidRequest(format!("error in attribute value [{raw_value}]"))
        })?;
        Ok(Self {
            url: u.to_string(),
            key: u.to_lowercase(),
            authority,
            name,
            value,
        })
    }

    /// Lowercased comparison key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `scheme://host[/path]` part.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Unescaped definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unescaped value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// FQN of the owning definition.
    #[must_use]
    pub fn prefix(&self) -> AttributeNameFqn {
        let cut = self.url.rfind("/value/").unwrap_or(self.url.len());
        let url = self.url[..cut].to_string();
        AttributeNameFqn {
            key: url.to_lowercase(),
            url,
            authority: self.authority.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for AttributeValueFqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn validate_parts(authority: &str, parts: &[&str]) -> Result<()> {
    if authority.is_empty() || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::InvalidRequest(
            "empty url path parts are not allowed".to_string(),
        ));
    }
    if parts.iter().any(|p| p.contains('/')) {
        return Err(Error::InvalidRequest(
            "slash not allowed in name or values".to_string(),
        ));
    }
    Ok(())
}

/// Escape a single path segment.
#[must_use]
pub fn path_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        let keep = b.is_ascii_alphanumeric()
            || matches!(b, b'-' | b'_' | b'.' | b'~' | b'$' | b'&' | b'+' | b':' | b'=' | b'@');
        if keep {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Reverse of [`path_escape`]; `None` on a malformed escape.
#[must_use]
pub fn path_unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_value_fqn_and_unescapes_parts() {
        let v = AttributeValueFqn::parse("https://virtru.com/attr/Need%20to%20Know/value/HCS")
            .unwrap();
        assert_eq!(v.authority(), "https://virtru.com");
        assert_eq!(v.name(), "Need to Know");
        assert_eq!(v.value(), "HCS");
        assert_eq!(v.key(), "https://virtru.com/attr/need%20to%20know/value/hcs");
        assert_eq!(
            v.prefix().to_string(),
            "https://virtru.com/attr/Need%20to%20Know"
        );
    }

    #[test]
    fn select_escapes_value() {
        let name = AttributeNameFqn::from_parts("https://virtru.com/", "Releasable To").unwrap();
        let v = name.select("Five Eyes");
        assert_eq!(
            v.to_string(),
            "https://virtru.com/attr/Releasable%20To/value/Five%20Eyes"
        );
        assert_eq!(v.value(), "Five Eyes");
    }

    #[test]
    fn rejects_malformed_fqns() {
        assert!(AttributeNameFqn::parse("virtru.com/attr/x").is_err());
        assert!(AttributeNameFqn::parse("https://virtru.com/attr/").is_err());
        assert!(AttributeValueFqn::parse("https://virtru.com/attr/a/value/").is_err());
        assert!(AttributeValueFqn::parse("https://virtru.com/attr/a/b/value/c").is_err());
        assert!(AttributeValueFqn::parse("https://virtru.com/attr/a/value/%zz").is_err());
    }

    #[test]
    fn escape_round_trips_reserved_characters() {
        let raw = "a b/c?d";
        assert_eq!(path_escape(raw), "a%20b%2Fc%3Fd");
        assert_eq!(path_unescape(&path_escape(raw)).as_deref(), Some(raw));
    }
}
