//! Directory held in memory, with its own filter evaluation, for resolver tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DirectoryConnector, DirectoryEntry, DirectorySession, SearchRequest, ServerAddress};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct DirectoryState {
    entries: Vec<DirectoryEntry>,
    passwords: HashMap<String, String>,
    offline: HashSet<String>,
}

/// A directory held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl InMemoryDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn add_entry(&self, entry: DirectoryEntry) {
        self.state.write().entries.push(entry);
    }

    /// Accept simple binds for `dn` with `password`.
    pub fn add_credentials(&self, dn: &str, password: &str) {
        self.state.write().passwords.insert(dn.to_string(), password.to_string());
    }

    /// Refuse connections to `host`.
    pub fn set_offline(&self, host: &str) {
        self.state.write().offline.insert(host.to_string());
    }
}

#[async_trait]
impl DirectoryConnector for InMemoryDirectory {
    async fn connect(&self, server: &ServerAddress) -> Result<Box<dyn DirectorySession>> {
        if self.state.read().offline.contains(&server.host) {
            return Err(Error::ErsBackendFailed(format!("{server}: connection refused")));
        }
        Ok(Box::new(InMemorySession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemorySession {
    state: Arc<RwLock<DirectoryState>>,
}

#[async_trait]
impl DirectorySession for InMemorySession {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        match self.state.read().passwords.get(dn) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(Error::ErsBackendFailed("invalid credentials".to_string())),
        }
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
        let filter = Filter::parse(&request.filter)?;
        let base = request.base_dn.to_ascii_lowercase();
        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .filter(|e| e.dn.to_ascii_lowercase().ends_with(&base) && filter.matches(e))
            .map(|e| DirectoryEntry {
                dn: e.dn.clone(),
                attributes: e
                    .attributes
                    .iter()
                    .filter(|(name, _)| {
                        request.attributes.is_empty()
                            || request.attributes.iter().any(|a| a.eq_ignore_ascii_case(name))
                    })
                    .cloned()
                    .collect(),
            })
            .collect())
    }
}

/// Parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    /// Attribute and `*`-separated value pieces.
    Match(String, Vec<String>),
}

impl Filter {
    fn parse(text: &str) -> Result<Self> {
        let (filter, rest) = Self::parse_one(text.trim())?;
        if rest.trim().is_empty() {
            Ok(filter)
        } else {
            Err(invalid_filter(text))
        }
    }

    fn parse_one(text: &str) -> Result<(Self, &str)> {
        let inner = text.strip_prefix('(').ok_or_else(|| invalid_filter(text))?;
        match inner.chars().next() {
            Some(op @ ('&' | '|')) => {
                let mut rest = &inner[1..];
                let mut children = Vec::new();
                while !rest.starts_with(')') {
                    let (child, next) = Self::parse_one(rest)?;
                    children.push(child);
                    rest = next;
                }
                let filter = if op == '&' { Self::And(children) } else { Self::Or(children) };
                Ok((filter, &rest[1..]))
            }
            Some('!') => {
                let (child, rest) = Self::parse_one(&inner[1..])?;
                let rest = rest.strip_prefix(')').ok_or_else(|| invalid_filter(text))?;
                Ok((Self::Not(Box::new(child)), rest))
            }
            Some(_) => {
                let end = inner.find(')').ok_or_else(|| invalid_filter(text))?;
                let (attribute, value) = inner[..end].split_once('=').ok_or_else(|| invalid_filter(text))?;
                let filter = if value == "*" {
                    Self::Present(attribute.to_string())
                } else {
                    let pieces = value.split('*').map(unescape).collect::<Result<Vec<_>>>()?;
                    Self::Match(attribute.to_string(), pieces)
                };
                Ok((filter, &inner[end + 1..]))
            }
            None => Err(invalid_filter(text)),
        }
    }

    fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(entry)),
            Self::Or(children) => children.iter().any(|c| c.matches(entry)),
            Self::Not(child) => !child.matches(entry),
            Self::Present(attribute) => {
                attribute.eq_ignore_ascii_case("objectClass") || !entry.values(attribute).is_empty()
            }
            Self::Match(attribute, pieces) => {
                let candidates: Vec<&str> = if attribute.eq_ignore_ascii_case("dn") {
                    vec![entry.dn.as_str()]
                } else {
                    entry.values(attribute).iter().map(String::as_str).collect()
                };
                candidates.into_iter().any(|v| wildcard_match(&v.to_lowercase(), pieces))
            }
        }
    }
}

fn invalid_filter(text: &str) -> Error {
    Error::ErsBackendFailed(format!("invalid LDAP filter '{text}'"))
}

fn unescape(piece: &str) -> Result<String> {
    let mut bytes = Vec::with_capacity(piece.len());
    let mut iter = piece.bytes();
    while let Some(b) = iter.next() {
        if b == b'\\' {
            let hex: Vec<u8> = iter.by_ref().take(2).collect();
            let text = std::str::from_utf8(&hex).map_err(|_| invalid_filter(piece))?;
            bytes.push(u8::from_str_radix(text, 16).map_err(|_| invalid_filter(piece))?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes)
        .map(|s| s.to_lowercase())
        .map_err(|_| invalid_filter(piece))
}

/// Case-folded match of `value` against `*`-separated `pieces`.
fn wildcard_match(value: &str, pieces: &[String]) -> bool {
    match pieces {
        [] => false,
        [exact] => value == exact,
        [first, middle @ .., last] => {
            let Some(mut rest) = value.strip_prefix(first.as_str()) else {
                return false;
            };
            for piece in middle {
                match rest.find(piece.as_str()) {
                    Some(at) => rest = &rest[at + piece.len()..],
                    None => return false,
                }
            }
            rest.ends_with(last.as_str())
        }
    }
}

mod tests {
    use super::*;

    #[test]
    fn filter_evaluation() {
        let entry = DirectoryEntry::new("uid=a,dc=o")
            .with("uid", &["Alice"])
            .with("mail", &["a@x.io"]);
        let check = |f: &str| Filter::parse(f).unwrap().matches(&entry);
        assert!(check("(uid=alice)"));
        assert!(check("(&(uid=alice)(mail=*))"));
        assert!(check("(|(uid=nobody)(mail=*@x.io))"));
        assert!(!check("(!(uid=alice))"));
        assert!(!check("(uid=ali\\2a)"));
        assert!(Filter::parse("(uid=alice").is_err());
    }
}
