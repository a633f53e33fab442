//! Client groups: named predicates over session metadata.
//!
//! A group specifies, per metadata field, an ordered list of literal or
//! wildcard patterns. A session belongs to the group when every specified
//! field matches; a group that specifies nothing matches no session at all,
//! so an empty group can never accidentally select the whole fleet.

use serde::{Deserialize, Serialize};

/// One matching rule: an exact literal or a wildcard expression.
///
/// Wildcards use `*` (any run of characters) and `?` (any single
/// character), anchored at both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Pattern {
    Literal(String),
    Wildcard(String),
}

impl Pattern {
    pub fn new(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.contains('*') || s.contains('?') {
            Pattern::Wildcard(s)
        } else {
            Pattern::Literal(s)
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Literal(p) => p == value,
            Pattern::Wildcard(p) => wildcard_match(p, value),
        }
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::new(s)
    }
}

impl From<Pattern> for String {
    fn from(p: Pattern) -> Self {
        match p {
            Pattern::Literal(s) | Pattern::Wildcard(s) => s,
        }
    }
}

/// Anchored wildcard match with `*` and `?`.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();

    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = vi;
            pi += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last '*' swallow one more character.
            pi = s + 1;
            mark += 1;
            vi = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Ordered rule list for one group parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamValues(pub Vec<Pattern>);

impl ParamValues {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(patterns.into_iter().map(Pattern::new).collect())
    }

    /// True when any rule matches any of the supplied values.
    ///
    /// An empty rule list is vacuously true, like an unspecified parameter.
    pub fn matches_one_of(&self, values: &[&str]) -> bool {
        if self.0.is_empty() {
            return true;
        }
        self.0
            .iter()
            .any(|pattern| values.iter().any(|value| pattern.matches(value)))
    }
}

/// Per-field matchers of a client group. `None` means "field not
/// constrained".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupParams {
    pub client_id: Option<ParamValues>,
    pub name: Option<ParamValues>,
    pub os: Option<ParamValues>,
    pub os_arch: Option<ParamValues>,
    pub os_family: Option<ParamValues>,
    pub os_kernel: Option<ParamValues>,
    pub hostname: Option<ParamValues>,
    pub ipv4: Option<ParamValues>,
    pub ipv6: Option<ParamValues>,
    pub tag: Option<ParamValues>,
    pub version: Option<ParamValues>,
    pub address: Option<ParamValues>,
    pub client_auth_id: Option<ParamValues>,
}

impl GroupParams {
    /// True when no field is constrained at all.
    pub fn has_no_params(&self) -> bool {
        self.client_id.is_none()
            && self.name.is_none()
            && self.os.is_none()
            && self.os_arch.is_none()
            && self.os_family.is_none()
            && self.os_kernel.is_none()
            && self.hostname.is_none()
            && self.ipv4.is_none()
            && self.ipv6.is_none()
            && self.tag.is_none()
            && self.version.is_none()
            && self.address.is_none()
            && self.client_auth_id.is_none()
    }
}

/// A named group of clients, defined by its parameter matchers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientGroup {
    pub id: String,
    pub description: String,
    pub params: GroupParams,
}
