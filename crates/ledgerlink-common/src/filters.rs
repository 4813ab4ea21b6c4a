use rustc_hash::FxHasher;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Accounting book used when a caller leaves the book blank.
pub const PRIMARY_BOOK: u32 = 1;

const CONSOLIDATED_SUFFIX: &str = "(consolidated)";

/// Dimension filters shared by every lookup in a query.
///
/// Construct with [`FilterSet::new`] and the `with_*` builders; the builders
/// normalize as they go, so two sets built from differently formatted input
/// compare equal when they denote the same slice.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterSet {
    pub subsidiary: Option<String>,
    pub consolidated: bool,
    pub department: Option<String>,
    pub location: Option<String>,
    pub class: Option<String>,
    pub book: u32,
}

impl Default for FilterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterSet {
    pub fn new() -> Self {
        Self {
            subsidiary: None,
            consolidated: false,
            department: None,
            location: None,
            class: None,
            book: PRIMARY_BOOK,
        }
    }

    /// Set the subsidiary. A trailing `(Consolidated)` marker is stripped and
    /// recorded in [`FilterSet::consolidated`].
    pub fn with_subsidiary(mut self, raw: &str) -> Self {
        let text = collapse(raw).and_then(|t| {
            if t.to_ascii_lowercase().ends_with(CONSOLIDATED_SUFFIX) {
                self.consolidated = true;
                collapse(&t[..t.len() - CONSOLIDATED_SUFFIX.len()])
            } else {
                Some(t)
            }
        });
        self.subsidiary = text.filter(|t| !is_wildcard(t));
        self
    }

    pub fn with_department(mut self, raw: &str) -> Self {
        self.department = collapse(raw).filter(|t| !is_wildcard(t));
        self
    }

    pub fn with_location(mut self, raw: &str) -> Self {
        self.location = collapse(raw).filter(|t| !is_wildcard(t));
        self
    }

    pub fn with_class(mut self, raw: &str) -> Self {
        self.class = collapse(raw).filter(|t| !is_wildcard(t));
        self
    }

    /// Blank, wildcard or non-numeric input selects the primary book.
    pub fn with_book(mut self, raw: &str) -> Self {
        self.book = collapse(raw)
            .and_then(|t| t.parse::<u32>().ok())
            .filter(|b| *b > 0)
            .unwrap_or(PRIMARY_BOOK);
        self
    }

    /// Canonical key; case-insensitive over every dimension.
    pub fn key(&self) -> FilterKey {
        let text = format!(
            "sub={}|cons={}|dept={}|loc={}|class={}|book={}",
            fold(&self.subsidiary),
            u8::from(self.consolidated),
            fold(&self.department),
            fold(&self.location),
            fold(&self.class),
            self.book
        );
        FilterKey::from_canonical(text)
    }
}

fn collapse(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() { None } else { Some(joined) }
}

fn is_wildcard(text: &str) -> bool {
    matches!(text.to_ascii_lowercase().as_str(), "all" | "*" | "0" | "-")
}

fn fold(value: &Option<String>) -> String {
    value
        .as_deref()
        .map(|v| v.to_lowercase())
        .unwrap_or_default()
}

/// Normalized filter identity plus a stable 64-bit hash.
///
/// The hash is what persisted manifest keys use; the canonical text is kept
/// so equality never depends on hash collisions.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterKey {
    text: String,
    hash: u64,
}

impl FilterKey {
    fn from_canonical(text: String) -> Self {
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        let hash = hasher.finish();
        Self { text, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn hash64(&self) -> u64 {
        self.hash
    }

    /// Short hex form used inside composite keys.
    pub fn short(&self) -> String {
        format!("{:016x}", self.hash)
    }
}

impl Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
