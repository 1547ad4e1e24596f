use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Sparse filter; every present field narrows the result (AND).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCriteria {
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub since: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
    /// `Some(true)` restricts to unread. `Some(false)` is the same as `None`.
    pub unseen: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchTerm {
    From(String),
    To(String),
    Subject(String),
    Body(String),
    Since(NaiveDate),
    Before(NaiveDate),
    Unseen,
}

impl SearchCriteria {
    pub fn terms(&self) -> Vec<SearchTerm> {
        let mut terms = Vec::new();
        let text = |v: &Option<String>| v.as_ref().filter(|s| !s.is_empty()).cloned();

        if let Some(v) = text(&self.from) {
            terms.push(SearchTerm::From(v));
        }
        if let Some(v) = text(&self.to) {
            terms.push(SearchTerm::To(v));
        }
        if let Some(v) = text(&self.subject) {
            terms.push(SearchTerm::Subject(v));
        }
        if let Some(v) = text(&self.body) {
            terms.push(SearchTerm::Body(v));
        }
        if let Some(d) = self.since {
            terms.push(SearchTerm::Since(d));
        }
        if let Some(d) = self.before {
            terms.push(SearchTerm::Before(d));
        }
        if self.unseen == Some(true) {
            terms.push(SearchTerm::Unseen);
        }
        terms
    }

    /// IMAP SEARCH key list. Terms are space separated, which IMAP reads as AND.
    ///
    /// Queries carrying non-ASCII text are prefixed with `CHARSET UTF-8`.
    pub fn to_query(&self) -> String {
        let terms = self.terms();
        if terms.is_empty() {
            return "ALL".to_string();
        }
        let query = terms.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
        if query.is_ascii() {
            query
        } else {
            format!("CHARSET UTF-8 {query}")
        }
    }
}

impl fmt::Display for SearchTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchTerm::From(v) => write!(f, "FROM {}", quote(v)),
            SearchTerm::To(v) => write!(f, "TO {}", quote(v)),
            SearchTerm::Subject(v) => write!(f, "SUBJECT {}", quote(v)),
            SearchTerm::Body(v) => write!(f, "BODY {}", quote(v)),
            SearchTerm::Since(d) => write!(f, "SINCE {}", imap_date(*d)),
            SearchTerm::Before(d) => write!(f, "BEFORE {}", imap_date(*d)),
            SearchTerm::Unseen => f.write_str("UNSEEN"),
        }
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\r' | '\n' => out.push(' '),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// RFC 3501 `date`: `1-Feb-2024`.
fn imap_date(d: NaiveDate) -> String {
    d.format("%-d-%b-%Y").to_string()
}
