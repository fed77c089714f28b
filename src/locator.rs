//! Candidate locator DSL.
//!
//! A candidate is a human-authored string such as `label=/Email/i`,
//! `role=button[name=/send/i]` or `css=input[type='email']`. Parsing turns it
//! into a typed [`LocatorSpec`] that the injected query engine evaluates
//! against the live document.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/(.+)/(i)?$").expect("static regex"));
static ROLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^role=([a-zA-Z]+)\s*(?:\[\s*name\s*=\s*(.+?)\s*\])?$").expect("static regex")
});
static NAME_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^name\s*=\s*(.+)$").expect("static regex"));
static ID_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^id\s*=\s*(.+)$").expect("static regex"));
static TESTID_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:data-)?testid\s*=\s*(.+)$").expect("static regex"));
static ARIA_LABEL_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^aria-label\s*=\s*(.+)$").expect("static regex"));

/// How a label/placeholder/text/name value is compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "match", rename_all = "lowercase")]
pub enum TextMatch {
    /// Case-insensitive, whitespace-normalized substring.
    Literal { value: String },
    /// Regular expression, tested against the normalized text.
    Pattern { source: String, ignore_case: bool },
}

impl TextMatch {
    /// `/source/` or `/source/i` compiles to a pattern; anything else is literal.
    pub fn parse(value: &str) -> Self {
        match PATTERN.captures(value) {
            Some(caps) => TextMatch::Pattern {
                source: caps[1].to_string(),
                ignore_case: caps.get(2).is_some(),
            },
            None => TextMatch::Literal {
                value: value.to_string(),
            },
        }
    }
}

impl fmt::Display for TextMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextMatch::Literal { value } => write!(f, "{}", value),
            TextMatch::Pattern {
                source,
                ignore_case,
            } => write!(f, "/{}/{}", source, if *ignore_case { "i" } else { "" }),
        }
    }
}

/// A parsed candidate: strategy plus what it matches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LocatorSpec {
    Label { text: TextMatch },
    Placeholder { text: TextMatch },
    Text { text: TextMatch },
    Role { role: String, name: Option<TextMatch> },
    Css { selector: String },
}

impl LocatorSpec {
    /// Parse one candidate string. Never fails: unrecognized forms are
    /// treated as raw CSS and left for the document to reject.
    pub fn parse(raw: &str) -> Self {
        let candidate = expand_shorthand(raw.trim());

        if let Some(value) = candidate.strip_prefix("label=") {
            return LocatorSpec::Label {
                text: TextMatch::parse(value),
            };
        }
        if let Some(value) = candidate.strip_prefix("placeholder=") {
            return LocatorSpec::Placeholder {
                text: TextMatch::parse(value),
            };
        }
        if let Some(value) = candidate.strip_prefix("text=") {
            return LocatorSpec::Text {
                text: TextMatch::parse(value),
            };
        }
        if candidate.starts_with("role=")
            && let Some(caps) = ROLE.captures(&candidate)
        {
            return LocatorSpec::Role {
                role: caps[1].to_lowercase(),
                name: caps.get(2).map(|m| TextMatch::parse(m.as_str())),
            };
        }
        if let Some(selector) = candidate.strip_prefix("css=") {
            return LocatorSpec::Css {
                selector: selector.to_string(),
            };
        }
        LocatorSpec::Css {
            selector: candidate,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LocatorSpec::Label { .. } => "label",
            LocatorSpec::Placeholder { .. } => "placeholder",
            LocatorSpec::Text { .. } => "text",
            LocatorSpec::Role { .. } => "role",
            LocatorSpec::Css { .. } => "css",
        }
    }
}

impl fmt::Display for LocatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocatorSpec::Label { text } => write!(f, "label={}", text),
            LocatorSpec::Placeholder { text } => write!(f, "placeholder={}", text),
            LocatorSpec::Text { text } => write!(f, "text={}", text),
            LocatorSpec::Role { role, name: None } => write!(f, "role={}", role),
            LocatorSpec::Role {
                role,
                name: Some(name),
            } => write!(f, "role={}[name={}]", role, name),
            LocatorSpec::Css { selector } => write!(f, "css={}", selector),
        }
    }
}

/// Rewrite `name=`, `id=`, `testid=`/`data-testid=` and `aria-label=`
/// shorthands into `css=` attribute selectors.
fn expand_shorthand(candidate: &str) -> String {
    if let Some(caps) = NAME_ATTR.captures(candidate) {
        return format!("css=[name=\"{}\"]", caps[1].trim());
    }
    if let Some(caps) = ID_ATTR.captures(candidate) {
        return format!("css=#{}", caps[1].trim());
    }
    if let Some(caps) = TESTID_ATTR.captures(candidate) {
        return format!("css=[data-testid=\"{}\"]", caps[1].trim());
    }
    if let Some(caps) = ARIA_LABEL_ATTR.captures(candidate) {
        return format!("css=[aria-label=\"{}\"]", caps[1].trim());
    }
    candidate.to_string()
}
