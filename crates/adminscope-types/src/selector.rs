use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Equality-based label selector, e.g. `app=envoy,tier!=canary`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    terms: Vec<String>,
}

fn term_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // key: optional DNS prefix, then a name segment
        // value: empty or a label value
        Regex::new(
            r"^!?([a-z0-9]([-a-z0-9.]*[a-z0-9])?/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?(\s*(=|==|!=)\s*([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?)?$",
        )
        .expect("label selector pattern is valid")
    })
}

impl LabelSelector {
    /// Parse one or more `-l` arguments; each may itself be comma separated
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut terms = Vec::new();
        for arg in args {
            for term in arg.as_ref().split(',') {
                let term = term.trim();
                if term.is_empty() {
                    continue;
                }
                if !term_pattern().is_match(term) || (term.starts_with('!') && term.contains('=')) {
                    return Err(Error::InvalidArgument(format!(
                        "invalid label selector term '{}'",
                        term
                    )));
                }
                terms.push(term.to_string());
            }
        }
        Ok(Self { terms })
    }

    /// Build from terms already known to be valid
    pub(crate) fn from_trusted(terms: Vec<String>) -> Self {
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Selector in the form the API server expects for `labelSelector`
    pub fn to_query(&self) -> String {
        self.terms.join(",")
    }

    /// This selector, or `fallback` when empty
    pub fn or(&self, fallback: LabelSelector) -> LabelSelector {
        if self.is_empty() {
            fallback
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_merges_flags() {
        let selector =
            LabelSelector::parse(&["app=envoy,tier!=canary", "app.kubernetes.io/name==envoy"])
                .unwrap();
        assert_eq!(selector.terms().len(), 3);
        assert_eq!(
            selector.to_query(),
            "app=envoy,tier!=canary,app.kubernetes.io/name==envoy"
        );
    }

    #[test]
    fn test_parse_existence_terms() {
        let selector = LabelSelector::parse(&["gateway.envoyproxy.io/owning-gateway-name", "!canary"])
            .unwrap();
        assert_eq!(selector.terms().len(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LabelSelector::parse(&["app=="]).is_ok());
        assert!(LabelSelector::parse(&["=envoy"]).is_err());
        assert!(LabelSelector::parse(&["app=en voy"]).is_err());
        assert!(LabelSelector::parse(&["!app=envoy"]).is_err());
    }

    #[test]
    fn test_or_falls_back_when_empty() {
        let empty = LabelSelector::parse::<&str>(&[]).unwrap();
        let fallback = LabelSelector::parse(&["control-plane=envoy-gateway"]).unwrap();
        assert_eq!(empty.or(fallback.clone()), fallback);
    }
}
