// src/correlation/rule.rs

//! Compiled correlation rules.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use regex::Regex;
use thiserror::Error;

use crate::config::{CompletionSection, FilterSection, RuleSection, parse_duration};
use crate::events::Event;
use crate::workflow::DefinitionRef;

/// Why a rule could not be compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("invalid workflow reference: {0}")]
    InvalidWorkflow(String),

    #[error("correlation key attribute must not be empty")]
    EmptyKey,

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("invalid event type pattern '{pattern}': {message}")]
    InvalidTypePattern { pattern: String, message: String },

    #[error("invalid pattern for attribute '{attribute}': {message}")]
    InvalidAttributePattern { attribute: String, message: String },

    #[error("invalid completion: {0}")]
    InvalidCompletion(String),
}

/// Which events a rule looks at.
#[derive(Debug, Clone)]
pub struct EventFilter {
    type_pattern: String,
    type_matcher: GlobMatcher,
    source: Option<String>,
    attributes: Vec<(String, Regex)>,
}

impl EventFilter {
    pub fn compile(section: &FilterSection) -> Result<Self, GateError> {
        let type_matcher = Glob::new(&section.event_type)
            .map_err(|e| GateError::InvalidTypePattern {
                pattern: section.event_type.clone(),
                message: e.to_string(),
            })?
            .compile_matcher();

        let attributes = section
            .attributes
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|re| (name.clone(), re))
                    .map_err(|e| GateError::InvalidAttributePattern {
                        attribute: name.clone(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            type_pattern: section.event_type.clone(),
            type_matcher,
            source: section.source.clone(),
            attributes,
        })
    }

    pub fn type_pattern(&self) -> &str {
        &self.type_pattern
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.type_matcher.is_match(&event.event_type) {
            return false;
        }
        if self.source.as_ref().is_some_and(|s| s != &event.source) {
            return false;
        }
        self.attributes.iter().all(|(name, re)| {
            event
                .attribute(name)
                .is_some_and(|value| re.is_match(&value))
        })
    }
}

/// When a context has seen enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionPredicate {
    /// Every listed type seen at least once.
    AllOf(BTreeSet<String>),
    /// One type seen `count` times.
    AnyOf { event_type: String, count: u32 },
}

impl CompletionPredicate {
    pub fn compile(section: &CompletionSection) -> Result<Self, GateError> {
        match (&section.all_of[..], &section.any_of) {
            ([], None) => Err(GateError::InvalidCompletion(
                "one of all_of or any_of is required".into(),
            )),
            ([_, ..], Some(_)) => Err(GateError::InvalidCompletion(
                "all_of and any_of are mutually exclusive".into(),
            )),
            (types, None) => Ok(CompletionPredicate::AllOf(types.iter().cloned().collect())),
            ([], Some(event_type)) => {
                if section.count == 0 {
                    return Err(GateError::InvalidCompletion("count must be >= 1".into()));
                }
                Ok(CompletionPredicate::AnyOf {
                    event_type: event_type.clone(),
                    count: section.count,
                })
            }
        }
    }

    /// Whether events of this type count towards completion.
    pub fn is_relevant(&self, event_type: &str) -> bool {
        match self {
            CompletionPredicate::AllOf(types) => types.contains(event_type),
            CompletionPredicate::AnyOf { event_type: t, .. } => t == event_type,
        }
    }

    pub fn is_satisfied(&self, seen: &BTreeMap<String, u32>) -> bool {
        match self {
            CompletionPredicate::AllOf(types) => {
                types.iter().all(|t| seen.get(t).is_some_and(|n| *n > 0))
            }
            CompletionPredicate::AnyOf { event_type, count } => {
                seen.get(event_type).is_some_and(|n| n >= count)
            }
        }
    }
}

/// A named rule: which events to correlate, by what key, until when, and
/// which workflow to start once complete.
#[derive(Debug, Clone)]
pub struct CorrelationRule {
    pub name: String,
    pub workflow: DefinitionRef,
    pub key: String,
    pub ttl: Duration,
    pub filters: Vec<EventFilter>,
    pub completion: CompletionPredicate,
}

impl CorrelationRule {
    pub fn compile(section: &RuleSection) -> Result<Self, GateError> {
        let workflow = section
            .workflow
            .parse::<DefinitionRef>()
            .map_err(GateError::InvalidWorkflow)?;
        if section.key.trim().is_empty() {
            return Err(GateError::EmptyKey);
        }
        let ttl = parse_duration(&section.ttl).map_err(GateError::InvalidTtl)?;
        if ttl.is_zero() {
            return Err(GateError::InvalidTtl("must be greater than zero".into()));
        }
        let filters = section
            .filters
            .iter()
            .map(EventFilter::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: section.name.clone(),
            workflow,
            key: section.key.trim().to_string(),
            ttl,
            filters,
            completion: CompletionPredicate::compile(&section.completion)?,
        })
    }

    /// The event passes a filter (any, when filters exist) and its type
    /// counts towards completion.
    pub fn accepts(&self, event: &Event) -> bool {
        if !self.completion.is_relevant(&event.event_type) {
            return false;
        }
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(event))
    }

    /// Correlation key of `event`, if it carries a non-empty one.
    pub fn key_of(&self, event: &Event) -> Option<String> {
        event.attribute(&self.key).filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(completion: CompletionSection) -> RuleSection {
        RuleSection {
            name: "order-ready".into(),
            workflow: "fulfil@1".into(),
            key: "orderid".into(),
            ttl: "10m".into(),
            filters: vec![FilterSection {
                event_type: "com.acme.order.*".into(),
                source: None,
                attributes: BTreeMap::from([("data.region".to_string(), "^eu-".to_string())]),
            }],
            completion,
        }
    }

    fn all_of(types: &[&str]) -> CompletionSection {
        CompletionSection {
            all_of: types.iter().map(|t| t.to_string()).collect(),
            any_of: None,
            count: 1,
        }
    }

    fn event(event_type: &str, region: &str) -> Event {
        Event::new(event_type, "/shop")
            .with_extension("orderid", "7")
            .with_data(serde_json::json!({"region": region}))
    }

    #[test]
    fn filters_check_type_glob_and_attributes() {
        let rule = CorrelationRule::compile(&section(all_of(&["com.acme.order.paid"]))).unwrap();
        assert!(rule.accepts(&event("com.acme.order.paid", "eu-west")));
        assert!(!rule.accepts(&event("com.acme.order.paid", "us-east")));
        assert!(!rule.accepts(&event("com.acme.order.cancelled", "eu-west")));
        assert_eq!(rule.key_of(&event("x", "eu")).as_deref(), Some("7"));
    }

    #[test]
    fn completion_requires_exactly_one_form() {
        let none = CompletionSection {
            all_of: vec![],
            any_of: None,
            count: 1,
        };
        assert!(CompletionPredicate::compile(&none).is_err());

        let both = CompletionSection {
            all_of: vec!["a".into()],
            any_of: Some("b".into()),
            count: 1,
        };
        assert!(CompletionPredicate::compile(&both).is_err());
    }

    #[test]
    fn any_of_counts_occurrences() {
        let p = CompletionPredicate::AnyOf {
            event_type: "tick".into(),
            count: 3,
        };
        let mut seen = BTreeMap::from([("tick".to_string(), 2)]);
        assert!(!p.is_satisfied(&seen));
        seen.insert("tick".into(), 3);
        assert!(p.is_satisfied(&seen));
    }

    #[test]
    fn bad_patterns_are_reported() {
        let mut s = section(all_of(&["a"]));
        s.filters[0].attributes.insert("subject".into(), "(".into());
        assert!(matches!(
            CorrelationRule::compile(&s),
            Err(GateError::InvalidAttributePattern { .. })
        ));

        let mut s = section(all_of(&["a"]));
        s.workflow = "no-version".into();
        assert!(matches!(
            CorrelationRule::compile(&s),
            Err(GateError::InvalidWorkflow(_))
        ));
    }
}
