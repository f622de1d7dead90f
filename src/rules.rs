//! Allow/block rule engine.
//!
//! Rules are evaluated against an attribute bag describing a candidate
//! artifact (advisory name, security impact, image name, ...). Evaluation is
//! pure; all compilation errors surface when the rules are loaded.
//!
//! Configuration shape, per handler and artifact type:
//!
//! ```toml
//! [handler_build_allowlist.RebuildImagesOnRpmAdvisory]
//! image = [
//!     { advisory_name = "RHSA-.*" },
//!     { any = [ { image_name = ["foo", "bar"] }, { advisory_security_impact = "Critical" } ] },
//! ]
//! ```
//!
//! A string is a regular expression searched anywhere in the attribute; an
//! array is a set of accepted literals. `any` and `all` combine nested rules.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::ArtifactType;

/// Attributes a rule is evaluated against.
pub type Attributes = BTreeMap<String, Value>;

/// Uncompiled rules as read from configuration: handler -> artifact type -> rules.
pub type RawRuleTable = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

type HandlerRules = BTreeMap<String, BTreeMap<ArtifactType, Vec<Rule>>>;

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Matches a single attribute value.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Regular expression searched anywhere in the string form of the value.
    Pattern(Regex),
    /// Accepted literals. A list value matches if any element is accepted.
    OneOf(BTreeSet<String>),
}

impl Matcher {
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|e| Error::Rule(format!("invalid pattern {pattern:?}: {e}")))
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Matcher::OneOf(values.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => false,
            (Matcher::Pattern(re), Value::Array(items)) => items
                .iter()
                .filter_map(string_form)
                .any(|s| re.is_match(&s)),
            (Matcher::Pattern(re), other) => string_form(other).is_some_and(|s| re.is_match(&s)),
            (Matcher::OneOf(allowed), Value::Array(items)) => items
                .iter()
                .filter_map(string_form)
                .any(|s| allowed.contains(s.as_ref())),
            (Matcher::OneOf(allowed), other) => {
                string_form(other).is_some_and(|s| allowed.contains(s.as_ref()))
            }
        }
    }

    fn from_value(field: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(pattern) => Matcher::pattern(pattern),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Array(_) | Value::Object(_) | Value::Null => Err(Error::Rule(format!(
                        "field {field:?}: set members must be scalars, got {item}"
                    ))),
                    scalar => Ok(string_form(scalar).map(Cow::into_owned).unwrap_or_default()),
                })
                .collect::<Result<BTreeSet<_>>>()
                .map(Matcher::OneOf),
            other => Err(Error::Rule(format!(
                "field {field:?}: unsupported matcher {other}, expected a pattern string or an array of values"
            ))),
        }
    }
}

fn string_form(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(Cow::Borrowed(s)),
        other => Some(Cow::Owned(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// A predicate over [`Attributes`].
#[derive(Debug, Clone)]
pub enum Rule {
    /// Every listed attribute must match its matcher.
    Field(BTreeMap<String, Matcher>),
    /// At least one nested rule matches. `Any([])` matches nothing.
    Any(Vec<Rule>),
    /// Every nested rule matches. `All([])` matches everything.
    All(Vec<Rule>),
}

impl Rule {
    pub fn field(name: impl Into<String>, matcher: Matcher) -> Self {
        Rule::Field(BTreeMap::from([(name.into(), matcher)]))
    }

    /// Add another field to a field rule.
    pub fn and_field(self, name: impl Into<String>, matcher: Matcher) -> Self {
        match self {
            Rule::Field(mut fields) => {
                fields.insert(name.into(), matcher);
                Rule::Field(fields)
            }
            other => Rule::All(vec![other, Rule::field(name, matcher)]),
        }
    }

    /// Strict evaluation: an attribute missing from `attrs` never matches.
    pub fn matches(&self, attrs: &Attributes) -> bool {
        self.eval(attrs, false)
    }

    /// Partial evaluation: attributes missing from `attrs` are assumed to
    /// match. False means no completion of `attrs` can satisfy the rule.
    pub fn may_match(&self, attrs: &Attributes) -> bool {
        self.eval(attrs, true)
    }

    fn eval(&self, attrs: &Attributes, absent: bool) -> bool {
        match self {
            Rule::Field(fields) => fields.iter().all(|(name, matcher)| match attrs.get(name) {
                Some(value) => matcher.matches(value),
                None => absent,
            }),
            Rule::Any(rules) => rules.iter().any(|r| r.eval(attrs, absent)),
            Rule::All(rules) => rules.iter().all(|r| r.eval(attrs, absent)),
        }
    }

    /// Compile a rule from its configuration form.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::Rule(format!("rule must be a table, got {value}")));
        };

        for combinator in ["any", "all"] {
            if let Some(nested) = map.get(combinator) {
                if map.len() != 1 {
                    return Err(Error::Rule(format!(
                        "{combinator:?} cannot be combined with other keys in the same rule"
                    )));
                }
                let Value::Array(items) = nested else {
                    return Err(Error::Rule(format!(
                        "{combinator:?} expects an array of rules, got {nested}"
                    )));
                };
                let rules = items.iter().map(Rule::from_value).collect::<Result<Vec<_>>>()?;
                return Ok(if combinator == "any" {
                    Rule::Any(rules)
                } else {
                    Rule::All(rules)
                });
            }
        }

        map.iter()
            .map(|(field, matcher)| Ok((field.clone(), Matcher::from_value(field, matcher)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Rule::Field)
    }
}

// ---------------------------------------------------------------------------
// Allow / block lists
// ---------------------------------------------------------------------------

/// Outcome of an allow/block check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// An allow list exists and nothing in it matched.
    NotAllowlisted,
    /// A block list rule matched.
    Blocklisted,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allowed
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Decision::Allowed => "allowed",
            Decision::NotAllowlisted => "not in allowlist",
            Decision::Blocklisted => "in blocklist",
        })
    }
}

/// Compiled allow and block lists keyed by handler name, then artifact type.
#[derive(Debug, Clone, Default)]
pub struct RuleLists {
    allow: HandlerRules,
    block: HandlerRules,
}

impl RuleLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile both lists, failing on the first malformed rule.
    pub fn from_config(allow: &RawRuleTable, block: &RawRuleTable) -> Result<Self> {
        Ok(Self {
            allow: compile_table("handler_build_allowlist", allow)?,
            block: compile_table("handler_build_blocklist", block)?,
        })
    }

    pub fn allow(mut self, handler: &str, artifact_type: ArtifactType, rule: Rule) -> Self {
        push_rule(&mut self.allow, handler, artifact_type, rule);
        self
    }

    pub fn block(mut self, handler: &str, artifact_type: ArtifactType, rule: Rule) -> Self {
        push_rule(&mut self.block, handler, artifact_type, rule);
        self
    }

    /// Whether `handler` may act on an artifact with these attributes.
    pub fn decide(&self, handler: &str, artifact_type: ArtifactType, attrs: &Attributes) -> Decision {
        self.evaluate(handler, artifact_type, |rule| rule.matches(attrs))
    }

    pub fn allows(&self, handler: &str, artifact_type: ArtifactType, attrs: &Attributes) -> bool {
        self.decide(handler, artifact_type, attrs).is_allowed()
    }

    /// Like [`RuleLists::decide`] on an incomplete attribute bag. Allow rules
    /// use partial evaluation, block rules stay strict, so only definite
    /// rejections are reported.
    pub fn decide_partial(
        &self,
        handler: &str,
        artifact_type: ArtifactType,
        attrs: &Attributes,
    ) -> Decision {
        let allow = lookup(&self.allow, handler, artifact_type);
        if !allow.is_empty() && !allow.iter().any(|rule| rule.may_match(attrs)) {
            return Decision::NotAllowlisted;
        }
        let block = lookup(&self.block, handler, artifact_type);
        if block.iter().any(|rule| rule.matches(attrs)) {
            return Decision::Blocklisted;
        }
        Decision::Allowed
    }

    pub fn may_allow(&self, handler: &str, artifact_type: ArtifactType, attrs: &Attributes) -> bool {
        self.decide_partial(handler, artifact_type, attrs).is_allowed()
    }

    fn evaluate(
        &self,
        handler: &str,
        artifact_type: ArtifactType,
        matches: impl Fn(&Rule) -> bool,
    ) -> Decision {
        let allow = lookup(&self.allow, handler, artifact_type);
        if !allow.is_empty() && !allow.iter().any(&matches) {
            return Decision::NotAllowlisted;
        }
        let block = lookup(&self.block, handler, artifact_type);
        if block.iter().any(&matches) {
            return Decision::Blocklisted;
        }
        Decision::Allowed
    }
}

fn lookup<'a>(rules: &'a HandlerRules, handler: &str, artifact_type: ArtifactType) -> &'a [Rule] {
    rules
        .get(handler)
        .and_then(|by_type| by_type.get(&artifact_type))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn push_rule(rules: &mut HandlerRules, handler: &str, artifact_type: ArtifactType, rule: Rule) {
    rules
        .entry(handler.to_string())
        .or_default()
        .entry(artifact_type)
        .or_default()
        .push(rule);
}

fn compile_table(section: &str, raw: &RawRuleTable) -> Result<HandlerRules> {
    let mut compiled = HandlerRules::new();
    for (handler, by_type) in raw {
        for (type_name, rules) in by_type {
            let artifact_type: ArtifactType = type_name.parse().map_err(|_| {
                Error::Rule(format!("{section}.{handler}: unknown artifact type {type_name:?}"))
            })?;
            for (i, value) in rules.iter().enumerate() {
                let rule = Rule::from_value(value).map_err(|e| {
                    Error::Rule(format!("{section}.{handler}.{type_name}[{i}]: {e}"))
                })?;
                push_rule(&mut compiled, handler, artifact_type, rule);
            }
        }
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HANDLER: &str = "RebuildImagesOnRpmAdvisory";

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn empty_combinators() {
        let bag = attrs(json!({"k": "a"}));
        assert!(Rule::All(vec![]).matches(&bag));
        assert!(!Rule::Any(vec![]).matches(&bag));
        assert!(Rule::All(vec![]).matches(&Attributes::new()));
    }

    #[test]
    fn set_matcher_on_scalars_and_lists() {
        let rule = Rule::field("k", Matcher::one_of(["a", "b"]));
        assert!(rule.matches(&attrs(json!({"k": "a"}))));
        assert!(rule.matches(&attrs(json!({"k": ["a", "x"]}))));
        assert!(!rule.matches(&attrs(json!({"k": "c"}))));
        assert!(!rule.matches(&attrs(json!({"k": ["c", "d"]}))));
        assert!(!rule.matches(&attrs(json!({"other": "a"}))));
    }

    #[test]
    fn pattern_searches_anywhere() {
        let rule = Rule::field("advisory_name", Matcher::pattern("RHSA-.*").unwrap());
        assert!(rule.matches(&attrs(json!({"advisory_name": "RHSA-2017"}))));
        assert!(rule.matches(&attrs(json!({"advisory_name": "prefix RHSA-1"}))));
        assert!(!rule.matches(&attrs(json!({"advisory_name": "RHBA-2017"}))));

        let anchored = Rule::field("advisory_id", Matcher::pattern("^12").unwrap());
        assert!(anchored.matches(&attrs(json!({"advisory_id": 123}))));
        assert!(!anchored.matches(&attrs(json!({"advisory_id": 312}))));
    }

    #[test]
    fn field_rule_is_a_conjunction() {
        let rule = Rule::field("image_name", Matcher::one_of(["foo", "bar"]))
            .and_field("advisory_name", Matcher::pattern("RHSA-.*").unwrap());

        assert!(rule.matches(&attrs(json!({"image_name": "foo", "advisory_name": "RHSA-1"}))));
        assert!(!rule.matches(&attrs(json!({"image_name": "foo", "advisory_name": "RHBA-1"}))));
        assert!(!rule.matches(&attrs(json!({"image_name": "foo"}))));
        assert!(rule.may_match(&attrs(json!({"image_name": "foo"}))));
        assert!(!rule.may_match(&attrs(json!({"image_name": "unknown"}))));
    }

    #[test]
    fn nested_combinators() {
        let rule = Rule::from_value(&json!({
            "any": [
                {"all": [{"advisory_name": "RHSA-.*"}, {"advisory_security_impact": ["Critical", "Important"]}]},
                {"image_name": ["always-rebuild"]},
            ]
        }))
        .unwrap();

        assert!(rule.matches(&attrs(json!({
            "advisory_name": "RHSA-1",
            "advisory_security_impact": "Critical",
        }))));
        assert!(!rule.matches(&attrs(json!({
            "advisory_name": "RHSA-1",
            "advisory_security_impact": "Low",
        }))));
        assert!(rule.matches(&attrs(json!({"image_name": "always-rebuild"}))));
    }

    #[test]
    fn allowlist_scenario_by_advisory_name() {
        let lists = RuleLists::new().allow(
            HANDLER,
            ArtifactType::Image,
            Rule::field("advisory_name", Matcher::pattern("RHSA-.*").unwrap()),
        );

        let rhsa = attrs(json!({"advisory_name": "RHSA-2017"}));
        let rhba = attrs(json!({"advisory_name": "RHBA-2017"}));
        assert!(lists.allows(HANDLER, ArtifactType::Image, &rhsa));
        assert_eq!(
            lists.decide(HANDLER, ArtifactType::Image, &rhba),
            Decision::NotAllowlisted
        );

        // Other handlers and artifact types are unconstrained.
        assert!(lists.allows("OtherHandler", ArtifactType::Image, &rhba));
        assert!(lists.allows(HANDLER, ArtifactType::Module, &rhba));
    }

    #[test]
    fn security_impact_allowlist() {
        let lists = RuleLists::new().allow(
            HANDLER,
            ArtifactType::Image,
            Rule::field(
                "advisory_security_impact",
                Matcher::one_of(["Normal", "Important"]),
            ),
        );
        let important = attrs(json!({"advisory_security_impact": "Important"}));
        let none = attrs(json!({"advisory_security_impact": "None"}));
        assert!(lists.allows(HANDLER, ArtifactType::Image, &important));
        assert!(!lists.allows(HANDLER, ArtifactType::Image, &none));
    }

    #[test]
    fn blocklist_overrides_allowlist() {
        let lists = RuleLists::new()
            .allow(
                HANDLER,
                ArtifactType::Image,
                Rule::field("advisory_name", Matcher::pattern("RHSA-.*").unwrap()),
            )
            .block(
                HANDLER,
                ArtifactType::Image,
                Rule::field("image_name", Matcher::one_of(["legacy"])),
            );

        let ok = attrs(json!({"advisory_name": "RHSA-1", "image_name": "foo"}));
        let blocked = attrs(json!({"advisory_name": "RHSA-1", "image_name": "legacy"}));
        assert!(lists.allows(HANDLER, ArtifactType::Image, &ok));
        assert_eq!(
            lists.decide(HANDLER, ArtifactType::Image, &blocked),
            Decision::Blocklisted
        );
    }

    #[test]
    fn partial_decision_only_rejects_definite_mismatches() {
        let lists = RuleLists::new()
            .allow(
                HANDLER,
                ArtifactType::Image,
                Rule::field("image_name", Matcher::one_of(["foo"]))
                    .and_field("advisory_name", Matcher::pattern("RHSA-.*").unwrap()),
            )
            .block(
                HANDLER,
                ArtifactType::Image,
                Rule::field("image_name", Matcher::one_of(["foo"])),
            );

        let advisory_only = attrs(json!({"advisory_name": "RHSA-1"}));
        assert!(lists.decide_partial(HANDLER, ArtifactType::Image, &advisory_only).is_allowed());
        assert!(!lists.allows(HANDLER, ArtifactType::Image, &advisory_only));

        let wrong_advisory = attrs(json!({"advisory_name": "RHBA-1"}));
        assert_eq!(
            lists.decide_partial(HANDLER, ArtifactType::Image, &wrong_advisory),
            Decision::NotAllowlisted
        );
    }

    #[test]
    fn compiles_configuration_tables() {
        let raw: RawRuleTable = serde_json::from_value(json!({
            HANDLER: {
                "image": [{"advisory_name": "RHSA-.*"}, {"any": []}],
            }
        }))
        .unwrap();
        let lists = RuleLists::from_config(&raw, &RawRuleTable::new()).unwrap();
        assert!(lists.allows(
            HANDLER,
            ArtifactType::Image,
            &attrs(json!({"advisory_name": "RHSA-9"}))
        ));
    }

    #[test]
    fn malformed_rules_are_rejected() {
        for bad in [
            json!("RHSA-.*"),
            json!({"advisory_name": 5}),
            json!({"advisory_name": {"nested": true}}),
            json!({"advisory_name": [["a"]]}),
            json!({"any": {"advisory_name": "x"}}),
            json!({"any": [], "advisory_name": "x"}),
            json!({"advisory_name": "RHSA-("}),
        ] {
            assert!(
                matches!(Rule::from_value(&bad), Err(Error::Rule(_))),
                "expected rule error for {bad}"
            );
        }

        let raw: RawRuleTable = serde_json::from_value(json!({
            HANDLER: {"image": [{"advisory_name": 5}]}
        }))
        .unwrap();
        let err = RuleLists::from_config(&RawRuleTable::new(), &raw).unwrap_err();
        assert!(err.to_string().contains("handler_build_blocklist"));

        let raw: RawRuleTable = serde_json::from_value(json!({
            HANDLER: {"container": [{"advisory_name": "x"}]}
        }))
        .unwrap();
        assert!(matches!(
            RuleLists::from_config(&raw, &RawRuleTable::new()),
            Err(Error::Rule(_))
        ));
    }
}
