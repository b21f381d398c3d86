//! Projection expressions.

use borzoi_common::collections::{FastHashMap, FastHashSet};
use borzoi_error::{generic_error, GenericError};
use regex::Regex;
use serde::Deserialize;

use crate::record::AttributeValue;

/// A single pattern/value case of a `first_match` expression.
#[derive(Clone, Debug, Deserialize)]
pub struct MatchCaseConfig {
    /// Regular expression the input must match for this case to apply.
    pub pattern: String,

    /// Value produced when the pattern matches.
    pub value: AttributeValue,
}

/// A declarative projection expression, as written in rule files.
///
/// Expressions form a small pure language over attribute values: an expression either produces a value or produces
/// nothing because a referenced source attribute was absent. Compilation into an [`Expression`] validates shape and
/// regular expression syntax up front.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionConfig {
    /// A fixed value.
    Constant {
        /// The value to produce.
        value: AttributeValue,
    },

    /// The value of a source attribute.
    Source {
        /// The attribute key to read.
        key: String,
    },

    /// The string concatenation of sub-expressions.
    ///
    /// Produces nothing if any part produces nothing.
    Concat {
        /// Sub-expressions whose string forms are joined.
        parts: Vec<ExpressionConfig>,

        /// Separator placed between parts. Defaults to the empty string.
        #[serde(default)]
        separator: String,
    },

    /// The first sub-expression that produces a value.
    Coalesce {
        /// Sub-expressions tried in order.
        options: Vec<ExpressionConfig>,
    },

    /// The lowercased string form of a sub-expression.
    Lowercase {
        /// The sub-expression to lowercase.
        input: Box<ExpressionConfig>,
    },

    /// The uppercased string form of a sub-expression.
    Uppercase {
        /// The sub-expression to uppercase.
        input: Box<ExpressionConfig>,
    },

    /// Whether a sub-expression's value is one of a fixed set.
    EqualsAny {
        /// The sub-expression to test.
        input: Box<ExpressionConfig>,

        /// The values tested against.
        values: Vec<AttributeValue>,
    },

    /// Whether a sub-expression's string form matches a regular expression.
    Matches {
        /// The sub-expression to test.
        input: Box<ExpressionConfig>,

        /// The regular expression tested against.
        pattern: String,
    },

    /// The value of the first case whose pattern matches a sub-expression's string form.
    ///
    /// Falls back to `fallback` when no case matches; without a fallback, a non-matching input produces nothing.
    FirstMatch {
        /// The sub-expression to test.
        input: Box<ExpressionConfig>,

        /// Cases tried in order.
        cases: Vec<MatchCaseConfig>,

        /// Value produced when no case matches.
        #[serde(default)]
        fallback: Option<AttributeValue>,
    },
}

#[derive(Debug)]
struct MatchCase {
    pattern: Regex,
    value: AttributeValue,
}

#[derive(Debug)]
enum Node {
    Constant(AttributeValue),
    Source(String),
    Concat { parts: Vec<Node>, separator: String },
    Coalesce(Vec<Node>),
    Lowercase(Box<Node>),
    Uppercase(Box<Node>),
    EqualsAny { input: Box<Node>, values: Vec<AttributeValue> },
    Matches { input: Box<Node>, pattern: Regex },
    FirstMatch { input: Box<Node>, cases: Vec<MatchCase>, fallback: Option<AttributeValue> },
}

/// A compiled projection expression.
#[derive(Debug)]
pub struct Expression {
    node: Node,
}

impl Expression {
    /// Compiles an expression from its declarative form.
    ///
    /// # Errors
    ///
    /// If the expression is structurally invalid, or contains an invalid regular expression, an error describing the
    /// problem is returned.
    pub fn compile(config: &ExpressionConfig) -> Result<Self, GenericError> {
        Ok(Self {
            node: build_node(config)?,
        })
    }

    /// Evaluates the expression against the given attribute view.
    ///
    /// Returns `None` when a source attribute the expression needs is absent from the view.
    pub fn evaluate(&self, env: &FastHashMap<String, AttributeValue>) -> Option<AttributeValue> {
        evaluate_node(&self.node, env)
    }

    /// Collects the source attribute keys referenced anywhere in the expression into `sources`.
    pub fn collect_sources(&self, sources: &mut FastHashSet<String>) {
        collect_node_sources(&self.node, sources);
    }
}

fn build_node(config: &ExpressionConfig) -> Result<Node, GenericError> {
    match config {
        ExpressionConfig::Constant { value } => Ok(Node::Constant(value.clone())),
        ExpressionConfig::Source { key } => {
            if key.is_empty() {
                return Err(generic_error!("source expression references an empty attribute key"));
            }
            Ok(Node::Source(key.clone()))
        }
        ExpressionConfig::Concat { parts, separator } => Ok(Node::Concat {
            parts: parts.iter().map(build_node).collect::<Result<_, _>>()?,
            separator: separator.clone(),
        }),
        ExpressionConfig::Coalesce { options } => {
            if options.is_empty() {
                return Err(generic_error!("coalesce expression requires at least one option"));
            }
            Ok(Node::Coalesce(options.iter().map(build_node).collect::<Result<_, _>>()?))
        }
        ExpressionConfig::Lowercase { input } => Ok(Node::Lowercase(Box::new(build_node(input)?))),
        ExpressionConfig::Uppercase { input } => Ok(Node::Uppercase(Box::new(build_node(input)?))),
        ExpressionConfig::EqualsAny { input, values } => Ok(Node::EqualsAny {
            input: Box::new(build_node(input)?),
            values: values.clone(),
        }),
        ExpressionConfig::Matches { input, pattern } => Ok(Node::Matches {
            input: Box::new(build_node(input)?),
            pattern: build_regex(pattern)?,
        }),
        ExpressionConfig::FirstMatch { input, cases, fallback } => {
            if cases.is_empty() {
                return Err(generic_error!("first_match expression requires at least one case"));
            }
            Ok(Node::FirstMatch {
                input: Box::new(build_node(input)?),
                cases: cases
                    .iter()
                    .map(|case| {
                        Ok(MatchCase {
                            pattern: build_regex(&case.pattern)?,
                            value: case.value.clone(),
                        })
                    })
                    .collect::<Result<_, GenericError>>()?,
                fallback: fallback.clone(),
            })
        }
    }
}

fn build_regex(pattern: &str) -> Result<Regex, GenericError> {
    Regex::new(pattern).map_err(|e| generic_error!("invalid pattern '{}': {}", pattern, e))
}

fn evaluate_node(node: &Node, env: &FastHashMap<String, AttributeValue>) -> Option<AttributeValue> {
    match node {
        Node::Constant(value) => Some(value.clone()),
        Node::Source(key) => env.get(key).cloned(),
        Node::Concat { parts, separator } => {
            let mut rendered = Vec::with_capacity(parts.len());
            for part in parts {
                rendered.push(evaluate_node(part, env)?.to_string());
            }
            Some(AttributeValue::String(rendered.join(separator)))
        }
        Node::Coalesce(options) => options.iter().find_map(|option| evaluate_node(option, env)),
        Node::Lowercase(input) => {
            Some(AttributeValue::String(evaluate_node(input, env)?.to_string().to_lowercase()))
        }
        Node::Uppercase(input) => {
            Some(AttributeValue::String(evaluate_node(input, env)?.to_string().to_uppercase()))
        }
        Node::EqualsAny { input, values } => {
            let value = evaluate_node(input, env)?;
            Some(AttributeValue::Boolean(values.contains(&value)))
        }
        Node::Matches { input, pattern } => {
            let value = evaluate_node(input, env)?.to_string();
            Some(AttributeValue::Boolean(pattern.is_match(&value)))
        }
        Node::FirstMatch { input, cases, fallback } => {
            let value = evaluate_node(input, env)?.to_string();
            cases
                .iter()
                .find(|case| case.pattern.is_match(&value))
                .map(|case| case.value.clone())
                .or_else(|| fallback.clone())
        }
    }
}

fn collect_node_sources(node: &Node, sources: &mut FastHashSet<String>) {
    match node {
        Node::Constant(_) => {}
        Node::Source(key) => {
            sources.insert(key.clone());
        }
        Node::Concat { parts, .. } => {
            for part in parts {
                collect_node_sources(part, sources);
            }
        }
        Node::Coalesce(options) => {
            for option in options {
                collect_node_sources(option, sources);
            }
        }
        Node::Lowercase(input) | Node::Uppercase(input) => collect_node_sources(input, sources),
        Node::EqualsAny { input, .. } | Node::Matches { input, .. } => collect_node_sources(input, sources),
        Node::FirstMatch { input, .. } => collect_node_sources(input, sources),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, AttributeValue)]) -> FastHashMap<String, AttributeValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn compile_yaml(raw: &str) -> Result<Expression, GenericError> {
        let config: ExpressionConfig = serde_yaml::from_str(raw).expect("should deserialize");
        Expression::compile(&config)
    }

    #[test]
    fn equals_any_over_source_attribute() {
        let expression = compile_yaml(
            "
            equals_any:
              input:
                source: { key: http.method }
              values: [GET, HEAD, OPTIONS]
            ",
        )
        .unwrap();

        let read = expression.evaluate(&env(&[("http.method", AttributeValue::from("GET"))]));
        assert_eq!(read, Some(AttributeValue::Boolean(true)));

        let write = expression.evaluate(&env(&[("http.method", AttributeValue::from("POST"))]));
        assert_eq!(write, Some(AttributeValue::Boolean(false)));

        let absent = expression.evaluate(&env(&[]));
        assert_eq!(absent, None);
    }

    #[test]
    fn concat_requires_every_part() {
        let expression = compile_yaml(
            "
            concat:
              separator: '/'
              parts:
                - source: { key: service.name }
                - source: { key: http.route }
            ",
        )
        .unwrap();

        let both = expression.evaluate(&env(&[
            ("service.name", AttributeValue::from("checkout")),
            ("http.route", AttributeValue::from("cart")),
        ]));
        assert_eq!(both, Some(AttributeValue::from("checkout/cart")));

        let partial = expression.evaluate(&env(&[("service.name", AttributeValue::from("checkout"))]));
        assert_eq!(partial, None);
    }

    #[test]
    fn coalesce_takes_the_first_present_option() {
        let expression = compile_yaml(
            "
            coalesce:
              options:
                - source: { key: http.route }
                - source: { key: http.target }
                - constant: { value: unknown }
            ",
        )
        .unwrap();

        let second = expression.evaluate(&env(&[("http.target", AttributeValue::from("/cart?id=1"))]));
        assert_eq!(second, Some(AttributeValue::from("/cart?id=1")));

        let fallback = expression.evaluate(&env(&[]));
        assert_eq!(fallback, Some(AttributeValue::from("unknown")));
    }

    #[test]
    fn first_match_maps_patterns_in_order() {
        let expression = compile_yaml(
            "
            first_match:
              input:
                source: { key: host.name }
              cases:
                - pattern: canary
                  value: canary
                - pattern: baseline
                  value: baseline
              fallback: stable
            ",
        )
        .unwrap();

        let canary = expression.evaluate(&env(&[("host.name", AttributeValue::from("web-canary-3"))]));
        assert_eq!(canary, Some(AttributeValue::from("canary")));

        let stable = expression.evaluate(&env(&[("host.name", AttributeValue::from("web-7"))]));
        assert_eq!(stable, Some(AttributeValue::from("stable")));
    }

    #[test]
    fn case_transforms_render_through_strings() {
        let expression = compile_yaml(
            "
            lowercase:
              input:
                source: { key: http.method }
            ",
        )
        .unwrap();

        let value = expression.evaluate(&env(&[("http.method", AttributeValue::from("GET"))]));
        assert_eq!(value, Some(AttributeValue::from("get")));
    }

    #[test]
    fn invalid_patterns_fail_compilation() {
        let error = compile_yaml(
            "
            matches:
              input:
                source: { key: http.route }
              pattern: '([unclosed'
            ",
        )
        .unwrap_err();
        assert!(error.to_string().contains("invalid pattern"));
    }

    #[test]
    fn empty_coalesce_fails_compilation() {
        let error = compile_yaml("coalesce: { options: [] }").unwrap_err();
        assert!(error.to_string().contains("at least one option"));
    }

    #[test]
    fn collect_sources_walks_the_whole_tree() {
        let expression = compile_yaml(
            "
            coalesce:
              options:
                - concat:
                    parts:
                      - source: { key: a }
                      - uppercase:
                          input:
                            source: { key: b }
                - matches:
                    input:
                      source: { key: c }
                    pattern: x
            ",
        )
        .unwrap();

        let mut sources = FastHashSet::default();
        expression.collect_sources(&mut sources);

        let mut sources: Vec<_> = sources.into_iter().collect();
        sources.sort();
        assert_eq!(sources, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
