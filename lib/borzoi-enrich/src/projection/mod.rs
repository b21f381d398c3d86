//! Derived-attribute projection.
//!
//! Projection rules derive new attributes from existing ones through pure declarative expressions. A rule set is
//! loaded and validated once at startup; evaluation is deterministic, side-effect free, and ordered so that a rule
//! may reference attributes derived by other rules.

use std::collections::VecDeque;

use borzoi_common::collections::{FastHashMap, FastHashSet};
use borzoi_error::{generic_error, GenericError};
use metrics::{counter, Counter};
use serde::Deserialize;
use tracing::{info, trace};

use crate::record::AttributeValue;

mod expr;
pub use self::expr::{Expression, ExpressionConfig, MatchCaseConfig};

const fn default_version() -> u32 {
    1
}

/// A single projection rule, as written in rule files.
#[derive(Clone, Debug, Deserialize)]
pub struct RuleConfig {
    /// The derived attribute key the rule produces.
    pub target: String,

    /// The expression producing the derived value.
    pub expression: ExpressionConfig,
}

/// A versioned set of projection rules, as written in rule files.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleSetConfig {
    /// Rule file format version.
    ///
    /// Defaults to 1.
    #[serde(default = "default_version")]
    pub version: u32,

    /// The rules, in declaration order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

struct ProjectionRule {
    target: String,
    expression: Expression,
    sources: FastHashSet<String>,
}

/// The result of projecting one attribute view.
#[derive(Debug, Default)]
pub struct ProjectionOutput {
    /// Derived values, keyed by rule target.
    pub values: FastHashMap<String, AttributeValue>,

    /// Targets of rules that were skipped because a source attribute was absent.
    pub skipped: Vec<String>,
}

struct ProjectionTelemetry {
    evaluated: Counter,
    skipped: Counter,
}

impl ProjectionTelemetry {
    fn new() -> Self {
        Self {
            evaluated: counter!("projection_rules_evaluated_total"),
            skipped: counter!("projection_rules_skipped_total"),
        }
    }
}

/// Evaluates a validated set of projection rules.
///
/// Rules are held in topological dependency order, so a rule whose expression references another rule's target sees
/// that target's derived value. Rule sets that cannot be ordered (dependency cycles), contain duplicate or
/// self-referencing targets, or reference unknown source attributes when a catalog is supplied, are rejected at load
/// time.
pub struct ProjectionEngine {
    rules: Vec<ProjectionRule>,
    telemetry: ProjectionTelemetry,
}

impl ProjectionEngine {
    /// Loads a projection rule set.
    ///
    /// When `catalog` is given, every source attribute referenced by a rule must either appear in the catalog or be
    /// the target of another rule.
    ///
    /// # Errors
    ///
    /// If the rule set contains an invalid expression, a duplicate or self-referencing target, an unknown source
    /// attribute (with a catalog), or a dependency cycle, an error describing the problem is returned.
    pub fn load(config: &RuleSetConfig, catalog: Option<&FastHashSet<String>>) -> Result<Self, GenericError> {
        let mut targets = FastHashSet::default();
        let mut rules = Vec::with_capacity(config.rules.len());

        for rule_config in &config.rules {
            if rule_config.target.is_empty() {
                return Err(generic_error!("projection rule has an empty target"));
            }
            if !targets.insert(rule_config.target.clone()) {
                return Err(generic_error!("duplicate projection target '{}'", rule_config.target));
            }

            let expression = Expression::compile(&rule_config.expression)
                .map_err(|e| generic_error!("projection rule '{}': {}", rule_config.target, e))?;

            let mut sources = FastHashSet::default();
            expression.collect_sources(&mut sources);
            if sources.contains(&rule_config.target) {
                return Err(generic_error!(
                    "projection rule '{}' references its own target",
                    rule_config.target
                ));
            }

            rules.push(ProjectionRule {
                target: rule_config.target.clone(),
                expression,
                sources,
            });
        }

        if let Some(catalog) = catalog {
            for rule in &rules {
                for source in &rule.sources {
                    if !catalog.contains(source) && !targets.contains(source) {
                        return Err(generic_error!(
                            "projection rule '{}' references unknown source attribute '{}'",
                            rule.target,
                            source
                        ));
                    }
                }
            }
        }

        let rules = order_by_dependencies(rules)?;

        info!(version = config.version, rules = rules.len(), "Loaded projection rule set.");

        Ok(Self {
            rules,
            telemetry: ProjectionTelemetry::new(),
        })
    }

    /// Returns the number of loaded rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Projects derived attributes from the given attribute view.
    ///
    /// Rules evaluate in dependency order against `env` plus any values derived so far. A rule whose sources are not
    /// all present is skipped; its target is simply absent from the output.
    pub fn project(&self, mut env: FastHashMap<String, AttributeValue>) -> ProjectionOutput {
        let mut output = ProjectionOutput::default();

        for rule in &self.rules {
            match rule.expression.evaluate(&env) {
                Some(value) => {
                    env.insert(rule.target.clone(), value.clone());
                    output.values.insert(rule.target.clone(), value);
                    self.telemetry.evaluated.increment(1);
                }
                None => {
                    trace!(rule = rule.target.as_str(), "Skipped projection rule with absent sources.");
                    output.skipped.push(rule.target.clone());
                    self.telemetry.skipped.increment(1);
                }
            }
        }

        output
    }
}

// Kahn's algorithm, seeded and processed in declaration order so the evaluation order is stable across loads.
fn order_by_dependencies(rules: Vec<ProjectionRule>) -> Result<Vec<ProjectionRule>, GenericError> {
    let index_by_target: FastHashMap<&str, usize> = rules
        .iter()
        .enumerate()
        .map(|(index, rule)| (rule.target.as_str(), index))
        .collect();

    let mut in_degree = vec![0usize; rules.len()];
    let mut dependents = vec![Vec::new(); rules.len()];
    for (index, rule) in rules.iter().enumerate() {
        for source in &rule.sources {
            if let Some(&dependency) = index_by_target.get(source.as_str()) {
                in_degree[index] += 1;
                dependents[dependency].push(index);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..rules.len()).filter(|&index| in_degree[index] == 0).collect();
    let mut order = Vec::with_capacity(rules.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() != rules.len() {
        let stuck = (0..rules.len())
            .find(|&index| in_degree[index] > 0)
            .map(|index| rules[index].target.clone())
            .unwrap_or_default();
        return Err(generic_error!(
            "projection rules contain a dependency cycle involving '{}'",
            stuck
        ));
    }

    drop(index_by_target);
    let mut slots: Vec<Option<ProjectionRule>> = rules.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|index| slots[index].take()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_set(raw: &str) -> RuleSetConfig {
        serde_yaml::from_str(raw).expect("should deserialize")
    }

    fn env(pairs: &[(&str, AttributeValue)]) -> FastHashMap<String, AttributeValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn load_error(config: &RuleSetConfig, catalog: Option<&FastHashSet<String>>) -> GenericError {
        match ProjectionEngine::load(config, catalog) {
            Ok(_) => panic!("rule set should have been rejected"),
            Err(e) => e,
        }
    }

    #[test]
    fn rules_evaluate_in_dependency_order() {
        // `operation_class` depends on `is_read_operation` but is declared first.
        let config = rule_set(
            "
            rules:
              - target: operation_class
                expression:
                  first_match:
                    input:
                      source: { key: is_read_operation }
                    cases:
                      - pattern: 'true'
                        value: read
                    fallback: write
              - target: is_read_operation
                expression:
                  equals_any:
                    input:
                      source: { key: http.method }
                    values: [GET, HEAD, OPTIONS]
            ",
        );

        let engine = ProjectionEngine::load(&config, None).unwrap();
        assert_eq!(engine.rule_count(), 2);

        let output = engine.project(env(&[("http.method", AttributeValue::from("GET"))]));
        assert_eq!(
            output.values.get("is_read_operation"),
            Some(&AttributeValue::Boolean(true))
        );
        assert_eq!(output.values.get("operation_class"), Some(&AttributeValue::from("read")));
        assert!(output.skipped.is_empty());
    }

    #[test]
    fn missing_sources_skip_the_rule() {
        let config = rule_set(
            "
            rules:
              - target: environment
                expression:
                  constant: { value: production }
              - target: route_label
                expression:
                  lowercase:
                    input:
                      source: { key: http.route }
            ",
        );

        let engine = ProjectionEngine::load(&config, None).unwrap();
        let output = engine.project(env(&[]));

        assert_eq!(output.values.get("environment"), Some(&AttributeValue::from("production")));
        assert!(!output.values.contains_key("route_label"));
        assert_eq!(output.skipped, vec!["route_label".to_string()]);
    }

    #[test]
    fn projection_is_deterministic() {
        let config = rule_set(
            "
            rules:
              - target: endpoint
                expression:
                  concat:
                    separator: ' '
                    parts:
                      - source: { key: http.method }
                      - source: { key: http.route }
            ",
        );

        let engine = ProjectionEngine::load(&config, None).unwrap();
        let view = env(&[
            ("http.method", AttributeValue::from("GET")),
            ("http.route", AttributeValue::from("/cart")),
        ]);

        let first = engine.project(view.clone());
        let second = engine.project(view);
        assert_eq!(first.values, second.values);
        assert_eq!(first.values.get("endpoint"), Some(&AttributeValue::from("GET /cart")));
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let config = rule_set(
            "
            rules:
              - target: environment
                expression:
                  constant: { value: production }
              - target: environment
                expression:
                  constant: { value: staging }
            ",
        );

        let error = load_error(&config, None);
        assert!(error.to_string().contains("duplicate projection target"));
    }

    #[test]
    fn self_referencing_rules_are_rejected() {
        let config = rule_set(
            "
            rules:
              - target: environment
                expression:
                  lowercase:
                    input:
                      source: { key: environment }
            ",
        );

        let error = load_error(&config, None);
        assert!(error.to_string().contains("references its own target"));
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let config = rule_set(
            "
            rules:
              - target: a
                expression:
                  lowercase:
                    input:
                      source: { key: b }
              - target: b
                expression:
                  lowercase:
                    input:
                      source: { key: a }
            ",
        );

        let error = load_error(&config, None);
        assert!(error.to_string().contains("dependency cycle"));
    }

    #[test]
    fn unknown_sources_are_rejected_against_a_catalog() {
        let config = rule_set(
            "
            rules:
              - target: is_read_operation
                expression:
                  equals_any:
                    input:
                      source: { key: http.method }
                    values: [GET]
              - target: operation_class
                expression:
                  matches:
                    input:
                      source: { key: is_read_operation }
                    pattern: 'true'
            ",
        );

        // Sources may be catalog attributes or other rules' targets.
        let mut catalog = FastHashSet::default();
        catalog.insert("http.method".to_string());
        assert!(ProjectionEngine::load(&config, Some(&catalog)).is_ok());

        // An empty catalog makes `http.method` unknown.
        let empty = FastHashSet::default();
        let error = load_error(&config, Some(&empty));
        assert!(error.to_string().contains("unknown source attribute"));
    }
}
