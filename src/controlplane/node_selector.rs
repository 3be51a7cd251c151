//! Node Selector Matching
//!
//! Evaluates a volume set's `NodeSelector` against this node's labels with
//! core/v1 semantics: terms are ORed, expressions within a term are ANDed,
//! and an empty term matches nothing.

use crate::crd::{NodeSelector, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Whether a volume set with `selector` applies to a node with `labels`.
///
/// No selector at all selects every node.
pub fn node_selector_matches(selector: Option<&NodeSelector>, labels: &BTreeMap<String, String>) -> Result<bool> {
    let Some(selector) = selector else {
        return Ok(true);
    };
    for term in &selector.node_selector_terms {
        if term_matches(term, labels)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn term_matches(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>) -> Result<bool> {
    if term.match_expressions.is_empty() {
        return Ok(false);
    }
    for requirement in &term.match_expressions {
        if !requirement_matches(requirement, labels)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn requirement_matches(requirement: &NodeSelectorRequirement, labels: &BTreeMap<String, String>) -> Result<bool> {
    let value = labels.get(&requirement.key);
    match requirement.operator {
        NodeSelectorOperator::In => Ok(value.map_or(false, |v| requirement.values.contains(v))),
        NodeSelectorOperator::NotIn => Ok(value.map_or(true, |v| !requirement.values.contains(v))),
        NodeSelectorOperator::Exists => Ok(value.is_some()),
        NodeSelectorOperator::DoesNotExist => Ok(value.is_none()),
        NodeSelectorOperator::Gt | NodeSelectorOperator::Lt => {
            let bound = integer_bound(requirement)?;
            let Some(actual) = value.and_then(|v| v.parse::<i64>().ok()) else {
                return Ok(false);
            };
            Ok(match requirement.operator {
                NodeSelectorOperator::Gt => actual > bound,
                _ => actual < bound,
            })
        }
    }
}

fn integer_bound(requirement: &NodeSelectorRequirement) -> Result<i64> {
    match requirement.values.as_slice() {
        [single] => single.parse().map_err(|_| {
            Error::Configuration(format!(
                "node selector value for {} must be an integer, got {:?}",
                requirement.key, single
            ))
        }),
        values => Err(Error::Configuration(format!(
            "node selector operator {:?} on {} needs exactly one value, got {}",
            requirement.operator,
            requirement.key,
            values.len()
        ))),
    }
}

/// Parse `k=v,k2=v2` into a label map
pub fn parse_labels(input: &str) -> Result<BTreeMap<String, String>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Configuration(format!("invalid label {:?}, expected key=value", pair)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Configuration(format!("empty label key in {:?}", pair)));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn requirement(key: &str, operator: NodeSelectorOperator, values: &[&str]) -> NodeSelectorRequirement {
        NodeSelectorRequirement {
            key: key.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn selector(terms: Vec<Vec<NodeSelectorRequirement>>) -> NodeSelector {
        NodeSelector {
            node_selector_terms: terms
                .into_iter()
                .map(|match_expressions| NodeSelectorTerm { match_expressions })
                .collect(),
        }
    }

    fn labels() -> BTreeMap<String, String> {
        parse_labels("kubernetes.io/hostname=worker-0, disks=4, tier=fast").unwrap()
    }

    #[test]
    fn test_no_selector_matches_all() {
        assert!(node_selector_matches(None, &labels()).unwrap());
    }

    #[test]
    fn test_empty_selector_matches_nothing() {
        assert!(!node_selector_matches(Some(&selector(vec![])), &labels()).unwrap());
        assert!(!node_selector_matches(Some(&selector(vec![vec![]])), &labels()).unwrap());
    }

    #[test]
    fn test_in_and_not_in() {
        let sel = selector(vec![vec![requirement(
            "kubernetes.io/hostname",
            NodeSelectorOperator::In,
            &["worker-0", "worker-1"],
        )]]);
        assert!(node_selector_matches(Some(&sel), &labels()).unwrap());

        let sel = selector(vec![vec![requirement("tier", NodeSelectorOperator::NotIn, &["fast"])]]);
        assert!(!node_selector_matches(Some(&sel), &labels()).unwrap());

        let sel = selector(vec![vec![requirement("zone", NodeSelectorOperator::NotIn, &["a"])]]);
        assert!(node_selector_matches(Some(&sel), &labels()).unwrap());
    }

    #[test]
    fn test_expressions_anded_terms_ored() {
        let failing = vec![
            requirement("tier", NodeSelectorOperator::Exists, &[]),
            requirement("zone", NodeSelectorOperator::Exists, &[]),
        ];
        assert!(!node_selector_matches(Some(&selector(vec![failing.clone()])), &labels()).unwrap());

        let passing = vec![requirement("zone", NodeSelectorOperator::DoesNotExist, &[])];
        assert!(node_selector_matches(Some(&selector(vec![failing, passing])), &labels()).unwrap());
    }

    #[test]
    fn test_gt_lt() {
        let sel = selector(vec![vec![requirement("disks", NodeSelectorOperator::Gt, &["3"])]]);
        assert!(node_selector_matches(Some(&sel), &labels()).unwrap());

        let sel = selector(vec![vec![requirement("disks", NodeSelectorOperator::Lt, &["4"])]]);
        assert!(!node_selector_matches(Some(&sel), &labels()).unwrap());

        // non-numeric label value never matches
        let sel = selector(vec![vec![requirement("tier", NodeSelectorOperator::Gt, &["1"])]]);
        assert!(!node_selector_matches(Some(&sel), &labels()).unwrap());

        let sel = selector(vec![vec![requirement("disks", NodeSelectorOperator::Gt, &["1", "2"])]]);
        assert_matches!(node_selector_matches(Some(&sel), &labels()), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_parse_labels() {
        let parsed = labels();
        assert_eq!(parsed.get("disks").map(String::as_str), Some("4"));
        assert!(parse_labels("").unwrap().is_empty());
        assert_matches!(parse_labels("novalue"), Err(Error::Configuration(_)));
        assert_matches!(parse_labels("=x"), Err(Error::Configuration(_)));
    }
}
