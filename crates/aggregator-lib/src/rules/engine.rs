//! In-memory rule store
//!
//! Owns the set of aggregation rules and answers match queries for the
//! pipeline. Rule persistence lives outside this crate; rules loaded from
//! storage are saved through the same path as rules created in memory.

use super::matcher::Matcher;
use crate::error::{Error, Result};
use crate::models::{Rule, Sample};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Rule store with predicate matching
pub struct RuleEngine {
    rules: RwLock<HashMap<String, Rule>>,
    matcher: Matcher,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            matcher: Matcher::new(),
        }
    }

    /// Validate and store a rule, allocating an ID when none is set.
    /// Returns the rule's ID.
    pub fn save_rule(&self, mut rule: Rule) -> Result<String> {
        if rule.id.is_empty() {
            rule.id = generate_id();
        }

        rule.validate()?;

        let id = rule.id.clone();
        let mut rules = self.rules.write().unwrap();
        rules.insert(id.clone(), rule);
        info!(rule_id = %id, total = rules.len(), "Rule saved");

        Ok(id)
    }

    /// Replace an existing rule. The rule must carry the ID of a stored rule.
    pub fn update_rule(&self, mut rule: Rule) -> Result<()> {
        {
            let rules = self.rules.read().unwrap();
            if !rules.contains_key(&rule.id) {
                return Err(Error::RuleNotFound(rule.id));
            }
        }

        rule.validate()?;
        rule.updated_at = Utc::now();

        let mut rules = self.rules.write().unwrap();
        debug!(rule_id = %rule.id, enabled = rule.enabled, "Rule updated");
        rules.insert(rule.id.clone(), rule);

        Ok(())
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        let mut rules = self.rules.write().unwrap();
        if rules.remove(id).is_none() {
            return Err(Error::RuleNotFound(id.to_string()));
        }
        info!(rule_id = %id, "Rule deleted");
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Result<Rule> {
        let rules = self.rules.read().unwrap();
        rules
            .get(id)
            .cloned()
            .ok_or_else(|| Error::RuleNotFound(id.to_string()))
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        let rules = self.rules.read().unwrap();
        rules.values().cloned().collect()
    }

    /// All enabled rules whose full predicate admits the sample
    pub fn matching_rules(&self, sample: &Sample) -> Vec<Rule> {
        let rules = self.rules.read().unwrap();
        rules
            .values()
            .filter(|rule| rule.enabled && self.matcher.matches(sample, rule))
            .cloned()
            .collect()
    }

    /// All enabled rules whose name clause admits the metric name.
    ///
    /// Looser than [`matching_rules`](Self::matching_rules): label clauses
    /// are not evaluated.
    pub fn rules_matching_name(&self, metric_name: &str) -> Vec<Rule> {
        let rules = self.rules.read().unwrap();
        rules
            .values()
            .filter(|rule| rule.enabled && self.matcher.name_matches(metric_name, rule))
            .cloned()
            .collect()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}
