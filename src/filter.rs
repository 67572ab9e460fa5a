//! Content filter pipeline
//!
//! Every chunk in transit goes through the same fixed sequence:
//! drop literals, drop patterns, exclusions, literal replacements and
//! pattern replacements. Matching works on raw bytes so binary payloads
//! are never re-encoded.

use regex::bytes::{NoExpand, Regex, RegexSet};
use std::borrow::Cow;

use crate::config::FilterRules;
use crate::error::{RelayError, Result};

/// Result of filtering one chunk
#[derive(Debug, PartialEq, Eq)]
pub enum Filtered<'a> {
    /// Forward these bytes (borrowed when no rule changed the chunk)
    Pass(Cow<'a, [u8]>),
    /// Drop the chunk; holds the rule that matched
    Drop(String),
}

/// A compiled exclude/replace step
struct Rewrite {
    regex: Regex,
    replacement: Vec<u8>,
    /// Expand `$n` capture references in the replacement
    expand: bool,
}

/// Compiled, immutable filter rule set
pub struct FilterPipeline {
    /// Drop literals (escaped) followed by drop patterns
    drop_set: Option<RegexSet>,
    /// Rule text per `drop_set` index, for logging
    drop_rules: Vec<String>,
    /// Exclusions, then literal replacements, then pattern replacements
    rewrites: Vec<Rewrite>,
}

fn invalid_rule(rule: &str, reason: impl ToString) -> RelayError {
    RelayError::Filter {
        rule: rule.to_string(),
        reason: reason.to_string(),
    }
}

fn literal_regex(literal: &str) -> Result<Regex> {
    if literal.is_empty() {
        return Err(invalid_rule(literal, "literal must not be empty"));
    }
    Regex::new(&regex::escape(literal)).map_err(|e| invalid_rule(literal, e))
}

fn pattern_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| invalid_rule(pattern, e))
}

impl FilterPipeline {
    /// Compile the rule set; fails on empty literals and invalid patterns
    pub fn compile(rules: &FilterRules) -> Result<Self> {
        let mut drop_patterns = Vec::with_capacity(rules.drop.len() + rules.drop_reg.len());
        let mut drop_rules = Vec::with_capacity(drop_patterns.capacity());

        for literal in &rules.drop {
            literal_regex(literal)?;
            drop_patterns.push(regex::escape(literal));
            drop_rules.push(literal.clone());
        }
        for pattern in &rules.drop_reg {
            pattern_regex(pattern)?;
            drop_patterns.push(pattern.clone());
            drop_rules.push(pattern.clone());
        }

        let drop_set = if drop_patterns.is_empty() {
            None
        } else {
            Some(RegexSet::new(&drop_patterns).map_err(|e| invalid_rule("drop rules", e))?)
        };

        let mut rewrites = Vec::new();
        for literal in &rules.exclude {
            rewrites.push(Rewrite {
                regex: literal_regex(literal)?,
                replacement: Vec::new(),
                expand: false,
            });
        }
        for rule in &rules.replace {
            rewrites.push(Rewrite {
                regex: literal_regex(&rule.old)?,
                replacement: rule.new.clone().into_bytes(),
                expand: false,
            });
        }
        for rule in &rules.replace_reg {
            rewrites.push(Rewrite {
                regex: pattern_regex(&rule.reg)?,
                replacement: rule.new.clone().into_bytes(),
                expand: true,
            });
        }

        Ok(Self {
            drop_set,
            drop_rules,
            rewrites,
        })
    }

    /// Pipeline that forwards everything untouched
    pub fn passthrough() -> Self {
        Self {
            drop_set: None,
            drop_rules: Vec::new(),
            rewrites: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.drop_set.is_none() && self.rewrites.is_empty()
    }

    /// Number of compiled rules
    pub fn rule_count(&self) -> usize {
        self.drop_rules.len() + self.rewrites.len()
    }

    /// Run one chunk through the pipeline
    pub fn apply<'a>(&self, chunk: &'a [u8]) -> Filtered<'a> {
        if self.is_empty() {
            return Filtered::Pass(Cow::Borrowed(chunk));
        }

        // Lowest index wins, so literals are reported before patterns
        if let Some(ref set) = self.drop_set {
            if let Some(index) = set.matches(chunk).iter().next() {
                return Filtered::Drop(self.drop_rules[index].clone());
            }
        }

        let mut out = Cow::Borrowed(chunk);
        for rewrite in &self.rewrites {
            let replaced = if rewrite.expand {
                rewrite
                    .regex
                    .replace_all(&out, rewrite.replacement.as_slice())
            } else {
                rewrite
                    .regex
                    .replace_all(&out, NoExpand(rewrite.replacement.as_slice()))
            };
            let changed = match replaced {
                Cow::Owned(bytes) => Some(bytes),
                Cow::Borrowed(_) => None,
            };
            if let Some(bytes) = changed {
                out = Cow::Owned(bytes);
            }
        }
        Filtered::Pass(out)
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("drop_rules", &self.drop_rules)
            .field("rewrites", &self.rewrites.len())
            .finish()
    }
}
