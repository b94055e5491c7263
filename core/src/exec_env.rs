//! Derives the environment a child process sees.
//!
//! The parent environment is filtered through the policy's `env.allow` glob
//! patterns, minus anything matching `env.mask`, then session overrides are
//! applied on top. Masking wins over allowing so a pattern like `*` cannot
//! accidentally leak credentials matched by the default mask set.

use std::collections::HashMap;

use wildmatch::WildMatch;

use crate::policy::EnvRules;

/// Build the child environment from the ambient process environment.
pub fn create_env(rules: &EnvRules, overrides: &HashMap<String, String>) -> HashMap<String, String> {
    create_env_from(std::env::vars(), rules, overrides)
}

fn create_env_from(
    vars: impl Iterator<Item = (String, String)>,
    rules: &EnvRules,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let allow: Vec<WildMatch> = rules.allow.iter().map(|p| WildMatch::new(p)).collect();
    let mask: Vec<WildMatch> = rules.mask.iter().map(|p| WildMatch::new(p)).collect();

    let mut env: HashMap<String, String> = vars
        .filter(|(name, _)| {
            allow.iter().any(|pattern| pattern.matches(name))
                && !mask.iter().any(|pattern| pattern.matches(name))
        })
        .collect();

    // Session overrides are explicit: they bypass the allow filter but are
    // still subject to masking.
    for (name, value) in overrides {
        if mask.iter().any(|pattern| pattern.matches(name)) {
            tracing::warn!("env override {name} suppressed by mask");
            continue;
        }
        env.insert(name.clone(), value.clone());
    }

    env
}
