//! Optional AI-assisted stage filter, falling back to deterministic keyword
//! analysis when unavailable (§4.I).
//!
//! The keyword-family approach mirrors `router::classifier::PreRoutingClassifier`'s
//! risk-factor scanning — a fixed set of named pattern families, each contributing
//! independently to the decision, rather than one monolithic regex.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

pub const CORE_STAGES: &[&str] = &["development", "code_review", "validation", "integration", "testing"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFamily {
    Frontend,
    Backend,
    Api,
    Database,
    Accessibility,
    Dependencies,
    Notebook,
}

impl StageFamily {
    fn stage_name(self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Api => "api_integration",
            Self::Database => "database",
            Self::Accessibility => "accessibility",
            Self::Dependencies => "dependencies",
            Self::Notebook => "notebook",
        }
    }

    fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::Frontend => &["(?i)\\b(react|vue|css|component|ui|frontend)\\b"],
            Self::Backend => &["(?i)\\b(server|backend|service|microservice)\\b"],
            Self::Api => &["(?i)\\b(api|endpoint|rest|graphql|grpc)\\b"],
            Self::Database => &["(?i)\\b(database|sql|migration|schema|postgres|mysql)\\b"],
            Self::Accessibility => &["(?i)\\b(accessibility|a11y|aria|wcag)\\b"],
            Self::Dependencies => &["(?i)\\b(dependency|dependencies|package|upgrade|bump)\\b"],
            Self::Notebook => &["(?i)\\b(notebook|jupyter|ipynb)\\b"],
        }
    }
}

const ALL_FAMILIES: &[StageFamily] = &[
    StageFamily::Frontend,
    StageFamily::Backend,
    StageFamily::Api,
    StageFamily::Database,
    StageFamily::Accessibility,
    StageFamily::Dependencies,
    StageFamily::Notebook,
];

struct FamilySets {
    sets: Vec<(StageFamily, RegexSet)>,
}

static FAMILY_SETS: OnceLock<FamilySets> = OnceLock::new();

fn family_sets() -> &'static FamilySets {
    FAMILY_SETS.get_or_init(|| FamilySets {
        sets: ALL_FAMILIES
            .iter()
            .map(|f| (*f, RegexSet::new(f.patterns()).expect("static patterns always compile")))
            .collect(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub stages_to_run: Vec<String>,
    pub matched_families: Vec<StageFamily>,
    pub source: RoutingSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingSource {
    AiQueryService,
    KeywordFallback,
}

/// Deterministic keyword-family fallback: scans `text` against each family's regex
/// set and unions the matching families' stage names with the always-required
/// core stages.
pub fn keyword_fallback(text: &str) -> RoutingDecision {
    let families = family_sets();
    let mut matched = Vec::new();
    let mut stages: HashSet<String> = CORE_STAGES.iter().map(|s| s.to_string()).collect();

    for (family, set) in &families.sets {
        if set.is_match(text) {
            matched.push(*family);
            stages.insert(family.stage_name().to_string());
        }
    }

    let mut stages: Vec<String> = stages.into_iter().collect();
    stages.sort();

    RoutingDecision {
        stages_to_run: stages,
        matched_families: matched,
        source: RoutingSource::KeywordFallback,
    }
}

/// An AI-assisted decision takes precedence over the planner's defaults, but the
/// core stages are non-negotiable: this filters whatever the caller hands in down
/// to the intersection with the planner's stage set, per the resolved Open
/// Question on Router/Planner precedence (the router narrows, it never adds
/// stages the planner never considered).
pub fn apply_routing_decision(planned_stages: &[String], decision: &RoutingDecision) -> Vec<String> {
    let allowed: HashSet<&str> = decision.stages_to_run.iter().map(String::as_str).collect();
    planned_stages
        .iter()
        .filter(|s| CORE_STAGES.contains(&s.as_str()) || allowed.contains(s.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_stages_are_always_present() {
        let decision = keyword_fallback("a plain task with no special keywords");
        for core in CORE_STAGES {
            assert!(decision.stages_to_run.contains(&core.to_string()));
        }
        assert!(decision.matched_families.is_empty());
    }

    #[test]
    fn api_keyword_adds_api_integration_stage() {
        let decision = keyword_fallback("expose a new REST endpoint for orders");
        assert!(decision.matched_families.contains(&StageFamily::Api));
        assert!(decision.stages_to_run.contains(&"api_integration".to_string()));
    }

    #[test]
    fn apply_routing_decision_never_drops_core_stages() {
        let planned = vec!["project_analysis".to_string(), "development".to_string(), "notebook".to_string()];
        let decision = RoutingDecision {
            stages_to_run: vec!["development".to_string()],
            matched_families: Vec::new(),
            source: RoutingSource::AiQueryService,
        };
        let filtered = apply_routing_decision(&planned, &decision);
        assert!(filtered.contains(&"development".to_string()));
        assert!(!filtered.contains(&"notebook".to_string()));
    }

    #[test]
    fn apply_routing_decision_filters_within_planner_set_only() {
        // The router can't add "database" if the planner never included it.
        let planned = vec!["development".to_string()];
        let decision = RoutingDecision {
            stages_to_run: vec!["development".to_string(), "database".to_string()],
            matched_families: vec![StageFamily::Database],
            source: RoutingSource::KeywordFallback,
        };
        let filtered = apply_routing_decision(&planned, &decision);
        assert_eq!(filtered, vec!["development".to_string()]);
    }
}
