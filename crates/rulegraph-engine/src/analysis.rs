use rulegraph_cache::CacheStats;
use rulegraph_core::{
    OptimizationSettings, Relation, RelationId, Result, Rule, RuleGraphError, RuleRef, RuleScope,
    RuleStore, RuleType,
};
use serde::Serialize;
use similar::TextDiff;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Rolling counters kept by the engine
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub generations: u64,
    pub failed_generations: u64,
    pub total_generation_time: Duration,
}

impl EngineMetrics {
    pub fn record_success(&mut self, elapsed: Duration) {
        self.generations += 1;
        self.total_generation_time += elapsed;
    }

    pub fn record_failure(&mut self) {
        self.failed_generations += 1;
    }

    pub fn average_generation_ms(&self) -> f64 {
        if self.generations == 0 {
            0.0
        } else {
            self.total_generation_time.as_secs_f64() * 1000.0 / self.generations as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub total_generations: u64,
    pub failed_generations: u64,
    pub average_generation_ms: f64,
    pub cache_enabled: bool,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub cache_evictions: u64,
}

impl PerformanceMetrics {
    pub fn collect(metrics: &EngineMetrics, cache: &CacheStats, cache_enabled: bool) -> Self {
        Self {
            total_generations: metrics.generations,
            failed_generations: metrics.failed_generations,
            average_generation_ms: metrics.average_generation_ms(),
            cache_enabled,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_hit_rate: cache.hit_rate(),
            cache_entries: cache.entries,
            cache_capacity: cache.capacity,
            cache_evictions: cache.evictions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDependencies {
    pub rule: RuleRef,
    pub name: String,
    pub dependency_count: usize,
    /// Rules whose relations point at this one
    pub dependent_count: usize,
    pub transitive_dependency_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub direct_dependencies: Vec<RuleRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relationship {
    pub relation_id: RelationId,
    pub parent: RuleRef,
    pub child: RuleRef,
    pub weight: f64,
    pub order_index: i32,
    pub is_required: bool,
}

impl From<&Relation> for Relationship {
    fn from(relation: &Relation) -> Self {
        Self {
            relation_id: relation.id,
            parent: relation.parent,
            child: relation.child,
            weight: relation.weight,
            order_index: relation.order_index,
            is_required: relation.is_required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub scope: String,
    pub rule_count: usize,
    pub dependencies: Vec<RuleDependencies>,
    pub relationships: Vec<Relationship>,
    pub performance_metrics: PerformanceMetrics,
}

/// Read-only view of the whole graph used by analysis and optimization
pub(crate) struct GraphSnapshot {
    pub rules: Vec<Rule>,
    pub children: BTreeMap<RuleRef, Vec<Relation>>,
    pub dependents: BTreeMap<RuleRef, HashSet<RuleRef>>,
}

impl GraphSnapshot {
    pub async fn load(store: &dyn RuleStore) -> Result<Self> {
        let rules = store.list_rules(RuleScope::All).await?;
        let mut children: BTreeMap<RuleRef, Vec<Relation>> = BTreeMap::new();
        let mut dependents: BTreeMap<RuleRef, HashSet<RuleRef>> = BTreeMap::new();
        for relation in store.list_relations().await? {
            dependents
                .entry(relation.child)
                .or_default()
                .insert(relation.parent);
            children.entry(relation.parent).or_default().push(relation);
        }
        for relations in children.values_mut() {
            relations.sort_by(Relation::sibling_order);
        }
        Ok(Self {
            rules,
            children,
            dependents,
        })
    }

    pub fn children_of(&self, rule: RuleRef) -> &[Relation] {
        self.children.get(&rule).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn dependent_count(&self, rule: RuleRef) -> usize {
        self.dependents.get(&rule).map_or(0, HashSet::len)
    }

    /// Distinct rules reachable below `rule`; safe on cyclic data
    pub fn transitive_count(&self, rule: RuleRef) -> usize {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<RuleRef> = self.children_of(rule).iter().map(|r| r.child).collect();
        while let Some(next) = queue.pop_front() {
            if next == rule || !seen.insert(next) {
                continue;
            }
            queue.extend(self.children_of(next).iter().map(|r| r.child));
        }
        seen.len()
    }
}

pub(crate) fn analyze(
    snapshot: &GraphSnapshot,
    scope: RuleScope,
    include_dependencies: bool,
    performance_metrics: PerformanceMetrics,
) -> AnalysisResult {
    let in_scope: Vec<&Rule> = snapshot
        .rules
        .iter()
        .filter(|r| scope.includes(r.rule_type))
        .collect();

    let dependencies = in_scope
        .iter()
        .map(|rule| {
            let rule_ref = rule.rule_ref();
            let children = snapshot.children_of(rule_ref);
            RuleDependencies {
                rule: rule_ref,
                name: rule.name.clone(),
                dependency_count: children.len(),
                dependent_count: snapshot.dependent_count(rule_ref),
                transitive_dependency_count: snapshot.transitive_count(rule_ref),
                direct_dependencies: if include_dependencies {
                    children.iter().map(|r| r.child).collect()
                } else {
                    Vec::new()
                },
            }
        })
        .collect();

    let relationships = if include_dependencies {
        snapshot
            .children
            .values()
            .flatten()
            .filter(|r| scope.includes(r.parent.rule_type))
            .map(Relationship::from)
            .collect()
    } else {
        Vec::new()
    };

    AnalysisResult {
        scope: scope.to_string(),
        rule_count: in_scope.len(),
        dependencies,
        relationships,
        performance_metrics,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationType {
    Performance,
    Structure,
    Content,
    #[default]
    All,
}

impl OptimizationType {
    fn covers(&self, other: OptimizationType) -> bool {
        *self == OptimizationType::All || *self == other
    }
}

impl fmt::Display for OptimizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Performance => "performance",
            Self::Structure => "structure",
            Self::Content => "content",
            Self::All => "all",
        })
    }
}

impl FromStr for OptimizationType {
    type Err = RuleGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "performance" => Ok(Self::Performance),
            "structure" => Ok(Self::Structure),
            "content" => Ok(Self::Content),
            "all" => Ok(Self::All),
            other => Err(RuleGraphError::InvalidOperation(format!(
                "Unknown optimization type: {}. Must be one of: performance, structure, content, all",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    High,
    Medium,
    Low,
}

impl Impact {
    pub fn score(&self) -> u32 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    OrphanRule,
    NearDuplicate,
    EmptyComposite,
    OversizedComposite,
    OptionalOnlyComposite,
    CacheCapacity,
    CacheHitRate,
    CacheDisabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub category: OptimizationType,
    pub impact: Impact,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleRef>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub optimization_type: OptimizationType,
    pub scope: String,
    pub suggestions: Vec<Suggestion>,
    /// Sum of suggestion impacts, capped at 10
    pub priority_score: u32,
}

/// Lookups below this count are too few to judge the hit rate
const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 20;
const LOW_HIT_RATE: f64 = 0.3;
const MAX_PRIORITY: u32 = 10;

pub(crate) fn optimize(
    snapshot: &GraphSnapshot,
    optimization_type: OptimizationType,
    scope: RuleScope,
    settings: &OptimizationSettings,
    performance: &PerformanceMetrics,
) -> OptimizationReport {
    let mut suggestions = Vec::new();
    let in_scope: Vec<&Rule> = snapshot
        .rules
        .iter()
        .filter(|r| scope.includes(r.rule_type))
        .collect();

    if optimization_type.covers(OptimizationType::Structure) {
        structure_suggestions(snapshot, &in_scope, settings, &mut suggestions);
    }
    if optimization_type.covers(OptimizationType::Content) {
        content_suggestions(&in_scope, settings, &mut suggestions);
    }
    if optimization_type.covers(OptimizationType::Performance) {
        performance_suggestions(performance, &mut suggestions);
    }

    let priority_score = suggestions
        .iter()
        .map(|s| s.impact.score())
        .sum::<u32>()
        .min(MAX_PRIORITY);

    OptimizationReport {
        optimization_type,
        scope: scope.to_string(),
        suggestions,
        priority_score,
    }
}

fn structure_suggestions(
    snapshot: &GraphSnapshot,
    rules: &[&Rule],
    settings: &OptimizationSettings,
    out: &mut Vec<Suggestion>,
) {
    for rule in rules {
        let rule_ref = rule.rule_ref();
        let children = snapshot.children_of(rule_ref);
        let suggest = |kind, impact, message: String| Suggestion {
            kind,
            category: OptimizationType::Structure,
            impact,
            rules: vec![rule_ref],
            message,
        };

        // Tasks are entry points; nothing is expected to depend on them
        if rule.rule_type != RuleType::Task && snapshot.dependent_count(rule_ref) == 0 {
            out.push(suggest(
                SuggestionKind::OrphanRule,
                Impact::Low,
                format!(
                    "Rule '{}' ({}) has no dependents; consider removing it or attaching it to a parent",
                    rule.name, rule_ref
                ),
            ));
        }

        if rule.rule_type.child_type().is_none() {
            continue;
        }
        if children.is_empty() {
            out.push(suggest(
                SuggestionKind::EmptyComposite,
                Impact::Medium,
                format!(
                    "Rule '{}' ({}) has no {} dependencies",
                    rule.name,
                    rule_ref,
                    rule.rule_type.child_type().map_or("child", |t| t.as_str())
                ),
            ));
        } else if children.len() > settings.max_children {
            out.push(suggest(
                SuggestionKind::OversizedComposite,
                Impact::Medium,
                format!(
                    "Rule '{}' ({}) combines {} rules (limit {}); consider splitting it",
                    rule.name,
                    rule_ref,
                    children.len(),
                    settings.max_children
                ),
            ));
        } else if children.iter().all(|r| !r.is_required) {
            out.push(suggest(
                SuggestionKind::OptionalOnlyComposite,
                Impact::Low,
                format!(
                    "Every dependency of '{}' ({}) is optional; it may render with no content",
                    rule.name, rule_ref
                ),
            ));
        }
    }
}

fn content_suggestions(rules: &[&Rule], settings: &OptimizationSettings, out: &mut Vec<Suggestion>) {
    for (i, a) in rules.iter().enumerate() {
        for b in &rules[i + 1..] {
            if a.rule_type != b.rule_type || a.template.trim().is_empty() {
                continue;
            }
            let ratio = f64::from(TextDiff::from_words(a.template.as_str(), b.template.as_str()).ratio());
            if ratio >= settings.similarity_threshold {
                out.push(Suggestion {
                    kind: SuggestionKind::NearDuplicate,
                    category: OptimizationType::Content,
                    impact: Impact::Medium,
                    rules: vec![a.rule_ref(), b.rule_ref()],
                    message: format!(
                        "Rules '{}' and '{}' have near-identical templates ({:.0}% similar); consider merging",
                        a.name,
                        b.name,
                        ratio * 100.0
                    ),
                });
            }
        }
    }
}

fn performance_suggestions(performance: &PerformanceMetrics, out: &mut Vec<Suggestion>) {
    let suggest = |kind, impact, message: String| Suggestion {
        kind,
        category: OptimizationType::Performance,
        impact,
        rules: Vec::new(),
        message,
    };

    if !performance.cache_enabled {
        out.push(suggest(
            SuggestionKind::CacheDisabled,
            Impact::High,
            "Prompt cache is disabled; every request resolves the full hierarchy".to_string(),
        ));
        return;
    }

    if performance.cache_evictions > 0 {
        out.push(suggest(
            SuggestionKind::CacheCapacity,
            Impact::Medium,
            format!(
                "Cache evicted {} entries at capacity {}; consider raising cache.max_entries",
                performance.cache_evictions, performance.cache_capacity
            ),
        ));
    }

    let lookups = performance.cache_hits + performance.cache_misses;
    if lookups >= MIN_LOOKUPS_FOR_HIT_RATE && performance.cache_hit_rate < LOW_HIT_RATE {
        out.push(suggest(
            SuggestionKind::CacheHitRate,
            Impact::Low,
            format!(
                "Cache hit rate is {:.0}% over {} lookups; requests rarely repeat their context",
                performance.cache_hit_rate * 100.0,
                lookups
            ),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulegraph_core::{MemoryRuleStore, NewRelation, NewRule};

    fn idle_metrics() -> PerformanceMetrics {
        PerformanceMetrics::collect(&EngineMetrics::default(), &CacheStats::default(), true)
    }

    #[tokio::test]
    async fn test_transitive_counts_and_dependents() {
        let store = MemoryRuleStore::new();
        let (p, _) = store
            .create_rule(RuleType::Primitive, NewRule::new("p", "x").with_category("format"))
            .unwrap();
        let (s, _) = store
            .create_rule(RuleType::Semantic, NewRule::new("s", "{{primitive}}"))
            .unwrap();
        let (t, _) = store
            .create_rule(RuleType::Task, NewRule::new("t", "{{semantic}}"))
            .unwrap();
        store
            .create_relation(NewRelation::new(s.rule_ref(), p.rule_ref()))
            .unwrap();
        store
            .create_relation(NewRelation::new(t.rule_ref(), s.rule_ref()))
            .unwrap();

        let snapshot = GraphSnapshot::load(&store).await.unwrap();
        let result = analyze(&snapshot, RuleScope::All, true, idle_metrics());
        assert_eq!(result.rule_count, 3);
        assert_eq!(result.relationships.len(), 2);

        let task = result.dependencies.iter().find(|d| d.rule == t.rule_ref()).unwrap();
        assert_eq!(task.transitive_dependency_count, 2);
        assert_eq!(task.direct_dependencies, vec![s.rule_ref()]);
        let primitive = result.dependencies.iter().find(|d| d.rule == p.rule_ref()).unwrap();
        assert_eq!(primitive.dependent_count, 1);

        let shallow = analyze(&snapshot, RuleScope::Only(RuleType::Task), false, idle_metrics());
        assert_eq!(shallow.rule_count, 1);
        assert!(shallow.relationships.is_empty());
        assert!(shallow.dependencies[0].direct_dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_optimize_flags_orphans_and_near_duplicates() {
        let store = MemoryRuleStore::new();
        store
            .create_rule(
                RuleType::Primitive,
                NewRule::new("a", "Always answer in plain English without jargon."),
            )
            .unwrap();
        store
            .create_rule(
                RuleType::Primitive,
                NewRule::new("b", "Always answer in plain English without jargon."),
            )
            .unwrap();

        let snapshot = GraphSnapshot::load(&store).await.unwrap();
        let report = optimize(
            &snapshot,
            OptimizationType::All,
            RuleScope::All,
            &OptimizationSettings::default(),
            &idle_metrics(),
        );

        let orphans = report
            .suggestions
            .iter()
            .filter(|s| s.kind == SuggestionKind::OrphanRule)
            .count();
        assert_eq!(orphans, 2);
        assert!(report
            .suggestions
            .iter()
            .any(|s| s.kind == SuggestionKind::NearDuplicate));
        // two low orphans + one medium duplicate
        assert_eq!(report.priority_score, 4);

        let content_only = optimize(
            &snapshot,
            OptimizationType::Content,
            RuleScope::All,
            &OptimizationSettings::default(),
            &idle_metrics(),
        );
        assert_eq!(content_only.suggestions.len(), 1);
    }

    #[test]
    fn test_priority_score_is_capped() {
        let metrics = PerformanceMetrics {
            cache_enabled: false,
            ..idle_metrics()
        };
        let snapshot = GraphSnapshot {
            rules: (1..=6)
                .map(|id| Rule {
                    id,
                    rule_type: RuleType::Semantic,
                    name: format!("s{}", id),
                    template: format!("unique template {}", id * 1000),
                    description: None,
                    category: None,
                    language: None,
                    framework: None,
                    domain: None,
                    variables: Vec::new(),
                    version: 1,
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                })
                .collect(),
            children: BTreeMap::new(),
            dependents: BTreeMap::new(),
        };
        let report = optimize(
            &snapshot,
            OptimizationType::Structure,
            RuleScope::All,
            &OptimizationSettings::default(),
            &metrics,
        );
        // six orphans (low) and six empty composites (medium)
        assert_eq!(report.suggestions.len(), 12);
        assert_eq!(report.priority_score, 10);
    }
}
