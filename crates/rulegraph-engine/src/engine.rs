use crate::analysis::{analyze, optimize, GraphSnapshot};
use crate::{
    AnalysisResult, CycleReport, EngineMetrics, Issue, IssueKind, OptimizationReport,
    OptimizationType, PerformanceMetrics, RuleResolver, RuleValidator, SearchRequest,
    SearchResults, Severity, SkippedDependency, TemplateRenderer,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rulegraph_cache::{
    invalidate_for_event, name_tag, rule_tag, CacheConfig, CacheStats, PromptCache,
};
use rulegraph_core::{
    MutationEvent, RenderContext, Result, Rule, RuleGraphConfig, RuleGraphError, RuleId, RuleRef,
    RuleScope, RuleStore, RuleType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Rule name, optionally qualified as `tier:name`
    pub rule_name: String,
    #[serde(default)]
    pub rule_type: Option<RuleType>,
    #[serde(default)]
    pub context: RenderContext,
    /// Falls back to `rendering.default_model`
    #[serde(default)]
    pub target_model: Option<String>,
}

impl GenerateRequest {
    pub fn new(rule_name: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: RenderContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = Some(rule_type);
        self
    }

    pub fn for_model(mut self, model: impl Into<String>) -> Self {
        self.target_model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMetadata {
    pub rule: RuleRef,
    pub rule_name: String,
    pub target_model: String,
    pub generated_at: DateTime<Utc>,
    /// Seconds spent resolving and rendering
    pub generation_time: f64,
    /// Keys supplied in the caller context
    pub context_variables: Vec<String>,
    pub template_variables: Vec<String>,
    pub rules_used: Vec<RuleRef>,
    pub unresolved_variables: Vec<String>,
    pub skipped_dependencies: Vec<SkippedDependency>,
    pub warnings: Vec<String>,
    /// Served from the prompt cache
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptResult {
    pub prompt: String,
    pub metadata: PromptMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    /// No error-severity issue was found
    pub valid: bool,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleRef>,
    pub rules_checked: usize,
    pub issues: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub cycles: Vec<CycleReport>,
}

/// Entry point combining resolver, validator, renderer and cache.
///
/// One instance per process, shared behind an `Arc`. The write path reports
/// every mutation through [`RuleEngine::notify`] so no stale prompt is served.
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    resolver: RuleResolver,
    validator: RuleValidator,
    renderer: TemplateRenderer,
    cache: PromptCache<PromptResult>,
    config: RuleGraphConfig,
    metrics: Mutex<EngineMetrics>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>, config: RuleGraphConfig) -> Self {
        info!(
            "Initializing rule engine (cache: {}, default model: {})",
            if config.cache.enabled { "enabled" } else { "disabled" },
            config.rendering.default_model
        );
        Self {
            resolver: RuleResolver::new(Arc::clone(&store)),
            validator: RuleValidator::new(Arc::clone(&store)),
            renderer: TemplateRenderer::new(&config.rendering),
            cache: PromptCache::new(CacheConfig::from(&config.cache)),
            store,
            config,
            metrics: Mutex::new(EngineMetrics::default()),
        }
    }

    pub fn with_defaults(store: Arc<dyn RuleStore>) -> Self {
        Self::new(store, RuleGraphConfig::default())
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    pub fn config(&self) -> &RuleGraphConfig {
        &self.config
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    pub fn validator(&self) -> &RuleValidator {
        &self.validator
    }

    pub fn resolver(&self) -> &RuleResolver {
        &self.resolver
    }

    /// Look a rule up by name; without a tier the name must be unique across tiers
    pub async fn find_rule(&self, name: &str, rule_type: Option<RuleType>) -> Result<Rule> {
        if let Some(rule_type) = rule_type {
            return self
                .store
                .get_rule_by_name(name, rule_type)
                .await?
                .ok_or_else(|| {
                    RuleGraphError::NotFound(format!("{} rule named '{}'", rule_type, name))
                });
        }

        let mut matches = Vec::new();
        for rule_type in RuleType::ALL {
            if let Some(rule) = self.store.get_rule_by_name(name, rule_type).await? {
                matches.push(rule);
            }
        }

        match matches.len() {
            0 => Err(RuleGraphError::NotFound(format!("rule named '{}'", name))),
            1 => Ok(matches.remove(0)),
            _ => Err(RuleGraphError::AmbiguousRule {
                name: name.to_string(),
                tiers: matches.iter().map(|r| r.rule_type.to_string()).collect(),
            }),
        }
    }

    pub async fn generate_prompt(&self, request: GenerateRequest) -> Result<PromptResult> {
        let started = Instant::now();
        let outcome = self.generate_inner(request, started).await;
        match &outcome {
            Ok(result) if !result.metadata.cached => {
                self.metrics.lock().record_success(started.elapsed());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Prompt generation failed: {}", e);
                self.metrics.lock().record_failure();
            }
        }
        outcome
    }

    async fn generate_inner(&self, request: GenerateRequest, started: Instant) -> Result<PromptResult> {
        let (name, rule_type) = split_qualified_name(&request.rule_name, request.rule_type);
        let model = request
            .target_model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.rendering.default_model.clone());

        // Read before any store access so a mutation notified mid-flight blocks the cache write
        let epoch = self.cache.epoch();
        let rule = self.find_rule(name, rule_type).await?;
        let root = rule.rule_ref();

        let key = PromptCache::<PromptResult>::create_key(
            rule.rule_type,
            &rule.name,
            &request.context,
            &model,
        );
        if let Some(mut cached) = self.cache.get(&key) {
            debug!("Prompt cache hit for {}", root);
            cached.metadata.cached = true;
            return Ok(cached);
        }

        // Nothing is rendered for a graph that loops
        let cycles = self.validator.detect_cycles(root).await?;
        if let Some(cycle) = cycles.into_iter().next() {
            return Err(RuleGraphError::CyclicDependency { path: cycle.path });
        }

        let hierarchy = self.resolver.resolve(root).await?;
        let merged = RuleResolver::merge(&hierarchy);
        let rendered = self.renderer.render_merged(&merged, &request.context);
        let formatted = self.renderer.format_for_model(&rendered.text, &model);

        let mut warnings: Vec<String> = rendered
            .unresolved_variables
            .iter()
            .map(|v| format!("Unresolved template variable '{}'", v))
            .collect();
        warnings.extend(hierarchy.skipped.iter().map(|s| {
            format!(
                "Skipped optional dependency {} of {}: {}",
                s.child, s.parent, s.reason
            )
        }));
        warnings.extend(formatted.warning);

        let result = PromptResult {
            prompt: formatted.text,
            metadata: PromptMetadata {
                rule: root,
                rule_name: rule.name.clone(),
                target_model: model,
                generated_at: Utc::now(),
                generation_time: started.elapsed().as_secs_f64(),
                context_variables: request.context.keys().cloned().collect(),
                template_variables: rendered.template_variables,
                rules_used: merged.rules_used.clone(),
                unresolved_variables: rendered.unresolved_variables,
                skipped_dependencies: hierarchy.skipped,
                warnings,
                cached: false,
            },
        };

        let mut tags: Vec<String> = merged.rules_used.iter().map(|r| rule_tag(*r)).collect();
        tags.push(name_tag(&rule.name));
        if !self.cache.set_if_epoch(key, result.clone(), None, tags, epoch) {
            debug!("Rules changed while generating {}; result not cached", root);
        }

        debug!(
            "Generated prompt for {} from {} rules in {:.3}s",
            root,
            result.metadata.rules_used.len(),
            result.metadata.generation_time
        );
        Ok(result)
    }

    /// Drop cached prompts affected by a mutation on the write path
    pub fn notify(&self, event: &MutationEvent) -> usize {
        invalidate_for_event(&self.cache, event)
    }

    /// Manual invalidation; `None` clears the whole cache.
    ///
    /// `rule:<tier>:<id>` drops every prompt built from that rule and
    /// `name:<name>` every prompt requested under that name. Anything else is
    /// a key prefix matched on whole segments (`task`, `task:code_review`).
    pub fn invalidate_cache(&self, pattern: Option<&str>) -> usize {
        match pattern {
            Some(tag) if tag.starts_with("rule:") || tag.starts_with("name:") => {
                self.cache.invalidate_tag(tag)
            }
            other => self.cache.invalidate(other),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics::collect(
            &self.metrics.lock(),
            &self.cache.stats(),
            self.cache.is_enabled(),
        )
    }

    /// Consistency, conflict and cycle checks for one rule or a whole scope
    pub async fn validate_rules(
        &self,
        scope: RuleScope,
        rule_id: Option<RuleId>,
    ) -> Result<ValidationReport> {
        self.validate_rules_with_context(scope, rule_id, &BTreeSet::new())
            .await
    }

    /// Like [`RuleEngine::validate_rules`], treating `known` variables (the
    /// keys a caller will supply at generation time) as documented
    pub async fn validate_rules_with_context(
        &self,
        scope: RuleScope,
        rule_id: Option<RuleId>,
        known: &BTreeSet<String>,
    ) -> Result<ValidationReport> {

        let (rule, rules_checked, mut findings, cycles) = match rule_id {
            Some(id) => {
                let RuleScope::Only(rule_type) = scope else {
                    return Err(RuleGraphError::InvalidOperation(
                        "Validating a single rule requires a rule type".to_string(),
                    ));
                };
                let root = RuleRef::new(rule_type, id);
                let mut findings = self.validator.check_consistency(root, known).await?;
                findings.extend(self.validator.check_conflicts(root).await?);
                let cycles = self.validator.detect_cycles(root).await?;
                (Some(root), 1, findings, cycles)
            }
            None => {
                let rules_checked = self.store.list_rules(scope).await?.len();
                let mut findings = self.validator.check_consistency_all(scope, known).await?;
                findings.extend(self.validator.check_conflicts_all(scope).await?);
                findings.extend(self.validator.check_duplicate_names(scope).await?);
                let cycles = self.validator.detect_all_cycles(scope).await?;
                (None, rules_checked, findings, cycles)
            }
        };

        findings.extend(cycles.iter().map(|cycle| Issue {
            severity: Severity::Error,
            kind: IssueKind::CyclicDependency,
            rule: cycle.path.first().copied(),
            related_rules: cycle.path.clone(),
            relation_ids: Vec::new(),
            message: format!("Cyclic dependency: {}", cycle),
        }));

        let (issues, warnings): (Vec<Issue>, Vec<Issue>) =
            findings.into_iter().partition(Issue::is_error);

        info!(
            "Validated {} ({} rules): {} issues, {} warnings, {} cycles",
            rule.map_or_else(|| scope.to_string(), |r| r.to_string()),
            rules_checked,
            issues.len(),
            warnings.len(),
            cycles.len()
        );

        Ok(ValidationReport {
            valid: issues.is_empty(),
            scope: scope.to_string(),
            rule,
            rules_checked,
            issues,
            warnings,
            cycles,
        })
    }

    pub async fn analyze_rules(
        &self,
        scope: RuleScope,
        include_dependencies: bool,
    ) -> Result<AnalysisResult> {
        let snapshot = GraphSnapshot::load(self.store.as_ref()).await?;
        Ok(analyze(
            &snapshot,
            scope,
            include_dependencies,
            self.performance_metrics(),
        ))
    }

    /// Advisory suggestions; never mutates rules
    pub async fn optimize_rules(
        &self,
        optimization_type: OptimizationType,
        scope: RuleScope,
    ) -> Result<OptimizationReport> {
        let snapshot = GraphSnapshot::load(self.store.as_ref()).await?;
        Ok(optimize(
            &snapshot,
            optimization_type,
            scope,
            &self.config.optimization,
            &self.performance_metrics(),
        ))
    }

    pub async fn search_rules(&self, request: &SearchRequest) -> Result<SearchResults> {
        crate::search::search_rules(self.store.as_ref(), request, &self.config.search).await
    }
}

/// Split `tier:name` when the prefix names a tier and no tier was given
fn split_qualified_name(name: &str, rule_type: Option<RuleType>) -> (&str, Option<RuleType>) {
    if rule_type.is_some() {
        return (name, rule_type);
    }
    match name.split_once(':') {
        Some((tier, rest)) if !rest.is_empty() => match tier.parse::<RuleType>() {
            Ok(tier) => (rest, Some(tier)),
            Err(_) => (name, None),
        },
        _ => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_qualified_name() {
        assert_eq!(
            split_qualified_name("task:T1", None),
            ("T1", Some(RuleType::Task))
        );
        assert_eq!(split_qualified_name("T1", None), ("T1", None));
        assert_eq!(split_qualified_name("ns:rule", None), ("ns:rule", None));
        assert_eq!(
            split_qualified_name("task:T1", Some(RuleType::Semantic)),
            ("task:T1", Some(RuleType::Semantic))
        );
    }
}
