use rulegraph_core::{Result, Rule, RuleRef, RuleScope, RuleStore, RuleType, SearchFields, SearchSettings};
use serde::Serialize;
use std::cmp::Ordering;

const PREVIEW_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub search_type: SearchFields,
    pub scope: RuleScope,
    /// Falls back to `search.default_limit`
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            search_type: SearchFields::default(),
            scope: RuleScope::All,
            limit: None,
        }
    }

    pub fn fields(mut self, search_type: SearchFields) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub rule: RuleRef,
    pub rule_type: RuleType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub preview: String,
    pub relevance: f64,
    pub matched_fields: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<SearchHit>,
    /// Matches before the limit was applied
    pub total_found: usize,
}

/// Score a rule against `query`; `None` when no selected field matches
pub fn score_rule(
    rule: &Rule,
    query: &str,
    fields: SearchFields,
    weights: &SearchSettings,
) -> Option<(f64, Vec<&'static str>)> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let hit = |text: &str| text.to_lowercase().contains(&needle);

    let mut relevance: Option<f64> = None;
    let mut matched = Vec::new();
    let mut record = |field: &'static str, weight: f64| {
        matched.push(field);
        relevance = Some(relevance.map_or(weight, |r| r.max(weight)));
    };

    if fields.name() && hit(&rule.name) {
        record("name", weights.name_weight);
    }
    if fields.content() && hit(&rule.template) {
        record("content", weights.content_weight);
    }
    if fields.description() && rule.description.as_deref().is_some_and(|d| hit(d)) {
        record("description", weights.description_weight);
    }

    relevance.map(|r| (r, matched))
}

fn preview(template: &str) -> String {
    let mut chars = template.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Match through the store, then rank by field relevance
pub async fn search_rules(
    store: &dyn RuleStore,
    request: &SearchRequest,
    weights: &SearchSettings,
) -> Result<SearchResults> {
    let candidates = store
        .search_rules(&request.query, request.search_type, request.scope)
        .await?;

    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter_map(|rule| {
            let (relevance, matched_fields) =
                score_rule(&rule, &request.query, request.search_type, weights)?;
            Some(SearchHit {
                rule: rule.rule_ref(),
                rule_type: rule.rule_type,
                preview: preview(&rule.template),
                name: rule.name,
                description: rule.description,
                relevance,
                matched_fields,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.rule.cmp(&b.rule))
    });

    let total_found = hits.len();
    hits.truncate(request.limit.unwrap_or(weights.default_limit));

    Ok(SearchResults {
        query: request.query.clone(),
        results: hits,
        total_found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulegraph_core::{MemoryRuleStore, NewRule};

    #[tokio::test]
    async fn test_name_match_outranks_content_match() {
        let store = MemoryRuleStore::new();
        store
            .create_rule(RuleType::Primitive, NewRule::new("concise", "Keep answers short."))
            .unwrap();
        store
            .create_rule(RuleType::Primitive, NewRule::new("brevity", "Be concise."))
            .unwrap();
        store
            .create_rule(
                RuleType::Semantic,
                NewRule::new("tone", "{{tone}}").with_description("concise tone"),
            )
            .unwrap();

        let request = SearchRequest::new("CONCISE").fields(SearchFields::All).limit(2);
        let results = search_rules(&store, &request, &SearchSettings::default())
            .await
            .unwrap();

        assert_eq!(results.total_found, 3);
        assert_eq!(results.results.len(), 2);
        assert_eq!(results.results[0].name, "concise");
        assert_eq!(results.results[0].relevance, 0.95);
        assert_eq!(results.results[1].name, "brevity");
        assert_eq!(results.results[1].matched_fields, vec!["content"]);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
    }
}
