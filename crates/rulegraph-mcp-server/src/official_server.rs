// ABOUTME: MCP server implementation for RuleGraph prompt composition tools
// ABOUTME: Provides prompt generation, validation, analysis and search via MCP protocol

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use rulegraph_cache::CacheStats;
use rulegraph_core::{RenderContext, RuleGraphError, RuleScope, RuleType, SearchFields};
use rulegraph_engine::{GenerateRequest, OptimizationType, RuleEngine, SearchRequest};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INSTRUCTIONS: &str = "RuleGraph composes prompts from a three-tier rule hierarchy \
(primitive -> semantic -> task). Use generate_prompt with a rule name (optionally qualified \
as tier:name) and a context of template variables. Use search_rules to discover rule names, \
validate_rules to check the graph for cycles and inconsistencies, analyze_rules and \
optimize_rules for structural insight, and invalidate_cache after editing rules out of band.";

#[derive(Deserialize, JsonSchema)]
struct GeneratePromptRequest {
    /// Rule name, optionally qualified as "tier:name" (e.g. "task:code_review")
    rule_name: String,
    /// Rule tier to look in: primitive, semantic or task (default: any tier)
    #[serde(default)]
    rule_type: Option<String>,
    /// Template variables substituted into {{placeholders}}
    #[serde(default)]
    context: RenderContext,
    /// Target model framing: claude, gpt, gemini or default
    #[serde(default)]
    target_model: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct ValidateRulesRequest {
    /// Tier to validate: primitive, semantic, task or all (default: "all")
    #[serde(default = "default_scope")]
    rule_type: String,
    /// Validate a single rule of the given tier instead of the whole scope
    #[serde(default)]
    rule_id: Option<i64>,
    /// Variable names callers will supply at generation time; not reported as undocumented
    #[serde(default)]
    context_variables: Vec<String>,
}

#[derive(Deserialize, JsonSchema)]
struct AnalyzeRulesRequest {
    /// Tier to analyze: primitive, semantic, task or all (default: "all")
    #[serde(default = "default_scope")]
    rule_type: String,
    /// Include per-rule dependency counts and parent/child relationships
    #[serde(default = "default_true")]
    include_dependencies: bool,
}

#[derive(Deserialize, JsonSchema)]
struct SearchRulesRequest {
    /// Case-insensitive text to look for
    query: String,
    /// Fields to match: name, content, description or all (default: "content")
    #[serde(default = "default_search_type")]
    search_type: String,
    /// Tier to search: primitive, semantic, task or all (default: "all")
    #[serde(default = "default_scope")]
    rule_type: String,
    /// Maximum number of results to return (default: search.default_limit)
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize, JsonSchema)]
struct OptimizeRulesRequest {
    /// Suggestion category: performance, structure, content or all (default: "all")
    #[serde(default = "default_scope")]
    optimization_type: String,
    /// Tier to inspect: primitive, semantic, task or all (default: "all")
    #[serde(default = "default_scope")]
    rule_type: String,
}

#[derive(Deserialize, JsonSchema)]
struct InvalidateCacheRequest {
    /// Only drop matching prompts: "rule:task:3" (built from a rule), "name:code_review", or a key prefix such as "task" or "task:code_review"
    #[serde(default)]
    pattern: Option<String>,
}

fn default_scope() -> String {
    "all".to_string()
}

fn default_search_type() -> String {
    "content".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct CacheInvalidation {
    invalidated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pattern: Option<String>,
    stats: CacheStats,
}

/// Map engine failures onto protocol errors, keeping the stable kind as data
pub fn to_mcp_error(err: RuleGraphError) -> McpError {
    let data = Some(json!({
        "kind": err.kind().as_str(),
        "message": err.to_string(),
    }));
    match err {
        RuleGraphError::NotFound(_)
        | RuleGraphError::AmbiguousRule { .. }
        | RuleGraphError::InvalidOperation(_) => McpError::invalid_params(err.to_string(), data),
        RuleGraphError::CyclicDependency { .. } | RuleGraphError::Dependency { .. } => {
            McpError::invalid_request(err.to_string(), data)
        }
        _ => {
            warn!("Tool call failed: {}", err);
            McpError::internal_error(err.to_string(), data)
        }
    }
}

fn parse_param<T>(value: &str) -> Result<T, McpError>
where
    T: FromStr<Err = RuleGraphError>,
{
    value.parse().map_err(to_mcp_error)
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| {
        McpError::internal_error(format!("Failed to serialize tool result: {}", e), None)
    })?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

/// RuleGraph MCP server backed by a shared [`RuleEngine`]
#[derive(Clone)]
pub struct RuleGraphMcpServer {
    engine: Arc<RuleEngine>,
    /// Official MCP tool router (required by macros)
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl RuleGraphMcpServer {
    pub fn new(engine: Arc<RuleEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    #[tool(
        description = "Compose a prompt from a rule and its dependencies. Returns: the rendered prompt plus metadata (rules used, unresolved variables, skipped optional dependencies, cache hit). Required: rule_name. Optional: rule_type, context, target_model."
    )]
    async fn generate_prompt(
        &self,
        params: Parameters<GeneratePromptRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.0;
        let rule_type = request
            .rule_type
            .as_deref()
            .map(parse_param::<RuleType>)
            .transpose()?;

        debug!(
            "generate_prompt: {} ({} context variables)",
            request.rule_name,
            request.context.len()
        );

        let result = self
            .engine
            .generate_prompt(GenerateRequest {
                rule_name: request.rule_name,
                rule_type,
                context: request.context,
                target_model: request.target_model,
            })
            .await
            .map_err(to_mcp_error)?;

        json_result(&result)
    }

    #[tool(
        description = "Check rules for cycles, missing dependencies, tier violations, malformed placeholders and ordering conflicts. Returns: a report with errors, warnings and cycle paths. Optional: rule_type (default all), rule_id (requires a concrete rule_type), context_variables (names supplied at generation time)."
    )]
    async fn validate_rules(
        &self,
        params: Parameters<ValidateRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.0;
        let scope: RuleScope = parse_param(&request.rule_type)?;

        let known: BTreeSet<String> = request.context_variables.into_iter().collect();

        let report = self
            .engine
            .validate_rules_with_context(scope, request.rule_id, &known)
            .await
            .map_err(to_mcp_error)?;

        json_result(&report)
    }

    #[tool(
        description = "Summarize the rule graph: rule counts, dependency fan-in/fan-out, relationships and engine performance metrics. Optional: rule_type (default all), include_dependencies (default true)."
    )]
    async fn analyze_rules(
        &self,
        params: Parameters<AnalyzeRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.0;
        let scope: RuleScope = parse_param(&request.rule_type)?;

        let analysis = self
            .engine
            .analyze_rules(scope, request.include_dependencies)
            .await
            .map_err(to_mcp_error)?;

        json_result(&analysis)
    }

    #[tool(
        description = "Find rules by text. Returns: matching rules ranked by relevance (name matches rank above content, content above description). Required: query. Optional: search_type (name, content, description, all), rule_type, limit."
    )]
    async fn search_rules(
        &self,
        params: Parameters<SearchRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.0;
        let fields: SearchFields = parse_param(&request.search_type)?;
        let scope: RuleScope = parse_param(&request.rule_type)?;

        let mut search = SearchRequest::new(request.query).fields(fields).scope(scope);
        if let Some(limit) = request.limit {
            search = search.limit(limit);
        }

        let results = self
            .engine
            .search_rules(&search)
            .await
            .map_err(to_mcp_error)?;

        json_result(&results)
    }

    #[tool(
        description = "Suggest structural and content improvements (near-duplicate templates, unused primitives, overloaded rules, low cache hit rate). Advisory only, never edits rules. Optional: optimization_type (performance, structure, content, all), rule_type."
    )]
    async fn optimize_rules(
        &self,
        params: Parameters<OptimizeRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.0;
        let optimization_type: OptimizationType = parse_param(&request.optimization_type)?;
        let scope: RuleScope = parse_param(&request.rule_type)?;

        let report = self
            .engine
            .optimize_rules(optimization_type, scope)
            .await
            .map_err(to_mcp_error)?;

        json_result(&report)
    }

    #[tool(
        description = "Drop cached prompts. Without a pattern the whole cache is cleared. A pattern \"rule:<tier>:<id>\" drops prompts built from that rule, \"name:<name>\" prompts requested under that name, and anything else is a key prefix such as \"task:code_review\". Returns: number of entries dropped and cache statistics."
    )]
    async fn invalidate_cache(
        &self,
        params: Parameters<InvalidateCacheRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = params.0;
        let invalidated = self.engine.invalidate_cache(request.pattern.as_deref());
        info!(
            "Invalidated {} cached prompts{}",
            invalidated,
            request
                .pattern
                .as_deref()
                .map(|p| format!(" matching '{}'", p))
                .unwrap_or_default()
        );

        json_result(&CacheInvalidation {
            invalidated,
            pattern: request.pattern,
            stats: self.engine.cache_stats(),
        })
    }
}

#[tool_handler]
impl ServerHandler for RuleGraphMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::ErrorCode;
    use rulegraph_core::{MemoryRuleStore, NewRelation, NewRule, RuleRef};
    use serde_json::Value;

    fn server() -> (RuleGraphMcpServer, Arc<MemoryRuleStore>) {
        let store = Arc::new(MemoryRuleStore::new());
        let (p1, _) = store
            .create_rule(
                RuleType::Primitive,
                NewRule::new("P1", "Be concise.").with_category("instruction"),
            )
            .unwrap();
        let (s1, _) = store
            .create_rule(
                RuleType::Semantic,
                NewRule::new("S1", "{{tone}}: {{primitive}}").with_variables(["tone"]),
            )
            .unwrap();
        let (t1, _) = store
            .create_rule(RuleType::Task, NewRule::new("T1", "Task: {{semantic}}"))
            .unwrap();
        store
            .create_relation(NewRelation::new(s1.rule_ref(), p1.rule_ref()))
            .unwrap();
        store
            .create_relation(NewRelation::new(t1.rule_ref(), s1.rule_ref()))
            .unwrap();

        let engine = Arc::new(RuleEngine::with_defaults(store.clone()));
        (RuleGraphMcpServer::new(engine), store)
    }

    fn params<T: serde::de::DeserializeOwned>(value: Value) -> Parameters<T> {
        Parameters(serde_json::from_value(value).unwrap())
    }

    fn payload(result: CallToolResult) -> Value {
        let raw = serde_json::to_value(&result).unwrap();
        let text = raw["content"][0]["text"].as_str().unwrap().to_string();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_generate_prompt_returns_prompt_and_metadata() {
        let (server, _) = server();

        let result = server
            .generate_prompt(params(json!({
                "rule_name": "T1",
                "context": { "tone": "Friendly" }
            })))
            .await
            .unwrap();
        let body = payload(result);

        assert_eq!(body["prompt"], "Task: Friendly: Be concise.");
        assert_eq!(body["metadata"]["rule"], "task:1");
        assert_eq!(body["metadata"]["cached"], false);
        assert_eq!(body["metadata"]["context_variables"], json!(["tone"]));
    }

    #[tokio::test]
    async fn test_unknown_rule_maps_to_invalid_params() {
        let (server, _) = server();

        let err = server
            .generate_prompt(params(json!({ "rule_name": "missing" })))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
        assert_eq!(err.data.unwrap()["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_rule_type_is_rejected_before_lookup() {
        let (server, _) = server();

        let err = server
            .search_rules(params(json!({ "query": "x", "rule_type": "tier9" })))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn test_error_mapping_by_kind() {
        let cyclic = to_mcp_error(RuleGraphError::CyclicDependency {
            path: vec![
                RuleRef::new(RuleType::Semantic, 1),
                RuleRef::new(RuleType::Semantic, 1),
            ],
        });
        assert_eq!(cyclic.code, ErrorCode::INVALID_REQUEST);
        assert_eq!(cyclic.data.unwrap()["kind"], "cyclic_dependency");

        let storage = to_mcp_error(RuleGraphError::Storage("disk gone".to_string()));
        assert_eq!(storage.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(storage.data.unwrap()["message"], "Storage error: disk gone");
    }

    #[tokio::test]
    async fn test_validate_and_search_tools() {
        let (server, _) = server();

        let report = payload(
            server
                .validate_rules(params(json!({})))
                .await
                .unwrap(),
        );
        assert_eq!(report["valid"], true);
        assert_eq!(report["rules_checked"], 3);

        let hits = payload(
            server
                .search_rules(params(json!({ "query": "s1", "search_type": "name" })))
                .await
                .unwrap(),
        );
        assert_eq!(hits["total_found"], 1);
        assert_eq!(hits["results"][0]["rule"], "semantic:1");
    }

    #[tokio::test]
    async fn test_validate_accepts_caller_supplied_variables() {
        let (server, store) = server();
        store
            .create_rule(
                RuleType::Primitive,
                NewRule::new("P2", "Write for {{audience}}.").with_category("instruction"),
            )
            .unwrap();

        let undocumented = |report: &Value| {
            report["warnings"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|w| w["kind"] == "undocumented_variable")
                .count()
        };

        let bare = payload(server.validate_rules(params(json!({}))).await.unwrap());
        assert_eq!(undocumented(&bare), 1);

        let with_context = payload(
            server
                .validate_rules(params(json!({ "context_variables": ["audience"] })))
                .await
                .unwrap(),
        );
        assert_eq!(undocumented(&with_context), 0);
    }

    #[tokio::test]
    async fn test_invalidate_cache_by_rule_tag() {
        let (server, _) = server();
        server
            .generate_prompt(params(json!({ "rule_name": "T1" })))
            .await
            .unwrap();

        let body = payload(
            server
                .invalidate_cache(params(json!({ "pattern": "rule:primitive:1" })))
                .await
                .unwrap(),
        );
        assert_eq!(body["invalidated"], 1);
    }

    #[tokio::test]
    async fn test_invalidate_cache_drops_generated_prompts() {
        let (server, _) = server();
        server
            .generate_prompt(params(json!({ "rule_name": "T1" })))
            .await
            .unwrap();

        let body = payload(
            server
                .invalidate_cache(params(json!({ "pattern": "task:" })))
                .await
                .unwrap(),
        );

        assert_eq!(body["invalidated"], 1);
        assert_eq!(body["stats"]["entries"], 0);
    }
}
