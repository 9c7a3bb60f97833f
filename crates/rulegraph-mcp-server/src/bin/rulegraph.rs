use anyhow::{anyhow, bail, Context, Result};
use atty::Stream;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rmcp::ServiceExt;
use rulegraph_core::{
    ConfigManager, MemoryRuleStore, MergeStrategy, RenderContext, RuleGraphConfig, RuleScope,
    RuleSnapshot, RuleType, SearchFields,
};
use rulegraph_engine::{
    GenerateRequest, Issue, OptimizationType, RuleEngine, SearchRequest, Severity,
};
use rulegraph_mcp_server::RuleGraphMcpServer;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, Registry};

#[derive(Parser)]
#[command(
    name = "rulegraph",
    version,
    author,
    about = "RuleGraph prompt composition engine and MCP server",
    long_about = "Composes prompts from a three-tier rule hierarchy (primitive -> semantic -> task). \
Runs as an MCP server over stdio or as a command line tool against a JSON rule snapshot."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "RULEGRAPH_RULES_FILE",
        help = "JSON rule snapshot to load (overrides storage.rules_file)"
    )]
    rules_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the MCP server")]
    Start {
        #[command(subcommand)]
        transport: TransportType,
    },

    #[command(about = "Compose a prompt from a rule and its dependencies")]
    Generate {
        #[arg(help = "Rule name, optionally qualified as tier:name")]
        rule_name: String,

        #[arg(short = 't', long, help = "Rule tier: primitive, semantic or task")]
        rule_type: Option<String>,

        #[arg(
            long = "var",
            value_name = "KEY=VALUE",
            help = "Template variable (repeatable)"
        )]
        vars: Vec<String>,

        #[arg(short, long, help = "Target model: claude, gpt, gemini or default")]
        model: Option<String>,

        #[arg(long, help = "Print the full result with metadata as JSON")]
        json: bool,
    },

    #[command(about = "Check rules for cycles and inconsistencies")]
    Validate {
        #[arg(short = 't', long, default_value = "all", help = "Tier to validate")]
        rule_type: String,

        #[arg(long, help = "Validate a single rule id (requires --rule-type)")]
        rule_id: Option<i64>,

        #[arg(
            long = "known",
            value_name = "NAME",
            help = "Variable supplied at generation time (repeatable)"
        )]
        known: Vec<String>,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    #[command(about = "Summarize rule counts and dependencies")]
    Analyze {
        #[arg(short = 't', long, default_value = "all", help = "Tier to analyze")]
        rule_type: String,

        #[arg(long, help = "Skip per-rule dependency details")]
        no_dependencies: bool,
    },

    #[command(about = "Find rules by text")]
    Search {
        #[arg(help = "Text to look for")]
        query: String,

        #[arg(
            short = 's',
            long,
            default_value = "content",
            help = "Fields to match: name, content, description or all"
        )]
        search_type: String,

        #[arg(short = 't', long, default_value = "all", help = "Tier to search")]
        rule_type: String,

        #[arg(short, long, help = "Maximum number of results")]
        limit: Option<usize>,

        #[arg(long, help = "Print results as JSON")]
        json: bool,
    },

    #[command(about = "Suggest improvements to the rule graph")]
    Optimize {
        #[arg(
            short = 'o',
            long,
            default_value = "all",
            help = "performance, structure, content or all"
        )]
        optimization_type: String,

        #[arg(short = 't', long, default_value = "all", help = "Tier to inspect")]
        rule_type: String,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    #[command(about = "Write rules and relations to a JSON snapshot")]
    Export {
        #[arg(help = "Output file")]
        output: PathBuf,

        #[arg(short = 't', long, default_value = "all", help = "Tier to export")]
        rule_type: String,
    },

    #[command(about = "Merge a JSON snapshot into the rules file")]
    Import {
        #[arg(help = "Snapshot to import")]
        input: PathBuf,

        #[arg(
            long,
            default_value = "skip_existing",
            help = "Conflict handling: skip_existing or overwrite"
        )]
        strategy: String,

        #[arg(long, help = "Report what would be imported without saving")]
        dry_run: bool,
    },

    #[command(about = "Write a configuration file with default values")]
    InitConfig {
        #[arg(default_value = ".rulegraph.toml", help = "Destination path")]
        path: PathBuf,

        #[arg(short, long, help = "Overwrite an existing file")]
        force: bool,
    },
}

#[derive(Subcommand)]
enum TransportType {
    #[command(about = "Serve MCP over stdin/stdout")]
    Stdio,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path, force } = &cli.command {
        return handle_init_config(path, *force);
    }

    let config_mgr = match &cli.config {
        Some(path) => ConfigManager::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigManager::load().context("Failed to load configuration")?,
    };
    let mut config = config_mgr.into_config();
    if let Some(rules_file) = cli.rules_file.clone() {
        config.storage.rules_file = Some(rules_file);
    }

    match cli.command {
        Commands::Start { transport } => handle_start(transport, config, cli.verbose).await?,
        command => {
            init_cli_logging(&config, cli.verbose);
            handle_command(command, config).await?;
        }
    }

    Ok(())
}

fn env_filter(config: &RuleGraphConfig, verbose: bool) -> EnvFilter {
    let default_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Logs go to stderr so stdout stays clean for prompts and JSON
fn init_cli_logging(config: &RuleGraphConfig, verbose: bool) {
    let subscriber = Registry::default()
        .with(env_filter(config, verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_store(config: &RuleGraphConfig) -> Result<MemoryRuleStore> {
    match &config.storage.rules_file {
        Some(path) if path.exists() => MemoryRuleStore::load_from_file(path)
            .with_context(|| format!("Failed to load rules from {}", path.display())),
        Some(path) => {
            tracing::warn!(
                "Rules file {} does not exist; starting with an empty store",
                path.display()
            );
            Ok(MemoryRuleStore::new())
        }
        None => Ok(MemoryRuleStore::new()),
    }
}

fn build_engine(config: RuleGraphConfig) -> Result<RuleEngine> {
    let store = Arc::new(load_store(&config)?);
    tracing::info!(
        "Loaded {} rules and {} relations",
        store.rule_count(),
        store.relation_count()
    );
    Ok(RuleEngine::new(store, config))
}

fn parse<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = rulegraph_core::RuleGraphError>,
{
    value.parse().map_err(|e| anyhow!("{}", e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_start(transport: TransportType, config: RuleGraphConfig, verbose: bool) -> Result<()> {
    match transport {
        TransportType::Stdio => {
            // stdout carries the protocol; logs go to .rulegraph/logs/mcp-server.log
            let log_dir = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".rulegraph")
                .join("logs");
            std::fs::create_dir_all(&log_dir).ok();

            let file_appender = tracing_appender::rolling::never(&log_dir, "mcp-server.log");
            let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_env_filter(env_filter(&config, verbose))
                .with_ansi(false)
                .with_target(false)
                .with_line_number(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber).ok();

            if atty::is(Stream::Stderr) {
                eprintln!("{}", "Starting RuleGraph MCP Server...".green().bold());
            }

            let engine = Arc::new(build_engine(config)?);
            let server = RuleGraphMcpServer::new(engine);

            let service = server.serve(rmcp::transport::stdio()).await.map_err(|e| {
                if atty::is(Stream::Stderr) {
                    eprintln!("{} {}", "Failed to start MCP server:".red(), e);
                }
                anyhow!("MCP server startup failed: {}", e)
            })?;

            if atty::is(Stream::Stderr) {
                eprintln!("{}", "RuleGraph MCP server ready on stdio".green());
            }

            service
                .waiting()
                .await
                .map_err(|e| anyhow!("Server error: {}", e))?;

            tracing::info!("MCP server stopped");
        }
    }

    Ok(())
}

async fn handle_command(command: Commands, config: RuleGraphConfig) -> Result<()> {
    match command {
        Commands::Generate {
            rule_name,
            rule_type,
            vars,
            model,
            json,
        } => handle_generate(config, rule_name, rule_type, vars, model, json).await,
        Commands::Validate {
            rule_type,
            rule_id,
            known,
            json,
        } => handle_validate(config, rule_type, rule_id, known, json).await,
        Commands::Analyze {
            rule_type,
            no_dependencies,
        } => {
            let engine = build_engine(config)?;
            let analysis = engine
                .analyze_rules(parse(&rule_type)?, !no_dependencies)
                .await?;
            print_json(&analysis)
        }
        Commands::Search {
            query,
            search_type,
            rule_type,
            limit,
            json,
        } => handle_search(config, query, search_type, rule_type, limit, json).await,
        Commands::Optimize {
            optimization_type,
            rule_type,
            json,
        } => handle_optimize(config, optimization_type, rule_type, json).await,
        Commands::Export { output, rule_type } => handle_export(config, &output, &rule_type),
        Commands::Import {
            input,
            strategy,
            dry_run,
        } => handle_import(config, &input, &strategy, dry_run),
        Commands::Start { .. } | Commands::InitConfig { .. } => Ok(()),
    }
}

fn parse_vars(vars: &[String]) -> Result<RenderContext> {
    vars.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("Invalid --var '{}': expected KEY=VALUE", pair))
        })
        .collect()
}

async fn handle_generate(
    config: RuleGraphConfig,
    rule_name: String,
    rule_type: Option<String>,
    vars: Vec<String>,
    model: Option<String>,
    json: bool,
) -> Result<()> {
    let engine = build_engine(config)?;
    let request = GenerateRequest {
        rule_name,
        rule_type: rule_type.as_deref().map(parse::<RuleType>).transpose()?,
        context: parse_vars(&vars)?,
        target_model: model,
    };

    let result = engine.generate_prompt(request).await?;
    if json {
        return print_json(&result);
    }

    println!("{}", result.prompt);

    if atty::is(Stream::Stderr) {
        let meta = &result.metadata;
        eprintln!();
        eprintln!(
            "{} {} ({}) in {:.2}ms{}",
            "Generated".green().bold(),
            meta.rule_name,
            meta.target_model,
            meta.generation_time * 1000.0,
            if meta.cached { " [cached]" } else { "" }
        );
        if !meta.unresolved_variables.is_empty() {
            eprintln!(
                "{} {}",
                "Unresolved variables:".yellow(),
                meta.unresolved_variables.join(", ")
            );
        }
        for skipped in &meta.skipped_dependencies {
            eprintln!(
                "{} {} -> {}: {}",
                "Skipped optional dependency".yellow(),
                skipped.parent,
                skipped.child,
                skipped.reason
            );
        }
        for warning in &meta.warnings {
            eprintln!("{} {}", "Warning:".yellow(), warning);
        }
    }

    Ok(())
}

fn print_issue(issue: &Issue) {
    let label = match issue.severity {
        Severity::Error => "error".red().bold(),
        Severity::Warning => "warning".yellow().bold(),
    };
    println!("  {} {}", label, issue.message);
}

async fn handle_validate(
    config: RuleGraphConfig,
    rule_type: String,
    rule_id: Option<i64>,
    known: Vec<String>,
    json: bool,
) -> Result<()> {
    let engine = build_engine(config)?;
    let known: BTreeSet<String> = known.into_iter().collect();
    let report = engine
        .validate_rules_with_context(parse(&rule_type)?, rule_id, &known)
        .await?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{} {} rules in scope {}",
            "Validated".cyan().bold(),
            report.rules_checked,
            report.scope
        );
        report.issues.iter().for_each(print_issue);
        report.warnings.iter().for_each(print_issue);
        if report.valid {
            println!("{}", "No errors found".green());
        }
    }

    if !report.valid {
        bail!("Validation found {} error(s)", report.issues.len());
    }
    Ok(())
}

async fn handle_search(
    config: RuleGraphConfig,
    query: String,
    search_type: String,
    rule_type: String,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let engine = build_engine(config)?;
    let mut request = SearchRequest::new(query)
        .fields(parse::<SearchFields>(&search_type)?)
        .scope(parse::<RuleScope>(&rule_type)?);
    if let Some(limit) = limit {
        request = request.limit(limit);
    }

    let results = engine.search_rules(&request).await?;
    if json {
        return print_json(&results);
    }

    println!(
        "{} {} of {} matches for '{}'",
        "Showing".cyan().bold(),
        results.results.len(),
        results.total_found,
        results.query
    );
    for hit in &results.results {
        println!(
            "  {} {} {}",
            format!("[{:.2}]", hit.relevance).dimmed(),
            hit.rule.to_string().bold(),
            hit.name
        );
        println!("      {}", hit.preview);
    }
    Ok(())
}

async fn handle_optimize(
    config: RuleGraphConfig,
    optimization_type: String,
    rule_type: String,
    json: bool,
) -> Result<()> {
    let engine = build_engine(config)?;
    let report = engine
        .optimize_rules(
            parse::<OptimizationType>(&optimization_type)?,
            parse(&rule_type)?,
        )
        .await?;

    if json {
        return print_json(&report);
    }

    println!(
        "{} {} suggestions (priority score {})",
        "Found".cyan().bold(),
        report.suggestions.len(),
        report.priority_score
    );
    for suggestion in &report.suggestions {
        println!(
            "  {} {}",
            format!("[{:?}]", suggestion.impact).yellow(),
            suggestion.message
        );
    }
    Ok(())
}

fn handle_export(config: RuleGraphConfig, output: &Path, rule_type: &str) -> Result<()> {
    let store = load_store(&config)?;
    let scope: RuleScope = parse(rule_type)?;
    store
        .save_to_file(output, scope)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "{} {} rules to {}",
        "Exported".green().bold(),
        store.export_snapshot(scope).rules.len(),
        output.display()
    );
    Ok(())
}

fn handle_import(config: RuleGraphConfig, input: &Path, strategy: &str, dry_run: bool) -> Result<()> {
    let target = config
        .storage
        .rules_file
        .clone()
        .context("No rules file configured; pass --rules-file or set storage.rules_file")?;
    let strategy: MergeStrategy = parse(strategy)?;

    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let snapshot: RuleSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse snapshot {}", input.display()))?;

    let store = load_store(&config)?;
    let (stats, _) = store.import_snapshot(snapshot, strategy)?;

    if !dry_run {
        store
            .save_to_file(&target, RuleScope::All)
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }

    println!(
        "{} {} rules ({} skipped), {} relations ({} skipped){}",
        "Imported".green().bold(),
        stats.rules_imported,
        stats.rules_skipped,
        stats.relations_imported,
        stats.relations_skipped,
        if dry_run { " [dry run]" } else { "" }
    );
    Ok(())
}

fn handle_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; use --force to overwrite",
            path.display()
        );
    }
    ConfigManager::create_default_config(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} {}", "Wrote default configuration to".green(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vars_splits_on_first_equals() {
        let ctx = parse_vars(&["tone=formal".to_string(), "expr=a=b".to_string()]).unwrap();
        assert_eq!(ctx.get("tone").map(String::as_str), Some("formal"));
        assert_eq!(ctx.get("expr").map(String::as_str), Some("a=b"));
        assert!(parse_vars(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn test_import_writes_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let target = dir.path().join("rules.json");
        std::fs::write(
            &input,
            r#"{"rules":[{"id":1,"rule_type":"primitive","name":"p","template":"Be brief.","category":"instruction"}],"relations":[]}"#,
        )
        .unwrap();

        let mut config = RuleGraphConfig::default();
        config.storage.rules_file = Some(target.clone());
        handle_import(config.clone(), &input, "skip_existing", false).unwrap();

        let store = load_store(&config).unwrap();
        assert_eq!(store.rule_count(), 1);
    }
}
