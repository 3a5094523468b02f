use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::*;
use docrules_core::logging::{init_tracing, LogFormat};
use docrules_core::serde_utils::{read_json_file, to_pretty_json};
use docrules_core::{config::load_core_config, CoreConfig};
use docrules_protocol::document::Document;
use docrules_rules::{
    load_catalog, DiagnosticKind, DocumentRunner, InMemoryReferenceSource, PgRuleRepository,
    ReferenceSource, RuleApiBuilder, RuleCatalog, RuleFilter, RuleServiceConfig, RuleSet,
    RuleStore, RuleType, RunOutcome, RunnerSettings, Verdict,
};
use tracing::info;

mod client;

use client::{CliError, RulesServiceClient};

#[derive(Parser)]
#[command(name = "docrules")]
#[command(about = "Business rules engine for extracted financial documents", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a rule catalog to a document file
    Evaluate(EvaluateArgs),
    /// Load a rule catalog and report what each tenant would run
    Validate(ValidateArgs),
    /// Serve the rule API
    Serve(ServeArgs),
    /// Talk to a running rule service
    #[command(subcommand)]
    Remote(RemoteCommands),
    /// Show version information
    Version,
}

#[derive(Args)]
struct EvaluateArgs {
    /// Rule file or directory (JSON or YAML)
    #[arg(long)]
    rules: PathBuf,
    /// Directory of reference tables, one JSON file per table
    #[arg(long)]
    tables: Option<PathBuf>,
    #[arg(long)]
    tenant: String,
    /// Restrict the run to these rule families
    #[arg(long = "tipo", value_parser = parse_rule_type)]
    tipos: Vec<RuleType>,
    /// Print the full outcome as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
    /// Document JSON file
    document: PathBuf,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long)]
    rules: PathBuf,
    /// Tenants whose effective rule set should be listed
    #[arg(long = "tenant")]
    tenants: Vec<String>,
}

#[derive(Args)]
struct ServeArgs {
    /// Seed the service from files instead of the database
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    tables: Option<PathBuf>,
    /// Overrides DOCRULES_HTTP_BIND
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Evaluate a document through a running service
    Evaluate(RemoteEvaluateArgs),
    /// Enable or disable a global rule for a tenant
    Link(RemoteLinkArgs),
}

#[derive(Args)]
struct RemoteTarget {
    #[arg(long, env = "DOCRULES_SERVICE_URL", default_value = "http://127.0.0.1:8081")]
    url: String,
    #[arg(long)]
    tenant: String,
}

#[derive(Args)]
struct RemoteEvaluateArgs {
    #[command(flatten)]
    target: RemoteTarget,
    #[arg(long = "tipo", value_parser = parse_rule_type)]
    tipos: Vec<RuleType>,
    #[arg(long, default_value_t = false)]
    json: bool,
    document: PathBuf,
}

#[derive(Args)]
struct RemoteLinkArgs {
    #[command(flatten)]
    target: RemoteTarget,
    codigo: String,
    /// Disable instead of enable
    #[arg(long, default_value_t = false)]
    off: bool,
}

fn parse_rule_type(raw: &str) -> Result<RuleType, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_uppercase()))
        .map_err(|_| format!("unknown rule type `{raw}`"))
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing(Some(&cli.log_level), LogFormat::Compact)?;

    match cli.command {
        Commands::Evaluate(args) => evaluate_local(args).await,
        Commands::Validate(args) => validate(args),
        Commands::Serve(args) => serve(args).await,
        Commands::Remote(RemoteCommands::Evaluate(args)) => {
            let client = RulesServiceClient::new(&args.target.url)?;
            let document = read_document(&args.document)?;
            let outcome = client
                .evaluate(&args.target.tenant, &document, &args.tipos)
                .await?;
            report(&outcome, args.json)
        }
        Commands::Remote(RemoteCommands::Link(args)) => {
            let client = RulesServiceClient::new(&args.target.url)?;
            let link = client
                .set_link(&args.target.tenant, &args.codigo, !args.off)
                .await?;
            println!(
                "{} {} para {}: {}",
                "✔ Vínculo actualizado".green().bold(),
                link.codigo.bold(),
                link.tenant_id,
                link.state
            );
            Ok(())
        }
        Commands::Version => {
            println!("docrules v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn read_document(path: &Path) -> Result<Document, CliError> {
    Ok(read_json_file::<Document>(path)?)
}

fn references_from(tables: Option<&Path>) -> Result<InMemoryReferenceSource, CliError> {
    match tables {
        Some(dir) => Ok(InMemoryReferenceSource::from_dir(dir)?),
        None => Ok(InMemoryReferenceSource::default()),
    }
}

fn runner_settings() -> Result<RunnerSettings, CliError> {
    let config = load_core_config()?;
    Ok(RunnerSettings::from(&config))
}

async fn evaluate_local(args: EvaluateArgs) -> Result<(), CliError> {
    let catalog = load_catalog(&args.rules)?;
    let references = references_from(args.tables.as_deref())?;
    let runner = DocumentRunner::new(Arc::new(catalog), Arc::new(references), runner_settings()?);

    let document = read_document(&args.document)?;
    let outcome = runner
        .run(&args.tenant, document, &RuleFilter::only(args.tipos))
        .await?;
    report(&outcome, args.json)
}

fn validate(args: ValidateArgs) -> Result<(), CliError> {
    let catalog = load_catalog(&args.rules)?;
    let globals = catalog.rules().iter().filter(|rule| rule.is_global()).count();
    println!(
        "{} {} reglas ({} globales, {} vínculos)",
        "✔ Catálogo válido:".green().bold(),
        catalog.rules().len(),
        globals,
        catalog.links().len()
    );

    for tenant in &args.tenants {
        print_rule_set(&catalog, tenant);
    }
    Ok(())
}

fn print_rule_set(catalog: &RuleCatalog, tenant: &str) {
    let set = RuleSet::resolve(catalog, tenant, &RuleFilter::all(), chrono::Utc::now());
    println!("{} {} ({})", "Tenant".bold(), tenant.bold(), set.fingerprint());
    for rule in set.rules() {
        let origin = if rule.is_global() { "global" } else { "tenant" };
        println!(
            "  {:>5}  {:<28} {:<26} {}",
            rule.priority,
            rule.code,
            rule.kind.as_str(),
            origin.dimmed()
        );
    }
}

async fn serve(args: ServeArgs) -> Result<(), CliError> {
    let config = load_core_config()?;
    let settings = RunnerSettings::from(&config);

    let (catalog, references): (RuleCatalog, Arc<dyn ReferenceSource>) = match &args.rules {
        Some(path) => (
            load_catalog(path)?,
            Arc::new(references_from(args.tables.as_deref())?),
        ),
        None => {
            let repository = PgRuleRepository::from_config(&config).await?;
            repository.pool().ping().await?;
            let catalog = repository.load_catalog().await?;
            let references: Arc<dyn ReferenceSource> = match args.tables.as_deref() {
                Some(dir) => Arc::new(references_from(Some(dir))?),
                None => Arc::new(repository),
            };
            (catalog, references)
        }
    };

    let service_config = RuleServiceConfig {
        bind_address: args.bind.unwrap_or_else(|| service_bind(&config)),
    };
    info!(
        rules = catalog.rules().len(),
        links = catalog.links().len(),
        address = %service_config.bind_address,
        "seeding rule store"
    );

    let shutdown = RuleApiBuilder::new(RuleStore::from_catalog(&catalog), references, settings)
        .serve(service_config)
        .await
        .map_err(|err| CliError::Server(err.to_string()))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| CliError::Server(err.to_string()))?;
    let _ = shutdown.send(());
    Ok(())
}

fn service_bind(config: &CoreConfig) -> String {
    RuleServiceConfig::from(config).bind_address
}

fn report(outcome: &RunOutcome, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", to_pretty_json(outcome)?);
        return Ok(());
    }

    let verdict = match outcome.report.verdict {
        Verdict::Pass => "PASS".green().bold(),
        Verdict::Warn => "WARN".yellow().bold(),
        Verdict::Blocked => "BLOCKED".red().bold(),
    };
    println!("{} {}", "Veredicto:".bold(), verdict);
    println!("  Conjunto de reglas: {}", outcome.report.rule_set_fingerprint);

    for diagnostic in &outcome.report.diagnostics {
        let location = format!("{}#{}", diagnostic.scope.as_str(), diagnostic.scope_index);
        match &diagnostic.kind {
            DiagnosticKind::Matched { changes } => println!(
                "  {} {} [{}] {} cambios",
                "✔".green(),
                diagnostic.rule_code,
                location,
                changes.iter().filter(|effect| effect.is_changed()).count()
            ),
            DiagnosticKind::NotMatched => {}
            DiagnosticKind::Skipped { stopped_by } => println!(
                "  {} {} [{}] omitida por {}",
                "-".dimmed(),
                diagnostic.rule_code,
                location,
                stopped_by
            ),
            DiagnosticKind::RuleError { message } => println!(
                "  {} {} [{}] {}",
                "✘".red(),
                diagnostic.rule_code,
                location,
                message
            ),
            DiagnosticKind::ActionError { action, message } => println!(
                "  {} {} [{}] {}: {}",
                "✘".red(),
                diagnostic.rule_code,
                location,
                action,
                message
            ),
            DiagnosticKind::ValidationFailed { level, message } => println!(
                "  {} {} [{}] {:?}: {}",
                "!".yellow().bold(),
                diagnostic.rule_code,
                location,
                level,
                message
            ),
        }
    }

    println!("{}", to_pretty_json(&outcome.document)?);
    if outcome.report.is_blocked() {
        std::process::exit(2);
    }
    Ok(())
}
