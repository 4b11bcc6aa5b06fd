use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay::connectors::{
    self, Connector, HttpConnector, LogConnector, Registry, ShellConnector, WebhookConnector,
};
use relay::engine::{self, Engine, FlowLoader};
use relay::flow::{load_flows, parse_flow_file, FlowDef};
use relay::server::{McpServer, WebhookServer};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Declarative workflow engine: YAML flows, pluggable connectors", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory containing flow YAML files
    #[arg(long, default_value = "./flows", global = true)]
    flows_dir: PathBuf,

    /// Directory containing external connector executables
    #[arg(long, default_value = "./plugins", global = true)]
    plugins_dir: PathBuf,

    /// Output format: table or json
    #[arg(short, long, default_value = "table", global = true)]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow with JSON input
    Run {
        /// Flow name
        name: String,
        /// JSON input for the flow
        #[arg(long, default_value = "{}")]
        input: String,
        /// Resolve and show what would execute without running
        #[arg(long)]
        dry_run: bool,
        /// Path to .env-style secrets file
        #[arg(long)]
        secrets_file: Option<PathBuf>,
    },
    /// List all available flows
    List,
    /// Show details of a flow
    Describe {
        /// Flow name
        name: String,
    },
    /// Validate a YAML flow file
    Validate {
        /// Path to flow YAML file
        file: PathBuf,
    },
    /// List registered connectors and their actions
    Connectors,
    /// Start the webhook server
    Serve {
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Start the tool server on stdin/stdout
    Mcp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr: the mcp command owns stdout for the protocol.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            name,
            input,
            dry_run,
            secrets_file,
        } => {
            cmd_run(
                &cli.flows_dir,
                &cli.plugins_dir,
                &name,
                &input,
                dry_run,
                secrets_file.as_deref(),
            )
            .await
        }
        Commands::List => cmd_list(&cli.flows_dir, &cli.output),
        Commands::Describe { name } => cmd_describe(&cli.flows_dir, &name, &cli.output),
        Commands::Validate { file } => cmd_validate(&file, &cli.plugins_dir).await,
        Commands::Connectors => cmd_connectors(&cli.plugins_dir).await,
        Commands::Serve { port } => cmd_serve(&cli.flows_dir, &cli.plugins_dir, port).await,
        Commands::Mcp => cmd_mcp(&cli.flows_dir, &cli.plugins_dir).await,
    }
}

/// Built-ins plus any plugins discovered in the plugins directory.
async fn default_registry(plugins_dir: &Path) -> Arc<Registry> {
    let registry = Registry::new();
    registry
        .register(Arc::new(HttpConnector::new()))
        .expect("builtin registration");
    registry
        .register(Arc::new(ShellConnector::new()))
        .expect("builtin registration");
    registry
        .register(Arc::new(LogConnector::new()))
        .expect("builtin registration");
    registry
        .register(Arc::new(WebhookConnector::new()))
        .expect("builtin registration");

    match connectors::discover_plugins(plugins_dir).await {
        Ok(plugins) => {
            for plugin in plugins {
                if let Err(e) = plugin.validate() {
                    warn!("skipping plugin: {}", e);
                    continue;
                }
                let name = plugin.name().to_string();
                if let Err(e) = registry.register(Arc::new(plugin)) {
                    warn!("registering plugin {:?}: {}", name, e);
                }
            }
        }
        Err(e) => warn!("loading external plugins: {}", e),
    }

    Arc::new(registry)
}

fn flow_loader(flows: HashMap<String, FlowDef>) -> FlowLoader {
    Arc::new(move |name: &str| {
        flows
            .get(name)
            .cloned()
            .ok_or_else(|| relay::Error::Flow(format!("flow {:?} not found", name)))
    })
}

async fn cmd_run(
    flows_dir: &Path,
    plugins_dir: &Path,
    name: &str,
    input_json: &str,
    dry_run: bool,
    secrets_file: Option<&Path>,
) -> anyhow::Result<()> {
    let flows = load_flows(flows_dir)?;
    let Some(flow) = flows.get(name) else {
        anyhow::bail!("flow {:?} not found in {}", name, flows_dir.display());
    };

    let input: serde_json::Map<String, serde_json::Value> = serde_json::from_str(input_json)
        .map_err(|e| anyhow::anyhow!("parsing input JSON: {}", e))?;

    let registry = default_registry(plugins_dir).await;
    engine::validate_flow(flow, &registry)?;

    let engine = Engine::new(registry).with_flow_loader(flow_loader(flows.clone()));

    let result = if dry_run {
        engine.dry_run(flow, input)?
    } else {
        let secrets = match secrets_file {
            Some(path) => engine::load_secrets(path)?,
            None => HashMap::new(),
        };

        // Ctrl-C cancels the in-flight run.
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        engine.run_with_secrets(flow, input, secrets, cancel).await?
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_list(flows_dir: &Path, output: &str) -> anyhow::Result<()> {
    let flows = load_flows(flows_dir)?;
    let mut names: Vec<&String> = flows.keys().collect();
    names.sort();

    if output == "json" {
        #[derive(serde::Serialize)]
        struct FlowSummary<'a> {
            name: &'a str,
            version: &'a str,
            description: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            trigger: Option<&'a str>,
            steps: usize,
        }

        let summaries: Vec<FlowSummary> = names
            .iter()
            .map(|name| {
                let flow = &flows[*name];
                FlowSummary {
                    name: &flow.name,
                    version: &flow.version,
                    description: &flow.description,
                    trigger: flow.trigger.as_ref().map(|t| t.trigger_type.as_str()),
                    steps: flow.steps.len(),
                }
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if names.is_empty() {
        println!("No flows found in {}.", flows_dir.display());
        return Ok(());
    }

    println!(
        "{:<28} {:<10} {:<40} {:>5} {:<10}",
        "NAME", "VERSION", "DESCRIPTION", "STEPS", "TRIGGER"
    );
    for name in names {
        let flow = &flows[name];
        println!(
            "{:<28} {:<10} {:<40} {:>5} {:<10}",
            flow.name,
            flow.version,
            flow.description,
            flow.steps.len(),
            flow.trigger.as_ref().map(|t| t.trigger_type.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

fn cmd_describe(flows_dir: &Path, name: &str, output: &str) -> anyhow::Result<()> {
    let flows = load_flows(flows_dir)?;
    let Some(flow) = flows.get(name) else {
        anyhow::bail!("flow {:?} not found in {}", name, flows_dir.display());
    };

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(flow)?);
        return Ok(());
    }

    println!("Name:        {}", flow.name);
    println!("Version:     {}", flow.version);
    println!("Description: {}", flow.description);
    if let Some(trigger) = &flow.trigger {
        println!("Trigger:     {} ({})", trigger.trigger_type, trigger.path);
    }

    if let Some(input) = &flow.input {
        if !input.properties.is_empty() {
            println!();
            println!("Input Schema:");
            println!("  {:<20} {:<10} {:<9} DESCRIPTION", "FIELD", "TYPE", "REQUIRED");
            let mut fields: Vec<&String> = input.properties.keys().collect();
            fields.sort();
            for field in fields {
                let def = &input.properties[field];
                println!(
                    "  {:<20} {:<10} {:<9} {}",
                    field, def.field_type, def.required, def.description
                );
            }
        }
    }

    println!();
    println!("Steps:");
    println!("  {:<3} {:<24} {:<12} {:<12} ON_ERROR", "#", "NAME", "CONNECTOR", "ACTION");
    for (i, step) in flow.steps.iter().enumerate() {
        let on_error = if step.on_error.is_empty() { "abort" } else { &step.on_error };
        if step.parallel.is_empty() {
            println!(
                "  {:<3} {:<24} {:<12} {:<12} {}",
                i + 1,
                step.name,
                step.connector,
                step.action,
                on_error
            );
        } else {
            println!(
                "  {:<3} {:<24} {:<12} {:<12} {}",
                i + 1,
                step.name,
                "(parallel)",
                format!("{} steps", step.parallel.len()),
                on_error
            );
            for child in &step.parallel {
                println!(
                    "      {:<22} {:<12} {:<12} {}",
                    child.name,
                    child.connector,
                    child.action,
                    if child.on_error.is_empty() { "abort" } else { &child.on_error }
                );
            }
        }
    }
    Ok(())
}

async fn cmd_validate(file: &Path, plugins_dir: &Path) -> anyhow::Result<()> {
    let flow = parse_flow_file(file)?;
    let registry = default_registry(plugins_dir).await;
    engine::validate_flow(&flow, &registry)?;
    println!("Flow {:?} is valid.", flow.name);
    Ok(())
}

async fn cmd_connectors(plugins_dir: &Path) -> anyhow::Result<()> {
    let registry = default_registry(plugins_dir).await;
    for name in registry.list() {
        let Some(connector) = registry.get(&name) else {
            continue;
        };
        println!("{}", name);
        for action in connector.actions() {
            println!("  {:<12} {}", action.name, action.description);
        }
    }
    Ok(())
}

async fn cmd_serve(flows_dir: &Path, plugins_dir: &Path, port: u16) -> anyhow::Result<()> {
    let flows = load_flows(flows_dir)?;
    let registry = default_registry(plugins_dir).await;
    let engine = Engine::new(registry).with_flow_loader(flow_loader(flows.clone()));

    println!("Starting webhook server on :{}", port);
    println!("Loaded {} flow(s)", flows.len());

    let server = WebhookServer::new(engine, flows);
    server.serve(&format!("0.0.0.0:{}", port)).await?;
    Ok(())
}

async fn cmd_mcp(flows_dir: &Path, plugins_dir: &Path) -> anyhow::Result<()> {
    let flows = load_flows(flows_dir)?;
    let registry = default_registry(plugins_dir).await;
    let engine = Engine::new(registry).with_flow_loader(flow_loader(flows.clone()));

    let server = McpServer::new(engine, flows);
    server.serve_stdio().await?;
    Ok(())
}
