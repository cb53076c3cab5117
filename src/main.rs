use std::{env, path::PathBuf, process, sync::Arc};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use modwire::{
    app::App,
    bus::EventBus,
    config::{ConfigManager, RuntimeConfig},
    logger::{LogConfig, init_tracing},
    plugin::{ModuleHost, PluginRegistry, SharedContracts},
    port::PortRegistry,
    schema::write_schemas,
    wiring::{ConfigurationStore, WiringConfiguration, WiringEngine},
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "modwire", about = "Wire sandboxed modules together and run them", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the runtime until Ctrl-C
    Run(RunArgs),

    /// Check a wiring configuration file and print its execution levels
    Validate { file: PathBuf },

    /// Load every plugin under a directory and report the outcome
    Scan {
        /// Defaults to `<root>/plugins`
        dir: Option<PathBuf>,
    },

    /// List stored wiring configurations
    Configs,

    /// Write JSON schemas for the on-disk formats into `<root>/schemas`
    Schema,

    /// Read or change `MODWIRE_*` settings stored in `<root>/.env`
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Print every `MODWIRE_*` setting
    List,
    /// Add or replace a setting
    Set { key: String, value: String },
    /// Remove a setting
    Del { key: String },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Log level or filter directive, overrides MODWIRE_LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    /// OTLP endpoint (e.g. http://localhost:4318), overrides MODWIRE_OTEL_ENDPOINT
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Stored configuration to load instead of the last one
    #[arg(long)]
    load: Option<String>,

    /// Execute the loaded configuration once after startup
    #[arg(long)]
    execute: bool,
}

/// `MODWIRE_ROOT`, or `./modwire`.
pub fn resolve_root_dir() -> PathBuf {
    env::var("MODWIRE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./modwire"))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let manager = ConfigManager::env(root.join(".env"));
    let command = cli.command.unwrap_or(Commands::Run(RunArgs::default()));
    // settings must stay editable even when the stored ones are invalid
    if let Commands::Settings { command } = command {
        return settings(&manager, command).await;
    }
    let config = RuntimeConfig::from_manager(&root, &manager).await?;

    match command {
        Commands::Run(args) => run(config, args).await,
        Commands::Validate { file } => {
            console_tracing(&config)?;
            validate(file)
        }
        Commands::Scan { dir } => {
            console_tracing(&config)?;
            scan(dir.unwrap_or_else(|| config.plugins_dir())).await
        }
        Commands::Configs => {
            let store = ConfigurationStore::new(config.configs_dir());
            let last = store.last_loaded()?;
            for name in store.list()? {
                let marker = if last.as_deref() == Some(name.as_str()) { "*" } else { " " };
                println!("{} {}", marker, name);
            }
            Ok(())
        }
        Commands::Schema => {
            console_tracing(&config)?;
            let out_dir = config.schemas_dir();
            write_schemas(&out_dir)?;
            println!("Schemas written to {}", out_dir.display());
            Ok(())
        }
        Commands::Settings { .. } => Ok(()),
    }
}

async fn settings(manager: &ConfigManager, command: SettingsCommands) -> anyhow::Result<()> {
    match command {
        SettingsCommands::List => {
            for (key, value) in manager.settings().await {
                println!("{}={}", key, value);
            }
        }
        SettingsCommands::Set { key, value } => {
            manager
                .set(&key, &value)
                .await
                .with_context(|| format!("could not set {}", key))?;
            println!("{} updated.", key);
        }
        SettingsCommands::Del { key } => {
            manager.del(&key).await;
            println!("{} removed.", key);
        }
    }
    Ok(())
}

/// Stdout-only tracing for one-shot commands.
fn console_tracing(config: &RuntimeConfig) -> anyhow::Result<()> {
    let log = LogConfig {
        log_dir: None,
        otel_endpoint: None,
        ..config.log.clone()
    };
    init_tracing(&log)?;
    Ok(())
}

fn validate(file: PathBuf) -> anyhow::Result<()> {
    let config = WiringConfiguration::from_file(&file)?;
    let engine = WiringEngine::new(Arc::new(EventBus::new()), Arc::new(PortRegistry::new()));
    let levels = engine
        .validate_configuration(&config)
        .with_context(|| format!("{} is not a valid wiring configuration", file.display()))?;

    println!("Configuration `{}` is valid.", config.name);
    for (i, level) in levels.iter().enumerate() {
        println!("  level {}: {}", i, level.join(", "));
    }
    Ok(())
}

async fn scan(dir: PathBuf) -> anyhow::Result<()> {
    let host = ModuleHost::new(
        Arc::new(SharedContracts::default()),
        Arc::new(EventBus::new()),
        Arc::new(PluginRegistry::new()),
        Arc::new(PortRegistry::new()),
    );
    let results = host.scan(&dir).await;
    let failed = results.iter().filter(|r| !r.is_success()).count();
    for result in &results {
        match &result.error {
            None => println!(
                "ok    {} ({})",
                result.module_id().unwrap_or("?"),
                result.directory.display()
            ),
            Some(e) => println!("fail  {}: {}", result.directory.display(), e),
        }
    }
    host.shutdown_all().await;
    if failed > 0 {
        bail!("{} of {} plugins failed to load", failed, results.len());
    }
    Ok(())
}

async fn run(mut config: RuntimeConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(level) = args.log_level {
        config.log.log_level = level;
    }
    if args.otel_endpoint.is_some() {
        config.log.otel_endpoint = args.otel_endpoint;
    }
    if args.load.is_some() {
        config.auto_resume = false;
    }
    let telemetry = init_tracing(&config.log)?;

    let app = match App::bootstrap(config, Vec::new()).await {
        Ok(app) => app,
        Err(e) => {
            error!("failed to bootstrap modwire: {:#}", e);
            telemetry.shutdown();
            process::exit(1);
        }
    };

    if let Some(name) = &args.load {
        let levels = app.load(name)?;
        info!(configuration = %name, levels = levels.len(), "configuration loaded");
    }
    if args.execute {
        let report = app.execute().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    println!("modwire running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    app.shutdown().await;
    telemetry.shutdown();
    Ok(())
}
