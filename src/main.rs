//! layerconf - inspect and edit layered configuration from the command line
//!
//! Files given with `--file` are stacked at levels 0, 10, 20, ... in the order
//! given; the last one receives writes. Environment variables sit above every
//! file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use layerconf::{
    ConfigEvent, Configuration, ConfigurationBuilder, EncryptionTransformer, EngineSettings, EnvSource, FileSource,
    Masker, SettingsManager, ShutdownCoordinator, SourceRegistration, ValueCipher, WriteTarget,
};

/// Level step between consecutive `--file` arguments
const LEVEL_STEP: i32 = 10;

/// CLI arguments for layerconf
#[derive(Parser, Debug)]
#[command(name = "layerconf")]
#[command(about = "Inspect and edit layered configuration")]
#[command(version)]
#[command(long_about = "
Inspect and edit layered configuration.

Files are layered in the order given (levels 0, 10, 20, ...); later files
override earlier ones and the last file is the default write target.
Environment variables override every file.

Environment variables:
  LAYERCONF_DEBOUNCE         - Quiet window before reloading (e.g., 100ms)
  LAYERCONF_MAX_DEBOUNCE     - Longest a burst can delay a reload
  LAYERCONF_SOURCE_TIMEOUT   - Per-source load timeout
  LAYERCONF_WRITE_TIMEOUT    - Per-write timeout
  LAYERCONF_DISPOSE_GRACE    - Grace period on shutdown
  LAYERCONF_EVENT_CAPACITY   - Change stream capacity
  LAYERCONF_INTERPOLATION    - Resolve ${Key} references (true/false)
")]
pub struct CliArgs {
    /// Configuration file; repeat to add layers
    #[arg(short, long = "file", help = "Configuration file (repeatable, lowest precedence first)")]
    pub files: Vec<PathBuf>,

    /// Only read environment variables with this prefix
    #[arg(long, help = "Environment variable prefix, e.g. APP_")]
    pub env_prefix: Option<String>,

    /// Engine settings file (TOML)
    #[arg(long, help = "Engine settings file")]
    pub settings: Option<PathBuf>,

    /// Name of the environment variable holding the encryption passphrase
    #[arg(long, help = "Environment variable holding the encryption passphrase")]
    pub encryption_key_env: Option<String>,

    /// Sensitive key pattern; repeat for several
    #[arg(long, help = "Sensitive key glob, e.g. *Password*")]
    pub sensitive: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the value of a key
    Get { key: String },
    /// Print every key with its value
    List {
        #[arg(long)]
        prefix: Option<String>,
        /// Print sensitive values in clear text
        #[arg(long)]
        show_secrets: bool,
    },
    /// Print the immediate child sections under a prefix
    Sections { prefix: Option<String> },
    /// Write a value
    Set {
        key: String,
        value: String,
        #[arg(long)]
        level: Option<i32>,
    },
    /// Delete a key
    Remove {
        key: String,
        #[arg(long)]
        level: Option<i32>,
    },
    /// Print the registered sources
    Sources,
    /// Print change events until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing
    init_tracing(&args)?;

    let settings = load_settings(&args)?;
    let masker = build_masker(&args)?;
    let config = build_configuration(&args, settings, masker.clone()).await?;

    let result = run_command(&args.command, &config, &masker).await;
    config.dispose().await;
    result
}

async fn run_command(command: &Command, config: &Configuration, masker: &Masker) -> Result<()> {
    match command {
        Command::Get { key } => match config.get(key)? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Key '{}' is not defined", key),
        },
        Command::List { prefix, show_secrets } => {
            let snapshot = config.snapshot();
            let entries: Vec<_> = match prefix {
                Some(prefix) => snapshot.descendants(prefix).collect(),
                None => snapshot.iter().collect(),
            };
            for entry in entries {
                let shown = match &entry.value {
                    None => "(null)".to_string(),
                    Some(_) if *show_secrets => config.get(&entry.key)?.unwrap_or_default(),
                    Some(stored) => masker.mask(&entry.key, stored),
                };
                println!("{} = {}", entry.key, shown);
            }
        }
        Command::Sections { prefix } => {
            for name in config.child_keys(prefix.as_deref().unwrap_or_default()) {
                println!("{}", name);
            }
        }
        Command::Set { key, value, level } => {
            match level {
                Some(level) => config.set_at(key, value.clone(), WriteTarget::level(*level)).await?,
                None => config.set(key, value.clone()).await?,
            }
            config.save().await?;
            println!("{} = {}", key, masker.mask(key, value));
        }
        Command::Remove { key, level } => {
            match level {
                Some(level) => config.remove_at(key, WriteTarget::level(*level)).await?,
                None => config.remove(key).await?,
            }
            config.save().await?;
            println!("Removed {}", key);
        }
        Command::Sources => {
            for source in config.sources() {
                let mut flags = Vec::new();
                if source.writeable {
                    flags.push("writeable");
                }
                if source.primary_writer {
                    flags.push("primary");
                }
                println!("{:>5}  {:<30} {:<16} {}", source.id.level, source.id.name, source.kind, flags.join(","));
            }
        }
        Command::Watch => watch(config, masker).await?,
    }
    Ok(())
}

/// Print change events until SIGINT/SIGTERM
async fn watch(config: &Configuration, masker: &Masker) -> Result<()> {
    let coordinator = ShutdownCoordinator::new(config.settings().dispose_grace);
    let mut events = config.subscribe();
    println!("Watching {} sources, press Ctrl+C to stop", config.sources().len());

    let printer = async {
        while let Some(event) = events.next().await {
            match event {
                Ok(ConfigEvent::Changed(change)) => {
                    for c in change.changes.values() {
                        let show = |v: &Option<String>| match v {
                            Some(v) => masker.mask(&c.key, v),
                            None => "(none)".to_string(),
                        };
                        println!("{:?} {}: {} -> {}", c.change_type, c.key, show(&c.old_value), show(&c.new_value));
                    }
                }
                Ok(ConfigEvent::ReloadFailed(failure)) => {
                    for e in &failure.errors {
                        println!("Reload failed (levels {:?}): {}", failure.affected_levels, e);
                    }
                }
                Err(e) => debug!("Change stream lagged: {}", e),
            }
        }
    };

    tokio::select! {
        _ = printer => {}
        result = coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
        }
    }
    info!("Stopped watching");
    Ok(())
}

fn load_settings(args: &CliArgs) -> Result<EngineSettings> {
    let settings = match &args.settings {
        Some(path) => {
            let mut settings = SettingsManager::load_from_file(path)?;
            SettingsManager::apply_env(&mut settings)?;
            settings
        }
        None => SettingsManager::load_from_env()?,
    };
    settings
        .validate()
        .context("Final settings validation failed")?;
    Ok(settings)
}

fn build_masker(args: &CliArgs) -> Result<Masker> {
    if args.sensitive.is_empty() {
        Ok(Masker::default())
    } else {
        Masker::new(&args.sensitive).context("Invalid --sensitive pattern")
    }
}

async fn build_configuration(args: &CliArgs, settings: EngineSettings, masker: Masker) -> Result<Configuration> {
    let watch = matches!(args.command, Command::Watch);
    let mut builder = ConfigurationBuilder::new().settings(settings).masker(masker);

    let last = args.files.len().saturating_sub(1);
    for (index, path) in args.files.iter().enumerate() {
        let source = FileSource::new(path)?
            .optional(true)
            .writeable(true)
            .watch_changes(watch);
        let level = index as i32 * LEVEL_STEP;
        let registration = SourceRegistration::new(level, source);
        builder = builder.add(if index == last {
            registration.primary_writer()
        } else {
            registration
        });
    }

    let env = match &args.env_prefix {
        Some(prefix) => EnvSource::with_prefix(prefix),
        None => EnvSource::new(),
    };
    builder = builder.add_source(args.files.len() as i32 * LEVEL_STEP, env);

    if let Some(var) = &args.encryption_key_env {
        let cipher = ValueCipher::from_env(var)?;
        let patterns = if args.sensitive.is_empty() {
            vec!["*Password*".to_string(), "*Secret*".to_string()]
        } else {
            args.sensitive.clone()
        };
        let transformer = EncryptionTransformer::new(cipher, patterns).context("Invalid --sensitive pattern")?;
        builder = builder.transformer(Arc::new(transformer));
    }

    builder.build().await.context("Failed to build configuration")
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
