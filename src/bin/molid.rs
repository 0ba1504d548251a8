use std::fs;
use std::path::Path;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use molid::config::{ConfigLoader, ResolvedConfig};
use molid::domain::{IdType, SearchMode, SourceTag, canonical_formula};
use molid::error::MolidError;
use molid::ingest::{Ingestor, UpdateOptions};
use molid::output::{HumanOutput, JsonOutput, LogProgress, OutputMode};
use molid::pubchem::PubchemHttpClient;
use molid::search::{Query, Resolution, SearchEngine};
use molid::store::{CompoundColumn, MasterStore, WriterLock};
use molid::structure::{Geometry, ObabelConverter};
use molid::transfer::PubchemHttpSource;

#[derive(Parser)]
#[command(name = "molid")]
#[command(about = "PubChem compound identification: offline master store, online lookup and cache")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./molid.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand, about = "Manage the offline master store")]
    Db(DbCommand),
    #[command(about = "Resolve an identifier using the configured search mode")]
    Search(SearchArgs),
    #[command(about = "Resolve the structure in an .xyz or .sdf file")]
    SearchFile(SearchFileArgs),
    #[command(subcommand, about = "Show or edit the configuration file")]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum DbCommand {
    #[command(about = "Create an empty master store")]
    Create(DbFileArgs),
    #[command(about = "Download and ingest PubChem SDF archives")]
    Update(UpdateArgs),
    #[command(about = "Point the configuration at an existing master store")]
    Use(UseArgs),
    #[command(about = "Forget processed archives so they are ingested again")]
    Reset(ResetArgs),
    #[command(about = "Show master store counts")]
    Stats(DbFileArgs),
    #[command(about = "Query the master store by column, e.g. formula=C6H6")]
    Query(QueryArgs),
}

#[derive(Args)]
struct DbFileArgs {
    #[arg(long)]
    db_file: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct UpdateArgs {
    #[arg(long)]
    db_file: Option<Utf8PathBuf>,

    #[arg(long)]
    max_files: Option<usize>,

    #[arg(long)]
    download_folder: Option<Utf8PathBuf>,

    #[arg(long)]
    processed_folder: Option<Utf8PathBuf>,

    #[arg(long, default_value_t = molid::ingest::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Args)]
struct UseArgs {
    db_file: Utf8PathBuf,
}

#[derive(Args)]
struct ResetArgs {
    #[arg(long)]
    db_file: Option<Utf8PathBuf>,

    /// Reset a single archive instead of all of them
    #[arg(long)]
    archive: Option<String>,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long)]
    db_file: Option<Utf8PathBuf>,

    #[arg(required = true)]
    predicates: Vec<String>,
}

#[derive(Args)]
struct SearchArgs {
    identifier: String,

    #[arg(long, value_enum, default_value_t = IdType::Inchikey)]
    id_type: IdType,

    /// Override the configured mode for this search
    #[arg(long, value_enum)]
    mode: Option<SearchMode>,
}

#[derive(Args)]
struct SearchFileArgs {
    path: Utf8PathBuf,

    #[arg(long, value_enum)]
    mode: Option<SearchMode>,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Set the master store path
    SetMaster { path: Utf8PathBuf },
    /// Set the cache store path
    SetCache { path: Utf8PathBuf },
    /// Set the default search mode
    SetMode {
        #[arg(value_enum)]
        mode: SearchMode,
    },
    SetCacheEnabled {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(molid) = report.downcast_ref::<MolidError>() {
                return ExitCode::from(map_exit_code(molid));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &MolidError) -> u8 {
    match error {
        MolidError::MissingStore { .. } | MolidError::RemoteLookup { .. } => 2,
        MolidError::Listing(_)
        | MolidError::TransferHttp(_)
        | MolidError::TransferStatus { .. }
        | MolidError::TransferExhausted { .. }
        | MolidError::MissingTool(_)
        | MolidError::Conversion(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .into_diagnostic()?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Db(command) => run_db(command, config_path, output_mode),
        Commands::Search(args) => {
            let resolved = ConfigLoader::resolve(config_path)?;
            let mut engine = build_engine(&resolved, args.mode)?;
            let query = Query::new(args.identifier, args.id_type);
            let resolution = engine.resolve(&query)?;
            report_resolution(resolution.as_ref(), &query.identifier, output_mode)
        }
        Commands::SearchFile(args) => {
            let resolved = ConfigLoader::resolve(config_path)?;
            let geometry = read_geometry(args.path.as_std_path())?;
            let mut engine = build_engine(&resolved, args.mode)?;
            let resolution = engine.resolve_geometry(&geometry)?;
            report_resolution(resolution.as_ref(), args.path.as_str(), output_mode)
        }
        Commands::Config(command) => {
            run_config(command, config_path, output_mode)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_engine(
    resolved: &ResolvedConfig,
    mode_override: Option<SearchMode>,
) -> miette::Result<SearchEngine<PubchemHttpClient, ObabelConverter>> {
    let mut config = resolved.search_configuration();
    if let Some(mode) = mode_override {
        config.mode = mode;
    }
    let remote = PubchemHttpClient::new()?;
    Ok(SearchEngine::new(config, remote, ObabelConverter::new())?)
}

fn report_resolution(
    resolution: Option<&Resolution>,
    label: &str,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_resolution(resolution).into_diagnostic()?,
        OutputMode::Human => match resolution {
            Some(resolution) => HumanOutput::print_resolution(resolution),
            None => println!("No match for {label}"),
        },
    }
    Ok(if resolution.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn read_geometry(path: &Path) -> Result<Geometry, MolidError> {
    let text = fs::read_to_string(path)
        .map_err(|err| MolidError::Filesystem(format!("{}: {err}", path.display())))?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("xyz") => Geometry::from_xyz(&text),
        Some("sdf") | Some("mol") => Geometry::from_molfile(&text),
        _ => Err(MolidError::InvalidQuery(format!(
            "unsupported structure file: {} (expected .xyz or .sdf)",
            path.display()
        ))),
    }
}

fn run_db(
    command: DbCommand,
    config_path: Option<&str>,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let resolved = ConfigLoader::resolve(config_path)?;
    let db_path =
        |db_file: Option<Utf8PathBuf>| db_file.unwrap_or_else(|| resolved.master_db.clone());

    match command {
        DbCommand::Create(args) => {
            let path = db_path(args.db_file);
            let store = MasterStore::create(path.as_std_path())?;
            print_stats(&store, output_mode)?;
        }
        DbCommand::Update(args) => {
            let path = db_path(args.db_file);
            let mut options = UpdateOptions::new(
                args.download_folder
                    .unwrap_or_else(|| resolved.download_folder.clone()),
                args.processed_folder
                    .unwrap_or_else(|| resolved.processed_folder.clone()),
            );
            options.max_archives = args.max_files.or(resolved.max_files);
            options.batch_size = args.batch_size;
            info!(
                db = %path,
                downloads = %options.download_dir.display(),
                max_files = ?options.max_archives,
                "starting update"
            );

            let ingestor = Ingestor::new(PubchemHttpSource::new()?);
            let summary = match output_mode {
                OutputMode::Json => ingestor.run(path.as_std_path(), &options, &JsonOutput),
                OutputMode::Human => ingestor.run(path.as_std_path(), &options, &LogProgress),
            }?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_update(&summary).into_diagnostic()?,
                OutputMode::Human => HumanOutput::print_update(&summary),
            }
        }
        DbCommand::Use(args) => {
            // Validates the file before recording it.
            MasterStore::open(args.db_file.as_std_path(), "db use")?;
            let mut config = ConfigLoader::load(config_path)?;
            config.master_db = Some(args.db_file.clone());
            save_config(config_path, &config)?;
            info!(master_db = %args.db_file, "master store selected");
        }
        DbCommand::Reset(args) => {
            let path = db_path(args.db_file);
            let _lock = WriterLock::acquire(path.as_std_path())?;
            let mut store = MasterStore::open(path.as_std_path(), "db reset")?;
            let removed = store.reset_processed(args.archive.as_deref())?;
            match output_mode {
                OutputMode::Json => {
                    JsonOutput::print_json(&serde_json::json!({ "reset": removed }))
                        .into_diagnostic()?
                }
                OutputMode::Human => println!("Reset {removed} processed archive marker(s)"),
            }
        }
        DbCommand::Stats(args) => {
            let path = db_path(args.db_file);
            let store = MasterStore::open(path.as_std_path(), "db stats")?;
            print_stats(&store, output_mode)?;
        }
        DbCommand::Query(args) => {
            let path = db_path(args.db_file);
            let store = MasterStore::open(path.as_std_path(), "db query")?;
            let predicates = args
                .predicates
                .iter()
                .map(|raw| parse_predicate(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let records = store.lookup_filtered(&predicates)?;
            let resolution = (!records.is_empty()).then(|| Resolution {
                records: records.iter().map(|record| record.to_properties()).collect(),
                source: SourceTag::Offline,
            });
            return report_resolution(resolution.as_ref(), &args.predicates.join(" "), output_mode);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_predicate(raw: &str) -> Result<(CompoundColumn, String), MolidError> {
    let (column, value) = raw
        .split_once('=')
        .ok_or_else(|| MolidError::InvalidQuery(format!("expected COLUMN=VALUE, got {raw}")))?;
    let column = column.parse::<CompoundColumn>()?;
    let value = match column {
        CompoundColumn::Formula => canonical_formula(value),
        _ => value.trim().to_string(),
    };
    Ok((column, value))
}

fn print_stats(store: &MasterStore, output_mode: OutputMode) -> miette::Result<()> {
    let stats = store.stats()?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_stats(&stats).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_stats(&stats),
    }
    Ok(())
}

fn run_config(
    command: ConfigCommand,
    config_path: Option<&str>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    if let ConfigCommand::Show = command {
        let resolved = ConfigLoader::resolve(config_path)?;
        return match output_mode {
            OutputMode::Json => JsonOutput::print_json(&resolved).into_diagnostic(),
            OutputMode::Human => {
                println!("config file:      {}", ConfigLoader::config_path(config_path));
                println!("mode:             {}", resolved.mode);
                println!("master_db:        {}", resolved.master_db);
                println!("cache_db:         {}", resolved.cache_db);
                println!("cache_enabled:    {}", resolved.cache_enabled);
                println!("download_folder:  {}", resolved.download_folder);
                println!("processed_folder: {}", resolved.processed_folder);
                Ok(())
            }
        };
    }

    let mut config = ConfigLoader::load(config_path)?;
    match command {
        ConfigCommand::Show => {}
        ConfigCommand::SetMaster { path } => config.master_db = Some(path),
        ConfigCommand::SetCache { path } => config.cache_db = Some(path),
        ConfigCommand::SetMode { mode } => config.mode = Some(mode),
        ConfigCommand::SetCacheEnabled { enabled } => config.cache_enabled = Some(enabled),
    }
    save_config(config_path, &config)
}

fn save_config(config_path: Option<&str>, config: &molid::config::Config) -> miette::Result<()> {
    let path = ConfigLoader::config_path(config_path);
    ConfigLoader::save(&path, config)?;
    info!(path = %path, "configuration saved");
    Ok(())
}
