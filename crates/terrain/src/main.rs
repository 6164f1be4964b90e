use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use terrain_core::{Discovery, DiscoveryConfig, DiscoveryOutcome, FileConfig};
use terrain_git::GitWorktrees;
use terrain_hcl::HclParser;

mod output;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Dot,
}

#[derive(Parser)]
#[command(name = "terrain")]
#[command(about = "Discover and order infrastructure-as-code components")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DiscoverArgs {
    /// Root of the configuration tree
    #[arg(default_value = ".")]
    path: PathBuf,
    /// Filter query, e.g. `./apps/*|!name=legacy*` or `...vpc`
    #[arg(short, long)]
    filter: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Compact output (single-line JSON)
    #[arg(long)]
    compact: bool,
    /// Include hidden directories in the walk
    #[arg(long)]
    hidden: bool,
    /// Follow symlinks during the walk
    #[arg(long)]
    follow_symlinks: bool,
    /// Worker threads per phase (default: CPU count clamped to 4..=8)
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Log and drop components that fail to parse instead of reporting
    #[arg(long)]
    suppress_parse_errors: bool,
    /// Read exclude blocks and drop excluded units
    #[arg(long)]
    exclude_blocks: bool,
    /// Target command recorded in discovery contexts (consulted by git
    /// filters and exclude blocks)
    #[arg(long, default_value = "")]
    command: String,
    /// Extra argument forwarded into discovery contexts (repeatable)
    #[arg(long = "arg")]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover components and print a flat listing
    Find {
        #[command(flatten)]
        discover: DiscoverArgs,
        /// Show dependency edges under each component
        #[arg(long)]
        dependencies: bool,
    },
    /// Discover components with full dependency relationships
    Dag {
        #[command(flatten)]
        discover: DiscoverArgs,
        /// Remove cycle edges instead of reporting an error
        #[arg(long)]
        break_cycles: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Find {
            discover,
            dependencies,
        } => cmd_find(&discover, dependencies),
        Commands::Dag {
            discover,
            break_cycles,
        } => cmd_dag(&discover, break_cycles),
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

fn validate_path(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("path '{}' does not exist", path.display());
    }
    if !path.is_dir() {
        anyhow::bail!("path '{}' is not a directory", path.display());
    }
    Ok(())
}

fn build_config(args: &DiscoverArgs, build_relationships: bool, break_cycles: bool) -> Result<DiscoveryConfig> {
    validate_path(&args.path)?;
    let file = FileConfig::load_or_default(&args.path);
    let mut cfg = DiscoveryConfig::new(&args.path)
        .with_file_config(&file)
        .with_command(&args.command, args.args.clone());
    if let Some(query) = &args.filter {
        cfg = cfg.with_query(query).context("invalid filter query")?;
    }
    if let Some(jobs) = args.jobs {
        cfg = cfg.with_workers(jobs);
    }
    cfg.include_hidden |= args.hidden;
    cfg.follow_symlinks |= args.follow_symlinks;
    cfg.suppress_parse_errors |= args.suppress_parse_errors;
    cfg.read_exclude_blocks = args.exclude_blocks;
    cfg.build_relationships = build_relationships;
    cfg.break_cycles |= break_cycles;
    Ok(cfg)
}

/// Run discovery; returns the outcome and whether it was error-free.
fn discover(cfg: DiscoveryConfig) -> Result<(DiscoveryOutcome, bool)> {
    let has_git_filter = cfg
        .filters
        .iter()
        .any(|f| matches!(f.unwrap_negation().0, terrain_core::FilterExpr::Git(_)));
    let working_dir = cfg.working_dir.clone();

    let mut discovery = Discovery::new(cfg, Arc::new(HclParser::new()));
    let adapter = if has_git_filter {
        let adapter = Arc::new(
            GitWorktrees::new(&working_dir).context("git filter requires a repository")?,
        );
        discovery = discovery.with_provider(adapter.clone());
        Some(adapter)
    } else {
        None
    };

    let outcome = discovery.run()?;
    if let Some(adapter) = adapter {
        use terrain_core::WorktreeProvider as _;
        // Rendering only reads component snapshots, so the worktree
        // directories can go as soon as discovery returns.
        adapter
            .cleanup()
            .context("failed to clean up worktrees")?;
    }

    let clean = outcome.errors.is_empty();
    for err in &outcome.errors {
        eprintln!("warning: {err}");
    }
    Ok((outcome, clean))
}

fn cmd_find(args: &DiscoverArgs, dependencies: bool) -> Result<bool> {
    let cfg = build_config(args, dependencies, false)?;
    let (outcome, clean) = discover(cfg)?;

    let rendered = match args.format {
        OutputFormat::Text => output::format_list(&outcome, dependencies),
        OutputFormat::Json => output::format_json(&outcome, args.compact),
        OutputFormat::Dot => output::format_dot(&outcome),
    };
    print!("{rendered}");
    Ok(clean)
}

fn cmd_dag(args: &DiscoverArgs, break_cycles: bool) -> Result<bool> {
    let cfg = build_config(args, true, break_cycles)?;
    let (outcome, clean) = discover(cfg)?;

    let rendered = match args.format {
        OutputFormat::Text => output::format_levels(&outcome),
        OutputFormat::Json => output::format_json(&outcome, args.compact),
        OutputFormat::Dot => output::format_dot(&outcome),
    };
    print!("{rendered}");
    Ok(clean)
}
