//! Lifeguard Partitioner CLI Tool
//!
//! Runs the one-time conversion of a table into the first partition of a
//! list-partitioned parent, and reports the partitions of a sliding-window table.
//! Periodic partition maintenance needs policy predicates, so it is a library call
//! ([`lifeguard_partitioning::PartitionManager`]) rather than a command.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use lifeguard_partitioning::connection::redact_connection_string;
use lifeguard_partitioning::{
    connect_executor, AppLogger, PartitionConverter, PartitionError, PartitioningConfig,
    PartitioningPolicy, PgSchemaOperations, SchemaOperations, SlidingListPolicy, TableModel,
};
use std::process;

#[derive(Parser)]
#[command(name = "lifeguard-partitioner")]
#[command(about = "List partitioning tool for Lifeguard")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database connection URL (overrides config and environment)
    #[arg(long)]
    database_url: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies the table being converted
#[derive(Args)]
struct ConversionArgs {
    /// Table to convert
    #[arg(long)]
    table: String,

    /// Name of the partitioned parent (default: <table>_partitioned)
    #[arg(long)]
    parent: Option<String>,

    /// Column the parent is partitioned by
    #[arg(long)]
    column: String,

    /// Value every existing row has in the partitioning column
    #[arg(long, default_value = "0")]
    value: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate constraints and add the anchoring check constraint
    Prepare(ConversionArgs),

    /// Drop the anchoring check constraint
    RevertPrepare(ConversionArgs),

    /// Attach the table to a new list-partitioned parent
    Partition(ConversionArgs),

    /// Detach the table and drop the parent
    RevertPartition(ConversionArgs),

    /// Show partitions, the active partition and the partitioning key's default
    Partitions {
        /// Partitioned table
        #[arg(long)]
        table: String,

        /// Partitioning key column
        #[arg(long)]
        column: String,
    },
}

fn main() {
    let cli = Cli::parse();

    dotenv::dotenv().ok();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(&cli) {
        Ok(()) => {
            if !cli.quiet {
                println!("{}", "✅ Success".green());
            }
        }
        Err(e) => {
            eprintln!("{} {:#}", "❌ Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = PartitioningConfig::load().context("Failed to load partitioning config")?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }

    log::info!("connecting to {}", redact_connection_string(&config.database_url));
    let executor = connect_executor(&config.database_url).context("Error connecting to database")?;
    let schema = PgSchemaOperations::new(executor, config.lock_retries.clone());

    match &cli.command {
        Commands::Prepare(args) => {
            converter(&schema, args).prepare_for_partitioning()?;
            println!("Prepared {} for partitioning on {} = {}", args.table.bold(), args.column, args.value);
        }
        Commands::RevertPrepare(args) => {
            converter(&schema, args).revert_preparation_for_partitioning()?;
            println!("Removed partitioning constraint from {}", args.table.bold());
        }
        Commands::Partition(args) => {
            let converter = converter(&schema, args);
            converter.partition()?;
            println!(
                "{} is now partition {} of {}",
                args.table.bold(),
                args.value,
                converter.parent_table_name().bold()
            );
        }
        Commands::RevertPartition(args) => {
            let converter = converter(&schema, args);
            converter.revert_partitioning()?;
            println!(
                "Detached {} and dropped {}",
                args.table.bold(),
                converter.parent_table_name().bold()
            );
        }
        Commands::Partitions { table, column } => show_partitions(&schema, &config, table, column)?,
    }

    Ok(())
}

fn converter<'a>(schema: &'a dyn SchemaOperations, args: &ConversionArgs) -> PartitionConverter<'a> {
    let parent = args
        .parent
        .clone()
        .unwrap_or_else(|| format!("{}_partitioned", args.table));
    PartitionConverter::new(schema, args.table.clone(), parent, args.column.clone(), args.value)
}

fn show_partitions(
    schema: &dyn SchemaOperations,
    config: &PartitioningConfig,
    table: &str,
    column: &str,
) -> Result<()> {
    if !schema.table_exists(table)? {
        anyhow::bail!("Table {table} does not exist");
    }

    // Read-only: predicates never fire
    let model = TableModel::new(table, table).readonly_column(column);
    let policy = PartitioningPolicy::new(column, |_| false, |_| false);
    let logger = AppLogger;
    let sliding = SlidingListPolicy::new(schema, &logger, model, policy)?
        .with_partition_schema(config.partition_schema.clone());

    let partitions = sliding.current_partitions()?;
    println!("\n📊 Partitions of {}\n", table.bold());
    if partitions.is_empty() {
        println!("  None");
    }
    for partition in &partitions {
        println!("  {} = {}", partition.qualified_name(), partition.value);
    }

    println!();
    match partitions.last() {
        Some(active) => println!("Active partition: {}", active.partition_name.green()),
        None => println!("Active partition: {}", "none".yellow()),
    }

    match (sliding.current_default_value(), partitions.last()) {
        (Ok(default), Some(active)) if default == active.value => {
            println!("Default {column}: {}", default.to_string().green());
        }
        (Ok(default), Some(active)) => {
            println!("Default {column}: {} (expected {})", default.to_string().red(), active.value);
        }
        (Ok(default), None) => println!("Default {column}: {default}"),
        (Err(PartitionError::MissingDefaultValue { .. }), _) => {
            println!("Default {column}: {}", "not set".yellow());
        }
        (Err(e), _) => return Err(e.into()),
    }

    Ok(())
}
