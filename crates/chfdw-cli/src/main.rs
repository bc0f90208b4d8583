use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "chfdw",
    about = "chfdw: query a remote analytical engine through the connection cache",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one SQL statement on a foreign server.
    ///
    /// The connection is acquired through the cache for the given user's
    /// mapping on the server, inside a single host transaction.
    Query {
        /// Path to chfdw.toml
        #[arg(short, long, default_value = "chfdw.toml")]
        config: PathBuf,
        /// Foreign server name
        #[arg(short, long)]
        server: String,
        /// Local user whose user mapping supplies the credentials
        #[arg(short, long)]
        user: String,
        /// Use the read-write connection instead of the read connection
        #[arg(long)]
        write: bool,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// SQL text sent to the remote engine
        sql: String,
    },
    /// Resolve every user mapping's connection options and print them
    Check {
        /// Path to chfdw.toml
        #[arg(short, long, default_value = "chfdw.toml")]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info,chfdw=debug";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Query {
            config,
            server,
            user,
            write,
            format,
            sql,
        } => commands::query::run(&config, &server, &user, write, &format, &sql),
        Commands::Check { config, format } => commands::check::run(&config, &format),
    }
}
