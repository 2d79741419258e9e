mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gradebox_common::config::SandboxKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gradebox")]
#[command(about = "gradebox - Grade submissions against test cases in a sandbox", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a submission and print the report as JSON
    Grade {
        /// Submission JSON (language, sourceText, testCases, ...)
        submission: PathBuf,

        /// Read the source text from this file instead of the submission
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Sandbox backend (overrides GRADEBOX_SANDBOX)
        #[arg(long)]
        sandbox: Option<SandboxKind>,

        /// Per-case wall-clock limit in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Memory limit in MB for every language
        #[arg(short, long)]
        memory_mb: Option<u64>,

        /// Language configuration file
        #[arg(short, long)]
        languages: Option<PathBuf>,

        /// Pretty-print the report
        #[arg(long, default_value = "false")]
        pretty: bool,
    },

    /// List configured languages
    Languages {
        /// Language configuration file
        #[arg(short, long)]
        languages: Option<PathBuf>,
    },

    /// Print the driver generated for a language and entry point
    Driver {
        /// Language name (python, javascript, cpp, java)
        #[arg(short, long)]
        language: String,

        /// Entry point name
        #[arg(short, long, default_value = "twoSum")]
        entry: String,

        /// Comma-separated parameter types (int, int[])
        #[arg(short, long, default_value = "int[],int")]
        params: String,

        /// Return type
        #[arg(short, long, default_value = "int[]")]
        returns: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Grade {
            submission,
            source,
            sandbox,
            timeout_ms,
            memory_mb,
            languages,
            pretty,
        } => {
            let overrides = commands::GradeOverrides {
                sandbox,
                timeout_ms,
                memory_mb,
            };
            commands::grade(
                &submission,
                source.as_deref(),
                languages.as_deref(),
                overrides,
                pretty,
            )
            .await?;
        }
        Commands::Languages { languages } => {
            commands::list_languages(languages.as_deref())?;
        }
        Commands::Driver {
            language,
            entry,
            params,
            returns,
        } => {
            commands::print_driver(&language, &entry, &params, &returns)?;
        }
    }

    Ok(())
}
