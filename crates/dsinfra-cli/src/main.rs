mod cmd;
mod inputs;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dsinfra",
    about = "Compose per-dataset cloud infrastructure from one deployment document",
    version,
    propagate_version = true
)]
struct Cli {
    /// Deployment document (default: nearest deployment.yaml upward from cwd)
    #[arg(long, global = true, env = "DSINFRA_CONFIG")]
    config: Option<PathBuf>,

    /// Membership document (default: members.yaml beside the deployment)
    #[arg(long, global = true, env = "DSINFRA_MEMBERS")]
    members: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the deployment and membership documents
    Validate,

    /// Dry-run the whole deployment and show what would be provisioned
    Plan {
        /// Only show calls for this dataset
        #[arg(long)]
        dataset: Option<String>,
    },

    /// Show dataset build order and cross-dataset bindings
    Graph {
        /// Only show bindings on this cloud (gcp, azure)
        #[arg(long)]
        cloud: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = inputs::resolve_config(cli.config.as_deref());
    let members = inputs::resolve_members(cli.members.as_deref(), &config);

    let result = match cli.command {
        Commands::Validate => cmd::validate::run(&config, &members, cli.json),
        Commands::Plan { dataset } => {
            cmd::plan::run(&config, &members, dataset.as_deref(), cli.json)
        }
        Commands::Graph { cloud } => cmd::graph::run(&config, cloud.as_deref(), cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
