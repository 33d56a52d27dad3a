// Flux CLI
//
// Design Decision: clap derive for argument parsing, matching the rest of
// the workspace's builder-style config.
// Design Decision: exit codes reflect submission status only. 0 on
// success, nonzero for submission failure, malformed input, or an
// unreachable server.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flux")]
#[command(about = "Flux - durable workflow orchestration")]
#[command(version)]
pub struct Cli {
    /// Orchestrator base URL
    #[arg(long, env = "FLUX_SERVER_URL", default_value = "http://localhost:9400")]
    pub server_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a server or worker process
    Start {
        #[command(subcommand)]
        command: commands::start::StartCommand,
    },

    /// Register, run, and inspect workflows
    Workflow {
        #[command(subcommand)]
        command: commands::workflow::WorkflowCommand,
    },

    /// Manage secrets
    Secrets {
        #[command(subcommand)]
        command: commands::secrets::SecretsCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let client = client::ApiClient::new(&cli.server_url);
    let format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Start { command } => commands::start::run(command).await,
        Commands::Workflow { command } => commands::workflow::run(command, &client, format).await,
        Commands::Secrets { command } => commands::secrets::run(command, &client, format).await,
    }
}
