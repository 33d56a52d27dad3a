//! `flux workflow ...` subcommands

use clap::Subcommand;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{print_value, OutputFormat};

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Upload source and metadata to the catalog
    Register {
        /// Source file to upload
        file: std::path::PathBuf,

        /// Workflow name
        #[arg(long)]
        name: String,

        /// Pin an explicit version (defaults to latest + 1)
        #[arg(long)]
        version: Option<u32>,

        /// Required memory, in bytes
        #[arg(long)]
        memory_bytes: Option<u64>,

        /// Required CPU shares
        #[arg(long)]
        cpu_shares: Option<u32>,

        /// Require a GPU
        #[arg(long)]
        gpu: bool,

        /// Required package (repeatable)
        #[arg(long = "package")]
        packages: Vec<String>,

        /// Secret name to resolve at run time (repeatable)
        #[arg(long = "secret")]
        secrets: Vec<String>,
    },

    /// Submit an execution
    Run {
        /// Workflow name
        name: String,

        /// JSON input
        input: String,

        /// Response mode
        #[arg(long, default_value = "async", value_parser = ["sync", "async", "stream"])]
        mode: String,
    },

    /// Supply the payload to a paused execution
    Resume {
        name: String,
        execution_id: Uuid,

        /// JSON payload delivered as the pause call's return value
        input: String,

        #[arg(long, default_value = "async", value_parser = ["sync", "async", "stream"])]
        mode: String,
    },

    /// Request cancellation
    Cancel {
        name: String,
        execution_id: Uuid,
    },

    /// Query execution status and events
    Status {
        name: String,
        execution_id: Uuid,

        /// Include the full event log
        #[arg(long)]
        detailed: bool,
    },
}

fn parse_input(raw: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("malformed JSON input: {e}"))
}

pub async fn run(
    command: WorkflowCommand,
    client: &ApiClient,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        WorkflowCommand::Register {
            file,
            name,
            version,
            memory_bytes,
            cpu_shares,
            gpu,
            packages,
            secrets,
        } => {
            let source = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", file.display()))?;

            let metadata = serde_json::json!({
                "name": name,
                "version": version,
                "resource_request": {
                    "memory_bytes": memory_bytes.unwrap_or(0),
                    "cpu_shares": cpu_shares.unwrap_or(0),
                    "gpu": gpu,
                    "packages": packages,
                },
                "secret_requests": secrets,
            });

            let response = client.register_workflow(metadata, source).await?;
            print_value(format, &response)
        }

        WorkflowCommand::Run { name, input, mode } => {
            let input = parse_input(&input)?;
            if mode == "stream" {
                client
                    .stream_run(&format!("/workflows/{name}/run/stream"), &input)
                    .await
            } else {
                let response = client.run_workflow(&name, &mode, &input).await?;
                print_value(format, &response)
            }
        }

        WorkflowCommand::Resume {
            name,
            execution_id,
            input,
            mode,
        } => {
            let payload = parse_input(&input)?;
            if mode == "stream" {
                client
                    .stream_run(
                        &format!("/workflows/{name}/resume/{execution_id}/stream"),
                        &payload,
                    )
                    .await
            } else {
                let response = client
                    .resume_workflow(&name, execution_id, &mode, &payload)
                    .await?;
                print_value(format, &response)
            }
        }

        WorkflowCommand::Cancel { name, execution_id } => {
            client.cancel_workflow(&name, execution_id).await?;
            print_value(format, &serde_json::json!({ "cancelled": execution_id }))
        }

        WorkflowCommand::Status {
            name,
            execution_id,
            detailed,
        } => {
            let response = client.workflow_status(&name, execution_id, detailed).await?;
            print_value(format, &response)
        }
    }
}
