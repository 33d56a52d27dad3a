//! `flux secrets ...` pass-through

use clap::Subcommand;

use crate::client::ApiClient;
use crate::output::{print_value, OutputFormat};

#[derive(Subcommand)]
pub enum SecretsCommand {
    /// Store a secret
    Set { name: String, value: String },

    /// Read a secret
    Get { name: String },

    /// List secret names
    List,

    /// Delete a secret
    Remove { name: String },

    /// Replace a secret's value (generated when omitted)
    Rotate {
        name: String,

        #[arg(long)]
        value: Option<String>,
    },
}

pub async fn run(
    command: SecretsCommand,
    client: &ApiClient,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        SecretsCommand::Set { name, value } => {
            client.secret_set(&name, &value).await?;
            print_value(format, &serde_json::json!({ "stored": name }))
        }
        SecretsCommand::Get { name } => {
            let response = client.secret_get(&name).await?;
            print_value(format, &response)
        }
        SecretsCommand::List => {
            let response = client.secret_list().await?;
            print_value(format, &response)
        }
        SecretsCommand::Remove { name } => {
            client.secret_remove(&name).await?;
            print_value(format, &serde_json::json!({ "removed": name }))
        }
        SecretsCommand::Rotate { name, value } => {
            let response = client.secret_rotate(&name, value.as_deref()).await?;
            print_value(format, &response)
        }
    }
}
