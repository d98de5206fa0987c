//! trellisctl - CLI client for the trellisd state manager.

mod client;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client::Client;
use mimalloc::MiMalloc;
use serde_json::Value;
use trellis_core::Encrypter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// CLI client for the trellisd workflow state manager.
#[derive(Parser)]
#[command(name = "trellisctl")]
#[command(about = "Control plane client for the trellisd state manager")]
#[command(version)]
struct Cli {
    /// Daemon address
    #[arg(long, global = true, env = "TRELLIS_ADDR", default_value = "http://127.0.0.1:7900")]
    addr: String,

    /// API key for the daemon
    #[arg(long, global = true, env = "STATE_MANAGER_SECRET")]
    api_key: Option<String>,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check daemon health
    Health,

    /// Generate a secrets encryption key for the daemon
    Keygen,

    /// Manage graph templates
    Graph {
        #[command(subcommand)]
        command: GraphCommand,
    },

    /// Register a node (runtime handshake)
    Register {
        /// Namespace to register under
        namespace: String,
        /// Path to the node definition (JSON)
        file: PathBuf,
    },

    /// Trigger a graph run
    Trigger {
        namespace: String,
        graph: String,
        /// Path to the trigger body (JSON: {"states": [...], "store": {...}})
        file: PathBuf,
    },

    /// Create states under an existing run id
    CreateStates {
        namespace: String,
        graph: String,
        /// Path to the request body (JSON: {"run_id": ..., "states": [...]})
        file: PathBuf,
    },

    /// Lease ready states for a node
    Lease {
        namespace: String,
        node_name: String,
        /// Maximum states to lease
        #[arg(long, default_value_t = 1)]
        batch_size: u32,
    },

    /// Commit outputs for a leased state
    Executed {
        namespace: String,
        state_id: String,
        /// Path to the outputs body (JSON: {"outputs": [...]})
        file: PathBuf,
    },

    /// Commit an error for a leased state
    Errored {
        namespace: String,
        state_id: String,
        /// Error message
        message: String,
    },
}

#[derive(Subcommand)]
enum GraphCommand {
    /// Upsert a graph template from a JSON file
    Put {
        namespace: String,
        name: String,
        file: PathBuf,
    },
    /// Fetch a graph template with its validation verdict
    Get { namespace: String, name: String },
    /// List graph templates in a namespace
    List { namespace: String },
}

fn read_json(path: &PathBuf) -> Result<Value, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("invalid JSON in {}: {e}", path.display()))
}

fn emit(json_mode: bool, value: &Value, render: impl FnOnce(&Value)) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    } else {
        render(value);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    if let Command::Keygen = cli.command {
        println!("{}", Encrypter::generate_key());
        return Ok(());
    }

    let client = Client::new(&cli.addr, cli.api_key.as_deref()).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Keygen => unreachable!("handled above"),
        Command::Health => {
            let response = client.health().await.map_err(|e| e.to_string())?;
            emit(cli.json, &response, |v| {
                println!("daemon is {}", v["status"].as_str().unwrap_or("?"));
            });
        }
        Command::Graph { command } => match command {
            GraphCommand::Put {
                namespace,
                name,
                file,
            } => {
                let body = read_json(&file)?;
                let response = client
                    .put_graph(&namespace, &name, &body)
                    .await
                    .map_err(|e| e.to_string())?;
                emit(cli.json, &response, render::print_graph);
            }
            GraphCommand::Get { namespace, name } => {
                let response = client
                    .get_graph(&namespace, &name)
                    .await
                    .map_err(|e| e.to_string())?;
                emit(cli.json, &response, render::print_graph);
            }
            GraphCommand::List { namespace } => {
                let response = client
                    .list_graphs(&namespace)
                    .await
                    .map_err(|e| e.to_string())?;
                emit(cli.json, &response, |v| {
                    render::print_graph_list(v["graphs"].as_array().map_or(&[][..], Vec::as_slice));
                });
            }
        },
        Command::Register { namespace, file } => {
            let body = read_json(&file)?;
            let response = client
                .register_node(&namespace, &body)
                .await
                .map_err(|e| e.to_string())?;
            emit(cli.json, &response, |v| {
                println!(
                    "registered {}/{}",
                    v["namespace"].as_str().unwrap_or("?"),
                    v["name"].as_str().unwrap_or("?")
                );
            });
        }
        Command::Trigger {
            namespace,
            graph,
            file,
        } => {
            let body = read_json(&file)?;
            let response = client
                .trigger(&namespace, &graph, &body)
                .await
                .map_err(|e| e.to_string())?;
            emit(cli.json, &response, render::print_created_states);
        }
        Command::CreateStates {
            namespace,
            graph,
            file,
        } => {
            let body = read_json(&file)?;
            let response = client
                .create_states(&namespace, &graph, &body)
                .await
                .map_err(|e| e.to_string())?;
            emit(cli.json, &response, render::print_created_states);
        }
        Command::Lease {
            namespace,
            node_name,
            batch_size,
        } => {
            let response = client
                .lease(&namespace, &node_name, batch_size)
                .await
                .map_err(|e| e.to_string())?;
            emit(cli.json, &response, render::print_leased);
        }
        Command::Executed {
            namespace,
            state_id,
            file,
        } => {
            let body = read_json(&file)?;
            let response = client
                .executed(&namespace, &state_id, &body)
                .await
                .map_err(|e| e.to_string())?;
            emit(cli.json, &response, |v| {
                println!("state {} -> {}", state_id, v["status"].as_str().unwrap_or("?"));
            });
        }
        Command::Errored {
            namespace,
            state_id,
            message,
        } => {
            let response = client
                .errored(&namespace, &state_id, &message)
                .await
                .map_err(|e| e.to_string())?;
            emit(cli.json, &response, |v| {
                println!("state {} -> {}", state_id, v["status"].as_str().unwrap_or("?"));
            });
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(message) = run(cli).await {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}
