use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use labflow::config::Config;
use labflow::ingress::{state_json, Dispatcher};
use labflow::{flog, Error, Orchestrator, Payload, Result};

/// labflow - task orchestration for lab robots
#[derive(Parser, Debug)]
#[command(name = "labflow")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    LABFLOW_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.labflow/labflow.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.labflow/labflow.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Back every configured agent with a simulated controller
    #[arg(long, global = true)]
    pub mock: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Read JSON commands from stdin, one per line, and print one reply per line
    Serve {
        /// Let live tasks finish after stdin closes instead of cancelling them
        #[arg(long)]
        drain: bool,
    },

    /// Run one workflow to completion and print its final state
    Run {
        /// Workflow name (see `labflow workflows`)
        workflow: String,

        /// Agent that executes the workflow
        #[arg(short, long)]
        agent: String,

        /// Workflow parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// List the built-in workflows
    Workflows,

    /// Print the effective configuration as TOML
    Config,
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {}", s))
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) if !path.exists() => Err(Error::Validation(format!(
            "config file not found: {}",
            path.display()
        ))),
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    labflow::log::init(cli.debug || config.debug, config.log_to_stderr);

    match cli.command {
        Command::Serve { drain } => serve(build_orchestrator(config, cli.mock)?, drain).await,
        Command::Run {
            workflow,
            agent,
            params,
        } => run_workflow(build_orchestrator(config, cli.mock)?, &workflow, &agent, params).await,
        Command::Workflows => {
            for info in labflow::workflow::WORKFLOWS {
                let required = if info.required_params.is_empty() {
                    String::new()
                } else {
                    format!(" (requires: {})", info.required_params.join(", "))
                };
                println!("{:<14} {}{}", info.name, info.description, required);
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

/// The binary ships no controller transport; a real one plugs in by
/// building the orchestrator with its own `ActuatorClient`s.
fn build_orchestrator(config: Config, mock: bool) -> Result<Orchestrator> {
    if !mock {
        return Err(Error::Validation(
            "no controller transport is built in; pass --mock to use simulated controllers"
                .to_string(),
        ));
    }
    Orchestrator::with_mocks(config)
}

/// Line-oriented command loop over stdin/stdout.
async fn serve(orchestrator: Orchestrator, drain: bool) -> Result<()> {
    let orchestrator = Arc::new(orchestrator);
    let dispatcher = Dispatcher::new(Arc::clone(&orchestrator));
    flog!("main", "serving commands on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatcher.handle_line(&line);
        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    if drain {
        for state in orchestrator.tasks() {
            if !state.is_terminal() {
                flog!("main", "draining task {} on {}", state.task_id, state.agent_id);
                orchestrator.wait_for_task(&state.agent_id).await?;
            }
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}

async fn run_workflow(
    orchestrator: Orchestrator,
    workflow: &str,
    agent: &str,
    params: Vec<(String, String)>,
) -> Result<()> {
    let params: Payload = params
        .into_iter()
        .map(|(k, v)| {
            let value = v.parse::<u64>().map(Value::from).unwrap_or(Value::String(v));
            (k, value)
        })
        .collect();

    orchestrator.start_workflow(agent, workflow, &params, None)?;
    let state = orchestrator.wait_for_task(agent).await?;
    println!("{}", serde_json::to_string_pretty(&state_json(&state)?)?);
    orchestrator.shutdown().await;
    Ok(())
}
