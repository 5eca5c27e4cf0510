mod agent;
mod client;
mod config;
mod pods;

use anyhow::Result;
use clap::{Parser, Subcommand};

use client::{ConnectArgs, LsArgs, TailArgs};
use config::{AgentConfig, AgentOverrides};
use pods::PodsArgs;

/// Kubetail - real-time container log streaming for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kubetail")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    connect: ConnectArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node agent
    Agent(AgentOverrides),

    /// List container log files
    Ls(LsArgs),

    /// Print a pod's container logs
    Tail(TailArgs),

    /// Watch pods through a live list+watch
    Pods(PodsArgs),

    /// List kubeconfig contexts
    Contexts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level(&args.command).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn default_level(command: &Command) -> tracing::Level {
    match command {
        Command::Agent(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Agent(overrides) => agent::run(AgentConfig::load(&overrides)?).await,
        Command::Ls(ls) => client::ls(&args.connect, ls).await,
        Command::Tail(tail) => client::tail(&args.connect, tail).await,
        Command::Pods(pods) => pods::pods(&args.connect, pods).await,
        Command::Contexts => pods::contexts(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_tail() {
        let args = Args::parse_from([
            "kubetail",
            "tail",
            "web-0",
            "-n",
            "prod",
            "--grep",
            "error",
            "--since",
            "2024-01-15T10:30:00Z",
            "--agent",
            "node-1=127.0.0.1:50051",
        ]);

        assert_eq!(args.connect.agents.len(), 1);
        match args.command {
            Command::Tail(tail) => {
                assert_eq!(tail.pod, "web-0");
                assert_eq!(tail.namespace, "prod");
                assert_eq!(tail.grep.as_deref(), Some("error"));
                assert!(tail.since.is_some());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_follow_conflicts_with_reverse() {
        assert!(Args::try_parse_from(["kubetail", "tail", "web-0", "-f", "-r"]).is_err());
    }

    #[test]
    fn test_agent_flags() {
        let args = Args::parse_from([
            "kubetail",
            "agent",
            "--node-name",
            "worker-1",
            "--logs-dir",
            "/tmp/logs",
        ]);
        match args.command {
            Command::Agent(overrides) => {
                let config = AgentConfig::load(&overrides).unwrap();
                assert_eq!(config.node_name().unwrap(), "worker-1");
                assert_eq!(config.logs_dir, std::path::PathBuf::from("/tmp/logs"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
