use crate::allowlist::AllowlistStore;
use crate::approval::ApprovalManager;
use crate::bus::TracingSink;
use crate::command::ExecRequest;
use crate::command::normalize::normalize_request;
use crate::config::{Config, load_config};
use crate::executor::ProcessExecutor;
use crate::policy::{Platform, Policy};
use crate::runner::Gatekeeper;
use crate::utils::{ensure_dir, get_execgate_home};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "execgate")]
#[command(about = "Command execution gatekeeper for remote agent runtimes")]
#[command(version)]
pub struct Cli {
    /// Path to the config file (defaults to $EXECGATE_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a command against policy without executing it
    Check {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// The argv to analyze
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Run a command through the full gatekeeper pipeline
    Run {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Manage allowlist entries
    Allowlist {
        #[command(subcommand)]
        cmd: AllowlistCommands,
    },
}

#[derive(Subcommand)]
enum AllowlistCommands {
    /// List entries
    List,
    /// Add an entry (pattern must be an absolute path)
    Add {
        #[arg(long)]
        agent: Option<String>,
        pattern: String,
    },
    /// Remove an entry
    Remove {
        #[arg(long)]
        agent: Option<String>,
        pattern: String,
    },
}

fn open_store(config: &Config) -> Result<AllowlistStore> {
    let path = match &config.allowlist_path {
        Some(path) => path.clone(),
        None => ensure_dir(get_execgate_home()?)?.join("allowlist.json"),
    };
    AllowlistStore::open(path).context("Failed to open allowlist store")
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check {
            agent,
            cwd,
            command,
        } => {
            let store = open_store(&config)?;
            let policy = Policy::resolve(&config, agent.as_deref());
            let request = ExecRequest {
                command,
                cwd,
                agent_id: agent,
                ..ExecRequest::default()
            };
            let normalized = normalize_request(&request)?;
            let cwd = request
                .cwd
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from("."));

            let (analysis, evaluation) = match &normalized.shell_command {
                Some(shell_command) => store.evaluate_shell(
                    shell_command,
                    request.agent_id.as_deref(),
                    &policy,
                    &cwd,
                    None,
                    Platform::current(),
                ),
                None => {
                    let mut analysis =
                        crate::command::AnalyzedCommand::single(normalized.argv.clone());
                    let ctx = crate::command::resolve::ResolveContext {
                        cwd: &cwd,
                        env: None,
                        safe_bins: &policy.safe_bins,
                        skill_bins: &policy.skill_bins,
                        auto_allow_skills: policy.auto_allow_skills,
                        platform: Platform::current(),
                    };
                    for segment in &mut analysis.segments {
                        if let Some(program) = segment.argv.first() {
                            segment.resolution =
                                Some(crate::command::resolve::resolve_program(program, &ctx));
                        }
                    }
                    let evaluation =
                        store.evaluate_exec(&analysis, request.agent_id.as_deref(), &policy, &cwd);
                    (analysis, evaluation)
                }
            };

            let report = serde_json::json!({
                "cmdText": normalized.cmd_text,
                "analysisOk": analysis.ok,
                "segments": analysis.segments.iter().map(|s| serde_json::json!({
                    "argv": s.argv,
                    "resolution": s.resolution,
                })).collect::<Vec<_>>(),
                "allowlistSatisfied": evaluation.satisfied,
                "matches": evaluation.matches.len(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run {
            agent,
            cwd,
            timeout_ms,
            command,
        } => {
            let ttl = config.runner.approval_ttl_ms;
            let store = Arc::new(open_store(&config)?);
            let gate = Gatekeeper::new(
                config,
                store,
                Arc::new(ApprovalManager::new(ttl)),
                Arc::new(ProcessExecutor),
                Arc::new(TracingSink),
            );
            let reply = gate
                .handle(ExecRequest {
                    command,
                    cwd,
                    timeout_ms,
                    agent_id: agent,
                    ..ExecRequest::default()
                })
                .await;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Allowlist { cmd } => {
            let store = open_store(&config)?;
            match cmd {
                AllowlistCommands::List => {
                    println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
                }
                AllowlistCommands::Add { agent, pattern } => {
                    let inserted = store.add_entry(agent.as_deref(), &pattern).await?;
                    if inserted {
                        println!("added {pattern}");
                    } else {
                        println!("already present: {pattern}");
                    }
                }
                AllowlistCommands::Remove { agent, pattern } => {
                    let removed = store.remove_entry(agent.as_deref(), &pattern).await?;
                    if removed {
                        println!("removed {pattern}");
                    } else {
                        println!("no such entry: {pattern}");
                    }
                }
            }
        }
    }

    Ok(())
}
