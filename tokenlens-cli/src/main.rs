// Copyright 2025 Tokenlens (https://github.com/sochdb/tokenlens)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tokenlens CLI
//!
//! Command-line front end for the budget engine: fetch a conversation,
//! run one accounting pass, manage selections, or keep watching.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokenlens_core::BudgetBreakdown;
use tokenlens_engine::{
    BudgetEngine, EngineConfig, PageProbe, PageState, SchedulerConfig, StateStore, TriggerReason,
};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "tokenlens")]
#[command(about = "Tokenlens - context window accounting for chat conversations", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host application origin, overrides the configuration file
    #[arg(long)]
    base_url: Option<String>,

    /// Persisted state file
    #[arg(long, default_value = "./tokenlens-state.json")]
    state_path: PathBuf,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a conversation and print its budget breakdown
    Report {
        /// Conversation ID
        conversation_id: String,

        /// In-progress prompt text to account for
        #[arg(long, default_value = "")]
        prompt: String,

        /// Context window override in tokens, persisted
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Invalidate the cached tree, then report fresh
    Refresh {
        /// Conversation ID
        conversation_id: String,
    },

    /// Check or uncheck an attachment/canvas for inclusion
    Check {
        /// Conversation ID
        conversation_id: String,

        /// Attachment id or textdoc id
        item_id: String,

        /// Uncheck instead of check
        #[arg(long)]
        off: bool,
    },

    /// Toggle the memory contribution for a conversation
    Memory {
        /// Conversation ID
        conversation_id: String,

        /// Disable instead of enable
        #[arg(long)]
        off: bool,
    },

    /// Set the persisted context-window limit
    Limit {
        /// Limit in tokens
        tokens: usize,
    },

    /// Set the persisted global system prompt
    SystemPrompt {
        /// Prompt text, empty to clear
        text: String,
    },

    /// Keep recomputing and print every published breakdown
    Watch {
        /// Conversation ID
        conversation_id: String,

        /// Seconds between recompute triggers
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
}

/// Fixed page snapshot for a headless run.
struct FixedProbe {
    state: PageState,
}

impl FixedProbe {
    fn new(conversation_id: &str) -> Arc<Self> {
        Arc::new(Self {
            state: PageState {
                conversation_id: Some(conversation_id.to_string()),
                prompt_text: String::new(),
                turn_count: 0,
            },
        })
    }
}

impl PageProbe for FixedProbe {
    fn snapshot(&self) -> PageState {
        self.state.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }

    let store = Arc::new(StateStore::load(&cli.state_path));
    let engine = Arc::new(BudgetEngine::new(&config, store.clone()));

    match cli.command {
        Commands::Report {
            conversation_id,
            prompt,
            limit,
        } => {
            if let Some(limit) = limit {
                store.update_settings(|s| s.token_limit = limit);
            }
            report(&engine, &conversation_id, &prompt, cli.json).await?;
        }

        Commands::Refresh { conversation_id } => {
            engine.invalidate(&conversation_id);
            report(&engine, &conversation_id, "", cli.json).await?;
        }

        Commands::Check {
            conversation_id,
            item_id,
            off,
        } => {
            store.set_checked(&conversation_id, &item_id, !off);
            let checked = store.checked_items_sorted(&conversation_id);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&checked)?);
            } else {
                info!(
                    "{} items checked for {}: {}",
                    checked.len(),
                    conversation_id,
                    checked.join(", ")
                );
            }
        }

        Commands::Memory {
            conversation_id,
            off,
        } => {
            store.set_memory_enabled(&conversation_id, !off);
            info!(
                "memory {} for {}",
                if off { "disabled" } else { "enabled" },
                conversation_id
            );
        }

        Commands::Limit { tokens } => {
            store.update_settings(|s| s.token_limit = tokens);
            info!("context window set to {} tokens", tokens);
        }

        Commands::SystemPrompt { text } => {
            store.update_settings(|s| s.global_system_prompt = text);
            info!("global system prompt updated");
        }

        Commands::Watch {
            conversation_id,
            interval_secs,
        } => {
            watch(engine, store, &conversation_id, interval_secs, cli.json).await;
        }
    }

    Ok(())
}

async fn report(
    engine: &Arc<BudgetEngine>,
    conversation_id: &str,
    prompt: &str,
    json: bool,
) -> Result<()> {
    let page = PageState {
        conversation_id: Some(conversation_id.to_string()),
        prompt_text: prompt.to_string(),
        turn_count: 0,
    };
    match engine.compute(&page).await? {
        Some(breakdown) => print_breakdown(&breakdown, json)?,
        None => info!("nothing to report (scripting disabled)"),
    }
    Ok(())
}

async fn watch(
    engine: Arc<BudgetEngine>,
    store: Arc<StateStore>,
    conversation_id: &str,
    interval_secs: u64,
    json: bool,
) {
    let probe = FixedProbe::new(conversation_id);
    let handle = tokenlens_engine::spawn(
        SchedulerConfig {
            debounce: Duration::from_millis(500),
            ..SchedulerConfig::default()
        },
        probe,
        engine,
        store,
    );
    let mut output = handle.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    info!("watching {} (ctrl-c to stop)", conversation_id);
    loop {
        tokio::select! {
            _ = ticker.tick() => handle.on_trigger(TriggerReason::Manual),
            changed = output.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = output.borrow_and_update().clone();
                if let Some(breakdown) = latest {
                    if let Err(error) = print_breakdown(&breakdown, json) {
                        tracing::warn!(%error, "failed to print breakdown");
                    }
                }
            }
        }
    }
}

fn print_breakdown(breakdown: &BudgetBreakdown, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(breakdown)?);
        return Ok(());
    }

    println!("Context window: {} tokens", breakdown.limit);
    print_stage("system prompt", breakdown.system_prompt.cost, breakdown.system_prompt.truncated_from);
    print_stage("memory", breakdown.memory.cost, breakdown.memory.truncated_from);
    print_stage("instructions", breakdown.instructions.cost, breakdown.instructions.truncated_from);
    print_stage("tool output", breakdown.tool_output.cost, breakdown.tool_output.truncated_from);
    print_stage("draft prompt", breakdown.user_prompt.cost, breakdown.user_prompt.truncated_from);
    for item in &breakdown.items {
        print_stage(&item.label, item.cost.cost, item.cost.truncated_from);
    }

    let truncated_oldest = breakdown
        .effective_messages
        .first()
        .map(|m| m.is_truncated)
        .unwrap_or(false);
    println!(
        "  {:<20} {:>8}  ({} messages{})",
        "chat history",
        breakdown.total_chat_tokens,
        breakdown.effective_messages.len(),
        if truncated_oldest { ", oldest truncated" } else { "" }
    );
    println!(
        "  {:<20} {:>8}  of {} possible",
        "total",
        breakdown.grand_total(),
        breakdown.max_possible_tokens
    );
    Ok(())
}

fn print_stage(label: &str, cost: usize, truncated_from: Option<usize>) {
    match truncated_from {
        Some(full) => println!("  {label:<20} {cost:>8}  (truncated from {full})"),
        None => println!("  {label:<20} {cost:>8}"),
    }
}
