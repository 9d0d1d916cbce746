//! Reckon CLI - Receipt reconciliation and transaction enrichment
//!
//! Usage:
//!   reckon init                                  Initialize database
//!   reckon sync --transactions bank.json         Sync, apply rules and match
//!   reckon enrich estimate                       Preview LLM cost
//!   reckon enrich run --yes                      Run enrichment after the estimate
//!   reckon resolve 42                            Effective categorization

mod cli;
mod commands;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db, cli.no_encrypt),
        Commands::Status => commands::cmd_status(&cli.db, cli.no_encrypt),
        Commands::Sync {
            transactions,
            receipts,
            from,
            to,
            days,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let window = commands::resolve_window(from.as_deref(), to.as_deref(), days)?;
            commands::cmd_sync(&db, &config, &transactions, receipts.as_deref(), window).await
        }
        Commands::Match => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_match(&db, &config)
        }
        Commands::Matches { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None => commands::cmd_matches_list(&db, &config, false, None),
                Some(MatchesAction::List {
                    review,
                    transaction,
                }) => commands::cmd_matches_list(&db, &config, review, transaction),
                Some(MatchesAction::Preview { receipt_id }) => {
                    commands::cmd_matches_preview(&db, &config, receipt_id)
                }
                Some(MatchesAction::Confirm { id }) => {
                    commands::cmd_matches_confirm(&db, &config, id)
                }
                Some(MatchesAction::Reject { id }) => commands::cmd_matches_reject(&db, id),
                Some(MatchesAction::Split {
                    receipt_id,
                    transactions,
                }) => commands::cmd_matches_split(&db, &config, receipt_id, &transactions),
                Some(MatchesAction::Bundle {
                    transaction_id,
                    receipts,
                }) => commands::cmd_matches_bundle(&db, &config, transaction_id, &receipts),
                Some(MatchesAction::Primary {
                    transaction_id,
                    external_id,
                }) => commands::cmd_matches_primary(&db, transaction_id, external_id),
            }
        }
        Commands::Enrich { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                EnrichAction::Estimate { ids, force_refresh } => {
                    let orchestrator = commands::orchestrator(&db, &config)?;
                    commands::cmd_enrich_estimate(&orchestrator, ids.as_deref(), force_refresh)
                }
                EnrichAction::Run {
                    ids,
                    force_refresh,
                    yes,
                } => {
                    let orchestrator = commands::orchestrator(&db, &config)?;
                    commands::cmd_enrich_run(&orchestrator, ids.as_deref(), force_refresh, yes)
                        .await
                }
                EnrichAction::Failed => commands::cmd_enrich_failed(&db),
                EnrichAction::Retry { yes } => {
                    let orchestrator = commands::orchestrator(&db, &config)?;
                    commands::cmd_enrich_retry(&orchestrator, yes).await
                }
            }
        }
        Commands::Jobs { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None => commands::cmd_jobs_list(&db, None, 20),
                Some(JobsAction::List { status, limit }) => {
                    commands::cmd_jobs_list(&db, status.as_deref(), limit)
                }
                Some(JobsAction::Show { id }) => commands::cmd_jobs_show(&db, id),
                Some(JobsAction::Cancel { id }) => commands::cmd_jobs_cancel(&db, id),
                Some(JobsAction::Recover) => commands::cmd_jobs_recover(&db),
            }
        }
        Commands::Resolve { transaction_id } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_resolve(&db, transaction_id)
        }
        Commands::Aliases { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None | Some(AliasesAction::List) => commands::cmd_aliases_list(&db),
                Some(AliasesAction::Add {
                    alias,
                    canonical,
                    category,
                    subcategory,
                    essential,
                }) => commands::cmd_aliases_add(
                    &db,
                    &alias,
                    &canonical,
                    category.as_deref(),
                    subcategory.as_deref(),
                    essential,
                ),
                Some(AliasesAction::Test { merchant }) => {
                    commands::cmd_aliases_test(&db, &merchant)
                }
            }
        }
        Commands::Rules { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None | Some(RulesAction::List) => commands::cmd_rules_list(&db),
                Some(RulesAction::Add {
                    pattern,
                    category,
                    pattern_type,
                    subcategory,
                    merchant,
                    essential,
                    priority,
                }) => commands::cmd_rules_add(
                    &db,
                    &commands::RuleArgs {
                        pattern,
                        category,
                        pattern_type,
                        subcategory,
                        merchant,
                        essential,
                        priority,
                    },
                ),
                Some(RulesAction::Delete { id }) => commands::cmd_rules_delete(&db, id),
                Some(RulesAction::Test { description }) => {
                    commands::cmd_rules_test(&db, &description)
                }
                Some(RulesAction::Apply) => commands::cmd_rules_apply(&db),
            }
        }
        Commands::Retention { days } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let days = days.unwrap_or(config.receipt_retention_days);
            if days < 1 {
                return Err(anyhow!("Retention must be at least one day"));
            }
            commands::cmd_retention(&db, days)
        }
        Commands::Disconnect { connection_id, yes } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_disconnect(&db, &connection_id, yes)
        }
        Commands::DeleteAccount { account_id, yes } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_delete_account(&db, account_id, yes)
        }
        Commands::Prompts { action } => match action {
            None | Some(PromptsAction::List) => commands::cmd_prompts_list(),
            Some(PromptsAction::Show { prompt_id }) => commands::cmd_prompts_show(&prompt_id),
            Some(PromptsAction::Path) => commands::cmd_prompts_path(),
        },
    }
}
