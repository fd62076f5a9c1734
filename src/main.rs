use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailsync", version, about = "Incremental mailbox sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync a batch of due accounts, oldest-synced first
    Batch(BatchArgs),
    /// Sync one account now
    Sync(SyncArgs),
    /// Manage linked mailbox accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Show database stats
    Stats,
}

#[derive(Debug, Args)]
struct BatchArgs {
    /// Upper bound on accounts per run
    #[arg(long, default_value_t = 25)]
    max_accounts: usize,
    /// Shared secret for scheduled invocation; checked against
    /// MAILSYNC_CRON_SECRET when that variable is set
    #[arg(long)]
    secret: Option<String>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    user: String,
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// Link (or re-link) a mailbox for a tenant user
    Link {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        email: String,
        /// Long-lived refresh token; sealed before it touches disk
        #[arg(long, env = "MAILSYNC_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,
    },
    /// List linked accounts
    List,
    /// Show per-account sync status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{anyhow, bail, Context, Result};
    use uuid::Uuid;

    use mailsync::db::models::MailAccount;
    use mailsync::db::Database;
    use mailsync::provider::GmailProvider;
    use mailsync::sync::{self, SyncConfig};
    use mailsync::token::TokenBroker;
    use mailsync::vault::SecretVault;

    use super::{AccountCommands, BatchArgs, Cli, Commands, SyncArgs};

    const CRON_SECRET_ENV: &str = "MAILSYNC_CRON_SECRET";

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Batch(args) => handle_batch(args, cli.json).await,
            Commands::Sync(args) => handle_sync(args, cli.json).await,
            Commands::Accounts { command } => handle_accounts(command, cli.json).await,
            Commands::Stats => handle_stats(cli.json).await,
        }
    }

    fn open_database() -> Result<Database> {
        let db_path = Database::default_db_path().context("resolve mailsync database path")?;
        Database::open(&db_path)
            .with_context(|| format!("open mailsync database at {}", db_path.display()))
    }

    /// When MAILSYNC_CRON_SECRET is set, the caller must present the same
    /// value; an unauthenticated scheduler endpoint would let anyone drive
    /// provider traffic for every tenant.
    fn authorize_trigger(presented: Option<&str>) -> Result<()> {
        let Ok(expected) = std::env::var(CRON_SECRET_ENV) else {
            return Ok(());
        };
        let expected = expected.trim();
        if expected.is_empty() {
            return Ok(());
        }
        match presented {
            Some(secret) if secret == expected => Ok(()),
            _ => bail!("batch trigger rejected: missing or wrong --secret"),
        }
    }

    async fn handle_batch(args: BatchArgs, json: bool) -> Result<()> {
        authorize_trigger(args.secret.as_deref())?;

        let db = open_database()?;
        let vault = SecretVault::from_env().context("load vault key")?;
        let tokens = TokenBroker::from_env(vault).context("configure token broker")?;
        let provider = GmailProvider::from_env();
        let config = SyncConfig::from_env();

        let report =
            sync::run_batch(&db, &provider, &tokens, &config, args.max_accounts).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "Batch complete: {} succeeded, {} failed",
                report.succeeded, report.failed
            );
            for entry in &report.accounts {
                match (&entry.outcome, &entry.error) {
                    (Some(outcome), _) => println!(
                        "{}  {}  ingested={} skipped={} cursor={}",
                        entry.account_id,
                        entry.email_address,
                        outcome.messages_ingested,
                        outcome.messages_skipped,
                        outcome.cursor
                    ),
                    (None, Some(error)) => {
                        println!("{}  {}  FAILED: {error}", entry.account_id, entry.email_address)
                    }
                    (None, None) => {}
                }
            }
        }
        Ok(())
    }

    async fn handle_sync(args: SyncArgs, json: bool) -> Result<()> {
        let db = open_database()?;
        let vault = SecretVault::from_env().context("load vault key")?;
        let tokens = TokenBroker::from_env(vault).context("configure token broker")?;
        let provider = GmailProvider::from_env();
        let config = SyncConfig::from_env();

        let account = db
            .get_account(&args.tenant, &args.user)?
            .ok_or_else(|| anyhow!("no linked account for tenant '{}' user '{}'", args.tenant, args.user))?;

        let outcome = sync::sync_account(&db, &provider, &tokens, &account, &config).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            println!(
                "Sync complete ({:?}): ingested={} skipped={} cursor={}",
                outcome.mode, outcome.messages_ingested, outcome.messages_skipped, outcome.cursor
            );
        }
        Ok(())
    }

    async fn handle_accounts(command: AccountCommands, json: bool) -> Result<()> {
        let db = open_database()?;

        match command {
            AccountCommands::Link {
                tenant,
                user,
                email,
                refresh_token,
            } => {
                let vault = SecretVault::from_env().context("load vault key")?;
                let sealed = vault
                    .seal(refresh_token.as_bytes())
                    .context("seal refresh token")?;

                let account = MailAccount {
                    id: Uuid::new_v4().to_string(),
                    tenant_id: tenant,
                    user_id: user,
                    email_address: email.trim().to_ascii_lowercase(),
                    credential: Some(sealed),
                    cursor: None,
                    last_synced_at: None,
                };
                db.upsert_account(&account)?;
                println!("Linked account: {}", account.email_address);
            }
            AccountCommands::List => {
                let accounts = db.list_accounts()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&accounts)?);
                } else if accounts.is_empty() {
                    println!("No accounts linked.");
                } else {
                    println!("Accounts");
                    println!("========");
                    for account in accounts {
                        println!(
                            "{}  {}  {}/{}",
                            account.id, account.email_address, account.tenant_id, account.user_id
                        );
                    }
                }
            }
            AccountCommands::Status => {
                let accounts = db.list_accounts()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&accounts)?);
                } else if accounts.is_empty() {
                    println!("No accounts linked.");
                } else {
                    println!("Account Sync Status");
                    println!("===================");
                    for account in accounts {
                        println!(
                            "{}  cursor={}  last_sync={}",
                            account.email_address,
                            account
                                .cursor
                                .as_ref()
                                .map(ToString::to_string)
                                .unwrap_or_else(|| "none".to_string()),
                            account.last_synced_at.as_deref().unwrap_or("never")
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_stats(json: bool) -> Result<()> {
        let db = open_database()?;
        let stats = db.stats()?;

        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("Accounts: {}", stats.total_accounts);
            println!("Threads:  {}", stats.total_threads);
            println!("Messages: {}", stats.total_messages);
        }
        Ok(())
    }
}
