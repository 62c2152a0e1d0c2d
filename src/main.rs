use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use mailcore::config::{DB_PATH_ENV, GMAIL_API_BASE_ENV, REFRESH_URL_ENV};
use mailcore::models::Provider;

#[derive(Debug, Parser)]
#[command(name = "mailcore", version, about = "Gmail thread normalizer and account token cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// SQLite database holding the account cache
    #[arg(long, global = true, env = DB_PATH_ENV)]
    db: Option<PathBuf>,

    /// Token exchange endpoint used to refresh access tokens
    #[arg(long, global = true, env = REFRESH_URL_ENV)]
    refresh_url: Option<String>,

    /// Gmail REST base URL
    #[arg(long, global = true, env = GMAIL_API_BASE_ENV)]
    gmail_api_base: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage cached accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Print a usable access token, refreshing it when close to expiry
    Token { email: String },
    /// Refresh every account whose token is close to expiry
    RefreshAll,
    /// Normalize a raw Gmail thread JSON dump
    Parse(ParseArgs),
    /// Fetch and normalize live threads for an account
    Threads(ThreadsArgs),
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// List cached accounts
    List,
    /// Store or replace an account credential
    Add {
        email: String,
        provider: Provider,
        access_token: String,
        /// Seconds until the access token expires
        #[arg(long, default_value_t = 3600, value_parser = clap::value_parser!(i64).range(0..))]
        expires_in: i64,
    },
    /// Mark an account as selected
    Select { email: String },
}

#[derive(Debug, Args)]
struct ParseArgs {
    path: PathBuf,
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Args)]
struct ThreadsArgs {
    email: String,
    #[arg(long, default_value = "INBOX")]
    label: String,
    #[arg(long, default_value_t = 25)]
    limit: usize,
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
    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use chrono::Utc;

    use mailcore::accounts::{
        expires_at_after, AccountTokenCache, RefreshedToken, TokenRefresher, TokenStatus,
    };
    use mailcore::config::Config;
    use mailcore::db::Database;
    use mailcore::gmail::{parse_threads_json, GmailClient};
    use mailcore::models::{Provider, SelectedAccount};
    use mailcore::oauth::HttpTokenRefresher;
    use mailcore::output::{self, AccountListItem, OutputFormat};
    use mailcore::sealed::SealedStore;

    use super::{AccountCommands, Cli, Commands};

    type Cache = AccountTokenCache<SealedStore<Database>, CliRefresher>;

    /// Refresh through the configured endpoint. Without one every refresh
    /// fails, so callers still get the stored token back.
    struct CliRefresher(Option<HttpTokenRefresher>);

    #[async_trait]
    impl TokenRefresher for CliRefresher {
        async fn refresh(&self, email: &str, provider: Provider) -> Result<Option<RefreshedToken>> {
            match &self.0 {
                Some(refresher) => refresher.refresh(email, provider).await,
                None => Err(anyhow!(
                    "no token refresh endpoint configured (--refresh-url)"
                )),
            }
        }
    }

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let mut config = Config::from_env()?;
        if let Some(db) = cli.db {
            config.db_path = db;
        }
        if let Some(url) = cli.refresh_url {
            config.refresh_url = Some(url).filter(|url| !url.trim().is_empty());
        }
        if let Some(base) = cli.gmail_api_base {
            config.gmail_api_base = base;
        }
        let format = OutputFormat::from_json_flag(cli.json);

        match cli.command {
            Commands::Accounts { command } => handle_accounts(&config, command, format).await,
            Commands::Token { email } => handle_token(&config, &email, format).await,
            Commands::RefreshAll => handle_refresh_all(&config, format).await,
            Commands::Parse(args) => handle_parse(args, format),
            Commands::Threads(args) => handle_threads(&config, args, format).await,
        }
    }

    fn open_cache(config: &Config) -> Result<Cache> {
        let db = Database::open(&config.db_path)
            .with_context(|| format!("open mailcore database at {}", config.db_path.display()))?;
        let store = SealedStore::new(db, config.seal_key()?);
        let refresher = CliRefresher(config.refresh_url.as_deref().map(HttpTokenRefresher::new));
        Ok(AccountTokenCache::new(store, refresher))
    }

    async fn handle_accounts(
        config: &Config,
        command: AccountCommands,
        format: OutputFormat,
    ) -> Result<()> {
        let cache = open_cache(config)?;

        match command {
            AccountCommands::List => {
                let selected = cache.selected_account().await?.map(|account| account.email);
                let items: Vec<AccountListItem> = cache
                    .accounts()
                    .await?
                    .into_iter()
                    .map(|account| AccountListItem {
                        selected: selected.as_deref() == Some(account.email.as_str()),
                        account,
                    })
                    .collect();
                println!("{}", output::format_accounts(format, &items)?);
            }
            AccountCommands::Add {
                email,
                provider,
                access_token,
                expires_in,
            } => {
                let email = email.trim().to_string();
                if email.is_empty() {
                    return Err(anyhow!("account email must not be empty"));
                }
                cache
                    .upsert_account(SelectedAccount {
                        email: email.clone(),
                        provider,
                        access_token,
                        expires_at: expires_at_after(Utc::now().timestamp_millis(), expires_in),
                    })
                    .await?;
                println!("Stored account: {email} ({provider})");
            }
            AccountCommands::Select { email } => {
                let account = cache.select_account(&email).await?;
                println!("Selected account: {}", account.email);
            }
        }
        Ok(())
    }

    async fn handle_token(config: &Config, email: &str, format: OutputFormat) -> Result<()> {
        let cache = open_cache(config)?;
        let access = cache.get_valid_access_token(email).await?;

        if format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&access)?);
            return Ok(());
        }

        match &access.status {
            TokenStatus::Valid => eprintln!("token valid"),
            TokenStatus::Refreshed => eprintln!("token refreshed"),
            TokenStatus::Stale { reason } => eprintln!("token may be stale: {reason}"),
        }
        println!("{}", access.token);
        Ok(())
    }

    async fn handle_refresh_all(config: &Config, format: OutputFormat) -> Result<()> {
        let cache = open_cache(config)?;
        let summary = cache.refresh_all_access_tokens().await?;
        println!("{}", output::format_refresh_summary(format, &summary)?);
        Ok(())
    }

    fn handle_parse(args: super::ParseArgs, format: OutputFormat) -> Result<()> {
        let raw = std::fs::read_to_string(&args.path)
            .with_context(|| format!("read thread dump {}", args.path.display()))?;
        let threads = parse_threads_json(&raw, &args.owner)?;
        println!("{}", output::format_threads(format, &threads)?);
        Ok(())
    }

    async fn handle_threads(
        config: &Config,
        args: super::ThreadsArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let cache = open_cache(config)?;
        let client = GmailClient::with_base(config.gmail_api_base.as_str());
        let threads = client
            .fetch_threads(&cache, &args.email, Some(args.label.as_str()), args.limit)
            .await?;
        println!("{}", output::format_threads(format, &threads)?);
        Ok(())
    }
}
