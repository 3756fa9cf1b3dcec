use clap::{Parser, Subcommand};
use ferry_config::{load_config, AppConfig};
use ferry_gmail::{
    run_authorization_flow, ClientSecrets, GmailClient, GmailIngestor, LabelCache, TokenManager,
};
use ferry_imap::{ImapPool, ImapSettings};
use ferry_pipeline::{build_report, verify_evidence, write_report, Migration};
use ferry_storage::{EvidenceStore, ResetScope, StateDb};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_PARTIAL: u8 = 2;
const EXIT_VERIFY: u8 = 3;

#[derive(Parser)]
#[command(
    name = "mailferry",
    version,
    about = "Deterministic iCloud IMAP → Gmail migration with .eml evidence and sqlite checkpoints"
)]
struct Cli {
    /// Optional .env file loaded in addition to the process environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Complete the Gmail OAuth loopback flow and persist the token file.
    GmailAuth,
    /// Run discovery → ingestion (or stop after evidence with --dry-run).
    Migrate {
        /// Fetch and write evidence plus state, but skip Gmail ingestion.
        #[arg(long)]
        dry_run: bool,
        /// Reset skipped/failed rows and folder checkpoints first.
        #[arg(long)]
        reset: bool,
    },
    /// Recompute the SHA-256 of every evidence file and compare to the
    /// state store. Reports only; nothing is mutated.
    Verify,
    /// Write a JSON summary artifact into the reports directory.
    Report,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.env_file.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_tracing(&config.log.level);

    let result = match cli.command {
        Command::GmailAuth => gmail_auth(&config).await,
        Command::Migrate { dry_run, reset } => migrate(&config, dry_run, reset).await,
        Command::Verify => verify(&config).await,
        Command::Report => report(&config).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn gmail_auth(config: &AppConfig) -> anyhow::Result<u8> {
    let Some(gmail) = config.gmail.as_ref() else {
        eprintln!(
            "Missing Gmail settings. Set MIG_GMAIL__TARGET_USER_EMAIL and MIG_GMAIL__CREDENTIALS_FILE."
        );
        return Ok(EXIT_CONFIG);
    };

    let secrets = ClientSecrets::from_file(&gmail.credentials_file)?;
    run_authorization_flow(&secrets, &gmail.token_file).await?;

    // Smoke-test the token against the target mailbox.
    let tokens = TokenManager::new(secrets, gmail.token_file.clone());
    let client = GmailClient::new(tokens, gmail.target_user_email.clone());
    let profile = client.get_profile().await?;
    println!("Gmail OAuth OK for: {}", profile.email_address);
    if let Some(total) = profile.messages_total {
        println!("messagesTotal: {total}");
    }
    Ok(EXIT_OK)
}

async fn migrate(config: &AppConfig, dry_run: bool, reset: bool) -> anyhow::Result<u8> {
    let Some(imap) = config.imap.as_ref() else {
        eprintln!("Missing IMAP settings. Set at least MIG_IMAP__USERNAME and MIG_IMAP__APP_PASSWORD.");
        return Ok(EXIT_CONFIG);
    };
    if !dry_run && config.gmail.is_none() {
        eprintln!(
            "Missing Gmail settings. Set MIG_GMAIL__TARGET_USER_EMAIL and MIG_GMAIL__CREDENTIALS_FILE \
             (or pass --dry-run)."
        );
        return Ok(EXIT_CONFIG);
    }

    std::fs::create_dir_all(config.storage.root_dir.as_path())?;
    let db = StateDb::connect(&config.storage.sqlite_path()).await?;
    let evidence = EvidenceStore::new(config.storage.evidence_dir());

    if reset {
        let affected = db.reset(ResetScope::All).await?;
        info!(affected, "reset skipped/failed rows and folder checkpoints");
    }

    let pool = ImapPool::new(
        ImapSettings {
            host: imap.host.clone(),
            port: imap.port,
            username: imap.username.clone(),
            app_password: imap.app_password.clone(),
        },
        imap.connections,
    );

    let (ingestor, labels) = if dry_run {
        (None, None)
    } else {
        let gmail = config.gmail.as_ref().expect("gmail config checked above");
        let secrets = ClientSecrets::from_file(&gmail.credentials_file)?;
        let tokens = TokenManager::new(secrets, gmail.token_file.clone());
        let client = Arc::new(GmailClient::new(tokens, gmail.target_user_email.clone()));
        let labels = Arc::new(LabelCache::seed(Arc::clone(&client)).await?);
        let ingestor = Arc::new(GmailIngestor {
            client,
            mode: gmail.mode,
        });
        (
            Some(ingestor as Arc<dyn ferry_gmail::MessageIngestor>),
            Some(labels),
        )
    };

    let migration = Migration::new(config.clone(), db.clone(), evidence, pool.clone(), ingestor, labels);

    let shutdown = migration.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing in-flight work");
            let _ = shutdown.send(true);
        }
    });

    let outcome = migration.run().await?;
    pool.shutdown().await;
    db.close().await;

    println!("discovered: {}", outcome.counts.discovered);
    println!("downloaded: {}", outcome.counts.downloaded);
    println!("imported:   {}", outcome.counts.imported);
    println!("skipped:    {}", outcome.counts.skipped);
    println!("failed:     {}", outcome.counts.failed);

    if outcome.counts.failed > 0 {
        return Ok(EXIT_PARTIAL);
    }
    Ok(EXIT_OK)
}

async fn verify(config: &AppConfig) -> anyhow::Result<u8> {
    let db = StateDb::connect(&config.storage.sqlite_path()).await?;
    let store = EvidenceStore::new(config.storage.evidence_dir());

    let outcome = verify_evidence(&db, &store).await?;
    db.close().await;

    println!("evidence files checked: {}", outcome.checked);
    println!("mismatches: {}", outcome.mismatches.len());
    for mismatch in &outcome.mismatches {
        println!(
            "  {} {} ({})",
            mismatch.fingerprint, mismatch.path, mismatch.reason
        );
    }

    if outcome.is_clean() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_VERIFY)
    }
}

async fn report(config: &AppConfig) -> anyhow::Result<u8> {
    let db = StateDb::connect(&config.storage.sqlite_path()).await?;
    let store = EvidenceStore::new(config.storage.evidence_dir());

    let mismatches = verify_evidence(&db, &store).await?.mismatches.len() as u64;
    let summary = build_report(&db, mismatches).await?;
    db.close().await;

    let path = write_report(&summary, &config.storage.reports_dir())?;
    println!("wrote {}", path.display());
    Ok(EXIT_OK)
}
