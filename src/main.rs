use std::sync::Arc;

use mailflow::api::{ApiState, api_routes};
use mailflow::config::{AutomationConfig, SmtpConfig, SummarizerConfig};
use mailflow::error::ProviderError;
use mailflow::provider::smtp::SmtpProvider;
use mailflow::provider::{EmailProvider, ProviderFactory};
use mailflow::queue::InMemoryQueue;
use mailflow::rules::PatternRules;
use mailflow::runtime::{Automation, AutomationDeps};
use mailflow::store::{Database, LibSqlBackend};
use mailflow::summarizer::{HttpSummarizer, Summarizer};

/// Factory serving the same SMTP relay client for every account.
///
/// A mailbox-API deployment plugs in its own factory with per-account
/// token refresh; the SMTP relay needs none, but a fresh client is still
/// built per send inside the provider.
struct SmtpFactory {
    config: SmtpConfig,
}

#[async_trait::async_trait]
impl ProviderFactory for SmtpFactory {
    async fn resolve(
        &self,
        _account_id: &str,
    ) -> Result<Arc<dyn EmailProvider>, ProviderError> {
        Ok(Arc::new(SmtpProvider::new(self.config.clone())))
    }
}

/// Summarizer used when no endpoint is configured: nothing is worth
/// surfacing, so digests stay empty rather than fabricated.
struct NullSummarizer;

#[async_trait::async_trait]
impl Summarizer for NullSummarizer {
    async fn summarize(
        &self,
        _message: &mailflow::queue::DigestMessage,
    ) -> Result<Option<mailflow::summarizer::DigestSummary>, mailflow::error::SummarizerError>
    {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage (SMTP).
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Tracing: stderr by default, rolling file when MAILFLOW_LOG_DIR is set.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("MAILFLOW_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mailflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let port: u16 = std::env::var("MAILFLOW_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("📬 Mailflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{port}/api");

    // ── Database ─────────────────────────────────────────────────────
    let db_path =
        std::env::var("MAILFLOW_DB_PATH").unwrap_or_else(|_| "./data/mailflow.db".to_string());
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Collaborators ────────────────────────────────────────────────
    let config = AutomationConfig::from_env();
    let queue = Arc::new(InMemoryQueue::new(config.retry.clone()));

    let providers: Arc<dyn ProviderFactory> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   Provider: SMTP relay via {}", smtp.host);
            Arc::new(SmtpFactory { config: smtp })
        }
        None => {
            eprintln!("   Provider: none configured (set MAILFLOW_SMTP_HOST)");
            eprintln!("            outbound sends will fail until one is wired in");
            Arc::new(SmtpFactory {
                config: SmtpConfig {
                    host: "localhost".into(),
                    port: 25,
                    username: String::new(),
                    password: secrecy::SecretString::from(String::new()),
                    from_address: config.outgoing_address.clone(),
                },
            })
        }
    };

    let summarizer: Arc<dyn Summarizer> = match SummarizerConfig::from_env() {
        Some(cfg) => {
            eprintln!("   Summarizer: {}", cfg.endpoint);
            Arc::new(HttpSummarizer::new(cfg))
        }
        None => {
            eprintln!("   Summarizer: disabled (set MAILFLOW_SUMMARIZER_URL)");
            Arc::new(NullSummarizer)
        }
    };

    // ── Automation core ──────────────────────────────────────────────
    let automation = Automation::new(
        &config,
        AutomationDeps {
            store: store.clone(),
            queue: queue.clone(),
            providers,
            rules: Arc::new(PatternRules::default_rules()),
            summarizer,
        },
    );
    queue.set_handler(automation.router.clone());

    // Recovery sweeper: armed on every boot; its idempotency key keeps
    // repeated boots from stacking sweepers.
    automation.sweeper.arm().await?;
    eprintln!(
        "   Sweeper: armed (every {}s, batch {})",
        config.sweeper_interval.as_secs(),
        config.sweeper_batch
    );

    // ── API server ───────────────────────────────────────────────────
    let app = api_routes(ApiState {
        store,
        queue: queue.clone(),
        fetcher: automation.fetcher.clone(),
        scheduler: automation.scheduler.clone(),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "Mailflow API started");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nShutting down…");
            queue.shutdown();
        }
    }

    Ok(())
}
