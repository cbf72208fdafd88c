use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::ratelimit::{routes, Category, Identifier, PolicyRegistry, RateLimiter};
use tollgate::TollgateConfig;

/// Operator tool for inspecting and exercising the request throttling policies.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file, overridden by TOLLGATE_* environment variables
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the policy table
    Policies,

    /// Show which category a request path falls under
    Classify {
        /// Request path, e.g. /api/orders/12
        path: String,
    },

    /// Run checks against the configured counters and print each decision
    Check {
        /// Route category
        #[arg(long)]
        category: Category,

        /// Caller identifier, e.g. ip:203.0.113.7 or user:42
        #[arg(long)]
        key: String,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        hits: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = TollgateConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Policies => {
            let registry = PolicyRegistry::standard();
            for policy in registry.policies() {
                println!(
                    "{:<10} {:>5} / {:>3}s  {}",
                    policy.category, policy.limit, policy.window_seconds, policy.description
                );
            }
        }
        Command::Classify { path } => {
            if routes::is_excluded(&path) {
                println!("excluded");
            } else {
                println!("{}", routes::classify(&path));
            }
        }
        Command::Check { category, key, hits } => {
            let limiter = RateLimiter::from_config(&config)?;
            info!(
                distributed = limiter.has_distributed(),
                category = %category,
                key = %key,
                "Running checks"
            );

            let identifier = Identifier::explicit(key);
            for _ in 0..hits {
                let decision = limiter.check_identifier(category, &identifier).await;

                let rejection = limiter.rejection(&decision).map(|r| r.body);
                println!("{}", json!({ "decision": decision, "rejection": rejection }));
            }

            limiter.local().destroy();
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
