mod catalog;
mod chunks;
mod pipeline;
mod report;
mod shopify;

use clap::{Parser, Subcommand};

use shopsync_config::{init_tracing, AppConfig};
use shopsync_db::cursor::pg_repository::PgCursorStore;
use shopsync_db::load::writer::PgDestination;

use crate::pipeline::{parse_start_date, Pipeline, PipelineOptions};
use crate::shopify::{ShopifyClient, ShopifyClientConfig};

#[derive(Parser)]
#[command(name = "shopsync", about = "Shopify to Postgres extract-and-load")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chunked historical backfill, then switch to incremental
    Backfill,
    /// Pull one incremental window for steady-state resources
    Incremental {
        /// Resource names (default: the whole catalog)
        #[arg(long, value_delimiter = ',')]
        resources: Vec<String>,
        /// Explicit window start (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        start_date: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing("info");
    let _ = dotenvy::dotenv();

    tracing::info!(service = "shopsync-ingest", "starting");

    let config = AppConfig::from_env().expect("failed to load config");
    let pool = shopsync_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Fails fast if Shopify creds are present but SHOPIFY_METAOBJECT_TYPES
    // is set and empty.
    let shopify_config = match ShopifyClientConfig::from_env() {
        Ok(Some(c)) => c,
        Ok(None) => {
            tracing::info!("no shopify credentials found, nothing to do");
            return;
        }
        Err(e) => panic!("shopify configuration error (fail-fast): {e}"),
    };

    let shop = shopify_config
        .shop_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string();
    let client = ShopifyClient::new(shopify_config).expect("failed to create shopify client");

    let cursors = PgCursorStore::new(pool.clone());
    cursors
        .ensure_table()
        .await
        .expect("failed to prepare cursor table");
    let destination = PgDestination::new(pool.clone(), &config.dest_schema);

    let options = PipelineOptions::from_env().expect("invalid pipeline configuration");
    let pipeline = Pipeline::new(&shop, client, cursors, destination, options);

    let report = match cli.command {
        Commands::Backfill => {
            pipeline
                .run_backfill_then_incremental(catalog::catalog())
                .await
        }
        Commands::Incremental {
            resources,
            start_date,
        } => {
            let start = start_date.map(|raw| parse_start_date(&raw).expect("invalid --start-date"));
            let names: Vec<String> = if resources.is_empty() {
                catalog::catalog()
                    .iter()
                    .map(|r| r.name.to_string())
                    .collect()
            } else {
                resources
            };
            pipeline.run_incremental(&names, start).await
        }
    };

    match report {
        Ok(report) if report.aborted => std::process::exit(1),
        Ok(_) => {}
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            std::process::exit(1);
        }
    }
}
