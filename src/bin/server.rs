use std::{
    env::{self},
    fs::OpenOptions,
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    Router,
    extract::{MatchedPath, Request},
};
use axum_server::Handle;
use clap::Parser;
use rusqlite::Connection;
use tower_http::trace::TraceLayer;

use tracing_subscriber::{Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use banklink_rs::{
    AggregatorClient, AggregatorEnv, AppState, TokenCipher, build_router, graceful_shutdown,
};

/// The transaction ingestion server for banklink_rs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to the application SQLite database.
    #[arg(long)]
    db_path: String,

    /// The port to serve the API from.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() {
    setup_logging();

    let args = Args::parse();

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));

    let aggregator_env: AggregatorEnv = env::var("AGGREGATOR_ENV")
        .expect("The environment variable 'AGGREGATOR_ENV' must be set")
        .parse()
        .expect("AGGREGATOR_ENV must be one of sandbox, development or production");
    let client_id = env::var("AGGREGATOR_CLIENT_ID")
        .expect("The environment variable 'AGGREGATOR_CLIENT_ID' must be set");
    let secret = env::var("AGGREGATOR_SECRET")
        .expect("The environment variable 'AGGREGATOR_SECRET' must be set");

    // Tokens stored before the key rollout are still readable without the
    // key; decryption falls back to plain base64 for them.
    let token_cipher = match env::var("BANKLINK_ENCRYPTION_KEY") {
        Ok(key) => TokenCipher::from_secret(&key),
        Err(_) => {
            tracing::warn!(
                "BANKLINK_ENCRYPTION_KEY is not set, stored tokens will be read \
                via the base64 fallback"
            );
            TokenCipher::new_unkeyed()
        }
    };

    let aggregator = AggregatorClient::new(aggregator_env, &client_id, &secret);

    let conn = Connection::open(&args.db_path).expect("Could not open the database");
    let state = AppState::new(conn, token_cipher, Arc::new(aggregator))
        .expect("Could not initialize the application state");

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    let router = add_tracing_layer(build_router(state));

    tracing::info!("HTTP server listening on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .unwrap();
}

fn setup_logging() {
    let stdout_log = tracing_subscriber::fmt::layer().pretty();

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("Could not create log file");

    let debug_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(
            stdout_log
                .with_filter(filter::LevelFilter::INFO)
                .and_then(debug_log)
                .with_filter(filter::LevelFilter::DEBUG),
        )
        .init();
}

fn add_tracing_layer(router: Router) -> Router {
    let tracing_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            let method = req.method();
            let uri = req.uri();

            let matched_path = req
                .extensions()
                .get::<MatchedPath>()
                .map(|matched_path| matched_path.as_str());

            tracing::debug_span!("request", %method, %uri, matched_path)
        })
        // By default, `TraceLayer` will log 5xx responses but we're doing our
        // specific logging of errors so disable that
        .on_failure(());

    router.layer(tracing_layer)
}
