mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use clap::{Parser, Subcommand};
use club_core::app_dir::AppDir;
use club_core::document_store::{DocumentStore, Fields, SqliteDocumentStore};
use club_core::id_token::TokenSigner;
use club_core::model::USERS;
use serde_json::Value;
use tracing::{error, info};

use routes::{router, AppState};

#[derive(Parser)]
#[command(name = "club-server")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the identity-verification API.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "3000", env = "CLUB_PORT")]
        port: u16,

        /// Address to bind to.
        #[arg(long, default_value = "0.0.0.0", env = "CLUB_BIND")]
        bind: String,

        /// Path to the document database. Defaults to the app directory.
        #[arg(long, env = "CLUB_DB_PATH")]
        db_path: Option<PathBuf>,

        /// Hex-encoded 32-byte token signing secret.
        #[arg(long, env = "CLUB_TOKEN_SECRET", hide_env_values = true)]
        token_secret: String,

        /// Origin allowed to call the API from a browser.
        #[arg(long, env = "CLUB_ALLOWED_ORIGIN")]
        allowed_origin: Option<String>,
    },
    /// Print a signed bearer token for a user.
    IssueToken {
        #[arg(long)]
        uid: String,

        /// Token lifetime in seconds.
        #[arg(long, default_value = "86400")]
        ttl_secs: u64,

        #[arg(long, env = "CLUB_TOKEN_SECRET", hide_env_values = true)]
        token_secret: String,
    },
    /// Create or replace a user profile.
    AddUser {
        #[arg(long)]
        uid: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        display_name: Option<String>,

        /// `admin` or `member`.
        #[arg(long, default_value = "member")]
        role: String,

        #[arg(long, env = "CLUB_DB_PATH")]
        db_path: Option<PathBuf>,
    },
}

fn configure_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn load_signer(secret: &str) -> TokenSigner {
    TokenSigner::from_hex(secret).unwrap_or_else(|e| {
        error!("invalid token secret: {e}");
        std::process::exit(1);
    })
}

async fn open_store(db_path: Option<PathBuf>) -> SqliteDocumentStore {
    let db_path = db_path.unwrap_or_else(|| AppDir::platform_default().db_path());
    if let Some(parent) = db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("failed to create {}: {e}", parent.display());
            std::process::exit(1);
        }
    }
    SqliteDocumentStore::open(&db_path).await.unwrap_or_else(|e| {
        error!("failed to open {}: {e}", db_path.display());
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    configure_logging();
    let args = Args::parse();

    match args.command {
        Command::Serve {
            port,
            bind,
            db_path,
            token_secret,
            allowed_origin,
        } => serve(port, bind, db_path, token_secret, allowed_origin).await,
        Command::IssueToken {
            uid,
            ttl_secs,
            token_secret,
        } => {
            let token = load_signer(&token_secret)
                .issue(&uid, Duration::from_secs(ttl_secs))
                .unwrap_or_else(|e| {
                    error!("failed to issue token: {e}");
                    std::process::exit(1);
                });
            println!("{token}");
        }
        Command::AddUser {
            uid,
            email,
            display_name,
            role,
            db_path,
        } => {
            let store = open_store(db_path).await;
            let mut profile = Fields::new();
            profile.insert("email".into(), Value::String(email));
            profile.insert("role".into(), Value::String(role));
            if let Some(name) = display_name {
                profile.insert("displayName".into(), Value::String(name));
            }
            if let Err(e) = store.set(USERS, &uid, profile).await {
                error!("failed to save user {uid}: {e}");
                std::process::exit(1);
            }
            info!("saved user {uid}");
        }
    }
}

async fn serve(
    port: u16,
    bind: String,
    db_path: Option<PathBuf>,
    token_secret: String,
    allowed_origin: Option<String>,
) {
    let signer = load_signer(&token_secret);
    let store = open_store(db_path).await;

    let allowed_origin = allowed_origin.map(|origin| {
        HeaderValue::from_str(&origin).unwrap_or_else(|e| {
            error!("invalid allowed origin {origin:?}: {e}");
            std::process::exit(1);
        })
    });
    match &allowed_origin {
        Some(origin) => info!("allowing CORS from {origin:?}"),
        None => info!("CORS disabled"),
    }

    let state = Arc::new(AppState {
        store: Arc::new(store),
        signer,
    });
    let app = router(state, allowed_origin);

    let addr = format!("{}:{}", bind, port);

    info!("binding to {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!("failed to bind to {addr}: {e}");
            std::process::exit(1);
        });

    info!("club-server listening on http://{addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
