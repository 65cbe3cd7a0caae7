//! Command-line client that keeps a live copy of a record collection.
//!
//! Run with: cargo run -p livecrud-sync-client -- [COMMAND]
//!
//! Commands:
//!   watch                        Load the collection and follow live changes (default)
//!   login                        Log in with LIVECRUD_USERNAME / LIVECRUD_PASSWORD
//!   logout                       End the session everywhere
//!   create NAME SHAPE COLOR      Create a record
//!   update ID FIELD VALUE        Change one field of a record
//!   delete ID                    Delete a record
//!
//! Configuration comes from `LIVECRUD_*` environment variables; see
//! `ClientConfig::from_env`.

use std::sync::Arc;

use anyhow::{Context, bail};
use futures::StreamExt;
use livecrud_core::{CacheStore, CacheUpdate, ClientConfig, CredentialStore, RecordId};
use livecrud_session::{
    LogoutBus, RecordService, SessionError, SessionManager, SessionOptions, SessionState,
    storage::FileCredentialStore,
};
use livecrud_transport::{ConnectionManager, HttpBackend, WsConnector};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Command {
    Watch,
    Login,
    Logout,
    Create { name: String, shape: String, color: String },
    Update { id: RecordId, field: String, value: String },
    Delete { id: RecordId },
}

fn parse_id(raw: &str) -> RecordId {
    raw.parse::<i64>()
        .map_or_else(|_| RecordId::from(raw), RecordId::Int)
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    let command = args.next();
    let mut next = |what: &str| {
        args.next()
            .with_context(|| format!("Missing argument: {what}"))
    };
    Ok(match command.as_deref() {
        None | Some("watch") => Command::Watch,
        Some("login") => Command::Login,
        Some("logout") => Command::Logout,
        Some("create") => Command::Create {
            name: next("NAME")?,
            shape: next("SHAPE")?,
            color: next("COLOR")?,
        },
        Some("update") => Command::Update {
            id: parse_id(&next("ID")?),
            field: next("FIELD")?,
            value: next("VALUE")?,
        },
        Some("delete") => Command::Delete {
            id: parse_id(&next("ID")?),
        },
        Some(other) => bail!("Unknown command: {other}"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let command = parse_args(std::env::args().skip(1))?;
    let config = ClientConfig::from_env();
    config.validate().context("Invalid configuration")?;

    let backend = Arc::new(HttpBackend::from_config(&config)?);
    let store: Arc<dyn CredentialStore> = match &config.credential_path {
        Some(path) => Arc::new(FileCredentialStore::new(path)),
        None => Arc::new(FileCredentialStore::in_data_dir()?),
    };
    let session = SessionManager::new(
        backend.clone(),
        store,
        LogoutBus::new(),
        SessionOptions {
            refresh_interval: config.refresh_interval,
        },
    );

    let state = session.start().await;
    tracing::info!(?state, "Session restored");

    if matches!(command, Command::Login) || !session.is_authenticated() {
        login_from_env(&session, matches!(command, Command::Login)).await?;
    }

    let cache = Arc::new(CacheStore::new());
    let records = RecordService::new(backend, Arc::clone(&session), Arc::clone(&cache));

    match command {
        Command::Watch => watch(&config, &session, &records).await?,
        Command::Login => {}
        Command::Logout => session.logout().await,
        Command::Create { name, shape, color } => {
            let body = json!({ "name": name, "shape": shape, "color": color });
            let record = report(records.create(&body).await)?;
            println!("Created {}", serde_json::to_string(&record)?);
        }
        Command::Update { id, field, value } => {
            let record = report(records.update(&id, &json!({ field: value })).await)?;
            println!("Updated {}", serde_json::to_string(&record)?);
        }
        Command::Delete { id } => {
            report(records.delete(&id).await)?;
            println!("Deleted {id}");
        }
    }
    Ok(())
}

/// Log in when credentials are configured. `required` turns missing
/// credentials into an error.
async fn login_from_env(session: &SessionManager, required: bool) -> anyhow::Result<()> {
    let (Ok(username), Ok(password)) = (
        std::env::var("LIVECRUD_USERNAME"),
        std::env::var("LIVECRUD_PASSWORD"),
    ) else {
        if required {
            bail!("Set LIVECRUD_USERNAME and LIVECRUD_PASSWORD to log in");
        }
        tracing::info!("No credentials configured, continuing anonymously");
        return Ok(());
    };

    match session.login(&username, &password).await {
        Ok(principal) => {
            tracing::info!(username = %principal.username, "Logged in");
            Ok(())
        }
        Err(SessionError::AuthFailure) => bail!("Invalid username or password"),
        Err(e) => Err(e.into()),
    }
}

/// Print field errors the way a form would, and pass everything else on.
fn report<T>(result: Result<T, SessionError>) -> anyhow::Result<T> {
    match result {
        Err(SessionError::Validation(fields)) => {
            for (field, errors) in &fields {
                eprintln!("{field}: {errors}");
            }
            bail!("The server rejected the record")
        }
        Err(SessionError::NotAuthenticated | SessionError::AuthFailure) => {
            bail!("Not logged in; run `login` first")
        }
        other => Ok(other?),
    }
}

fn print_snapshot(update: &CacheUpdate) {
    println!("--- revision {} ({} records)", update.revision, update.snapshot.len());
    for record in &update.snapshot {
        let fields = serde_json::Value::Object(record.fields.clone());
        println!("{:>6}  {fields}", record.id.to_string());
    }
}

async fn watch(
    config: &ClientConfig,
    session: &SessionManager,
    records: &RecordService,
) -> anyhow::Result<()> {
    records.load().await.context("Failed to load records")?;

    let connection = ConnectionManager::new(
        Arc::new(WsConnector::new(config.realtime_url.clone())),
        Arc::clone(records.cache()),
        config.reconnect,
    );
    connection.set_demand(true);

    let mut updates = records.cache().snapshot_stream();
    let mut connection_states = connection.subscribe_state();
    let mut session_states = session.subscribe_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(update) = updates.next() => print_snapshot(&update),
            Ok(()) = connection_states.changed() => {
                let state = *connection_states.borrow_and_update();
                tracing::info!(?state, "Realtime connection");
            }
            Ok(()) = session_states.changed() => {
                let state = *session_states.borrow_and_update();
                if state == SessionState::Anonymous {
                    tracing::warn!("Session ended; log in again to make changes");
                }
            }
        }
    }

    tracing::info!("Shutting down");
    connection.shutdown().await;
    Ok(())
}
