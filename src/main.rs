pub mod api;
pub mod clock;
pub mod code;
pub mod config;
pub mod engine;
pub mod err;
pub mod locks;
pub mod memory;
pub mod models;
pub mod notify;
pub mod pg;
pub mod scheduler;
pub mod store;

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::Engine;
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::memory::MemoryStore;
use crate::notify::LogNotifier;
use crate::pg::PgStore;
use crate::store::Store;

pub type Payload<T> = Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V> where V: Serialize {
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V> where V: Serialize {
    Ok(Nothing(err))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    let config = Config::from_env()?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url, config.database_max_connections).await?;
            pg.migrate().await?;
            Arc::new(pg)
        }
        None => {
            log::warn!("DATABASE_URL is not set, attendance is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(Engine::new(store, Arc::new(LogNotifier), clock.clone(), config.policy));

    let cancel = CancellationToken::new();
    let jobs = if config.reset_jobs_enabled {
        scheduler::spawn(engine.clone(), clock, cancel.clone())
    } else {
        Vec::new()
    };

    let app = api::router(engine);
    log::info!("Starting attendance HTTP server on http://{}", config.bind_addr);
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("Could not listen for shutdown signal: {}", err);
            }
        })
        .await?;

    cancel.cancel();
    for job in jobs {
        job.await?;
    }
    Ok(())
}
