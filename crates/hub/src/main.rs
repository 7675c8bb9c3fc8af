mod actuator;
mod config;
mod db;
mod history;
mod program;
mod scheduler;
mod sequencer;
mod state;
mod sun;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use scheduler::Scheduler;
use state::SystemState;
use sun::{SunriseSunsetApi, SunriseSunsetSource};
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = match env::var("WEB_PORT") {
        Ok(s) => s
            .parse()
            .with_context(|| format!("WEB_PORT is not a port number: {s:?}"))?,
        Err(_) => 8080,
    };

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed programs) ─────────────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let scheduler_config = cfg.scheduler_config()?;

    // The store is the source of truth; the file only seeds definitions.
    let programs = db.load_programs().await?;
    if programs.is_empty() {
        warn!("no irrigation programs in the database");
    }
    let running = programs.iter().filter(|p| p.run_state.is_running()).count();
    let rain_delay = db.get_rain_delay().await?;
    info!(
        programs = programs.len(),
        running,
        rain_delay = ?rain_delay,
        timezone = %scheduler_config.timezone,
        "db ready"
    );

    // ── Collaborators ───────────────────────────────────────────────
    let actuator = actuator::from_config(&cfg.actuator)?;

    let sun: Option<Arc<dyn SunriseSunsetSource>> = match &cfg.sunrise_sunset {
        Some(s) => {
            let api = SunriseSunsetApi::new(
                &s.url,
                s.latitude,
                s.longitude,
                scheduler_config.timezone.name(),
                Some(db.clone()),
            )
            .context("failed to build sunrise/sunset client")?;
            Some(Arc::new(api))
        }
        None => {
            info!("no [sunrise_sunset] section; default sunrise/sunset will be used");
            None
        }
    };

    // ── Shared state (ephemeral, for the status api) ────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
        timezone: scheduler_config.timezone,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("status api stopped: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler = Arc::new(
        Scheduler::new(
            Arc::new(db.clone()),
            sun,
            actuator,
            scheduler_config,
            shared,
        )
        .with_event_log(Arc::new(db)),
    );

    tokio::select! {
        _ = scheduler.run_forever() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
    }

    Ok(())
}
