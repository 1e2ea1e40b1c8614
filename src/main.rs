use std::io::stdout;

use actix_web::{web, App, HttpServer};
use structured_logger::{json::new_writer, Builder};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

mod api;
mod conf;
mod context;
mod error;
mod events;
mod limiter;
mod redis;
mod runner;
mod scripts;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = conf::Conf::new().unwrap_or_else(|err| panic!("config error: {}", err));

    Builder::with_level(cfg.log.level.as_str())
        // one JSON record per request goes to the "api" target
        .with_target_writer("api", new_writer(stdout()))
        .init();

    log::debug!("{:?}", cfg);

    let pool = web::Data::new(
        redis::new(cfg.redis)
            .await
            .unwrap_or_else(|err| panic!("redis connection pool error: {}", err)),
    );

    let registry = scripts::ScriptRegistry::load(&cfg.scripts.dir)
        .unwrap_or_else(|err| panic!("script registry error: {}", err));

    let shutdown = CancellationToken::new();
    let limiter = web::Data::new(limiter::Limiter::new(
        pool.get_ref().clone(),
        registry,
        shutdown.clone(),
    ));

    // non-fatal: the runner heals the digest cache on first use
    limiter.preload_scripts().await;

    let bus = web::Data::new(events::Broadcast::new(
        pool.get_ref().clone(),
        cfg.events.channel.clone(),
    ));

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(api::AppInfo {
                name: APP_NAME.to_string(),
                version: APP_VERSION.to_string(),
            }))
            .app_data(pool.clone())
            .app_data(limiter.clone())
            .app_data(bus.clone())
            .wrap(context::ContextTransform {})
            .service(
                web::resource("/ratelimit")
                    .route(web::post().to(api::post_check))
                    .route(web::delete().to(api::delete_bucket)),
            )
            .service(
                web::resource("/ratelimit/fixed").route(web::post().to(api::post_fixed_window)),
            )
            .service(web::resource("/quota").route(web::get().to(api::get_quota)))
            .service(web::resource("/keys").route(web::get().to(api::get_keys)))
            .route("/version", web::get().to(api::version))
    })
    .workers(cfg.server.workers as usize)
    .keep_alive(Duration::from_secs(25))
    .shutdown_timeout(10);

    // cancel while the server is still draining, so decisions awaiting a
    // store round-trip at shutdown time fail with Cancelled instead of
    // being retried
    let cancel_on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => cancel_on_signal.cancel(),
            Err(err) => log::error!("shutdown signal listener failed: {}", err),
        }
    });

    log::info!("redquota service start at 0.0.0.0:{}", cfg.server.port);
    server.bind(("0.0.0.0", cfg.server.port))?.run().await?;

    // backstop for exits that never saw a signal
    shutdown.cancel();
    log::info!("redquota service shutdown gracefully");

    Ok(())
}
