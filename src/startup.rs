use std::net::TcpListener;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::App;
use actix_web::HttpServer;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_actix_web::TracingLogger;

use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::context::ApplicationContext;
use crate::routes::health_check;
use crate::routes::upsert_vendor;

/// Wrapper for actix's `Server` with access to the bound port.
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(
        cfg: &Settings,
        context: Arc<ApplicationContext>,
    ) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let webhook_path = format!("/{}", cfg.application.webhook_path.trim_start_matches('/'));
        let server = run(listener, context, webhook_path).await?;
        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 { self.port }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new().connect_lazy_with(db_cfg.connection())
}

/// Declares the two HTTP surfaces of the system: the webhook
/// receiver and the vendor admin endpoint. Everything else runs as
/// background workers and schedulers driven directly from `main.rs`, outside
/// this server.
pub async fn run(
    listener: TcpListener,
    context: Arc<ApplicationContext>,
    webhook_path: String,
) -> Result<Server, anyhow::Error> {
    let context = web::Data::from(context);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .route(&webhook_path, web::post().to(crate::pipeline::receive_webhook))
            .route("/vendors", web::post().to(upsert_vendor))
            .app_data(context.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
