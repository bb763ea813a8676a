use std::sync::Arc;

use once_cell::sync::Lazy;
use sqlx::Connection;
use sqlx::Executor;
use sqlx::PgConnection;
use sqlx::PgPool;
use uuid::Uuid;
use wiremock::MockServer;

use invoice_agent::configuration::get_configuration;
use invoice_agent::configuration::DatabaseSettings;
use invoice_agent::context::ApplicationContext;
use invoice_agent::startup::get_connection_pool;
use invoice_agent::startup::Application;
use invoice_agent::telemetry::get_subscriber;
use invoice_agent::telemetry::init_subscriber;

static TRACING: Lazy<()> = Lazy::new(|| {
    match std::env::var("TEST_LOG") {
        Ok(_) => init_subscriber(get_subscriber("test", "debug", std::io::stdout)),
        Err(_) => init_subscriber(get_subscriber("test", "debug", std::io::sink)),
    };
});

/// A running instance of the system under test: HTTP server on a randomised
/// port, a dedicated Postgres database, and mock servers standing in for the
/// three outbound collaborators (mail provider, extractor, notification sink).
pub struct TestApp {
    pub addr: String,
    pub port: u16,
    pub pool: PgPool,
    pub context: Arc<ApplicationContext>,
    pub mail_server: MockServer,
    pub extractor_server: MockServer,
    pub chat_server: MockServer,
}

impl TestApp {
    pub async fn post_webhook(
        &self,
        body: serde_json::Value,
    ) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/hooks/mail", self.addr))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn get_validation_handshake(
        &self,
        token: &str,
    ) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/hooks/mail?validationToken={}", self.addr, token))
            .send()
            .await
            .unwrap()
    }

    pub async fn post_vendor(
        &self,
        body: serde_json::Value,
    ) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/vendors", self.addr))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

async fn configure_database(cfg: &DatabaseSettings) -> PgPool {
    let mut conn = PgConnection::connect_with(&cfg.connection_without_db())
        .await
        .expect("postgres must be running; run scripts/init_db.sh");

    conn.execute(format!(r#"CREATE DATABASE "{}";"#, cfg.database_name).as_str())
        .await
        .unwrap();

    let pool = PgPool::connect_with(cfg.connection()).await.unwrap();
    sqlx::migrate!().run(&pool).await.expect("failed to migrate");
    pool
}

pub async fn spawn_app() -> TestApp {
    Lazy::force(&TRACING);

    let mail_server = MockServer::start().await;
    let extractor_server = MockServer::start().await;
    let chat_server = MockServer::start().await;

    let cfg = {
        let mut cfg = get_configuration().unwrap();
        cfg.database.database_name = Uuid::new_v4().to_string();
        cfg.application.port = 0;
        cfg.mail_client.base_url = mail_server.uri();
        cfg.extractor.base_url = extractor_server.uri();
        cfg.notification_sink.webhook_url = format!("{}/chat", chat_server.uri());
        cfg.poller.enabled = false;
        cfg
    };

    configure_database(&cfg.database).await;

    let pool = get_connection_pool(&cfg.database);
    let context = Arc::new(ApplicationContext::build(cfg.clone(), pool.clone()));

    let application = Application::build(&cfg, context.clone()).await.unwrap();
    let port = application.get_port();
    let addr = format!("http://127.0.0.1:{port}");

    tokio::spawn(application.run_until_stopped());

    TestApp { addr, port, pool, context, mail_server, extractor_server, chat_server }
}
