use actix_web::{middleware::Compress, web, App, HttpResponse, HttpServer};
use actix_cors::Cors;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use craftfeed::auth::JwtKeys;
use craftfeed::config::Settings;
use craftfeed::openapi::ApiDoc;
use craftfeed::rate_limit::RateLimiter;
use craftfeed::storage::build_blob_store;
use craftfeed::store::DocumentStore;
use craftfeed::{configure_routes, AppState};

async fn render_metrics(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render())
}

async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn DocumentStore>> {
    #[cfg(feature = "postgres-store")]
    {
        if let Some(url) = &settings.database_url {
            use sqlx::postgres::PgPoolOptions;
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = craftfeed::store::pg::PgStore::new(pool);
            store.migrate().await?;
            info!("Using Postgres document store");
            return Ok(Arc::new(store));
        }
    }

    #[cfg(feature = "inmem-store")]
    {
        let store = match &settings.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                info!("Using in-memory document store persisted under {}", dir.display());
                craftfeed::store::inmem::InMemStore::with_snapshot_dir(dir)
            }
            None => {
                info!("Using volatile in-memory document store");
                craftfeed::store::inmem::InMemStore::new()
            }
        };
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "inmem-store"))]
    {
        return Err(anyhow::anyhow!("DATABASE_URL must be set when built without `inmem-store`"));
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let settings = Settings::from_env()?;
    info!("Bootstrapping craftfeed (comment layout {:?})", settings.comment_layout);

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    let store = open_store(&settings).await?;
    let blobs = build_blob_store(&settings.s3).await?;
    let state = AppState::new(
        store,
        blobs,
        settings.comment_layout,
        settings.feed.clone(),
        RateLimiter::new(settings.rate_limit.clone()),
    );
    let keys = JwtKeys::new(settings.jwt_secret.clone());
    let openapi = ApiDoc::openapi();

    let frontend = std::env::var("FRONTEND_URL").ok();
    let server = HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allow_any_header()
            .allowed_methods(["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
            .supports_credentials()
            .max_age(3600);
        if let Some(front) = &frontend {
            cors = cors.allowed_origin(front);
        }

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(keys.clone()))
            .app_data(web::Data::new(prometheus.clone()))
            .configure(configure_routes)
            .route("/metrics", web::get().to(render_metrics))
            .service(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(settings.listen_addr())?;

    let (host, port) = settings.listen_addr();
    info!("Listening on http://{host}:{port}");
    server.run().await?;
    Ok(())
}
