use axum::Router;
use liveqa::{AppState, db, qa};
use tower_http::cors::CorsLayer;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(30)));

    let db_pool = db::connect(dotenv::var("DATABASE_URL").expect("DATABASE_URL must be set").as_str())
        .await
        .expect("failed to open database");
    db::init_schema(&db_pool).await.expect("failed to initialize schema");

    let app_state = AppState {
        db_pool,
        bus: qa::bus::RoomBus::new(),
    };

    let app = Router::new()
        .nest("/live-qa", qa::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(CorsLayer::permissive());

    let addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind");
    tracing::info!(%addr, "live Q&A service listening");
    axum::serve(listener, app).await.expect("server error");
}
