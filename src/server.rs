use crate::chat_relay::relay_chat;
use crate::config::RelayConfig;
use crate::io_struct::{ChatReqInput, HistoryResponse};
use crate::relay_state::RelayState;
use actix_web::http::header::{self, CACHE_CONTROL};
use actix_web::middleware::{DefaultHeaders, Logger};
use actix_web::{HttpResponse, HttpServer, get, guard, post, web};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::io::Write;

const BANNER: &str = "catchat relay is running (async mode)";

#[get("/")]
pub async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": BANNER }))
}

#[get("/cat")]
pub async fn cat(app_state: web::Data<RelayState>) -> HttpResponse {
    log::info!("cat requested, fetching one");
    HttpResponse::Ok().json(app_state.images.handle().await)
}

#[post("/chat")]
pub async fn chat(
    req: web::Json<ChatReqInput>,
    app_state: web::Data<RelayState>,
) -> Result<HttpResponse, actix_web::Error> {
    let turns = req.into_inner().into_history().ok_or_else(|| {
        actix_web::error::ErrorBadRequest("request body needs `history` or `message`")
    })?;

    let fragments = relay_chat(
        app_state.chat.clone(),
        app_state.history.clone(),
        turns,
    )
    .map(|text| Ok::<_, actix_web::Error>(Bytes::from(text)));

    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header((CACHE_CONTROL, "no-cache"))
        .streaming(fragments))
}

#[get("/history")]
pub async fn history(app_state: web::Data<RelayState>) -> HttpResponse {
    let entries = match app_state.history.list(app_state.history_limit).await {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("failed to read chat history: {}", e);
            Vec::new()
        }
    };
    HttpResponse::Ok().json(HistoryResponse { history: entries })
}

async fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

/// Permissive cross-origin headers for the browser client.
pub fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
}

/// Route table, shared by the server and the integration tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/{tail:.*}")
            .guard(guard::Options())
            .to(preflight),
    )
    .service(index)
    .service(cat)
    .service(chat)
    .service(history);
}

pub fn init_logging(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .try_init();
}

pub async fn startup(config: RelayConfig, relay_state: RelayState) -> std::io::Result<()> {
    let app_state = web::Data::new(relay_state);

    log::info!("Starting server at {}:{}", config.host, config.port);

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(cors_headers())
            .wrap(Logger::default())
            .app_data(app_state.clone())
            .configure(configure)
    })
    .bind((config.host, config.port))?
    .run()
    .await
}
