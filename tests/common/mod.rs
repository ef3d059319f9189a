//! Local stand-ins for the image and chat providers

#![allow(dead_code)]

use std::io::Cursor;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use bytes::Bytes;
use catchat_relay::config::RelayConfig;
use catchat_relay::history::SharedHistoryStore;
use catchat_relay::io_struct::HistoryEntry;
use catchat_relay::relay_state::RelayState;
use futures::stream::{self, StreamExt};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const TEST_KEY: &str = "test-key";

/// An actix server on an ephemeral loopback port.
pub struct MockUpstream {
    pub base_url: String,
    handle: ServerHandle,
}

impl MockUpstream {
    /// `configure` receives the server's own base url so routes can point
    /// back at it.
    pub fn start<F>(configure: F) -> Self
    where
        F: Fn(&mut web::ServiceConfig, &str) + Send + Clone + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let base = base_url.clone();

        let server = HttpServer::new(move || {
            let configure = configure.clone();
            let base = base.clone();
            App::new().configure(move |cfg| configure(cfg, &base))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(server);
        Self { base_url, handle }
    }

    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    Bytes::from(buf.into_inner())
}

/// Image provider whose metadata names `image_ref` and which serves `png`
/// at `/cat/abc` and `/static/abs.png`.
pub fn image_provider(image_ref: &'static str, png: Bytes) -> MockUpstream {
    MockUpstream::start(move |cfg, base| {
        let reference = if image_ref.starts_with("ABS") {
            format!("{}/static/abs.png", base)
        } else {
            image_ref.to_string()
        };
        let png_a = png.clone();
        let png_b = png.clone();
        cfg.route(
            "/cat",
            web::get().to(move || {
                let reference = reference.clone();
                async move { HttpResponse::Ok().json(json!({ "_id": "abc", "url": reference })) }
            }),
        )
        .route(
            "/cat/abc",
            web::get().to(move || {
                let png = png_a.clone();
                async move { HttpResponse::Ok().content_type("image/png").body(png) }
            }),
        )
        .route(
            "/static/abs.png",
            web::get().to(move || {
                let png = png_b.clone();
                async move { HttpResponse::Ok().content_type("image/png").body(png) }
            }),
        );
    })
}

/// Scripted OpenAI-compatible chat provider.
pub struct ChatScript {
    pub fragments: Vec<String>,
    /// Abort the body after this many fragments.
    pub fail_after: Option<usize>,
    /// Keep emitting fragments until the client goes away.
    pub endless: bool,
    pub status: u16,
    pub requests: Mutex<Vec<Value>>,
    pub released: AtomicBool,
}

impl ChatScript {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            fail_after: None,
            endless: false,
            status: 200,
            requests: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn full_reply(&self) -> String {
        self.fragments.concat()
    }
}

struct ReleaseGuard(Arc<ChatScript>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.released.store(true, Ordering::SeqCst);
    }
}

fn sse_frame(text: &str) -> Bytes {
    let chunk = json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": null }]
    });
    Bytes::from(format!("data: {}\n\n", chunk))
}

async fn chat_completions(
    req: HttpRequest,
    body: web::Json<Value>,
    script: web::Data<ChatScript>,
) -> HttpResponse {
    let script = script.into_inner();
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TEST_KEY))
        .unwrap_or(false);
    if !authorized {
        return HttpResponse::Unauthorized().json(json!({ "error": "bad key" }));
    }

    let body = body.into_inner();
    script.requests.lock().push(body.clone());

    if script.status != 200 {
        return HttpResponse::build(
            actix_web::http::StatusCode::from_u16(script.status).unwrap(),
        )
        .json(json!({ "error": { "message": "provider overloaded" } }));
    }

    if !body["stream"].as_bool().unwrap_or(false) {
        return HttpResponse::Ok().json(json!({
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": script.full_reply() },
                "finish_reason": "stop"
            }]
        }));
    }

    if script.endless {
        let guard = ReleaseGuard(script.clone());
        let frames = stream::unfold(guard, |guard| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Some((Ok::<_, actix_web::Error>(sse_frame("tick ")), guard))
        });
        return HttpResponse::Ok()
            .content_type("text/event-stream")
            .streaming(frames);
    }

    let mut frames: Vec<Result<Bytes, actix_web::Error>> = Vec::new();
    // role-only opener, like real providers send
    frames.push(Ok(Bytes::from(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    )));
    for (i, text) in script.fragments.iter().enumerate() {
        if script.fail_after == Some(i) {
            frames.push(Err(actix_web::error::ErrorInternalServerError(
                "provider crashed",
            )));
            break;
        }
        frames.push(Ok(sse_frame(text)));
    }
    if script.fail_after.is_none() {
        frames.push(Ok(Bytes::from("data: [DONE]\n\n")));
    }

    let frames = stream::iter(frames).then(|frame| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        frame
    });
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(frames)
}

pub fn chat_provider(script: web::Data<ChatScript>) -> MockUpstream {
    MockUpstream::start(move |cfg, _| {
        cfg.app_data(script.clone())
            .route("/v1/chat/completions", web::post().to(chat_completions));
    })
}

pub fn test_config(image_base: &str, chat_base: &str) -> RelayConfig {
    RelayConfig {
        image_base_url: image_base.to_string(),
        image_timeout_secs: 1,
        chat_base_url: format!("{}/v1", chat_base),
        chat_timeout_secs: 5,
        api_key: Some(TEST_KEY.to_string()),
        transcode_workers: 2,
        ..RelayConfig::default()
    }
}

pub fn test_state(config: RelayConfig, store: SharedHistoryStore) -> RelayState {
    RelayState::with_history(config, store).unwrap()
}

/// Persistence runs after the body closes; give it a moment.
pub async fn wait_for_rows(store: &SharedHistoryStore, rows: usize) -> Vec<HistoryEntry> {
    for _ in 0..100 {
        let entries = store.list(100).await.unwrap();
        if entries.len() >= rows {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    store.list(100).await.unwrap()
}
