use crate::build::events::BuildEvent;
use crate::dev::watch::ReloadSink;
use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::path::Path;
use tokio::sync::broadcast;
use tower_http::services::ServeDir;

pub const LIVERELOAD_PATH: &str = "/__livereload";
pub const CLIENT_PATH: &str = "/__livereload.js";
const CLIENT_TAG: &str = r#"<script src="/__livereload.js"></script>"#;

const CLIENT_SCRIPT: &str = r#"(function () {
  var protocol = location.protocol === 'https:' ? 'wss:' : 'ws:';
  function connect() {
    var ws = new WebSocket(protocol + '//' + location.host + '/__livereload');
    ws.onmessage = function (e) {
      var event = JSON.parse(e.data);
      if (event.type === 'Reload') {
        location.reload();
      } else if (event.type === 'StageEnd' && !event.ok) {
        console.error('[kiln] 阶段 ' + event.stage + ' 失败：' + event.error);
      } else if (event.type === 'Failed') {
        console.error('[kiln] 构建失败：' + event.error);
      }
    };
    ws.onclose = function () {
      setTimeout(connect, 1000);
    };
  }
  connect();
})();
"#;

/// 热重载通知端：向所有已连接页面广播构建事件
#[derive(Clone)]
pub struct LiveReload {
    events: broadcast::Sender<BuildEvent>,
}

impl LiveReload {
    pub fn new(events: broadcast::Sender<BuildEvent>) -> Self {
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }
}

impl ReloadSink for LiveReload {
    fn notify_reload(&self) {
        let clients = self.events.send(BuildEvent::Reload).unwrap_or(0);
        tracing::info!("已通知 {clients} 个连接刷新页面");
    }
}

/// 开发服务器路由：静态文件 + 热重载端点
pub fn router(site_root: &Path, live: LiveReload) -> Router {
    Router::new()
        .route(LIVERELOAD_PATH, get(livereload_ws))
        .route(CLIENT_PATH, get(client_script))
        .fallback_service(ServeDir::new(site_root))
        .layer(middleware::from_fn(inject_client))
        .with_state(live)
}

async fn livereload_ws(ws: WebSocketUpgrade, State(live): State<LiveReload>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, live))
}

async fn handle_ws(mut socket: WebSocket, live: LiveReload) {
    let mut rx = live.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("热重载连接落后，丢弃 {skipped} 个事件");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let json = serde_json::to_string(&event).unwrap_or_default();
        if socket.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

async fn client_script() -> impl IntoResponse {
    ([(CONTENT_TYPE, "application/javascript; charset=utf-8")], CLIENT_SCRIPT)
}

/// 在 HTML 响应中注入热重载脚本，磁盘上的文件不变
async fn inject_client(req: Request, next: Next) -> Response {
    let response = next.run(req).await;
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/html"));
    if response.status() != StatusCode::OK || !is_html {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("读取响应失败：{e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let html = inject_script(&String::from_utf8_lossy(&bytes));
    parts.headers.remove(CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(html))
}

/// 插入到最后一个 `</body>` 之前，没有时追加到末尾
pub fn inject_script(html: &str) -> String {
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(pos) => format!("{}{CLIENT_TAG}{}", &html[..pos], &html[pos..]),
        None => format!("{html}{CLIENT_TAG}"),
    }
}
