use std::collections::HashMap;
use std::sync::Arc;

use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use teleprompter_proto::Role;

use crate::{client_connection, Relay, RelayConfig, RelayStatus};

const FALLBACK_TEXT: &str = "Teleprompter WebSocket Server";

const NOT_FOUND_HTML: &str = "<html>
<head><title>404 Not Found</title></head>
<body>
<h1>404 - File Not Found</h1>
<ul><li>display.html</li><li>controller.html</li></ul>
</body>
</html>";

type BoxedReply = Box<dyn Reply>;

/// Every route served on the relay's port: the WebSocket upgrade on any path
/// (`?type=controller|display`), `/`, `/healthz`, `/status`, and either static
/// files (local mode) or a plain text fallback (production).
pub fn routes(
    relay: Arc<Relay>,
    config: &RelayConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static {
    let with_relay = warp::any().map(move || relay.clone());

    let heartbeat = config.heartbeat;
    let ws = warp::ws()
        .and(warp::query::<HashMap<String, String>>())
        .and(with_relay.clone())
        .map(move |ws: warp::ws::Ws, q: HashMap<String, String>, relay: Arc<Relay>| {
            let role = Role::from_query(&q);
            Box::new(ws.on_upgrade(move |socket| {
                client_connection(socket, role, relay, heartbeat)
            })) as BoxedReply
        });

    let server_name = config.server_name.clone();
    let port = config.listen.port();
    let index = warp::path::end()
        .and(warp::get())
        .and(with_relay.clone())
        .then(move |relay: Arc<Relay>| {
            let server_name = server_name.clone();
            async move {
                let status = relay.status().await;
                Box::new(warp::reply::html(status_page(&server_name, port, &status))) as BoxedReply
            }
        });

    let healthz = warp::path!("healthz").map(|| Box::new("ok") as BoxedReply);

    let status = warp::path!("status")
        .and(warp::get())
        .and(with_relay)
        .then(|relay: Arc<Relay>| async move {
            Box::new(warp::reply::json(&relay.status().await)) as BoxedReply
        });

    let fallback: BoxedFilter<(BoxedReply,)> = match config.static_root() {
        Some(dir) => warp::fs::dir(dir.to_path_buf())
            .map(|file: warp::filters::fs::File| Box::new(file) as BoxedReply)
            .or(warp::any().map(|| {
                Box::new(warp::reply::with_status(
                    warp::reply::html(NOT_FOUND_HTML),
                    StatusCode::NOT_FOUND,
                )) as BoxedReply
            }))
            .unify()
            .boxed(),
        None => warp::any()
            .map(|| Box::new(FALLBACK_TEXT) as BoxedReply)
            .boxed(),
    };

    ws.or(index)
        .unify()
        .or(healthz)
        .unify()
        .or(status)
        .unify()
        .or(fallback)
        .unify()
        .with(warp::cors().allow_any_origin())
        .with(warp::log("teleprompter_relay"))
}

fn status_page(server_name: &str, port: u16, status: &RelayStatus) -> String {
    format!(
        "<html>
<head><title>Teleprompter WebSocket Server</title></head>
<body>
<h1>Teleprompter WebSocket Server is Running</h1>
<p>Server: {server_name}</p>
<p>Port: {port}</p>
<p>Status: Connected clients: {}</p>
</body>
</html>",
        status.connected_roles()
    )
}
