mod chat;
mod config;
mod error;
mod messages;
mod repository;
mod room;
mod server;
mod signaling;
mod store;
mod sweeper;
mod validation;

use std::sync::Arc;

use warp::Filter;

use config::ServerConfig;
use repository::InMemoryRepository;
use server::Server;
use store::RoomStore;
use sweeper::CleanupSweeper;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    if let Err(e) = config.validate() {
        log::error!("invalid configuration: {e}");
        std::process::exit(1);
    }
    let port = config.port;

    let store = Arc::new(RoomStore::new(config, InMemoryRepository::new()));
    let server = Server::new(Arc::clone(&store));
    CleanupSweeper::new(store).spawn();

    let ws_server = server.clone();
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = ws_server.clone();
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let health_server = server.clone();
    let health_route = warp::path("health").and(warp::get()).and_then(move || {
        let server = health_server.clone();
        async move {
            let stats = server.system_stats().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                "status": "ok",
                "active_rooms": stats.active_rooms,
                "total_participants": stats.total_participants,
            })))
        }
    });

    let routes = ws_route
        .or(health_route)
        .with(warp::cors().allow_any_origin());

    log::info!("roomcast listening on port {port}");
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}
