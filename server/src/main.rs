use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{http, web, App, HttpServer};
use clap::Parser;

use mindmap_system::{GraphRepository, MemoryRepository};
use mindmap_server::config::ServerConfig;
use mindmap_server::connection::ConnectionIdSource;
use mindmap_server::handlers;
use mindmap_server::server::spawn_server;
use mindmap_server::session_file::FileRepository;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();

    let repository: Arc<dyn GraphRepository> = match &config.data_dir {
        Some(dir) => Arc::new(
            FileRepository::open(dir)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?,
        ),
        None => {
            log::info!("No data directory configured, sessions live in memory");
            Arc::new(MemoryRepository::new())
        }
    };

    let srv_tx = spawn_server(repository.clone(), config.engine());
    let ids = web::Data::new(ConnectionIdSource::default());
    let transport = web::Data::new(config.transport());
    let repository: web::Data<dyn GraphRepository> = web::Data::from(repository);
    let allowed_origins = config.allowed_origins();

    log::info!("Listening on {}", config.bind);
    HttpServer::new(move || {
        let cors = allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![http::header::CONTENT_TYPE, http::header::ACCEPT])
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(srv_tx.clone()))
            .app_data(ids.clone())
            .app_data(transport.clone())
            .app_data(repository.clone())
            .configure(handlers::root)
    })
    .bind(config.bind.as_str())?
    .run()
    .await
}
