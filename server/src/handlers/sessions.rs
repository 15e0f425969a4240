use actix_web::{error, web, HttpResponse, Responder, Result};
use mindmap_system::{GraphRepository, SessionId};
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::server::{LookupError, ServerCommand, ServerTx};

pub fn configure_session_handlers(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/sessions")
            .service(
                web::resource("")
                    .name("sessions")
                    .route(web::get().to(list_sessions))
                    .route(web::post().to(create_session)),
            )
            .service(
                web::resource("/{session_id}")
                    .name("session")
                    .route(web::get().to(show_session)),
            ),
    );
}

#[derive(Deserialize)]
pub struct CreateSessionForm {
    #[serde(default)]
    title: String,
}

async fn list_sessions(repository: web::Data<dyn GraphRepository>) -> Result<impl Responder> {
    let repository = repository.into_inner();
    let sessions = web::block(move || repository.sessions())
        .await
        .map_err(error::ErrorInternalServerError)?
        .map_err(error::ErrorInternalServerError)?;
    Ok(HttpResponse::Ok().json(sessions))
}

async fn create_session(
    repository: web::Data<dyn GraphRepository>,
    form: web::Json<CreateSessionForm>,
) -> Result<impl Responder> {
    let title = form.into_inner().title.trim().to_string();
    if title.is_empty() {
        return Err(error::ErrorBadRequest("title must not be blank"));
    }
    let repository = repository.into_inner();
    let meta = web::block(move || repository.create_session(&title))
        .await
        .map_err(error::ErrorInternalServerError)?
        .map_err(error::ErrorInternalServerError)?;
    log::info!("Created session {} over HTTP", meta.id);
    Ok(HttpResponse::Created().json(meta))
}

async fn show_session(
    path: web::Path<SessionId>,
    srv_tx: web::Data<ServerTx>,
) -> Result<impl Responder> {
    let session_id = path.into_inner();
    let (tx, rx) = oneshot::channel();
    srv_tx
        .send(ServerCommand::DescribeSession { session_id, tx })
        .await
        .map_err(error::ErrorServiceUnavailable)?;
    match rx.await.map_err(error::ErrorServiceUnavailable)? {
        Ok(description) => Ok(HttpResponse::Ok().json(description)),
        Err(err @ LookupError::NotFound(_)) => Err(error::ErrorNotFound(err)),
        Err(err) => Err(error::ErrorInternalServerError(err)),
    }
}
