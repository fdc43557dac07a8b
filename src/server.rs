//! HTTP boundary for pollers.
//!
//! | Method | Path                   | Action                                   |
//! |--------|------------------------|------------------------------------------|
//! | POST   | `/get-entry-and-clean` | Read-and-clear one buffer topic          |
//! | DELETE | `/clean_database`      | Drop every buffered topic                |
//! | POST   | `/get-entry`           | Latest cached entry for a key            |
//! | GET    | `/status`              | Peer connection state                    |
//!
//! Buffer calls are blocking SQLite work and run on actix's blocking pool.

use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::buffer::AccumulationBuffer;
use crate::connection::PeerId;
use crate::error::RelayError;
use crate::table::NetworkTable;

/// Body of the topic lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRequest {
    /// Buffer topic or cache key.
    pub topic: String,
}

/// Drained buffer topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainResponse {
    /// Topic that was drained.
    pub topic: String,
    /// Everything appended since the last drain.
    pub value: String,
    /// Last append, ms since epoch.
    pub timestamp: i64,
}

/// Result of `DELETE /clean_database`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    /// Topics removed.
    pub cleared: usize,
}

/// Result of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// `true` while the peer socket is open.
    pub connected: bool,
    /// Open peers.
    pub connections: Vec<PeerId>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn not_found(topic: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorBody {
        error: "not_found",
        topic: Some(topic),
        message: None,
    })
}

fn storage_error(message: impl ToString) -> HttpResponse {
    let message = message.to_string();
    log::error!("[Http] Storage failure: {}", message);
    HttpResponse::InternalServerError().json(ErrorBody {
        error: "storage",
        topic: None,
        message: Some(message),
    })
}

async fn get_entry_and_clean(
    buffer: web::Data<AccumulationBuffer>,
    body: web::Json<TopicRequest>,
) -> impl Responder {
    let topic = body.into_inner().topic;
    let key = topic.clone();
    let buffer = buffer.into_inner();

    match web::block(move || buffer.take(&key)).await {
        Ok(Ok(Some(record))) => {
            log::debug!("[Http] Drained '{}'", topic);
            HttpResponse::Ok().json(DrainResponse {
                topic,
                value: record.accumulated,
                timestamp: record.updated_at.timestamp_millis(),
            })
        }
        Ok(Ok(None)) => not_found(&topic),
        Ok(Err(e)) => HttpResponse::from(e),
        Err(e) => storage_error(e),
    }
}

async fn clean_database(buffer: web::Data<AccumulationBuffer>) -> impl Responder {
    let buffer = buffer.into_inner();
    match web::block(move || buffer.clear_all()).await {
        Ok(Ok(cleared)) => HttpResponse::Ok().json(ClearResponse { cleared }),
        Ok(Err(e)) => HttpResponse::from(e),
        Err(e) => storage_error(e),
    }
}

async fn get_entry(table: web::Data<NetworkTable>, body: web::Json<TopicRequest>) -> impl Responder {
    match table.get_entry(&body.topic) {
        Some(entry) => HttpResponse::Ok().json(entry),
        None => not_found(&body.topic),
    }
}

async fn status(table: web::Data<NetworkTable>) -> impl Responder {
    HttpResponse::Ok().json(StatusResponse {
        connected: table.is_connected(),
        connections: table.get_connections(),
    })
}

/// Register the relay routes on an app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/get-entry-and-clean", web::post().to(get_entry_and_clean))
        .route("/clean_database", web::delete().to(clean_database))
        .route("/get-entry", web::post().to(get_entry))
        .route("/status", web::get().to(status));
}

/// Bind the HTTP server on `host:port`. The returned server is not yet running.
pub fn build_server(
    table: Arc<NetworkTable>,
    buffer: Arc<AccumulationBuffer>,
    host: &str,
    port: u16,
) -> Result<Server> {
    let table = web::Data::from(table);
    let buffer = web::Data::from(buffer);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(table.clone())
            .app_data(buffer.clone())
            .configure(configure)
    })
    .bind((host, port))
    .with_context(|| format!("Failed to bind HTTP server on {host}:{port}"))?
    .run();

    log::info!("[Http] Listening on {}:{}", host, port);
    Ok(server)
}

impl From<RelayError> for HttpResponse {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Storage(msg) => storage_error(msg),
            other => HttpResponse::InternalServerError().json(ErrorBody {
                error: "internal",
                topic: None,
                message: Some(other.to_string()),
            }),
        }
    }
}
