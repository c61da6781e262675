//! HTTP boundary
//!
//! Client routes (submission, balances, history) and the peer routes used by
//! the confirmation protocol share one actix-web server.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /transactions` | submit `{to, amount}` from the system account |
//! | `GET /transactions` | system account history |
//! | `POST /transactions/confirm/request` | peer vote request |
//! | `POST /transactions/confirm` | peer finalize call |
//! | `GET /accounts/{id}` | balance and recent history |
//! | `GET /balance` | system account summary |
//! | `GET /nodes` | local peer listing |
//! | `POST /terminate` | stop the sync loop |
//! | `GET /health`, `GET /metrics` | liveness, Prometheus text |

use crate::{
    node::Node,
    peers::{FINALIZE_PATH, NODES_PATH, VOTE_REQUEST_PATH},
    sync::WaitOutcome,
    types::{AccountId, Transaction},
    Error, Result,
};
use actix_web::{dev::Server, error::ResponseError, http::StatusCode, web, App, HttpResponse, HttpServer};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::InsufficientBalance { .. } | Error::InvalidTransaction(_) | Error::FieldMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            Error::PeerUnreachable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }))
    }
}

/// Body of `POST /transactions`
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Receiver
    pub to: Option<String>,
    /// Amount, as a JSON number or decimal string
    pub amount: Option<Value>,
}

impl SubmitRequest {
    fn parse(self) -> Result<(AccountId, Decimal)> {
        let to = match self.to {
            Some(to) if !to.trim().is_empty() => AccountId::new(to.trim()),
            _ => return Err(Error::InvalidTransaction("'to' should be specified".to_string())),
        };

        let amount = match self.amount {
            Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).ok(),
            Some(Value::String(s)) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        }
        .ok_or_else(|| Error::InvalidTransaction("'amount' should be a decimal number".to_string()))?;

        Ok((to, amount))
    }
}

/// Query of `POST /transactions`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQuery {
    /// Block until persisted, for at most this many milliseconds
    pub wait_ms: Option<u64>,
}

/// Health check endpoint
pub async fn health_check(node: web::Data<Node>) -> HttpResponse {
    let state = node.state();
    HttpResponse::Ok().json(json!({
        "status": if state.is_running() { "healthy" } else { "stopping" },
        "service": state.config().service_name,
        "version": state.config().service_version,
        "node": state.node_id(),
        "queued": node.queue().len(),
    }))
}

/// Submit a transfer from the system account
pub async fn submit_transaction(
    node: web::Data<Node>,
    query: web::Query<SubmitQuery>,
    request: web::Json<SubmitRequest>,
) -> Result<HttpResponse> {
    let (to, amount) = request.into_inner().parse()?;
    let tx = node.submit(to, amount)?;

    let Some(wait_ms) = query.wait_ms else {
        return Ok(HttpResponse::Ok().json(tx));
    };

    match node
        .engine()
        .wait_for_confirmation(&[tx.id], Duration::from_millis(wait_ms))
        .await?
    {
        WaitOutcome::Confirmed => {
            let persisted = node.ledger().transaction(tx.id)?.ok_or(Error::TransactionNotFound(tx.id))?;
            Ok(HttpResponse::Ok().json(persisted))
        }
        WaitOutcome::TimedOut { .. } => Ok(HttpResponse::Accepted().json(tx)),
    }
}

/// System account history
pub async fn list_transactions(node: web::Data<Node>) -> Result<HttpResponse> {
    let history = node.system_history()?;
    Ok(HttpResponse::Ok().json(history))
}

/// Vote request from a peer running a confirmation round
pub async fn request_confirmation(
    node: web::Data<Node>,
    batch: web::Json<Vec<Transaction>>,
) -> Result<HttpResponse> {
    let response = node.handle_vote_request(batch.into_inner())?;
    Ok(HttpResponse::Ok().json(response))
}

/// Finalize call from a peer whose round reached quorum
pub async fn confirm(node: web::Data<Node>, batch: web::Json<Vec<Transaction>>) -> Result<HttpResponse> {
    let report = node.handle_finalize(batch.into_inner()).await?;
    Ok(HttpResponse::Ok().json(report))
}

/// Balance and recent transactions of one account
pub async fn get_account(node: web::Data<Node>, id: web::Path<String>) -> Result<HttpResponse> {
    let summary = node.account(&AccountId::new(id.into_inner()))?;
    Ok(HttpResponse::Ok().json(summary))
}

/// System account balance and recent transactions
pub async fn get_balance(node: web::Data<Node>) -> Result<HttpResponse> {
    let summary = node.account(&AccountId::system())?;
    Ok(HttpResponse::Ok().json(summary))
}

/// Local peer listing
pub async fn list_nodes(node: web::Data<Node>) -> HttpResponse {
    HttpResponse::Ok().json(node.listing())
}

/// Stop the sync loop; the server follows once the loop exits
pub async fn terminate(node: web::Data<Node>) -> HttpResponse {
    node.stop();
    HttpResponse::Ok().json(json!({ "status": "terminating" }))
}

/// Prometheus metrics
pub async fn metrics(node: web::Data<Node>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(node.metrics().render())
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics))
        .service(
            web::resource("/transactions")
                .route(web::post().to(submit_transaction))
                .route(web::get().to(list_transactions)),
        )
        .route(VOTE_REQUEST_PATH, web::post().to(request_confirmation))
        .route(FINALIZE_PATH, web::post().to(confirm))
        .route("/accounts/{id}", web::get().to(get_account))
        .route("/balance", web::get().to(get_balance))
        .route(NODES_PATH, web::get().to(list_nodes))
        .route("/terminate", web::post().to(terminate));
}

/// Bind the HTTP server on the node's listen address
///
/// The returned server must be awaited to run.
pub fn build_server(node: Node) -> std::io::Result<Server> {
    let addr = node.state().config().node.listen_addr();
    let data = web::Data::new(node);

    tracing::info!(%addr, "HTTP server listening");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(16 * 1024 * 1024))
            .configure(configure_routes)
    })
    .bind(&addr)?
    .disable_signals()
    .run();

    Ok(server)
}
