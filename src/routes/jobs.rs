use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::ledger::JobLedger;
use crate::messaging::{Broker, NEW_JOB_TOPIC};
use crate::models::Job;

#[derive(Debug, Deserialize)]
pub struct NewJob {
  pub node_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
  pub node_id: Uuid,
  pub status: String,
  pub sse_url: String,
}

#[derive(Debug)]
struct LedgerUnavailable;
impl warp::reject::Reject for LedgerUnavailable {}

fn with_events(events: Arc<Broker<Job>>) -> impl Filter<Extract = (Arc<Broker<Job>>,), Error = Infallible> + Clone {
  warp::any().map(move || events.clone())
}

fn with_ledger(ledger: Arc<dyn JobLedger>) -> impl Filter<Extract = (Arc<dyn JobLedger>,), Error = Infallible> + Clone {
  warp::any().map(move || ledger.clone())
}

pub fn submit_route(events: Arc<Broker<Job>>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("jobs")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_events(events))
    .and_then(handle_submit)
}

pub fn status_route(ledger: Arc<dyn JobLedger>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("jobs" / Uuid)
    .and(warp::get())
    .and(with_ledger(ledger))
    .and_then(handle_status)
}

async fn handle_submit(new_job: NewJob, events: Arc<Broker<Job>>) -> Result<impl Reply, Rejection> {
  events.publish(NEW_JOB_TOPIC, Job { node_id: new_job.node_id });
  info!(node_id = %new_job.node_id, "Job submitted");

  let response = JobResponse {
    node_id: new_job.node_id,
    status: "submitted".into(),
    sse_url: format!("/sse?node_id={}", new_job.node_id),
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::ACCEPTED))
}

async fn handle_status(node_id: Uuid, ledger: Arc<dyn JobLedger>) -> Result<impl Reply, Rejection> {
  match ledger.find(node_id).await {
    Ok(Some(record)) => Ok(warp::reply::json(&record)),
    Ok(None) => Err(warp::reject::not_found()),
    Err(e) => {
      error!(%node_id, "Ledger lookup failed: {e:#}");
      Err(warp::reject::custom(LedgerUnavailable))
    }
  }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (code, message) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found")
  } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
    (StatusCode::BAD_REQUEST, "invalid request body")
  } else if err.find::<warp::reject::InvalidQuery>().is_some() {
    (StatusCode::BAD_REQUEST, "invalid query")
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
  } else if err.find::<LedgerUnavailable>().is_some() {
    (StatusCode::SERVICE_UNAVAILABLE, "job ledger unavailable")
  } else {
    error!("Unhandled rejection: {err:?}");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), code))
}
