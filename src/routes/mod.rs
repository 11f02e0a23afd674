use std::convert::Infallible;
use std::sync::Arc;

use warp::Filter;

use crate::ledger::JobLedger;
use crate::messaging::Broker;
use crate::models::{Job, JobProgress};

pub mod jobs;
pub mod sse;

pub fn routes(
  ledger: Arc<dyn JobLedger>,
  job_events: Arc<Broker<Job>>,
  progress: Arc<Broker<JobProgress>>,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  jobs::submit_route(job_events)
    .or(jobs::status_route(ledger))
    .or(sse::sse_route(progress))
    .recover(jobs::handle_rejection)
}
