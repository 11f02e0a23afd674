use std::convert::Infallible;
use std::sync::Arc;

use futures::{StreamExt, future};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;
use warp::Filter;

use crate::messaging::{Broker, PROGRESS_TOPIC};
use crate::models::JobProgress;

#[derive(Debug, Deserialize)]
struct ProgressQuery {
  node_id: Uuid,
}

fn with_progress(
  progress: Arc<Broker<JobProgress>>,
) -> impl Filter<Extract = (Arc<Broker<JobProgress>>,), Error = Infallible> + Clone {
  warp::any().map(move || progress.clone())
}

pub fn sse_route(
  progress: Arc<Broker<JobProgress>>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<ProgressQuery>())
    .and(with_progress(progress))
    .map(handle_sse)
}

fn handle_sse(query: ProgressQuery, progress: Arc<Broker<JobProgress>>) -> impl warp::Reply {
  let node_id = query.node_id;
  let stream = ReceiverStream::new(progress.subscribe(PROGRESS_TOPIC))
    .filter(move |update| future::ready(update.node_id == node_id))
    .map(|update| warp::sse::Event::default().event("progress").json_data(update));

  warp::sse::reply(warp::sse::keep_alive().stream(stream))
}
