use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::auth::{self, Auth};
use crate::broker::BrokerConsumer;
use crate::event::{Event, WireEvent, SYS_SESSION_CREATED, SYS_SESSION_SUBSCRIBED, SYS_SESSION_UNSUBSCRIBED};
use crate::peer::{append_forwarded_for, PeerForwarder};
use crate::registry::SessionRegistry;
use crate::router::EventRouter;
use crate::subscription::SubscriptionIndex;
use crate::topic::TopicFilter;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Characters a filter segment needs escaped when rebuilt into a forwarded
/// request path. `/` is deliberately left untouched since it separates
/// filter segments; `#` and `+` must be escaped because a literal `#` can
/// never appear in a request path (it is the URI fragment delimiter) and a
/// literal `+` is ambiguous with the query-string space encoding.
const FILTER_PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'#')
    .add(b'+')
    .add(b'%')
    .add(b'?')
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// Everything an ingress handler needs, threaded through to each route via
/// `Filter::and`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub subscriptions: Arc<SubscriptionIndex>,
    pub router: Arc<EventRouter>,
    pub auth: Arc<Auth>,
    pub peers: Option<Arc<PeerForwarder>>,
    pub broker: Option<Arc<BrokerConsumer>>,
}

/// Wraps the crate's error enum so it can travel through warp's rejection
/// machinery; `recover` is the single place that turns any rejection into a
/// response.
#[derive(Debug)]
struct ApiError(crate::error::PikavError);

impl warp::reject::Reject for ApiError {}

fn reject(error: impl Into<crate::error::PikavError>) -> Rejection {
    warp::reject::custom(ApiError(error.into()))
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    sse_route(state.clone())
        .or(sub_route(state.clone()))
        .or(unsub_route(state.clone()))
        .or(pub_route(state))
        .recover(recover)
}

fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn sse_route(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("sse")
        .and(warp::get())
        .and(with_state(state))
        .and_then(sse_handler)
}

fn sub_route(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::put()
        .and(warp::path("sub"))
        .and(warp::path::tail())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::header::optional::<String>(auth::SESSION_ID_HEADER))
        .and(warp::header::optional::<String>("x-pikav-forwarded-by"))
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(warp::filters::addr::remote())
        .and(with_state(state))
        .and_then(|tail, authz, session, forwarded_by, forwarded_for, remote, state| {
            subscription_handler(tail, authz, session, forwarded_by, forwarded_for, remote, state, true)
        })
}

fn unsub_route(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::put()
        .and(warp::path("unsub"))
        .and(warp::path::tail())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::header::optional::<String>(auth::SESSION_ID_HEADER))
        .and(warp::header::optional::<String>("x-pikav-forwarded-by"))
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(warp::filters::addr::remote())
        .and(with_state(state))
        .and_then(|tail, authz, session, forwarded_by, forwarded_for, remote, state| {
            subscription_handler(tail, authz, session, forwarded_by, forwarded_for, remote, state, false)
        })
}

fn pub_route(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::post()
        .and(warp::path("pub"))
        .and(warp::body::bytes())
        .and(warp::header::optional::<String>("x-pikav-forwarded-by"))
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(warp::filters::addr::remote())
        .and(with_state(state))
        .and_then(publish_handler)
}

/// Runs session cleanup on stream end (client disconnect or server
/// shutdown) by closing the registry entry when the stream this struct
/// owns is dropped.
struct SessionCleanupStream<S> {
    inner: S,
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl<S: Stream + Unpin> Stream for SessionCleanupStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for SessionCleanupStream<S> {
    fn drop(&mut self) {
        self.registry.close(&self.session_id);
    }
}

async fn sse_handler(state: AppState) -> Result<impl Reply, Rejection> {
    let (session, rx) = state.registry.open();

    let created = Event::system(SYS_SESSION_CREATED, json!(session.id()));
    session.send_frame(created.to_sse_payload());

    let session_id = session.id().to_string();
    let data_stream = ReceiverStream::new(rx).map(|payload| Ok::<_, Infallible>(warp::sse::Event::default().data(payload)));
    let guarded = SessionCleanupStream {
        inner: data_stream,
        registry: state.registry.clone(),
        session_id,
    };

    Ok(warp::sse::reply(
        warp::sse::keep_alive().interval(KEEP_ALIVE_INTERVAL).stream(guarded),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn subscription_handler(
    tail: warp::path::Tail,
    authorization: Option<String>,
    session_header: Option<String>,
    forwarded_by: Option<String>,
    forwarded_for: Option<String>,
    remote: Option<std::net::SocketAddr>,
    state: AppState,
    is_subscribe: bool,
) -> Result<impl Reply, Rejection> {
    let user_id = state
        .auth
        .user_id(authorization.as_deref())
        .await
        .map_err(reject)?;
    let session_id = auth::session_id(session_header.as_deref()).map_err(reject)?;

    let raw_filter = tail.as_str().trim_start_matches('/');
    let decoded_filter = percent_encoding::percent_decode_str(raw_filter)
        .decode_utf8()
        .map_err(|_| reject(crate::error::PikavError::Validation(
            "invalid percent-encoding in filter path".to_string(),
        )))?;
    let filter = TopicFilter::new(decoded_filter.as_ref()).map_err(reject)?;

    if is_subscribe {
        state.subscriptions.subscribe(&user_id, &session_id, filter.clone());
    } else {
        state.subscriptions.unsubscribe(&user_id, &session_id, &filter);
    }

    if forwarded_by.is_none() {
        if let Some(peers) = state.peers.clone() {
            let encoded_filter = utf8_percent_encode(filter.as_str(), FILTER_PATH_ENCODE_SET);
            let path = format!("/{}/{}", if is_subscribe { "sub" } else { "unsub" }, encoded_filter);
            let mut headers = HeaderMap::new();
            if let Some(authz) = &authorization {
                if let Ok(value) = HeaderValue::from_str(authz) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                headers.insert(HeaderName::from_static("x-pikav-session-id"), value);
            }
            let chain = remote.map(|addr| append_forwarded_for(forwarded_for.as_deref(), &addr.ip().to_string()));
            tokio::spawn(async move {
                peers.forward(Method::PUT, &path, Vec::new(), headers, chain).await;
            });
        }
        if let Some(broker) = state.broker.clone() {
            let name = if is_subscribe { SYS_SESSION_SUBSCRIBED } else { SYS_SESSION_UNSUBSCRIBED };
            let control = Event::session_control(&user_id, name, &session_id, filter.as_str());
            tokio::spawn(async move {
                if let Err(error) = broker.publish(&control).await {
                    tracing::warn!(%error, "failed to publish session control event to broker");
                }
            });
        }
    }

    Ok(success_reply(StatusCode::OK))
}

async fn publish_handler(
    body: Bytes,
    forwarded_by: Option<String>,
    forwarded_for: Option<String>,
    remote: Option<std::net::SocketAddr>,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let wire: WireEvent = serde_json::from_slice(&body)
        .map_err(|error| reject(crate::error::PikavError::Json(error)))?;
    let event = Event::try_from(wire).map_err(reject)?;

    state.router.dispatch(event.clone());

    if forwarded_by.is_none() {
        if let Some(peers) = state.peers.clone() {
            let body = body.to_vec();
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            let chain = remote.map(|addr| append_forwarded_for(forwarded_for.as_deref(), &addr.ip().to_string()));
            tokio::spawn(async move {
                peers.forward(Method::POST, "/pub", body, headers, chain).await;
            });
        }
        if let Some(broker) = state.broker.clone() {
            tokio::spawn(async move {
                if let Err(error) = broker.publish(&event).await {
                    tracing::warn!(%error, "failed to publish event to broker");
                }
            });
        }
    }

    Ok(success_reply(StatusCode::OK))
}

fn success_reply(status: StatusCode) -> impl Reply {
    warp::reply::with_status(warp::reply::json(&json!({"success": true})), status)
}

async fn recover(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let status = if rejection.is_not_found() {
        StatusCode::NOT_FOUND
    } else if let Some(ApiError(error)) = rejection.find() {
        error.status_code()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({"success": false})),
        status,
    ))
}
