//! The configuration API served to mesh nodes and operators.

use crate::store::Reader;
use futures::future;
use hyper::{Body, Method, Request, Response, StatusCode};
use mesh_controller_k8s_index::SharedIndex;
use serde_json::json;
use std::net::SocketAddr;
use tokio::time;
use tracing::info;

/// The port every mesh node serves its raw configuration on.
const NODE_API_PORT: u16 = 8080;

/// Budget for fetching a node's raw configuration.
const NODE_FETCH_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// How long in-flight requests get to finish on shutdown.
const SHUTDOWN_GRACE: time::Duration = time::Duration::from_secs(2);

pub(crate) async fn serve(
    addr: SocketAddr,
    store: Reader,
    index: SharedIndex,
    drain: drain::Watch,
) -> Result<(), hyper::Error> {
    let client = hyper::Client::new();
    let make_svc = hyper::service::make_service_fn(move |_conn| {
        let store = store.clone();
        let index = index.clone();
        let client = client.clone();
        future::ok::<_, hyper::Error>(hyper::service::service_fn(move |req| {
            handle(req, store.clone(), index.clone(), client.clone())
        }))
    });

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::pin! {
        let server = hyper::server::Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move { let _ = close_rx.await; });
    }

    info!(%addr, "configuration API listening");
    tokio::select! {
        res = (&mut server) => res,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            match handle.release_after(time::timeout(SHUTDOWN_GRACE, server)).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!("timed out waiting for connections to drain");
                    Ok(())
                }
            }
        }
    }
}

async fn handle(
    req: Request<Body>,
    store: Reader,
    index: SharedIndex,
    client: hyper::Client<hyper::client::HttpConnector>,
) -> Result<Response<Body>, hyper::Error> {
    match *req.method() {
        Method::GET | Method::HEAD => {}
        _ => return Ok(status(StatusCode::METHOD_NOT_ALLOWED)),
    }

    let path = req.uri().path().to_string();
    let rsp = match path.as_str() {
        "/api/configuration/current" => configuration(&store),
        "/api/topology/current" => topology(&store),
        "/api/status/readiness" => readiness(&store),
        "/api/status/nodes" => nodes(&index),
        _ => match path
            .strip_prefix("/api/status/node/")
            .and_then(|rest| rest.strip_suffix("/configuration"))
        {
            Some(name) => node_configuration(name, &index, &client).await,
            None => status(StatusCode::NOT_FOUND),
        },
    };
    Ok(rsp)
}

/// The document nodes poll. Empty with a 503 until the first successful
/// publish, so a node never acts on a partial view.
fn configuration(store: &Reader) -> Response<Body> {
    if !store.ready() {
        return status(StatusCode::SERVICE_UNAVAILABLE);
    }
    match store.published() {
        Some(published) => json_response(&*published.configuration),
        None => status(StatusCode::SERVICE_UNAVAILABLE),
    }
}

fn topology(store: &Reader) -> Response<Body> {
    match store.published() {
        Some(published) => json_response(&*published.topology),
        None => status(StatusCode::SERVICE_UNAVAILABLE),
    }
}

fn readiness(store: &Reader) -> Response<Body> {
    if store.ready() {
        text_response(StatusCode::OK, "ready\n")
    } else {
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
    }
}

fn nodes(index: &SharedIndex) -> Response<Body> {
    let nodes: Vec<serde_json::Value> = index
        .read()
        .proxy_nodes()
        .into_iter()
        .map(|node| json!({ "name": node.name, "ip": node.ip, "ready": node.ready }))
        .collect();
    json_response(&nodes)
}

/// Reverse-proxies a node's raw configuration for debugging.
async fn node_configuration(
    name: &str,
    index: &SharedIndex,
    client: &hyper::Client<hyper::client::HttpConnector>,
) -> Response<Body> {
    let node = index
        .read()
        .proxy_nodes()
        .into_iter()
        .find(|node| node.name == name);
    let ip = match node {
        Some(node) => match node.ip {
            Some(ip) => ip,
            None => return status(StatusCode::BAD_GATEWAY),
        },
        None => return status(StatusCode::NOT_FOUND),
    };

    let uri = match format!("http://{}:{}/api/rawdata", ip, NODE_API_PORT).parse() {
        Ok(uri) => uri,
        Err(_) => return status(StatusCode::BAD_GATEWAY),
    };
    match time::timeout(NODE_FETCH_TIMEOUT, fetch(client, uri)).await {
        Ok(Ok(rsp)) => rsp,
        Ok(Err(error)) => {
            tracing::warn!(%error, node = %name, "failed to fetch node configuration");
            status(StatusCode::BAD_GATEWAY)
        }
        Err(_) => {
            tracing::warn!(node = %name, "timed out fetching node configuration");
            status(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn fetch(
    client: &hyper::Client<hyper::client::HttpConnector>,
    uri: hyper::Uri,
) -> Result<Response<Body>, hyper::Error> {
    let upstream = client.get(uri).await?;
    let code = upstream.status();
    let bytes = hyper::body::to_bytes(upstream.into_body()).await?;
    Ok(Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap())
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap(),
        Err(error) => {
            tracing::error!(%error, "failed to serialize response");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn text_response(code: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .unwrap()
}

fn status(code: StatusCode) -> Response<Body> {
    Response::builder().status(code).body(Body::empty()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn configuration_is_withheld_until_ready() {
        let (store, reader) = Store::new();
        assert_eq!(
            configuration(&reader).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            readiness(&reader).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        store.publish(Default::default(), Default::default());
        assert_eq!(configuration(&reader).status(), StatusCode::OK);
        assert_eq!(readiness(&reader).status(), StatusCode::OK);

        // A failed cycle withholds new polls but keeps the debug topology.
        store.fail();
        assert_eq!(
            configuration(&reader).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(topology(&reader).status(), StatusCode::OK);
    }
}
