//! The slave API server: the XML-RPC surface this node exposes to the master
//! and to peer nodes.
//!
//! Requests are decoded here, routed through the node loop where they touch
//! registry state, and answered with the canonical
//! `[status_code, status_message, value]` triple.

use crate::node::actor::NodeMsg;
use hyper::{Body, Request, Response, StatusCode};
use log::*;
use rosnative_common::{Error, Result};
use serde_xmlrpc::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

struct SlaveContext {
    node_tx: mpsc::Sender<NodeMsg>,
    master_uri: String,
    cancel: Arc<watch::Sender<bool>>,
}

/// Binds the server and spawns it; returns the bound port and the serve task,
/// which exits once the shutdown signal fires.
pub(crate) fn spawn(
    addr: SocketAddr,
    node_tx: mpsc::Sender<NodeMsg>,
    master_uri: String,
    cancel: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(u16, JoinHandle<()>)> {
    let ctx = Arc::new(SlaveContext {
        node_tx,
        master_uri,
        cancel,
    });
    let make_svc = hyper::service::make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, std::convert::Infallible>(hyper::service::service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, std::convert::Infallible>(respond(ctx, req).await) }
            }))
        }
    });
    let server = hyper::Server::try_bind(&addr)
        .map_err(|e| Error::ConfigInvalid(format!("unable to bind the slave API server: {e}")))?
        .serve(make_svc);
    let port = server.local_addr().port();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    let task = tokio::spawn(async move {
        if let Err(e) = graceful.await {
            error!("Slave API server failed: {e}");
        }
        debug!("Slave API server exited");
    });
    Ok((port, task))
}

async fn respond(ctx: Arc<SlaveContext>, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read slave API request body: {e}");
            return plain_response(StatusCode::BAD_REQUEST, "");
        }
    };
    let text = match String::from_utf8(body.to_vec()) {
        Ok(text) => text,
        Err(_) => return plain_response(StatusCode::BAD_REQUEST, ""),
    };

    let parsed: std::result::Result<(String, Vec<Value>), _> =
        serde_xmlrpc::request_from_str(&text);
    let (code, status, value) = match parsed {
        Ok((method, args)) => dispatch(&ctx, &method, args).await,
        Err(e) => (-1, format!("failed to parse request: {e}"), Value::Int(0)),
    };

    let triple = Value::Array(vec![Value::Int(code), Value::String(status), value]);
    match serde_xmlrpc::response_to_string(vec![triple].into_iter()) {
        Ok(xml) => Response::builder()
            .header("Content-Type", "text/xml")
            .body(Body::from(xml))
            .unwrap(),
        Err(e) => {
            error!("Failed to serialize slave API response: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "")
        }
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap()
}

/// Answered when the node loop is gone mid-request.
fn terminating() -> (i32, String, Value) {
    (0, "terminating".to_owned(), Value::Int(0))
}

fn bad_args(method: &str) -> (i32, String, Value) {
    (-1, format!("bad arguments for {method}"), Value::Int(0))
}

async fn dispatch(ctx: &SlaveContext, method: &str, args: Vec<Value>) -> (i32, String, Value) {
    trace!("Slave API call: {method}");
    match method {
        "getMasterUri" => (1, String::new(), ctx.master_uri.as_str().into()),
        "getPid" => (1, String::new(), Value::Int(std::process::id() as i32)),
        "getBusStats" => (
            1,
            String::new(),
            Value::Array(vec![
                Value::Array(vec![]),
                Value::Array(vec![]),
                Value::Array(vec![]),
            ]),
        ),
        "getPublications" => {
            let (reply, rx) = oneshot::channel();
            if ctx
                .node_tx
                .send(NodeMsg::GetPublications { reply })
                .await
                .is_err()
            {
                return terminating();
            }
            match rx.await {
                Ok(list) => (1, String::new(), topic_list_value(list)),
                Err(_) => terminating(),
            }
        }
        "getSubscriptions" => {
            let (reply, rx) = oneshot::channel();
            if ctx
                .node_tx
                .send(NodeMsg::GetSubscriptions { reply })
                .await
                .is_err()
            {
                return terminating();
            }
            match rx.await {
                Ok(list) => (1, String::new(), topic_list_value(list)),
                Err(_) => terminating(),
            }
        }
        "getBusInfo" => {
            let (reply, rx) = oneshot::channel();
            if ctx
                .node_tx
                .send(NodeMsg::GetBusInfo { reply })
                .await
                .is_err()
            {
                return terminating();
            }
            match rx.await {
                Ok(entries) => (
                    1,
                    String::new(),
                    Value::Array(entries.iter().map(|entry| entry.to_value()).collect()),
                ),
                Err(_) => terminating(),
            }
        }
        "publisherUpdate" => {
            let (Some(Value::String(topic)), Some(Value::Array(uris))) =
                (args.get(1), args.get(2))
            else {
                return bad_args(method);
            };
            let publishers = uris
                .iter()
                .filter_map(|value| match value {
                    Value::String(uri) => Some(uri.clone()),
                    _ => None,
                })
                .collect();
            if ctx
                .node_tx
                .send(NodeMsg::PublisherUpdate {
                    topic: topic.clone(),
                    publishers,
                })
                .await
                .is_err()
            {
                return terminating();
            }
            (1, String::new(), Value::Int(0))
        }
        "requestTopic" => {
            let (Some(Value::String(topic)), Some(Value::Array(protocols))) =
                (args.get(1), args.get(2))
            else {
                return bad_args(method);
            };
            let (reply, rx) = oneshot::channel();
            if ctx
                .node_tx
                .send(NodeMsg::RequestTopic {
                    topic: topic.clone(),
                    protocols: protocols.clone(),
                    reply,
                })
                .await
                .is_err()
            {
                return terminating();
            }
            match rx.await {
                Ok(Ok(params)) => (1, format!("ready on {topic}"), Value::Array(params)),
                Ok(Err(e)) => (0, e.to_string(), Value::Int(0)),
                Err(_) => terminating(),
            }
        }
        // Parameter subscriptions are not used by this node
        "paramUpdate" => (1, String::new(), Value::Int(0)),
        "shutdown" => {
            let reason = match args.get(1) {
                Some(Value::String(reason)) => reason.clone(),
                _ => String::new(),
            };
            info!("Shutdown requested over the slave API: {reason}");
            let _ = ctx.cancel.send(true);
            (1, String::new(), Value::Int(0))
        }
        _ => (-1, format!("unknown method {method}"), Value::Int(0)),
    }
}

fn topic_list_value(list: Vec<(String, String)>) -> Value {
    Value::Array(
        list.into_iter()
            .map(|(topic, topic_type)| {
                Value::Array(vec![topic.into(), topic_type.into()])
            })
            .collect(),
    )
}
