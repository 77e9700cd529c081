//! Shared helpers for the end-to-end tests: an in-process XML-RPC master stub
//! and a polling helper.
//!
//! The stub keeps the same registry the real master keeps and forwards
//! `publisherUpdate` calls to registered subscribers when the publisher list
//! of a topic changes, which is the only push behavior the runtime relies on.
#![allow(dead_code)]

use hyper::{Body, Request, Response};
use serde_xmlrpc::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MasterState {
    // topic -> [(caller_id, caller_api)]
    publishers: HashMap<String, Vec<(String, String)>>,
    subscribers: HashMap<String, Vec<(String, String)>>,
    // service -> (caller_id, service_api)
    services: HashMap<String, (String, String)>,
    params: HashMap<String, Value>,
}

pub struct MasterStub {
    pub address: String,
    state: Arc<Mutex<MasterState>>,
    shutdown: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

impl MasterStub {
    pub async fn start() -> MasterStub {
        let state = Arc::new(Mutex::new(MasterState::default()));
        let http = reqwest::Client::new();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let svc_state = state.clone();
        let make_svc = hyper::service::make_service_fn(move |_conn| {
            let state = svc_state.clone();
            let http = http.clone();
            async move {
                Ok::<_, Infallible>(hyper::service::service_fn(move |req| {
                    let state = state.clone();
                    let http = http.clone();
                    async move { Ok::<_, Infallible>(handle(state, http, req).await) }
                }))
            }
        });
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        let port = server.local_addr().port();
        let graceful = server.with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            let _ = graceful.await;
        });

        MasterStub {
            address: format!("127.0.0.1:{port}"),
            state,
            shutdown,
            _task: task,
        }
    }

    pub fn set_param(&self, key: &str, value: Value) {
        self.state
            .lock()
            .unwrap()
            .params
            .insert(key.to_owned(), value);
    }

    /// Total number of live registrations of every kind.
    pub fn registration_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.publishers.values().map(Vec::len).sum::<usize>()
            + state.subscribers.values().map(Vec::len).sum::<usize>()
            + state.services.len()
    }

    pub fn publisher_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .publishers
            .get(topic)
            .map_or(0, Vec::len)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .get(topic)
            .map_or(0, Vec::len)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.state.lock().unwrap().services.contains_key(service)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for(
    timeout: std::time::Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    condition()
}

async fn handle(
    state: Arc<Mutex<MasterState>>,
    http: reqwest::Client,
    req: Request<Body>,
) -> Response<Body> {
    let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let parsed: Result<(String, Vec<Value>), _> = serde_xmlrpc::request_from_str(&text);
    let (code, status, value) = match parsed {
        Ok((method, args)) => dispatch(&state, &http, &method, args),
        Err(e) => (-1, format!("failed to parse request: {e}"), Value::Int(0)),
    };
    let triple = Value::Array(vec![Value::Int(code), Value::String(status), value]);
    let xml = serde_xmlrpc::response_to_string(vec![triple].into_iter()).unwrap();
    Response::builder()
        .header("Content-Type", "text/xml")
        .body(Body::from(xml))
        .unwrap()
}

fn string_arg(args: &[Value], index: usize) -> String {
    match args.get(index) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn dispatch(
    state: &Arc<Mutex<MasterState>>,
    http: &reqwest::Client,
    method: &str,
    args: Vec<Value>,
) -> (i32, String, Value) {
    let caller_id = string_arg(&args, 0);
    match method {
        "registerPublisher" => {
            let topic = string_arg(&args, 1);
            let caller_api = string_arg(&args, 3);
            let subscriber_apis: Vec<String> = {
                let mut st = state.lock().unwrap();
                let entry = st.publishers.entry(topic.clone()).or_default();
                entry.retain(|(id, _)| *id != caller_id);
                entry.push((caller_id, caller_api));
                st.subscribers
                    .get(&topic)
                    .map(|subs| subs.iter().map(|(_, api)| api.clone()).collect())
                    .unwrap_or_default()
            };
            notify_subscribers(state, http, &topic);
            (
                1,
                String::new(),
                Value::Array(subscriber_apis.iter().map(|api| api.as_str().into()).collect()),
            )
        }
        "registerSubscriber" => {
            let topic = string_arg(&args, 1);
            let caller_api = string_arg(&args, 3);
            let publisher_apis: Vec<String> = {
                let mut st = state.lock().unwrap();
                let entry = st.subscribers.entry(topic.clone()).or_default();
                entry.retain(|(id, _)| *id != caller_id);
                entry.push((caller_id, caller_api));
                st.publishers
                    .get(&topic)
                    .map(|pubs| pubs.iter().map(|(_, api)| api.clone()).collect())
                    .unwrap_or_default()
            };
            (
                1,
                String::new(),
                Value::Array(publisher_apis.iter().map(|api| api.as_str().into()).collect()),
            )
        }
        "unregisterPublisher" => {
            let topic = string_arg(&args, 1);
            {
                let mut st = state.lock().unwrap();
                if let Some(entry) = st.publishers.get_mut(&topic) {
                    entry.retain(|(id, _)| *id != caller_id);
                    if entry.is_empty() {
                        st.publishers.remove(&topic);
                    }
                }
            }
            notify_subscribers(state, http, &topic);
            (1, String::new(), Value::Int(1))
        }
        "unregisterSubscriber" => {
            let topic = string_arg(&args, 1);
            let mut st = state.lock().unwrap();
            if let Some(entry) = st.subscribers.get_mut(&topic) {
                entry.retain(|(id, _)| *id != caller_id);
                if entry.is_empty() {
                    st.subscribers.remove(&topic);
                }
            }
            (1, String::new(), Value::Int(1))
        }
        "registerService" => {
            let service = string_arg(&args, 1);
            let service_api = string_arg(&args, 2);
            state
                .lock()
                .unwrap()
                .services
                .insert(service, (caller_id, service_api));
            (1, String::new(), Value::Int(1))
        }
        "unregisterService" => {
            let service = string_arg(&args, 1);
            state.lock().unwrap().services.remove(&service);
            (1, String::new(), Value::Int(1))
        }
        "lookupService" => {
            let service = string_arg(&args, 1);
            match state.lock().unwrap().services.get(&service) {
                Some((_, api)) => (1, String::new(), api.as_str().into()),
                None => (-1, format!("no provider for {service}"), "".into()),
            }
        }
        "lookupNode" => {
            let name = string_arg(&args, 1);
            let st = state.lock().unwrap();
            let found = st
                .publishers
                .values()
                .chain(st.subscribers.values())
                .flatten()
                .find(|(id, _)| *id == name)
                .map(|(_, api)| api.clone());
            match found {
                Some(api) => (1, String::new(), api.as_str().into()),
                None => (-1, format!("unknown node {name}"), "".into()),
            }
        }
        "getParam" => {
            let key = string_arg(&args, 1);
            match state.lock().unwrap().params.get(&key) {
                Some(value) => (1, String::new(), value.clone()),
                None => (-1, format!("Parameter [{key}] is not set"), Value::Int(0)),
            }
        }
        "setParam" => {
            let key = string_arg(&args, 1);
            if let Some(value) = args.get(2) {
                state.lock().unwrap().params.insert(key, value.clone());
            }
            (1, String::new(), Value::Int(0))
        }
        "hasParam" => {
            let key = string_arg(&args, 1);
            let has = state.lock().unwrap().params.contains_key(&key);
            (1, String::new(), Value::Bool(has))
        }
        "deleteParam" => {
            let key = string_arg(&args, 1);
            match state.lock().unwrap().params.remove(&key) {
                Some(_) => (1, String::new(), Value::Int(0)),
                None => (-1, format!("Parameter [{key}] is not set"), Value::Int(0)),
            }
        }
        "searchParam" => {
            let key = string_arg(&args, 1);
            let resolved = format!("/{}", key.trim_start_matches('/'));
            if state.lock().unwrap().params.contains_key(&resolved) {
                (1, String::new(), resolved.as_str().into())
            } else {
                (-1, format!("Cannot find parameter [{key}]"), "".into())
            }
        }
        _ => (-1, format!("unknown method {method}"), Value::Int(0)),
    }
}

/// Pushes the current publisher list of `topic` to every subscriber, the way
/// the real master does after a registration change.
fn notify_subscribers(state: &Arc<Mutex<MasterState>>, http: &reqwest::Client, topic: &str) {
    let (subscriber_apis, publisher_apis) = {
        let st = state.lock().unwrap();
        (
            st.subscribers
                .get(topic)
                .map(|subs| subs.iter().map(|(_, api)| api.clone()).collect::<Vec<_>>())
                .unwrap_or_default(),
            st.publishers
                .get(topic)
                .map(|pubs| pubs.iter().map(|(_, api)| api.clone()).collect::<Vec<_>>())
                .unwrap_or_default(),
        )
    };
    for subscriber_api in subscriber_apis {
        let body = serde_xmlrpc::request_to_string(
            "publisherUpdate",
            vec![
                "/master".into(),
                topic.into(),
                Value::Array(publisher_apis.iter().map(|api| api.as_str().into()).collect()),
            ],
        )
        .unwrap();
        let http = http.clone();
        tokio::spawn(async move {
            let _ = http.post(&subscriber_api).body(body).send().await;
        });
    }
}
