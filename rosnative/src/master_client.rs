//! Typed client for the master's registration and lookup API.
//!
//! Every method is a thin wrapper over one XML-RPC call; the canonical
//! `[status_code, status_message, value]` triple is unwrapped here so callers
//! deal in plain values.

use log::*;
use rosnative_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde_xmlrpc::Value;

/// Deadline applied to every master and slave API call.
pub(crate) const API_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Performs one XML-RPC call and unwraps the ROS response triple.
///
/// Shared by the master client, the param client and the subscriber-side
/// `requestTopic` call to peer slaves.
pub(crate) async fn xmlrpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    uri: &str,
    method: &str,
    args: Vec<Value>,
) -> Result<T> {
    let body = serde_xmlrpc::request_to_string(method, args)
        .map_err(|e| Error::Unexpected(anyhow::anyhow!("failed to serialize {method}: {e}")))?;
    let response = client.post(uri).body(body).send().await.map_err(|e| {
        if e.is_timeout() {
            Error::Timeout(format!("{method} call to {uri}"))
        } else {
            Error::MasterUnavailable(format!("{method} call to {uri} failed: {e}"))
        }
    })?;
    let text = response
        .text()
        .await
        .map_err(|e| Error::MasterUnavailable(format!("{method} call to {uri} failed: {e}")))?;
    let (code, status, value): (i8, String, T) = serde_xmlrpc::response_from_str(&text)
        .map_err(|e| Error::Malformed(format!("bad {method} response: {e}")))?;
    trace!("{method} -> code {code}: {status}");
    if code != 1 {
        return Err(Error::RegistrationRejected(status));
    }
    Ok(value)
}

pub(crate) struct MasterClient {
    client: reqwest::Client,
    master_uri: String,
    caller_id: String,
}

impl MasterClient {
    pub(crate) fn new(master_uri: String, caller_id: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(API_CALL_TIMEOUT)
            .build()
            .map_err(|e| Error::Unexpected(anyhow::anyhow!("failed to build http client: {e}")))?;
        Ok(MasterClient {
            client,
            master_uri,
            caller_id,
        })
    }

    pub(crate) fn master_uri(&self) -> &str {
        &self.master_uri
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let mut full_args = vec![Value::String(self.caller_id.clone())];
        full_args.extend(args);
        xmlrpc_call(&self.client, &self.master_uri, method, full_args).await
    }

    /// Registers a publisher; returns the current subscriber slave API URIs.
    pub(crate) async fn register_publisher(
        &self,
        topic: &str,
        topic_type: &str,
        caller_api: &str,
    ) -> Result<Vec<String>> {
        self.call(
            "registerPublisher",
            vec![topic.into(), topic_type.into(), caller_api.into()],
        )
        .await
    }

    pub(crate) async fn unregister_publisher(&self, topic: &str, caller_api: &str) -> Result<i32> {
        self.call("unregisterPublisher", vec![topic.into(), caller_api.into()])
            .await
    }

    /// Registers a subscriber; returns the current publisher slave API URIs.
    pub(crate) async fn register_subscriber(
        &self,
        topic: &str,
        topic_type: &str,
        caller_api: &str,
    ) -> Result<Vec<String>> {
        self.call(
            "registerSubscriber",
            vec![topic.into(), topic_type.into(), caller_api.into()],
        )
        .await
    }

    pub(crate) async fn unregister_subscriber(&self, topic: &str, caller_api: &str) -> Result<i32> {
        self.call("unregisterSubscriber", vec![topic.into(), caller_api.into()])
            .await
    }

    /// Registers a service under its `rosrpc://host:port` endpoint.
    pub(crate) async fn register_service(
        &self,
        service: &str,
        service_api: &str,
        caller_api: &str,
    ) -> Result<i32> {
        self.call(
            "registerService",
            vec![service.into(), service_api.into(), caller_api.into()],
        )
        .await
    }

    pub(crate) async fn unregister_service(&self, service: &str, service_api: &str) -> Result<i32> {
        self.call("unregisterService", vec![service.into(), service_api.into()])
            .await
    }

    /// Resolves the slave API URI of a named node.
    pub(crate) async fn lookup_node(&self, node_name: &str) -> Result<String> {
        self.call("lookupNode", vec![node_name.into()]).await
    }

    /// Resolves the `rosrpc://host:port` URI of the current provider of a service.
    pub(crate) async fn lookup_service(&self, service: &str) -> Result<String> {
        self.call("lookupService", vec![service.into()]).await
    }
}
