//! Typed client for the parameter server API hosted by the master.

use crate::master_client::{xmlrpc_call, API_CALL_TIMEOUT};
use rosnative_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde_xmlrpc::Value;

pub(crate) struct ParamClient {
    client: reqwest::Client,
    master_uri: String,
    caller_id: String,
}

impl ParamClient {
    pub(crate) fn new(master_uri: String, caller_id: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(API_CALL_TIMEOUT)
            .build()
            .map_err(|e| Error::Unexpected(anyhow::anyhow!("failed to build http client: {e}")))?;
        Ok(ParamClient {
            client,
            master_uri,
            caller_id,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let mut full_args = vec![Value::String(self.caller_id.clone())];
        full_args.extend(args);
        xmlrpc_call(&self.client, &self.master_uri, method, full_args).await
    }

    /// Fetches a parameter, deserializing it into the requested type
    /// (`bool`, `i32`, `f64`, `String`, or nested structures).
    pub(crate) async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.call("getParam", vec![key.into()]).await
    }

    pub(crate) async fn set(&self, key: &str, value: impl serde::Serialize) -> Result<()> {
        let value = serde_xmlrpc::to_value(value)
            .map_err(|e| Error::Serialization(format!("unsupported parameter value: {e}")))?;
        let _: i32 = self.call("setParam", vec![key.into(), value]).await?;
        Ok(())
    }

    pub(crate) async fn has(&self, key: &str) -> Result<bool> {
        self.call("hasParam", vec![key.into()]).await
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<()> {
        let _: i32 = self.call("deleteParam", vec![key.into()]).await?;
        Ok(())
    }

    /// Searches up the namespace hierarchy for a key; returns the resolved name.
    pub(crate) async fn search(&self, key: &str) -> Result<String> {
        self.call("searchParam", vec![key.into()]).await
    }
}
