// Function invocation: calling user functions through the function-execution service

use crate::errors::InvocationError;
use crate::models::{FunctionCallResult, FunctionInvocationSpec};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Completed call; `status_code` is absent when the service reported none
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationResponse {
    pub status_code: Option<u16>,
}

/// Status codes in [200, 300) are successes; a missing code is not
pub fn is_success_status(status_code: Option<u16>) -> bool {
    matches!(status_code, Some(code) if (200..300).contains(&code))
}

/// The external capability of running a function by id
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// `Err` means the call never completed
    async fn invoke(
        &self,
        function_id: &str,
        event: &serde_json::Value,
        headers: &serde_json::Value,
        params: &serde_json::Value,
    ) -> Result<InvocationResponse, InvocationError>;

    /// Ids among `function_ids` that do not resolve to a function
    async fn missing_functions(&self, function_ids: &[String]) -> Result<Vec<String>, InvocationError> {
        let _ = function_ids;
        Ok(Vec::new())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest<'a> {
    event_payload: &'a serde_json::Value,
    headers_payload: &'a serde_json::Value,
    params_payload: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    status_code: Option<u16>,
}

/// Invoker talking to the function-execution service over HTTP
pub struct HttpFunctionInvoker {
    client: Client,
    base_url: Url,
}

impl HttpFunctionInvoker {
    /// Create an invoker; without a timeout a call may wait indefinitely
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, InvocationError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| InvocationError::ClientBuild(e.to_string()))?;

        let base_url: String = base_url.into();
        let base_url = Url::parse(&base_url).map_err(|e| InvocationError::InvalidBaseUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(InvocationError::InvalidBaseUrl(base_url.to_string()));
        }

        Ok(Self { client, base_url })
    }

    /// `{base}/functions/{id}` plus optional trailing segments, with the id
    /// percent-encoded as a single path segment
    fn function_url(&self, function_id: &str, trailing: &[&str]) -> Result<Url, InvocationError> {
        if matches!(function_id, "" | "." | "..") {
            return Err(InvocationError::InvalidFunctionId(function_id.to_string()));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| InvocationError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("functions")
            .push(function_id)
            .extend(trailing);
        Ok(url)
    }
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    #[instrument(skip(self, event, headers, params))]
    async fn invoke(
        &self,
        function_id: &str,
        event: &serde_json::Value,
        headers: &serde_json::Value,
        params: &serde_json::Value,
    ) -> Result<InvocationResponse, InvocationError> {
        let body = ExecuteRequest {
            event_payload: event,
            headers_payload: headers,
            params_payload: params,
        };

        let response = self
            .client
            .post(self.function_url(function_id, &["execute"])?)
            .json(&body)
            .send()
            .await
            .map_err(|e| InvocationError::CallFailed {
                function_id: function_id.to_string(),
                reason: e.to_string(),
            })?;

        let http_status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| InvocationError::InvalidResponse {
                function_id: function_id.to_string(),
                reason: e.to_string(),
            })?;

        // The service reports the function's own status in the body
        let status_code = serde_json::from_str::<ExecuteResponse>(&text)
            .ok()
            .and_then(|r| r.status_code)
            .unwrap_or(http_status);

        debug!(status_code, http_status, "Function call completed");
        Ok(InvocationResponse {
            status_code: Some(status_code),
        })
    }

    #[instrument(skip(self))]
    async fn missing_functions(&self, function_ids: &[String]) -> Result<Vec<String>, InvocationError> {
        let mut missing = Vec::new();
        for function_id in function_ids {
            let url = match self.function_url(function_id, &[]) {
                Ok(url) => url,
                Err(InvocationError::InvalidFunctionId(_)) => {
                    missing.push(function_id.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let response = self
                .client
                .head(url)
                .send()
                .await
                .map_err(|e| InvocationError::CallFailed {
                    function_id: function_id.clone(),
                    reason: e.to_string(),
                })?;

            match response.status() {
                StatusCode::NOT_FOUND => missing.push(function_id.clone()),
                status if status.is_success() => {}
                status => {
                    return Err(InvocationError::InvalidResponse {
                        function_id: function_id.clone(),
                        reason: format!("unexpected status {}", status),
                    })
                }
            }
        }
        Ok(missing)
    }
}

/// Runs single function calls and normalizes their outcome
#[derive(Clone)]
pub struct FunctionRunner {
    invoker: Arc<dyn FunctionInvoker>,
}

impl FunctionRunner {
    pub fn new(invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &Arc<dyn FunctionInvoker> {
        &self.invoker
    }

    /// Call one function; a call that errors becomes a fatal result
    #[instrument(skip(self, spec), fields(function_id = %spec.function_id))]
    pub async fn call(&self, spec: &FunctionInvocationSpec) -> FunctionCallResult {
        match self
            .invoker
            .invoke(
                &spec.function_id,
                &spec.event_payload,
                &spec.headers_payload,
                &spec.params_payload,
            )
            .await
        {
            Ok(response) => FunctionCallResult::completed(&spec.function_id, response.status_code),
            Err(e) => {
                warn!(error = %e, "Function call did not complete");
                FunctionCallResult::fatal(&spec.function_id)
            }
        }
    }
}
