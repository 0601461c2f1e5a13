//! Network-facing step handlers: mock arming and server-side HTTP.
//!
//! `http_request` runs in the director process (seeding databases,
//! calling webhooks) and never touches the browser; `mock_network` arms
//! an interception rule on the driver so synthetic responses are served
//! before the page's own requests fire.

use crate::definition::{HttpRequestSpec, Step};
use crate::driver::{BrowserDriver, MockRule};
use crate::errors::StepError;
use serde_json::{json, Value};
use tracing::debug;

/// Arm a glob-matched interception rule on the driver.
pub async fn mock_network(
    driver: &dyn BrowserDriver,
    step: &Step,
) -> Result<Option<Value>, StepError> {
    let spec = step
        .mock_network
        .as_ref()
        .ok_or_else(|| StepError::Validation("mock_network step requires a rule".to_string()))?;

    if spec.pattern.trim().is_empty() {
        return Err(StepError::Validation(
            "mock_network rule requires a non-empty 'pattern'".to_string(),
        ));
    }

    debug!(pattern = %spec.pattern, status = spec.status, "Arming mock rule");
    driver.add_mock_rule(MockRule::from_spec(spec)).await?;
    Ok(None)
}

/// Execute a server-side HTTP request and produce
/// `{status, ok, headers, body}` as the step value. 4xx/5xx statuses
/// fail the step.
pub async fn http_request(step: &Step) -> Result<Option<Value>, StepError> {
    let spec = step
        .http_request
        .as_ref()
        .ok_or_else(|| StepError::Validation("http_request step requires a request".to_string()))?;

    let value = send(spec).await?;
    Ok(Some(value))
}

fn parse_method(method: &str) -> Result<reqwest::Method, StepError> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(reqwest::Method::GET),
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "DELETE" => Ok(reqwest::Method::DELETE),
        "PATCH" => Ok(reqwest::Method::PATCH),
        "HEAD" => Ok(reqwest::Method::HEAD),
        "OPTIONS" => Ok(reqwest::Method::OPTIONS),
        other => Err(StepError::Validation(format!(
            "Unsupported HTTP method: {other}"
        ))),
    }
}

async fn send(spec: &HttpRequestSpec) -> Result<Value, StepError> {
    let method = parse_method(&spec.method)?;

    let client = reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .map_err(|err| StepError::Http(format!("Failed to build HTTP client: {err}")))?;

    let mut request = client.request(method, &spec.url);
    for (key, value) in &spec.headers {
        request = request.header(key, value);
    }
    if let Some(body) = &spec.body {
        request = match body {
            Value::String(text) => request.body(text.clone()),
            other => request.json(other),
        };
    }

    debug!(method = %spec.method, url = %spec.url, "Sending http_request step");
    let response = request
        .send()
        .await
        .map_err(|err| StepError::Http(format!("Request to {} failed: {err}", spec.url)))?;

    let status = response.status().as_u16();
    let headers: Value = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    let text = response
        .text()
        .await
        .map_err(|err| StepError::Http(format!("Failed to read response body: {err}")))?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

    if status >= 400 {
        return Err(StepError::Http(format!(
            "HTTP {} from {}",
            status, spec.url
        )));
    }

    Ok(json!({
        "status": status,
        "ok": true,
        "headers": headers,
        "body": body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get").unwrap(), reqwest::Method::GET);
        assert_eq!(parse_method("POST").unwrap(), reqwest::Method::POST);
        assert!(matches!(
            parse_method("TELEPORT"),
            Err(StepError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_http_request_requires_spec() {
        let step = Step::default();
        assert!(matches!(
            http_request(&step).await,
            Err(StepError::Validation(_))
        ));
    }
}
