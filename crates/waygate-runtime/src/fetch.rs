//! The guarded fetch.
//!
//! Every request is pre-flighted through the network enforcer; redirects
//! are followed manually so each hop is re-checked; bodies are capped both
//! by declared `content-length` and while streaming. The whole chain runs
//! under the run's wall-clock interrupt deadline, which keeps ticking
//! between hops.

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use serde_json::{Value, json};
use waygate_policy::NetworkEnforcer;

/// A `fetch(url, init)` init object as sent by the guest.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FetchInit {
    method: Option<String>,
    headers: Option<std::collections::BTreeMap<String, String>>,
    body: Option<String>,
}

/// Perform a guarded fetch, returning the guest-facing response value or a
/// denial/failure message.
pub(crate) async fn guarded_fetch(
    client: &reqwest::Client,
    enforcer: &NetworkEnforcer,
    raw_url: &str,
    init: FetchInit,
) -> Result<Value, String> {
    let policy = enforcer.policy().clone();
    let mut url = enforcer.check(raw_url).map_err(|e| e.to_string())?;

    let method = match &init.method {
        Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method: {m}"))?,
        None => Method::GET,
    };

    let mut headers = HeaderMap::new();
    if let Some(map) = &init.headers {
        for (name, value) in map {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name: {name}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| "invalid header value".to_string())?;
            headers.insert(name, value);
        }
    }

    let mut redirects: u32 = 0;
    loop {
        let mut request = client.request(method.clone(), url.clone());
        request = request.headers(headers.clone());
        if let Some(body) = &init.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| format!("fetch: {e}"))?;

        if response.status().is_redirection() {
            redirects = redirects.saturating_add(1);
            if redirects > policy.max_redirects {
                return Err(format!(
                    "too many redirects (limit {})",
                    policy.max_redirects
                ));
            }
            let Some(location) = response.headers().get(LOCATION) else {
                return Err("redirect without a location header".to_string());
            };
            let location = location
                .to_str()
                .map_err(|_| "redirect location is not a string".to_string())?;
            let next = url
                .join(location)
                .map_err(|e| format!("redirect target: {e}"))?;
            // Every hop goes back through the enforcer.
            url = enforcer.check(next.as_str()).map_err(|e| e.to_string())?;
            continue;
        }

        if let Some(declared) = response.content_length() {
            if declared > policy.max_body_bytes {
                return Err(format!(
                    "response body of {declared} bytes exceeds the {} byte limit",
                    policy.max_body_bytes
                ));
            }
        }

        let status = response.status().as_u16();
        let mut header_map = serde_json::Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                header_map.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }

        let mut body = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|e| format!("fetch: {e}"))? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > policy.max_body_bytes {
                return Err(format!(
                    "response body exceeds the {} byte limit",
                    policy.max_body_bytes
                ));
            }
        }

        let body = String::from_utf8_lossy(&body).into_owned();
        return Ok(json!({
            "status": status,
            "headers": Value::Object(header_map),
            "body": body,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waygate_policy::NetworkPolicy;

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn preflight_denial_carries_the_reason() {
        let enforcer = NetworkEnforcer::new(NetworkPolicy::default());
        let err = guarded_fetch(
            &client(),
            &enforcer,
            "http://10.0.0.1/",
            FetchInit::default(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("IP literals"));
    }

    #[tokio::test]
    async fn unlisted_domain_is_denied_without_io() {
        let enforcer = NetworkEnforcer::new(NetworkPolicy::default());
        let err = guarded_fetch(
            &client(),
            &enforcer,
            "https://unlisted.example/",
            FetchInit::default(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("not in the allowed list"));
    }

    #[tokio::test]
    async fn invalid_method_is_rejected() {
        let enforcer = NetworkEnforcer::new(NetworkPolicy::default());
        let err = guarded_fetch(
            &client(),
            &enforcer,
            "https://api.github.com/",
            FetchInit {
                method: Some("NOT A METHOD".to_string()),
                ..FetchInit::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.contains("invalid method"));
    }
}
