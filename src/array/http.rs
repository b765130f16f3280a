//! JSON-over-HTTPS plumbing shared by the REST array clients.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};

use super::ArrayError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Management endpoint plus the credentials used for basic auth.
#[derive(Clone, Debug)]
pub(crate) struct RestClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

/// Fully buffered response.
#[derive(Clone, Debug)]
pub(crate) struct RestResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Vec<u8>,
}

/// Builds a base URL from a configured endpoint, which may be a bare
/// address or already carry a scheme.
pub(crate) fn endpoint_url(endpoint: &str, path: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        format!("{endpoint}{path}")
    } else {
        format!("https://{endpoint}{path}")
    }
}

/// Accepts counters rendered either as JSON numbers or as decimal strings.
pub(crate) fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(de::Error::custom),
    }
}

impl RestClient {
    /// Arrays usually present self-signed certificates, so verification is
    /// opt-in.
    pub(crate) fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        verify_tls: bool,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            user: user.into(),
            password: password.into(),
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn user(&self) -> &str {
        &self.user
    }

    /// Request without credentials attached.
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Accept", "application/json")
    }

    /// Request authenticated with the configured user and password.
    pub(crate) fn authorized(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, path)
            .basic_auth(&self.user, Some(&self.password))
    }

    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<RestResponse, ArrayError> {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(RestResponse {
            status,
            headers,
            body,
        })
    }
}

impl RestResponse {
    pub(crate) fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub(crate) fn json<T: DeserializeOwned>(&self) -> Result<T, ArrayError> {
        serde_json::from_slice(&self.body).map_err(ArrayError::from)
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub(crate) fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    /// `name=value` pairs of every `Set-Cookie` header, attributes dropped.
    pub(crate) fn cookies(&self) -> Vec<String> {
        self.headers
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|cookie| cookie.split(';').next())
            .map(|pair| pair.trim().to_owned())
            .filter(|pair| !pair.is_empty())
            .collect()
    }

    /// Generic mapping for non-success responses; vendors match their own
    /// error codes before falling back to this.
    pub(crate) fn into_error(self) -> ArrayError {
        let message = self.text();
        match self.status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ArrayError::Authentication { message }
            }
            status => ArrayError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// Decodes a success body or converts the failure.
    pub(crate) fn success_json<T: DeserializeOwned>(self) -> Result<T, ArrayError> {
        if self.is_success() {
            self.json()
        } else {
            Err(self.into_error())
        }
    }

    /// Accepts any success status and discards the body.
    pub(crate) fn success(self) -> Result<(), ArrayError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode, body: &str) -> RestResponse {
        RestResponse {
            status,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn unauthorized_maps_to_authentication() {
        let err = response(StatusCode::UNAUTHORIZED, "bad credentials").into_error();
        assert_eq!(
            err,
            ArrayError::Authentication {
                message: String::from("bad credentials")
            }
        );
    }

    #[test]
    fn server_error_keeps_status_and_body() {
        let err = response(StatusCode::INTERNAL_SERVER_ERROR, "boom").into_error();
        assert_eq!(
            err,
            ArrayError::Api {
                status: 500,
                message: String::from("boom")
            }
        );
    }

    #[test]
    fn cookies_drop_attributes() {
        let mut headers = HeaderMap::new();
        headers.append(
            reqwest::header::SET_COOKIE,
            reqwest::header::HeaderValue::from_static("mod_sec_emc=value1; Path=/; Secure"),
        );
        headers.append(
            reqwest::header::SET_COOKIE,
            reqwest::header::HeaderValue::from_static("other=value2"),
        );
        let reply = RestResponse {
            status: StatusCode::OK,
            headers,
            body: Vec::new(),
        };
        assert_eq!(
            reply.cookies(),
            vec![String::from("mod_sec_emc=value1"), String::from("other=value2")]
        );
    }

    #[derive(Deserialize)]
    struct Counter {
        #[serde(deserialize_with = "lenient_u64")]
        value: u64,
    }

    #[test]
    fn lenient_counters_accept_strings_and_numbers() {
        for raw in [r#"{"value": 42}"#, r#"{"value": " 42"}"#] {
            let counter: Counter = serde_json::from_str(raw)
                .unwrap_or_else(|err| panic!("{raw} should decode: {err}"));
            assert_eq!(counter.value, 42);
        }
        assert!(serde_json::from_str::<Counter>(r#"{"value": "lots"}"#).is_err());
    }

    #[test]
    fn endpoint_url_defaults_to_https() {
        assert_eq!(
            endpoint_url("10.0.0.5", "/api/json/types"),
            "https://10.0.0.5/api/json/types"
        );
        assert_eq!(
            endpoint_url("http://gw.example:8080/", "/api"),
            "http://gw.example:8080/api"
        );
    }

    #[test]
    fn url_joins_without_double_slashes() {
        let client = RestClient::new("https://array.example/api/", "admin", "secret", false);
        assert_eq!(
            client.url("/types/lun/instances"),
            "https://array.example/api/types/lun/instances"
        );
    }
}
