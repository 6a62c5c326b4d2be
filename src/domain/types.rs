use super::frame::Frame;
use super::value::{Map, Value};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ─── Cookies ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub max_age: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// Parse a single `Set-Cookie` header value.
    pub fn parse_set_cookie(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        for attribute in parts {
            let (key, value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (attribute.trim(), None),
            };
            match key.to_ascii_lowercase().as_str() {
                "path" => cookie.path = value.map(str::to_string),
                "domain" => cookie.domain = value.map(str::to_string),
                "expires" => cookie.expires = value.map(str::to_string),
                "max-age" => cookie.max_age = value.and_then(|v| v.parse().ok()),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => cookie.same_site = value.map(str::to_string),
                _ => {}
            }
        }
        Some(cookie)
    }

    /// `name=value` pair for a `Cookie` request header.
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }

    /// Map form exposed to expectations.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("name".into(), Value::from(&self.name));
        map.insert("value".into(), Value::from(&self.value));
        map.insert("path".into(), Value::from(self.path.clone()));
        map.insert("domain".into(), Value::from(self.domain.clone()));
        map.insert("expires".into(), Value::from(self.expires.clone()));
        map.insert("maxAge".into(), Value::from(self.max_age));
        map.insert("secure".into(), Value::Bool(self.secure));
        map.insert("httpOnly".into(), Value::Bool(self.http_only));
        map.insert("sameSite".into(), Value::from(self.same_site.clone()));
        Value::Object(map)
    }
}

/// Cookies set by a response, in header order.
pub fn response_cookies(response: &http::Response<Bytes>) -> Vec<Cookie> {
    response
        .headers()
        .get_all(http::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(Cookie::parse_set_cookie)
        .collect()
}

// ─── Exchange records ────────────────────────────────────────────────────────

/// Body-less copy of an issued request, kept for coverage and reports so the
/// payload and connection are never retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestRecord {
    pub fn from_request(request: &http::Request<Bytes>) -> Self {
        Self {
            method: request.method().to_string(),
            url: request.uri().to_string(),
            path: request.uri().path().to_string(),
            headers: request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or("<binary>").to_string(),
                    )
                })
                .collect(),
        }
    }
}

/// The endpoint currently being walked. `url` is the concatenated template,
/// placeholders included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointRef {
    pub url: String,
    pub description: String,
    pub frame: Frame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodRef {
    pub verb: String,
    pub description: String,
    pub frame: Frame,
}
