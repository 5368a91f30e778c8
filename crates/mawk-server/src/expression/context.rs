//! Request facts and the namespaced variable set built from them.

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE, COOKIE};
use hyper::http::request::Parts;
use hyper::Method;
use serde_json::{Map, Value};

/// Everything a request contributes to matching and templating, captured once
/// so retries across candidates see identical input.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub method: Method,
    pub path: String,
    pub query_string: Option<String>,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub url_params: Vec<(String, String)>,
    pub body: Bytes,
}

impl RequestFacts {
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        let query = parts
            .uri
            .query()
            .map(parse_urlencoded)
            .unwrap_or_default();
        let is_form = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        let form = if is_form {
            parse_urlencoded(&String::from_utf8_lossy(&body))
        } else {
            Vec::new()
        };

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query_string: parts.uri.query().map(str::to_string),
            headers: parts.headers.clone(),
            query,
            form,
            url_params: Vec::new(),
            body,
        }
    }

    pub fn with_url_params(mut self, params: Vec<(String, String)>) -> Self {
        self.url_params = params;
        self
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        first_value(&self.query, name)
    }

    pub fn form_value(&self, name: &str) -> Option<&str> {
        first_value(&self.form, name)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.trim_matches('"').to_string())
    }

    /// Path plus query string, as forwarded to a proxy target.
    pub fn path_and_query(&self) -> String {
        match &self.query_string {
            Some(q) => format!("{}?{q}", self.path),
            None => self.path.clone(),
        }
    }

    /// Assemble the variable set for templates.
    ///
    /// Every namespace is present even when empty. Header, query, post and
    /// url keys are lower-cased; claim names are kept as issued. Plugin
    /// variables sit at the root and never shadow a request namespace.
    pub fn variables(&self, claims: Option<&Map<String, Value>>, plugin_vars: &Map<String, Value>) -> Map<String, Value> {
        let mut vars = Map::new();

        for (name, value) in plugin_vars {
            vars.insert(name.clone(), value.clone());
        }

        let mut header = Map::new();
        for name in self.headers.keys() {
            let values: Vec<Value> = self
                .header_values(name.as_str())
                .into_iter()
                .map(|v| Value::String(v.to_string()))
                .collect();
            header.insert(name.as_str().to_ascii_lowercase(), Value::Array(values));
        }
        vars.insert("header".into(), Value::Object(header));
        vars.insert("query".into(), Value::Object(grouped(&self.query)));
        vars.insert("post".into(), Value::Object(grouped(&self.form)));

        let mut url = Map::new();
        for (name, value) in &self.url_params {
            url.insert(name.to_ascii_lowercase(), Value::String(value.clone()));
        }
        vars.insert("url".into(), Value::Object(url));

        vars.insert(
            "jwt".into(),
            Value::Object(claims.cloned().unwrap_or_default()),
        );

        let mut request = Map::new();
        request.insert("method".into(), Value::String(self.method.to_string()));
        request.insert("path".into(), Value::String(self.path.clone()));
        request.insert(
            "body".into(),
            Value::String(String::from_utf8_lossy(&self.body).into_owned()),
        );
        vars.insert("request".into(), Value::Object(request));

        vars
    }
}

fn first_value<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn grouped(pairs: &[(String, String)]) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in pairs {
        let entry = out
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(Value::String(value.clone()));
        }
    }
    out
}

/// Decode `a=1&b=2` pairs, keeping repeated keys in order.
pub fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}
