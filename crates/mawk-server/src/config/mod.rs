//! Configuration types for the mock server.
//!
//! A configuration file is YAML (or JSON when the file name ends in `.json`)
//! describing listeners, routes and their candidate responses.

mod route;
mod server;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use route::{
    CorsConfig, FallbackConfig, InboundJwtConfig, JwtInput, JwtOutput, OutboundJwtConfig,
    RequestConfig, ResponseConfig, RouteConfig, RouteProxyConfig, TickerConfig, TickerLimit,
};
pub use server::{
    BasicAuthConfig, JwtSigningConfig, ProxyTargetConfig, ServerConfig, TlsConfig, DEFAULT_HOST,
};

use crate::duration::parse_duration;
use crate::handler::StatusSpec;
use crate::jwt::algorithm_from_name;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid template in {context}: {source}")]
    Template {
        context: String,
        #[source]
        source: crate::expression::EvalError,
    },
}

/// A header value given as one string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderValues::One(v) => vec![v.as_str()],
            HeaderValues::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Directory for persisted reload and panic errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// A named text block, rendered with `text(name, args...)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextBlock {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_found: Option<FallbackConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_not_allowed: Option<FallbackConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub texts: Vec<TextBlock>,

    /// Raw settings handed to plugins by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, serde_json::Value>,

    /// Directory relative paths (`file(..)`, `log_dir`) resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Load, default and validate a config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Some(dir) = config.system.log_dir.as_mut() {
            if dir.is_relative() {
                *dir = base_dir.join(&*dir);
            }
        }
        config.base_dir = base_dir;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.finish()
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        if self.servers.is_empty() {
            self.servers.push(ServerConfig::default());
        }
        if self.base_dir.as_os_str().is_empty() {
            self.base_dir = PathBuf::from(".");
        }
        self.validate()?;
        Ok(self)
    }

    /// Names of every proxy target declared on any listener.
    pub fn proxy_names(&self) -> HashSet<&str> {
        self.servers
            .iter()
            .flat_map(|s| s.proxy.iter().map(|p| p.name.as_str()))
            .collect()
    }

    fn jwt_names(&self) -> HashSet<&str> {
        self.servers
            .iter()
            .filter_map(|s| s.jwt.as_ref().map(|j| j.name.as_str()))
            .collect()
    }

    /// Check cross references and value formats that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut addrs = HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                invalid(format!("duplicate server name {:?}", server.name))?;
            }
            if !addrs.insert(server.host.as_str()) {
                invalid(format!("duplicate server host {:?}", server.host))?;
            }
            if let Some(jwt) = &server.jwt {
                let algorithm = algorithm_from_name(&jwt.algorithm).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "server {:?}: unsupported jwt algorithm {:?}",
                        server.name, jwt.algorithm
                    ))
                })?;
                let symmetric = crate::jwt::is_symmetric(algorithm);
                if symmetric && jwt.secret.is_none() {
                    invalid(format!(
                        "server {:?}: jwt {:?} needs a secret",
                        server.name, jwt.name
                    ))?;
                }
                if !symmetric && jwt.private_key.is_none() {
                    invalid(format!(
                        "server {:?}: jwt {:?} needs a private_key",
                        server.name, jwt.name
                    ))?;
                }
            }
            let mut proxies = HashSet::new();
            for proxy in &server.proxy {
                if !proxies.insert(proxy.name.as_str()) {
                    invalid(format!(
                        "server {:?}: duplicate proxy {:?}",
                        server.name, proxy.name
                    ))?;
                }
                if !(proxy.url.starts_with("http://") || proxy.url.starts_with("https://")) {
                    invalid(format!(
                        "proxy {:?}: url must be http(s), got {:?}",
                        proxy.name, proxy.url
                    ))?;
                }
            }
        }

        let proxy_names = self.proxy_names();
        let jwt_names = self.jwt_names();

        for route in &self.routes {
            if !route.path.starts_with('/') {
                invalid(format!("route path {:?} must start with '/'", route.path))?;
            }
            if let Some(proxy) = &route.proxy {
                if !proxy_names.contains(proxy.name.as_str()) {
                    invalid(format!(
                        "route {:?}: unknown proxy {:?}",
                        route.path, proxy.name
                    ))?;
                }
            }
            for request in &route.requests {
                let context = format!("route {:?} {}", route.path, request.method);
                if request.methods().next().is_none() {
                    invalid(format!("{context}: no method"))?;
                }
                for method in request.methods() {
                    if hyper::Method::from_bytes(method.as_bytes()).is_err() {
                        invalid(format!("{context}: bad method {method:?}"))?;
                    }
                }
                if let Some(delay) = &request.delay {
                    parse_duration(delay)
                        .map_err(|e| ConfigError::Invalid(format!("{context}: {e}")))?;
                }
                if let Some(ticker) = &request.ticker {
                    parse_duration(&ticker.time)
                        .map_err(|e| ConfigError::Invalid(format!("{context}: ticker {e}")))?;
                }
                if let Some(jwt) = &request.jwt {
                    if !jwt_names.contains(jwt.name.as_str()) {
                        invalid(format!("{context}: unknown jwt {:?}", jwt.name))?;
                    }
                }
                for response in &request.responses {
                    match StatusSpec::parse(response.status.as_deref()) {
                        Ok(StatusSpec::Code(_)) => {}
                        Ok(StatusSpec::Proxy(name)) if proxy_names.contains(name.as_str()) => {}
                        Ok(StatusSpec::Proxy(name)) => invalid(format!(
                            "{context}: status {name:?} is neither a number nor a proxy name"
                        ))?,
                        Err(e) => invalid(format!("{context}: {e}"))?,
                    }
                    if let Some(jwt) = &response.jwt {
                        if !jwt_names.contains(jwt.name.as_str()) {
                            invalid(format!("{context}: unknown jwt {:?}", jwt.name))?;
                        }
                        if jwt.output != JwtOutput::Body && jwt.key.is_empty() {
                            invalid(format!("{context}: jwt output needs a key"))?;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_gets_default_server() {
        let config = Config::from_yaml_str(
            r#"
routes:
  - path: /ping
    requests:
      - method: get
        responses:
          - status: 200
            body: pong
"#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].host, DEFAULT_HOST);
        assert_eq!(config.routes[0].requests[0].responses[0].status.as_deref(), Some("200"));
    }

    #[test]
    fn test_full_config_parses() {
        let config = Config::from_yaml_str(
            r#"
system:
  log_dir: /tmp/mawk
servers:
  - name: main
    host: 127.0.0.1:8080
    jwt:
      name: test-1
      algo: HS256
      secret: "${env(\"JWT_SECRET\")}"
    proxy:
      - name: upstream
        url: http://localhost:9999
        headers:
          x-forwarded-by: mawk
    basic_auth:
      username: user
      password: pass
      relm: test
routes:
  - path: /users/{id}
    cors:
      allow_methods: [GET, POST]
      allow_headers: [Content-Type]
      max_age: 600
    requests:
      - method: get|post
        order: random
        seed: 100
        delay: 10ms
        headers:
          authorization: ["*"]
        post_values:
          hello: World
        jwt:
          name: test-1
          input: auth
          key: bearer
          validate: true
          claims:
            sub: alice
        responses:
          - status: upstream
          - status: "201"
            headers:
              content-type: application/json
            body:
              hello: world
            jwt:
              name: test-1
              output: header
              key: authorization
              sub: sub 1
              exp: ${duration("1h")}
texts:
  - name: greeting
    data: Hello, ${arg.0}
plugins:
  demo:
    enabled: true
"#,
        )
        .unwrap();

        let server = &config.servers[0];
        assert_eq!(server.jwt.as_ref().unwrap().algorithm, "HS256");
        assert_eq!(server.basic_auth.as_ref().unwrap().realm.as_deref(), Some("test"));
        let request = &config.routes[0].requests[0];
        assert_eq!(request.methods().collect::<Vec<_>>(), vec!["GET", "POST"]);
        assert_eq!(request.order, crate::sequencer::OrderPolicy::Random);
        assert_eq!(request.jwt.as_ref().unwrap().input, JwtInput::Auth);
        assert_eq!(request.headers["authorization"].values(), vec!["*"]);
        assert_eq!(request.responses[0].status.as_deref(), Some("upstream"));
        assert_eq!(config.texts[0].name, "greeting");
        assert!(config.plugins.contains_key("demo"));
    }

    #[test]
    fn test_json_config_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"system": {{"log_dir": "logs"}}, "routes": [{{"path": "/x", "requests": [{{"method": "get", "responses": [{{"status": 204}}]}}]}}]}}"#
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.system.log_dir.unwrap(), dir.path().join("logs"));
        assert_eq!(config.routes[0].requests[0].responses[0].status.as_deref(), Some("204"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = Config::from_yaml_str("routes: [ {").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            (
                "routes: [{path: nope, requests: []}]",
                "must start with '/'",
            ),
            (
                "routes: [{path: /x, requests: [{method: get, delay: soon}]}]",
                "invalid duration",
            ),
            (
                "routes: [{path: /x, requests: [{method: 'g t'}]}]",
                "bad method",
            ),
            (
                "routes: [{path: /x, requests: [{method: get, responses: [{status: nowhere}]}]}]",
                "neither a number nor a proxy name",
            ),
            (
                "routes: [{path: /x, requests: [{method: get, responses: [{status: '1000'}]}]}]",
                "bad status 1000",
            ),
            (
                "servers: [{name: a, host: ':1', proxy: [{name: '70000', url: 'http://127.0.0.1:1'}]}]\nroutes: [{path: /x, requests: [{method: get, responses: [{status: '70000'}]}]}]",
                "bad status 70000",
            ),
            (
                "servers: [{name: a, host: ':1', jwt: {name: j, algo: XX1}}]",
                "unsupported jwt algorithm",
            ),
            (
                "servers: [{name: a, host: ':1', jwt: {name: j, algo: HS256}}]",
                "needs a secret",
            ),
            (
                "servers: [{name: a, host: ':1'}, {name: a, host: ':2'}]",
                "duplicate server name",
            ),
            (
                "routes: [{path: /x, requests: [{method: get, jwt: {name: missing, input: auth, key: bearer}}]}]",
                "unknown jwt",
            ),
        ];
        for (yaml, expected) in cases {
            let err = Config::from_yaml_str(yaml).unwrap_err().to_string();
            assert!(err.contains(expected), "{yaml}: {err}");
        }
    }

    #[test]
    fn test_bind_addr_for_bare_port() {
        let server = ServerConfig {
            host: ":8081".into(),
            ..ServerConfig::default()
        };
        assert_eq!(server.bind_addr().unwrap().to_string(), "0.0.0.0:8081");
        assert_eq!(server.scheme(), "http");
    }
}
