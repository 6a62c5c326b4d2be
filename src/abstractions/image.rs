use super::database::NamedDatabase;
use super::mock::MockService;
use crate::engine::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Capability bag of a supporting service (database, bus, object store).
///
/// Plugged-in clients only reach each other through these lookups; the
/// harness never sees their concrete types.
pub trait Image: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn host(&self) -> String;
    fn port(&self) -> u16;
    /// Host port published for `internal`, when the service is containerised.
    fn mapped_port(&self, internal: u16) -> Option<u16>;
    fn is_docker(&self) -> bool;
    fn username(&self) -> Option<String>;
    fn password(&self) -> Option<String>;

    /// Answer a `{$svc:<name>:<tokens…>}` template marker. `None` means the
    /// image exposes no environment capability at all.
    fn resolve_env(&self, tokens: &[&str]) -> Option<Result<String, String>> {
        let _ = tokens;
        None
    }
}

/// Image described by configuration rather than started by the harness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticImage {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub mapped_ports: HashMap<u16, u16>,
    #[serde(default)]
    pub docker: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl StaticImage {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_mapped_port(mut self, internal: u16, published: u16) -> Self {
        self.mapped_ports.insert(internal, published);
        self.docker = true;
        self
    }
}

impl Image for StaticImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn mapped_port(&self, internal: u16) -> Option<u16> {
        self.mapped_ports.get(&internal).copied()
    }

    fn is_docker(&self) -> bool {
        self.docker
    }

    fn username(&self) -> Option<String> {
        self.username.clone()
    }

    fn password(&self) -> Option<String> {
        self.password.clone()
    }

    fn resolve_env(&self, tokens: &[&str]) -> Option<Result<String, String>> {
        let result = match tokens {
            ["host"] => Ok(self.host.clone()),
            ["port"] => Ok(self.port.to_string()),
            ["port", internal] => internal
                .parse::<u16>()
                .map_err(|_| format!("`{internal}` is not a port"))
                .and_then(|internal| {
                    self.mapped_port(internal)
                        .map(|port| port.to_string())
                        .ok_or_else(|| format!("port {internal} is not mapped"))
                }),
            ["addr"] => Ok(format!("{}:{}", self.host, self.port)),
            ["name"] => Ok(self.name.clone()),
            ["username"] => self.username.clone().ok_or_else(|| "no username".to_string()),
            ["password"] => self.password.clone().ok_or_else(|| "no password".to_string()),
            other => Err(format!("unsupported token `{}`", other.join(":"))),
        };
        Some(result)
    }
}

/// What a started component publishes into the run context.
#[derive(Default)]
pub struct Handles {
    pub images: Vec<Arc<dyn Image>>,
    pub databases: Vec<(String, NamedDatabase)>,
    pub mocks: Vec<(String, Arc<dyn MockService>)>,
}

impl Handles {
    pub fn image(mut self, image: Arc<dyn Image>) -> Self {
        self.images.push(image);
        self
    }

    pub fn database(mut self, name: impl Into<String>, database: NamedDatabase) -> Self {
        self.databases.push((name.into(), database));
        self
    }

    pub fn mock(mut self, name: impl Into<String>, mock: Arc<dyn MockService>) -> Self {
        self.mocks.push((name.into(), mock));
        self
    }
}

pub type ComponentFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// Supporting component lifecycle: `start` becomes ready and publishes its
/// handles, `shutdown` releases it at the end of the run.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, cancel: CancelToken) -> ComponentFuture<'_, Handles>;

    fn shutdown(&self) -> ComponentFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> StaticImage {
        StaticImage::new("postgres", "127.0.0.1", 5432)
            .with_credentials("app", "secret")
            .with_mapped_port(5432, 49153)
    }

    #[test]
    fn static_image_answers_tokens() {
        let image = image();
        let resolve = |tokens: &[&str]| image.resolve_env(tokens).expect("capability");

        assert_eq!(resolve(&["host"]), Ok("127.0.0.1".to_string()));
        assert_eq!(resolve(&["port"]), Ok("5432".to_string()));
        assert_eq!(resolve(&["port", "5432"]), Ok("49153".to_string()));
        assert_eq!(resolve(&["addr"]), Ok("127.0.0.1:5432".to_string()));
        assert_eq!(resolve(&["username"]), Ok("app".to_string()));
        assert_eq!(resolve(&["password"]), Ok("secret".to_string()));
        assert!(resolve(&["port", "6379"]).is_err());
        assert!(resolve(&["bucket"]).is_err());
    }

    #[test]
    fn mapped_ports_mark_docker_images() {
        assert!(image().is_docker());
        assert!(!StaticImage::new("api", "localhost", 80).is_docker());
    }
}
