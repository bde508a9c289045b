//! The delegating side of the protocol.
//!
//! A [`Client`] ships a losetup argument vector to the agent and hands back what the agent
//! reported.  The agent is found through the container's default gateway unless an explicit URL
//! is configured.

use anyhow::{Context, Result};
use reqwest::Url;

use crate::{
    command::{CommandOutput, CommandRunner, HostRunner},
    error::ClientError,
    net::default_gateway,
    paths,
    protocol::{ErrorResponse, LosetupRequest, LosetupResponse, DEFAULT_PORT, LOSETUP_PATH},
};

/// Full base URL of the agent, overriding gateway discovery.
pub const SERVER_ENV: &str = "LOSETUP_SERVER";
/// Port of the agent on the gateway.
pub const PORT_ENV: &str = "LOSETUP_SERVER_PORT";

/// Exit status of the client when the agent could not be reached.
///
/// [`exit_status`] never produces it, so it cannot be confused with a delegated failure.
pub const TRANSPORT_FAILURE_EXIT: i32 = 255;

/// The exit status that reports a delegated `returncode`.
///
/// A tool killed by a signal is reported as `128 + signal`, as shells do.  Statuses that would
/// collide with [`TRANSPORT_FAILURE_EXIT`] are capped below it.
pub fn exit_status(returncode: i32) -> i32 {
    let status = match returncode {
        code if code < 0 => 128 + code.saturating_neg().min(126),
        code => code,
    };
    status.min(TRANSPORT_FAILURE_EXIT - 1)
}

/// Where the agent is, according to the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentLocation {
    /// An explicit base URL.
    Url(String),
    /// The default gateway, on this port.
    Gateway { port: u16 },
}

impl AgentLocation {
    /// Resolves the values of [`SERVER_ENV`] and [`PORT_ENV`].
    ///
    /// An explicit URL wins over the port.
    pub fn from_vars(server: Option<String>, port: Option<String>) -> Result<Self> {
        if let Some(base) = server {
            return Ok(AgentLocation::Url(base));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .with_context(|| format!("Invalid {PORT_ENV} {port:?}"))?,
            None => DEFAULT_PORT,
        };
        Ok(AgentLocation::Gateway { port })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::var(SERVER_ENV).ok(), std::env::var(PORT_ENV).ok())
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    url: Url,
}

impl Client {
    /// A client for the agent at `base` (e.g. `http://10.0.0.1:12345`).
    pub fn new(base: &str) -> Result<Self> {
        let url = Url::parse(base)
            .and_then(|base| base.join(LOSETUP_PATH))
            .with_context(|| format!("Invalid server URL {base:?}"))?;
        Ok(Client {
            http: reqwest::Client::new(),
            url,
        })
    }

    /// Locates the agent from the environment, falling back to the default gateway.
    ///
    /// The lookup happens once; a missing gateway is fatal.
    pub async fn discover() -> Result<Self> {
        match AgentLocation::from_env()? {
            AgentLocation::Url(base) => Self::new(&base),
            AgentLocation::Gateway { port } => {
                let gateway = default_gateway(&HostRunner).await?;
                Self::new(&format!("http://{gateway}:{port}"))
            }
        }
    }

    /// The endpoint requests are posted to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Runs losetup on the agent with `args`, which must already be translated for the wire.
    pub async fn losetup(&self, args: Vec<String>) -> Result<LosetupResponse, ClientError> {
        let request = LosetupRequest { args };
        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(ClientError::Transport)?;

        if !status.is_success() {
            let message = match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(ErrorResponse { error }) => error,
                Err(_) => String::from_utf8_lossy(&body).trim().to_string(),
            };
            return Err(ClientError::Rejected { status, message });
        }

        serde_json::from_slice(&body).map_err(|err| ClientError::InvalidResponse(err.to_string()))
    }
}

/// Runs losetup through the agent instead of locally.
///
/// The program name is ignored: the agent alone decides what runs.  Paths are translated for the
/// wire relative to the current directory.
#[derive(Debug, Clone)]
pub struct DelegatingRunner {
    pub client: Client,
}

impl CommandRunner for DelegatingRunner {
    async fn run(&self, _program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let args = paths::to_wire(args)?;
        let response = self
            .client
            .losetup(args)
            .await
            .map_err(std::io::Error::other)?;
        Ok(response.into())
    }
}
