//! The privileged agent.
//!
//! One agent serves one container.  It listens on the address of the bridge that container is
//! attached to, runs losetup for it against the container's rootfs, and attaches the resulting
//! devices to the container.

use std::{
    convert::Infallible,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{
    header::{ALLOW, CONTENT_TYPE},
    HeaderValue, Method, StatusCode,
};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};

use crate::{
    command::CommandRunner,
    error::RequestError,
    lxc::Lxc,
    net::interface_ipv4,
    paths,
    protocol::{ErrorResponse, LosetupRequest, LosetupResponse, LOSETUP_PATH},
    reconcile::DeviceBinding,
};

/// Largest request body the agent will read.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

pub type ResponseBody = Full<Bytes>;

/// Everything a request handler needs to know about the container it serves.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// LXD instance name.
    pub container: String,
    /// Host directory holding the container's root filesystem.
    pub rootfs: PathBuf,
    /// The losetup executable on the host.
    pub losetup: String,
    pub lxc: Lxc,
}

struct Inner<R> {
    config: AgentConfig,
    runner: R,
}

pub struct Server<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for Server<R> {
    fn clone(&self) -> Self {
        Server {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Resolves the IPv4 address of the bridge `container` is attached to.
pub async fn container_listen_address(
    runner: &impl CommandRunner,
    lxc: &Lxc,
    container: &str,
) -> Result<(String, Ipv4Addr)> {
    let bridge = lxc.container_network(runner, container).await?;
    let address = interface_ipv4(runner, &bridge).await?;
    Ok((bridge, address))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> http::Response<ResponseBody> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(err) => {
            log::error!("Failed to encode response: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, br#"{"error":"encoding"}"#.to_vec())
        }
    };
    let mut response = http::Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, error: impl ToString) -> http::Response<ResponseBody> {
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
        },
    )
}

impl<R: CommandRunner + 'static> Server<R> {
    pub fn new(config: AgentConfig, runner: R) -> Self {
        Server {
            inner: Arc::new(Inner { config, runner }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Runs a validated request against the container's rootfs.
    ///
    /// The response reflects losetup alone.  Attaching the new devices to the container happens
    /// afterwards and its outcome is only logged.
    pub async fn losetup(&self, request: LosetupRequest) -> std::io::Result<LosetupResponse> {
        let Inner { config, runner } = &*self.inner;
        log::info!("Received args: {:?}", request.args);

        let wants_device = request.wants_device();
        let mut args = request.args;
        paths::reroot(&mut args, &config.rootfs);

        log::info!("Running: {} {:?}", config.losetup, args);
        let response = LosetupResponse::from(runner.run(&config.losetup, &args).await?);

        if wants_device && response.returncode == 0 {
            // finding the partitions scans /dev
            let lookup = tokio::task::spawn_blocking({
                let stdout = response.stdout.clone();
                let container = config.container.clone();
                move || DeviceBinding::from_losetup_stdout(&stdout, &container)
            });
            match lookup.await {
                Ok(Some(binding)) => {
                    let attached = binding.attach(runner, &config.lxc).await;
                    log::debug!("Attached {attached} device(s) to {}", config.container);
                }
                Ok(None) => {}
                Err(err) => log::warn!("Failed to look up partitions: {err}"),
            }
        }

        Ok(response)
    }

    async fn handle_losetup_request<B>(&self, body: B) -> http::Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = match Limited::new(body, MAX_BODY_SIZE).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                let err = RequestError::TooLarge {
                    limit: MAX_BODY_SIZE,
                };
                return error_response(err.status(), err);
            }
            Err(err) => {
                log::warn!("Failed to read request body: {err}");
                return error_response(StatusCode::BAD_REQUEST, err);
            }
        };

        let request = match LosetupRequest::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("Rejected request: {err}");
                return error_response(err.status(), err);
            }
        };

        match self.losetup(request).await {
            Ok(response) => json_response(StatusCode::OK, &response),
            Err(err) => {
                log::error!("{err}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
            }
        }
    }

    /// Routes one HTTP request.
    pub async fn handle_request<B>(&self, request: http::Request<B>) -> http::Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        log::debug!("{} {}", request.method(), request.uri().path());

        if request.uri().path() != LOSETUP_PATH {
            return error_response(StatusCode::NOT_FOUND, "Not found");
        }
        if request.method() != Method::POST {
            let mut response = error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
            return response;
        }

        self.handle_losetup_request(request.into_body()).await
    }

    /// Serves connections from `listener` until `stop` turns true.
    pub async fn serve(self, listener: TcpListener, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted.context("Failed to accept a new TCP connection")?,
                _ = stop.wait_for(|stop| *stop) => break,
            };
            log::debug!("Connection from {peer}");

            let service = hyper::service::service_fn({
                let server = self.clone();
                move |request| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle_request(request).await) }
                }
            });

            tasks.spawn({
                let mut stop = stop.clone();
                async move {
                    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    let connection = builder.serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(connection);
                    let result = tokio::select! {
                        result = connection.as_mut() => Some(result),
                        _ = stop.wait_for(|stop| *stop) => {
                            connection.as_mut().graceful_shutdown();
                            None
                        }
                    };
                    let result = match result {
                        Some(result) => result,
                        None => connection.await,
                    };
                    if let Err(err) = result {
                        log::warn!("Failed to serve connection from {peer}: {err}");
                    }
                }
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                log::error!("Connection task failed: {err}");
            }
        }

        Ok(())
    }
}

/// Binds the agent's listener.
pub async fn bind(address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to listen on {address}"))
}
