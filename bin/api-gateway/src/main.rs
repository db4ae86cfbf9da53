use anyhow::{Context, Result};
use gateway_core::GatewayConfig;
use gateway_proxy::{Gateway, GatewayError, HyperTransport};
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const METRICS_PATH: &str = "/metrics";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting api-gateway...");

    let config = GatewayConfig::load().context("Failed to load gateway configuration")?;
    if config.debug {
        warn!("Debug mode enabled: internal error details are returned to callers");
    }

    let transport = Arc::new(HyperTransport::new(config.health.probe_timeout()));
    let gateway = Arc::new(Gateway::from_config(&config, transport)?);
    info!("Gateway initialized with {} enabled routes", gateway.routes().enabled().count());

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr))?;
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping listener");
                break;
            }
        };
        let io = TokioIo::new(stream);
        let gateway = gateway.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway.clone();
                async move { handle_request(req, gateway).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }

    Ok(())
}

/// `RUST_LOG` filter (default `info`); JSON lines when `GATEWAY_LOG_FORMAT=json`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("GATEWAY_LOG_FORMAT").map_or(false, |f| f.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn handle_request(req: Request<Incoming>, gateway: Arc<Gateway>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == METRICS_PATH && req.method() == Method::GET {
        return Ok(metrics_response(gateway.metrics().gather()));
    }
    Ok(gateway.handle(req).await)
}

fn metrics_response(gathered: Result<String>) -> Response<Full<Bytes>> {
    let body = match gathered {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to gather metrics: {}", e);
            return GatewayError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response();
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    response
}
