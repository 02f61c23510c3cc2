// src/metrics/server.rs

use super::Collector;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const METRICS_PATH: &str = "/metrics";

/// Serves the Prometheus text-format endpoint at `/metrics` until `shutdown`
/// resolves.
pub async fn serve(
    addr: SocketAddr,
    collector: Collector,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let registry = Registry::new();
    registry.register(Box::new(collector))?;
    let registry = Arc::new(registry);

    let make_service = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(handle(req, &registry)) }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_service);
    info!(%addr, path = METRICS_PATH, "metrics endpoint listening");

    let graceful = server.with_graceful_shutdown(async move {
        shutdown.changed().await.ok();
    });

    if let Err(e) = graceful.await {
        error!(error = %e, "metrics server error");
    }

    Ok(())
}

fn handle(req: Request<Body>, registry: &Registry) -> Response<Body> {
    if req.uri().path() != METRICS_PATH {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("static response is valid");
    }

    let metric_families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("encoding error"))
            .expect("static response is valid");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .expect("encoded body is valid")
}
