//! Prometheus exporter endpoint.

use core::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context as _, Result as AnyResult};
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder as _, TextEncoder};
use structopt::StructOpt;
use tracing::info;

#[derive(Clone, Debug, StructOpt)]
pub struct Options {
    /// Prometheus exporter socket address.
    #[structopt(long, env = "PROXY_METRICS_ADDRESS", default_value = "127.0.0.1:9090")]
    metrics_address: SocketAddr,
}

async fn route(request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match request.uri().path() {
        "/metrics" => {
            let metrics = prometheus::gather();
            let encoder = TextEncoder::new();
            let mut buffer = vec![];
            if encoder.encode(&metrics, &mut buffer).is_ok() {
                Response::builder()
                    .header(CONTENT_TYPE, encoder.format_type())
                    .body(Body::from(buffer))
                    .unwrap_or_default()
            } else {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
        _ => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

pub async fn main(options: Options) -> AnyResult<()> {
    let service = make_service_fn(|_connection| async { Ok::<_, Infallible>(service_fn(route)) });

    let server = Server::try_bind(&options.metrics_address)
        .with_context(|| format!("error binding {} for metrics server", options.metrics_address))?
        .serve(service);
    info!("Serving metrics on http://{}/metrics", options.metrics_address);

    server.await.context("internal error in metrics server")?;
    Ok(())
}
