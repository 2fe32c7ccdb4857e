//! Prometheus metrics for the osnet server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` and liveness at `/health`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Prometheus metrics for the osnet server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Connections refused at the connection limit.
    pub connections_rejected_total: Counter,
    /// Total requests by message type.
    pub requests_total: CounterVec,
    /// Total error replies by error code.
    pub errors_total: CounterVec,
    /// Request duration histogram by message type.
    pub request_duration: HistogramVec,
    /// Currently open stream handles across all sessions.
    pub stream_handles_open: Gauge,
    /// Bytes returned by stream reads.
    pub stream_bytes_read_total: Counter,
    /// Bytes accepted by stream writes.
    pub stream_bytes_written_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "osnet_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "osnet_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected_total = Counter::with_opts(Opts::new(
            "osnet_connections_rejected_total",
            "Connections refused because the server was at its connection limit",
        ))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        // Requests
        let requests_total = CounterVec::new(
            Opts::new("osnet_requests_total", "Total requests by message type"),
            &["type"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("osnet_errors_total", "Total error replies by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "osnet_request_duration_seconds",
                "Request handling duration in seconds by message type",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["type"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        // Streams
        let stream_handles_open = Gauge::with_opts(Opts::new(
            "osnet_stream_handles_open",
            "Number of open remote stream handles",
        ))?;
        registry.register(Box::new(stream_handles_open.clone()))?;

        let stream_bytes_read_total = Counter::with_opts(Opts::new(
            "osnet_stream_bytes_read_total",
            "Bytes returned by remote stream reads",
        ))?;
        registry.register(Box::new(stream_bytes_read_total.clone()))?;

        let stream_bytes_written_total = Counter::with_opts(Opts::new(
            "osnet_stream_bytes_written_total",
            "Bytes accepted by remote stream writes",
        ))?;
        registry.register(Box::new(stream_bytes_written_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_rejected_total,
            requests_total,
            errors_total,
            request_duration,
            stream_handles_open,
            stream_bytes_read_total,
            stream_bytes_written_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);
    serve_metrics(listener, metrics, shutdown).await;
    Ok(())
}

/// Serves metrics on an already bound listener.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(
                StatusCode::OK,
                Some("text/plain; version=0.0.4; charset=utf-8"),
                body,
            ),
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, None, e.to_string())
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, None, "OK"),
        _ => respond(StatusCode::NOT_FOUND, None, "Not Found"),
    };
    Ok(response)
}

fn respond(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.requests_total.with_label_values(&["PING"]).inc();
        metrics.errors_total.with_label_values(&["UNKNOWN_HANDLE"]).inc();
        metrics
            .request_duration
            .with_label_values(&["STREAM_READ"])
            .observe(0.0002);
        metrics.stream_handles_open.set(3.0);
        metrics.stream_bytes_read_total.inc_by(4096.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("osnet_connections_total 1"));
        assert!(encoded.contains("osnet_requests_total{type=\"PING\"} 1"));
        assert!(encoded.contains("osnet_errors_total{code=\"UNKNOWN_HANDLE\"} 1"));
        assert!(encoded.contains("osnet_request_duration_seconds"));
        assert!(encoded.contains("osnet_stream_handles_open 3"));
        assert!(encoded.contains("osnet_stream_bytes_read_total 4096"));
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_endpoints() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.connections_total.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_metrics(listener, metrics, shutdown_rx));

        let body = http_get(addr, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("osnet_connections_total 1"));

        assert!(http_get(addr, "/health").await.ends_with("OK"));
        assert!(http_get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap();
    }
}
