use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{error, trace};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::fastcgi::FastCgiPool;
use crate::router::Router;
use crate::worker::registry::Registry;
use crate::worker::{Runtime, WorkerSnapshot};

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type ProxyClient = Client<HttpConnector, Incoming>;

// RFC 7230 section 6.1. `connection` and `upgrade` are kept on a request that is
// itself negotiating a WebSocket upgrade.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailers", "transfer-encoding", "upgrade"];

fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap, is_upgrade: bool) {
    for name in HOP_BY_HOP {
        if is_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

#[derive(Clone)]
struct ProxyState {
    router: Arc<Router>,
    registry: Arc<Registry>,
    client: ProxyClient,
    fcgi_pools: Arc<HashMap<String, Arc<FastCgiPool>>>,
}

pub async fn run(
    addr: SocketAddr,
    router: Arc<Router>,
    registry: Arc<Registry>,
    fcgi_pools: Arc<HashMap<String, Arc<FastCgiPool>>>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    trace!("proxy listening on {}", addr);

    let client: ProxyClient = Client::builder(TokioExecutor::new()).build_http();
    let state = ProxyState { router, registry, client, fcgi_pools };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                trace!("proxy stopping on shutdown");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        tokio::spawn(async move {
                            let svc = service_fn(move |req| {
                                let state = state.clone();
                                async move { Ok::<_, std::convert::Infallible>(handle(req, state).await) }
                            });
                            if let Err(err) = hyper::server::conn::http1::Builder::new().serve_connection(io, svc).with_upgrades().await {
                                trace!("error serving connection from {}: {:?}", peer, err);
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {}", err);
                    }
                }
            }
        }
    }
}

async fn handle(req: Request<Incoming>, state: ProxyState) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();

    let Some(worker) = state.router.match_path(&path).await else {
        return status_response(StatusCode::NOT_FOUND);
    };
    if !worker.healthy {
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    }

    let response = match worker.runtime {
        Runtime::ExternalFcgiBackend => forward_fastcgi(req, &worker, &state).await,
        Runtime::CompiledNative | Runtime::ManagedInterpreterViaLocalProcess => forward_http(req, &worker, &state.client).await,
    };

    // Only counts once the upstream has actually begun responding; a dial/stream
    // failure surfaced as 502 never reaches this point with a real response to count.
    if response.status() != StatusCode::BAD_GATEWAY {
        worker.request_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    response
}

async fn forward_fastcgi(req: Request<Incoming>, worker: &WorkerSnapshot, state: &ProxyState) -> Response<ProxyBody> {
    let Some(pool) = state.fcgi_pools.get(&worker.name) else {
        error!("worker {} is external-fcgi-backend but has no registered pool", worker.name);
        return status_response(StatusCode::BAD_GATEWAY);
    };

    let Some(handle) = state.registry.get(&worker.name).await else {
        return status_response(StatusCode::NOT_FOUND);
    };
    let source_dir = handle.lock().await.source_dir.clone();

    let relative = req.uri().path().strip_prefix(worker.route_prefix.as_str()).unwrap_or("").trim_start_matches('/');
    let script_filename = source_dir.join(relative).display().to_string();
    let document_root = source_dir.display().to_string();

    crate::fastcgi::handle_fastcgi_request(req, pool, &document_root, &script_filename).await
}

async fn forward_http(mut req: Request<Incoming>, worker: &WorkerSnapshot, client: &ProxyClient) -> Response<ProxyBody> {
    let upstream_uri: hyper::Uri = match format!("http://127.0.0.1:{}{}", worker.current_port, req.uri()).parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!("failed to build upstream URI for worker {}: {}", worker.name, e);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let is_upgrade_request = req.headers().get(hyper::header::UPGRADE).is_some();
    let client_upgrade = is_upgrade_request.then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    parts.uri = upstream_uri;
    strip_hop_by_hop(&mut parts.headers, is_upgrade_request);
    let forward_req = Request::from_parts(parts, body);

    match client.request(forward_req).await {
        Ok(mut upstream_resp) => {
            let is_ws_upgrade = upstream_resp.status() == StatusCode::SWITCHING_PROTOCOLS;
            if is_ws_upgrade {
                if let (Some(client_upgrade), Some(upstream_upgrade)) = (client_upgrade, upstream_resp.extensions_mut().remove::<hyper::upgrade::OnUpgrade>()) {
                    tokio::spawn(async move {
                        match tokio::try_join!(client_upgrade, upstream_upgrade) {
                            Ok((client, upstream)) => {
                                let mut client = TokioIo::new(client);
                                let mut upstream = TokioIo::new(upstream);
                                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                                    trace!("websocket bridge closed: {}", e);
                                }
                            }
                            Err(e) => error!("failed to complete upgrade handshake: {}", e),
                        }
                    });
                }
            }
            strip_hop_by_hop(upstream_resp.headers_mut(), is_ws_upgrade);
            upstream_resp.map(|body| body.boxed())
        }
        Err(e) => {
            error!("upstream request to worker {} failed: {}", worker.name, e);
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_hop_by_hop_removes_connection_header_by_default() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(HeaderName::from_static("x-request-id"), HeaderValue::from_static("abc"));
        strip_hop_by_hop(&mut headers, false);
        assert!(headers.get(hyper::header::CONNECTION).is_none());
        assert!(headers.get("x-request-id").is_some());
    }

    #[test]
    fn strip_hop_by_hop_preserves_upgrade_headers_during_handshake() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(hyper::header::UPGRADE, HeaderValue::from_static("websocket"));
        strip_hop_by_hop(&mut headers, true);
        assert!(headers.get(hyper::header::UPGRADE).is_some());
    }
}
