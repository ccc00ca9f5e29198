use std::collections::HashMap;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use log::error;

use crate::fastcgi::pool::FastCgiPool;

fn build_params(req: &Request<hyper::body::Incoming>, document_root: &str, script_filename: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for (name, value) in req.headers() {
        if let Ok(value_str) = value.to_str() {
            let key = format!("HTTP_{}", name.as_str().replace('-', "_").to_uppercase());
            params.insert(key, value_str.to_string());
        }
    }

    params.insert("REQUEST_METHOD".to_string(), req.method().to_string());
    params.insert("REQUEST_URI".to_string(), req.uri().to_string());
    params.insert("SCRIPT_FILENAME".to_string(), script_filename.to_string());
    params.insert("DOCUMENT_ROOT".to_string(), document_root.to_string());
    params.insert("QUERY_STRING".to_string(), req.uri().query().unwrap_or("").to_string());
    params.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    params.insert("SERVER_PROTOCOL".to_string(), format!("{:?}", req.version()));
    params.insert("SERVER_SOFTWARE".to_string(), "runway".to_string());
    params.insert("REDIRECT_STATUS".to_string(), "200".to_string());

    params
}

fn full_body<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

// SendStderr content is logged but never attached to the HTTP response.
pub async fn handle_fastcgi_request(
    mut req: Request<hyper::body::Incoming>,
    pool: &FastCgiPool,
    document_root: &str,
    script_filename: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let params = build_params(&req, document_root, script_filename);

    let body_bytes = match req.body_mut().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => {
            error!("failed to read request body for FastCGI forwarding: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match pool.do_request(params, body_bytes).await {
        Ok(response) => {
            if !response.stderr.is_empty() {
                error!("FastCGI backend stderr: {}", String::from_utf8_lossy(&response.stderr));
            }
            if response.app_status != 0 {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
            build_http_response(&response.stdout)
        }
        Err(e) => {
            error!("FastCGI request failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY)
        }
    }
}

fn build_http_response(stdout: &[u8]) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (header_bytes, body_bytes) = match stdout.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => (&stdout[..pos], &stdout[pos + 4..]),
        None => match stdout.windows(2).position(|w| w == b"\n\n") {
            Some(pos) => (&stdout[..pos], &stdout[pos + 2..]),
            None => (&[][..], stdout),
        },
    };

    let mut builder = Response::builder();
    let mut status = StatusCode::OK;

    for line in String::from_utf8_lossy(header_bytes).lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        if key.eq_ignore_ascii_case("status") {
            if let Some(code_str) = value.split_whitespace().next() {
                if let Ok(code) = code_str.parse::<u16>() {
                    if let Ok(parsed) = StatusCode::from_u16(code) {
                        status = parsed;
                    }
                }
            }
        } else if let (Ok(name), Ok(val)) = (hyper::header::HeaderName::from_bytes(key.as_bytes()), hyper::header::HeaderValue::from_str(value)) {
            builder = builder.header(name, val);
        }
    }

    builder
        .status(status)
        .body(full_body(body_bytes.to_vec()))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn error_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder().status(status).body(full_body(Vec::new())).expect("building a bodyless error response never fails")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_http_response_splits_headers_and_body() {
        let stdout = b"Content-Type: text/plain\r\n\r\nhello\n".to_vec();
        let response = build_http_response(&stdout);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn build_http_response_honors_status_header() {
        let stdout = b"Status: 404 Not Found\r\n\r\nmissing".to_vec();
        let response = build_http_response(&stdout);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn build_http_response_with_no_header_separator_treats_all_as_body() {
        let stdout = b"hello\n".to_vec();
        let response = build_http_response(&stdout);
        assert_eq!(response.status(), StatusCode::OK);
    }
}
