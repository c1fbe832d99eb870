// Minimal HTTP client for the integration suite, over the same hyper
// plumbing the platform itself uses.

use std::convert::Infallible;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::HOST;
use hyper::HeaderMap;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

type ClientBody = BoxBody<Bytes, Infallible>;

/// Issues one request. A `host` entry in `headers` overrides the Host
/// derived from the URL.
pub async fn request(
    method: &str,
    url: &str,
    headers: &[(&str, &str)],
    body: Option<Vec<u8>>,
) -> Result<(u16, HeaderMap, Vec<u8>)> {
    let client: Client<_, ClientBody> = Client::builder(TokioExecutor::new()).build_http();

    let mut builder = hyper::Request::builder().method(method).uri(url);
    let mut host_override = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            host_override = Some(*value);
        } else {
            builder = builder.header(*name, *value);
        }
    }

    let body: ClientBody = match body {
        Some(bytes) => Full::new(Bytes::from(bytes))
            .map_err(|never: Infallible| match never {})
            .boxed(),
        None => Empty::<Bytes>::new()
            .map_err(|never: Infallible| match never {})
            .boxed(),
    };

    let mut req = builder.body(body).context("building request")?;
    if let Some(host) = host_override {
        req.headers_mut()
            .insert(HOST, host.parse().context("host header value")?);
    }

    let response = client
        .request(req)
        .await
        .with_context(|| format!("requesting {url}"))?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .context("reading response body")?
        .to_bytes()
        .to_vec();
    Ok((status, headers, bytes))
}

pub async fn get(url: &str) -> Result<(u16, HeaderMap, Vec<u8>)> {
    request("GET", url, &[], None).await
}

pub async fn get_json(url: &str) -> Result<(u16, serde_json::Value)> {
    let (status, _, body) = get(url).await?;
    let value = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).context("parsing JSON response")?
    };
    Ok((status, value))
}

pub async fn post_json(url: &str, body: &serde_json::Value) -> Result<(u16, HeaderMap, Vec<u8>)> {
    request(
        "POST",
        url,
        &[("content-type", "application/json")],
        Some(serde_json::to_vec(body)?),
    )
    .await
}
