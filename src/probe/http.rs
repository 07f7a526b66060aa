//! The service and content rungs: one HTTP exchange and the checks on its answer.
use std::fmt::Display;
use std::pin::pin;

use bytes::Bytes;
use http::header::{ALT_SVC, CONNECTION, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};

use super::ProbeError;

/// The storage service's answer for a host it does not serve.
pub const NO_SUCH_BUCKET: &[u8] = b"<?xml version='1.0' encoding='UTF-8'?><Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist.</Message></Error>";

/// Only responses declaring exactly this type are compared against the marker.
pub const MARKER_CONTENT_TYPE: &str = "application/xml; charset=UTF-8";

const ALT_SVC_QUIC: &[&str] = &[r#"quic=":443""#, r#"h3=":443""#];

pub fn http_error(e: impl Display) -> ProbeError {
    ProbeError::Http(e.to_string())
}

/// Accepts `[200, 400)`. Redirects are answers, never followed.
pub fn check_status(status: StatusCode) -> Result<(), ProbeError> {
    if (200..400).contains(&status.as_u16()) {
        Ok(())
    } else {
        Err(ProbeError::Status(status.as_u16()))
    }
}

/// Accepts when any `Alt-Svc` value advertises QUIC on port 443.
pub fn check_alt_svc(headers: &HeaderMap) -> Result<(), ProbeError> {
    let advertised = headers
        .get_all(ALT_SVC)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| ALT_SVC_QUIC.iter().any(|token| value.contains(token)));
    if advertised {
        Ok(())
    } else {
        Err(ProbeError::AltSvc)
    }
}

/// A matcher when the content rung applies to this response.
pub fn body_matcher(check_content: bool, headers: &HeaderMap) -> Option<BodyMatcher> {
    let declared = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    (check_content && declared == Some(MARKER_CONTENT_TYPE)).then(BodyMatcher::default)
}

/// Compares a streamed body with [`NO_SUCH_BUCKET`] without buffering it.
///
/// Holds only the count of bytes matched so far; the first differing byte or any
/// byte past the marker's length settles the comparison.
#[derive(Debug, Default)]
pub struct BodyMatcher {
    matched: usize,
    diverged: bool,
}

impl BodyMatcher {
    /// Feeds the next chunk of the body.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.diverged {
            return;
        }
        let end = self.matched + chunk.len();
        if NO_SUCH_BUCKET.get(self.matched..end) == Some(chunk) {
            self.matched = end;
        } else {
            self.diverged = true;
        }
    }

    /// Whether the whole body equalled the marker.
    pub const fn is_marker(&self) -> bool {
        !self.diverged && self.matched == NO_SUCH_BUCKET.len()
    }

    /// Fails when the body was the marker.
    pub const fn verdict(self) -> Result<(), ProbeError> {
        if self.is_marker() {
            Err(ProbeError::NegativeBody)
        } else {
            Ok(())
        }
    }
}

/// One HTTP/1.1 request for `/` on `host` over an established stream.
///
/// The body is drained to the end; with `check_content` it is also compared
/// against the negative marker. The stream is closed when this returns.
pub async fn fetch_http1<S>(
    stream: S,
    method: Method,
    host: &str,
    check_content: bool,
) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(http_error)?;
    let request = Request::builder()
        .method(method)
        .uri("/")
        .header(HOST, host)
        .header(CONNECTION, "close")
        .body(Empty::new())
        .map_err(http_error)?;

    let mut exchange = pin!(async move {
        let response = sender.send_request(request).await.map_err(http_error)?;
        check_status(response.status())?;
        let mut matcher = body_matcher(check_content, response.headers());
        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(http_error)?;
            if let (Some(matcher), Some(data)) = (matcher.as_mut(), frame.data_ref()) {
                matcher.feed(data);
            }
        }
        matcher.map_or(Ok(()), BodyMatcher::verdict)
    });
    let mut connection = pin!(connection);

    tokio::select! {
        result = &mut exchange => result,
        closed = &mut connection => {
            // the response is fully buffered once the connection winds down
            closed.map_err(http_error)?;
            exchange.await
        }
    }
}
