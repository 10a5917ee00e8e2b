//! Metadata extraction: resolves redirects and learns length, range support
//! and the server-side filename before any byte is written.

use std::sync::Arc;

use reqwest::header::CONTENT_DISPOSITION;
use reqwest::{Response, StatusCode};
use tracing::info;
use url::Url;

use crate::error::DownloadError;
use crate::http::{ByteRange, ContentRange};
use crate::retry::RetryController;
use crate::state::{DownloadState, ProxyHandle};

/// Where to fetch from and how.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub source: Url,
    pub referer: Option<Url>,
    pub proxy: ProxyHandle,
    /// Smallest length for which multi-part mode is enabled.
    pub multipart_threshold: u64,
}

/// Builds a fully populated [`DownloadState`] for `request.source`.
///
/// The probe asks for `bytes=0-`: a 206 answer proves range support, a 200
/// answer means the server streams the whole body only.
pub async fn probe(
    controller: &RetryController<'_>,
    request: ProbeRequest,
) -> Result<Arc<DownloadState>, DownloadError> {
    let threshold = request.multipart_threshold;
    let mut state = Arc::new(
        DownloadState::new(request.source)
            .with_referer(request.referer)
            .with_proxy(request.proxy),
    );

    let connector = controller.connector();
    let probed = controller
        .run(&mut state, move |attempt| async move {
            let response = connector
                .open(&attempt.client, &attempt.state, Some(ByteRange::from(0)))
                .await?;
            Ok(describe(&attempt.state, &response, threshold))
        })
        .await?;

    info!(
        url = %probed.source(),
        length = ?probed.length(),
        range = probed.supports_range(),
        multipart = probed.is_multipart(),
        "probed source"
    );
    Ok(Arc::new(probed))
}

fn describe(state: &DownloadState, response: &Response, threshold: u64) -> DownloadState {
    let headers = response.headers();
    let supports_range = response.status() == StatusCode::PARTIAL_CONTENT;

    let length = if supports_range {
        ContentRange::of(response)
            .and_then(|range| range.total)
            .or_else(|| response.content_length())
    } else {
        response.content_length()
    };

    let filename_hint = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(content_disposition_filename);

    DownloadState::new(state.source().clone())
        .with_referer(state.referer().cloned())
        .with_proxy(state.proxy().clone())
        .with_length(length)
        .with_range_support(supports_range)
        .with_multipart(length.is_some_and(|len| len >= threshold))
        .with_filename_hint(filename_hint)
}

/// File name from a `Content-Disposition` header. A percent-encoded
/// `filename*=charset''name` parameter wins over a plain `filename=`.
fn content_disposition_filename(value: &str) -> Option<String> {
    let params: Vec<(&str, &str)> = value
        .split(';')
        .filter_map(|param| {
            let (key, raw) = param.split_once('=')?;
            Some((key.trim(), raw.trim()))
        })
        .collect();

    let extended = params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("filename*"))
        .and_then(|(_, raw)| {
            let (_, encoded) = raw.split_once("''")?;
            urlencoding::decode(encoded.trim_matches('"')).ok()
        })
        .map(|name| name.into_owned());

    extended
        .or_else(|| {
            params
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("filename"))
                .map(|(_, raw)| raw.trim_matches('"').to_string())
        })
        .filter(|name| !name.is_empty())
}
