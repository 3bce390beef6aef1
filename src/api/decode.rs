/// Response decoding into typed results or structured API errors
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ApiError, Error, Result};

/// Error bodies are either the bare error or wrapped in `{"error": ...}`
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Bare(ApiError),
    Wrapped { error: ApiError },
}

/// Read the whole response and decode it into `T`
pub async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let (status, url, body) = read(response).await?;
    decode_body(status, &url, &body)
}

/// Read the whole response and only check its status
pub async fn expect_success(response: Response) -> Result<()> {
    let (status, _, body) = read(response).await?;
    check_status(status, &body)
}

async fn read(response: Response) -> Result<(u16, String, Vec<u8>)> {
    let status = response.status().as_u16();
    let url = response.url().to_string();
    let body = response.bytes().await?;
    debug!(status, body_size = body.len(), url = %url, "API response");
    Ok((status, url, body.to_vec()))
}

/// Decode a fully read body. An empty success body decodes as JSON `null`,
/// so `()` and `Option<T>` targets accept it.
pub fn decode_body<T: DeserializeOwned>(status: u16, url: &str, body: &[u8]) -> Result<T> {
    check_status(status, body)?;

    let payload: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        body
    };

    serde_json::from_slice(payload).map_err(|source| Error::Decode {
        status,
        url: url.to_string(),
        body: String::from_utf8_lossy(body).into_owned(),
        source,
    })
}

/// Map an error status to a structured [`ApiError`]
pub fn check_status(status: u16, body: &[u8]) -> Result<()> {
    if status < 400 {
        return Ok(());
    }

    let mut api_error = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody::Bare(error)) | Ok(ErrorBody::Wrapped { error }) => error,
        Err(_) => ApiError::from_raw(status, &String::from_utf8_lossy(body)),
    };
    api_error.status = status;
    if api_error.code == 0 {
        api_error.code = i64::from(status);
    }
    Err(Error::Api(api_error))
}
