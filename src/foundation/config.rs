use serde::de::DeserializeOwned;

use crate::foundation::error::{RasterflowError, RasterflowResult};

/// Parse an options struct from JSON. Missing fields take their defaults.
pub(crate) fn from_json_str<T: DeserializeOwned>(what: &str, json: &str) -> RasterflowResult<T> {
    serde_json::from_str(json).map_err(|e| {
        tracing::error!(%e, "invalid {what} json");
        RasterflowError::validation(format!("invalid {what} json: {e}"))
    })
}
