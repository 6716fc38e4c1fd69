//! Per-method request transforms applied before routing.

use serde_json::Value;
use thiserror::Error;
use types::jsonrpc::Request;

use crate::tracking::HeadHandle;

pub const LATEST_BLOCK_PARAMETER: &str = "latest";

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("failed to process params array: {0}")]
    Params(#[from] serde_json::Error),
    #[error("no head available")]
    NoHead,
}

pub type RequestTransform =
    Box<dyn Fn(Request) -> Result<Request, TransformError> + Send + Sync>;

/// Decode the request params as a positional array and replace the
/// value at `position` with `value_fn(old)`. Requests with fewer params
/// pass through unchanged; the params are re-marshalled, which also
/// canonicalizes their encoding.
pub fn replace_parameter_by_index<F>(position: usize, value_fn: F) -> RequestTransform
where
    F: Fn(&Value) -> Result<Value, TransformError> + Send + Sync + 'static,
{
    Box::new(move |mut req: Request| {
        let mut params = req.params_array()?;
        if position >= params.len() {
            // not enough params, do nothing
            return Ok(req);
        }
        params[position] = value_fn(&params[position])?;
        req.params = Some(serde_json::value::to_raw_value(&params)?);
        Ok(req)
    })
}

/// Rewrite the `"latest"` block tag at `position` to the hex-encoded
/// number of the tracked head. Fails when no head is available yet.
pub fn override_latest_block_param(head: HeadHandle, position: usize) -> RequestTransform {
    replace_parameter_by_index(position, move |current| match current.as_str() {
        Some(LATEST_BLOCK_PARAMETER) => {
            let head = head.load().ok_or(TransformError::NoHead)?;
            Ok(Value::String(format!("{:#x}", head.number)))
        }
        _ => Ok(current.clone()),
    })
}
