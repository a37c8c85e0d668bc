// ekf_core/src/errors.rs

use thiserror::Error;

/// Errors returned to the host for misuse of the estimator interface.
///
/// Measurement rejections, sensor timeouts and numerical trouble inside a
/// filter cycle are not errors: they are reported through the status
/// bitmasks and the filter keeps running on its best estimate.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum EkfError {
    #[error("parameter `{name}` is invalid: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },

    #[error("the WGS-84 origin has already been set")]
    OriginAlreadySet,

    #[error("{sensor} sample contains non-finite data")]
    InvalidSample { sensor: &'static str },

    #[error("{sensor} sample at {time_us} us is older than the previous one")]
    OutOfOrderSample { sensor: &'static str, time_us: u64 },
}

pub type EkfResult<T> = Result<T, EkfError>;
