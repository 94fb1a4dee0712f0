//! Transfer request and result records
//!
//! Requests flow from the shim to the platform binding; each call answers
//! with a [`RequestResult`] envelope. Transfer calls carry a
//! [`TransferResultInfo`] payload on success.

use crate::types::Direction;
use serde::{Deserialize, Serialize};

/// Result code the platform reports for a successful transfer
pub const TRANSFER_RESULT_SUCCESS: i32 = 0;

/// Recipient of a control request (bits 0..=1 of bmRequestType)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Class of a control request (bits 5..=6 of bmRequestType)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Control transfer request
///
/// `length` is only set for IN transfers, `data` only for OUT transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlTransferInfo {
    pub direction: Direction,
    pub recipient: Recipient,
    pub request_type: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// Timeout in milliseconds (0 = none)
    pub timeout: u32,
}

/// Bulk or interrupt transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericTransferInfo {
    pub direction: Direction,
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// Timeout in milliseconds (0 = none)
    pub timeout: u32,
}

/// Outcome of a transfer as reported by the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResultInfo {
    /// Platform result code, [`TRANSFER_RESULT_SUCCESS`] on success
    #[serde(default)]
    pub result_code: Option<i32>,
    /// Response bytes (IN transfers)
    #[serde(default)]
    pub data: Option<Vec<u8>>,
}

impl TransferResultInfo {
    /// Successful result carrying response bytes
    pub fn success_with_data(data: Vec<u8>) -> Self {
        Self {
            result_code: Some(TRANSFER_RESULT_SUCCESS),
            data: Some(data),
        }
    }

    /// Successful result without response bytes (OUT transfers)
    pub fn success() -> Self {
        Self {
            result_code: Some(TRANSFER_RESULT_SUCCESS),
            data: None,
        }
    }

    /// Failed result with the given platform code
    pub fn failure(result_code: i32) -> Self {
        Self {
            result_code: Some(result_code),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == Some(TRANSFER_RESULT_SUCCESS)
    }
}

/// Uniform envelope around every platform call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RequestResult<T> {
    /// The call completed and produced a payload
    Succeeded { payload: T },
    /// The call failed; the message comes from the platform
    Failed { message: String },
    /// The request was canceled before the platform answered
    Canceled,
}

impl<T> RequestResult<T> {
    pub fn succeeded(payload: T) -> Self {
        RequestResult::Succeeded { payload }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        RequestResult::Failed {
            message: message.into(),
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, RequestResult::Succeeded { .. })
    }

    /// Human readable failure reason, empty for successful results
    pub fn error_message(&self) -> &str {
        match self {
            RequestResult::Succeeded { .. } => "",
            RequestResult::Failed { message } => message,
            RequestResult::Canceled => "request canceled",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RequestResult<U> {
        match self {
            RequestResult::Succeeded { payload } => RequestResult::Succeeded {
                payload: f(payload),
            },
            RequestResult::Failed { message } => RequestResult::Failed { message },
            RequestResult::Canceled => RequestResult::Canceled,
        }
    }

    /// Converts into a plain `Result`, folding cancellation into the error side
    pub fn into_result(self) -> Result<T, String> {
        match self {
            RequestResult::Succeeded { payload } => Ok(payload),
            other => Err(other.error_message().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_result_success() {
        assert!(TransferResultInfo::success().is_success());
        assert!(!TransferResultInfo::failure(1).is_success());
        assert!(!TransferResultInfo::default().is_success());
    }

    #[test]
    fn test_request_result_error_message() {
        let ok: RequestResult<u32> = RequestResult::succeeded(1);
        assert!(ok.is_successful());
        assert_eq!(ok.error_message(), "");

        let failed: RequestResult<u32> = RequestResult::failed("device gone");
        assert!(!failed.is_successful());
        assert_eq!(failed.error_message(), "device gone");

        let canceled: RequestResult<u32> = RequestResult::Canceled;
        assert_eq!(canceled.into_result(), Err("request canceled".to_string()));
    }

    #[test]
    fn test_request_result_map() {
        let result = RequestResult::succeeded(2u8).map(|v| v as u32 * 10);
        assert_eq!(result, RequestResult::succeeded(20u32));

        let failed: RequestResult<u8> = RequestResult::failed("x");
        assert_eq!(failed.map(|v| v as u32), RequestResult::failed("x"));
    }

    #[test]
    fn test_control_info_omits_unused_fields() {
        let info = ControlTransferInfo {
            direction: Direction::In,
            recipient: Recipient::Device,
            request_type: RequestType::Standard,
            request: 6,
            value: 0x0100,
            index: 0,
            length: Some(18),
            data: None,
            timeout: 1000,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"requestType\":\"standard\""));
        assert!(json.contains("\"length\":18"));
        assert!(!json.contains("\"data\""));
    }
}
