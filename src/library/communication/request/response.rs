use super::super::{Fault, FaultKind};
use serde::{Deserialize, Serialize};

/// JSON body of a response produced through the typed helpers
///
/// Successful responses carry `ok = true` and their `data`, failed ones carry `ok = false`
/// together with a description of the `error` and the [`FaultKind`] if the handler faulted.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RpcResponse<T> {
    /// Whether the request has been processed successfully
    pub ok: bool,
    /// Description of the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How the handler failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FaultKind>,
    /// Result of the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> RpcResponse<T> {
    /// Wraps the result of a successful request
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            error: None,
            kind: None,
            data: Some(data),
        }
    }
}

impl RpcResponse<()> {
    /// Describes a contained handler failure
    pub fn failure(fault: &Fault) -> Self {
        Self {
            ok: false,
            error: Some(fault.description()),
            kind: Some(fault.kind()),
            data: None,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn serialize_success() {
        let response = RpcResponse::success(json!({ "id": "t1" }));

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "ok": true, "data": { "id": "t1" } })
        );
    }

    #[test]
    fn serialize_failure() {
        let fault = Fault::new(FaultKind::Panic, vec!["boom".into()]);

        assert_eq!(
            serde_json::to_value(&RpcResponse::failure(&fault)).unwrap(),
            json!({ "ok": false, "error": "boom", "kind": "panic" })
        );
    }

    #[test]
    fn deserialize_without_optional_fields() {
        let response: RpcResponse<serde_json::Value> =
            serde_json::from_str(r#"{"ok":false,"error":"not found"}"#).unwrap();

        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("not found"));
        assert_eq!(response.kind, None);
        assert_eq!(response.data, None);
    }
}
