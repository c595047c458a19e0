//! Relay wire frames: JSON over a persistent WebSocket. The relay treats
//! the routed `data` payload as opaque; only the envelope is interpreted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Register { device_code: String },
    Signal { to: String, data: Value },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Registered { device_code: String },
    Signal { from: String, data: Value },
    Pong,
    Error { message: String },
    DeviceOnline { device_code: String },
    DeviceOffline { device_code: String },
}

pub fn valid_device_code(code: &str) -> bool {
    code.len() == 8 && code.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_shape() {
        let frame: ClientFrame =
            serde_json::from_str("{\"type\":\"register\",\"deviceCode\":\"12345678\"}").unwrap();
        assert!(matches!(frame, ClientFrame::Register { device_code } if device_code == "12345678"));
    }

    #[test]
    fn signal_routes_opaque_data() {
        let frame: ClientFrame = serde_json::from_str(
            "{\"type\":\"signal\",\"to\":\"87654321\",\"data\":{\"anything\":[1,2,3]}}",
        )
        .unwrap();
        match frame {
            ClientFrame::Signal { to, data } => {
                assert_eq!(to, "87654321");
                assert_eq!(data["anything"][2], 3);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn device_code_validation() {
        assert!(valid_device_code("10000000"));
        assert!(!valid_device_code("1000000"));
        assert!(!valid_device_code("10o00000"));
    }
}
