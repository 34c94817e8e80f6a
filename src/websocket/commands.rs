//! Command dispatch
//!
//! Maps typed JSON commands from subscribers onto the serial manager,
//! parser registry, and fusion pool, and wraps every outcome in the
//! `{id, type: "response", command, success, ...}` envelope. Command
//! failures surface in the envelope; they are never fatal to the
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::parser::{CustomDelimitedDecoder, Decoder};
use crate::serial::LineCallback;
use crate::websocket::AppState;

/// Handle one client command and produce its response envelope.
pub async fn handle_command(state: &AppState, message: Value) -> Value {
    let id = message
        .get("id")
        .cloned()
        .unwrap_or_else(|| Value::String("unknown".to_string()));
    let command = message.get("command").and_then(Value::as_str).unwrap_or("");

    match command {
        "list_ports" => {
            let ports = state.serial.list_ports();
            json!({
                "id": id,
                "type": "response",
                "command": "list_ports",
                "success": true,
                "data": ports,
            })
        }

        "open_port" => {
            let Some(port) = message.get("port").and_then(Value::as_str) else {
                return missing_param(&id, "open_port", "Port parameter is required");
            };
            let baudrate = message
                .get("baudrate")
                .and_then(Value::as_u64)
                .map(|b| b as u32)
                .unwrap_or(state.default_baudrate);

            let dispatcher = state.dispatcher.clone();
            let callback: LineCallback = Arc::new(move |raw| dispatcher.handle_line(raw));

            match state.serial.open_port(port, baudrate, state.serial_timeout, callback) {
                Ok(()) => json!({
                    "id": id,
                    "type": "response",
                    "command": "open_port",
                    "success": true,
                    "port": port,
                    "baudrate": baudrate,
                }),
                Err(e) => json!({
                    "id": id,
                    "type": "response",
                    "command": "open_port",
                    "success": false,
                    "port": port,
                    "baudrate": baudrate,
                    "error": e.to_string(),
                }),
            }
        }

        "close_port" => {
            let Some(port) = message.get("port").and_then(Value::as_str) else {
                return missing_param(&id, "close_port", "Port parameter is required");
            };
            match state.serial.close_port(port) {
                Ok(()) => json!({
                    "id": id,
                    "type": "response",
                    "command": "close_port",
                    "success": true,
                    "port": port,
                }),
                Err(e) => json!({
                    "id": id,
                    "type": "response",
                    "command": "close_port",
                    "success": false,
                    "port": port,
                    "error": e.to_string(),
                }),
            }
        }

        "write_port" | "write_port_line" => {
            let Some(port) = message.get("port").and_then(Value::as_str) else {
                return missing_param(&id, command, "Port and data parameters are required");
            };
            let Some(data) = message.get("data").and_then(Value::as_str) else {
                return missing_param(&id, command, "Port and data parameters are required");
            };

            let result = if command == "write_port" {
                state.serial.write_port(port, data)
            } else {
                state.serial.write_port_line(port, data)
            };

            match result {
                Ok(_) => json!({
                    "id": id,
                    "type": "response",
                    "command": command,
                    "success": true,
                    "port": port,
                    "data": data,
                }),
                Err(e) => json!({
                    "id": id,
                    "type": "response",
                    "command": command,
                    "success": false,
                    "port": port,
                    "data": data,
                    "error": e.to_string(),
                }),
            }
        }

        "read_port" => {
            let Some(port) = message.get("port").and_then(Value::as_str) else {
                return missing_param(&id, "read_port", "Port parameter is required");
            };
            let num_bytes = message
                .get("num_bytes")
                .and_then(Value::as_u64)
                .map(|n| n as usize);

            match state.serial.read_port(port, num_bytes) {
                Ok(data) => json!({
                    "id": id,
                    "type": "response",
                    "command": "read_port",
                    "success": true,
                    "port": port,
                    "data": data,
                }),
                Err(e) => json!({
                    "id": id,
                    "type": "response",
                    "command": "read_port",
                    "success": false,
                    "port": port,
                    "error": e.to_string(),
                }),
            }
        }

        "read_port_line" => {
            let Some(port) = message.get("port").and_then(Value::as_str) else {
                return missing_param(&id, "read_port_line", "Port parameter is required");
            };
            match state.serial.read_port_line(port) {
                Ok(data) => json!({
                    "id": id,
                    "type": "response",
                    "command": "read_port_line",
                    "success": true,
                    "port": port,
                    "data": data,
                }),
                Err(e) => json!({
                    "id": id,
                    "type": "response",
                    "command": "read_port_line",
                    "success": false,
                    "port": port,
                    "error": e.to_string(),
                }),
            }
        }

        "is_port_open" => {
            let Some(port) = message.get("port").and_then(Value::as_str) else {
                return missing_param(&id, "is_port_open", "Port parameter is required");
            };
            json!({
                "id": id,
                "type": "response",
                "command": "is_port_open",
                "success": true,
                "port": port,
                "is_open": state.serial.is_port_open(port),
            })
        }

        "get_port_info" => {
            let Some(port) = message.get("port").and_then(Value::as_str) else {
                return missing_param(&id, "get_port_info", "Port parameter is required");
            };
            let info = state.serial.port_info(port);
            json!({
                "id": id,
                "type": "response",
                "command": "get_port_info",
                "success": info.is_some(),
                "port": port,
                "info": info,
            })
        }

        "close_all_ports" => {
            let success = state.serial.close_all_ports().is_ok();
            json!({
                "id": id,
                "type": "response",
                "command": "close_all_ports",
                "success": success,
            })
        }

        "get_parser_info" => {
            let info = state.registry.read().unwrap().info();
            json!({
                "id": id,
                "type": "response",
                "command": "get_parser_info",
                "success": true,
                "data": info,
            })
        }

        "set_active_parser" => {
            let Some(parser_name) = message.get("parser_name").and_then(Value::as_str) else {
                return missing_param(&id, "set_active_parser", "parser_name parameter is required");
            };
            match state.registry.write().unwrap().set_pinned(parser_name) {
                Ok(()) => json!({
                    "id": id,
                    "type": "response",
                    "command": "set_active_parser",
                    "success": true,
                    "parser_name": parser_name,
                }),
                Err(e) => json!({
                    "id": id,
                    "type": "response",
                    "command": "set_active_parser",
                    "success": false,
                    "parser_name": parser_name,
                    "error": e.to_string(),
                }),
            }
        }

        "enable_auto_detection" => {
            state.registry.write().unwrap().enable_auto();
            json!({
                "id": id,
                "type": "response",
                "command": "enable_auto_detection",
                "success": true,
            })
        }

        "add_custom_parser" => {
            let Some(delimiter) = message.get("delimiter").and_then(Value::as_str) else {
                return missing_param(&id, "add_custom_parser", "delimiter parameter is required");
            };
            let field_names: Vec<String> = message
                .get("field_names")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let parser_name = message
                .get("parser_name")
                .and_then(Value::as_str)
                .map(str::to_string);

            let decoder =
                CustomDelimitedDecoder::new(delimiter, field_names.clone(), parser_name.clone());
            state
                .registry
                .write()
                .unwrap()
                .register(Decoder::Custom(decoder));

            json!({
                "id": id,
                "type": "response",
                "command": "add_custom_parser",
                "success": true,
                "delimiter": delimiter,
                "field_names": field_names,
                "parser_name": parser_name,
            })
        }

        "configure_sentinel_parser" => {
            let mapping_value = message
                .get("field_mapping")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let mut mapping = HashMap::new();
            for (key, value) in &mapping_value {
                let Ok(index) = key.parse::<usize>() else {
                    return json!({
                        "id": id,
                        "type": "response",
                        "command": "configure_sentinel_parser",
                        "success": false,
                        "error": format!("invalid field index: {key}"),
                    });
                };
                if let Some(name) = value.as_str() {
                    mapping.insert(index, name.to_string());
                }
            }

            state.registry.write().unwrap().configure_sentinel(mapping);
            json!({
                "id": id,
                "type": "response",
                "command": "configure_sentinel_parser",
                "success": true,
                "field_mapping": mapping_value,
            })
        }

        "configure_sensor_fusion" => {
            let use_magnetometer = message
                .get("use_magnetometer")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let madgwick_beta = message
                .get("madgwick_beta")
                .and_then(Value::as_f64)
                .unwrap_or(0.1);
            let smoothing_window = message
                .get("smoothing_window")
                .and_then(Value::as_u64)
                .unwrap_or(5) as usize;

            state
                .dispatcher
                .configure_fusion(use_magnetometer, madgwick_beta, smoothing_window);

            json!({
                "id": id,
                "type": "response",
                "command": "configure_sensor_fusion",
                "success": true,
                "message": "Sensor fusion configured successfully",
            })
        }

        "reset_sensor_fusion" => {
            state.dispatcher.reset_fusion();
            json!({
                "id": id,
                "type": "response",
                "command": "reset_sensor_fusion",
                "success": true,
                "message": "Sensor fusion reset successfully",
            })
        }

        other => {
            warn!(command = other, "unknown command");
            json!({
                "id": id,
                "type": "response",
                "command": other,
                "success": false,
                "error": format!("Unknown command: {other}"),
            })
        }
    }
}

fn missing_param(id: &Value, command: &str, error: &str) -> Value {
    json!({
        "id": id,
        "type": "response",
        "command": command,
        "success": false,
        "error": error,
    })
}
