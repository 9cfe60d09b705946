//! WebSocket console bridged onto `docker exec`.
//!
//! Terminal bytes flow both ways; JSON control frames of the shape
//! `{"type": "resize", "rows": 40, "cols": 132}` resize the TTY instead of
//! being forwarded as input.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::provider::docker::{container_name, LABEL_NODE_KIND};
use crate::provider::vendors;
use crate::AppState;

pub fn router() -> Router {
    Router::new().route("/console/:lab_id/:node_name", get(console))
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    rows: u16,
    #[serde(default)]
    cols: u16,
}

async fn console(
    ws: WebSocketUpgrade,
    Path((lab_id, node_name)): Path<(String, String)>,
    Extension(st): Extension<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| pump(socket, st, lab_id, node_name))
}

async fn pump(mut socket: WebSocket, st: AppState, lab_id: String, node_name: String) {
    let container = container_name(&lab_id, &node_name);
    info!(container = %container, "console session opening");

    let shell = match st.docker.inspect_container(&container, None).await {
        Ok(inspect) => {
            let kind = inspect
                .config
                .as_ref()
                .and_then(|config| config.labels.as_ref())
                .and_then(|labels| labels.get(LABEL_NODE_KIND))
                .map(String::as_str)
                .unwrap_or("linux");
            vendors::console_shell(kind)
        }
        Err(_) => {
            let _ = socket
                .send(Message::Text(format!(
                    "\r\nError: container '{container}' not found or not running.\r\n"
                )))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    let exec = match st
        .docker
        .create_exec(
            &container,
            CreateExecOptions::<String> {
                cmd: Some(vec![shell.to_string()]),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(true),
                ..Default::default()
            },
        )
        .await
    {
        Ok(exec) => exec,
        Err(err) => {
            let _ = socket
                .send(Message::Text(format!(
                    "\r\nError: could not open console on {node_name}: {err}\r\n"
                )))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    let (mut output, mut input) = match st.docker.start_exec(&exec.id, None).await {
        Ok(StartExecResults::Attached { output, input }) => (output, input),
        Ok(StartExecResults::Detached) | Err(_) => {
            let _ = socket
                .send(Message::Text(format!(
                    "\r\nError: could not attach console on {node_name}\r\n"
                )))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    let _ = st
        .docker
        .resize_exec(
            &exec.id,
            ResizeExecOptions {
                height: 24,
                width: 80,
            },
        )
        .await;

    loop {
        tokio::select! {
            chunk = output.next() => {
                match chunk {
                    Some(Ok(log)) => {
                        let bytes = log.into_bytes().to_vec();
                        if socket.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "console output stream error");
                        break;
                    }
                    None => break,
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(control) = parse_control(&text) {
                            if control.kind == "resize" {
                                let _ = st
                                    .docker
                                    .resize_exec(
                                        &exec.id,
                                        ResizeExecOptions {
                                            height: control.rows,
                                            width: control.cols,
                                        },
                                    )
                                    .await;
                                continue;
                            }
                        }
                        if input.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if input.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "console websocket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = socket.close().await;
    info!(container = %container, "console session closed");
}

/// Only JSON objects are candidate control frames; everything else is
/// terminal input.
fn parse_control(text: &str) -> Option<ControlMessage> {
    if !text.starts_with('{') {
        return None;
    }
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frames_are_control_messages() {
        let control = parse_control(r#"{"type":"resize","rows":40,"cols":132}"#).unwrap();
        assert_eq!(control.kind, "resize");
        assert_eq!((control.rows, control.cols), (40, 132));
    }

    #[test]
    fn shell_input_is_not_a_control_message() {
        assert!(parse_control("ls -la\n").is_none());
        assert!(parse_control("{partial json").is_none());
    }
}
