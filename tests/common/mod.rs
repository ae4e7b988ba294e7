//! In-process peers for integration tests: a framed-TCP agent and a WebSocket
//! agent, both speaking the JSON-RPC superset.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use a2a_wire::{A2aError, A2aMessage, Frame, FrameCodec, FrameType, Value};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// Compute a reply for one of the methods the fake agents understand.
pub fn answer(request: &A2aMessage) -> Result<Value, A2aError> {
	match request.method.as_deref() {
		Some("math.add") => {
			let params = request.params.clone().unwrap_or_default();
			let a = params.get("a").and_then(Value::as_f64).unwrap_or_default();
			let b = params.get("b").and_then(Value::as_f64).unwrap_or_default();
			Ok(Value::from(a + b))
		},
		Some("llm.generate") => {
			let prompt = request
				.params
				.as_ref()
				.and_then(|p| p.get("prompt"))
				.and_then(Value::as_str)
				.unwrap_or_default();
			Ok([("content".to_string(), Value::from(format!("echo: {prompt}")))]
				.into_iter()
				.collect())
		},
		Some("ping") => Ok(Value::from("pong")),
		other => Err(A2aError::capability_not_found(format!(
			"unknown method {other:?}"
		))),
	}
}

/// A framed-TCP agent answering requests until the client disconnects.
pub async fn spawn_tcp_agent() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((socket, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let mut framed = Framed::new(socket, FrameCodec::default());
				while let Some(Ok(frame)) = framed.next().await {
					match frame.frame_type {
						FrameType::Ping => {
							let _ = framed.send(Frame::pong()).await;
						},
						FrameType::Message => {
							let Ok(request) = A2aMessage::from_slice(&frame.payload) else {
								continue;
							};
							let reply = match answer(&request) {
								Ok(result) => A2aMessage::response_to(&request, result, "tcp-agent"),
								Err(e) => A2aMessage::error_response_to(&request, &e, "tcp-agent"),
							};
							let _ = framed
								.send(Frame::response(reply.to_bytes().unwrap()))
								.await;
						},
						_ => {},
					}
				}
			});
		}
	});
	addr
}

/// A WebSocket agent that closes the connection after every
/// `close_after_messages` responses, to exercise client reconnection.
pub struct WsAgent {
	pub addr: SocketAddr,
	pub connections: Arc<AtomicU32>,
}

pub async fn spawn_ws_agent(close_after_messages: Option<u32>) -> WsAgent {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let connections = Arc::new(AtomicU32::new(0));
	let conn_counter = connections.clone();
	tokio::spawn(async move {
		loop {
			let Ok((socket, _)) = listener.accept().await else {
				return;
			};
			conn_counter.fetch_add(1, Ordering::SeqCst);
			tokio::spawn(async move {
				let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
					return;
				};
				let mut answered: u32 = 0;
				while let Some(Ok(msg)) = ws.next().await {
					use tokio_tungstenite::tungstenite::Message;
					let Message::Text(text) = msg else { continue };
					let Ok(request) = A2aMessage::from_slice(text.as_bytes()) else {
						continue;
					};
					let reply = match answer(&request) {
						Ok(result) => A2aMessage::response_to(&request, result, "ws-agent"),
						Err(e) => A2aMessage::error_response_to(&request, &e, "ws-agent"),
					};
					let body = serde_json::to_string(&reply).unwrap();
					if ws.send(Message::text(body)).await.is_err() {
						return;
					}
					answered += 1;
					if close_after_messages.is_some_and(|n| answered >= n) {
						let _ = ws.close(None).await;
						return;
					}
				}
			});
		}
	});
	WsAgent { addr, connections }
}
