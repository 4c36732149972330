/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
//! socket.io v4 (engine.io v4) over a plain websocket.
//!
//! Only the default namespace and the websocket transport are supported, which is
//! all the ride server exposes.

use super::events::WireEvent;
use super::transport::{ConnectError, Transport, TransportLink, TransportSignal};
use crate::common::types::Token;
use crate::tools::error::AppError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    Connect(Value),
    Disconnect,
    Event(WireEvent),
    ConnectError(String),
}

pub fn encode_connect(token: &Token) -> String {
    format!("40{}", json!({ "token": token.0 }))
}

pub fn encode_event(WireEvent { name, payload }: &WireEvent) -> Result<String, AppError> {
    let body = serde_json::to_string(&json!([name, payload]))
        .map_err(|err| AppError::SerializationError(err.to_string()))?;
    Ok(format!("42{body}"))
}

pub fn decode_packet(text: &str) -> Result<Packet, AppError> {
    let mut chars = text.chars();
    let engine_type = chars
        .next()
        .ok_or_else(|| AppError::DeserializationError("Empty packet".to_string()))?;
    let rest = chars.as_str();
    match engine_type {
        '0' => Ok(Packet::Open(parse_json(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '6' => Ok(Packet::Noop),
        '4' => decode_socket_packet(rest),
        other => Err(AppError::DeserializationError(format!(
            "Unsupported engine.io packet type : {other}"
        ))),
    }
}

fn decode_socket_packet(text: &str) -> Result<Packet, AppError> {
    let mut chars = text.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| AppError::DeserializationError("Empty socket.io packet".to_string()))?;
    let body = skip_ack_id(skip_namespace(chars.as_str()));
    match socket_type {
        '0' => Ok(Packet::Connect(if body.is_empty() {
            Value::Null
        } else {
            parse_json(body)?
        })),
        '1' => Ok(Packet::Disconnect),
        '2' => match parse_json(body)? {
            Value::Array(mut items) if !items.is_empty() => {
                let name = match items.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(AppError::DeserializationError(format!(
                            "Event name is not a string : {other}"
                        )))
                    }
                };
                let payload = if items.is_empty() {
                    Value::Null
                } else {
                    items.remove(0)
                };
                Ok(Packet::Event(WireEvent { name, payload }))
            }
            other => Err(AppError::DeserializationError(format!(
                "Malformed event packet : {other}"
            ))),
        },
        '4' => {
            let value = if body.is_empty() {
                Value::Null
            } else {
                parse_json(body)?
            };
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| value.as_str())
                .unwrap_or("connect_error")
                .to_string();
            Ok(Packet::ConnectError(message))
        }
        other => Err(AppError::DeserializationError(format!(
            "Unsupported socket.io packet type : {other}"
        ))),
    }
}

fn skip_namespace(text: &str) -> &str {
    if text.starts_with('/') {
        match text.find(',') {
            Some(index) => &text[index + 1..],
            None => "",
        }
    } else {
        text
    }
}

fn skip_ack_id(text: &str) -> &str {
    text.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_json(text: &str) -> Result<Value, AppError> {
    serde_json::from_str(text).map_err(|err| AppError::DeserializationError(err.to_string()))
}

/// `ws(s)://host/socket.io/?EIO=4&transport=websocket`, accepting `http(s)` base urls too.
pub fn socket_url(base: &Url) -> Result<Url, AppError> {
    let mut url = base.to_owned();
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AppError::InvalidConfiguration(format!(
                "Unsupported channel scheme : {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| AppError::InvalidConfiguration(base.to_string()))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

pub struct SocketIoTransport {
    url: Url,
    handshake_timeout: Duration,
}

impl SocketIoTransport {
    pub fn new(base: &Url, handshake_timeout: Duration) -> Result<Self, AppError> {
        Ok(SocketIoTransport {
            url: socket_url(base)?,
            handshake_timeout,
        })
    }
}

#[async_trait]
impl Transport for SocketIoTransport {
    async fn open(&self, token: &Token) -> Result<TransportLink, ConnectError> {
        let (mut stream, _) =
            tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| ConnectError::Unreachable("Handshake timed out".to_string()))?
                .map_err(|err| ConnectError::Unreachable(err.to_string()))?;

        let handshake = async {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => return Err(ConnectError::Unreachable(err.to_string())),
                };
                match decode_packet(&text) {
                    Ok(Packet::Open(open)) => {
                        debug!(tag = "[Socket.io]", open = %open, "Engine opened");
                        stream
                            .send(Message::Text(encode_connect(token)))
                            .await
                            .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
                    }
                    Ok(Packet::Ping) => {
                        stream
                            .send(Message::Text("3".to_string()))
                            .await
                            .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
                    }
                    Ok(Packet::Connect(_)) => return Ok(()),
                    Ok(Packet::ConnectError(reason)) => return Err(ConnectError::Rejected(reason)),
                    Ok(packet) => debug!(tag = "[Socket.io]", packet = ?packet, "Ignored during handshake"),
                    Err(err) => warn!(tag = "[Socket.io]", error = %err, "Undecodable handshake packet"),
                }
            }
            Err(ConnectError::Unreachable("Closed during handshake".to_string()))
        };

        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| ConnectError::Unreachable("Handshake timed out".to_string()))??;

        info!(tag = "[Socket.io]", url = %self.url, "Connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportSignal>();

        let (mut sink, mut source) = stream.split();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(event) => match encode_event(&event) {
                            Ok(text) => {
                                if let Err(err) = sink.send(Message::Text(text)).await {
                                    break format!("transport error : {err}");
                                }
                            }
                            Err(err) => error!(tag = "[Socket.io]", event = %event.name, error = %err, "Failed to encode event"),
                        },
                        None => {
                            let _ = sink.send(Message::Text("41".to_string())).await;
                            let _ = sink.close().await;
                            break "io client disconnect".to_string();
                        }
                    },
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match decode_packet(&text) {
                            Ok(Packet::Ping) => {
                                if let Err(err) = sink.send(Message::Text("3".to_string())).await {
                                    break format!("transport error : {err}");
                                }
                            }
                            Ok(Packet::Event(event)) => {
                                if inbound_tx.send(TransportSignal::Event(event)).is_err() {
                                    break "io client disconnect".to_string();
                                }
                            }
                            Ok(Packet::ConnectError(reason)) => {
                                let _ = inbound_tx.send(TransportSignal::Rejected(reason));
                                return;
                            }
                            Ok(Packet::Disconnect) => break "io server disconnect".to_string(),
                            Ok(Packet::Close) => break "transport close".to_string(),
                            Ok(_) => {}
                            Err(err) => warn!(tag = "[Socket.io]", error = %err, "Dropping undecodable packet"),
                        },
                        Some(Ok(Message::Close(_))) | None => break "transport close".to_string(),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break format!("transport error : {err}"),
                    },
                }
            };
            let _ = inbound_tx.send(TransportSignal::Closed(reason));
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
