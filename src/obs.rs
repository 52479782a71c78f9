//! OBS integration: a thin obs-websocket (v5) client plus the `boxtroll`
//! text source the leaderboard is rendered into.
//!
//! The adapter is driven entirely by the aggregator's 5s ticker and is
//! effectively single-threaded: a lost connection only flips `reconnect`,
//! and the next tick re-dials before rendering.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

/// Name of the text input the leaderboard is rendered into.
pub const OBS_SOURCE_NAME: &str = "boxtroll";

/// Request-status code the server returns when the input already exists.
const CODE_RESOURCE_ALREADY_EXISTS: i64 = 601;

#[derive(Debug, thiserror::Error)]
pub enum ObsError {
    /// The websocket is gone; the caller should reconnect and retry later.
    #[error("obs websocket disconnected")]
    Disconnected,
    #[error("obs request failed (code {code}): {comment}")]
    Request { code: i64, comment: String },
    #[error("{0}")]
    Protocol(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Minimal obs-websocket v5 client: identify once, then serial
/// request/response pairs.
pub struct ObsClient {
    ws: WsStream,
    next_request_id: u64,
}

impl ObsClient {
    /// Dial the control socket and complete the Hello / Identify handshake.
    pub async fn connect(addr: &str, password: &str) -> Result<Self> {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to obs websocket at {}", url))?;

        let mut client = Self {
            ws,
            next_request_id: 0,
        };

        let hello = client.read_op(0).await.context("waiting for obs hello")?;

        let authentication = hello
            .get("authentication")
            .map(|auth| -> Result<String> {
                let challenge = auth
                    .get("challenge")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("obs hello has no challenge"))?;
                let salt = auth
                    .get("salt")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("obs hello has no salt"))?;
                Ok(auth_token(password, salt, challenge))
            })
            .transpose()?;

        let mut identify = json!({ "rpcVersion": 1 });
        if let Some(auth) = authentication {
            identify["authentication"] = Value::String(auth);
        }
        client
            .send(json!({ "op": 1, "d": identify }))
            .await
            .context("failed to send obs identify")?;

        client
            .read_op(2)
            .await
            .context("waiting for obs identified")?;

        Ok(client)
    }

    pub async fn get_version(&mut self) -> Result<Value, ObsError> {
        self.request("GetVersion", json!({})).await
    }

    pub async fn get_input_kind_list(&mut self) -> Result<Vec<String>, ObsError> {
        let data = self.request("GetInputKindList", json!({})).await?;
        let kinds = data
            .get("inputKinds")
            .and_then(Value::as_array)
            .ok_or_else(|| ObsError::Protocol("GetInputKindList returned no inputKinds".into()))?;
        Ok(kinds
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    pub async fn get_current_program_scene(&mut self) -> Result<String, ObsError> {
        let data = self.request("GetCurrentProgramScene", json!({})).await?;
        data.get("currentProgramSceneName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ObsError::Protocol("GetCurrentProgramScene returned no name".into()))
    }

    pub async fn create_input(
        &mut self,
        scene_name: &str,
        input_name: &str,
        input_kind: &str,
        input_settings: Value,
    ) -> Result<Value, ObsError> {
        self.request(
            "CreateInput",
            json!({
                "sceneName": scene_name,
                "inputName": input_name,
                "inputKind": input_kind,
                "inputSettings": input_settings,
                "sceneItemEnabled": true,
            }),
        )
        .await
    }

    pub async fn set_input_settings(
        &mut self,
        input_name: &str,
        input_settings: Value,
    ) -> Result<Value, ObsError> {
        self.request(
            "SetInputSettings",
            json!({
                "inputName": input_name,
                "inputSettings": input_settings,
            }),
        )
        .await
    }

    async fn request(&mut self, request_type: &str, data: Value) -> Result<Value, ObsError> {
        self.next_request_id += 1;
        let request_id = self.next_request_id.to_string();

        self.send(json!({
            "op": 6,
            "d": {
                "requestType": request_type,
                "requestId": request_id,
                "requestData": data,
            }
        }))
        .await
        .map_err(|_| ObsError::Disconnected)?;

        loop {
            let frame = self.read_frame().await?;
            if frame.get("op").and_then(Value::as_i64) != Some(7) {
                // Events and other pushes are not our concern.
                continue;
            }

            let d = frame.get("d").cloned().unwrap_or(Value::Null);
            if d.get("requestId").and_then(Value::as_str) != Some(request_id.as_str()) {
                continue;
            }

            let status = d.get("requestStatus").cloned().unwrap_or(Value::Null);
            if status.get("result").and_then(Value::as_bool) == Some(true) {
                return Ok(d.get("responseData").cloned().unwrap_or(json!({})));
            }

            return Err(ObsError::Request {
                code: status.get("code").and_then(Value::as_i64).unwrap_or(-1),
                comment: status
                    .get("comment")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }

    async fn send(&mut self, value: Value) -> Result<()> {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .context("obs websocket send failed")
    }

    /// Next JSON frame from the socket; any transport failure means the
    /// connection is gone.
    async fn read_frame(&mut self) -> Result<Value, ObsError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| ObsError::Protocol(format!("bad obs frame: {}", e)));
                }
                Some(Ok(Message::Close(_))) | None => return Err(ObsError::Disconnected),
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Err(ObsError::Disconnected),
            }
        }
    }

    /// Read frames until one with the given op arrives; used for the
    /// handshake only.
    async fn read_op(&mut self, op: i64) -> Result<Value> {
        loop {
            let frame = self.read_frame().await?;
            if frame.get("op").and_then(Value::as_i64) == Some(op) {
                return Ok(frame.get("d").cloned().unwrap_or(json!({})));
            }
        }
    }
}

/// Identify auth string:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
fn auth_token(password: &str, salt: &str, challenge: &str) -> String {
    let secret = BASE64.encode(Sha256::digest(format!("{}{}", password, salt)));
    BASE64.encode(Sha256::digest(format!("{}{}", secret, challenge)))
}

/// The studio-side state owned by the aggregator.
pub struct Studio {
    addr: String,
    password: String,
    client: ObsClient,
    scene_name: String,
    input_kind: String,
    /// Set when the socket drops; honored on the next refresh tick.
    reconnect: bool,
}

impl Studio {
    /// Connect and make sure the `boxtroll` text source exists in the current
    /// program scene. Any failure other than "source already exists" is
    /// fatal for startup.
    pub async fn initialize(addr: String, password: String) -> Result<Self> {
        let mut client = ObsClient::connect(&addr, &password).await?;

        let version = client
            .get_version()
            .await
            .context("failed to query obs version")?;
        info!(
            obs_version = version.get("obsVersion").and_then(serde_json::Value::as_str).unwrap_or("?"),
            websocket_version = version
                .get("obsWebSocketVersion")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?"),
            "connected to obs"
        );

        let kinds = client
            .get_input_kind_list()
            .await
            .context("failed to list obs input kinds")?;
        let input_kind = kinds
            .into_iter()
            .find(|kind| kind.contains("text"))
            .ok_or_else(|| anyhow!("no text input kind available in obs"))?;
        info!(input_kind = %input_kind, "using text input kind");

        let scene_name = client
            .get_current_program_scene()
            .await
            .context("failed to get current program scene")?;
        info!(scene = %scene_name, "using program scene");

        let settings = json!({
            "text": "",
            "font": {
                "face": "Arial",
                "size": 36,
                "flags": 1,
            },
            "color": 0xFFFF_FFFFu32,
            "outline": true,
            "outline_size": 2,
            "outline_color": 0xFF00_0000u32,
        });

        match client
            .create_input(&scene_name, OBS_SOURCE_NAME, &input_kind, settings)
            .await
        {
            Ok(_) => info!(source = OBS_SOURCE_NAME, "created text source"),
            Err(ObsError::Request { code, .. }) if code == CODE_RESOURCE_ALREADY_EXISTS => {
                info!(source = OBS_SOURCE_NAME, "text source already exists");
            }
            Err(e) => return Err(anyhow!(e).context("failed to create obs text source")),
        }

        Ok(Self {
            addr,
            password,
            client,
            scene_name,
            input_kind,
            reconnect: false,
        })
    }

    /// Push new leaderboard text, reconnecting first if the previous tick
    /// lost the socket. Failures are logged and retried on the next tick.
    pub async fn update_text(&mut self, text: &str) {
        if self.reconnect {
            match ObsClient::connect(&self.addr, &self.password).await {
                Ok(mut client) => {
                    // The source may have been deleted while we were away;
                    // creation is idempotent, 601 means it is still there.
                    match client
                        .create_input(
                            &self.scene_name,
                            OBS_SOURCE_NAME,
                            &self.input_kind,
                            json!({ "text": "" }),
                        )
                        .await
                    {
                        Ok(_) | Err(ObsError::Request { code: CODE_RESOURCE_ALREADY_EXISTS, .. }) => {}
                        Err(e) => {
                            warn!(error = %e, "failed to re-create obs text source");
                            return;
                        }
                    }

                    info!("obs websocket reconnected");
                    self.client = client;
                    self.reconnect = false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to reconnect obs websocket");
                    return;
                }
            }
        }

        if text.is_empty() {
            return;
        }

        match self
            .client
            .set_input_settings(OBS_SOURCE_NAME, json!({ "text": text }))
            .await
        {
            Ok(_) => {}
            Err(ObsError::Disconnected) => {
                warn!("obs websocket lost, reconnecting on next refresh");
                self.reconnect = true;
            }
            Err(e) => warn!(error = %e, "failed to update obs text source"),
        }
    }

}
