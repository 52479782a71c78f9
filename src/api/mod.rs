//! Bilibili web API client.
//!
//! Wraps `reqwest` with the default browser headers, session cookies and WBI
//! request signing the platform expects. Every response arrives in the
//! `{code, message, ttl, data}` envelope; a non-accepted `code` becomes a
//! typed [`ApiError`].

pub mod wbi;

use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::settings;
use wbi::WbiKeys;

/// Session credential captured by the QR login flow and replayed as cookies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    pub sess_data: String,
    pub bili_jct: String,
    pub dede_user_id: String,
    pub dede_user_id_ck_md5: String,
    #[serde(default)]
    pub buvid3: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("code: {code}, message: {message}")]
    Api { code: i64, message: String },
    #[error("not logged in, call Client::login first")]
    NeedLogin,
}

impl ApiError {
    /// The platform reports an expired or missing session as code -101.
    pub fn is_credential_expired(&self) -> bool {
        matches!(self, ApiError::Api { code: -101, .. })
    }
}

/// Standard response envelope around every endpoint's payload.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    ttl: i64,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// The body is an API error iff `code` is not in the accepted set.
    fn data_or_error(self, accepted: &[i64]) -> Result<T, ApiError> {
        if accepted.contains(&self.code) {
            self.data.ok_or(ApiError::Api {
                code: self.code,
                message: "response has no data".to_string(),
            })
        } else {
            Err(ApiError::Api {
                code: self.code,
                message: self.message,
            })
        }
    }
}

pub struct Client {
    http: reqwest::Client,
    credential: RwLock<Option<Credential>>,
    /// Refreshed lazily under this mutex; see [`wbi::WbiKeys::is_stale`].
    wbi: Mutex<WbiKeys>,
}

impl Client {
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(settings::USER_AGENT));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            http,
            credential: RwLock::new(None),
            wbi: Mutex::new(WbiKeys::default()),
        })
    }

    /// Install the credential used for all subsequent authenticated calls.
    pub fn login(&self, credential: Credential) {
        *self.credential.write().unwrap() = Some(credential);
    }

    fn credential(&self) -> Result<Credential, ApiError> {
        self.credential
            .read()
            .unwrap()
            .clone()
            .ok_or(ApiError::NeedLogin)
    }

    /// `SESSDATA`, `buvid3` and `bili_jct` cookies for authenticated calls;
    /// empty when not logged in.
    fn cookie_header(&self) -> String {
        let Some(cred) = self.credential.read().unwrap().clone() else {
            return String::new();
        };

        let mut cookies = format!("SESSDATA={}", cred.sess_data);
        if !cred.buvid3.is_empty() {
            cookies.push_str(&format!("; buvid3={}", cred.buvid3));
        }
        if !cred.bili_jct.is_empty() {
            cookies.push_str(&format!("; bili_jct={}", cred.bili_jct));
        }
        cookies
    }

    async fn get_envelope<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        accepted: &[i64],
    ) -> Result<T> {
        let resp = self
            .http
            .get(url)
            .header(COOKIE, self.cookie_header())
            .send()
            .await
            .with_context(|| format!("request failed: {}", url))?;

        let envelope: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("failed to decode response: {}", url))?;

        Ok(envelope.data_or_error(accepted)?)
    }

    /// Refresh the WBI key halves from the nav endpoint when stale, then sign
    /// the parameters into a ready-to-append query string.
    ///
    /// The nav endpoint also returns keys for anonymous sessions (code -101),
    /// so an expired credential does not block signing itself.
    async fn signed_query(&self, params: &[(&str, String)]) -> Result<String> {
        let mut wbi = self.wbi.lock().await;

        if wbi.is_stale() {
            let nav: NavData = self
                .get_envelope(
                    &format!("{}/x/web-interface/nav", settings::API_BASE),
                    &[0, -101],
                )
                .await
                .context("failed to fetch wbi keys")?;

            let img_key = key_from_url(&nav.wbi_img.img_url);
            let sub_key = key_from_url(&nav.wbi_img.sub_url);
            if img_key.is_empty() || sub_key.is_empty() {
                return Err(anyhow!(
                    "nav returned empty wbi key urls: {:?}",
                    nav.wbi_img
                ));
            }

            wbi.set_keys(img_key, sub_key);
        }

        Ok(wbi.sign(params, chrono::Utc::now().timestamp()))
    }

    // ========================================================================
    // Device / login endpoints
    // ========================================================================

    pub async fn get_buvid(&self) -> Result<Buvid> {
        self.get_envelope(
            &format!("{}/x/frontend/finger/spi", settings::API_BASE),
            &[0],
        )
        .await
    }

    pub async fn get_login_qrcode(&self) -> Result<QrCode> {
        self.get_envelope(
            &format!(
                "{}/x/passport-login/web/qrcode/generate",
                settings::PASSPORT_BASE
            ),
            &[0],
        )
        .await
    }

    /// Poll the QR login state. On success the new credential is parsed out
    /// of the response `Set-Cookie` headers.
    pub async fn poll_login(&self, qrcode_key: &str) -> Result<(LoginPoll, Option<Credential>)> {
        let url = format!(
            "{}/x/passport-login/web/qrcode/poll?qrcode_key={}",
            settings::PASSPORT_BASE,
            qrcode_key
        );

        let resp = self
            .http
            .get(&url)
            .header(COOKIE, self.cookie_header())
            .send()
            .await
            .context("login poll request failed")?;

        let set_cookies: Vec<String> = resp
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();

        let envelope: ApiResponse<LoginPoll> = resp
            .json()
            .await
            .context("failed to decode login poll response")?;
        let poll = envelope.data_or_error(&[0])?;

        let credential = if poll.code == LoginPoll::SUCCESS {
            Some(credential_from_set_cookies(&set_cookies)?)
        } else {
            None
        };

        Ok((poll, credential))
    }

    // ========================================================================
    // Profile endpoints
    // ========================================================================

    /// Profile of the logged-in account. WBI-signed. Surfaces code -101 to
    /// the caller so startup can detect an expired credential.
    pub async fn get_my_info(&self) -> Result<AccountInfo> {
        self.credential()?;
        let query = self.signed_query(&[]).await?;
        self.get_envelope(
            &format!("{}/x/space/myinfo?{}", settings::API_BASE, query),
            &[0],
        )
        .await
    }

    /// Profile of an arbitrary viewer. WBI-signed.
    pub async fn get_user_info(&self, uid: i64) -> Result<AccountInfo> {
        self.credential()?;
        let query = self.signed_query(&[("mid", uid.to_string())]).await?;
        self.get_envelope(
            &format!("{}/x/space/wbi/acc/info?{}", settings::API_BASE, query),
            &[0],
        )
        .await
    }

    // ========================================================================
    // Live room endpoints
    // ========================================================================

    /// Danmaku stream directory: auth token plus the endpoint list the stream
    /// driver round-robins over. WBI-signed.
    pub async fn get_stream_info(&self, room_id: i64) -> Result<StreamInfo> {
        self.credential()?;
        let query = self.signed_query(&[("id", room_id.to_string())]).await?;
        self.get_envelope(
            &format!(
                "{}/xlive/web-room/v1/index/getDanmuInfo?{}",
                settings::LIVE_API_BASE,
                query
            ),
            &[0],
        )
        .await
    }

    pub async fn get_room_gift_list(&self, room_id: i64) -> Result<RoomGiftList> {
        self.get_envelope(
            &format!(
                "{}/xlive/web-room/v1/giftPanel/roomGiftList?platform=pc&room_id={}",
                settings::LIVE_API_BASE,
                room_id
            ),
            &[0],
        )
        .await
    }

    pub async fn get_blind_box_config(&self, gift_id: i64) -> Result<BlindBoxConfig> {
        self.get_envelope(
            &format!(
                "{}/xlive/general-interface/v1/blindFirstWin/getInfo?gift_id={}",
                settings::LIVE_API_BASE,
                gift_id
            ),
            &[0],
        )
        .await
    }

    // ========================================================================
    // Chat
    // ========================================================================

    /// Post a chat message into the room. Messages longer than 20 code points
    /// are split into consecutive 20-rune chunks posted separately; a failed
    /// chunk does not stop the rest.
    pub async fn send_chat(&self, room_id: i64, params: ChatParams) -> Result<()> {
        if params.msg.is_empty() {
            return Err(anyhow!("refusing to send an empty chat message"));
        }
        let cred = self.credential()?;

        let url = format!("{}/msg/send", settings::LIVE_API_BASE);
        let mut errors: Vec<String> = Vec::new();

        for chunk in chunk_msg(&params.msg, settings::MAX_CHAT_MSG_RUNES) {
            let rnd = chrono::Utc::now().timestamp().to_string();
            let mut form: Vec<(&str, String)> = vec![
                ("csrf", cred.bili_jct.clone()),
                ("csrf_token", cred.bili_jct.clone()),
                ("roomid", room_id.to_string()),
                ("msg", chunk),
                ("rnd", rnd),
                ("fontsize", params.fontsize.to_string()),
                ("color", params.color.to_string()),
                ("mode", params.mode.to_string()),
            ];
            if params.reply_mid != 0 {
                form.push(("reply_mid", params.reply_mid.to_string()));
            }

            let result: Result<()> = async {
                let resp = self
                    .http
                    .post(&url)
                    .header(COOKIE, self.cookie_header())
                    .form(&form)
                    .send()
                    .await
                    .context("chat send request failed")?;

                let envelope: ApiResponse<SentChatInfo> = resp
                    .json()
                    .await
                    .context("failed to decode chat send response")?;
                envelope.data_or_error(&[0])?;
                Ok(())
            }
            .await;

            if let Err(e) = result {
                errors.push(format!("{:#}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("chat send failed: {}", errors.join("; ")))
        }
    }
}

/// Split a message into chunks of at most `max_runes` code points each.
pub fn chunk_msg(msg: &str, max_runes: usize) -> Vec<String> {
    if max_runes == 0 {
        return vec![msg.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for c in msg.chars() {
        current.push(c);
        count += 1;
        if count >= max_runes {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// `https://i0.hdslb.com/bfs/wbi/<key>.png` -> `<key>`
fn key_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_end_matches(".png")
        .to_string()
}

fn credential_from_set_cookies(set_cookies: &[String]) -> Result<Credential> {
    let mut cred = Credential::default();

    for cookie in set_cookies {
        let Some((name, rest)) = cookie.split_once('=') else {
            continue;
        };
        let value = rest.split(';').next().unwrap_or_default().to_string();
        match name {
            "SESSDATA" => cred.sess_data = value,
            "bili_jct" => cred.bili_jct = value,
            "DedeUserID" => cred.dede_user_id = value,
            "DedeUserID__ckMd5" => cred.dede_user_id_ck_md5 = value,
            _ => {}
        }
    }

    // These two are mandatory for every authenticated call; their absence
    // means the login response is unusable.
    if cred.sess_data.is_empty() {
        return Err(anyhow!("SESSDATA missing from login cookies"));
    }
    if cred.bili_jct.is_empty() {
        return Err(anyhow!("bili_jct missing from login cookies"));
    }

    Ok(cred)
}

// ============================================================================
// Endpoint payloads
// ============================================================================

/// Device identifiers from the finger/spi endpoint.
#[derive(Debug, Deserialize)]
pub struct Buvid {
    pub b_3: String,
    pub b_4: String,
}

#[derive(Debug, Deserialize)]
pub struct QrCode {
    pub url: String,
    pub qrcode_key: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginPoll {
    pub code: i64,
    pub message: String,
}

impl LoginPoll {
    pub const SUCCESS: i64 = 0;
    pub const EXPIRED: i64 = 86038;
    pub const SCANNED: i64 = 86090;
    pub const UNSCANNED: i64 = 86101;
}

#[derive(Debug, Deserialize)]
struct NavData {
    wbi_img: WbiImg,
}

#[derive(Debug, Deserialize)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

/// Profile fields shared by the myinfo and acc/info endpoints.
#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    pub mid: i64,
    pub name: String,
    pub face: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamInfo {
    pub token: String,
    pub host_list: Vec<LiveEndpoint>,
}

/// One danmaku server the stream driver can connect to.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub wss_port: u16,
    #[serde(default)]
    pub ws_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct RoomGiftList {
    pub gift_config: GiftConfig,
}

#[derive(Debug, Deserialize)]
pub struct GiftConfig {
    pub base_config: GiftBaseConfig,
}

#[derive(Debug, Deserialize)]
pub struct GiftBaseConfig {
    #[serde(rename = "list")]
    pub gift_list: Vec<GiftItem>,
}

#[derive(Debug, Deserialize)]
pub struct GiftItem {
    pub id: i64,
    pub name: String,
    pub price: i64,
    pub coin_type: String,
    #[serde(rename = "img_basic")]
    pub img_url: String,
}

#[derive(Debug, Deserialize)]
pub struct BlindBoxConfig {
    #[serde(default)]
    pub node_text: String,
    #[serde(default)]
    pub blind_price: i64,
    #[serde(default)]
    pub blind_gift_name: String,
    #[serde(rename = "gifts")]
    pub outcome_gifts: Vec<BlindOutcomeGift>,
}

#[derive(Debug, Deserialize)]
pub struct BlindOutcomeGift {
    pub gift_id: i64,
    pub gift_name: String,
    pub price: i64,
    #[serde(rename = "gift_img", default)]
    pub img_url: String,
    #[serde(default)]
    pub chance: String,
}

#[derive(Debug, Deserialize)]
struct SentChatInfo {
    #[serde(default)]
    #[allow(dead_code)]
    extra: String,
}

/// Parameters for a chat send; defaults match the web client.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub msg: String,
    /// 0 means no reply target.
    pub reply_mid: i64,
    /// 1 = scrolling.
    pub mode: i64,
    pub fontsize: i64,
    /// 16777215 = white.
    pub color: i64,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            msg: String::new(),
            reply_mid: 0,
            mode: 1,
            fontsize: 25,
            color: 16777215,
        }
    }
}
