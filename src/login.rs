//! Interactive QR login and credential caching.
//!
//! The credential lives in `credential.json` under the creds directory. A
//! file that fails to parse is assumed corrupted, deleted, and the user is
//! sent back through the QR flow.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use qrcode::render::unicode;
use qrcode::QrCode;
use tracing::error;

use crate::api::{Client, Credential, LoginPoll};

const CREDENTIAL_FILE: &str = "credential.json";

fn credential_path(dir: &Path) -> PathBuf {
    dir.join(CREDENTIAL_FILE)
}

/// Load the cached credential, or `None` when there is none (including the
/// corrupted-file case, which removes the file).
pub fn cached_credential(dir: &Path) -> Result<Option<Credential>> {
    let path = credential_path(dir);

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("failed to read cached credential"),
    };

    match serde_json::from_slice(&bytes) {
        Ok(credential) => Ok(Some(credential)),
        Err(_) => {
            error!("credential.json failed to parse, removing the damaged file");
            let _ = std::fs::remove_file(&path);
            Ok(None)
        }
    }
}

pub fn save_credential(dir: &Path, credential: &Credential) -> Result<()> {
    let bytes = serde_json::to_vec(credential).context("failed to encode credential")?;
    std::fs::write(credential_path(dir), bytes).context("failed to write credential")
}

/// Remove the cached credential, e.g. after the platform reports it expired.
pub fn clear_credential(dir: &Path) {
    let _ = std::fs::remove_file(credential_path(dir));
}

/// Drive the interactive login:
/// 1. Request a login QR code and display it in the terminal.
/// 2. Poll the login status every second:
///    - unscanned: keep waiting for the scan,
///    - scanned: wait for in-app confirmation,
///    - expired: start over with a fresh code,
///    - success: return the captured credential.
pub async fn interactive_login(client: &Client) -> Result<Credential> {
    loop {
        println!("Fetching Bilibili login QR code...");
        let qr = client
            .get_login_qrcode()
            .await
            .context("failed to fetch login qr code")?;

        let rendered = QrCode::new(qr.url.as_bytes())
            .context("failed to build qr code")?
            .render::<unicode::Dense1x2>()
            .build();
        println!("{}", rendered);
        println!("Scan the QR code with the Bilibili app to log in.");

        loop {
            let (poll, credential) = client
                .poll_login(&qr.qrcode_key)
                .await
                .context("login poll failed")?;

            match poll.code {
                LoginPoll::SUCCESS => {
                    println!("Logged in.");
                    return credential.context("login succeeded but no credential was returned");
                }
                LoginPoll::EXPIRED => {
                    println!("QR code expired, requesting a new one...");
                    break;
                }
                LoginPoll::SCANNED => {
                    println!("Scanned. Confirm the login in the Bilibili app.");
                }
                LoginPoll::UNSCANNED => {}
                other => {
                    println!("Unexpected login state {}: {}", other, poll.message);
                }
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
