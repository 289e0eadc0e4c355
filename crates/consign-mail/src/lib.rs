//! Mail relays used to deliver carrier manifests.
//!
//! A [`MailRelay`] takes one fully built [`MailMessage`] (sender, recipients,
//! subject, body and a single attachment) and either delivers it or fails.
//! Delivery is synchronous and bounded by the relay's timeout; a timeout is a
//! failure like any other.
//!
//! Two relays are provided:
//!
//! - [`HttpMailRelay`] posts the message as JSON to an HTTP mail gateway,
//!   with the attachment base64-encoded, an optional bearer token and an
//!   optional HMAC-SHA256 signature header.
//! - [`SpoolRelay`] drops each message as a JSON file into a directory, for
//!   pickup by a separate mailer.
//!
//! # Example
//!
//! ```ignore
//! use consign_mail::{relay_from_config, Attachment, MailMessage, RelayConfig};
//!
//! let relay = relay_from_config(&RelayConfig::Spool { dir: "outbox".into() })?;
//! relay.send(&MailMessage {
//!     from: "dispatch@example.com".to_string(),
//!     to: vec!["manifests@carrier.example".to_string()],
//!     subject: "Manifest".to_string(),
//!     body: "See attachment".to_string(),
//!     attachment: Attachment::new("manifest.json", "application/json", b"{}".to_vec()),
//! })?;
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Header carrying the HMAC-SHA256 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-Consign-Signature";

/// The single file attached to a manifest email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: &str, content_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            bytes,
        }
    }
}

/// An email ready to hand to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachment: Attachment,
}

/// Something that can deliver a [`MailMessage`].
pub trait MailRelay: Send + Sync {
    /// Deliver the message; `Ok` means the relay accepted it.
    fn send(&self, message: &MailMessage) -> Result<()>;

    /// Human readable destination, for logs.
    fn describe(&self) -> String;
}

/// Relay configuration, as written in `.consign.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayConfig {
    /// HTTP mail gateway
    Http {
        url: String,
        /// Bearer token sent in the Authorization header
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Secret used to sign request bodies
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        /// Request timeout (e.g. "30s")
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
    /// Directory drop
    Spool { dir: PathBuf },
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Build the relay described by a configuration entry.
pub fn relay_from_config(config: &RelayConfig) -> Result<Box<dyn MailRelay>> {
    match config {
        RelayConfig::Http {
            url,
            token,
            secret,
            timeout,
        } => Ok(Box::new(HttpMailRelay::new(
            url,
            token.clone(),
            secret.clone(),
            *timeout,
        )?)),
        RelayConfig::Spool { dir } => Ok(Box::new(SpoolRelay::new(dir.clone()))),
    }
}

/// JSON document a relay receives for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailPayload {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub filename: String,
    pub content_type: String,
    pub content_base64: String,
}

impl MailPayload {
    pub fn from_message(message: &MailMessage) -> Self {
        Self {
            from: message.from.clone(),
            to: message.to.clone(),
            subject: message.subject.clone(),
            text: message.body.clone(),
            attachments: vec![AttachmentPayload {
                filename: message.attachment.filename.clone(),
                content_type: message.attachment.content_type.clone(),
                content_base64: STANDARD.encode(&message.attachment.bytes),
            }],
        }
    }

    /// Decode the attachment bytes at `idx`.
    pub fn attachment_bytes(&self, idx: usize) -> Result<Vec<u8>> {
        let attachment = self
            .attachments
            .get(idx)
            .with_context(|| format!("no attachment at index {idx}"))?;
        STANDARD
            .decode(&attachment.content_base64)
            .context("attachment is not valid base64")
    }
}

/// Relay that posts messages to an HTTP mail gateway.
pub struct HttpMailRelay {
    client: reqwest::blocking::Client,
    url: String,
    token: Option<String>,
    secret: Option<String>,
}

impl HttpMailRelay {
    pub fn new(
        url: &str,
        token: Option<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if url.is_empty() {
            anyhow::bail!("mail relay URL is empty");
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build mail relay HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            token,
            secret,
        })
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid signing secret: {e}"))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl MailRelay for HttpMailRelay {
    fn send(&self, message: &MailMessage) -> Result<()> {
        let json = serde_json::to_string(&MailPayload::from_message(message))
            .context("failed to serialize mail payload")?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(secret) = &self.secret {
            let signature = sign_body(secret, json.as_bytes())?;
            request = request.header(SIGNATURE_HEADER, format!("sha256={signature}"));
        }

        let response = request
            .body(json)
            .send()
            .with_context(|| format!("failed to reach mail relay {}", self.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("mail relay returned error status {}: {}", status, body);
        }

        Ok(())
    }

    fn describe(&self) -> String {
        format!("http relay {}", self.url)
    }
}

/// Relay that writes each message into a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolRelay {
    dir: PathBuf,
}

impl SpoolRelay {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read back every spooled message, oldest first.
    pub fn spooled(&self) -> Result<Vec<MailPayload>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list spool dir {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        paths
            .iter()
            .map(|path| {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("failed to read spooled mail {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse spooled mail {}", path.display()))
            })
            .collect()
    }
}

fn spool_name(attachment: &str) -> String {
    let safe: String = attachment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.6f"), safe)
}

impl MailRelay for SpoolRelay {
    fn send(&self, message: &MailMessage) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create spool dir {}", self.dir.display()))?;

        let json = serde_json::to_string_pretty(&MailPayload::from_message(message))
            .context("failed to serialize mail payload")?;

        let path = self.dir.join(spool_name(&message.attachment.filename));
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create spool file {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write spool file {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync spool file")?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename spool file to {}", path.display()))?;

        Ok(())
    }

    fn describe(&self) -> String {
        format!("spool {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::thread;

    use tempfile::tempdir;
    use tiny_http::{Response, Server, StatusCode};

    use super::*;

    fn sample_message() -> MailMessage {
        MailMessage {
            from: "dispatch@example.com".to_string(),
            to: vec![
                "manifests@carrier.example".to_string(),
                "backup@carrier.example".to_string(),
            ],
            subject: "Manifest seur-main".to_string(),
            body: "2 shipments".to_string(),
            attachment: Attachment::new("seur-20240115.json", "application/json", b"{\"a\":1}".to_vec()),
        }
    }

    struct Captured {
        body: String,
        authorization: Option<String>,
        signature: Option<String>,
    }

    fn spawn_relay(status: u16) -> (String, thread::JoinHandle<Captured>) {
        let server = Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}/send", server.server_addr());
        let handle = thread::spawn(move || {
            let mut req = server.recv().expect("request");
            let header = |name: &'static str| {
                req.headers()
                    .iter()
                    .find(|h| h.field.equiv(name))
                    .map(|h| h.value.as_str().to_string())
            };
            let authorization = header("Authorization");
            let signature = header(SIGNATURE_HEADER);
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("body");
            req.respond(Response::from_string("{}").with_status_code(StatusCode(status)))
                .expect("respond");
            Captured {
                body,
                authorization,
                signature,
            }
        });
        (url, handle)
    }

    #[test]
    fn http_relay_posts_payload() {
        let (url, handle) = spawn_relay(200);
        let relay = HttpMailRelay::new(
            &url,
            Some("t0ken".to_string()),
            Some("s3cret".to_string()),
            Duration::from_secs(5),
        )
        .expect("relay");

        relay.send(&sample_message()).expect("send");

        let captured = handle.join().expect("join");
        let payload: MailPayload = serde_json::from_str(&captured.body).expect("payload");
        assert_eq!(payload.to.len(), 2);
        assert_eq!(payload.attachments[0].filename, "seur-20240115.json");
        assert_eq!(payload.attachment_bytes(0).expect("decode"), b"{\"a\":1}");
        assert_eq!(captured.authorization.as_deref(), Some("Bearer t0ken"));

        let expected = sign_body("s3cret", captured.body.as_bytes()).expect("sign");
        assert_eq!(captured.signature, Some(format!("sha256={expected}")));
    }

    #[test]
    fn http_relay_reports_error_status() {
        let (url, handle) = spawn_relay(503);
        let relay = HttpMailRelay::new(&url, None, None, Duration::from_secs(5)).expect("relay");

        let err = relay.send(&sample_message()).unwrap_err();
        assert!(err.to_string().contains("503"));
        let captured = handle.join().expect("join");
        assert!(captured.signature.is_none());
    }

    #[test]
    fn http_relay_times_out() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}/send", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            thread::sleep(Duration::from_millis(600));
            let _ = req.respond(Response::from_string("{}"));
        });

        let relay =
            HttpMailRelay::new(&url, None, None, Duration::from_millis(100)).expect("relay");
        assert!(relay.send(&sample_message()).is_err());
        handle.join().expect("join");
    }

    #[test]
    fn http_relay_requires_url() {
        assert!(HttpMailRelay::new("", None, None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn spool_relay_writes_messages() {
        let td = tempdir().expect("tempdir");
        let relay = SpoolRelay::new(td.path().join("outbox"));

        relay.send(&sample_message()).expect("send");
        relay.send(&sample_message()).expect("send");

        let spooled = relay.spooled().expect("spooled");
        assert_eq!(spooled.len(), 2);
        assert_eq!(spooled[0].subject, "Manifest seur-main");
        assert_eq!(spooled[1].attachment_bytes(0).expect("decode"), b"{\"a\":1}");
    }

    #[test]
    fn spool_relay_empty_dir() {
        let td = tempdir().expect("tempdir");
        let relay = SpoolRelay::new(td.path().join("missing"));
        assert!(relay.spooled().expect("spooled").is_empty());
        assert!(relay.describe().starts_with("spool "));
    }

    #[test]
    fn relay_config_from_toml() {
        let http: RelayConfig = toml::from_str(
            r#"
kind = "http"
url = "https://mail.example/send"
timeout = "5s"
"#,
        )
        .expect("parse");
        assert_eq!(
            http,
            RelayConfig::Http {
                url: "https://mail.example/send".to_string(),
                token: None,
                secret: None,
                timeout: Duration::from_secs(5),
            }
        );

        let spool: RelayConfig = toml::from_str("kind = \"spool\"\ndir = \"outbox\"").expect("parse");
        assert_eq!(spool, RelayConfig::Spool { dir: PathBuf::from("outbox") });
    }

    #[test]
    fn relay_config_default_timeout() {
        let http: RelayConfig =
            toml::from_str("kind = \"http\"\nurl = \"https://mail.example\"").expect("parse");
        match http {
            RelayConfig::Http { timeout, .. } => assert_eq!(timeout, Duration::from_secs(30)),
            other => panic!("unexpected relay {other:?}"),
        }
    }

    #[test]
    fn relay_from_config_builds_each_kind() {
        let td = tempdir().expect("tempdir");
        let spool = relay_from_config(&RelayConfig::Spool {
            dir: td.path().to_path_buf(),
        })
        .expect("spool");
        assert!(spool.describe().contains(&td.path().display().to_string()));

        let http = relay_from_config(&RelayConfig::Http {
            url: "http://127.0.0.1:9/send".to_string(),
            token: None,
            secret: None,
            timeout: Duration::from_secs(1),
        })
        .expect("http");
        assert_eq!(http.describe(), "http relay http://127.0.0.1:9/send");
    }
}
