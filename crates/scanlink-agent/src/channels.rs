//! # Output Channels
//!
//! Local consumers of scan values, e.g. a point-of-sale terminal plugged
//! into the board.
//!
//! ## Variants
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Output Channels                                   │
//! │                                                                         │
//! │  UsbHid    /dev/hidg0       8-byte keyboard reports, Enter terminator  │
//! │  Serial    /dev/ttyUSB*     9600 baud, value + "\r\n"                  │
//! │  Network   http://...       POST {"barcode": value}                    │
//! │  Clipboard xclip / xsel     needs a display                            │
//! │  File      any path         "<rfc3339>: value" per line                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every channel answers `available()` and `send()` with a plain bool. The
//! forwarder bounds both with a timeout; channels do not retry.

use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::ChannelConfig;

// =============================================================================
// HID Keyboard Reports
// =============================================================================

const HID_REPORT_LEN: usize = 8;
const HID_KEY_ENTER: u8 = 0x28;
const HID_MOD_LEFT_SHIFT: u8 = 0x02;

const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HID usage id and modifier for one character, if it can be typed.
fn hid_key(c: char) -> Option<(u8, u8)> {
    let key = match c {
        'a'..='z' => (0x04 + (c as u8 - b'a'), 0),
        'A'..='Z' => (0x04 + (c as u8 - b'A'), HID_MOD_LEFT_SHIFT),
        '1'..='9' => (0x1e + (c as u8 - b'1'), 0),
        '0' => (0x27, 0),
        ' ' => (0x2c, 0),
        '-' => (0x2d, 0),
        '_' => (0x2d, HID_MOD_LEFT_SHIFT),
        '=' => (0x2e, 0),
        '+' => (0x2e, HID_MOD_LEFT_SHIFT),
        '.' => (0x37, 0),
        '/' => (0x38, 0),
        _ => return None,
    };
    Some(key)
}

/// Key-down / key-up report pairs typing `payload` followed by Enter.
///
/// Characters with no key are skipped.
pub fn hid_reports(payload: &str) -> Vec<[u8; HID_REPORT_LEN]> {
    let release = [0u8; HID_REPORT_LEN];
    let mut reports = Vec::with_capacity((payload.len() + 1) * 2);

    let keys = payload
        .chars()
        .filter_map(|c| {
            let key = hid_key(c);
            if key.is_none() {
                debug!(character = ?c, "No HID key for character, skipped");
            }
            key
        })
        .chain(std::iter::once((HID_KEY_ENTER, 0)));

    for (key, modifier) in keys {
        let mut press = release;
        press[0] = modifier;
        press[2] = key;
        reports.push(press);
        reports.push(release);
    }
    reports
}

// =============================================================================
// Channels
// =============================================================================

/// One local output channel.
#[derive(Debug, Clone)]
pub enum OutputChannel {
    UsbHid { device: PathBuf },
    Serial { port: Option<String>, baud_rate: u32 },
    Network { url: String, client: reqwest::Client },
    Clipboard,
    File { path: PathBuf },
}

impl OutputChannel {
    /// Builds a channel from its config entry. `client` is shared by all
    /// network channels.
    pub fn from_config(config: &ChannelConfig, client: &reqwest::Client) -> Self {
        match config {
            ChannelConfig::UsbHid { device } => OutputChannel::UsbHid {
                device: device.clone(),
            },
            ChannelConfig::Serial { port, baud_rate } => OutputChannel::Serial {
                port: port.clone(),
                baud_rate: *baud_rate,
            },
            ChannelConfig::Network { url } => OutputChannel::Network {
                url: url.clone(),
                client: client.clone(),
            },
            ChannelConfig::Clipboard => OutputChannel::Clipboard,
            ChannelConfig::File { path } => OutputChannel::File { path: path.clone() },
        }
    }

    /// Name for logs.
    pub fn name(&self) -> String {
        match self {
            OutputChannel::UsbHid { device } => format!("usb_hid:{}", device.display()),
            OutputChannel::Serial { port, .. } => {
                format!("serial:{}", port.as_deref().unwrap_or("auto"))
            }
            OutputChannel::Network { url, .. } => format!("network:{}", url),
            OutputChannel::Clipboard => "clipboard".to_string(),
            OutputChannel::File { path } => format!("file:{}", path.display()),
        }
    }

    /// Whether the channel can take a value right now.
    pub async fn available(&self) -> bool {
        match self {
            OutputChannel::UsbHid { device } => tokio::fs::metadata(device).await.is_ok(),
            OutputChannel::Serial { port, .. } => serial::resolve_port(port.as_deref()).is_some(),
            // Any HTTP answer means the endpoint is there
            OutputChannel::Network { url, client } => client
                .head(url)
                .timeout(NETWORK_PROBE_TIMEOUT)
                .send()
                .await
                .is_ok(),
            OutputChannel::Clipboard => clipboard_tool().is_some(),
            OutputChannel::File { path } => match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    tokio::fs::metadata(parent).await.is_ok()
                }
                _ => true,
            },
        }
    }

    /// Sends one value. Returns false on any failure.
    pub async fn send(&self, payload: &str) -> bool {
        let result = match self {
            OutputChannel::UsbHid { device } => {
                send_hid(device, payload).await.map_err(|e| e.to_string())
            }
            OutputChannel::Serial { port, baud_rate } => {
                serial::send(port.clone(), *baud_rate, payload).await
            }
            OutputChannel::Network { url, client } => send_network(client, url, payload).await,
            OutputChannel::Clipboard => send_clipboard(payload).await,
            OutputChannel::File { path } => {
                send_file(path, payload).await.map_err(|e| e.to_string())
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(channel = %self.name(), error = %e, "Channel send failed");
                false
            }
        }
    }
}

async fn send_hid(device: &Path, payload: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(device).await?;

    // The gadget takes exactly one report per write
    for report in hid_reports(payload) {
        file.write_all(&report).await?;
    }
    file.flush().await
}

async fn send_network(client: &reqwest::Client, url: &str, payload: &str) -> Result<(), String> {
    let response = client
        .post(url)
        .json(&serde_json::json!({ "barcode": payload }))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", response.status().as_u16()))
    }
}

async fn send_file(path: &Path, payload: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let line = format!(
        "{}: {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        payload
    );
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

// =============================================================================
// Clipboard
// =============================================================================

/// The first clipboard tool found on PATH, with its arguments, when a
/// display is available.
fn clipboard_tool() -> Option<(&'static str, &'static [&'static str])> {
    if std::env::var_os("DISPLAY").is_none() && std::env::var_os("WAYLAND_DISPLAY").is_none() {
        return None;
    }

    const TOOLS: [(&str, &[&str]); 2] = [
        ("xclip", &["-selection", "clipboard"]),
        ("xsel", &["--clipboard", "--input"]),
    ];
    TOOLS.into_iter().find(|(tool, _)| on_path(tool))
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

async fn send_clipboard(payload: &str) -> Result<(), String> {
    let (tool, args) = clipboard_tool().ok_or("no clipboard tool")?;

    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| e.to_string())?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
    }

    let status = child.wait().await.map_err(|e| e.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{} exited with {}", tool, status))
    }
}

// =============================================================================
// Serial
// =============================================================================

#[cfg(feature = "serial")]
mod serial {
    use std::io::Write;
    use std::time::Duration;

    /// The configured port, or the first USB serial adapter.
    pub fn resolve_port(port: Option<&str>) -> Option<String> {
        if let Some(port) = port {
            return std::path::Path::new(port).exists().then(|| port.to_string());
        }

        let mut ports: Vec<String> = serialport::available_ports()
            .ok()?
            .into_iter()
            .map(|p| p.port_name)
            .filter(|name| name.contains("ttyUSB") || name.contains("ttyACM"))
            .collect();
        ports.sort();
        ports.into_iter().next()
    }

    pub async fn send(port: Option<String>, baud_rate: u32, payload: &str) -> Result<(), String> {
        let name = resolve_port(port.as_deref()).ok_or("no serial port")?;
        let line = format!("{}\r\n", payload);

        tokio::task::spawn_blocking(move || {
            let mut port = serialport::new(&name, baud_rate)
                .timeout(Duration::from_secs(1))
                .open()
                .map_err(|e| e.to_string())?;
            port.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
            port.flush().map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[cfg(not(feature = "serial"))]
mod serial {
    pub fn resolve_port(_port: Option<&str>) -> Option<String> {
        None
    }

    pub async fn send(_port: Option<String>, _baud_rate: u32, _payload: &str) -> Result<(), String> {
        Err("built without serial support".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hid_reports_for_digits() {
        let reports = hid_reports("10");
        // '1', '0', Enter: press + release each
        assert_eq!(reports.len(), 6);
        assert_eq!(reports[0], [0, 0, 0x1e, 0, 0, 0, 0, 0]);
        assert_eq!(reports[1], [0; 8]);
        assert_eq!(reports[2][2], 0x27);
        assert_eq!(reports[4][2], HID_KEY_ENTER);
    }

    #[test]
    fn test_hid_uppercase_uses_shift() {
        let reports = hid_reports("A");
        assert_eq!(reports[0][0], HID_MOD_LEFT_SHIFT);
        assert_eq!(reports[0][2], 0x04);
    }

    #[test]
    fn test_hid_skips_untypeable() {
        assert_eq!(hid_reports("1#2").len(), 6);
    }

    #[tokio::test]
    async fn test_file_channel_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scans.log");
        let channel = OutputChannel::File { path: path.clone() };

        assert!(channel.available().await);
        assert!(channel.send("4006381333931").await);
        assert!(channel.send("5012345678900").await);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": 4006381333931"));
    }

    #[tokio::test]
    async fn test_file_channel_unavailable_without_directory() {
        let channel = OutputChannel::File {
            path: PathBuf::from("/nonexistent/dir/scans.log"),
        };
        assert!(!channel.available().await);
        assert!(!channel.send("4006381333931").await);
    }

    #[tokio::test]
    async fn test_hid_channel_writes_reports() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("hidg0");
        std::fs::write(&device, b"").unwrap();

        let channel = OutputChannel::UsbHid {
            device: device.clone(),
        };
        assert!(channel.available().await);
        assert!(channel.send("12").await);
        assert_eq!(std::fs::read(&device).unwrap().len(), 6 * HID_REPORT_LEN);
    }

    #[tokio::test]
    async fn test_missing_hid_gadget_unavailable() {
        let channel = OutputChannel::UsbHid {
            device: PathBuf::from("/nonexistent/hidg0"),
        };
        assert!(!channel.available().await);
    }
}
