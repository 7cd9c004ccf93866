use std::{env, fs, net::SocketAddr, str::FromStr};

use anyhow::anyhow;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::dto::IceServer;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub service: Service,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub scratch: Scratch,
    #[serde(default)]
    pub rtc: Rtc,
    #[serde(default = "Stage::default_transcoding")]
    pub transcoding: Stage,
    #[serde(default = "Stage::default_uploader")]
    pub uploader: Stage,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Service {
    /// Stable instance id, partitions the job table between processes.
    #[serde(default)]
    pub id: String,
    /// Discovery agent address, e.g. "http://127.0.0.1:8500". Empty disables
    /// registration.
    #[serde(default)]
    pub discovery: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Database {
    #[serde(default = "default_database_dsn")]
    pub dsn: String,
    #[serde(default = "default_database_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scratch {
    #[serde(default = "default_scratch_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rtc {
    #[serde(default = "default_codecs")]
    pub codecs: Vec<Codec>,
    /// Seconds without traffic before ICE reports disconnected.
    #[serde(default = "default_ice_disconnected_timeout")]
    pub ice_disconnected_timeout: u64,
    /// Seconds without traffic before ICE reports failed.
    #[serde(default = "default_ice_failed_timeout")]
    pub ice_failed_timeout: u64,
    #[serde(default = "default_ice_keepalive_interval")]
    pub ice_keepalive_interval: u64,
    /// Ephemeral UDP port range, "MIN-MAX".
    #[serde(default)]
    pub udp_port_range: Option<String>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Stage {
    pub workers: usize,
    pub queue: usize,
    pub max_retry: i32,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Storage {
    /// Base URL of the remote file service.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Auth {
    #[serde(default)]
    pub tokens: Vec<AccessToken>,
    /// Validated session cache TTL in milliseconds, floored at one second.
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(default)]
    pub domain_id: i64,
    #[serde(default)]
    pub user_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Vp8,
    Vp9,
    H264,
    Opus,
}

impl Codec {
    pub fn is_audio(self) -> bool {
        matches!(self, Codec::Opus)
    }
}

impl From<Codec> for RTCRtpCodecParameters {
    fn from(val: Codec) -> Self {
        let video_rtcp_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
        ];
        match val {
            Codec::Vp8 => RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: video_rtcp_feedback,
                },
                payload_type: 96,
                ..Default::default()
            },
            Codec::Vp9 => RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP9.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "profile-id=0".to_owned(),
                    rtcp_feedback: video_rtcp_feedback,
                },
                payload_type: 98,
                ..Default::default()
            },
            Codec::H264 => RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"
                            .to_owned(),
                    rtcp_feedback: video_rtcp_feedback,
                },
                payload_type: 102,
                ..Default::default()
            },
            Codec::Opus => RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
        }
    }
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "0.0.0.0:{}",
        env::var("PORT").unwrap_or(String::from("7788"))
    ))
    .expect("invalid listen address")
}

fn default_database_dsn() -> String {
    env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost:5432/liverec".to_string())
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_scratch_dir() -> String {
    "/tmp/liverec".to_string()
}

fn default_codecs() -> Vec<Codec> {
    vec![Codec::Vp9, Codec::H264]
}

fn default_ice_disconnected_timeout() -> u64 {
    5
}

fn default_ice_failed_timeout() -> u64 {
    25
}

fn default_ice_keepalive_interval() -> u64 {
    2
}

fn default_session_ttl() -> u64 {
    60_000
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: Default::default(),
            service: Default::default(),
            database: Default::default(),
            scratch: Default::default(),
            rtc: Default::default(),
            transcoding: Stage::default_transcoding(),
            uploader: Stage::default_uploader(),
            storage: Default::default(),
            auth: Default::default(),
            log: Default::default(),
        }
    }
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: Default::default(),
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            dsn: default_database_dsn(),
            max_connections: default_database_max_connections(),
        }
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Self {
            dir: default_scratch_dir(),
        }
    }
}

impl Default for Rtc {
    fn default() -> Self {
        Self {
            codecs: default_codecs(),
            ice_disconnected_timeout: default_ice_disconnected_timeout(),
            ice_failed_timeout: default_ice_failed_timeout(),
            ice_keepalive_interval: default_ice_keepalive_interval(),
            udp_port_range: None,
            ice_servers: vec![],
        }
    }
}

impl Stage {
    fn default_transcoding() -> Self {
        Self {
            workers: 2,
            queue: 4,
            max_retry: 3,
        }
    }

    fn default_uploader() -> Self {
        Self {
            workers: 4,
            queue: 8,
            max_retry: 5,
        }
    }

    /// Lease batch size: a full queue plus one task per worker.
    pub fn fetch_limit(&self) -> i64 {
        (self.workers + self.queue) as i64
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Rtc {
    pub fn port_range(&self) -> anyhow::Result<Option<(u16, u16)>> {
        match &self.udp_port_range {
            Some(range) => parse_port_range(range).map(Some),
            None => Ok(None),
        }
    }
}

/// Parses an ephemeral UDP port range of the form "MIN-MAX", both ends in
/// the 16-bit unsigned range.
pub fn parse_port_range(s: &str) -> anyhow::Result<(u16, u16)> {
    let (min, max) = s
        .split_once('-')
        .ok_or_else(|| anyhow!("port range must be MIN-MAX, got {:?}", s))?;
    let min: u16 = min
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid port range start {:?}", s))?;
    let max: u16 = max
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid port range end {:?}", s))?;
    if min == 0 || min > max {
        return Err(anyhow!("port range {:?} is empty", s));
    }
    Ok((min, max))
}

impl Config {
    pub fn parse(path: Option<String>) -> Self {
        let result = match path {
            Some(path) => fs::read_to_string(path),
            None => fs::read_to_string("config.toml")
                .or_else(|_| fs::read_to_string("/etc/liverec/config.toml")),
        };
        let mut cfg: Self = match result {
            Ok(raw) => toml::from_str(raw.as_str()).expect("config parse error"),
            Err(_) => Config::default(),
        };
        if cfg.service.id.is_empty() {
            cfg.service.id = format!("liverec-{}", cfg.http.listen.port());
        }
        match cfg.validate() {
            Ok(_) => cfg,
            Err(err) => panic!("config validate [{}]", err),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rtc.codecs.is_empty() {
            return Err(anyhow!("rtc.codecs must not be empty"));
        }
        self.rtc.port_range()?;
        for ice_server in self.rtc.ice_servers.iter() {
            ice_server
                .validate()
                .map_err(|e| anyhow!("ice_server error : {}", e))?;
        }
        for (name, stage) in [
            ("transcoding", &self.transcoding),
            ("uploader", &self.uploader),
        ] {
            if stage.workers == 0 {
                return Err(anyhow!("{}.workers must be at least 1", name));
            }
            if stage.max_retry < 0 {
                return Err(anyhow!("{}.max_retry must not be negative", name));
            }
        }
        if !self.storage.url.is_empty() {
            url::Url::parse(&self.storage.url).map_err(|e| anyhow!("storage.url error : {}", e))?;
        }
        if !self.service.discovery.is_empty() {
            url::Url::parse(&self.service.discovery)
                .map_err(|e| anyhow!("service.discovery error : {}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_accepts_valid_range() {
        assert_eq!(parse_port_range("10000-20000").unwrap(), (10000, 20000));
        assert_eq!(parse_port_range("1-65535").unwrap(), (1, 65535));
    }

    #[test]
    fn port_range_rejects_malformed_input() {
        assert!(parse_port_range("10000").is_err());
        assert!(parse_port_range("10000-").is_err());
        assert!(parse_port_range("-20000").is_err());
        assert!(parse_port_range("a-b").is_err());
        assert!(parse_port_range("70000-80000").is_err());
        assert!(parse_port_range("20000-10000").is_err());
        assert!(parse_port_range("0-100").is_err());
    }

    #[test]
    fn stage_fetch_limit_covers_workers_and_queue() {
        let stage = Stage {
            workers: 2,
            queue: 4,
            max_retry: 3,
        };
        assert_eq!(stage.fetch_limit(), 6);
    }

    #[test]
    fn config_defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn config_rejects_bad_port_range() {
        let mut cfg = Config::default();
        cfg.rtc.udp_port_range = Some("70000-80000".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn codec_names_parse_from_toml() {
        let rtc: Rtc = toml::from_str(r#"codecs = ["vp9", "h264"]"#).unwrap();
        assert_eq!(rtc.codecs, vec![Codec::Vp9, Codec::H264]);
    }
}
