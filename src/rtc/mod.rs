use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

use crate::config;

mod encoder;
mod reorder;
mod session;

pub use session::{CloseHook, UploadVideoSession};

/// Capability set every active session exposes to the registry and the
/// HTTP handlers. Video-only and future mixed a/v sessions implement it
/// independently.
#[async_trait]
pub trait RecordingSession: Send + Sync {
    fn id(&self) -> String;
    /// Non-empty exactly when the most recent negotiation succeeded.
    async fn answer_sdp(&self) -> String;
    async fn negotiate(&self, sdp_offer: String) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Builds the shared peer-connection factory: the configured codec set,
/// default interceptors and the ICE tuning from config.
pub fn build_api(cfg: &config::Rtc) -> Result<API> {
    let mut media = MediaEngine::default();
    for codec in &cfg.codecs {
        let kind = if codec.is_audio() {
            RTPCodecType::Audio
        } else {
            RTPCodecType::Video
        };
        let params: RTCRtpCodecParameters = (*codec).into();
        media.register_codec(params, kind)?;
    }

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    let mut setting = SettingEngine::default();
    // Cloud deployment: mDNS candidates are useless and noisy.
    setting.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    setting.set_ice_timeouts(
        Some(Duration::from_secs(cfg.ice_disconnected_timeout)),
        Some(Duration::from_secs(cfg.ice_failed_timeout)),
        Some(Duration::from_secs(cfg.ice_keepalive_interval)),
    );
    if let Some((min, max)) = cfg.port_range()? {
        setting.set_udp_network(UDPNetwork::Ephemeral(EphemeralUDP::new(min, max)?));
    }

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}
