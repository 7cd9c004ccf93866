use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::{ice, Error};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub credential_type: String,
}

impl IceServer {
    pub fn validate(&self) -> webrtc::error::Result<()> {
        for url_str in &self.urls {
            let url = ice::url::Url::parse_url(url_str)?;
            if url.scheme == ice::url::SchemeType::Turn
                || url.scheme == ice::url::SchemeType::Turns
            {
                if self.username.is_empty() || self.credential.is_empty() {
                    return Err(Error::ErrNoTurnCredentials);
                }
            }
        }
        Ok(())
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(val: IceServer) -> Self {
        RTCIceServer {
            urls: val.urls,
            username: val.username,
            credential: val.credential,
            credential_type: val.credential_type.as_str().into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadVideoRequest {
    pub sdp_offer: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub channel: i32,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Serialize)]
pub struct UploadVideoResponse {
    pub id: String,
    pub sdp_answer: String,
}

#[derive(Debug, Deserialize)]
pub struct RenegotiateRequest {
    pub sdp_offer: String,
}

#[derive(Debug, Serialize)]
pub struct RenegotiateResponse {
    pub sdp_answer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_url_needs_no_credentials() {
        let server = IceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: String::new(),
            credential: String::new(),
            credential_type: String::new(),
        };
        assert!(server.validate().is_ok());
    }

    #[test]
    fn turn_url_requires_credentials() {
        let server = IceServer {
            urls: vec!["turn:turn.example.org:3478".into()],
            username: String::new(),
            credential: String::new(),
            credential_type: "password".into(),
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn upload_request_defaults_optional_fields() {
        let request: UploadVideoRequest =
            serde_json::from_str(r#"{"sdp_offer": "v=0"}"#).unwrap();
        assert_eq!(request.sdp_offer, "v=0");
        assert!(request.name.is_empty());
        assert!(request.ice_servers.is_empty());
        assert_eq!(request.channel, 0);
    }
}
