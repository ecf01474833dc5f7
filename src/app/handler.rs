use std::error;
use std::fmt;
use std::sync::Arc;

use crate::app::AppContext;
use crate::registry::DeviceId;

/// Admission parameters, as carried in the WebSocket request path:
/// `/screen/{secret}/{device}/{token}`.
#[derive(Debug)]
pub struct AdmissionRequest {
    pub secret: String,
    pub device_id: DeviceId,
    pub token: String,
}

impl AdmissionRequest {
    pub fn from_path(path: &str) -> Option<Self> {
        let mut parts = path.split('/');
        if !parts.next()?.is_empty() {
            return None;
        }
        if parts.next()? != "screen" {
            return None;
        }
        let secret = parts.next()?;
        let device = parts.next()?;
        let token = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            secret: secret.to_string(),
            device_id: DeviceId::from(device),
            token: token.to_string(),
        })
    }
}

/// Gatekeeper for viewer connections. Decides admission before any session
/// resource is allocated; rejection is silent at the protocol level.
pub struct AppHandler {
    context: Arc<AppContext>,
}

impl AppHandler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn admit(&self, request: &AdmissionRequest) -> Result<(), AdmissionError> {
        if request.secret.is_empty() || request.secret != self.context.config.auth_key {
            tracing::info!("admission rejected: shared secret mismatch");
            return Err(AdmissionError::BadSecret);
        }

        if request.token.is_empty() {
            tracing::info!("admission rejected: missing session token");
            return Err(AdmissionError::MissingToken);
        }

        if !self
            .context
            .device_registry
            .is_live(&request.device_id)
            .await
        {
            tracing::info!(
                device_id = %request.device_id,
                "admission rejected: device is not connected",
            );
            return Err(AdmissionError::DeviceNotLive);
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdmissionError {
    BadSecret,
    MissingToken,
    DeviceNotLive,
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AdmissionError::BadSecret => write!(f, "shared secret mismatch"),
            AdmissionError::MissingToken => write!(f, "missing session token"),
            AdmissionError::DeviceNotLive => write!(f, "device is not connected"),
        }
    }
}

impl error::Error for AdmissionError {}
