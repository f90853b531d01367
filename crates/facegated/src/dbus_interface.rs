use crate::engine::{EngineError, EngineHandle};
use serde::Serialize;
use serde_json::{json, Value};
use zbus::interface;

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.FaceGate1
/// Object path: /org/facegate/FaceGate1
///
/// Every method answers with a JSON object. Request-level failures such as
/// "no face detected" are `{"success": false, "reason": ..., "message": ...}`
/// replies, not D-Bus errors; only a dead engine is reported as one.
pub struct FaceGateService {
    engine: EngineHandle,
}

impl FaceGateService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.facegate.FaceGate1")]
impl FaceGateService {
    /// Enroll `user` from an encoded photo.
    async fn register(&self, user: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(user, bytes = image.len(), "register requested");
        render(self.engine.register(user.to_string(), image).await)
    }

    /// Compare an encoded photo against the enrollment of `user`.
    async fn verify(&self, user: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(user, bytes = image.len(), "verify requested");
        render(self.engine.verify(user.to_string(), image).await)
    }

    async fn user_status(&self, user: &str) -> zbus::fdo::Result<String> {
        let result = self.engine.user_status(user.to_string()).await;
        render(result.map(|is_registered| json!({ "user": user, "is_registered": is_registered })))
    }

    async fn delete(&self, user: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user, "delete requested");
        let result = self.engine.delete(user.to_string()).await;
        render(result.map(|deleted| json!({ "deleted": deleted })))
    }

    /// Return daemon status information.
    async fn info(&self) -> zbus::fdo::Result<String> {
        let result = self.engine.info().await.map(|stats| {
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "users": stats.users,
                "threshold": stats.threshold,
                "input_size": stats.input_size,
                "augmentations": stats.augmentations,
            })
        });
        render(result)
    }
}

/// Turn an engine result into the JSON reply string.
fn render<T: Serialize>(result: Result<T, EngineError>) -> zbus::fdo::Result<String> {
    match result {
        Ok(payload) => {
            let mut body = serde_json::to_value(payload)
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            if let Value::Object(map) = &mut body {
                map.insert("success".into(), Value::Bool(true));
            }
            Ok(body.to_string())
        }
        Err(EngineError::Pipeline(e)) => {
            tracing::info!(reason = e.reason(), error = %e, "request failed");
            Ok(json!({
                "success": false,
                "reason": e.reason(),
                "message": e.to_string(),
                "retryable": e.is_retryable(),
            })
            .to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "engine unavailable");
            Err(zbus::fdo::Error::Failed(e.to_string()))
        }
    }
}
