//! The `/config` capability every nyuki exposes.

use anyhow::anyhow;
use nyuki_api::{Capability, CapabilityError, ExposerError, HandlerResult, Request, Response};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::nyuki::{NyukiHandle, WeakHandle};

/// `/config` and `/v1/config`, reading and patching the live configuration.
pub(crate) fn config_capabilities(nyuki: &NyukiHandle) -> Result<Vec<Capability>, ExposerError> {
    [("config", None), ("config_v1", Some("v1"))]
        .into_iter()
        .map(|(name, version)| {
            let reader = nyuki.downgrade();
            let writer = nyuki.downgrade();
            let mut builder = Capability::builder(name, "/config")
                .get(move |_: Request| get_config(reader.clone()))
                .patch(move |request: Request| patch_config(writer.clone(), request));
            if let Some(version) = version {
                builder = builder.version(version);
            }
            builder.build()
        })
        .collect()
}

fn alive(nyuki: &WeakHandle) -> Result<NyukiHandle, CapabilityError> {
    nyuki
        .upgrade()
        .ok_or_else(|| CapabilityError::failed(anyhow!("nyuki is gone")))
}

async fn get_config(nyuki: WeakHandle) -> HandlerResult {
    let nyuki = alive(&nyuki)?;
    Ok(Some(Response::new(nyuki.config())))
}

async fn patch_config(nyuki: WeakHandle, request: Request) -> HandlerResult {
    let nyuki = alive(&nyuki)?;
    let Some(patch) = request.body.filter(Value::is_object) else {
        return Ok(Some(Response::with_status(
            400,
            json!({ "error": "configuration patch must be a JSON object" }),
        )));
    };

    match nyuki.update_config(&patch) {
        Ok(config) => {
            info!("configuration patched, reloading");
            nyuki.request_reload();
            Ok(Some(Response::new(config)))
        }
        Err(error) => {
            warn!(%error, "configuration patch rejected");
            Ok(Some(Response::with_status(
                400,
                json!({ "error": error.to_string() }),
            )))
        }
    }
}
