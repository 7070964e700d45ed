//! Server metadata, configuration, device registration and log tail.

use std::time::Duration;

use serde_json::{json, Value};

use super::*;
use crate::gateway::events::{AddDeviceParams, GetLogsParams};
use crate::logging::buffer::LOG_BUFFER;

const DEFAULT_LOG_COUNT: usize = 100;

pub(super) async fn handle_metadata() -> HandlerResult {
    Ok(Dispatch::ok_with_message(
        "server-metadata",
        json!({
            "os_version": os_version().await,
            "server_version": env!("CARGO_PKG_VERSION"),
        }),
        "Successfully fetched metadata",
    ))
}

/// Host OS version, falling back to the platform name.
async fn os_version() -> String {
    let output = tokio::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if version.is_empty() {
                std::env::consts::OS.to_string()
            } else {
                version
            }
        }
        _ => std::env::consts::OS.to_string(),
    }
}

pub(super) fn handle_config(ctx: &GatewayContext) -> HandlerResult {
    Ok(Dispatch::ok_with_message(
        "server-config",
        ctx.config.snapshot().public_view(),
        "Successfully fetched server config",
    ))
}

pub(super) async fn handle_add_device(params: AddDeviceParams, ctx: &GatewayContext) -> HandlerResult {
    let (name, id) = match (
        params.device_name.as_deref().filter(|v| !v.is_empty()),
        params.device_id.as_deref().filter(|v| !v.is_empty()),
    ) {
        (Some(name), Some(id)) => (name, id),
        _ => return Err(client_error("No device name or ID specified")),
    };

    let devices = &ctx.collaborators.devices;
    let created = devices.upsert(name, id).await.map_err(bridge_error)?;
    if created {
        tracing::info!(target: "gateway", device = name, "Registering new client with Google FCM");
    }

    let retention = Duration::from_secs(ctx.config.snapshot().device_retention_days * 24 * 60 * 60);
    let purged = devices.purge_old(retention).await.map_err(bridge_error)?;
    if purged > 0 {
        tracing::info!(target: "gateway", purged, "removed inactive devices");
    }

    Ok(Dispatch::ok_with_message(
        "fcm-device-id-added",
        Value::Null,
        "Successfully added device ID",
    ))
}

/// Push-notification client settings previously written to the data dir.
pub(super) async fn handle_fcm_client(ctx: &GatewayContext) -> HandlerResult {
    let path = ctx.data_dir().join("fcm-client.json");
    let data = match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!(target: "gateway", path = %path.display(), error = %e, "unreadable FCM client file");
            Value::Null
        }),
        Err(_) => Value::Null,
    };
    Ok(Dispatch::ok_with_message("fcm-client", data, "Successfully got FCM data"))
}

pub(super) fn handle_logs(params: GetLogsParams) -> HandlerResult {
    let count = params.count.unwrap_or(DEFAULT_LOG_COUNT);
    Ok(Dispatch::ok("logs", Value::String(LOG_BUFFER.tail_text(count))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Device;
    use crate::gateway::test_support::harness;
    use crate::logging::buffer::LogLevel;

    fn reply_parts(dispatch: Dispatch) -> (&'static str, Value, Option<String>) {
        match dispatch {
            Dispatch::Reply {
                channel,
                data,
                message,
                ..
            } => (channel, data, message),
            Dispatch::Silent => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn test_metadata_reports_version() {
        let (channel, data, message) = reply_parts(handle_metadata().await.unwrap());
        assert_eq!(channel, "server-metadata");
        assert_eq!(data["server_version"], env!("CARGO_PKG_VERSION"));
        assert!(data["os_version"].as_str().is_some_and(|v| !v.is_empty()));
        assert_eq!(message.as_deref(), Some("Successfully fetched metadata"));
    }

    #[tokio::test]
    async fn test_config_hides_secrets() {
        let h = harness().await;
        h.ctx.config.update(|c| c.server_address = "https://example.test".to_string());
        let (channel, data, _) = reply_parts(handle_config(&h.ctx).unwrap());
        assert_eq!(channel, "server-config");
        assert!(data.get("password").is_none());
        assert!(data.get("server_address").is_none());
        assert_eq!(data["socket_port"], 1234);
    }

    #[tokio::test]
    async fn test_add_device_requires_both_fields() {
        let h = harness().await;
        let err = handle_add_device(
            AddDeviceParams {
                device_name: Some("pixel".into()),
                device_id: None,
            },
            &h.ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err, client_error("No device name or ID specified"));
        assert!(h.bridge.devices().is_empty());
    }

    #[tokio::test]
    async fn test_add_device_upserts_and_purges() {
        let h = harness().await;
        h.bridge.insert_device(Device {
            name: "stale".into(),
            identifier: "old".into(),
            last_active: chrono::Utc::now() - chrono::Duration::days(30),
        });

        let dispatch = handle_add_device(
            AddDeviceParams {
                device_name: Some("pixel".into()),
                device_id: Some("token-1".into()),
            },
            &h.ctx,
        )
        .await
        .unwrap();
        let (channel, data, message) = reply_parts(dispatch);
        assert_eq!(channel, "fcm-device-id-added");
        assert_eq!(data, Value::Null);
        assert_eq!(message.as_deref(), Some("Successfully added device ID"));

        let devices = h.bridge.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, "token-1");
    }

    #[tokio::test]
    async fn test_fcm_client_reads_data_dir() {
        let h = harness().await;
        let (_, data, _) = reply_parts(handle_fcm_client(&h.ctx).await.unwrap());
        assert_eq!(data, Value::Null);

        std::fs::write(h.dir.path().join("fcm-client.json"), r#"{"project_id":"p"}"#).unwrap();
        let (channel, data, _) = reply_parts(handle_fcm_client(&h.ctx).await.unwrap());
        assert_eq!(channel, "fcm-client");
        assert_eq!(data["project_id"], "p");
    }

    #[test]
    fn test_logs_tail_buffer() {
        LOG_BUFFER.push_with_seq(LogLevel::Info, "gateway".into(), "tail marker 9f2".into());
        let (channel, data, _) = reply_parts(handle_logs(GetLogsParams::default()).unwrap());
        assert_eq!(channel, "logs");
        assert!(data.as_str().unwrap().contains("tail marker 9f2"));
    }
}
