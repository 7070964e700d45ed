//! Attachment metadata and ranged downloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::*;
use crate::gateway::attachments::{
    deflate, prepare_for_transfer, read_range, real_path, DEFAULT_CHUNK_SIZE,
};
use crate::gateway::chunks::normalize_offset;
use crate::gateway::events::{GetAttachmentChunkParams, GetAttachmentParams};

const NOT_DOWNLOADED: &str = "Attachment not downloaded on server";

pub(super) async fn handle_get_attachment(
    params: GetAttachmentParams,
    ctx: &GatewayContext,
) -> HandlerResult {
    let guid = require(&params.identifier, "No attachment identifier provided")?;
    let attachment = ctx
        .collaborators
        .query
        .get_attachment(guid, params.with_messages.unwrap_or(false))
        .await
        .map_err(bridge_error)?
        .ok_or_else(|| client_error("Attachment does not exist"))?;
    Ok(Dispatch::ok("attachment", to_data(&attachment)?))
}

pub(super) async fn handle_attachment_chunk(
    params: GetAttachmentChunkParams,
    ctx: &GatewayContext,
) -> HandlerResult {
    let guid = require(&params.identifier, "No attachment identifier provided")?;
    let start = normalize_offset(&params.start);
    let chunk_size = params.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    let compress = params.compress.unwrap_or(false);

    let attachment = ctx
        .collaborators
        .query
        .get_attachment(guid, false)
        .await
        .map_err(bridge_error)?
        .ok_or_else(|| client_error("Attachment does not exist"))?;

    if !real_path(&attachment.file_path).exists() {
        return Err(server_error(ERROR_CHANNEL, NOT_DOWNLOADED));
    }
    let attachment = prepare_for_transfer(
        attachment,
        &ctx.convert_dir(),
        ctx.collaborators.converter.as_ref(),
    )
    .await;
    let path = real_path(&attachment.file_path);
    if !path.exists() {
        return Err(server_error(ERROR_CHANNEL, NOT_DOWNLOADED));
    }

    let mut bytes = read_range(&path, start, chunk_size)
        .await
        .map_err(|e| server_error(ERROR_CHANNEL, e.to_string()))?;
    if bytes.is_empty() {
        return Ok(Dispatch::no_data("attachment-chunk"));
    }
    if compress {
        bytes = deflate(&bytes).map_err(|e| server_error(ERROR_CHANNEL, e.to_string()))?;
    }
    Ok(Dispatch::ok("attachment-chunk", Value::String(STANDARD.encode(bytes))))
}
