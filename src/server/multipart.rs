use std::collections::HashMap;

use actix_multipart::Multipart;
use futures::{StreamExt, TryStreamExt};

use crate::error::{GatewayError, Result};
use crate::models::UploadedImage;

/// Per-file upload cap. Source images for img2img and inpainting are
/// screen-sized PNGs; anything bigger is a client mistake.
pub const MAX_FILE_BYTES: usize = 20 * 1024 * 1024;

/// Everything a generation request carried: plain form fields by name,
/// and the uploaded files in arrival order.
#[derive(Debug, Default)]
pub struct FormData {
    pub fields: HashMap<String, String>,
    pub files: Vec<UploadedImage>,
}

impl FormData {
    /// The files uploaded under one field name, order preserved.
    pub fn files_named(&self, field_name: &str) -> Vec<&UploadedImage> {
        self.files
            .iter()
            .filter(|f| f.field_name == field_name)
            .collect()
    }
}

/// Drain a multipart stream. Parts with a filename become files; the rest
/// are collected as UTF-8 text fields.
pub async fn drain(mut payload: Multipart) -> Result<FormData> {
    let mut form = FormData::default();

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| GatewayError::ValidationError(format!("malformed multipart body: {}", e)))?
    {
        let disposition = field.content_disposition();
        let name = disposition.get_name().unwrap_or_default().to_string();
        let file_name = disposition.get_filename().map(|s| s.to_string());
        let content_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| {
                GatewayError::ValidationError(format!("failed reading field '{}': {}", name, e))
            })?;
            if data.len() + chunk.len() > MAX_FILE_BYTES {
                return Err(GatewayError::ValidationError(format!(
                    "field '{}' exceeds the {} byte upload limit",
                    name, MAX_FILE_BYTES
                )));
            }
            data.extend_from_slice(&chunk);
        }

        match file_name {
            Some(file_name) => form.files.push(UploadedImage {
                field_name: name,
                file_name,
                content_type,
                data,
            }),
            None => {
                let value = String::from_utf8(data).map_err(|_| {
                    GatewayError::ValidationError(format!("field '{}' is not valid UTF-8", name))
                })?;
                form.fields.insert(name, value);
            }
        }
    }

    Ok(form)
}
