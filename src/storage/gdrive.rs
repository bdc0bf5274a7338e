// Google Drive (v3 REST) implementation of the remote store.
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{StreamExt, stream};
use reqwest::{StatusCode, Url};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::auth::Authenticator;
use super::{Artifact, BACKUP_MIME_TYPE, RemoteStore, TransferProgress, sort_newest_first};
use crate::errors::{AppError, Result};

const GOOGLE_APIS: &str = "https://www.googleapis.com";
const PAGE_SIZE: &str = "100";
const FILE_FIELDS: &str = "id, name, createdTime, size, mimeType";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: Option<String>,
    name: Option<String>,
    created_time: Option<DateTime<Utc>>,
    // Drive encodes int64 fields as JSON strings
    size: Option<String>,
    mime_type: Option<String>,
}

impl DriveFile {
    fn into_artifact(self) -> Option<Artifact> {
        Some(Artifact {
            id: self.id?,
            name: self.name.unwrap_or_default(),
            created_time: self.created_time?,
            size_bytes: self.size.and_then(|s| s.parse().ok()),
            mime_type: self.mime_type.unwrap_or_else(|| BACKUP_MIME_TYPE.to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderLookup {
    id: Option<String>,
}

/// Drive client bound to one backup folder.
pub struct DriveClient {
    http: reqwest::Client,
    auth: Authenticator,
    folder_id: String,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(folder_id: impl Into<String>, credential_path: impl Into<PathBuf>) -> Self {
        let http = reqwest::Client::new();
        let auth = Authenticator::service_account(credential_path, http.clone());
        Self::with_base_url(folder_id, auth, http, GOOGLE_APIS)
    }

    fn with_base_url(
        folder_id: impl Into<String>,
        auth: Authenticator,
        http: reqwest::Client,
        base_url: &str,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/');
        Self {
            http,
            auth,
            folder_id: folder_id.into(),
            api_base: format!("{}/drive/v3", base_url),
            upload_base: format!("{}/upload/drive/v3", base_url),
        }
    }

    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    /// `{api_base}/files/{id}`, with the id percent-encoded as a single path segment.
    fn file_url(&self, id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| AppError::RemoteStore(format!("invalid Drive API base {}: {}", self.api_base, e)))?;
        url.path_segments_mut()
            .map_err(|()| AppError::RemoteStore(format!("Drive API base {} cannot take a path", self.api_base)))?
            .push("files")
            .push(id);
        Ok(url)
    }

    async fn list_matching(&self, cutoff: Option<DateTime<Utc>>) -> Result<Vec<Artifact>> {
        let query = list_query(&self.folder_id, cutoff);
        let fields = format!("nextPageToken, files({})", FILE_FIELDS);
        let mut artifacts = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.auth.access_token().await?;
            let mut params = vec![
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("orderBy", "createdTime desc"),
                ("pageSize", PAGE_SIZE),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ];
            if let Some(page) = page_token.as_deref() {
                params.push(("pageToken", page));
            }

            let response = self
                .http
                .get(format!("{}/files", self.api_base))
                .bearer_auth(&token)
                .query(&params)
                .send()
                .await?;
            let page: FileList = check_status(response, "list files").await?.json().await?;

            artifacts.extend(page.files.into_iter().filter_map(DriveFile::into_artifact));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        sort_newest_first(&mut artifacts);
        debug!(count = artifacts.len(), ?cutoff, "Listed backup files");
        Ok(artifacts)
    }
}

/// Drive search expression selecting backup archives in `folder_id`.
fn list_query(folder_id: &str, cutoff: Option<DateTime<Utc>>) -> String {
    let mut query = format!(
        "'{}' in parents and trashed=false and mimeType = '{}'",
        escape_query_literal(folder_id),
        BACKUP_MIME_TYPE
    );
    if let Some(cutoff) = cutoff {
        query.push_str(&format!(
            " and createdTime < '{}'",
            cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }
    query
}

fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Frames the metadata part and the closing boundary of a `multipart/related` upload.
fn multipart_envelope(boundary: &str, metadata: &serde_json::Value) -> (String, String) {
    let head = format!(
        "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {BACKUP_MIME_TYPE}\r\n\r\n"
    );
    let tail = format!("\r\n--{boundary}--\r\n");
    (head, tail)
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", what, status, body.trim());
    if status == StatusCode::UNAUTHORIZED {
        Err(AppError::Auth(message))
    } else {
        Err(AppError::RemoteStore(message))
    }
}

#[async_trait::async_trait]
impl RemoteStore for DriveClient {
    async fn verify_folder_access(&self) -> Result<()> {
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .get(self.file_url(&self.folder_id)?)
            .bearer_auth(&token)
            .query(&[("fields", "id"), ("supportsAllDrives", "true")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::FolderAccess {
                folder_id: self.folder_id.clone(),
                reason: format!("{}: {}", status, body.trim()),
            });
        }

        let folder: FolderLookup = response.json().await?;
        match folder.id {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(AppError::FolderAccess {
                folder_id: self.folder_id.clone(),
                reason: "folder id missing from response".to_string(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<Artifact>> {
        self.list_matching(None).await
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Artifact>> {
        self.list_matching(Some(cutoff)).await
    }

    async fn upload(&self, local_path: &Path, display_name: &str) -> Result<Artifact> {
        let token = self.auth.access_token().await?;
        let file = tokio::fs::File::open(local_path).await?;
        let file_len = file.metadata().await?.len();

        let boundary = format!("backup-{}", Uuid::new_v4().simple());
        let metadata = serde_json::json!({
            "name": display_name,
            "parents": [self.folder_id],
            "mimeType": BACKUP_MIME_TYPE,
        });
        let (head, tail) = multipart_envelope(&boundary, &metadata);
        let content_length = head.len() as u64 + file_len + tail.len() as u64;

        let body = stream::iter([Ok::<Bytes, std::io::Error>(Bytes::from(head))])
            .chain(ReaderStream::new(file))
            .chain(stream::iter([Ok(Bytes::from(tail))]));

        info!(name = display_name, bytes = file_len, "Uploading backup file");
        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(&token)
            .query(&[
                ("uploadType", "multipart"),
                ("fields", FILE_FIELDS),
                ("supportsAllDrives", "true"),
            ])
            .header(CONTENT_TYPE, format!("multipart/related; boundary={}", boundary))
            .header(CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| AppError::Transfer(format!("upload of {} failed: {}", display_name, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Transfer(format!(
                "upload of {} returned {}: {}",
                display_name,
                status,
                body.trim()
            )));
        }

        let created: DriveFile = response.json().await?;
        created.into_artifact().ok_or_else(|| {
            AppError::RemoteStore(format!("upload of {} returned an incomplete file resource", display_name))
        })
    }

    async fn download(
        &self,
        artifact_id: &str,
        local_path: &Path,
        on_progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<PathBuf> {
        let token = self.auth.access_token().await?;
        let mut response = self
            .http
            .get(self.file_url(artifact_id)?)
            .bearer_auth(&token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| AppError::Transfer(format!("download of {} failed: {}", artifact_id, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Transfer(format!(
                "download of {} returned {}: {}",
                artifact_id,
                status,
                body.trim()
            )));
        }

        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let total_bytes = response.content_length();
        let started = Instant::now();
        let mut output = tokio::fs::File::create(local_path).await?;
        let mut transferred_bytes = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AppError::Transfer(format!("download of {} interrupted: {}", artifact_id, e)))?
        {
            output.write_all(&chunk).await?;
            transferred_bytes += chunk.len() as u64;
            on_progress(TransferProgress {
                transferred_bytes,
                total_bytes,
                elapsed: started.elapsed(),
            });
        }
        output.flush().await?;

        Ok(local_path.to_path_buf())
    }

    async fn delete(&self, artifact_id: &str) -> Result<()> {
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .delete(self.file_url(artifact_id)?)
            .bearer_auth(&token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await?;
        check_status(response, &format!("delete {}", artifact_id)).await?;
        Ok(())
    }
}
