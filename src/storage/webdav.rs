//! WebDAV storage backend.
//!
//! Blobs live under `{endpoint}/download/{shard}/{hash}` and probes under
//! `{endpoint}/measure/{tier}`. Downloads are relayed rather than proxied
//! whenever the server answers with a redirect, so the node never touches
//! the bytes of a blob hosted behind a CDN-capable WebDAV front.

use std::collections::HashMap;
use std::fmt;
use std::io;

use async_trait::async_trait;
use axum::http::{header, request::Parts, Method, StatusCode};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::addressing::{belongs_to_shard, shard_of, validate_hash, SHARDS};
use super::backend::{
    cancellable, downcast_options, BlobReader, BlobWriter, HashVisitor, InitContext, Storage,
    StorageOptions, UploadStream,
};
use super::measure::{self, MeasureMedium};
use super::registry::{parse_options, StorageFactory};
use crate::error::{StorageError, StorageResult};
use crate::transfer::relay::{
    copy_headers, forwarded_headers, range_header, redirect_size, CONTENT_HEADERS,
    REDIRECT_HEADERS,
};
use crate::transfer::ResponseSink;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:getcontentlength/></D:prop></D:propfind>"#;

/// Credentials and endpoint of a WebDAV account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDavUser {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WebDavStorageOption {
    pub pre_gen_measures: bool,

    /// Name of an entry in the shared `webdav-users` table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Direct settings; with an alias, `endpoint` is resolved against the
    /// alias endpoint and non-empty credentials take precedence.
    #[serde(flatten)]
    pub user: WebDavUser,

    #[serde(skip)]
    alias_user: Option<WebDavUser>,
    #[serde(skip)]
    full_endpoint: Option<Url>,
}

impl WebDavStorageOption {
    /// Resolve the alias (if any) and compute the effective endpoint.
    pub fn resolve(&mut self, users: &HashMap<String, WebDavUser>) -> StorageResult<Url> {
        let endpoint = match self.alias.as_deref().filter(|a| !a.is_empty()) {
            Some(alias) => {
                let user = users.get(alias).ok_or_else(|| {
                    StorageError::Config(format!("WebDAV user {:?} does not exist", alias))
                })?;
                let base = parse_endpoint(&user.endpoint)?;
                let endpoint = if self.user.endpoint.is_empty() {
                    base
                } else {
                    base.join(&self.user.endpoint).map_err(|e| {
                        StorageError::Config(format!(
                            "invalid WebDAV endpoint {:?}: {}",
                            self.user.endpoint, e
                        ))
                    })?
                };
                self.alias_user = Some(user.clone());
                endpoint
            }
            None => {
                self.alias_user = None;
                parse_endpoint(&self.user.endpoint)?
            }
        };
        self.full_endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Effective endpoint; the configured one until [`resolve`](Self::resolve) ran.
    pub fn endpoint(&self) -> &str {
        self.full_endpoint
            .as_ref()
            .map(Url::as_str)
            .unwrap_or(&self.user.endpoint)
    }

    pub fn username(&self) -> &str {
        if !self.user.username.is_empty() {
            return &self.user.username;
        }
        self.alias_user
            .as_ref()
            .map(|u| u.username.as_str())
            .unwrap_or("")
    }

    pub fn password(&self) -> &str {
        if !self.user.password.is_empty() {
            return &self.user.password;
        }
        self.alias_user
            .as_ref()
            .map(|u| u.password.as_str())
            .unwrap_or("")
    }
}

fn parse_endpoint(endpoint: &str) -> StorageResult<Url> {
    if endpoint.is_empty() {
        return Err(StorageError::Config("WebDAV endpoint is not set".into()));
    }
    let url = Url::parse(endpoint)
        .map_err(|e| StorageError::Config(format!("invalid WebDAV endpoint {:?}: {}", endpoint, e)))?;
    if url.cannot_be_a_base() {
        return Err(StorageError::Config(format!(
            "WebDAV endpoint {:?} is not a hierarchical URL",
            endpoint
        )));
    }
    Ok(url)
}

/// `base` with `segments` appended; an empty last segment leaves a trailing slash.
fn join_path(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

fn dav_method(name: &str) -> StorageResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| StorageError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))
}

/// Map a non-success response to an error; 404 becomes `NotFound`.
fn check_status(response: Response) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let target = response.url().to_string();
    if status == StatusCode::NOT_FOUND {
        Err(StorageError::NotFound(target))
    } else {
        Err(StorageError::Protocol { status, target })
    }
}

struct Connection {
    client: Client,
    base: Url,
}

/// Storage backend on a remote WebDAV server.
#[derive(Default)]
pub struct WebDavStorage {
    opt: WebDavStorageOption,
    conn: Option<Connection>,
}

pub fn factory() -> StorageFactory {
    StorageFactory {
        new: || -> Box<dyn Storage> { Box::new(WebDavStorage::default()) },
        new_config: parse_options::<WebDavStorageOption>,
    }
}

impl WebDavStorage {
    pub fn new(opt: WebDavStorageOption) -> Self {
        Self { opt, conn: None }
    }

    fn conn(&self) -> StorageResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| StorageError::Config(format!("{} is not initialised", self)))
    }

    fn url(&self, segments: &[&str]) -> StorageResult<Url> {
        Ok(join_path(&self.conn()?.base, segments))
    }

    fn blob_url(&self, hash: &str) -> StorageResult<Url> {
        validate_hash(hash)?;
        self.url(&["download", shard_of(hash), hash])
    }

    fn measure_url(&self, tier: u32) -> StorageResult<Url> {
        self.url(&["measure", &tier.to_string()])
    }

    fn request(&self, method: Method, url: Url) -> StorageResult<RequestBuilder> {
        let request = self.conn()?.client.request(method, url);
        let (username, password) = (self.opt.username(), self.opt.password());
        if username.is_empty() && password.is_empty() {
            return Ok(request);
        }
        Ok(request.basic_auth(username, Some(password)))
    }

    async fn send(request: RequestBuilder) -> StorageResult<Response> {
        Ok(request.send().await?)
    }

    async fn next_chunk(response: &mut Response) -> StorageResult<Option<Bytes>> {
        Ok(response.chunk().await?)
    }

    async fn upload(request: RequestBuilder, stream: UploadStream) -> StorageResult<()> {
        let response = request.body(reqwest::Body::wrap_stream(stream)).send().await?;
        check_status(response)?;
        Ok(())
    }

    /// Create a collection; an existing one is fine.
    async fn mkcol(&self, url: Url) -> StorageResult<()> {
        let response = self.request(dav_method("MKCOL")?, url)?.send().await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        check_status(response)?;
        Ok(())
    }

    async fn propfind(&self, url: Url, depth: &'static str) -> StorageResult<Vec<DavEntry>> {
        let request = self
            .request(dav_method("PROPFIND")?, url)?
            .header("Depth", depth)
            .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let response = check_status(request.send().await?)?;
        Ok(parse_multistatus(&response.text().await?))
    }

    /// Size of a non-collection resource.
    async fn stat(&self, url: Url) -> StorageResult<u64> {
        let target = url.to_string();
        let entries = self.propfind(url, "0").await?;
        entries
            .into_iter()
            .find(|e| !e.collection)
            .and_then(|e| e.length)
            .ok_or_else(|| {
                StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no content length for {}", target),
                ))
            })
    }

    /// Writer streaming a PUT of `url`.
    fn put_writer(&self, url: Url) -> StorageResult<BlobWriter> {
        let request = self.request(Method::PUT, url)?;
        Ok(BlobWriter::streamed(move |stream| Self::upload(request, stream)))
    }
}

impl fmt::Display for WebDavStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<WebDavStorage endpoint={:?} user={}>",
            self.opt.endpoint(),
            self.opt.username()
        )
    }
}

#[async_trait]
impl MeasureMedium for WebDavStorage {
    async fn stat_measure(&self, tier: u32) -> StorageResult<u64> {
        self.stat(self.measure_url(tier)?).await
    }

    async fn create_measure(&self, tier: u32) -> StorageResult<BlobWriter> {
        self.put_writer(self.measure_url(tier)?)
    }
}

#[async_trait]
impl Storage for WebDavStorage {
    fn options(&self) -> &dyn StorageOptions {
        &self.opt
    }

    fn set_options(&mut self, opts: Box<dyn StorageOptions>) -> StorageResult<()> {
        self.opt = downcast_options(opts)?;
        self.conn = None;
        Ok(())
    }

    async fn init(&mut self, ctx: &InitContext) -> StorageResult<()> {
        let base = self.opt.resolve(&ctx.webdav_users)?;
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(crate::USER_AGENT)
            .build()?;
        self.conn = Some(Connection {
            client,
            base: base.clone(),
        });

        for dir in ["download", "measure"] {
            let url = join_path(&base, &[dir, ""]);
            if let Err(e) = cancellable(&ctx.cancel, self.mkcol(url)).await {
                tracing::error!(storage = %self, dir, error = %e, "could not create folder");
            }
        }
        if self.opt.pre_gen_measures {
            measure::pregenerate(&*self, &ctx.cancel).await?;
        }
        Ok(())
    }

    async fn size(&self, hash: &str) -> StorageResult<u64> {
        self.stat(self.blob_url(hash)?).await
    }

    async fn open(&self, hash: &str) -> StorageResult<BlobReader> {
        let request = self.request(Method::GET, self.blob_url(hash)?)?;
        let response = check_status(request.send().await?)?;
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn create(&self, hash: &str) -> StorageResult<BlobWriter> {
        let url = self.blob_url(hash)?;
        self.mkcol(self.url(&["download", shard_of(hash), ""])?).await?;
        self.put_writer(url)
    }

    async fn remove(&self, hash: &str) -> StorageResult<()> {
        let response = self
            .request(Method::DELETE, self.blob_url(hash)?)?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response)?;
        Ok(())
    }

    async fn walk_dir(&self, visitor: &mut HashVisitor<'_>) -> StorageResult<()> {
        for shard in SHARDS.iter() {
            let entries = match self.propfind(self.url(&["download", shard, ""])?, "1").await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(storage = %self, shard = %shard, error = %e, "skipping unreadable shard");
                    continue;
                }
            };
            for entry in entries.iter().filter(|e| !e.collection) {
                let name = entry.name();
                if belongs_to_shard(shard, name) {
                    visitor(name)?;
                }
            }
        }
        Ok(())
    }

    async fn serve_download(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        req: &Parts,
        hash: &str,
        size: u64,
    ) -> StorageResult<u64> {
        let url = self.blob_url(hash)?;
        let request = self
            .request(Method::GET, url.clone())?
            .headers(forwarded_headers(&req.headers));
        let mut response = cancellable(cancel, Self::send(request)).await?;
        let status = response.status();
        tracing::debug!(target_url = %url, status = status.as_u16(), "requested blob");

        if status.is_redirection() {
            let size = redirect_size(range_header(&req.headers), size);
            copy_headers(&REDIRECT_HEADERS, sink.headers_mut(), response.headers());
            sink.send_head(status).await?;
            return Ok(size);
        }
        if !status.is_success() {
            return Err(StorageError::Protocol {
                status,
                target: url.to_string(),
            });
        }

        copy_headers(&CONTENT_HEADERS, sink.headers_mut(), response.headers());
        sink.send_head(status).await?;
        if req.method == Method::HEAD {
            return Ok(0);
        }
        let mut copied = 0;
        while let Some(chunk) = cancellable(cancel, Self::next_chunk(&mut response)).await? {
            copied += chunk.len() as u64;
            sink.send_data(chunk).await?;
        }
        Ok(copied)
    }

    async fn serve_measure(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        req: &Parts,
        tier: u32,
    ) -> StorageResult<()> {
        measure::ensure_measure_file(self, tier, cancel).await?;

        let url = self.measure_url(tier)?;
        let request = self
            .request(Method::HEAD, url.clone())?
            .headers(forwarded_headers(&req.headers));
        let response = cancellable(cancel, Self::send(request)).await?;
        let status = response.status();
        tracing::debug!(target_url = %url, status = status.as_u16(), "requested measure file");

        if status.is_redirection() {
            copy_headers(&REDIRECT_HEADERS, sink.headers_mut(), response.headers());
            sink.send_head(status).await?;
            return Ok(());
        }
        // The stored file is all zeros; serve it without fetching.
        measure::serve_synthetic(cancel, sink, &req.method, tier).await
    }
}

/// One `<response>` of a PROPFIND multistatus.
#[derive(Debug, PartialEq)]
struct DavEntry {
    href: String,
    collection: bool,
    length: Option<u64>,
}

impl DavEntry {
    /// Last path segment of the href.
    fn name(&self) -> &str {
        self.href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

fn parse_multistatus(body: &str) -> Vec<DavEntry> {
    let mut entries = Vec::new();
    let mut rest = body;
    while let Some((inner, after)) = next_element(rest, "response") {
        if let Some((href, _)) = next_element(inner, "href") {
            entries.push(DavEntry {
                href: decode_href(href.trim()),
                collection: next_element(inner, "collection").is_some(),
                length: next_element(inner, "getcontentlength")
                    .and_then(|(text, _)| text.trim().parse().ok()),
            });
        }
        rest = after;
    }
    entries
}

/// Undo XML escaping, then percent-encoding, of an `href` value.
fn decode_href(raw: &str) -> String {
    let text = unescape_xml(raw);
    let decoded = urlencoding::decode(&text).map(|d| d.into_owned());
    decoded.unwrap_or(text)
}

fn unescape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let ch = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match ch {
            Some(ch) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn local_name(tag: &str) -> &str {
    tag.rsplit(':').next().unwrap_or(tag)
}

/// Find the next element whose local name is `name`, ignoring namespace
/// prefixes. Returns its inner text and the text after its end tag.
fn next_element<'a>(text: &'a str, name: &str) -> Option<(&'a str, &'a str)> {
    let mut pos = 0;
    loop {
        let open = pos + text[pos..].find('<')?;
        let close = open + text[open..].find('>')?;
        let tag = &text[open + 1..close];
        pos = close + 1;
        if tag.starts_with(['/', '?', '!']) {
            continue;
        }
        let self_closing = tag.ends_with('/');
        let tag_name = tag
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or_default();
        if local_name(tag_name) != name {
            continue;
        }
        if self_closing {
            return Some(("", &text[pos..]));
        }

        let mut search = pos;
        loop {
            let end = search + text[search..].find("</")?;
            let end_close = end + text[end..].find('>')?;
            if local_name(text[end + 2..end_close].trim()) == name {
                return Some((&text[pos..end], &text[end_close + 1..]));
            }
            search = end_close + 1;
        }
    }
}
