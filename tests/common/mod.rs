//! Fakes shared by the sync-machine and HTTP tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use event_harvest::config::parse_config;
use event_harvest::drive::{ChangePage, DriveFile, DriveProvider};
use event_harvest::llm::ChatModel;
use event_harvest::models::EventRow;
use event_harvest::pusher::RowSink;
use event_harvest::state::{MemoryStore, WatchChannel};
use event_harvest::sync::{DriveSync, SyncSettings};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const FOLDER: &str = "folder-1";
pub const CHANNEL_TOKEN: &str = "s3cret";

// ─── Drive ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDrive {
    pub files: Mutex<Vec<DriveFile>>,
    pub contents: Mutex<HashMap<String, Vec<u8>>>,
    /// Change pages keyed by the token that requests them.
    pub pages: Mutex<HashMap<String, ChangePage>>,
    pub start_token: Mutex<String>,
    pub downloads: Mutex<Vec<String>>,
    pub exports: Mutex<Vec<(String, String)>>,
    /// Page tokens passed to `watch_changes`.
    pub watches: Mutex<Vec<String>>,
    pub list_calls: AtomicUsize,
}

impl FakeDrive {
    pub fn add_file(&self, id: &str, name: &str, mime: &str, modified: &str, bytes: Vec<u8>) {
        let file = drive_file(id, name, mime, modified);
        let mut files = self.files.lock().unwrap();
        files.retain(|f| f.id != id);
        files.push(file);
        self.contents.lock().unwrap().insert(id.to_string(), bytes);
    }

    pub fn touch(&self, id: &str, modified: &str) {
        for f in self.files.lock().unwrap().iter_mut() {
            if f.id == id {
                f.modified_time = modified.to_string();
            }
        }
    }
}

pub fn drive_file(id: &str, name: &str, mime: &str, modified: &str) -> DriveFile {
    DriveFile {
        id: id.to_string(),
        name: name.to_string(),
        mime_type: mime.to_string(),
        modified_time: modified.to_string(),
        parents: vec![FOLDER.to_string()],
        trashed: false,
    }
}

#[async_trait]
impl DriveProvider for FakeDrive {
    async fn get_folder(&self, folder_id: &str) -> Result<DriveFile> {
        if folder_id != FOLDER {
            bail!("folder {} not found", folder_id);
        }
        Ok(drive_file(
            FOLDER,
            "Inbox",
            "application/vnd.google-apps.folder",
            "2026-01-01T00:00:00Z",
        ))
    }

    async fn list_folder_files(&self, _folder_id: &str) -> Result<Vec<DriveFile>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.files.lock().unwrap().clone())
    }

    async fn start_page_token(&self) -> Result<String> {
        Ok(self.start_token.lock().unwrap().clone())
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(page_token)
            .cloned()
            .unwrap_or_else(|| ChangePage {
                new_start_page_token: Some(page_token.to_string()),
                ..Default::default()
            }))
    }

    async fn watch_changes(
        &self,
        page_token: &str,
        channel_id: &str,
        address: &str,
        _token: Option<&str>,
    ) -> Result<WatchChannel> {
        self.watches.lock().unwrap().push(page_token.to_string());
        Ok(WatchChannel {
            id: channel_id.to_string(),
            resource_id: "res-1".to_string(),
            resource_uri: None,
            expiration: Some(chrono::Utc::now().timestamp_millis() + 3_600_000),
            address: address.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        self.downloads.lock().unwrap().push(file_id.to_string());
        match self.contents.lock().unwrap().get(file_id) {
            Some(b) => Ok(b.clone()),
            None => bail!("no content for {}", file_id),
        }
    }

    async fn export(&self, file_id: &str, mime_type: &str) -> Result<Vec<u8>> {
        self.exports
            .lock()
            .unwrap()
            .push((file_id.to_string(), mime_type.to_string()));
        match self.contents.lock().unwrap().get(file_id) {
            Some(b) => Ok(b.clone()),
            None => bail!("no content for {}", file_id),
        }
    }
}

// ─── Model ──────────────────────────────────────────────────────────

/// Returns four events per source. Optionally blocks on a gate, or fails.
#[derive(Default)]
pub struct FakeModel {
    pub calls: AtomicUsize,
    /// User prompts in call order.
    pub prompts: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    pub gate: Option<tokio::sync::Semaphore>,
}

impl FakeModel {
    pub fn gated() -> Self {
        Self {
            gate: Some(tokio::sync::Semaphore::new(0)),
            ..Default::default()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(100);
        }
    }
}

#[async_trait]
impl ChatModel for FakeModel {
    fn provider(&self) -> &str {
        "fake"
    }

    fn model(&self) -> &str {
        "fake-1"
    }

    async fn complete_json(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(user.to_string());
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await?;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("model unavailable");
        }
        let prompt: Value = serde_json::from_str(user)?;
        let key = prompt["source_key"].as_str().unwrap_or("k");
        let events: Vec<Value> = (1..=4)
            .map(|i| json!({ "title": format!("{} event {}", key, i), "summary": "s", "evidence": [] }))
            .collect();
        Ok(json!({ "events": events }).to_string())
    }
}

// ─── Sink ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSink {
    pub rows: Mutex<BTreeMap<String, EventRow>>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl RowSink for FakeSink {
    async fn upsert(&self, _table: &str, rows: &[EventRow]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut map = self.rows.lock().unwrap();
        for row in rows {
            map.insert(row.event_id.clone(), row.clone());
        }
        Ok(())
    }
}

// ─── Wiring ─────────────────────────────────────────────────────────

pub struct Harness {
    pub drive: Arc<FakeDrive>,
    pub model: Arc<FakeModel>,
    pub sink: Arc<FakeSink>,
    pub store: Arc<MemoryStore>,
    pub sync: Arc<DriveSync>,
}

pub fn settings(data_dir: &Path, watch: bool, bind: Option<&str>) -> SyncSettings {
    let mut toml = format!(
        "[drive]\nfolder_id = \"{}\"\ndata_dir = \"{}\"\nchannel_token = \"{}\"\n",
        FOLDER,
        data_dir.display(),
        CHANNEL_TOKEN
    );
    if watch {
        toml.push_str("webhook_address = \"https://hooks.example.com/api/mcp/drive/webhook\"\n");
    }
    if let Some(bind) = bind {
        toml.push_str(&format!("[server]\nbind = \"{}\"\n", bind));
    }
    SyncSettings::from_config(&parse_config(&toml).unwrap()).unwrap()
}

pub async fn harness(data_dir: &Path, watch: bool, model: FakeModel) -> Harness {
    harness_with(settings(data_dir, watch, None), model).await
}

pub async fn harness_with(settings: SyncSettings, model: FakeModel) -> Harness {
    let drive = Arc::new(FakeDrive::default());
    *drive.start_token.lock().unwrap() = "100".to_string();
    let model = Arc::new(model);
    let sink = Arc::new(FakeSink::default());
    let store = Arc::new(MemoryStore::default());
    let sync = DriveSync::new(
        settings,
        drive.clone(),
        model.clone(),
        sink.clone(),
        store.clone(),
    )
    .await
    .unwrap();
    Harness {
        drive,
        model,
        sink,
        store,
        sync: Arc::new(sync),
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

pub fn tickets_csv() -> Vec<u8> {
    let mut csv = String::from("ts,issue_type,tickets\n");
    for i in 0..30 {
        let tickets = if i == 12 { 90 } else { 15 };
        csv.push_str(&format!("2026-03-01T00:{:02}:00Z,login,{}\n", i, tickets));
    }
    csv.into_bytes()
}

/// A minimal DOCX with one paragraph per entry.
pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf.into_inner()
}

/// A single-sheet XLSX, as Drive returns when exporting a native sheet.
/// Numeric cells are written as numbers, text as inline strings.
pub fn xlsx(rows: &[&[&str]]) -> Vec<u8> {
    let mut sheet_rows = String::new();
    for (r, row) in rows.iter().enumerate() {
        sheet_rows.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            let reference = format!("{}{}", (b'A' + c as u8) as char, r + 1);
            if value.parse::<f64>().is_ok() {
                sheet_rows.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, reference, value));
            } else {
                sheet_rows.push_str(&format!(
                    r#"<c r="{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                    reference, value
                ));
            }
        }
        sheet_rows.push_str("</row>");
    }

    const RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
    const DOC_RELS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
    let parts = [
        (
            "[Content_Types].xml".to_string(),
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#.to_string(),
        ),
        (
            "_rels/.rels".to_string(),
            format!(
                r#"<Relationships xmlns="{}"><Relationship Id="rId1" Type="{}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
                RELS_NS, DOC_RELS
            ),
        ),
        (
            "xl/workbook.xml".to_string(),
            format!(
                r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="{}"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
                DOC_RELS
            ),
        ),
        (
            "xl/_rels/workbook.xml.rels".to_string(),
            format!(
                r#"<Relationships xmlns="{}"><Relationship Id="rId1" Type="{}/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#,
                RELS_NS, DOC_RELS
            ),
        ),
        (
            "xl/worksheets/sheet1.xml".to_string(),
            format!(
                r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{}</sheetData></worksheet>"#,
                sheet_rows
            ),
        ),
    ];

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        for (name, content) in &parts {
            zip.start_file(name.as_str(), zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf.into_inner()
}
