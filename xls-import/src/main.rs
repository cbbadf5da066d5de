use anyhow::{anyhow, bail, Context, Result};
use calamine::{Reader, Xlsx};
use chrono::Local;
use log::{info, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::io::Cursor;
use std::time::Duration;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_API_URL: &str = "https://www.googleapis.com/drive/v3/files";

const GPT_MODEL: &str = "gpt-3.5-turbo";
const TARGET_HEADER: [&str; 3] = ["작성날짜", "제목", "국문"];
const PROCESSED_HEADER: [&str; 1] = ["file_id"];

struct AppConfig {
    gsheet_id: String,
    sheets_token: String,
    openai_api_key: String,
    folder_id: String,
    target_worksheet: String,
    processed_worksheet: String,
    prompt_worksheet: String,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let gsheet_id = env::var("GSHEET_ID").context("GSHEET_ID environment variable not set")?;
        let sheets_token =
            env::var("GSHEET_TOKEN").context("GSHEET_TOKEN environment variable not set")?;
        let openai_api_key =
            env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable not set")?;
        let folder_id = env::var("DRIVE_FOLDER_ID")
            .context("DRIVE_FOLDER_ID environment variable not set")?;
        let target_worksheet = env::var("XLS_WORKSHEET").unwrap_or_else(|_| "xls".to_string());
        let processed_worksheet =
            env::var("PROCESSED_WORKSHEET").unwrap_or_else(|_| "ProcessedExcel".to_string());
        let prompt_worksheet =
            env::var("PROMPT_WORKSHEET").unwrap_or_else(|_| "prompt".to_string());

        for (name, value) in [
            ("GSHEET_ID", &gsheet_id),
            ("GSHEET_TOKEN", &sheets_token),
            ("OPENAI_API_KEY", &openai_api_key),
            ("DRIVE_FOLDER_ID", &folder_id),
        ] {
            if value.trim().is_empty() {
                bail!("{} environment variable is empty", name);
            }
        }

        Ok(AppConfig {
            gsheet_id,
            sheets_token,
            openai_api_key,
            folder_id,
            target_worksheet,
            processed_worksheet,
            prompt_worksheet,
        })
    }
}

// Spreadsheet store

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

struct SheetsClient {
    http: Client,
    token: String,
    spreadsheet_id: String,
}

impl SheetsClient {
    fn new(token: String, spreadsheet_id: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client for Sheets")?;
        Ok(SheetsClient {
            http,
            token,
            spreadsheet_id,
        })
    }

    fn get_values(&self, worksheet: &str) -> Result<Vec<Vec<String>>> {
        let url = format!(
            "{}/{}/values/{}",
            SHEETS_API_URL, self.spreadsheet_id, worksheet
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .with_context(|| format!("Failed to read worksheet '{}'", worksheet))?;
        let status = response.status();
        let body = response.text().context("Failed to read Sheets response")?;
        if !status.is_success() {
            bail!(
                "Sheets API returned {} while reading '{}': {}",
                status,
                worksheet,
                body
            );
        }
        let range: ValueRange =
            serde_json::from_str(&body).context("Failed to parse Sheets values response")?;
        Ok(range.values)
    }

    fn append_row(&self, worksheet: &str, row: &[String]) -> Result<()> {
        let url = format!(
            "{}/{}/values/{}:append?valueInputOption=RAW",
            SHEETS_API_URL, self.spreadsheet_id, worksheet
        );
        let body = serde_json::json!({ "values": [row] });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .with_context(|| format!("Failed to append to worksheet '{}'", worksheet))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!(
                "Sheets API returned {} while appending to '{}': {}",
                status,
                worksheet,
                text
            );
        }
        Ok(())
    }

    fn write_header(&self, worksheet: &str, header: &[&str]) -> Result<()> {
        let url = format!(
            "{}/{}/values/{}!A1?valueInputOption=RAW",
            SHEETS_API_URL, self.spreadsheet_id, worksheet
        );
        let body = serde_json::json!({ "values": [header] });
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .with_context(|| format!("Failed to write header of '{}'", worksheet))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!(
                "Sheets API returned {} while writing header of '{}': {}",
                status,
                worksheet,
                text
            );
        }
        Ok(())
    }

    fn ensure_header(&self, worksheet: &str, header: &[&str]) -> Result<()> {
        let values = self.get_values(worksheet)?;
        let matches = values
            .first()
            .map(|row| row.iter().map(String::as_str).eq(header.iter().copied()))
            .unwrap_or(false);
        if !matches {
            self.write_header(worksheet, header)?;
        }
        Ok(())
    }
}

// Drive listing and download

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

struct DriveClient {
    http: Client,
    token: String,
}

impl DriveClient {
    fn new(token: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client for Drive")?;
        Ok(DriveClient { http, token })
    }

    fn list_workbooks(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let query = format!(
            "'{}' in parents and trashed=false and mimeType contains 'spreadsheet'",
            folder_id
        );
        let list: FileList = self
            .http
            .get(DRIVE_API_URL)
            .bearer_auth(&self.token)
            .query(&[("q", query.as_str()), ("fields", "files(id, name)")])
            .send()
            .context("Failed to list Drive folder")?
            .error_for_status()
            .context("Drive listing request rejected")?
            .json()
            .context("Failed to parse Drive listing")?;
        Ok(list.files)
    }

    fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", DRIVE_API_URL, file_id);
        let bytes = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .with_context(|| format!("Failed to download file {}", file_id))?
            .error_for_status()
            .with_context(|| format!("Drive download rejected for file {}", file_id))?
            .bytes()
            .context("Failed to read downloaded file body")?;
        Ok(bytes.to_vec())
    }
}

// Workbook parsing

/// Reads the first worksheet of an xlsx workbook into string rows.
fn workbook_rows(bytes: Vec<u8>) -> Result<Vec<Vec<String>>> {
    let mut workbook =
        Xlsx::new(Cursor::new(bytes)).context("Failed to open downloaded workbook")?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("Workbook has no worksheets"))?
        .context("Failed to read first worksheet")?;
    Ok(range
        .rows()
        .map(|row| row.iter().map(|value| value.to_string()).collect())
        .collect())
}

/// Locates the 제목/본문 columns from the workbook header row.
fn title_body_columns(rows: &[Vec<String>]) -> Option<(usize, usize)> {
    let header = rows.first()?;
    let find = |name: &str| {
        header
            .iter()
            .position(|value| value.trim() == name)
    };
    Some((find("제목")?, find("본문")?))
}

// Prompt and post generation

/// Builds the post-writing prompt from the active `xls` prompt row, with
/// column meaning resolved by header name.
fn prompt_from_rows(rows: &[Vec<String>]) -> Option<String> {
    let header = rows.first()?;
    let position = |name: &str| header.iter().position(|value| value.trim() == name);
    fn cell(row: &[String], idx: Option<usize>) -> &str {
        idx.and_then(|i| row.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    let source_idx = position("출처");
    let active_idx = position("현재사용여부");
    let field_idx: Vec<Option<usize>> = [
        "작성자 역할 설명",
        "전체 작성 조건",
        "글 구성방식",
        "필수 포함 항목",
        "마무리 문장",
        "추가 지시사항",
    ]
    .iter()
    .map(|name| position(name))
    .collect();

    rows.iter().skip(1).find_map(|row| {
        if cell(row, source_idx).trim() != "xls" || cell(row, active_idx).trim() != "Y" {
            return None;
        }
        let labels = [
            "작성자 역할 설명",
            "전체 작성 조건",
            "글 구성방식",
            "필수 포함 항목",
            "마무리 문장",
            "추가 지시사항",
        ];
        let lines: Vec<String> = labels
            .iter()
            .zip(&field_idx)
            .map(|(label, idx)| format!("{}: {}", label, cell(row, *idx)))
            .collect();
        Some(lines.join("\n"))
    })
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

struct PostClient {
    http: Client,
    api_key: String,
}

impl PostClient {
    fn new(api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client for chat service")?;
        Ok(PostClient { http, api_key })
    }

    fn generate_post(&self, prompt: &str, title: &str, body: &str) -> Result<String> {
        let content = format!(
            "{}\n\n제목: {}\n본문: {}\n이 내용을 바탕으로 블로그 글을 작성해 주세요.",
            prompt, title, body
        );
        let request = ChatRequest {
            model: GPT_MODEL.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content,
            }],
            temperature: 0.5,
            max_tokens: 2500,
        };
        let response = self
            .http
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .context("Chat request failed")?;
        let status = response.status();
        let body = response.text().context("Failed to read chat response")?;
        if !status.is_success() {
            bail!("Chat service returned {}: {}", status, body);
        }
        let parsed: ChatResponse =
            serde_json::from_str(&body).context("Failed to parse chat response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow!("Chat service returned no choices"))
    }
}

// Main process

fn run_import(config: &AppConfig) -> Result<usize> {
    let sheets = SheetsClient::new(config.sheets_token.clone(), config.gsheet_id.clone())?;
    let drive = DriveClient::new(config.sheets_token.clone())?;
    let posts = PostClient::new(config.openai_api_key.clone())?;

    sheets.ensure_header(&config.processed_worksheet, &PROCESSED_HEADER)?;
    sheets.ensure_header(&config.target_worksheet, &TARGET_HEADER)?;

    let processed: HashSet<String> = sheets
        .get_values(&config.processed_worksheet)?
        .iter()
        .skip(1)
        .filter_map(|row| row.first())
        .map(|id| id.trim().to_string())
        .collect();

    let prompt_rows = sheets.get_values(&config.prompt_worksheet)?;
    let prompt = prompt_from_rows(&prompt_rows)
        .ok_or_else(|| anyhow!("No active 'xls' prompt row in the prompt worksheet"))?;

    let files = drive.list_workbooks(&config.folder_id)?;
    info!("Found {} workbooks in folder", files.len());

    let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let mut imported = 0usize;

    for file in files {
        if processed.contains(file.id.trim()) {
            continue;
        }
        info!("Importing workbook '{}'", file.name);
        match import_workbook(config, &sheets, &drive, &posts, &prompt, &file, &now) {
            Ok(count) => {
                imported += count;
                sheets.append_row(&config.processed_worksheet, &[file.id.clone()])?;
            }
            Err(e) => warn!("Skipping workbook '{}': {:#}", file.name, e),
        }
    }

    info!("Import completed, {} posts written", imported);
    Ok(imported)
}

fn import_workbook(
    config: &AppConfig,
    sheets: &SheetsClient,
    drive: &DriveClient,
    posts: &PostClient,
    prompt: &str,
    file: &DriveFile,
    now: &str,
) -> Result<usize> {
    let rows = workbook_rows(drive.download(&file.id)?)?;
    let (title_idx, body_idx) = title_body_columns(&rows)
        .ok_or_else(|| anyhow!("Workbook is missing the 제목/본문 header row"))?;

    let mut written = 0usize;
    for row in rows.iter().skip(1) {
        let title = row.get(title_idx).map(String::as_str).unwrap_or("").trim();
        let body = row.get(body_idx).map(String::as_str).unwrap_or("").trim();
        if title.is_empty() || body.is_empty() {
            continue;
        }
        let post = match posts.generate_post(prompt, title, body) {
            Ok(post) => post,
            Err(e) => {
                warn!("Post generation failed for '{}': {}", title, e);
                continue;
            }
        };
        sheets.append_row(
            &config.target_worksheet,
            &[now.to_string(), title.to_string(), post],
        )?;
        written += 1;
    }
    Ok(written)
}

fn main() -> Result<()> {
    env_logger::init();
    let config = AppConfig::from_env()?;
    run_import(&config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_body_columns_found_by_name() {
        let rows = vec![
            vec!["번호".to_string(), "제목".to_string(), "본문".to_string()],
            vec!["1".to_string(), "a".to_string(), "b".to_string()],
        ];
        assert_eq!(title_body_columns(&rows), Some((1, 2)));
        let missing = vec![vec!["번호".to_string(), "제목".to_string()]];
        assert_eq!(title_body_columns(&missing), None);
    }

    #[test]
    fn prompt_built_from_active_xls_row() {
        let header: Vec<String> = [
            "출처",
            "현재사용여부",
            "작성자 역할 설명",
            "전체 작성 조건",
            "글 구성방식",
            "필수 포함 항목",
            "마무리 문장",
            "추가 지시사항",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let row = |source: &str, active: &str| -> Vec<String> {
            let mut r = vec![source.to_string(), active.to_string()];
            r.extend(
                ["역할", "조건", "구성", "포함", "마무리", "추가"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            r
        };
        let rows = vec![header, row("raindrop", "Y"), row("xls", "N"), row("xls", "Y")];
        let prompt = prompt_from_rows(&rows).unwrap();
        assert!(prompt.contains("작성자 역할 설명: 역할"));
        assert!(prompt.contains("추가 지시사항: 추가"));
    }

    #[test]
    fn no_prompt_when_none_active() {
        let rows = vec![vec!["출처".to_string(), "현재사용여부".to_string()]];
        assert_eq!(prompt_from_rows(&rows), None);
    }
}
