use anyhow::{bail, Context, Result};
use chrono::Local;
use log::{info, warn};
use readability::extractor;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::io::Cursor;
use std::{thread, time::Duration};
use url::Url;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const RAINDROP_API_URL: &str = "https://api.raindrop.io/rest/v1";

const GPT_MODEL: &str = "gpt-3.5-turbo";
const SUMMARY_RETRIES: u32 = 3;
const SUMMARY_RETRY_PAUSE_SECS: u64 = 3;
const MAX_PAGE_TEXT_CHARS: usize = 5000;

const OUTPUT_HEADER: [&str; 7] = [
    "작성일시",
    "제목",
    "요약",
    "링크",
    "태그",
    "사이트분류",
    "컬렉션 ID",
];

struct AppConfig {
    raindrop_token: String,
    gsheet_id: String,
    sheets_token: String,
    openai_api_key: String,
    target_worksheet: String,
    prompt_worksheet: String,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let raindrop_token =
            env::var("RAINDROP_TOKEN").context("RAINDROP_TOKEN environment variable not set")?;
        let gsheet_id = env::var("GSHEET_ID").context("GSHEET_ID environment variable not set")?;
        let sheets_token =
            env::var("GSHEET_TOKEN").context("GSHEET_TOKEN environment variable not set")?;
        let openai_api_key =
            env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable not set")?;
        let target_worksheet = env::var("BOOKMARKS_WORKSHEET")
            .unwrap_or_else(|_| "support business".to_string());
        let prompt_worksheet =
            env::var("PROMPT_WORKSHEET").unwrap_or_else(|_| "prompt".to_string());

        for (name, value) in [
            ("RAINDROP_TOKEN", &raindrop_token),
            ("GSHEET_ID", &gsheet_id),
            ("GSHEET_TOKEN", &sheets_token),
            ("OPENAI_API_KEY", &openai_api_key),
        ] {
            if value.trim().is_empty() {
                bail!("{} environment variable is empty", name);
            }
        }

        Ok(AppConfig {
            raindrop_token,
            gsheet_id,
            sheets_token,
            openai_api_key,
            target_worksheet,
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

    /// Rewrites the header row in place, as the source scripts did on every
    /// run.
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
}

// Raindrop API

#[derive(Deserialize)]
struct CollectionList {
    #[serde(default)]
    items: Vec<Collection>,
}

#[derive(Deserialize)]
struct Collection {
    #[serde(alias = "_id", alias = "$id")]
    id: Option<i64>,
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct RaindropList {
    #[serde(default)]
    items: Vec<Raindrop>,
}

#[derive(Deserialize)]
struct Raindrop {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    tags: Vec<String>,
    collection: Option<CollectionRef>,
}

#[derive(Deserialize)]
struct CollectionRef {
    #[serde(alias = "_id", alias = "$id")]
    id: Option<i64>,
}

struct RaindropClient {
    http: Client,
    token: String,
}

impl RaindropClient {
    fn new(token: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client for Raindrop")?;
        Ok(RaindropClient { http, token })
    }

    fn collections(&self) -> Result<HashMap<String, String>> {
        let url = format!("{}/collections", RAINDROP_API_URL);
        let list: CollectionList = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .context("Failed to request Raindrop collections")?
            .error_for_status()
            .context("Raindrop collections request rejected")?
            .json()
            .context("Failed to parse Raindrop collections")?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|c| c.id.map(|id| (id.to_string(), c.title)))
            .collect())
    }

    fn bookmarks(&self) -> Result<Vec<Raindrop>> {
        // Collection 0 is the Raindrop pseudo-collection holding everything.
        let url = format!("{}/raindrops/0", RAINDROP_API_URL);
        let list: RaindropList = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .context("Failed to request Raindrop bookmarks")?
            .error_for_status()
            .context("Raindrop bookmarks request rejected")?
            .json()
            .context("Failed to parse Raindrop bookmarks")?;
        Ok(list.items)
    }
}

// Page text extraction

fn extract_main_text(http: &Client, link: &str) -> Option<String> {
    let page_url = match Url::parse(link) {
        Ok(url) => url,
        Err(e) => {
            warn!("Skipping unparseable link {}: {}", link, e);
            return None;
        }
    };
    let html = match http.get(link).send().and_then(|r| r.error_for_status()) {
        Ok(response) => match response.text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not read page body for {}: {}", link, e);
                return None;
            }
        },
        Err(e) => {
            warn!("Could not fetch {}: {}", link, e);
            return None;
        }
    };

    let mut cursor = Cursor::new(html);
    match extractor::extract(&mut cursor, &page_url) {
        Ok(product) => Some(truncate_chars(product.text.trim(), MAX_PAGE_TEXT_CHARS)),
        Err(e) => {
            warn!("Readability extraction failed for {}: {}", link, e);
            None
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

// Prompt selection and summary generation

struct PromptFields {
    role: String,
    conditions: String,
    structure: String,
    must_include: String,
    conclusion: String,
    extra: String,
}

/// Positional prompt layout: B source, C site category, D tag, E active
/// flag, F..K the six prompt fields.
fn find_prompt(rows: &[Vec<String>], site_category: &str, tag: &str) -> Option<PromptFields> {
    fn cell(row: &[String], idx: usize) -> &str {
        row.get(idx).map(String::as_str).unwrap_or("")
    }
    rows.iter().skip(1).find_map(|row| {
        if row.len() < 11 {
            return None;
        }
        let source = cell(row, 1).trim().to_lowercase();
        let site = cell(row, 2).trim();
        let tag_val = cell(row, 3).trim();
        let active = cell(row, 4).trim().to_uppercase();
        if source == "raindrop" && site == site_category && tag_val == tag && active == "Y" {
            Some(PromptFields {
                role: cell(row, 5).to_string(),
                conditions: cell(row, 6).to_string(),
                structure: cell(row, 7).to_string(),
                must_include: cell(row, 8).to_string(),
                conclusion: cell(row, 9).to_string(),
                extra: cell(row, 10).to_string(),
            })
        } else {
            None
        }
    })
}

fn build_summary_prompt(fields: &PromptFields, title: &str, text: &str) -> String {
    format!(
        "{}\n\n✍️ 작성 조건:\n{}\n\n🧭 글 구성 방식:\n{}\n\n📌 반드시 포함할 항목:\n{}\n\n🎯 마무리 문장:\n{}\n\n📎 추가 지시사항:\n{}\n\n---\n지원사업 제목: {}\n스크랩한 본문:\n{}",
        fields.role,
        fields.conditions,
        fields.structure,
        fields.must_include,
        fields.conclusion,
        fields.extra,
        title,
        text
    )
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

struct SummaryClient {
    http: Client,
    api_key: String,
}

impl SummaryClient {
    fn new(api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client for chat service")?;
        Ok(SummaryClient { http, api_key })
    }

    fn chat_once(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: GPT_MODEL.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.7,
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
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            bail!("Chat service returned an empty summary");
        }
        Ok(content)
    }

    fn summarize(&self, prompt: &str) -> Option<String> {
        for attempt in 1..=SUMMARY_RETRIES {
            match self.chat_once(prompt) {
                Ok(summary) => return Some(summary),
                Err(e) => {
                    warn!("Summary attempt {}/{} failed: {}", attempt, SUMMARY_RETRIES, e);
                    if attempt < SUMMARY_RETRIES {
                        thread::sleep(Duration::from_secs(SUMMARY_RETRY_PAUSE_SECS));
                    }
                }
            }
        }
        None
    }
}

// Main process

fn run_bookmarks(config: &AppConfig) -> Result<usize> {
    let raindrop = RaindropClient::new(config.raindrop_token.clone())?;
    let sheets = SheetsClient::new(config.sheets_token.clone(), config.gsheet_id.clone())?;
    let summaries = SummaryClient::new(config.openai_api_key.clone())?;
    let page_http = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client for page fetches")?;

    // Collection titles are cosmetic; keep going without them.
    let collection_titles = raindrop.collections().unwrap_or_else(|e| {
        warn!("Could not load collection titles: {}", e);
        HashMap::new()
    });

    let items = raindrop.bookmarks()?;
    info!("Fetched {} bookmarks", items.len());

    sheets.write_header(&config.target_worksheet, &OUTPUT_HEADER)?;
    let existing = sheets.get_values(&config.target_worksheet)?;
    let mut existing_links: HashSet<String> = existing
        .iter()
        .skip(1)
        .filter_map(|row| row.get(3))
        .map(|link| link.trim().to_string())
        .collect();

    let prompt_rows = sheets.get_values(&config.prompt_worksheet)?;

    let mut added = 0usize;
    for item in items {
        if item.title.is_empty() || item.link.is_empty() || item.tags.is_empty() {
            continue;
        }
        if existing_links.contains(item.link.trim()) {
            continue;
        }

        let Some(text) = extract_main_text(&page_http, &item.link) else {
            continue;
        };

        let collection_id = item
            .collection
            .as_ref()
            .and_then(|c| c.id)
            .map(|id| id.to_string())
            .unwrap_or_default();
        let collection_name = collection_titles
            .get(&collection_id)
            .cloned()
            .unwrap_or_default();

        let tag = item.tags.first().map(String::as_str).unwrap_or("");
        let Some(fields) = find_prompt(&prompt_rows, &collection_name, tag) else {
            warn!(
                "No prompt matches site '{}' tag '{}', skipping '{}'",
                collection_name, tag, item.title
            );
            continue;
        };

        let prompt = build_summary_prompt(&fields, &item.title, &text);
        let Some(summary) = summaries.summarize(&prompt) else {
            warn!("Summary generation failed for '{}', skipping", item.title);
            continue;
        };

        let row = vec![
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            item.title.clone(),
            summary,
            item.link.clone(),
            item.tags.join(", "),
            collection_name.clone(),
            collection_id,
        ];
        sheets.append_row(&config.target_worksheet, &row)?;
        existing_links.insert(item.link.trim().to_string());
        added += 1;
        info!("Added '{}' (site '{}')", item.title, collection_name);
    }

    info!("Bookmark run completed, {} rows added", added);
    Ok(added)
}

fn main() -> Result<()> {
    env_logger::init();
    let config = AppConfig::from_env()?;
    run_bookmarks(&config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt_row(source: &str, site: &str, tag: &str, active: &str) -> Vec<String> {
        let mut row = vec![
            "2024-01-01".to_string(),
            source.to_string(),
            site.to_string(),
            tag.to_string(),
            active.to_string(),
        ];
        row.extend(
            ["역할", "조건", "구성", "포함", "마무리", "추가"]
                .iter()
                .map(|s| s.to_string()),
        );
        row
    }

    #[test]
    fn prompt_matching_requires_all_keys() {
        let rows = vec![
            vec!["header".to_string()],
            prompt_row("raindrop", "지원사업", "창업", "Y"),
            prompt_row("raindrop", "지원사업", "수출", "N"),
            prompt_row("xls", "지원사업", "창업", "Y"),
        ];
        assert!(find_prompt(&rows, "지원사업", "창업").is_some());
        assert!(find_prompt(&rows, "지원사업", "수출").is_none());
        assert!(find_prompt(&rows, "다른분류", "창업").is_none());
    }

    #[test]
    fn prompt_matching_ignores_short_rows() {
        let rows = vec![
            vec!["header".to_string()],
            vec!["".to_string(), "raindrop".to_string()],
        ];
        assert!(find_prompt(&rows, "", "").is_none());
    }

    #[test]
    fn summary_prompt_embeds_title_and_text() {
        let fields = PromptFields {
            role: "역할".to_string(),
            conditions: "조건".to_string(),
            structure: "구성".to_string(),
            must_include: "포함".to_string(),
            conclusion: "마무리".to_string(),
            extra: "추가".to_string(),
        };
        let prompt = build_summary_prompt(&fields, "제목A", "본문B");
        assert!(prompt.contains("지원사업 제목: 제목A"));
        assert!(prompt.contains("본문B"));
        assert!(prompt.starts_with("역할"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "가".repeat(6000);
        assert_eq!(truncate_chars(&text, 5000).chars().count(), 5000);
        assert_eq!(truncate_chars("short", 5000), "short");
    }
}
