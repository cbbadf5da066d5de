use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use log::{error, info, warn};
use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

const MAX_RETRIES: u32 = 5;
const SIMILARITY_THRESHOLD: f64 = 0.6;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Target worksheet header, written once when the sheet is still empty.
const OUTPUT_HEADER: [&str; 11] = [
    "작성일시",
    "origin tag",
    "사이트 분류",
    "제목",
    "내용",
    "태그",
    "영문",
    "중문",
    "일문",
    "표절률",
    "이미지url",
];

/// Prompt worksheet columns that must exist before any row is processed.
const REQUIRED_PROMPT_COLUMNS: [&str; 15] = [
    "생성일자",
    "출처",
    "이미지태그",
    "구분태그",
    "현재사용여부",
    "작성자 역할 설명",
    "전체 작성 조건",
    "글 구성방식",
    "필수 포함 항목",
    "마무리 문장",
    "추가 지시사항",
    "GPT 모델방식",
    "글 간격",
    "기본 gpt",
    "고급 gpt",
];

struct AppConfig {
    source_db_id: String,
    target_db_id: String,
    source_worksheet: String,
    target_worksheet: String,
    prompt_worksheet: String,
    image_worksheet: String,
    sheets_token: String,
    openai_api_key: String,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let source_db_id =
            env::var("SOURCE_DB_ID").context("SOURCE_DB_ID environment variable not set")?;
        let target_db_id =
            env::var("TARGET_DB_ID").context("TARGET_DB_ID environment variable not set")?;
        let source_worksheet = env::var("SOURCE_WORKSHEET")
            .context("SOURCE_WORKSHEET environment variable not set")?;
        let target_worksheet = env::var("TARGET_WORKSHEET")
            .context("TARGET_WORKSHEET environment variable not set")?;
        let prompt_worksheet =
            env::var("PROMPT_WORKSHEET").unwrap_or_else(|_| "prompt".to_string());
        let image_worksheet = env::var("IMAGE_WORKSHEET").unwrap_or_else(|_| "image".to_string());
        let sheets_token =
            env::var("GSHEET_TOKEN").context("GSHEET_TOKEN environment variable not set")?;
        let openai_api_key =
            env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable not set")?;

        for (name, value) in [
            ("SOURCE_DB_ID", &source_db_id),
            ("TARGET_DB_ID", &target_db_id),
            ("GSHEET_TOKEN", &sheets_token),
            ("OPENAI_API_KEY", &openai_api_key),
        ] {
            if value.trim().is_empty() {
                bail!("{} environment variable is empty", name);
            }
        }

        Ok(AppConfig {
            source_db_id,
            target_db_id,
            source_worksheet,
            target_worksheet,
            prompt_worksheet,
            image_worksheet,
            sheets_token,
            openai_api_key,
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
}

impl SheetsClient {
    fn new(token: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client for Sheets")?;
        Ok(SheetsClient { http, token })
    }

    fn get_values(&self, spreadsheet_id: &str, worksheet: &str) -> Result<Vec<Vec<String>>> {
        let url = format!("{}/{}/values/{}", SHEETS_API_URL, spreadsheet_id, worksheet);
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

    fn append_row(&self, spreadsheet_id: &str, worksheet: &str, row: &[String]) -> Result<()> {
        let url = format!(
            "{}/{}/values/{}:append?valueInputOption=RAW",
            SHEETS_API_URL, spreadsheet_id, worksheet
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

    /// Overwrites a single cell. Row and column are 1-based.
    fn update_cell(
        &self,
        spreadsheet_id: &str,
        worksheet: &str,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<()> {
        let cell = format!("{}!{}{}", worksheet, a1_column(col), row);
        let url = format!(
            "{}/{}/values/{}?valueInputOption=RAW",
            SHEETS_API_URL, spreadsheet_id, cell
        );
        let body = serde_json::json!({ "values": [[value]] });
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .with_context(|| format!("Failed to update cell {}", cell))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("Sheets API returned {} while updating {}: {}", status, cell, text);
        }
        Ok(())
    }
}

fn a1_column(mut col: usize) -> String {
    let mut letters = String::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.insert(0, (b'A' + rem as u8) as char);
        col = (col - 1) / 26;
    }
    letters
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(String::as_str).unwrap_or("")
}

fn header_map(header: &[String]) -> HashMap<String, usize> {
    header
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.trim().to_string(), idx))
        .collect()
}

// Text-generation service

#[derive(Serialize, Clone)]
struct Message {
    role: String,
    content: String,
}

impl Message {
    fn system(content: impl Into<String>) -> Self {
        Message {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Message {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
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

#[derive(Debug, thiserror::Error)]
enum ChatError {
    #[error("chat request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chat service returned status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to parse chat response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("chat service returned no choices")]
    EmptyChoices,
}

/// Seam between the rewriter and the chat-completions endpoint so the retry
/// loop can be exercised with a stub.
trait TextGenerator {
    fn generate(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ChatError>;
}

struct OpenAiClient {
    http: Client,
    api_key: String,
}

impl OpenAiClient {
    fn new(api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client for chat service")?;
        Ok(OpenAiClient { http, api_key })
    }
}

impl TextGenerator for OpenAiClient {
    fn generate(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ChatError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature,
            max_tokens,
        };
        let response = self
            .http
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(ChatError::Status { status, body });
        }
        let parsed: ChatResponse = serde_json::from_str(&body)?;
        let choice = parsed.choices.into_iter().next().ok_or(ChatError::EmptyChoices)?;
        Ok(choice.message.content.trim().to_string())
    }
}

// Uniqueness-constrained rewriter

#[derive(Debug, Clone)]
struct StyleConfig {
    role: String,
    conditions: String,
    structure: String,
    must_include: String,
    conclusion: String,
    extra: String,
}

impl StyleConfig {
    fn system_message(&self) -> String {
        [
            self.role.as_str(),
            self.conditions.as_str(),
            self.structure.as_str(),
            self.must_include.as_str(),
            self.conclusion.as_str(),
            self.extra.as_str(),
        ]
        .join("\n\n")
        .trim()
        .to_string()
    }

    /// The last style field may carry a length hint like "2000자"; it selects
    /// the output token budget.
    fn max_tokens(&self) -> u32 {
        let extra = self.extra.to_lowercase();
        if extra.contains("3000자") {
            3000
        } else if extra.contains("2500자") {
            2500
        } else if extra.contains("2000자") {
            2000
        } else {
            3000
        }
    }
}

fn build_messages(style: &StyleConfig, title: &str, body: &str) -> Vec<Message> {
    let user = format!(
        "다음 글을 중복되지 않도록 재작성해줘:\n\n제목: {}\n내용: {}",
        title, body
    );
    vec![
        Message::system(style.system_message()),
        Message::user(user.trim().to_string()),
    ]
}

/// Strips leading section labels the model tends to prepend to paragraphs.
/// Cosmetic cleanup only; text without labels passes through unchanged apart
/// from the surrounding trim.
fn clean_content(text: &str) -> String {
    let re = Regex::new(r"(?m)^(서론|문제 상황|실무 팁|결론)[:\-]?\s*").unwrap();
    re.replace_all(text, "").trim().to_string()
}

/// SequenceMatcher-style ratio: twice the total size of the matching blocks
/// over the combined length, on characters. 1.0 for identical strings, 0.0
/// when nothing aligns.
fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, &ch) in b.iter().enumerate() {
        b2j.entry(ch).or_default().push(j);
    }

    let mut matches = 0usize;
    let mut queue = vec![(0usize, a.len(), 0usize, b.len())];
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, size) = longest_match(&a, &b2j, alo, ahi, blo, bhi);
        if size > 0 {
            matches += size;
            queue.push((alo, i, blo, j));
            queue.push((i + size, ahi, j + size, bhi));
        }
    }
    2.0 * matches as f64 / total as f64
}

fn longest_match(
    a: &[char],
    b2j: &HashMap<char, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let mut besti = alo;
    let mut bestj = blo;
    let mut bestsize = 0usize;
    let mut j2len: HashMap<usize, usize> = HashMap::new();

    for (i, &ch) in a.iter().enumerate().take(ahi).skip(alo) {
        let mut newj2len: HashMap<usize, usize> = HashMap::new();
        if let Some(indices) = b2j.get(&ch) {
            for &j in indices {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let size = if j > 0 {
                    j2len.get(&(j - 1)).copied().unwrap_or(0) + 1
                } else {
                    1
                };
                newj2len.insert(j, size);
                if size > bestsize {
                    besti = i + 1 - size;
                    bestj = j + 1 - size;
                    bestsize = size;
                }
            }
        }
        j2len = newj2len;
    }
    (besti, bestj, bestsize)
}

/// Maximum similarity of a candidate against the corpus of previously
/// produced texts. An empty corpus scores 0 and is always accepted.
fn corpus_similarity(candidate: &str, corpus: &[String]) -> f64 {
    corpus
        .iter()
        .map(|existing| similarity_ratio(candidate, existing))
        .fold(0.0, f64::max)
}

#[derive(Debug)]
struct RegenerationResult {
    text: String,
    similarity: f64,
    attempts_used: u32,
}

/// Rewrites `body` until the result is sufficiently different from every
/// text in `corpus`, or the retry budget runs out. On exhaustion the last
/// candidate is returned as-is, not the best-scoring one. A failed service
/// call consumes its attempt; the call only errors when no attempt produced
/// a candidate at all.
fn regenerate_unique_post(
    generator: &dyn TextGenerator,
    model: &str,
    title: &str,
    body: &str,
    corpus: &[String],
    style: &StyleConfig,
) -> Result<RegenerationResult> {
    let messages = build_messages(style, title, body);
    let max_tokens = style.max_tokens();

    let mut last: Option<RegenerationResult> = None;
    let mut last_err: Option<ChatError> = None;

    for attempt in 1..=MAX_RETRIES {
        let raw = match generator.generate(model, &messages, 0.8, max_tokens) {
            Ok(text) => text,
            Err(e) => {
                warn!("Generation attempt {}/{} failed: {}", attempt, MAX_RETRIES, e);
                last_err = Some(e);
                continue;
            }
        };
        let candidate = clean_content(&raw);
        let score = corpus_similarity(&candidate, corpus);
        if score < SIMILARITY_THRESHOLD {
            return Ok(RegenerationResult {
                text: candidate,
                similarity: score,
                attempts_used: attempt,
            });
        }
        info!(
            "Attempt {}/{} too similar ({:.2} >= {:.2}), retrying",
            attempt, MAX_RETRIES, score, SIMILARITY_THRESHOLD
        );
        last = Some(RegenerationResult {
            text: candidate,
            similarity: score,
            attempts_used: attempt,
        });
    }

    match last {
        Some(result) => Ok(result),
        None => {
            let err = last_err
                .map(anyhow::Error::new)
                .unwrap_or_else(|| anyhow!("no generation attempt produced a candidate"));
            Err(err.context("All regeneration attempts failed"))
        }
    }
}

// Single-shot helpers sharing the chat service

fn regenerate_title(generator: &dyn TextGenerator, model: &str, content: &str) -> Result<String> {
    let system = "너는 마케팅 콘텐츠 전문가야. 아래 내용을 보고 클릭을 유도하는 짧은 제목을 작성해줘.";
    let excerpt: String = content.chars().take(1000).collect();
    let messages = vec![Message::system(system), Message::user(excerpt)];
    let title = generator
        .generate(model, &messages, 0.7, 800)
        .context("Failed to regenerate title")?;
    let re = Regex::new(r"^.*?:\s*").unwrap();
    Ok(re.replace(title.trim(), "").to_string())
}

fn extract_tags(generator: &dyn TextGenerator, model: &str, content: &str) -> Result<Vec<String>> {
    let prompt = format!(
        "다음 글에서 실무 중심 명사 5개를 해시태그(#키워드) 형태로 추출해줘. 글: {}",
        content
    );
    let messages = vec![
        Message::system("당신은 태그 추출 전문가입니다."),
        Message::user(prompt),
    ];
    let reply = generator
        .generate(model, &messages, 0.0, 50)
        .context("Failed to extract tags")?;
    let re = Regex::new(r"#(\w+)").unwrap();
    Ok(re
        .captures_iter(&reply)
        .take(5)
        .map(|cap| cap[1].to_string())
        .collect())
}

fn translate_text(
    generator: &dyn TextGenerator,
    model: &str,
    text: &str,
    lang: &str,
) -> Result<String> {
    let target = match lang {
        "Chinese" => "Simplified Chinese",
        other => other,
    };
    let messages = vec![
        Message::system(format!("다음을 {}로 번역해줘.", target)),
        Message::user(text),
    ];
    generator
        .generate(model, &messages, 0.5, 2000)
        .with_context(|| format!("Failed to translate into {}", target))
}

// Batch driver

#[derive(Debug)]
struct PromptRow {
    sheet_row: usize,
    image_tag: String,
    category_tag: String,
    style: StyleConfig,
    interval: u32,
    basic_model: String,
    advanced_model: String,
    run_count: u32,
}

fn load_prompt_rows(
    values: &[Vec<String>],
    source_worksheet: &str,
) -> Result<(Vec<PromptRow>, usize)> {
    let header = values
        .first()
        .ok_or_else(|| anyhow!("Prompt worksheet is empty"))?;
    let columns = header_map(header);
    for name in REQUIRED_PROMPT_COLUMNS {
        if !columns.contains_key(name) {
            bail!("Prompt worksheet is missing required column '{}'", name);
        }
    }
    let run_idx = columns
        .get("run_count")
        .copied()
        .unwrap_or(header.len());

    let col = |name: &str| columns[name];
    let mut prompts = Vec::new();
    for (offset, row) in values.iter().enumerate().skip(1) {
        if cell(row, col("출처")).trim() != source_worksheet {
            continue;
        }
        if cell(row, col("현재사용여부")).trim().to_uppercase() != "Y" {
            continue;
        }
        let category_tag = cell(row, col("구분태그")).trim().to_string();
        if category_tag.is_empty() {
            continue;
        }
        let basic_model = {
            let m = cell(row, col("기본 gpt")).trim();
            if m.is_empty() { "gpt-3.5-turbo" } else { m }.to_string()
        };
        let advanced_model = {
            let m = cell(row, col("고급 gpt")).trim();
            if m.is_empty() {
                basic_model.clone()
            } else {
                m.to_string()
            }
        };
        prompts.push(PromptRow {
            sheet_row: offset + 1,
            image_tag: cell(row, col("이미지태그")).trim().to_string(),
            category_tag,
            style: StyleConfig {
                role: cell(row, col("작성자 역할 설명")).to_string(),
                conditions: cell(row, col("전체 작성 조건")).to_string(),
                structure: cell(row, col("글 구성방식")).to_string(),
                must_include: cell(row, col("필수 포함 항목")).to_string(),
                conclusion: cell(row, col("마무리 문장")).to_string(),
                extra: cell(row, col("추가 지시사항")).to_string(),
            },
            interval: cell(row, col("글 간격")).trim().parse().unwrap_or(1),
            basic_model,
            advanced_model,
            run_count: cell(row, run_idx).trim().parse().unwrap_or(0),
        });
    }
    Ok((prompts, run_idx))
}

/// Alternates between the basic and advanced model: `interval` runs on the
/// basic model, then one run on the advanced model, then the counter resets.
fn select_model(prompt: &PromptRow) -> (&str, u32) {
    if prompt.run_count < prompt.interval {
        (&prompt.basic_model, prompt.run_count + 1)
    } else {
        (&prompt.advanced_model, 0)
    }
}

fn find_matching_image(image_rows: &[Vec<String>], image_tag: &str) -> String {
    if image_tag.is_empty() || image_rows.is_empty() {
        return String::new();
    }
    let columns = header_map(&image_rows[0]);
    let (Some(&tag_idx), Some(&url_idx)) = (columns.get("이미지태그"), columns.get("이미지url"))
    else {
        return String::new();
    };
    image_rows
        .iter()
        .skip(1)
        .find(|row| cell(row, tag_idx).trim() == image_tag && !cell(row, url_idx).trim().is_empty())
        .map(|row| cell(row, url_idx).trim().to_string())
        .unwrap_or_default()
}

fn ensure_output_header(sheets: &SheetsClient, config: &AppConfig) -> Result<()> {
    let values = sheets.get_values(&config.target_db_id, &config.target_worksheet)?;
    let has_header = values
        .first()
        .map(|row| row.iter().any(|c| !c.trim().is_empty()))
        .unwrap_or(false);
    if !has_header {
        let header: Vec<String> = OUTPUT_HEADER.iter().map(|s| s.to_string()).collect();
        sheets.append_row(&config.target_db_id, &config.target_worksheet, &header)?;
    }
    Ok(())
}

fn run_regeneration(
    config: &AppConfig,
    sheets: &SheetsClient,
    generator: &dyn TextGenerator,
) -> Result<usize> {
    info!("Starting regeneration for worksheet '{}'", config.source_worksheet);

    let source_rows = sheets.get_values(&config.source_db_id, &config.source_worksheet)?;
    if source_rows.len() < 2 {
        warn!("No source rows in worksheet '{}'", config.source_worksheet);
        return Ok(0);
    }
    let source_columns = header_map(&source_rows[0]);
    for name in ["제목", "요약", "구분태그"] {
        if !source_columns.contains_key(name) {
            bail!(
                "Source worksheet '{}' is missing required column '{}'",
                config.source_worksheet,
                name
            );
        }
    }
    let title_idx = source_columns["제목"];
    let body_idx = source_columns["요약"];
    let tag_idx = source_columns["구분태그"];

    let prompt_values = sheets.get_values(&config.source_db_id, &config.prompt_worksheet)?;
    let (prompts, run_idx) = load_prompt_rows(&prompt_values, &config.source_worksheet)?;
    if prompts.is_empty() {
        warn!(
            "No active prompt rows for source '{}'",
            config.source_worksheet
        );
        return Ok(0);
    }
    // Create the run_count column on first use.
    if run_idx >= prompt_values[0].len() {
        sheets.update_cell(
            &config.source_db_id,
            &config.prompt_worksheet,
            1,
            run_idx + 1,
            "run_count",
        )?;
    }

    let image_rows = sheets
        .get_values(&config.source_db_id, &config.image_worksheet)
        .unwrap_or_else(|e| {
            warn!("Could not read image worksheet: {}", e);
            Vec::new()
        });

    ensure_output_header(sheets, config)?;

    let mut saved = 0usize;
    let mut failures = 0usize;

    for prompt in &prompts {
        match process_prompt(
            config,
            sheets,
            generator,
            prompt,
            run_idx,
            &source_rows,
            (title_idx, body_idx, tag_idx),
            &image_rows,
        ) {
            Ok(true) => saved += 1,
            Ok(false) => {}
            Err(e) => {
                failures += 1;
                error!(
                    "Failed to process prompt for tag '{}': {:#}",
                    prompt.category_tag, e
                );
            }
        }
    }

    if saved == 0 && failures > 0 {
        bail!("No prompt produced output ({} failures)", failures);
    }
    info!("Regeneration completed, {} posts saved", saved);
    Ok(saved)
}

#[allow(clippy::too_many_arguments)]
fn process_prompt(
    config: &AppConfig,
    sheets: &SheetsClient,
    generator: &dyn TextGenerator,
    prompt: &PromptRow,
    run_idx: usize,
    source_rows: &[Vec<String>],
    (title_idx, body_idx, tag_idx): (usize, usize, usize),
    image_rows: &[Vec<String>],
) -> Result<bool> {
    let matching: Vec<&Vec<String>> = source_rows
        .iter()
        .skip(1)
        .filter(|row| cell(row, tag_idx).trim() == prompt.category_tag)
        .collect();
    if matching.is_empty() {
        warn!("No source rows match tag '{}'", prompt.category_tag);
        return Ok(false);
    }

    // Rotate through the matching rows across runs instead of drawing at
    // random, so repeated cycles cover the whole set.
    let item = matching[prompt.run_count as usize % matching.len()];
    let original_title = cell(item, title_idx).trim();
    let original_body = cell(item, body_idx).trim();
    if original_body.is_empty() {
        warn!("Source row for tag '{}' has an empty body, skipping", prompt.category_tag);
        return Ok(false);
    }

    let corpus: Vec<String> = matching
        .iter()
        .map(|row| cell(row, body_idx).to_string())
        .filter(|text| !text.trim().is_empty())
        .collect();

    let (model, new_count) = select_model(prompt);
    info!(
        "Regenerating tag '{}' with model '{}' (run {} of interval {})",
        prompt.category_tag, model, prompt.run_count, prompt.interval
    );

    let result = regenerate_unique_post(
        generator,
        model,
        original_title,
        original_body,
        &corpus,
        &prompt.style,
    )?;
    info!(
        "Accepted candidate after {} attempt(s), similarity {:.2}",
        result.attempts_used, result.similarity
    );

    let title = regenerate_title(generator, &prompt.basic_model, &result.text)?;
    let tags = extract_tags(generator, &prompt.basic_model, &result.text)?;
    let english = translate_text(generator, &prompt.basic_model, &result.text, "English")?;
    let chinese = translate_text(generator, &prompt.basic_model, &result.text, "Chinese")?;
    let japanese = translate_text(generator, &prompt.basic_model, &result.text, "Japanese")?;
    let image_url = find_matching_image(image_rows, &prompt.image_tag);

    let row = vec![
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        prompt.category_tag.clone(),
        String::new(),
        title.clone(),
        result.text,
        tags.join(", "),
        english,
        chinese,
        japanese,
        format!("{:.2}", result.similarity),
        image_url,
    ];
    sheets.append_row(&config.target_db_id, &config.target_worksheet, &row)?;
    sheets.update_cell(
        &config.source_db_id,
        &config.prompt_worksheet,
        prompt.sheet_row,
        run_idx + 1,
        &new_count.to_string(),
    )?;
    info!("Saved '{}' (similarity {:.2})", title, result.similarity);
    Ok(true)
}

fn main() -> Result<()> {
    env_logger::init();

    let config = AppConfig::from_env()?;
    let sheets = SheetsClient::new(config.sheets_token.clone())?;
    let generator = OpenAiClient::new(config.openai_api_key.clone())?;

    let saved = run_regeneration(&config, &sheets, &generator)?;
    info!("Done, {} posts saved", saved);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct StubGenerator {
        replies: RefCell<Vec<Result<String, ChatError>>>,
        calls: RefCell<u32>,
    }

    impl StubGenerator {
        fn new(replies: Vec<Result<String, ChatError>>) -> Self {
            StubGenerator {
                replies: RefCell::new(replies),
                calls: RefCell::new(0),
            }
        }

        fn repeating(reply: &str) -> Self {
            StubGenerator::new(
                std::iter::repeat_with(|| Ok(reply.to_string()))
                    .take(MAX_RETRIES as usize)
                    .collect(),
            )
        }
    }

    impl TextGenerator for StubGenerator {
        fn generate(
            &self,
            _model: &str,
            _messages: &[Message],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, ChatError> {
            *self.calls.borrow_mut() += 1;
            self.replies.borrow_mut().remove(0)
        }
    }

    fn style_with_extra(extra: &str) -> StyleConfig {
        StyleConfig {
            role: "역할".to_string(),
            conditions: "조건".to_string(),
            structure: "구성".to_string(),
            must_include: "포함".to_string(),
            conclusion: "마무리".to_string(),
            extra: extra.to_string(),
        }
    }

    #[test]
    fn identical_strings_score_one() {
        assert_eq!(similarity_ratio("중복되는 본문", "중복되는 본문"), 1.0);
    }

    #[test]
    fn disjoint_strings_score_zero() {
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
    }

    #[test]
    fn ratio_counts_matching_blocks() {
        // "abcd" vs "bcde" share the block "bcd": 2*3/8.
        assert!((similarity_ratio("abcd", "bcde") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn ratio_matches_sequence_matcher_reference_values() {
        // Expected values computed with difflib.SequenceMatcher(None, a, b).ratio().
        let cases = [
            ("건강한 아침 습관", "건강한 저녁 습관", 7.0 / 9.0),
            ("kitten", "sitting", 8.0 / 13.0),
            ("서론 없는 글", "", 0.0),
            ("가나다라", "다라가나", 0.5),
        ];
        for (a, b, expected) in cases {
            assert!(
                (similarity_ratio(a, b) - expected).abs() < 1e-9,
                "ratio({:?}, {:?}) != {}",
                a,
                b,
                expected
            );
        }
    }

    #[test]
    fn empty_corpus_scores_zero() {
        assert_eq!(corpus_similarity("anything", &[]), 0.0);
    }

    #[test]
    fn token_budget_follows_length_hint() {
        assert_eq!(style_with_extra("분량은 2000자 내외").max_tokens(), 2000);
        assert_eq!(style_with_extra("2500자 분량으로").max_tokens(), 2500);
        assert_eq!(style_with_extra("3000자 분량으로").max_tokens(), 3000);
        assert_eq!(style_with_extra("길이 제한 없음").max_tokens(), 3000);
    }

    #[test]
    fn clean_content_strips_section_labels() {
        let text = "서론: 첫 단락\n결론- 마지막 단락";
        assert_eq!(clean_content(text), "첫 단락\n마지막 단락");
    }

    #[test]
    fn clean_content_is_idempotent_without_labels() {
        let text = "라벨이 없는 본문입니다.\n둘째 줄.";
        assert_eq!(clean_content(text), text);
        assert_eq!(clean_content(&clean_content(text)), clean_content(text));
    }

    #[test]
    fn first_attempt_accepted_against_empty_corpus() {
        let stub = StubGenerator::repeating("C");
        let result =
            regenerate_unique_post(&stub, "gpt-3.5-turbo", "", "A", &[], &style_with_extra(""))
                .unwrap();
        assert_eq!(result.text, "C");
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.attempts_used, 1);
        assert_eq!(*stub.calls.borrow(), 1);
    }

    #[test]
    fn distinct_candidate_accepted_on_first_attempt() {
        let stub = StubGenerator::repeating("C");
        let corpus = vec!["B".to_string()];
        let result = regenerate_unique_post(
            &stub,
            "gpt-3.5-turbo",
            "",
            "A",
            &corpus,
            &style_with_extra(""),
        )
        .unwrap();
        assert_eq!(result.text, "C");
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.attempts_used, 1);
    }

    #[test]
    fn identical_candidate_exhausts_budget_and_returns_last() {
        let stub = StubGenerator::repeating("중복되는 본문");
        let corpus = vec!["중복되는 본문".to_string()];
        let result = regenerate_unique_post(
            &stub,
            "gpt-3.5-turbo",
            "",
            "원문",
            &corpus,
            &style_with_extra(""),
        )
        .unwrap();
        assert_eq!(result.attempts_used, MAX_RETRIES);
        assert_eq!(result.similarity, 1.0);
        assert_eq!(result.text, "중복되는 본문");
        assert_eq!(*stub.calls.borrow(), MAX_RETRIES);
    }

    #[test]
    fn failed_attempts_consume_budget_then_succeed() {
        let stub = StubGenerator::new(vec![
            Err(ChatError::EmptyChoices),
            Err(ChatError::EmptyChoices),
            Ok("새 글".to_string()),
        ]);
        let result = regenerate_unique_post(
            &stub,
            "gpt-3.5-turbo",
            "",
            "원문",
            &["완전히 다른 기존 글".to_string()],
            &style_with_extra(""),
        )
        .unwrap();
        assert_eq!(result.attempts_used, 3);
        assert_eq!(result.text, "새 글");
    }

    #[test]
    fn all_attempts_failing_is_an_error() {
        let stub = StubGenerator::new(
            std::iter::repeat_with(|| Err(ChatError::EmptyChoices))
                .take(MAX_RETRIES as usize)
                .collect(),
        );
        let err = regenerate_unique_post(
            &stub,
            "gpt-3.5-turbo",
            "",
            "원문",
            &[],
            &style_with_extra(""),
        )
        .unwrap_err();
        assert!(err.to_string().contains("All regeneration attempts failed"));
        assert_eq!(*stub.calls.borrow(), MAX_RETRIES);
    }

    #[test]
    fn system_message_joins_all_style_fields() {
        let style = style_with_extra("추가");
        let system = style.system_message();
        for field in ["역할", "조건", "구성", "포함", "마무리", "추가"] {
            assert!(system.contains(field));
        }
        let messages = build_messages(&style, "제목A", "본문B");
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert!(messages[1].content.contains("제목A"));
        assert!(messages[1].content.contains("본문B"));
    }

    #[test]
    fn model_alternates_after_interval() {
        let mut prompt = PromptRow {
            sheet_row: 2,
            image_tag: String::new(),
            category_tag: "건강".to_string(),
            style: style_with_extra(""),
            interval: 2,
            basic_model: "basic".to_string(),
            advanced_model: "advanced".to_string(),
            run_count: 0,
        };
        assert_eq!(select_model(&prompt), ("basic", 1));
        prompt.run_count = 1;
        assert_eq!(select_model(&prompt), ("basic", 2));
        prompt.run_count = 2;
        assert_eq!(select_model(&prompt), ("advanced", 0));
    }

    #[test]
    fn a1_column_letters() {
        assert_eq!(a1_column(1), "A");
        assert_eq!(a1_column(16), "P");
        assert_eq!(a1_column(26), "Z");
        assert_eq!(a1_column(27), "AA");
        assert_eq!(a1_column(52), "AZ");
    }

    #[test]
    fn prompt_rows_filtered_by_source_and_flag() {
        let mut header: Vec<String> = REQUIRED_PROMPT_COLUMNS
            .iter()
            .map(|s| s.to_string())
            .collect();
        header.push("run_count".to_string());
        let row = |source: &str, flag: &str, tag: &str, count: &str| -> Vec<String> {
            let mut r = vec![
                "2024-01-01".to_string(),
                source.to_string(),
                "이미지".to_string(),
                tag.to_string(),
                flag.to_string(),
            ];
            r.extend(["역할", "조건", "구성", "포함", "마무리", "추가 2000자"]
                .iter()
                .map(|s| s.to_string()));
            r.extend(["방식", "3", "basic", "advanced", count]
                .iter()
                .map(|s| s.to_string()));
            r
        };
        let values = vec![
            header,
            row("health", "Y", "건강", "2"),
            row("health", "N", "건강", "0"),
            row("marketing", "Y", "광고", "0"),
        ];
        let (prompts, run_idx) = load_prompt_rows(&values, "health").unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(run_idx, 15);
        let prompt = &prompts[0];
        assert_eq!(prompt.sheet_row, 2);
        assert_eq!(prompt.category_tag, "건강");
        assert_eq!(prompt.interval, 3);
        assert_eq!(prompt.run_count, 2);
        assert_eq!(prompt.style.max_tokens(), 2000);
    }

    #[test]
    fn missing_prompt_column_is_fatal() {
        let values = vec![vec!["생성일자".to_string(), "출처".to_string()]];
        let err = load_prompt_rows(&values, "health").unwrap_err();
        assert!(err.to_string().contains("missing required column"));
    }

    #[test]
    fn image_lookup_matches_tag() {
        let rows = vec![
            vec!["이미지태그".to_string(), "이미지url".to_string()],
            vec!["건강".to_string(), "https://example.com/a.jpg".to_string()],
            vec!["광고".to_string(), "https://example.com/b.jpg".to_string()],
        ];
        assert_eq!(find_matching_image(&rows, "광고"), "https://example.com/b.jpg");
        assert_eq!(find_matching_image(&rows, "없는태그"), "");
        assert_eq!(find_matching_image(&rows, ""), "");
    }
}
