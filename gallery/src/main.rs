use anyhow::{bail, Context, Result};
use log::{info, warn};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_API_URL: &str = "https://www.googleapis.com/drive/v3/files";

const IMAGE_HEADER: [&str; 5] = ["생성일자", "파일명", "파일 URL", "사용처", "태그"];
const DEFAULT_USAGE: &str = "광고이미지";

struct AppConfig {
    gsheet_id: String,
    sheets_token: String,
    folder_id: String,
    image_worksheet: String,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let gsheet_id = env::var("GSHEET_ID").context("GSHEET_ID environment variable not set")?;
        let sheets_token =
            env::var("GSHEET_TOKEN").context("GSHEET_TOKEN environment variable not set")?;
        let folder_id = env::var("DRIVE_FOLDER_ID")
            .context("DRIVE_FOLDER_ID environment variable not set")?;
        let image_worksheet = env::var("IMAGE_WORKSHEET").unwrap_or_else(|_| "image".to_string());

        for (name, value) in [
            ("GSHEET_ID", &gsheet_id),
            ("GSHEET_TOKEN", &sheets_token),
            ("DRIVE_FOLDER_ID", &folder_id),
        ] {
            if value.trim().is_empty() {
                bail!("{} environment variable is empty", name);
            }
        }

        Ok(AppConfig {
            gsheet_id,
            sheets_token,
            folder_id,
            image_worksheet,
        })
    }
}

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
}

// Drive listing

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(rename = "createdTime", default)]
    created_time: String,
}

fn list_folder_images(http: &Client, token: &str, folder_id: &str) -> Result<Vec<DriveFile>> {
    let query = format!(
        "'{}' in parents and mimeType contains 'image/' and trashed = false",
        folder_id
    );
    let list: FileList = http
        .get(DRIVE_API_URL)
        .bearer_auth(token)
        .query(&[("q", query.as_str()), ("fields", "files(id, name, createdTime)")])
        .send()
        .context("Failed to list Drive folder")?
        .error_for_status()
        .context("Drive listing request rejected")?
        .json()
        .context("Failed to parse Drive listing")?;
    Ok(list.files)
}

fn download_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=download&id={}", file_id)
}

fn created_date(created_time: &str) -> &str {
    created_time.get(..10).unwrap_or(created_time)
}

// Main process

fn run_gallery(config: &AppConfig) -> Result<usize> {
    let sheets = SheetsClient::new(config.sheets_token.clone(), config.gsheet_id.clone())?;
    let http = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client for Drive")?;

    let rows = sheets.get_values(&config.image_worksheet)?;
    let header_matches = rows
        .first()
        .map(|row| row.iter().map(String::as_str).eq(IMAGE_HEADER))
        .unwrap_or(false);
    if !header_matches {
        sheets.write_header(&config.image_worksheet, &IMAGE_HEADER)?;
    }

    let existing_names: HashSet<String> = rows
        .iter()
        .skip(1)
        .filter_map(|row| row.get(1))
        .map(|name| name.trim().to_string())
        .collect();

    let files = list_folder_images(&http, &config.sheets_token, &config.folder_id)?;
    info!("Found {} images in folder", files.len());

    let mut added = 0usize;
    for file in files {
        if existing_names.contains(file.name.trim()) {
            continue;
        }
        let row = vec![
            created_date(&file.created_time).to_string(),
            file.name.clone(),
            download_url(&file.id),
            DEFAULT_USAGE.to_string(),
            String::new(),
        ];
        if let Err(e) = sheets.append_row(&config.image_worksheet, &row) {
            warn!("Could not append image '{}': {}", file.name, e);
            continue;
        }
        added += 1;
        info!("Added image '{}'", file.name);
    }

    info!("Gallery run completed, {} images added", added);
    Ok(added)
}

fn main() -> Result<()> {
    env_logger::init();
    let config = AppConfig::from_env()?;
    run_gallery(&config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_url_embeds_file_id() {
        assert_eq!(
            download_url("abc123"),
            "https://drive.google.com/uc?export=download&id=abc123"
        );
    }

    #[test]
    fn created_date_takes_date_part() {
        assert_eq!(created_date("2024-05-01T10:00:00.000Z"), "2024-05-01");
        assert_eq!(created_date("short"), "short");
    }
}
