//! Vendor A driver (§4.3): synchronous-feeling HTTP pull over a shared
//! connection-pooled client, wrapped in bounded retry with backoff.

use crate::config::HTTP_CALL_TIMEOUT;
use crate::drivers::{ApiState, Observation};
use crate::model::Printer;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const MAX_RETRIES: u32 = 2;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    printer: RawStatus,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    state: String,
    #[serde(default)]
    temp_bed: f64,
    #[serde(default)]
    temp_nozzle: f64,
    #[serde(default)]
    axis_z: f64,
}

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    progress: Option<f64>,
    time_remaining: Option<u64>,
    file: Option<JobFile>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    display_name: Option<String>,
}

pub struct VendorADriver {
    client: Client,
}

impl VendorADriver {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(HTTP_CALL_TIMEOUT)
            .build()
            .expect("reqwest client config is valid");
        VendorADriver { client }
    }

    fn base_url(printer: &Printer) -> String {
        format!("http://{}", printer.ip)
    }

    /// `fetch_status` + `fetch_job` merged into one [`Observation`]. Returns a
    /// `None` `api_state` when the printer is unreachable, per §4.5.1's
    /// "api_state == null" row.
    pub async fn observe(&self, printer: &Printer, api_key: &str) -> Observation {
        let Some(raw) = self.fetch_status(printer, api_key).await else {
            return Observation::default();
        };

        let api_state = map_state(&raw.state);
        let mut obs = Observation {
            api_state: Some(api_state),
            bed_temp: Some(raw.temp_bed),
            nozzle_temp: Some(raw.temp_nozzle),
            z_height: Some(raw.axis_z),
            ..Default::default()
        };

        if matches!(api_state, ApiState::Printing | ApiState::Paused) {
            if let Some(job) = self.fetch_job(printer, api_key).await {
                obs.progress = job.progress.map(|p| p.clamp(0.0, 100.0) as u8);
                obs.time_remaining = job.time_remaining;
                obs.current_file = job.file.and_then(|f| f.display_name);
                obs.job_id = job.id;
            }
        }
        if api_state == ApiState::Error {
            obs.error_message = Some("Printer error".to_string());
        }
        obs
    }

    async fn fetch_status(&self, printer: &Printer, api_key: &str) -> Option<RawStatus> {
        let url = format!("{}/api/v1/status", Self::base_url(printer));
        let resp = retry(MAX_RETRIES, || async {
            self.client
                .get(&url)
                .header("X-Api-Key", api_key)
                .send()
                .await
        })
        .await
        .ok()?;

        if resp.status() != StatusCode::OK {
            return None;
        }
        resp.json::<StatusEnvelope>().await.ok().map(|e| e.printer)
    }

    async fn fetch_job(&self, printer: &Printer, api_key: &str) -> Option<JobEnvelope> {
        let url = format!("{}/api/v1/job", Self::base_url(printer));
        let resp = retry(MAX_RETRIES, || async {
            self.client
                .get(&url)
                .header("X-Api-Key", api_key)
                .send()
                .await
        })
        .await
        .ok()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return None;
        }
        resp.json::<JobEnvelope>().await.ok()
    }

    /// `PUT /usb/<filename>` with `Print-After-Upload`; on 409, pre-delete then
    /// retry once with `Overwrite` (§4.3, §4.7.1).
    pub async fn upload_and_start(
        &self,
        printer: &Printer,
        api_key: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> bool {
        let url = format!("{}/api/v1/files/usb/{}", Self::base_url(printer), filename);
        let resp = retry(MAX_RETRIES, || async {
            self.client
                .put(&url)
                .header("X-Api-Key", api_key)
                .header("Print-After-Upload", "?1")
                .body(bytes.clone())
                .send()
                .await
        })
        .await;

        match resp {
            Ok(r) if r.status() == StatusCode::CREATED => true,
            Ok(r) if r.status() == StatusCode::CONFLICT => {
                let _ = self.delete_file(printer, api_key, filename).await;
                let retry_resp = retry(MAX_RETRIES, || async {
                    self.client
                        .put(&url)
                        .header("X-Api-Key", api_key)
                        .header("Print-After-Upload", "?1")
                        .header("Overwrite", "?1")
                        .body(bytes.clone())
                        .send()
                        .await
                })
                .await;
                matches!(retry_resp, Ok(r) if r.status() == StatusCode::CREATED)
            }
            _ => false,
        }
    }

    async fn delete_file(&self, printer: &Printer, api_key: &str, filename: &str) -> bool {
        let url = format!("{}/api/v1/files/usb/{}", Self::base_url(printer), filename);
        matches!(
            retry(MAX_RETRIES, || async {
                self.client.delete(&url).header("X-Api-Key", api_key).send().await
            })
            .await,
            Ok(r) if r.status() == StatusCode::NO_CONTENT || r.status() == StatusCode::NOT_FOUND
        )
    }

    /// `POST /usb/<filename>` to start a previously-uploaded file (§4.3).
    pub async fn start_existing(&self, printer: &Printer, api_key: &str, filename: &str) -> bool {
        let url = format!("{}/api/v1/files/usb/{}", Self::base_url(printer), filename);
        let resp = retry(MAX_RETRIES, || async {
            self.client.post(&url).header("X-Api-Key", api_key).send().await
        })
        .await;
        match resp {
            Ok(r) if r.status() == StatusCode::NO_CONTENT => true,
            Ok(r) if r.status() == StatusCode::CONFLICT => {
                // 409: poll status, treat PRINTING/BUSY as success.
                if let Some(raw) = self.fetch_status(printer, api_key).await {
                    matches!(map_state(&raw.state), ApiState::Printing | ApiState::Paused)
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    async fn job_command(&self, printer: &Printer, api_key: &str, command: &str) -> bool {
        let url = format!("{}/api/v1/job", Self::base_url(printer));
        let body = serde_json::json!({ "command": command });
        let resp = retry(MAX_RETRIES, || async {
            self.client
                .post(&url)
                .header("X-Api-Key", api_key)
                .json(&body)
                .send()
                .await
        })
        .await;

        match resp {
            Ok(r) if r.status() == StatusCode::OK => true,
            Ok(r) if r.status() == StatusCode::METHOD_NOT_ALLOWED || r.status() == StatusCode::NOT_FOUND => {
                let legacy_url = format!("{}/api/job", Self::base_url(printer));
                matches!(
                    retry(MAX_RETRIES, || async {
                        self.client
                            .post(&legacy_url)
                            .header("X-Api-Key", api_key)
                            .json(&body)
                            .send()
                            .await
                    })
                    .await,
                    Ok(r) if r.status() == StatusCode::OK
                )
            }
            _ => false,
        }
    }

    pub async fn stop(&self, printer: &Printer, api_key: &str) -> bool {
        self.job_command(printer, api_key, "cancel").await
    }
    pub async fn pause(&self, printer: &Printer, api_key: &str) -> bool {
        self.job_command(printer, api_key, "pause").await
    }
    pub async fn resume(&self, printer: &Printer, api_key: &str) -> bool {
        self.job_command(printer, api_key, "resume").await
    }

    /// `send_ejection` (§4.3): uploads the ejection G-code as a print job.
    pub async fn send_ejection(
        &self,
        printer: &Printer,
        api_key: &str,
        gcode: &str,
        filename: &str,
    ) -> bool {
        self.upload_and_start(printer, api_key, filename, gcode.as_bytes().to_vec())
            .await
    }

    /// Sends one G-code line via `POST /api/v1/printer/command` (§4.10's
    /// "line-by-line POST" test path — distinct from `upload_and_start`,
    /// which starts a print job rather than issuing a single live command).
    async fn send_gcode_line(&self, printer: &Printer, api_key: &str, line: &str) -> bool {
        let url = format!("{}/api/v1/printer/command", Self::base_url(printer));
        let body = serde_json::json!({ "command": line });
        matches!(
            retry(MAX_RETRIES, || async {
                self.client.post(&url).header("X-Api-Key", api_key).json(&body).send().await
            })
            .await,
            Ok(r) if r.status() == StatusCode::OK || r.status() == StatusCode::NO_CONTENT
        )
    }

    /// Sends a multi-line G-code blob one line at a time, stripping comments
    /// and blank lines, with a 100ms gap between commands (§4.10 "test"
    /// operation for Vendor A printers). Returns true only if every line was
    /// accepted.
    pub async fn send_gcode_lines(&self, printer: &Printer, api_key: &str, gcode: &str) -> bool {
        let lines = non_comment_lines(gcode);
        let mut all_ok = true;
        for line in &lines {
            if !self.send_gcode_line(printer, api_key, line).await {
                log::warn!("gcode line failed for {}: {line}", printer.name);
                all_ok = false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        all_ok
    }
}

/// Splits a G-code blob into non-empty, non-comment lines (§4.10's line-by-line
/// test path).
fn non_comment_lines(blob: &str) -> Vec<String> {
    blob.lines()
        .map(|l| l.split(';').next().unwrap_or("").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

impl Default for VendorADriver {
    fn default() -> Self {
        Self::new()
    }
}

fn map_state(raw: &str) -> ApiState {
    match raw.to_ascii_uppercase().as_str() {
        "IDLE" => ApiState::Idle,
        "OPERATIONAL" => ApiState::Operational,
        "FINISHED" => ApiState::Finished,
        "PRINTING" => ApiState::Printing,
        "PAUSED" => ApiState::Paused,
        "ERROR" | "ATTENTION" => ApiState::Error,
        _ => ApiState::Error,
    }
}

async fn retry<F, Fut, T>(max_retries: u32, mut f: F) -> Result<T, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, reqwest::Error>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                log::warn!("vendor A request failed (attempt {attempt}), retrying: {e}");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_state_follows_the_vendor_a_table() {
        assert_eq!(map_state("idle"), ApiState::Idle);
        assert_eq!(map_state("FINISHED"), ApiState::Finished);
        assert_eq!(map_state("Printing"), ApiState::Printing);
        assert_eq!(map_state("paused"), ApiState::Paused);
        assert_eq!(map_state("ATTENTION"), ApiState::Error);
        assert_eq!(map_state("ERROR"), ApiState::Error);
    }

    #[test]
    fn non_comment_lines_strips_comments_and_blanks() {
        let gcode = "G28 X Y ; home axes\n\n; full comment line\nM84\n   \nG1 Z10";
        assert_eq!(
            non_comment_lines(gcode),
            vec!["G28 X Y".to_string(), "M84".to_string(), "G1 Z10".to_string()]
        );
    }

    #[test]
    fn non_comment_lines_of_empty_blob_is_empty() {
        assert!(non_comment_lines("\n; only comments\n").is_empty());
    }
}
