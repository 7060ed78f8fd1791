//! Per-printer Vendor-B MQTT session (§4.4, §6.2).
//!
//! Generalized from the teacher's `mqtt.rs`: the certificate verifier, the
//! resubscribe-on-reconnect handling and the sequence-id counter are carried
//! over almost verbatim; the command set is widened from TUI actions
//! (speed/lights) to fleet commands (project_file, gcode_line, ejection), and
//! reconnection now backs off (5·n s, capped at 30 s, up to 5 attempts)
//! instead of a fixed 5 s retry, since a daemon has no user watching to notice
//! a wedged connection.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const KEEPALIVE_SECS: u64 = 30;
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const MQTT_EVENT_QUEUE_CAPACITY: usize = 1; // max_queued_messages = 0 equivalent (§4.4)
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const GCODE_LINE_DELAY: Duration = Duration::from_millis(100);

/// Certificate verifier that accepts any certificate — Bambu-style printers
/// present a self-signed cert against their own serial.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[derive(Debug, Deserialize)]
struct MqttMessage {
    print: Option<PrintReport>,
}

#[derive(Debug, Deserialize)]
struct PrintReport {
    gcode_state: Option<String>,
    mc_percent: Option<f64>,
    #[serde(default)]
    mc_remaining_time: Option<f64>,
    #[serde(default)]
    mc_left_time: Option<f64>,
    #[serde(default)]
    remaining_time: Option<f64>,
    bed_temper: Option<f64>,
    nozzle_temper: Option<f64>,
    #[serde(default)]
    gcode_file: Option<String>,
    #[serde(default)]
    hms: Vec<serde_json::Value>,
    #[serde(default)]
    print_error: Option<u64>,
}

/// Cached snapshot built from the printer's pushed reports, read by the
/// reconciler every tick instead of fetching over the network (§4.4, §4.5).
#[derive(Debug, Clone, Default)]
pub struct VendorBCachedState {
    pub connected: bool,
    pub gcode_state: Option<String>,
    pub progress: Option<u8>,
    pub time_remaining_s: Option<u64>,
    pub bed_temp: Option<f64>,
    pub nozzle_temp: Option<f64>,
    pub current_file: Option<String>,
    pub hms_alerts: Vec<String>,
    pub ejection_complete: bool,
    /// Raw `print_error` code from the last report; `0` means none reported.
    /// Needed to distinguish a real FAILED error from the benign "no active
    /// job" code (§4.4 state-mapping table).
    pub print_error: u64,
}

pub struct VendorBSession {
    printer_name: String,
    client: AsyncClient,
    event_loop_handle: JoinHandle<()>,
    report_topic: String,
    request_topic: String,
    sequence_id: AtomicU64,
    state: Arc<Mutex<VendorBCachedState>>,
    last_message_at: Arc<Mutex<Instant>>,
    waiting_for_m400: AtomicBool,
}

impl VendorBSession {
    pub async fn connect(
        printer_name: String,
        ip: String,
        serial: String,
        access_code: String,
    ) -> Result<Self> {
        let client_id = format!("{}_{}", printer_name, chrono::Utc::now().timestamp());
        let mut mqtt_opts = MqttOptions::new(&client_id, &ip, 8883);
        mqtt_opts.set_credentials("bblp", &access_code);
        mqtt_opts.set_keep_alive(Duration::from_secs(KEEPALIVE_SECS));
        // max_queued_messages = 0, max_inflight = 1 (§4.4): a stale command must
        // never be replayed to the printer after a reconnect.
        mqtt_opts.set_inflight(1);
        mqtt_opts.set_clean_session(true);

        let tls_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        mqtt_opts.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(
            tls_config,
        ))));

        let report_topic = format!("device/{serial}/report");
        let request_topic = format!("device/{serial}/request");

        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, MQTT_EVENT_QUEUE_CAPACITY);

        let state = Arc::new(Mutex::new(VendorBCachedState::default()));
        let last_message_at = Arc::new(Mutex::new(Instant::now()));
        let waiting_flag = Arc::new(AtomicBool::new(false));

        let state_clone = Arc::clone(&state);
        let last_message_clone = Arc::clone(&last_message_at);
        let waiting_clone = Arc::clone(&waiting_flag);
        let event_client = client.clone();
        let event_report_topic = report_topic.clone();
        let event_request_topic = request_topic.clone();
        let event_printer_name = printer_name.clone();

        let event_loop_handle = tokio::spawn(async move {
            let mut reconnect_attempt: u32 = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                        if connack.code != ConnectReturnCode::Success {
                            log::warn!(
                                "Vendor-B connection rejected for {}: {:?}",
                                event_printer_name,
                                connack.code
                            );
                            continue;
                        }
                        reconnect_attempt = 0;
                        {
                            let mut s = state_clone.lock().await;
                            s.connected = true;
                        }
                        // clean_session=true drops subscriptions on every
                        // reconnect; resubscribe and request a full push so we
                        // aren't stuck showing stale data.
                        let _ = event_client
                            .subscribe(&event_report_topic, QoS::AtMostOnce)
                            .await;
                        let _ = event_client
                            .publish(
                                &event_request_topic,
                                QoS::AtMostOnce,
                                false,
                                serde_json::json!({"pushing": {"command": "pushall", "sequence_id": "0", "version": 1, "push_target": 1}})
                                    .to_string(),
                            )
                            .await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Ok(payload) = std::str::from_utf8(&publish.payload) {
                            if let Ok(msg) = serde_json::from_str::<MqttMessage>(payload) {
                                if let Some(report) = msg.print {
                                    let mut s = state_clone.lock().await;
                                    apply_report(&mut s, &report, &waiting_clone);
                                }
                                *last_message_clone.lock().await = Instant::now();
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        {
                            let mut s = state_clone.lock().await;
                            s.connected = false;
                        }
                        if reconnect_attempt >= MAX_RECONNECT_ATTEMPTS {
                            log::warn!(
                                "Vendor-B session for {event_printer_name} giving up after {reconnect_attempt} attempts: {e}"
                            );
                            break;
                        }
                        reconnect_attempt += 1;
                        let backoff = std::cmp::min(
                            RECONNECT_BASE * reconnect_attempt,
                            RECONNECT_CAP,
                        );
                        log::warn!(
                            "Vendor-B MQTT error for {event_printer_name}: {e} (reconnecting in {}s, attempt {reconnect_attempt})",
                            backoff.as_secs()
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        });

        tokio::time::timeout(OPERATION_TIMEOUT, client.subscribe(&report_topic, QoS::AtMostOnce))
            .await
            .context("subscribe operation timed out")?
            .context("failed to subscribe to printer report topic")?;

        Ok(VendorBSession {
            printer_name,
            client,
            event_loop_handle,
            report_topic,
            request_topic,
            sequence_id: AtomicU64::new(1),
            state,
            last_message_at,
            waiting_for_m400: AtomicBool::new(false),
        })
    }

    pub fn printer_name(&self) -> &str {
        &self.printer_name
    }

    pub async fn cached_state(&self) -> VendorBCachedState {
        self.state.lock().await.clone()
    }

    pub async fn is_stale(&self, stale_after: Duration) -> bool {
        self.last_message_at.lock().await.elapsed() > stale_after
    }

    fn next_sequence_id(&self) -> String {
        self.sequence_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn publish(&self, payload: serde_json::Value, qos: QoS, action: &str) -> Result<()> {
        tokio::time::timeout(
            OPERATION_TIMEOUT,
            self.client.publish(&self.request_topic, qos, false, payload.to_string()),
        )
        .await
        .with_context(|| format!("{action} timed out"))?
        .with_context(|| format!("failed to {action}"))?;
        Ok(())
    }

    pub async fn request_full_status(&self) -> Result<()> {
        self.publish(
            serde_json::json!({"pushing": {"command": "pushall", "sequence_id": self.next_sequence_id(), "version": 1, "push_target": 1}}),
            QoS::AtMostOnce,
            "request full status",
        )
        .await
    }

    /// Starts a previously-uploaded file (§6.2, `project_file`).
    pub async fn project_file(&self, filename: &str) -> Result<()> {
        self.publish(
            serde_json::json!({
                "print": {
                    "command": "project_file",
                    "sequence_id": self.next_sequence_id(),
                    "param": "Metadata/plate_1.gcode",
                    "file": "",
                    "url": format!("file:///sdcard/{filename}"),
                    "bed_leveling": true,
                    "use_ams": true
                }
            }),
            QoS::AtMostOnce,
            "start project file",
        )
        .await
    }

    /// Sends one G-code line, fire-and-forget (QoS 0, §4.4).
    pub async fn gcode_line(&self, line: &str) -> Result<()> {
        self.publish(
            serde_json::json!({
                "print": {
                    "command": "gcode_line",
                    "sequence_id": self.next_sequence_id(),
                    "param": line
                }
            }),
            QoS::AtMostOnce,
            "send gcode line",
        )
        .await
    }

    /// Splits a multi-line G-code blob, strips comments/blank lines, and sends
    /// each line with a 100 ms gap to avoid queue buildup (§4.4).
    pub async fn gcode_batch(&self, blob: &str) -> Result<()> {
        for line in non_comment_lines(blob) {
            self.gcode_line(&line).await?;
            tokio::time::sleep(GCODE_LINE_DELAY).await;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.publish(
            serde_json::json!({"print": {"command": "stop", "sequence_id": self.next_sequence_id(), "param": ""}}),
            QoS::AtMostOnce,
            "stop print",
        )
        .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.publish(
            serde_json::json!({"print": {"command": "pause", "sequence_id": self.next_sequence_id(), "param": ""}}),
            QoS::AtMostOnce,
            "pause print",
        )
        .await
    }

    pub async fn resume(&self) -> Result<()> {
        self.publish(
            serde_json::json!({"print": {"command": "resume", "sequence_id": self.next_sequence_id(), "param": ""}}),
            QoS::AtMostOnce,
            "resume print",
        )
        .await
    }

    /// Sends the ejection G-code sequence, appending `M400` if the caller
    /// didn't already include it (§4.6.2). Marks the session as waiting for
    /// the M400 acknowledgement so the next idle report can be recognized as
    /// ejection completion.
    pub async fn ejection(&self, gcode: &str) -> Result<()> {
        let mut lines: Vec<String> = non_comment_lines(gcode);
        if !lines.iter().any(|l| l.trim().eq_ignore_ascii_case("M400")) {
            lines.push("M400".to_string());
        }
        self.waiting_for_m400.store(true, Ordering::SeqCst);
        for line in lines {
            self.gcode_line(&line).await?;
            tokio::time::sleep(GCODE_LINE_DELAY).await;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        let _ = tokio::time::timeout(Duration::from_secs(2), self.client.disconnect()).await;
    }
}

impl Drop for VendorBSession {
    fn drop(&mut self) {
        self.event_loop_handle.abort();
    }
}

fn apply_report(state: &mut VendorBCachedState, report: &PrintReport, waiting_for_m400: &AtomicBool) {
    state.gcode_state = report.gcode_state.clone();
    state.bed_temp = report.bed_temper;
    state.nozzle_temp = report.nozzle_temper;
    state.progress = report.mc_percent.map(|p| p.clamp(0.0, 100.0) as u8);
    state.current_file = report.gcode_file.clone().filter(|f| !f.is_empty());
    state.print_error = report.print_error.unwrap_or(0);

    // Accept any of the three remaining-time field names, interpreted as
    // minutes and converted to seconds (§4.4).
    let remaining_minutes = report
        .mc_remaining_time
        .or(report.mc_left_time)
        .or(report.remaining_time);
    if let Some(minutes) = remaining_minutes {
        state.time_remaining_s = Some((minutes.max(0.0) * 60.0) as u64);
    }

    state.hms_alerts = report
        .hms
        .iter()
        .filter_map(|v| v.get("attr").and_then(|a| a.as_str()).map(|s| s.to_string()))
        .collect();

    if waiting_for_m400.load(Ordering::SeqCst) {
        if let Some(gs) = &state.gcode_state {
            if gs.eq_ignore_ascii_case("IDLE") {
                state.ejection_complete = true;
                waiting_for_m400.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// Splits a G-code blob into non-empty, non-comment lines.
fn non_comment_lines(blob: &str) -> Vec<String> {
    blob.lines()
        .map(|l| l.split(';').next().unwrap_or("").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_comment_lines_strips_comments_and_blanks() {
        let blob = "G28 X Y\n; a comment\n\nM104 S0 ; set temp\nM84";
        assert_eq!(
            non_comment_lines(blob),
            vec!["G28 X Y", "M104 S0", "M84"]
        );
    }

    #[test]
    fn apply_report_converts_minutes_to_seconds() {
        let mut state = VendorBCachedState::default();
        let waiting = AtomicBool::new(false);
        let report = PrintReport {
            gcode_state: Some("RUNNING".to_string()),
            mc_percent: Some(50.0),
            mc_remaining_time: Some(10.0),
            mc_left_time: None,
            remaining_time: None,
            bed_temper: Some(55.0),
            nozzle_temper: Some(210.0),
            gcode_file: Some("part.3mf".to_string()),
            hms: vec![],
            print_error: None,
        };
        apply_report(&mut state, &report, &waiting);
        assert_eq!(state.time_remaining_s, Some(600));
        assert_eq!(state.progress, Some(50));
    }

    #[test]
    fn apply_report_marks_ejection_complete_on_idle_after_m400() {
        let mut state = VendorBCachedState::default();
        let waiting = AtomicBool::new(true);
        let report = PrintReport {
            gcode_state: Some("IDLE".to_string()),
            mc_percent: None,
            mc_remaining_time: None,
            mc_left_time: None,
            remaining_time: None,
            bed_temper: Some(30.0),
            nozzle_temper: Some(25.0),
            gcode_file: None,
            hms: vec![],
            print_error: None,
        };
        apply_report(&mut state, &report, &waiting);
        assert!(state.ejection_complete);
        assert!(!waiting.load(Ordering::SeqCst));
    }
}
