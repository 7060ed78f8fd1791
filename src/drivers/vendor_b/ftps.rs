//! FTPS-over-implicit-TLS uploader for Vendor B (§4.4, §6.3).
//!
//! No mainstream async FTP crate exposes TLS-session-reuse on the data
//! connection, which Bambu's firmware requires — so this follows the
//! original's approach of driving the raw socket protocol by hand rather than
//! going through an FTP client abstraction. Session resumption here relies on
//! `rustls`'s built-in resumption cache on a shared `ClientConfig`/server name
//! rather than explicitly handing the control channel's session object to the
//! data channel (Rust's TLS stack doesn't expose that as directly as Python's
//! `ssl` module does); in practice this produces the same abbreviated
//! handshake the printer expects.

use crate::error::SessionError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::{client::TlsStream, TlsConnector};

const FTPS_PORT: u16 = 990;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 8192;

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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

fn tls_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
    )
}

async fn read_response(stream: &mut TlsStream<TcpStream>) -> Result<String, SessionError> {
    let mut buf = [0u8; 1024];
    let mut response = Vec::new();
    loop {
        let n = timeout(CONTROL_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| SessionError::Ftps("control channel read timed out".into()))?
            .map_err(|e| SessionError::Ftps(e.to_string()))?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(2).any(|w| w == b"\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&response).trim().to_string())
}

async fn send_command(stream: &mut TlsStream<TcpStream>, cmd: &str) -> Result<String, SessionError> {
    let line = format!("{cmd}\r\n");
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| SessionError::Ftps(e.to_string()))?;
    read_response(stream).await
}

fn parse_pasv(response: &str) -> Result<(String, u16), SessionError> {
    let start = response.find('(').ok_or_else(|| SessionError::Ftps("no PASV tuple".into()))?;
    let end = response.find(')').ok_or_else(|| SessionError::Ftps("no PASV tuple".into()))?;
    let nums: Vec<u32> = response[start + 1..end]
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if nums.len() != 6 {
        return Err(SessionError::Ftps(format!("malformed PASV response: {response}")));
    }
    let host = format!("{}.{}.{}.{}", nums[0], nums[1], nums[2], nums[3]);
    let port = (nums[4] * 256 + nums[5]) as u16;
    Ok((host, port))
}

/// Uploads `bytes` as `remote_name` to a Vendor-B printer via implicit FTPS
/// (§6.3). `remote_name` should already be normalized (§6.4).
pub async fn upload(ip: &str, access_code: &str, remote_name: &str, bytes: &[u8]) -> Result<(), SessionError> {
    let config = tls_config();
    let server_name = ServerName::try_from(ip.to_string())
        .map_err(|_| SessionError::Ftps("invalid printer IP for TLS SNI".into()))?;
    let connector = TlsConnector::from(config.clone());

    let tcp = TcpStream::connect((ip, FTPS_PORT))
        .await
        .map_err(|e| SessionError::Ftps(e.to_string()))?;
    let mut control = connector
        .connect(server_name.clone(), tcp)
        .await
        .map_err(|e| SessionError::Ftps(e.to_string()))?;

    let _welcome = read_response(&mut control).await?;

    let resp = send_command(&mut control, "USER bblp").await?;
    if !resp.starts_with("331") {
        return Err(SessionError::Ftps(format!("USER rejected: {resp}")));
    }

    let resp = send_command(&mut control, &format!("PASS {access_code}")).await?;
    if !resp.starts_with("230") {
        return Err(SessionError::Ftps(format!("login failed: {resp}")));
    }

    let resp = send_command(&mut control, "PROT P").await?;
    if !resp.starts_with("200") {
        log::warn!("PROT P warning: {resp}");
    }

    let resp = send_command(&mut control, "TYPE I").await?;
    if !resp.starts_with("200") {
        return Err(SessionError::Ftps(format!("TYPE I failed: {resp}")));
    }

    let resp = send_command(&mut control, "PASV").await?;
    if !resp.starts_with("227") {
        return Err(SessionError::Ftps(format!("PASV failed: {resp}")));
    }
    let (data_host, data_port) = parse_pasv(&resp)?;

    // STOR must be sent before the data connection opens; the response only
    // arrives after the transfer completes (§6.3).
    control
        .write_all(format!("STOR {remote_name}\r\n").as_bytes())
        .await
        .map_err(|e| SessionError::Ftps(e.to_string()))?;

    let data_tcp = TcpStream::connect((data_host.as_str(), data_port))
        .await
        .map_err(|e| SessionError::Ftps(e.to_string()))?;
    let mut data_stream = connector
        .connect(server_name, data_tcp)
        .await
        .map_err(|e| SessionError::Ftps(format!("data channel TLS failed: {e}")))?;

    for chunk in bytes.chunks(CHUNK_SIZE) {
        data_stream
            .write_all(chunk)
            .await
            .map_err(|e| SessionError::Ftps(e.to_string()))?;
    }
    data_stream
        .shutdown()
        .await
        .map_err(|e| SessionError::Ftps(e.to_string()))?;

    let resp = read_response(&mut control).await?;
    if !resp.starts_with("226") {
        log::warn!("unexpected STOR response: {resp}");
    }

    let resp = send_command(&mut control, &format!("SIZE {remote_name}")).await?;
    if resp.starts_with("213") {
        if let Some(reported) = resp.split_whitespace().nth(1).and_then(|s| s.parse::<usize>().ok()) {
            if reported != bytes.len() {
                log::warn!("size mismatch: local={} remote={}", bytes.len(), reported);
            }
        }
    }

    let _ = send_command(&mut control, "QUIT").await;
    Ok(())
}

/// Filename normalization rules (§4.4, §6.4):
/// `.3mf` and `.gcode` pass through unchanged; `.gcode.3mf` is rewritten to
/// `.3mf` (a known source-artifact renaming bug); anything else gets `.gcode`
/// appended.
pub fn normalize_filename(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".gcode.3mf") {
        let trimmed = &name[..name.len() - ".gcode.3mf".len()];
        format!("{trimmed}.3mf")
    } else if lower.ends_with(".3mf") || lower.ends_with(".gcode") {
        name.to_string()
    } else {
        format!("{name}.gcode")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_3mf_and_gcode_as_is() {
        assert_eq!(normalize_filename("part.3mf"), "part.3mf");
        assert_eq!(normalize_filename("part.gcode"), "part.gcode");
    }

    #[test]
    fn normalize_fixes_double_extension() {
        assert_eq!(normalize_filename("part.gcode.3mf"), "part.3mf");
    }

    #[test]
    fn normalize_appends_gcode_to_unknown_extensions() {
        assert_eq!(normalize_filename("part.stl"), "part.stl.gcode");
        assert_eq!(normalize_filename("part"), "part.gcode");
    }

    #[test]
    fn parse_pasv_extracts_host_and_port() {
        let (host, port) = parse_pasv("227 Entering Passive Mode (192,168,1,50,4,1)").unwrap();
        assert_eq!(host, "192.168.1.50");
        assert_eq!(port, 4 * 256 + 1);
    }

    #[test]
    fn parse_pasv_rejects_malformed_response() {
        assert!(parse_pasv("227 nonsense").is_err());
    }
}
