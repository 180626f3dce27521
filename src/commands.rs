//! The three operations the desktop shell calls, with UI-friendly types.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use base64::engine::general_purpose;
use base64::Engine;
use serde::Serialize;

use crate::catalog::ReceivedEntry;
use crate::error::{Error, Result};
use crate::peer::DiscoveredDevice;
use crate::Node;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedFile {
    pub name: String,
    /// Base64 PNG thumbnail, empty when there is none.
    pub preview: String,
}

impl From<&ReceivedEntry> for ReceivedFile {
    fn from(entry: &ReceivedEntry) -> Self {
        let preview = if entry.preview.is_empty() {
            String::new()
        } else {
            general_purpose::STANDARD.encode(&entry.preview)
        };
        Self {
            name: entry.name.clone(),
            preview,
        }
    }
}

pub async fn scan_network(node: &Node) -> Vec<DiscoveredDevice> {
    node.scan().await.iter().map(DiscoveredDevice::from).collect()
}

pub async fn send_file(
    node: &Node,
    ip: String,
    file_path: String,
    file_name: String,
) -> std::result::Result<String, String> {
    let addr = parse_peer_addr(&ip, node.config().transfer_port).map_err(|e| e.to_string())?;
    let session = node
        .send_file(addr, Path::new(&file_path), &file_name)
        .await
        .map_err(|e| e.to_string())?;
    Ok(format!(
        "Successfully sent {} bytes",
        session.bytes_transferred
    ))
}

pub fn get_received(node: &Node) -> Vec<ReceivedFile> {
    received_files(&node.received())
}

pub fn received_files(entries: &[ReceivedEntry]) -> Vec<ReceivedFile> {
    entries.iter().map(ReceivedFile::from).collect()
}

/// Accepts `IP:PORT` or a bare `IP`, which gets `default_port`.
pub fn parse_peer_addr(input: &str, default_port: u16) -> Result<SocketAddr> {
    let input = input.trim();
    if let Ok(sock) = input.parse::<SocketAddr>() {
        return Ok(sock);
    }
    input
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| Error::InvalidAddress(format!("{} (use IP or IP:PORT)", input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_parse_peer_addr() {
        assert_eq!(
            parse_peer_addr("192.168.1.5", 5005).unwrap(),
            "192.168.1.5:5005".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_peer_addr(" 10.0.0.2:6000 ", 5005).unwrap(),
            "10.0.0.2:6000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_peer_addr("::1", 5005).unwrap(),
            "[::1]:5005".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            parse_peer_addr("printer.local", 5005),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_received_file_preview_encoding() {
        let with = ReceivedEntry {
            id: Uuid::new_v4(),
            name: "cat.png".into(),
            stored_path: "received/cat.png".into(),
            preview: vec![0x89, b'P', b'N', b'G'],
            received_at: 2,
        };
        let without = ReceivedEntry {
            name: "notes.txt".into(),
            preview: Vec::new(),
            ..with.clone()
        };

        let files = received_files(&[with, without]);
        assert_eq!(files[0].preview, "iVBORw==");
        assert_eq!(files[1].preview, "");
        assert_eq!(files[1].name, "notes.txt");
    }
}
